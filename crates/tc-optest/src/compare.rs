use std::fmt;

use serde::{Deserialize, Serialize};
use tc_core::DenseTensor;
use thiserror::Error;

fn default_check_grads() -> bool {
    true
}

/// Closeness rule `|candidate - reference| <= atol + rtol * |reference|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceSpec {
    pub atol: f64,
    pub rtol: f64,
    #[serde(default = "default_check_grads")]
    pub check_grads: bool,
}

impl Default for ToleranceSpec {
    fn default() -> Self {
        Self {
            atol: 1e-5,
            rtol: 1e-5,
            check_grads: true,
        }
    }
}

impl ToleranceSpec {
    #[must_use]
    pub fn bound(&self, reference: f64) -> f64 {
        self.atol + self.rtol * reference.abs()
    }

    /// NaN on either side never passes.
    #[must_use]
    pub fn allows(&self, candidate: f64, reference: f64) -> bool {
        let diff = (candidate - reference).abs();
        !diff.is_nan() && diff <= self.bound(reference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorKind {
    Output,
    Gradient,
}

impl fmt::Display for TensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output => f.write_str("output"),
            Self::Gradient => f.write_str("gradient"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorComparison {
    pub kind: TensorKind,
    pub index: usize,
    pub shape: Vec<usize>,
    pub elements: usize,
    pub max_abs_diff: f64,
    /// Flat index of the element with the largest deviation.
    pub worst_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error(
    "case `{case}`: {kind} {index} (shape {shape:?}) exceeds tolerance at element {element}: \
     reference={reference} candidate={candidate}, max |diff|={max_abs_diff:e} \
     (atol={atol:e}, rtol={rtol:e})"
)]
pub struct ToleranceViolation {
    pub case: String,
    pub kind: TensorKind,
    pub index: usize,
    pub shape: Vec<usize>,
    pub element: usize,
    pub reference: f64,
    pub candidate: f64,
    pub max_abs_diff: f64,
    pub atol: f64,
    pub rtol: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompareError {
    #[error("case `{case}`: reference produced {reference} {kind} tensors, compiled produced {candidate}")]
    CountMismatch {
        case: String,
        kind: TensorKind,
        reference: usize,
        candidate: usize,
    },
    #[error("case `{case}`: {kind} {index} shape differs: reference {reference:?}, compiled {candidate:?}")]
    ShapeMismatch {
        case: String,
        kind: TensorKind,
        index: usize,
        reference: Vec<usize>,
        candidate: Vec<usize>,
    },
    #[error(transparent)]
    Violation(#[from] ToleranceViolation),
}

impl CompareError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::CountMismatch { .. } => "output_count_mismatch",
            Self::ShapeMismatch { .. } => "output_shape_mismatch",
            Self::Violation(_) => "tolerance_violation",
        }
    }
}

/// Compares two tensor sequences position by position. Counts and shapes are
/// checked for every position before any value is inspected; the first
/// tensor with an out-of-tolerance element fails the comparison.
pub fn compare_tensors(
    case: &str,
    kind: TensorKind,
    reference: &[DenseTensor],
    candidate: &[DenseTensor],
    tolerance: &ToleranceSpec,
) -> Result<Vec<TensorComparison>, CompareError> {
    if reference.len() != candidate.len() {
        return Err(CompareError::CountMismatch {
            case: case.to_owned(),
            kind,
            reference: reference.len(),
            candidate: candidate.len(),
        });
    }
    for (index, (expected, actual)) in reference.iter().zip(candidate).enumerate() {
        if expected.shape() != actual.shape() {
            return Err(CompareError::ShapeMismatch {
                case: case.to_owned(),
                kind,
                index,
                reference: expected.shape().to_vec(),
                candidate: actual.shape().to_vec(),
            });
        }
    }

    let mut summaries = Vec::with_capacity(reference.len());
    for (index, (expected, actual)) in reference.iter().zip(candidate).enumerate() {
        let mut max_abs_diff = 0.0f64;
        let mut worst_index = None;
        let mut first_violation = None;
        for (element, (want, got)) in expected.values().iter().zip(actual.values()).enumerate() {
            let diff = (got - want).abs();
            if diff.is_nan() {
                max_abs_diff = f64::NAN;
                worst_index = Some(element);
            } else if !max_abs_diff.is_nan() && (worst_index.is_none() || diff > max_abs_diff) {
                max_abs_diff = diff;
                worst_index = Some(element);
            }
            if first_violation.is_none() && !tolerance.allows(*got, *want) {
                first_violation = Some((element, *want, *got));
            }
        }

        if let Some((element, reference, candidate)) = first_violation {
            return Err(ToleranceViolation {
                case: case.to_owned(),
                kind,
                index,
                shape: expected.shape().to_vec(),
                element,
                reference,
                candidate,
                max_abs_diff,
                atol: tolerance.atol,
                rtol: tolerance.rtol,
            }
            .into());
        }

        summaries.push(TensorComparison {
            kind,
            index,
            shape: expected.shape().to_vec(),
            elements: expected.numel(),
            max_abs_diff,
            worst_index,
        });
    }
    Ok(summaries)
}
