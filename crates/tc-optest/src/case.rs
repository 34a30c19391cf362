use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tc_core::{DenseTensor, DenseTensorError, checked_numel};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

/// Fixture form of a case: named input shapes and, optionally, the output
/// shape both paths must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSpec {
    pub name: String,
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub expected_output_shape: Option<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseInput {
    pub name: String,
    pub tensor: DenseTensor,
}

/// Concrete inputs of one case, fixed after [`init_case`].
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    name: String,
    inputs: Vec<CaseInput>,
    expected_output_shape: Option<Vec<usize>>,
    seed: Option<u64>,
}

impl TestCase {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inputs in declaration order.
    #[must_use]
    pub fn inputs(&self) -> &[CaseInput] {
        &self.inputs
    }

    #[must_use]
    pub fn input(&self, name: &str) -> Option<&DenseTensor> {
        self.inputs
            .iter()
            .find(|input| input.name == name)
            .map(|input| &input.tensor)
    }

    #[must_use]
    pub fn expected_output_shape(&self) -> Option<&[usize]> {
        self.expected_output_shape.as_deref()
    }

    #[must_use]
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// `A[4, 16] B[16, 32]`
    #[must_use]
    pub fn shapes_label(&self) -> String {
        self.inputs
            .iter()
            .map(|input| format!("{}{:?}", input.name, input.tensor.shape()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaseError {
    #[error("case `{case}` declares no inputs")]
    NoInputs { case: String },
    #[error("case `{case}` declares input `{name}` twice")]
    DuplicateInput { case: String, name: String },
    #[error("case `{case}`: {source}")]
    Tensor {
        case: String,
        #[source]
        source: DenseTensorError,
    },
}

/// Fills every declared input with f32 values uniform in `[0, 1)`.
///
/// With a seed the values are reproducible; the generator is keyed by the
/// case name as well, so cases of one suite draw distinct streams. Without a
/// seed the thread-local generator is used.
pub fn init_case(spec: &CaseSpec, seed: Option<u64>) -> Result<TestCase, CaseError> {
    match seed {
        Some(seed) => {
            let mut rng = StdRng::seed_from_u64(case_seed(seed, &spec.name));
            init_case_with(spec, Some(seed), &mut rng)
        }
        None => init_case_with(spec, None, &mut rand::rng()),
    }
}

fn init_case_with<R: Rng>(
    spec: &CaseSpec,
    seed: Option<u64>,
    rng: &mut R,
) -> Result<TestCase, CaseError> {
    if spec.inputs.is_empty() {
        return Err(CaseError::NoInputs {
            case: spec.name.clone(),
        });
    }
    let mut inputs: Vec<CaseInput> = Vec::with_capacity(spec.inputs.len());
    for input in &spec.inputs {
        if inputs.iter().any(|existing| existing.name == input.name) {
            return Err(CaseError::DuplicateInput {
                case: spec.name.clone(),
                name: input.name.clone(),
            });
        }
        let tensor_error = |source| CaseError::Tensor {
            case: spec.name.clone(),
            source,
        };
        let numel = checked_numel(&input.shape)
            .map_err(|error| tensor_error(DenseTensorError::from(error)))?;
        let values: Vec<f32> = (0..numel).map(|_| rng.random_range(0.0f32..1.0)).collect();
        let tensor = DenseTensor::from_f32(&values, input.shape.clone()).map_err(tensor_error)?;
        inputs.push(CaseInput {
            name: input.name.clone(),
            tensor,
        });
    }
    Ok(TestCase {
        name: spec.name.clone(),
        inputs,
        expected_output_shape: spec.expected_output_shape.clone(),
        seed,
    })
}

fn case_seed(seed: u64, case: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64 ^ seed;
    for byte in case.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
