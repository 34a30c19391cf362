use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Value, json};
use tc_autograd::AutogradError;
use tc_builder::{BuildError, NetBuilder, Program, Variable};
use tc_core::{DType, DenseTensor};
use tc_device::{Arch, Capability, Target};
use tc_eager::{EagerSession, TensorHandle};
use tc_jit::{CompilationError, CompileOptions, ExecutionError, compile_with_options};
use tc_runtime::{EvidenceKind, EvidenceLedger};
use thiserror::Error;

use crate::case::{CaseError, CaseSpec, TestCase, init_case};
use crate::compare::{CompareError, TensorComparison, TensorKind, ToleranceSpec, compare_tensors};
use crate::gate::{CapabilityGate, CapabilityProbe, GateDecision};
use crate::lifecycle::{CaseLifecycle, CaseState, LifecycleError};
use crate::logging::{StructuredCaseLog, evidence_field};
use crate::{CaseReport, GradCheck, HarnessConfig, SuiteReport, Verdict};

pub const MATMUL_FIXTURE: &str = "matmul_cases.json";

/// Suite declaration as stored in the fixture file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SuiteFixture {
    pub suite: String,
    #[serde(default)]
    pub required_capability: Option<Capability>,
    #[serde(default)]
    pub skip_reason: String,
    pub target: Arch,
    #[serde(default)]
    pub tolerance: ToleranceSpec,
    pub cases: Vec<CaseSpec>,
}

#[derive(Debug, Error)]
pub enum CaseFailure {
    #[error(transparent)]
    Setup(#[from] CaseError),
    #[error("case `{case}` needs exactly two inputs for matmul, got {actual}")]
    Arity { case: String, actual: usize },
    #[error("reference path: {0}")]
    Reference(#[from] AutogradError),
    #[error("reference path produced no gradient for input `{name}`")]
    MissingReferenceGradient { name: String },
    #[error("graph construction: {0}")]
    Build(#[from] BuildError),
    #[error("compilation: {0}")]
    Compile(#[from] CompilationError),
    #[error("execution: {0}")]
    Execute(#[from] ExecutionError),
    #[error("reference output shape {actual:?} differs from the declared {expected:?}")]
    ExpectedShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error(transparent)]
    Compare(#[from] CompareError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl CaseFailure {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Setup(_) | Self::Arity { .. } => "case_setup_error",
            Self::Reference(_) | Self::MissingReferenceGradient { .. } => "reference_error",
            Self::Build(_) => "build_error",
            Self::Compile(_) => "compilation_error",
            Self::Execute(ExecutionError::ShapeMismatch { .. }) => "shape_mismatch",
            Self::Execute(_) => "execution_error",
            Self::ExpectedShape { .. } => "output_shape_mismatch",
            Self::Compare(error) => error.reason_code(),
            Self::Lifecycle(_) => "lifecycle_error",
        }
    }
}

/// Reference program: every input wrapped as an eager tensor, one matmul.
pub struct ReferenceProgram {
    pub session: EagerSession,
    pub inputs: Vec<TensorHandle>,
    pub output: TensorHandle,
}

/// Symbolic program plus the handles the execution API needs.
pub struct CompiledProgram {
    pub program: Program,
    pub inputs: Vec<Variable>,
    pub output: Variable,
}

pub struct ExecutionResult {
    pub outputs: Vec<DenseTensor>,
    pub gradients: Option<Vec<DenseTensor>>,
}

pub fn build_reference(case: &TestCase, with_grads: bool) -> Result<ReferenceProgram, CaseFailure> {
    let [lhs, rhs] = case.inputs() else {
        return Err(CaseFailure::Arity {
            case: case.name().to_owned(),
            actual: case.inputs().len(),
        });
    };
    let mut session = EagerSession::new(case.name());
    let lhs = session.to_tensor(lhs.tensor.clone(), !with_grads);
    let rhs = session.to_tensor(rhs.tensor.clone(), !with_grads);
    let output = session.matmul(lhs, rhs)?;
    Ok(ReferenceProgram {
        session,
        inputs: vec![lhs, rhs],
        output,
    })
}

pub fn build_compiled(case: &TestCase) -> Result<CompiledProgram, CaseFailure> {
    let [lhs, rhs] = case.inputs() else {
        return Err(CaseFailure::Arity {
            case: case.name().to_owned(),
            actual: case.inputs().len(),
        });
    };
    let mut builder = NetBuilder::new(case.name());
    let a = builder.create_input(DType::F32, lhs.tensor.shape(), &lhs.name)?;
    let b = builder.create_input(DType::F32, rhs.tensor.shape(), &rhs.name)?;
    let output = builder.matmul(&a, &b)?;
    Ok(CompiledProgram {
        program: builder.build()?,
        inputs: vec![a, b],
        output,
    })
}

/// Runs the matmul suite declared by a fixture. The capability gate is
/// evaluated once per [`MatmulSuite::run`].
#[derive(Debug, Clone)]
pub struct MatmulSuite {
    fixture: SuiteFixture,
    fixture_id: String,
    target: Target,
    tolerance: ToleranceSpec,
    seed: Option<u64>,
    compile_options: CompileOptions,
    probe: Option<CapabilityProbe>,
}

impl MatmulSuite {
    #[must_use]
    pub fn new(fixture: SuiteFixture, config: &HarnessConfig) -> Self {
        Self {
            target: Target {
                arch: fixture.target,
            },
            tolerance: config.tolerance.apply(fixture.tolerance),
            seed: config.seed,
            compile_options: CompileOptions::default(),
            fixture_id: MATMUL_FIXTURE.to_owned(),
            probe: None,
            fixture,
        }
    }

    /// The fixture's capability, or the one the target itself needs when the
    /// fixture names none.
    #[must_use]
    pub fn gate(&self) -> CapabilityGate {
        let required = self
            .fixture
            .required_capability
            .or(self.target.required_capability());
        let gate = match required {
            Some(capability) => {
                let reason = if self.fixture.skip_reason.is_empty() {
                    format!("{} requires a build with {capability}", self.target)
                } else {
                    self.fixture.skip_reason.clone()
                };
                CapabilityGate::requiring(capability, reason)
            }
            None => CapabilityGate::open(),
        };
        match self.probe {
            Some(probe) => gate.with_probe(probe),
            None => gate,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: CapabilityProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub fn with_compile_options(mut self, options: CompileOptions) -> Self {
        self.compile_options = options;
        self
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: ToleranceSpec) -> Self {
        self.tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn target(&self) -> Target {
        self.target
    }

    #[must_use]
    pub fn tolerance(&self) -> ToleranceSpec {
        self.tolerance
    }

    #[must_use]
    pub fn cases(&self) -> &[CaseSpec] {
        &self.fixture.cases
    }

    pub fn run(&self) -> SuiteReport {
        let gate = self.gate().evaluate();
        let cases = match &gate {
            GateDecision::Skip { reason } => self
                .fixture
                .cases
                .iter()
                .map(|spec| self.skip_case(spec, reason))
                .collect(),
            GateDecision::Run => self
                .fixture
                .cases
                .iter()
                .map(|spec| self.run_case(spec))
                .collect(),
        };
        SuiteReport::new(&self.fixture.suite, self.target, gate, cases)
    }

    pub fn run_case(&self, spec: &CaseSpec) -> CaseReport {
        let mut run = CaseRun::new(self.tolerance.check_grads);
        let result = self.drive(spec, &mut run);
        let (verdict, diagnostic, reason_code) = match result {
            Ok(()) => match run.lifecycle.advance(CaseState::Pass) {
                Ok(()) => (Verdict::Pass, None, "parity_ok"),
                Err(error) => (Verdict::Fail, Some(error.to_string()), "lifecycle_error"),
            },
            Err(failure) => {
                // every failure is raised from a non-terminal state
                let aborted = run.lifecycle.advance(CaseState::Fail);
                debug_assert!(aborted.is_ok(), "{aborted:?}");
                let diagnostic = format!("{failure} [inputs: {}]", run.shapes_label);
                (Verdict::Fail, Some(diagnostic), failure.reason_code())
            }
        };

        match &diagnostic {
            Some(message) => tracing::info!(
                suite = %self.fixture.suite,
                case = %spec.name,
                verdict = verdict.label(),
                diagnostic = %message,
                "case finished"
            ),
            None => tracing::info!(
                suite = %self.fixture.suite,
                case = %spec.name,
                verdict = verdict.label(),
                "case finished"
            ),
        }
        self.report(spec, run, verdict, diagnostic, reason_code)
    }

    fn drive(&self, spec: &CaseSpec, run: &mut CaseRun) -> Result<(), CaseFailure> {
        let check_grads = self.tolerance.check_grads;
        let case = init_case(spec, self.seed)?;
        run.shapes_label = case.shapes_label();
        run.seed = case.seed();

        let mut reference = build_reference(&case, check_grads)?;
        run.lifecycle.advance(CaseState::BuiltReference)?;

        let compiled = build_compiled(&case)?;
        run.lifecycle.advance(CaseState::BuiltCompiled)?;

        let reference_result = execute_reference(&mut reference, &case, check_grads)?;
        let compiled_result =
            self.execute_compiled(&compiled, &case, check_grads, &mut run.evidence)?;
        run.evidence.absorb(reference.session.ledger());
        run.lifecycle.advance(CaseState::ExecutedBoth)?;

        let compared = self.compare(&case, &reference_result, &compiled_result, run);
        run.lifecycle.advance(CaseState::Compared)?;
        compared
    }

    fn execute_compiled(
        &self,
        compiled: &CompiledProgram,
        case: &TestCase,
        check_grads: bool,
        evidence: &mut EvidenceLedger,
    ) -> Result<ExecutionResult, CaseFailure> {
        let executable =
            compile_with_options(&compiled.program, self.target, self.compile_options)?;
        evidence.absorb(executable.ledger());
        let feeds: Vec<(&str, &DenseTensor)> = case
            .inputs()
            .iter()
            .map(|input| (input.name.as_str(), &input.tensor))
            .collect();
        let outputs = [compiled.output.name()];

        let result = if check_grads && executable.supports_gradients() {
            let wrt: Vec<&str> = compiled.inputs.iter().map(Variable::name).collect();
            let run = executable.run_with_grads(&feeds, &outputs, &wrt)?;
            ExecutionResult {
                outputs: run.outputs,
                gradients: Some(run.gradients),
            }
        } else {
            ExecutionResult {
                outputs: executable.run(&feeds, &outputs)?,
                gradients: None,
            }
        };
        evidence.record(
            EvidenceKind::Execute,
            format!(
                "program={} target={} kernels={} gradients={}",
                compiled.program.name(),
                self.target.arch,
                executable.kernels().len(),
                result.gradients.is_some()
            ),
        );
        Ok(result)
    }

    fn compare(
        &self,
        case: &TestCase,
        reference: &ExecutionResult,
        compiled: &ExecutionResult,
        run: &mut CaseRun,
    ) -> Result<(), CaseFailure> {
        if let (Some(expected), Some(actual)) =
            (case.expected_output_shape(), reference.outputs.first())
        {
            if expected != actual.shape() {
                return Err(CaseFailure::ExpectedShape {
                    expected: expected.to_vec(),
                    actual: actual.shape().to_vec(),
                });
            }
        }
        run.output_shape = compiled.outputs.first().map(|tensor| tensor.shape().to_vec());

        let outputs = compare_tensors(
            case.name(),
            TensorKind::Output,
            &reference.outputs,
            &compiled.outputs,
            &self.tolerance,
        )?;
        run.comparisons.extend(outputs);

        if self.tolerance.check_grads {
            match (&reference.gradients, &compiled.gradients) {
                (Some(expected), Some(actual)) => {
                    let gradients = compare_tensors(
                        case.name(),
                        TensorKind::Gradient,
                        expected,
                        actual,
                        &self.tolerance,
                    )?;
                    run.comparisons.extend(gradients);
                    run.grad_check = Some(GradCheck::Compared);
                }
                _ => {
                    run.grad_check = Some(GradCheck::Exempt {
                        reason: format!(
                            "{} executable has no gradient kernels",
                            self.target.arch
                        ),
                    });
                }
            }
        }
        run.evidence.record(
            EvidenceKind::Compare,
            format!(
                "case={} tensors={} atol={:e} rtol={:e}",
                case.name(),
                run.comparisons.len(),
                self.tolerance.atol,
                self.tolerance.rtol
            ),
        );
        Ok(())
    }

    fn skip_case(&self, spec: &CaseSpec, reason: &str) -> CaseReport {
        let mut run = CaseRun::new(self.tolerance.check_grads);
        run.seed = self.seed;
        let diagnostic = match run.lifecycle.advance(CaseState::Skip) {
            Ok(()) => Some(reason.to_owned()),
            Err(error) => Some(error.to_string()),
        };
        run.evidence
            .record(EvidenceKind::Gate, format!("case={} skipped: {reason}", spec.name));
        self.report(spec, run, Verdict::Skip, diagnostic, "capability_missing")
    }

    fn report(
        &self,
        spec: &CaseSpec,
        run: CaseRun,
        verdict: Verdict,
        diagnostic: Option<String>,
        reason_code: &str,
    ) -> CaseReport {
        let max_abs_diff = run
            .comparisons
            .iter()
            .map(|comparison| comparison.max_abs_diff)
            .fold(0.0f64, f64::max);
        let mut extra_fields = BTreeMap::new();
        extra_fields.insert(
            "state_trail".to_owned(),
            Value::Array(
                run.lifecycle
                    .trail()
                    .iter()
                    .map(|state| Value::from(state.label()))
                    .collect(),
            ),
        );
        extra_fields.insert("input_shapes".to_owned(), Value::from(run.shapes_label.clone()));
        extra_fields.insert("output_shape".to_owned(), json!(run.output_shape));
        extra_fields.insert("max_abs_diff".to_owned(), json!(max_abs_diff));
        extra_fields.insert(
            "tolerance".to_owned(),
            json!({ "atol": self.tolerance.atol, "rtol": self.tolerance.rtol }),
        );
        extra_fields.insert("grad_check".to_owned(), json!(run.grad_check));
        extra_fields.insert("diagnostic".to_owned(), json!(diagnostic));
        extra_fields.insert(
            "runtime_evidence".to_owned(),
            evidence_field(run.evidence.entries()),
        );

        let forensic_log = StructuredCaseLog::new(
            &self.fixture.suite,
            &spec.name,
            &self.fixture_id,
            self.target.arch.name(),
            run.seed,
            verdict.label(),
            reason_code,
        )
        .with_extra_fields(extra_fields);

        CaseReport {
            suite: self.fixture.suite.clone(),
            case: spec.name.clone(),
            verdict,
            input_shapes: run.shapes_label,
            output_shape: run.output_shape,
            comparisons: run.comparisons,
            grad_check: run.grad_check,
            diagnostic,
            state_trail: run.lifecycle.trail().to_vec(),
            evidence: run.evidence,
            forensic_log,
        }
    }
}

fn execute_reference(
    reference: &mut ReferenceProgram,
    case: &TestCase,
    with_grads: bool,
) -> Result<ExecutionResult, CaseFailure> {
    let output = reference.session.tensor(reference.output)?.clone();
    if !with_grads {
        return Ok(ExecutionResult {
            outputs: vec![output],
            gradients: None,
        });
    }

    let report = reference.session.backward(reference.output)?;
    let gradients = reference
        .inputs
        .iter()
        .zip(case.inputs())
        .map(|(handle, input)| {
            reference
                .session
                .gradient(&report, *handle)
                .cloned()
                .ok_or_else(|| CaseFailure::MissingReferenceGradient {
                    name: input.name.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ExecutionResult {
        outputs: vec![output],
        gradients: Some(gradients),
    })
}

/// Mutable record of one case while it moves through its states.
struct CaseRun {
    lifecycle: CaseLifecycle,
    evidence: EvidenceLedger,
    comparisons: Vec<TensorComparison>,
    grad_check: Option<GradCheck>,
    shapes_label: String,
    output_shape: Option<Vec<usize>>,
    seed: Option<u64>,
}

impl CaseRun {
    fn new(check_grads: bool) -> Self {
        Self {
            lifecycle: CaseLifecycle::new(),
            evidence: EvidenceLedger::new(),
            comparisons: Vec::new(),
            // decided at comparison time when gradients are requested
            grad_check: (!check_grads).then_some(GradCheck::NotRequested),
            shapes_label: String::new(),
            output_shape: None,
            seed: None,
        }
    }
}
