#![forbid(unsafe_code)]

mod backend;
#[cfg(feature = "nvgpu")]
pub mod simt;

use std::collections::BTreeSet;

use tc_builder::{Instruction, Program, VarId, Variable};
use tc_core::{DType, DenseTensor, DenseTensorError, MatmulPlan};
use tc_device::{DeviceGuard, Target};
use tc_runtime::{EvidenceKind, EvidenceLedger};
use thiserror::Error;

pub use backend::Backend;
use backend::{GemmDims, MatrixView};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompilationError {
    #[error("{target} is not available in this build")]
    UnsupportedTarget { target: Target },
    #[error("variable `{name}` is {dtype}; only f32 programs can be compiled")]
    UnsupportedDType { name: String, dtype: DType },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("input `{name}` was not fed")]
    MissingInput { name: String },
    #[error("`{name}` is not an input of the program")]
    UnknownInput { name: String },
    #[error("input `{name}` was fed more than once")]
    DuplicateInput { name: String },
    #[error("input `{name}` declared with shape {declared:?}, fed {actual:?}")]
    ShapeMismatch {
        name: String,
        declared: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("input `{name}` declared as {declared}, fed {actual}")]
    DTypeMismatch {
        name: String,
        declared: DType,
        actual: DType,
    },
    #[error("`{name}` is not a variable of the program")]
    UnknownOutput { name: String },
    #[error("{inputs} inputs but {values} input values")]
    FeedCountMismatch { inputs: usize, values: usize },
    #[error("executable was compiled without gradient kernels")]
    GradientsUnavailable,
    #[error("cannot differentiate with respect to `{name}`")]
    UnknownGradientTarget { name: String },
    #[error("result tensor construction failed: {0}")]
    Tensor(#[from] DenseTensorError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JitError {
    #[error(transparent)]
    Compile(#[from] CompilationError),
    #[error(transparent)]
    Execute(#[from] ExecutionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Lower gradient rules alongside the forward kernels.
    pub gradients: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { gradients: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescriptor {
    pub op: &'static str,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientRun {
    pub outputs: Vec<DenseTensor>,
    /// One gradient per requested variable, in request order.
    pub gradients: Vec<DenseTensor>,
}

/// A program lowered for one target.
#[derive(Debug, Clone)]
pub struct Executable {
    program: Program,
    target: Target,
    backend: Backend,
    kernels: Vec<KernelDescriptor>,
    gradients: bool,
    ledger: EvidenceLedger,
}

pub fn compile(program: &Program, target: Target) -> Result<Executable, CompilationError> {
    compile_with_options(program, target, CompileOptions::default())
}

pub fn compile_with_options(
    program: &Program,
    target: Target,
    options: CompileOptions,
) -> Result<Executable, CompilationError> {
    let backend = Backend::for_target(target)?;
    if let Some(var) = program.variables().iter().find(|var| var.dtype() != DType::F32) {
        return Err(CompilationError::UnsupportedDType {
            name: var.name().to_owned(),
            dtype: var.dtype(),
        });
    }

    let kernels: Vec<KernelDescriptor> = program
        .instructions()
        .iter()
        .map(|instruction| {
            let numel = program
                .variable(instruction.output())
                .map_or(0, Variable::numel);
            KernelDescriptor {
                op: instruction.op_name(),
                symbol: backend.describe(instruction, numel),
            }
        })
        .collect();

    let gradients = options.gradients && program.instructions().iter().all(has_gradient_rule);
    let mut ledger = EvidenceLedger::new();
    ledger.record(
        EvidenceKind::Compile,
        format!(
            "program={} {target} backend={} kernels={} gradients={}",
            program.name(),
            backend.name(),
            kernels.len(),
            gradients
        ),
    );
    tracing::debug!(
        program = program.name(),
        target = %target,
        backend = backend.name(),
        kernels = kernels.len(),
        "compiled program"
    );

    Ok(Executable {
        program: program.clone(),
        target,
        backend,
        kernels,
        gradients,
        ledger,
    })
}

impl Executable {
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    #[must_use]
    pub fn target(&self) -> Target {
        self.target
    }

    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    #[must_use]
    pub fn kernels(&self) -> &[KernelDescriptor] {
        &self.kernels
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    /// True when gradients were requested at compile time and every
    /// instruction has a lowered gradient rule.
    #[must_use]
    pub fn supports_gradients(&self) -> bool {
        self.gradients
    }

    /// Binds `feeds` by input name, runs every kernel and fetches `outputs`
    /// in request order.
    pub fn run(
        &self,
        feeds: &[(&str, &DenseTensor)],
        outputs: &[&str],
    ) -> Result<Vec<DenseTensor>, ExecutionError> {
        let fetch = self.resolve_outputs(outputs)?;
        let buffers = self.forward(feeds)?;
        self.collect(&buffers, &fetch)
    }

    /// Runs forward, seeds every requested output with ones and returns the
    /// gradients of `wrt`. A variable the seeds never reach gets zeros.
    pub fn run_with_grads(
        &self,
        feeds: &[(&str, &DenseTensor)],
        outputs: &[&str],
        wrt: &[&str],
    ) -> Result<GradientRun, ExecutionError> {
        if !self.gradients {
            return Err(ExecutionError::GradientsUnavailable);
        }
        let fetch = self.resolve_outputs(outputs)?;
        let targets = wrt
            .iter()
            .map(|name| {
                self.program
                    .variable_by_name(name)
                    .map(Variable::id)
                    .ok_or_else(|| ExecutionError::UnknownGradientTarget {
                        name: (*name).to_owned(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let buffers = self.forward(feeds)?;
        let mut grads: Vec<Option<Vec<f32>>> = vec![None; buffers.len()];
        for id in &fetch {
            let numel = self.var(*id).numel();
            accumulate(&mut grads, *id, &vec![1.0; numel]);
        }

        for instruction in self.program.instructions().iter().rev() {
            let Some(upstream) = grads[instruction.output().0].clone() else {
                continue;
            };
            match instruction {
                Instruction::Matmul { lhs, rhs, plan, .. } => {
                    let (grad_lhs, grad_rhs) = self.matmul_backward(
                        plan,
                        buffer(&buffers, *lhs),
                        buffer(&buffers, *rhs),
                        &upstream,
                    );
                    accumulate(&mut grads, *lhs, &grad_lhs);
                    accumulate(&mut grads, *rhs, &grad_rhs);
                }
                Instruction::Add { lhs, rhs, .. } => {
                    accumulate(&mut grads, *lhs, &upstream);
                    accumulate(&mut grads, *rhs, &upstream);
                }
            }
        }

        let gradients = targets
            .iter()
            .map(|id| {
                let var = self.var(*id);
                let values = grads[id.0].take().unwrap_or_else(|| vec![0.0; var.numel()]);
                self.to_tensor(&values, var)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = self.collect(&buffers, &fetch)?;
        tracing::debug!(
            program = self.program.name(),
            outputs = outputs.len(),
            gradients = gradients.len(),
            "ran program with gradients"
        );
        Ok(GradientRun { outputs, gradients })
    }

    fn resolve_outputs(&self, outputs: &[&str]) -> Result<Vec<VarId>, ExecutionError> {
        outputs
            .iter()
            .map(|name| {
                self.program
                    .variable_by_name(name)
                    .map(Variable::id)
                    .ok_or_else(|| ExecutionError::UnknownOutput {
                        name: (*name).to_owned(),
                    })
            })
            .collect()
    }

    fn bind(&self, feeds: &[(&str, &DenseTensor)]) -> Result<Vec<Option<Vec<f32>>>, ExecutionError> {
        let mut buffers: Vec<Option<Vec<f32>>> = vec![None; self.program.variables().len()];
        let mut seen = BTreeSet::new();
        for (name, tensor) in feeds {
            let var = self
                .program
                .variable_by_name(name)
                .filter(|var| self.program.is_input(var.id()))
                .ok_or_else(|| ExecutionError::UnknownInput {
                    name: (*name).to_owned(),
                })?;
            if !seen.insert(var.id()) {
                return Err(ExecutionError::DuplicateInput {
                    name: (*name).to_owned(),
                });
            }
            if tensor.dtype() != var.dtype() {
                return Err(ExecutionError::DTypeMismatch {
                    name: (*name).to_owned(),
                    declared: var.dtype(),
                    actual: tensor.dtype(),
                });
            }
            if tensor.shape() != var.shape() {
                return Err(ExecutionError::ShapeMismatch {
                    name: (*name).to_owned(),
                    declared: var.shape().to_vec(),
                    actual: tensor.shape().to_vec(),
                });
            }
            buffers[var.id().0] = Some(tensor.to_f32_vec());
        }
        if let Some(missing) = self
            .program
            .inputs()
            .find(|var| buffers[var.id().0].is_none())
        {
            return Err(ExecutionError::MissingInput {
                name: missing.name().to_owned(),
            });
        }
        Ok(buffers)
    }

    fn forward(&self, feeds: &[(&str, &DenseTensor)]) -> Result<Vec<Option<Vec<f32>>>, ExecutionError> {
        let mut buffers = self.bind(feeds)?;
        for (instruction, kernel) in self.program.instructions().iter().zip(&self.kernels) {
            let out = match instruction {
                Instruction::Matmul { lhs, rhs, plan, .. } => {
                    self.matmul_forward(plan, buffer(&buffers, *lhs), buffer(&buffers, *rhs))
                }
                Instruction::Add { lhs, rhs, out } => {
                    let mut values = vec![0.0f32; self.var(*out).numel()];
                    self.backend
                        .add(buffer(&buffers, *lhs), buffer(&buffers, *rhs), &mut values);
                    values
                }
            };
            tracing::trace!(kernel = %kernel.symbol, "kernel complete");
            buffers[instruction.output().0] = Some(out);
        }
        Ok(buffers)
    }

    fn matmul_forward(&self, plan: &MatmulPlan, lhs: &[f32], rhs: &[f32]) -> Vec<f32> {
        let dims = GemmDims {
            m: plan.m(),
            k: plan.k(),
            n: plan.n(),
        };
        let tile = dims.m * dims.n;
        let mut out = vec![0.0f32; plan.output_numel()];
        for batch in 0..plan.batch_count() {
            let offset = plan.output_offset(batch);
            self.backend.gemm(
                dims,
                MatrixView::row_major(lhs, plan.lhs_offset(batch), dims.k),
                MatrixView::row_major(rhs, plan.rhs_offset(batch), dims.n),
                &mut out[offset..offset + tile],
                false,
            );
        }
        out
    }

    /// `d_lhs = g @ rhs^T`, `d_rhs = lhs^T @ g`; broadcast operands collect
    /// the sum over every batch element that read them.
    fn matmul_backward(
        &self,
        plan: &MatmulPlan,
        lhs: &[f32],
        rhs: &[f32],
        grad_out: &[f32],
    ) -> (Vec<f32>, Vec<f32>) {
        let (m, k, n) = (plan.m(), plan.k(), plan.n());
        let mut grad_lhs = vec![0.0f32; plan.lhs_numel()];
        let mut grad_rhs = vec![0.0f32; plan.rhs_numel()];
        for batch in 0..plan.batch_count() {
            let lo = plan.lhs_offset(batch);
            let ro = plan.rhs_offset(batch);
            let go = plan.output_offset(batch);
            self.backend.gemm(
                GemmDims { m, k: n, n: k },
                MatrixView::row_major(grad_out, go, n),
                MatrixView::transposed(rhs, ro, n),
                &mut grad_lhs[lo..lo + m * k],
                true,
            );
            self.backend.gemm(
                GemmDims { m: k, k: m, n },
                MatrixView::transposed(lhs, lo, k),
                MatrixView::row_major(grad_out, go, n),
                &mut grad_rhs[ro..ro + k * n],
                true,
            );
        }
        (grad_lhs, grad_rhs)
    }

    fn collect(
        &self,
        buffers: &[Option<Vec<f32>>],
        fetch: &[VarId],
    ) -> Result<Vec<DenseTensor>, ExecutionError> {
        fetch
            .iter()
            .map(|id| self.to_tensor(buffer(buffers, *id), self.var(*id)))
            .collect()
    }

    fn to_tensor(&self, values: &[f32], var: &Variable) -> Result<DenseTensor, ExecutionError> {
        let tensor = DenseTensor::from_f32(values, var.shape().to_vec())?
            .on_device(self.target.device());
        debug_assert!(DeviceGuard::for_target(self.target)
            .ensure_tensor_device(&tensor)
            .is_ok());
        Ok(tensor)
    }

    fn var(&self, id: VarId) -> &Variable {
        &self.program.variables()[id.0]
    }
}

/// Instructions whose reverse rule `run_with_grads` implements.
fn has_gradient_rule(instruction: &Instruction) -> bool {
    match instruction {
        Instruction::Matmul { .. } | Instruction::Add { .. } => true,
    }
}

/// Every variable is either fed or produced before it is read: inputs are
/// checked by `bind` and instructions only read earlier variables.
fn buffer(buffers: &[Option<Vec<f32>>], id: VarId) -> &[f32] {
    buffers[id.0].as_deref().unwrap_or(&[])
}

fn accumulate(grads: &mut [Option<Vec<f32>>], id: VarId, contribution: &[f32]) {
    match &mut grads[id.0] {
        Some(existing) => {
            for (slot, value) in existing.iter_mut().zip(contribution) {
                *slot += value;
            }
        }
        slot @ None => *slot = Some(contribution.to_vec()),
    }
}

/// Compiles `program` for `target`, feeds `input_values` to `inputs`
/// positionally and fetches `outputs` in order.
pub fn run(
    program: &Program,
    target: Target,
    inputs: &[Variable],
    input_values: &[DenseTensor],
    outputs: &[Variable],
) -> Result<Vec<DenseTensor>, JitError> {
    if inputs.len() != input_values.len() {
        return Err(ExecutionError::FeedCountMismatch {
            inputs: inputs.len(),
            values: input_values.len(),
        }
        .into());
    }
    let executable = compile(program, target)?;
    let feeds: Vec<(&str, &DenseTensor)> = inputs
        .iter()
        .map(Variable::name)
        .zip(input_values)
        .collect();
    let fetch: Vec<&str> = outputs.iter().map(Variable::name).collect();
    Ok(executable.run(&feeds, &fetch)?)
}

#[cfg(test)]
mod tests {
    use tc_builder::{NetBuilder, Program, Variable};
    use tc_core::{DType, DenseTensor, Device};
    use tc_device::Target;

    use super::{
        CompilationError, CompileOptions, ExecutionError, JitError, compile, compile_with_options,
        run,
    };

    fn matmul_program(lhs: &[usize], rhs: &[usize]) -> (Program, Vec<Variable>, Variable) {
        let mut builder = NetBuilder::new("matmul");
        let a = builder.create_input(DType::F32, lhs, "A").expect("A");
        let b = builder.create_input(DType::F32, rhs, "B").expect("B");
        let out = builder.matmul(&a, &b).expect("matmul");
        (builder.build().expect("build"), vec![a, b], out)
    }

    fn ramp(shape: &[usize], scale: f32) -> DenseTensor {
        let numel: usize = shape.iter().product();
        let values: Vec<f32> = (0..numel).map(|i| (i % 7) as f32 * scale).collect();
        DenseTensor::from_f32(&values, shape.to_vec()).expect("tensor")
    }

    #[test]
    fn host_matmul_known_values() {
        let (program, inputs, out) = matmul_program(&[2, 2], &[2, 2]);
        let a = DenseTensor::from_f32(&[1.0, 2.0, 3.0, 4.0], vec![2, 2]).expect("a");
        let b = DenseTensor::from_f32(&[5.0, 6.0, 7.0, 8.0], vec![2, 2]).expect("b");
        let result = run(&program, Target::host(), &inputs, &[a, b], std::slice::from_ref(&out)).expect("run");
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].values(), &[19.0, 22.0, 43.0, 50.0]);
        assert_eq!(result[0].device(), Device::Cpu);
    }

    #[test]
    fn broadcast_batch_matmul_shapes() {
        let (program, _, out) = matmul_program(&[3, 1, 4, 16], &[2, 16, 8]);
        let executable = compile(&program, Target::host()).expect("compile");
        let a = ramp(&[3, 1, 4, 16], 0.1);
        let b = ramp(&[2, 16, 8], 0.2);
        let result = executable
            .run(&[("A", &a), ("B", &b)], &[out.name()])
            .expect("run");
        assert_eq!(result[0].shape(), &[3, 2, 4, 8]);
    }

    #[test]
    fn repeated_runs_are_bitwise_identical() {
        let (program, _, out) = matmul_program(&[5, 4, 16], &[5, 16, 32]);
        let executable = compile(&program, Target::host()).expect("compile");
        let a = ramp(&[5, 4, 16], 0.13);
        let b = ramp(&[5, 16, 32], 0.07);
        let first = executable.run(&[("A", &a), ("B", &b)], &[out.name()]).expect("run");
        let second = executable.run(&[("A", &a), ("B", &b)], &[out.name()]).expect("run");
        let bits = |t: &DenseTensor| t.to_f32_vec().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&first[0]), bits(&second[0]));
    }

    #[test]
    fn binding_errors_name_the_input() {
        let (program, _, out) = matmul_program(&[4, 16], &[16, 32]);
        let executable = compile(&program, Target::host()).expect("compile");
        let a = ramp(&[4, 16], 0.1);
        let b = ramp(&[16, 32], 0.1);
        let wrong_shape = ramp(&[16, 4], 0.1);
        let wrong_dtype =
            DenseTensor::from_vec(vec![0.0; 64], vec![4, 16], DType::F64).expect("f64");

        assert_eq!(
            executable.run(&[("A", &a)], &[out.name()]),
            Err(ExecutionError::MissingInput {
                name: "B".to_owned()
            })
        );
        assert!(matches!(
            executable.run(&[("A", &a), ("B", &b), ("C", &b)], &[out.name()]),
            Err(ExecutionError::UnknownInput { name }) if name == "C"
        ));
        assert!(matches!(
            executable.run(&[("A", &a), ("A", &a)], &[out.name()]),
            Err(ExecutionError::DuplicateInput { .. })
        ));
        assert!(matches!(
            executable.run(&[("A", &wrong_shape), ("B", &b)], &[out.name()]),
            Err(ExecutionError::ShapeMismatch { name, .. }) if name == "A"
        ));
        assert!(matches!(
            executable.run(&[("A", &wrong_dtype), ("B", &b)], &[out.name()]),
            Err(ExecutionError::DTypeMismatch { .. })
        ));
        assert!(matches!(
            executable.run(&[("A", &a), ("B", &b)], &["missing"]),
            Err(ExecutionError::UnknownOutput { .. })
        ));
    }

    #[test]
    fn feed_count_mismatch_is_reported() {
        let (program, inputs, out) = matmul_program(&[2, 2], &[2, 2]);
        let err = run(&program, Target::host(), &inputs, &[ramp(&[2, 2], 1.0)], &[out])
            .expect_err("one value for two inputs");
        assert_eq!(
            err,
            JitError::Execute(ExecutionError::FeedCountMismatch {
                inputs: 2,
                values: 1
            })
        );
    }

    #[test]
    fn f64_programs_are_rejected() {
        let mut builder = NetBuilder::new("f64");
        let a = builder.create_input(DType::F64, &[2, 2], "A").expect("A");
        let b = builder.create_input(DType::F64, &[2, 2], "B").expect("B");
        builder.matmul(&a, &b).expect("matmul");
        let program = builder.build().expect("build");
        assert!(matches!(
            compile(&program, Target::host()),
            Err(CompilationError::UnsupportedDType { dtype: DType::F64, .. })
        ));
    }

    #[test]
    fn gradients_match_hand_values() {
        let (program, _, out) = matmul_program(&[2, 2], &[2, 2]);
        let executable = compile(&program, Target::host()).expect("compile");
        assert!(executable.supports_gradients());
        let a = DenseTensor::from_f32(&[1.0, 2.0, 3.0, 4.0], vec![2, 2]).expect("a");
        let b = DenseTensor::from_f32(&[5.0, 6.0, 7.0, 8.0], vec![2, 2]).expect("b");
        let run = executable
            .run_with_grads(&[("A", &a), ("B", &b)], &[out.name()], &["A", "B"])
            .expect("grads");
        assert_eq!(run.gradients[0].values(), &[11.0, 15.0, 11.0, 15.0]);
        assert_eq!(run.gradients[1].values(), &[4.0, 4.0, 6.0, 6.0]);
    }

    #[test]
    fn broadcast_gradients_reduce_over_batch() {
        let (program, _, out) = matmul_program(&[3, 2, 2], &[2, 2]);
        let executable = compile(&program, Target::host()).expect("compile");
        let a = DenseTensor::from_f32(&[1.0; 12], vec![3, 2, 2]).expect("a");
        let b = DenseTensor::from_f32(&[1.0; 4], vec![2, 2]).expect("b");
        let run = executable
            .run_with_grads(&[("A", &a), ("B", &b)], &[out.name()], &["B"])
            .expect("grads");
        assert_eq!(run.gradients[0].shape(), &[2, 2]);
        assert_eq!(run.gradients[0].values(), &[6.0, 6.0, 6.0, 6.0]);
    }

    #[test]
    fn gradient_support_covers_every_instruction() {
        let mut builder = NetBuilder::new("mixed");
        let a = builder.create_input(DType::F32, &[2, 3], "A").expect("A");
        let b = builder.create_input(DType::F32, &[3, 2], "B").expect("B");
        let c = builder.create_input(DType::F32, &[2, 2], "C").expect("C");
        let prod = builder.matmul(&a, &b).expect("matmul");
        let sum = builder.add(&prod, &c).expect("add");
        let program = builder.build().expect("build");

        let executable = compile(&program, Target::host()).expect("compile");
        assert!(executable.supports_gradients());
        let x = ramp(&[2, 3], 0.5);
        let y = ramp(&[3, 2], 0.25);
        let z = ramp(&[2, 2], 1.0);
        let run = executable
            .run_with_grads(&[("A", &x), ("B", &y), ("C", &z)], &[sum.name()], &["C"])
            .expect("grads");
        assert_eq!(run.gradients[0].values(), &[1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn gradients_can_be_compiled_out() {
        let (program, _, out) = matmul_program(&[2, 2], &[2, 2]);
        let executable =
            compile_with_options(&program, Target::host(), CompileOptions { gradients: false })
                .expect("compile");
        assert!(!executable.supports_gradients());
        let a = ramp(&[2, 2], 1.0);
        assert_eq!(
            executable.run_with_grads(&[("A", &a), ("B", &a)], &[out.name()], &["A"]),
            Err(ExecutionError::GradientsUnavailable)
        );
    }

    #[cfg(not(feature = "nvgpu"))]
    #[test]
    fn nvgpu_target_requires_feature() {
        let (program, _, _) = matmul_program(&[2, 2], &[2, 2]);
        assert!(matches!(
            compile(&program, Target::nvgpu()),
            Err(CompilationError::UnsupportedTarget { .. })
        ));
    }

    #[cfg(feature = "nvgpu")]
    #[test]
    fn nvgpu_matches_host() {
        let (program, _, out) = matmul_program(&[5, 4, 16], &[5, 16, 32]);
        let host = compile(&program, Target::host()).expect("host");
        let gpu = compile(&program, Target::nvgpu()).expect("nvgpu");
        assert!(gpu.kernels()[0].symbol.starts_with("simt::matmul_f32"));
        let a = ramp(&[5, 4, 16], 0.13);
        let b = ramp(&[5, 16, 32], 0.07);
        let feeds = [("A", &a), ("B", &b)];
        let host_run = host.run_with_grads(&feeds, &[out.name()], &["A", "B"]).expect("host");
        let gpu_run = gpu.run_with_grads(&feeds, &[out.name()], &["A", "B"]).expect("gpu");
        assert_eq!(gpu_run.outputs[0].device(), Device::NvGpu);
        for (h, g) in host_run.outputs[0].values().iter().zip(gpu_run.outputs[0].values()) {
            assert!((h - g).abs() <= 1e-5 + 1e-5 * h.abs());
        }
        for (hg, gg) in host_run.gradients.iter().zip(&gpu_run.gradients) {
            for (h, g) in hg.values().iter().zip(gg.values()) {
                assert!((h - g).abs() <= 1e-5 + 1e-5 * h.abs());
            }
        }
    }
}
