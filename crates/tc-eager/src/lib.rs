#![forbid(unsafe_code)]

use tc_autograd::{AutogradError, BackwardReport, NodeId, OperationEvent, Tape};
use tc_core::DenseTensor;
use tc_runtime::{EvidenceEntry, EvidenceKind, EvidenceLedger, RuntimeContext};

/// Handle to a tensor living on a session's tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorHandle(NodeId);

impl TensorHandle {
    #[must_use]
    pub fn node(self) -> NodeId {
        self.0
    }
}

/// Eager reference session: every operation executes immediately on the
/// CPU kernels and is recorded on the tape for a later backward pass.
#[derive(Debug, Clone)]
pub struct EagerSession {
    tape: Tape,
    runtime: RuntimeContext,
}

impl EagerSession {
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            tape: Tape::new(),
            runtime: RuntimeContext::new(scope),
        }
    }

    /// Wraps `value` as a leaf. A `stop_gradient` leaf never receives a
    /// gradient.
    pub fn to_tensor(&mut self, value: DenseTensor, stop_gradient: bool) -> TensorHandle {
        TensorHandle(self.tape.leaf(value, !stop_gradient))
    }

    pub fn matmul(
        &mut self,
        lhs: TensorHandle,
        rhs: TensorHandle,
    ) -> Result<TensorHandle, AutogradError> {
        let (out, event) = self.tape.matmul(lhs.0, rhs.0)?;
        self.record_operation(&event);
        Ok(TensorHandle(out))
    }

    pub fn add(
        &mut self,
        lhs: TensorHandle,
        rhs: TensorHandle,
    ) -> Result<TensorHandle, AutogradError> {
        let (out, event) = self.tape.add(lhs.0, rhs.0)?;
        self.record_operation(&event);
        Ok(TensorHandle(out))
    }

    pub fn tensor(&self, handle: TensorHandle) -> Result<&DenseTensor, AutogradError> {
        self.tape.tensor(handle.0)
    }

    pub fn values(&self, handle: TensorHandle) -> Result<Vec<f64>, AutogradError> {
        Ok(self.tape.tensor(handle.0)?.values().to_vec())
    }

    pub fn backward(&mut self, root: TensorHandle) -> Result<BackwardReport, AutogradError> {
        let report = self.tape.backward(root.0)?;
        self.runtime.record(
            EvidenceKind::Backward,
            format!(
                "root={} backward_steps={} queue_pushes={} queue_pops={} max_queue_len={}",
                root.0.0,
                report.steps.len(),
                report.telemetry.queue_pushes,
                report.telemetry.queue_pops,
                report.telemetry.max_queue_len
            ),
        );
        Ok(report)
    }

    #[must_use]
    pub fn gradient<'a>(
        &self,
        report: &'a BackwardReport,
        handle: TensorHandle,
    ) -> Option<&'a DenseTensor> {
        report.gradient(handle.0)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        self.runtime.ledger()
    }

    fn record_operation(&mut self, event: &OperationEvent) {
        self.runtime.record(
            EvidenceKind::Operation,
            format!(
                "op={:?} lhs={} rhs={} out={} shape={:?} kernel={}",
                event.op, event.lhs.0, event.rhs.0, event.out.0, event.output_shape, event.kernel
            ),
        );
    }
}
