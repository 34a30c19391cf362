#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tc_core::{DenseTensor, DenseTensorError, MatmulPlan};
use tc_kernel_cpu::{
    KernelError, add_contiguous_f64, matmul_backward_contiguous_f64, matmul_contiguous_f64,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeOp {
    Add,
    Matmul,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeOp {
    Leaf,
    Add { lhs: NodeId, rhs: NodeId },
    Matmul {
        lhs: NodeId,
        rhs: NodeId,
        plan: MatmulPlan,
    },
}

impl NodeOp {
    fn inputs(&self) -> Option<(NodeId, NodeId)> {
        match self {
            Self::Leaf => None,
            Self::Add { lhs, rhs } | Self::Matmul { lhs, rhs, .. } => Some((*lhs, *rhs)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    tensor: DenseTensor,
    requires_grad: bool,
    op: NodeOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerTelemetry {
    pub execution_order: Vec<NodeId>,
    pub queue_pushes: usize,
    pub queue_pops: usize,
    pub max_queue_len: usize,
    pub dependency_snapshot: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyTask {
    node: NodeId,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node.cmp(&other.node)
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap on node id: a node is always created after its inputs, so the
/// newest ready node is processed first.
#[derive(Debug, Default)]
struct ReadyQueue {
    heap: BinaryHeap<ReadyTask>,
    pushes: usize,
    pops: usize,
    max_len: usize,
}

impl ReadyQueue {
    fn push(&mut self, node: NodeId) {
        self.heap.push(ReadyTask { node });
        self.pushes += 1;
        self.max_len = self.max_len.max(self.heap.len());
    }

    fn pop(&mut self) -> Option<NodeId> {
        let next = self.heap.pop().map(|task| task.node);
        if next.is_some() {
            self.pops += 1;
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationEvent {
    pub op: TapeOp,
    pub lhs: NodeId,
    pub rhs: NodeId,
    pub out: NodeId,
    pub output_shape: Vec<usize>,
    pub kernel: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackwardStep {
    pub node: NodeId,
    pub rule: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackwardReport {
    gradients: Vec<Option<DenseTensor>>,
    pub steps: Vec<BackwardStep>,
    pub telemetry: SchedulerTelemetry,
}

impl BackwardReport {
    /// Gradient accumulated into `node`; `None` for nodes that do not
    /// require grad or were not reached from the root.
    #[must_use]
    pub fn gradient(&self, node: NodeId) -> Option<&DenseTensor> {
        self.gradients.get(node.0).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn gradients(&self) -> &[Option<DenseTensor>] {
        &self.gradients
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutogradError {
    #[error("unknown node id {}", .0.0)]
    UnknownNode(NodeId),
    #[error("kernel failure: {0}")]
    Kernel(#[from] KernelError),
    #[error("tensor construction failure: {0}")]
    Tensor(#[from] DenseTensorError),
    #[error("seed for node {} has {actual} values, output has {expected}", node.0)]
    SeedShapeMismatch {
        node: NodeId,
        expected: usize,
        actual: usize,
    },
    #[error("dependency scheduler underflow at node {}", node.0)]
    DependencyUnderflow { node: NodeId },
}

#[derive(Debug, Clone, Default)]
pub struct Tape {
    nodes: Vec<Node>,
}

impl Tape {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf(&mut self, tensor: DenseTensor, requires_grad: bool) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            tensor,
            requires_grad,
            op: NodeOp::Leaf,
        });
        id
    }

    pub fn tensor(&self, node: NodeId) -> Result<&DenseTensor, AutogradError> {
        Ok(&self.node(node)?.tensor)
    }

    pub fn requires_grad(&self, node: NodeId) -> Result<bool, AutogradError> {
        Ok(self.node(node)?.requires_grad)
    }

    pub fn add(
        &mut self,
        lhs: NodeId,
        rhs: NodeId,
    ) -> Result<(NodeId, OperationEvent), AutogradError> {
        let (tensor, requires_grad) = {
            let lhs_node = self.node(lhs)?;
            let rhs_node = self.node(rhs)?;
            let values = add_contiguous_f64(
                lhs_node.tensor.values(),
                rhs_node.tensor.values(),
                lhs_node.tensor.meta(),
                rhs_node.tensor.meta(),
            )?;
            let tensor = DenseTensor::from_vec(
                values,
                lhs_node.tensor.shape().to_vec(),
                lhs_node.tensor.dtype(),
            )?;
            (tensor, lhs_node.requires_grad || rhs_node.requires_grad)
        };
        Ok(self.push_op(
            TapeOp::Add,
            tensor,
            requires_grad,
            NodeOp::Add { lhs, rhs },
            "cpu::add_contiguous_f64",
        ))
    }

    pub fn matmul(
        &mut self,
        lhs: NodeId,
        rhs: NodeId,
    ) -> Result<(NodeId, OperationEvent), AutogradError> {
        let (tensor, requires_grad, plan) = {
            let lhs_node = self.node(lhs)?;
            let rhs_node = self.node(rhs)?;
            let (values, plan) = matmul_contiguous_f64(
                lhs_node.tensor.values(),
                rhs_node.tensor.values(),
                lhs_node.tensor.meta(),
                rhs_node.tensor.meta(),
            )?;
            let tensor = DenseTensor::from_vec(
                values,
                plan.output_shape().to_vec(),
                lhs_node.tensor.dtype(),
            )?;
            (
                tensor,
                lhs_node.requires_grad || rhs_node.requires_grad,
                plan,
            )
        };
        Ok(self.push_op(
            TapeOp::Matmul,
            tensor,
            requires_grad,
            NodeOp::Matmul { lhs, rhs, plan },
            "cpu::matmul_contiguous_f64",
        ))
    }

    fn push_op(
        &mut self,
        op: TapeOp,
        tensor: DenseTensor,
        requires_grad: bool,
        node_op: NodeOp,
        kernel: &'static str,
    ) -> (NodeId, OperationEvent) {
        let out = NodeId(self.nodes.len());
        let (lhs, rhs) = node_op.inputs().unwrap_or((out, out));
        let event = OperationEvent {
            op,
            lhs,
            rhs,
            out,
            output_shape: tensor.shape().to_vec(),
            kernel,
        };
        self.nodes.push(Node {
            tensor,
            requires_grad,
            op: node_op,
        });
        (out, event)
    }

    /// Backpropagates a seed of ones shaped like `root`, i.e. the gradient of
    /// `sum(root)`.
    pub fn backward(&self, root: NodeId) -> Result<BackwardReport, AutogradError> {
        let numel = self.node(root)?.tensor.numel();
        self.backward_with_seed(root, vec![1.0; numel])
    }

    pub fn backward_with_seed(
        &self,
        root: NodeId,
        seed: Vec<f64>,
    ) -> Result<BackwardReport, AutogradError> {
        let root_numel = self.node(root)?.tensor.numel();
        if seed.len() != root_numel {
            return Err(AutogradError::SeedShapeMismatch {
                node: root,
                expected: root_numel,
                actual: seed.len(),
            });
        }

        let reachable = self.compute_reachable(root)?;
        let mut pending = self.compute_dependencies(&reachable);

        let mut grads: Vec<Option<Vec<f64>>> = vec![None; self.nodes.len()];
        grads[root.0] = Some(seed);

        let mut queue = ReadyQueue::default();
        queue.push(root);
        let mut steps = Vec::with_capacity(self.nodes.len());
        let mut execution_order = Vec::with_capacity(self.nodes.len());

        while let Some(node_id) = queue.pop() {
            execution_order.push(node_id);
            let node = &self.nodes[node_id.0];
            let incoming = grads[node_id.0]
                .clone()
                .unwrap_or_else(|| vec![0.0; node.tensor.numel()]);

            match &node.op {
                NodeOp::Leaf => {
                    if node.requires_grad {
                        steps.push(BackwardStep {
                            node: node_id,
                            rule: "leaf",
                        });
                    }
                }
                NodeOp::Add { lhs, rhs } => {
                    accumulate(&mut grads, *lhs, &incoming);
                    accumulate(&mut grads, *rhs, &incoming);
                    Self::complete_dependency(&mut pending, *lhs, &mut queue)?;
                    Self::complete_dependency(&mut pending, *rhs, &mut queue)?;
                    steps.push(BackwardStep {
                        node: node_id,
                        rule: "d(a+b)/da=1; d(a+b)/db=1",
                    });
                }
                NodeOp::Matmul { lhs, rhs, plan } => {
                    let (grad_lhs, grad_rhs) = matmul_backward_contiguous_f64(
                        self.nodes[lhs.0].tensor.values(),
                        self.nodes[rhs.0].tensor.values(),
                        &incoming,
                        plan,
                        node.tensor.dtype(),
                    )?;
                    accumulate(&mut grads, *lhs, &grad_lhs);
                    accumulate(&mut grads, *rhs, &grad_rhs);
                    Self::complete_dependency(&mut pending, *lhs, &mut queue)?;
                    Self::complete_dependency(&mut pending, *rhs, &mut queue)?;
                    steps.push(BackwardStep {
                        node: node_id,
                        rule: "d(a@b)/da=g@b^T; d(a@b)/db=a^T@g",
                    });
                }
            }
        }

        let mut gradients = Vec::with_capacity(self.nodes.len());
        for (node, grad) in self.nodes.iter().zip(grads) {
            let gradient = match grad {
                Some(values) if node.requires_grad => Some(DenseTensor::from_vec(
                    values,
                    node.tensor.shape().to_vec(),
                    node.tensor.dtype(),
                )?),
                _ => None,
            };
            gradients.push(gradient);
        }

        tracing::debug!(
            root = root.0,
            steps = steps.len(),
            queue_pops = queue.pops,
            "reference backward complete"
        );

        Ok(BackwardReport {
            gradients,
            steps,
            telemetry: SchedulerTelemetry {
                execution_order,
                queue_pushes: queue.pushes,
                queue_pops: queue.pops,
                max_queue_len: queue.max_len,
                dependency_snapshot: pending,
            },
        })
    }

    fn compute_reachable(&self, root: NodeId) -> Result<Vec<bool>, AutogradError> {
        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let entry = reachable
                .get_mut(node.0)
                .ok_or(AutogradError::UnknownNode(node))?;
            if *entry {
                continue;
            }
            *entry = true;
            if let Some((lhs, rhs)) = self.nodes[node.0].op.inputs() {
                stack.push(lhs);
                stack.push(rhs);
            }
        }
        Ok(reachable)
    }

    fn compute_dependencies(&self, reachable: &[bool]) -> Vec<usize> {
        let mut pending = vec![0usize; self.nodes.len()];
        for (node, _) in self
            .nodes
            .iter()
            .zip(reachable)
            .filter(|(_, reachable)| **reachable)
        {
            if let Some((lhs, rhs)) = node.op.inputs() {
                pending[lhs.0] += 1;
                pending[rhs.0] += 1;
            }
        }
        pending
    }

    fn complete_dependency(
        pending: &mut [usize],
        node: NodeId,
        queue: &mut ReadyQueue,
    ) -> Result<(), AutogradError> {
        if pending[node.0] == 0 {
            return Err(AutogradError::DependencyUnderflow { node });
        }
        pending[node.0] -= 1;
        if pending[node.0] == 0 {
            queue.push(node);
        }
        Ok(())
    }

    fn node(&self, id: NodeId) -> Result<&Node, AutogradError> {
        self.nodes.get(id.0).ok_or(AutogradError::UnknownNode(id))
    }
}

fn accumulate(grads: &mut [Option<Vec<f64>>], node: NodeId, contribution: &[f64]) {
    match &mut grads[node.0] {
        Some(existing) => {
            for (slot, value) in existing.iter_mut().zip(contribution) {
                *slot += value;
            }
        }
        slot @ None => *slot = Some(contribution.to_vec()),
    }
}
