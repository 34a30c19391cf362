#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }

    /// Rounds `value` to the nearest value representable in this dtype.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn round(self, value: f64) -> f64 {
        match self {
            Self::F32 => f64::from(value as f32),
            Self::F64 => value,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    NvGpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::NvGpu => f.write_str("nvgpu"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorMetaError {
    #[error("shape rank {rank} does not match strides rank {strides}")]
    RankStrideMismatch { rank: usize, strides: usize },
    #[error("element count overflow for shape {shape:?}")]
    NumelOverflow { shape: Vec<usize> },
    #[error("index rank mismatch expected={expected}, actual={actual}")]
    IndexRankMismatch { expected: usize, actual: usize },
    #[error("index out of bounds at dim={dim}: index={index}, size={size}")]
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            dtype,
            device,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = Self {
            shape,
            strides,
            dtype,
            device,
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn validate(&self) -> Result<(), TensorMetaError> {
        if self.shape.len() != self.strides.len() {
            return Err(TensorMetaError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }
        checked_numel(&self.shape)?;
        Ok(())
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }
        let mut expected = 1usize;
        for (size, stride) in self.shape.iter().zip(&self.strides).rev() {
            // singleton dims never move the cursor
            if *size == 1 {
                continue;
            }
            if *stride != expected {
                return false;
            }
            let Some(next) = expected.checked_mul(*size) else {
                return false;
            };
            expected = next;
        }
        true
    }

    pub fn storage_index_for(&self, index: &[usize]) -> Result<usize, TensorMetaError> {
        if index.len() != self.shape.len() {
            return Err(TensorMetaError::IndexRankMismatch {
                expected: self.shape.len(),
                actual: index.len(),
            });
        }
        let mut linear = 0usize;
        for (dim, ((idx, size), stride)) in index
            .iter()
            .zip(&self.shape)
            .zip(&self.strides)
            .enumerate()
        {
            if idx >= size {
                return Err(TensorMetaError::IndexOutOfBounds {
                    dim,
                    index: *idx,
                    size: *size,
                });
            }
            linear += idx * stride;
        }
        Ok(linear)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenseTensorError {
    #[error("tensor of shape {shape:?} needs {expected} values, got {actual}")]
    ValueCountMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Meta(#[from] TensorMetaError),
}

/// Contiguous row-major tensor. Values are held as f64 and rounded to the
/// tensor's dtype on construction, so an `F32` tensor only ever holds
/// f32-representable values.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    id: u64,
    meta: TensorMeta,
    storage: Vec<f64>,
}

impl DenseTensor {
    pub fn from_vec(
        values: Vec<f64>,
        shape: Vec<usize>,
        dtype: DType,
    ) -> Result<Self, DenseTensorError> {
        let expected = checked_numel(&shape)?;
        if values.len() != expected {
            return Err(DenseTensorError::ValueCountMismatch {
                shape,
                expected,
                actual: values.len(),
            });
        }
        let storage = match dtype {
            DType::F64 => values,
            DType::F32 => values.into_iter().map(|value| dtype.round(value)).collect(),
        };
        Ok(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            meta: TensorMeta::from_shape(shape, dtype, Device::Cpu),
            storage,
        })
    }

    pub fn from_f32(values: &[f32], shape: Vec<usize>) -> Result<Self, DenseTensorError> {
        Self::from_vec(
            values.iter().copied().map(f64::from).collect(),
            shape,
            DType::F32,
        )
    }

    pub fn full(shape: Vec<usize>, value: f64, dtype: DType) -> Result<Self, DenseTensorError> {
        let numel = checked_numel(&shape)?;
        Self::from_vec(vec![value; numel], shape, dtype)
    }

    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Result<Self, DenseTensorError> {
        Self::full(shape, 0.0, dtype)
    }

    #[must_use]
    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            meta: TensorMeta::from_shape(Vec::new(), dtype, Device::Cpu),
            storage: vec![dtype.round(value)],
        }
    }

    #[must_use]
    pub fn on_device(mut self, device: Device) -> Self {
        self.meta = self.meta.with_device(device);
        self
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.meta.device()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.meta.rank()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.storage
    }

    #[must_use]
    pub fn into_values(self) -> Vec<f64> {
        self.storage
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.storage.iter().map(|value| *value as f32).collect()
    }

    pub fn value_at(&self, index: &[usize]) -> Result<f64, TensorMetaError> {
        let linear = self.meta.storage_index_for(index)?;
        Ok(self.storage[linear])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("matmul {side} operand must have rank >= 1, got a scalar")]
    ScalarOperand { side: &'static str },
    #[error(
        "matmul contraction mismatch: lhs {lhs:?} contracts over {lhs_k}, rhs {rhs:?} over {rhs_k}"
    )]
    ContractionMismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
        lhs_k: usize,
        rhs_k: usize,
    },
    #[error("batch dims not broadcastable at dim {dim}: lhs={lhs_dim}, rhs={rhs_dim}")]
    BatchBroadcast {
        dim: usize,
        lhs_dim: usize,
        rhs_dim: usize,
    },
    #[error("elementwise shapes differ: lhs={lhs:?}, rhs={rhs:?}")]
    ElementwiseMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
}

/// Resolved geometry of `lhs @ rhs` under conventional matmul broadcasting.
///
/// A 1-D lhs is treated as `[1, k]` and a 1-D rhs as `[k, 1]`; the promoted
/// dimension is dropped again from `output_shape`. Leading dimensions are
/// batch dimensions and broadcast right-aligned, a size-1 (or missing) batch
/// dimension repeating the same matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatmulPlan {
    lhs_shape: Vec<usize>,
    rhs_shape: Vec<usize>,
    batch_shape: Vec<usize>,
    m: usize,
    k: usize,
    n: usize,
    lhs_vector: bool,
    rhs_vector: bool,
    lhs_batch_strides: Vec<usize>,
    rhs_batch_strides: Vec<usize>,
    output_shape: Vec<usize>,
}

impl MatmulPlan {
    pub fn new(lhs: &[usize], rhs: &[usize]) -> Result<Self, ShapeError> {
        if lhs.is_empty() {
            return Err(ShapeError::ScalarOperand { side: "lhs" });
        }
        if rhs.is_empty() {
            return Err(ShapeError::ScalarOperand { side: "rhs" });
        }

        let lhs_vector = lhs.len() == 1;
        let rhs_vector = rhs.len() == 1;
        let (m, lhs_k, lhs_batch) = if lhs_vector {
            (1, lhs[0], &lhs[..0])
        } else {
            let rank = lhs.len();
            (lhs[rank - 2], lhs[rank - 1], &lhs[..rank - 2])
        };
        let (rhs_k, n, rhs_batch) = if rhs_vector {
            (rhs[0], 1, &rhs[..0])
        } else {
            let rank = rhs.len();
            (rhs[rank - 2], rhs[rank - 1], &rhs[..rank - 2])
        };

        if lhs_k != rhs_k {
            return Err(ShapeError::ContractionMismatch {
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
                lhs_k,
                rhs_k,
            });
        }

        let batch_rank = lhs_batch.len().max(rhs_batch.len());
        let mut batch_shape = Vec::with_capacity(batch_rank);
        for dim in 0..batch_rank {
            let lhs_dim = aligned_dim(lhs_batch, batch_rank, dim);
            let rhs_dim = aligned_dim(rhs_batch, batch_rank, dim);
            let size = if lhs_dim == rhs_dim || rhs_dim == 1 {
                lhs_dim
            } else if lhs_dim == 1 {
                rhs_dim
            } else {
                return Err(ShapeError::BatchBroadcast {
                    dim,
                    lhs_dim,
                    rhs_dim,
                });
            };
            batch_shape.push(size);
        }

        let mut output_shape = batch_shape.clone();
        if !lhs_vector {
            output_shape.push(m);
        }
        if !rhs_vector {
            output_shape.push(n);
        }

        Ok(Self {
            lhs_shape: lhs.to_vec(),
            rhs_shape: rhs.to_vec(),
            lhs_batch_strides: broadcast_batch_strides(lhs_batch, &batch_shape),
            rhs_batch_strides: broadcast_batch_strides(rhs_batch, &batch_shape),
            batch_shape,
            m,
            k: lhs_k,
            n,
            lhs_vector,
            rhs_vector,
            output_shape,
        })
    }

    #[must_use]
    pub fn lhs_shape(&self) -> &[usize] {
        &self.lhs_shape
    }

    #[must_use]
    pub fn rhs_shape(&self) -> &[usize] {
        &self.rhs_shape
    }

    #[must_use]
    pub fn batch_shape(&self) -> &[usize] {
        &self.batch_shape
    }

    #[must_use]
    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    #[must_use]
    pub fn m(&self) -> usize {
        self.m
    }

    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    #[must_use]
    pub fn n(&self) -> usize {
        self.n
    }

    #[must_use]
    pub fn lhs_is_vector(&self) -> bool {
        self.lhs_vector
    }

    #[must_use]
    pub fn rhs_is_vector(&self) -> bool {
        self.rhs_vector
    }

    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batch_shape.iter().product()
    }

    #[must_use]
    pub fn lhs_numel(&self) -> usize {
        self.lhs_shape.iter().product()
    }

    #[must_use]
    pub fn rhs_numel(&self) -> usize {
        self.rhs_shape.iter().product()
    }

    #[must_use]
    pub fn output_numel(&self) -> usize {
        self.batch_count() * self.m * self.n
    }

    /// Element offset of the lhs matrix used by flattened batch `batch`.
    #[must_use]
    pub fn lhs_offset(&self, batch: usize) -> usize {
        self.matrix_index(batch, &self.lhs_batch_strides) * self.m * self.k
    }

    /// Element offset of the rhs matrix used by flattened batch `batch`.
    #[must_use]
    pub fn rhs_offset(&self, batch: usize) -> usize {
        self.matrix_index(batch, &self.rhs_batch_strides) * self.k * self.n
    }

    #[must_use]
    pub fn output_offset(&self, batch: usize) -> usize {
        batch * self.m * self.n
    }

    fn matrix_index(&self, batch: usize, strides: &[usize]) -> usize {
        let mut remaining = batch;
        let mut index = 0usize;
        for (size, stride) in self.batch_shape.iter().zip(strides).rev() {
            index += (remaining % size) * stride;
            remaining /= size;
        }
        index
    }
}

impl fmt::Display for MatmulPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} x {:?} -> {:?} (batch={:?}, m={}, k={}, n={})",
            self.lhs_shape,
            self.rhs_shape,
            self.output_shape,
            self.batch_shape,
            self.m,
            self.k,
            self.n
        )
    }
}

pub fn ensure_same_shape(lhs: &[usize], rhs: &[usize]) -> Result<(), ShapeError> {
    if lhs != rhs {
        return Err(ShapeError::ElementwiseMismatch {
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        });
    }
    Ok(())
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for (stride, size) in strides.iter_mut().zip(shape).rev() {
        *stride = running;
        running = running.saturating_mul(*size);
    }
    strides
}

pub fn checked_numel(shape: &[usize]) -> Result<usize, TensorMetaError> {
    shape
        .iter()
        .try_fold(1usize, |acc, size| acc.checked_mul(*size))
        .ok_or_else(|| TensorMetaError::NumelOverflow {
            shape: shape.to_vec(),
        })
}

fn aligned_dim(batch: &[usize], rank: usize, dim: usize) -> usize {
    let offset = rank - batch.len();
    if dim < offset { 1 } else { batch[dim - offset] }
}

fn broadcast_batch_strides(source: &[usize], target: &[usize]) -> Vec<usize> {
    let source_strides = contiguous_strides(source);
    let offset = target.len() - source.len();
    (0..target.len())
        .map(|dim| {
            if dim < offset || source[dim - offset] == 1 {
                0
            } else {
                source_strides[dim - offset]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        DType, DenseTensor, DenseTensorError, Device, MatmulPlan, ShapeError, TensorMeta,
        TensorMetaError, contiguous_strides,
    };

    #[test]
    fn f32_round_drops_excess_precision() {
        let value = 0.1f64;
        let rounded = DType::F32.round(value);
        assert_ne!(rounded, value);
        assert_eq!(rounded, f64::from(0.1f32));
        assert_eq!(DType::F64.round(value), value);
    }

    #[test]
    fn shape_builds_contiguous_strides() {
        let meta = TensorMeta::from_shape(vec![2, 3, 4], DType::F32, Device::Cpu);
        assert_eq!(meta.strides(), &[12, 4, 1]);
        assert_eq!(meta.numel(), 24);
        assert!(meta.is_contiguous());
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn transposed_strides_are_not_contiguous() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![2, 3], vec![1, 2], DType::F32, Device::Cpu)
                .expect("meta should validate");
        assert!(!meta.is_contiguous());
    }

    #[test]
    fn rank_stride_mismatch_is_rejected() {
        let err = TensorMeta::from_shape_and_strides(vec![2, 3], vec![1], DType::F32, Device::Cpu)
            .expect_err("rank mismatch must fail");
        assert_eq!(
            err,
            TensorMetaError::RankStrideMismatch {
                rank: 2,
                strides: 1
            }
        );
    }

    #[test]
    fn index_rank_and_bounds_are_guarded() {
        let meta = TensorMeta::from_shape(vec![2, 3], DType::F32, Device::Cpu);
        assert_eq!(meta.storage_index_for(&[1, 2]).expect("in bounds"), 5);
        assert!(matches!(
            meta.storage_index_for(&[1]),
            Err(TensorMetaError::IndexRankMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert!(matches!(
            meta.storage_index_for(&[2, 0]),
            Err(TensorMetaError::IndexOutOfBounds {
                dim: 0,
                index: 2,
                size: 2
            })
        ));
    }

    #[test]
    fn dense_tensor_rejects_wrong_value_count() {
        let err = DenseTensor::from_vec(vec![1.0, 2.0, 3.0], vec![2, 2], DType::F32)
            .expect_err("value count mismatch must fail");
        assert!(matches!(
            err,
            DenseTensorError::ValueCountMismatch {
                expected: 4,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn dense_tensor_scalar_has_one_value_and_no_dims() {
        let scalar = DenseTensor::scalar(3.5, DType::F32);
        assert_eq!(scalar.rank(), 0);
        assert_eq!(scalar.numel(), 1);
        assert_eq!(scalar.value_at(&[]).expect("scalar index"), 3.5);
    }

    #[test]
    fn dense_tensor_ids_are_unique_and_device_is_retagged() {
        let a = DenseTensor::zeros(vec![2], DType::F32).expect("zeros");
        let b = DenseTensor::zeros(vec![2], DType::F32).expect("zeros");
        assert_ne!(a.id(), b.id());
        let moved = a.on_device(Device::NvGpu);
        assert_eq!(moved.device(), Device::NvGpu);
    }

    #[test]
    fn plan_matrix_matrix() {
        let plan = MatmulPlan::new(&[4, 16], &[16, 32]).expect("plan");
        assert_eq!(plan.output_shape(), &[4, 32]);
        assert_eq!((plan.m(), plan.k(), plan.n()), (4, 16, 32));
        assert_eq!(plan.batch_count(), 1);
    }

    #[test]
    fn plan_vector_vector_is_scalar() {
        let plan = MatmulPlan::new(&[16], &[16]).expect("plan");
        assert!(plan.output_shape().is_empty());
        assert_eq!(plan.output_numel(), 1);
        assert!(plan.lhs_is_vector() && plan.rhs_is_vector());
    }

    #[test]
    fn plan_vector_matrix_squeezes_promoted_dim() {
        let plan = MatmulPlan::new(&[16], &[16, 4]).expect("plan");
        assert_eq!(plan.output_shape(), &[4]);
        assert_eq!((plan.m(), plan.n()), (1, 4));

        let plan = MatmulPlan::new(&[4, 16], &[16]).expect("plan");
        assert_eq!(plan.output_shape(), &[4]);
        assert_eq!((plan.m(), plan.n()), (4, 1));
    }

    #[test]
    fn plan_batched_matches_leading_dims() {
        let plan = MatmulPlan::new(&[5, 4, 16], &[5, 16, 32]).expect("plan");
        assert_eq!(plan.output_shape(), &[5, 4, 32]);
        assert_eq!(plan.batch_count(), 5);
        assert_eq!(plan.lhs_offset(3), 3 * 4 * 16);
        assert_eq!(plan.rhs_offset(3), 3 * 16 * 32);
        assert_eq!(plan.output_offset(3), 3 * 4 * 32);
    }

    #[test]
    fn plan_broadcasts_batch_dims() {
        let plan = MatmulPlan::new(&[3, 1, 4, 16], &[2, 16, 8]).expect("plan");
        assert_eq!(plan.batch_shape(), &[3, 2]);
        assert_eq!(plan.output_shape(), &[3, 2, 4, 8]);
        // batch (1, 1): lhs repeats matrix 1, rhs uses matrix 1
        assert_eq!(plan.lhs_offset(3), 4 * 16);
        assert_eq!(plan.rhs_offset(3), 16 * 8);
        // batch (2, 0)
        assert_eq!(plan.lhs_offset(4), 2 * 4 * 16);
        assert_eq!(plan.rhs_offset(4), 0);
    }

    #[test]
    fn plan_broadcasts_matrix_against_batch() {
        let plan = MatmulPlan::new(&[4, 16], &[5, 16, 32]).expect("plan");
        assert_eq!(plan.output_shape(), &[5, 4, 32]);
        assert_eq!(plan.lhs_offset(4), 0);
        assert_eq!(plan.rhs_offset(4), 4 * 16 * 32);
    }

    #[test]
    fn plan_rejects_contraction_mismatch() {
        let err = MatmulPlan::new(&[4, 16], &[15, 32]).expect_err("k mismatch must fail");
        assert!(matches!(
            err,
            ShapeError::ContractionMismatch {
                lhs_k: 16,
                rhs_k: 15,
                ..
            }
        ));
    }

    #[test]
    fn plan_rejects_incompatible_batches_and_scalars() {
        let err = MatmulPlan::new(&[3, 4, 16], &[2, 16, 8]).expect_err("batch mismatch");
        assert!(matches!(
            err,
            ShapeError::BatchBroadcast {
                dim: 0,
                lhs_dim: 3,
                rhs_dim: 2
            }
        ));
        assert_eq!(
            MatmulPlan::new(&[], &[3]).expect_err("scalar lhs"),
            ShapeError::ScalarOperand { side: "lhs" }
        );
    }

    proptest! {
        #[test]
        fn prop_plan_offsets_stay_in_bounds(
            lhs_batch in prop::collection::vec(1usize..=3, 0..=2),
            rhs_batch in prop::collection::vec(1usize..=3, 0..=2),
            m in 1usize..=4,
            k in 1usize..=4,
            n in 1usize..=4,
        ) {
            let lhs_batch = lhs_batch.iter().map(|dim| if *dim == 2 { 1 } else { *dim }).collect::<Vec<_>>();
            let mut lhs = lhs_batch.clone();
            lhs.extend([m, k]);
            let mut rhs = rhs_batch.clone();
            rhs.extend([k, n]);

            if let Ok(plan) = MatmulPlan::new(&lhs, &rhs) {
                prop_assert_eq!(plan.output_numel(), plan.output_shape().iter().product::<usize>());
                for batch in 0..plan.batch_count() {
                    prop_assert!(plan.lhs_offset(batch) + m * k <= plan.lhs_numel());
                    prop_assert!(plan.rhs_offset(batch) + k * n <= plan.rhs_numel());
                }
            }
        }

        #[test]
        fn prop_contiguous_strides_end_in_one(shape in prop::collection::vec(1usize..=5, 1..=4)) {
            let strides = contiguous_strides(&shape);
            prop_assert_eq!(strides.len(), shape.len());
            prop_assert_eq!(strides.last().copied(), Some(1));
            prop_assert_eq!(strides[0] * shape[0], shape.iter().product::<usize>());
        }
    }
}
