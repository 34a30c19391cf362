#![forbid(unsafe_code)]

//! Eager reference kernels. Accumulation is carried out in f64 and every
//! produced element is rounded once to the operand dtype.

use tc_core::{DType, MatmulPlan, ShapeError, TensorMeta, ensure_same_shape};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("dtype mismatch: lhs={lhs}, rhs={rhs}")]
    DTypeMismatch { lhs: DType, rhs: DType },
    #[error("unsupported non-contiguous layout on {side}")]
    UnsupportedLayout { side: &'static str },
    #[error("insufficient storage on {side}: needed={needed}, available={available}")]
    InsufficientStorage {
        side: &'static str,
        needed: usize,
        available: usize,
    },
}

fn ensure_same_dtype(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<DType, KernelError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(KernelError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }
    Ok(lhs.dtype())
}

fn ensure_operand(buffer: &[f64], meta: &TensorMeta, side: &'static str) -> Result<(), KernelError> {
    if !meta.is_contiguous() {
        return Err(KernelError::UnsupportedLayout { side });
    }
    ensure_len(buffer, meta.numel(), side)
}

fn ensure_len(buffer: &[f64], needed: usize, side: &'static str) -> Result<(), KernelError> {
    if buffer.len() < needed {
        return Err(KernelError::InsufficientStorage {
            side,
            needed,
            available: buffer.len(),
        });
    }
    Ok(())
}

pub fn add_contiguous_f64(
    lhs: &[f64],
    rhs: &[f64],
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
) -> Result<Vec<f64>, KernelError> {
    let dtype = ensure_same_dtype(lhs_meta, rhs_meta)?;
    ensure_same_shape(lhs_meta.shape(), rhs_meta.shape())?;
    ensure_operand(lhs, lhs_meta, "lhs")?;
    ensure_operand(rhs, rhs_meta, "rhs")?;

    let numel = lhs_meta.numel();
    Ok(lhs[..numel]
        .iter()
        .zip(&rhs[..numel])
        .map(|(left, right)| dtype.round(left + right))
        .collect())
}

/// Forward `lhs @ rhs`. Returns the row-major output together with the plan
/// that resolved its shape.
pub fn matmul_contiguous_f64(
    lhs: &[f64],
    rhs: &[f64],
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
) -> Result<(Vec<f64>, MatmulPlan), KernelError> {
    let dtype = ensure_same_dtype(lhs_meta, rhs_meta)?;
    ensure_operand(lhs, lhs_meta, "lhs")?;
    ensure_operand(rhs, rhs_meta, "rhs")?;
    let plan = MatmulPlan::new(lhs_meta.shape(), rhs_meta.shape())?;

    let (m, k, n) = (plan.m(), plan.k(), plan.n());
    let mut out = vec![0.0; plan.output_numel()];
    for batch in 0..plan.batch_count() {
        let a = plan.lhs_offset(batch);
        let b = plan.rhs_offset(batch);
        let o = plan.output_offset(batch);
        for row in 0..m {
            for col in 0..n {
                let mut acc = 0.0f64;
                for inner in 0..k {
                    acc += lhs[a + row * k + inner] * rhs[b + inner * n + col];
                }
                out[o + row * n + col] = dtype.round(acc);
            }
        }
    }
    Ok((out, plan))
}

/// Gradients of `lhs @ rhs` given the upstream gradient of the output:
/// `d_lhs = grad @ rhs^T` and `d_rhs = lhs^T @ grad`, each summed over the
/// batch elements that reused a broadcast operand.
pub fn matmul_backward_contiguous_f64(
    lhs: &[f64],
    rhs: &[f64],
    grad_out: &[f64],
    plan: &MatmulPlan,
    dtype: DType,
) -> Result<(Vec<f64>, Vec<f64>), KernelError> {
    ensure_len(lhs, plan.lhs_numel(), "lhs")?;
    ensure_len(rhs, plan.rhs_numel(), "rhs")?;
    ensure_len(grad_out, plan.output_numel(), "grad_out")?;

    let (m, k, n) = (plan.m(), plan.k(), plan.n());
    let mut grad_lhs = vec![0.0; plan.lhs_numel()];
    let mut grad_rhs = vec![0.0; plan.rhs_numel()];
    for batch in 0..plan.batch_count() {
        let a = plan.lhs_offset(batch);
        let b = plan.rhs_offset(batch);
        let o = plan.output_offset(batch);
        for row in 0..m {
            for inner in 0..k {
                let mut acc = 0.0f64;
                for col in 0..n {
                    acc += grad_out[o + row * n + col] * rhs[b + inner * n + col];
                }
                grad_lhs[a + row * k + inner] += acc;
            }
        }
        for inner in 0..k {
            for col in 0..n {
                let mut acc = 0.0f64;
                for row in 0..m {
                    acc += lhs[a + row * k + inner] * grad_out[o + row * n + col];
                }
                grad_rhs[b + inner * n + col] += acc;
            }
        }
    }

    for value in grad_lhs.iter_mut().chain(grad_rhs.iter_mut()) {
        *value = dtype.round(*value);
    }
    Ok((grad_lhs, grad_rhs))
}
