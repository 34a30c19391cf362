use tc_builder::Instruction;
use tc_device::{Arch, Target};

use crate::CompilationError;

/// Edge of a square cache tile of the host GEMM.
const HOST_TILE: usize = 32;

/// Strided read-only view of one matrix inside a flat buffer. Transposes are
/// expressed by swapping strides rather than copying.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatrixView<'a> {
    data: &'a [f32],
    offset: usize,
    row_stride: usize,
    col_stride: usize,
}

impl<'a> MatrixView<'a> {
    pub(crate) fn row_major(data: &'a [f32], offset: usize, cols: usize) -> Self {
        Self {
            data,
            offset,
            row_stride: cols,
            col_stride: 1,
        }
    }

    /// View of the transpose of a row-major matrix with `cols` columns.
    pub(crate) fn transposed(data: &'a [f32], offset: usize, cols: usize) -> Self {
        Self {
            data,
            offset,
            row_stride: 1,
            col_stride: cols,
        }
    }

    #[inline]
    pub(crate) fn at(&self, row: usize, col: usize) -> f32 {
        self.data[self.offset + row * self.row_stride + col * self.col_stride]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GemmDims {
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

/// Kernel backend an executable was lowered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Host,
    #[cfg(feature = "nvgpu")]
    Simt,
}

impl Backend {
    pub fn for_target(target: Target) -> Result<Self, CompilationError> {
        match target.arch {
            Arch::X86 => Ok(Self::Host),
            #[cfg(feature = "nvgpu")]
            Arch::NvGpu => Ok(Self::Simt),
            #[cfg(not(feature = "nvgpu"))]
            Arch::NvGpu => Err(CompilationError::UnsupportedTarget { target }),
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            #[cfg(feature = "nvgpu")]
            Self::Simt => "simt",
        }
    }

    /// Kernel symbol an instruction lowers to on this backend.
    pub(crate) fn describe(self, instruction: &Instruction, numel: usize) -> String {
        match (self, instruction) {
            (Self::Host, Instruction::Matmul { plan, .. }) => format!(
                "host::gemm_tiled_f32<m={},k={},n={},tile={HOST_TILE}> x{}",
                plan.m(),
                plan.k(),
                plan.n(),
                plan.batch_count()
            ),
            (Self::Host, Instruction::Add { .. }) => format!("host::add_f32<len={numel}>"),
            #[cfg(feature = "nvgpu")]
            (Self::Simt, Instruction::Matmul { plan, .. }) => format!(
                "simt::matmul_f32<{}> x{}",
                crate::simt::LaunchConfig::for_matrix(plan.m(), plan.n()),
                plan.batch_count()
            ),
            #[cfg(feature = "nvgpu")]
            (Self::Simt, Instruction::Add { .. }) => format!(
                "simt::add_f32<{}>",
                crate::simt::LaunchConfig::for_elements(numel)
            ),
        }
    }

    /// `out (+)= a @ b` for one `m x k` by `k x n` product; `out` is a
    /// contiguous `m x n` slice.
    pub(crate) fn gemm(
        self,
        dims: GemmDims,
        a: MatrixView<'_>,
        b: MatrixView<'_>,
        out: &mut [f32],
        accumulate: bool,
    ) {
        match self {
            Self::Host => gemm_tiled(dims, a, b, out, accumulate),
            #[cfg(feature = "nvgpu")]
            Self::Simt => crate::simt::gemm(dims, a, b, out, accumulate),
        }
    }

    pub(crate) fn add(self, lhs: &[f32], rhs: &[f32], out: &mut [f32]) {
        match self {
            Self::Host => {
                for ((slot, l), r) in out.iter_mut().zip(lhs).zip(rhs) {
                    *slot = l + r;
                }
            }
            #[cfg(feature = "nvgpu")]
            Self::Simt => crate::simt::add(lhs, rhs, out),
        }
    }
}

fn gemm_tiled(dims: GemmDims, a: MatrixView<'_>, b: MatrixView<'_>, out: &mut [f32], accumulate: bool) {
    let GemmDims { m, k, n } = dims;
    if !accumulate {
        out[..m * n].fill(0.0);
    }
    for i0 in (0..m).step_by(HOST_TILE) {
        let i_end = (i0 + HOST_TILE).min(m);
        for p0 in (0..k).step_by(HOST_TILE) {
            let p_end = (p0 + HOST_TILE).min(k);
            for j0 in (0..n).step_by(HOST_TILE) {
                let j_end = (j0 + HOST_TILE).min(n);
                for i in i0..i_end {
                    let row = &mut out[i * n..(i + 1) * n];
                    for p in p0..p_end {
                        let a_ip = a.at(i, p);
                        for (j, slot) in row.iter_mut().enumerate().take(j_end).skip(j0) {
                            *slot += a_ip * b.at(p, j);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{Backend, GemmDims, MatrixView};

    fn naive(m: usize, k: usize, n: usize, a: &[f32], b: &[f32]) -> Vec<f64> {
        let mut out = vec![0.0f64; m * n];
        for i in 0..m {
            for j in 0..n {
                for p in 0..k {
                    out[i * n + j] += f64::from(a[i * k + p]) * f64::from(b[p * n + j]);
                }
            }
        }
        out
    }

    #[test]
    fn transposed_view_reads_columns() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let view = MatrixView::transposed(&data, 0, 3);
        assert_eq!(view.at(0, 1), 4.0);
        assert_eq!(view.at(2, 0), 3.0);
    }

    #[test]
    fn host_gemm_accumulates_when_asked() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 0.0, 0.0, 1.0];
        let dims = GemmDims { m: 2, k: 2, n: 2 };
        let mut out = vec![10.0; 4];
        Backend::Host.gemm(
            dims,
            MatrixView::row_major(&a, 0, 2),
            MatrixView::row_major(&b, 0, 2),
            &mut out,
            true,
        );
        assert_eq!(out, vec![11.0, 12.0, 13.0, 14.0]);
        Backend::Host.gemm(
            dims,
            MatrixView::row_major(&a, 0, 2),
            MatrixView::row_major(&b, 0, 2),
            &mut out,
            false,
        );
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    proptest! {
        #[test]
        fn host_gemm_tracks_f64_reference(
            m in 1usize..40,
            k in 1usize..40,
            n in 1usize..40,
            seed in any::<u32>(),
        ) {
            let value = |i: usize| ((seed as usize + i * 7919) % 1000) as f32 / 1000.0;
            let a: Vec<f32> = (0..m * k).map(value).collect();
            let b: Vec<f32> = (0..k * n).map(|i| value(i + 13)).collect();
            let mut out = vec![0.0f32; m * n];
            Backend::Host.gemm(
                GemmDims { m, k, n },
                MatrixView::row_major(&a, 0, k),
                MatrixView::row_major(&b, 0, n),
                &mut out,
                false,
            );
            let expected = naive(m, k, n, &a, &b);
            for (got, want) in out.iter().zip(&expected) {
                prop_assert!((f64::from(*got) - want).abs() <= 1e-5 + 1e-5 * want.abs());
            }
        }
    }
}
