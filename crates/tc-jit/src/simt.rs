//! Virtual SIMT device. Kernels are written per thread; a launch runs every
//! block of the grid in parallel on the rayon pool and every thread of a
//! block sequentially. Each thread yields at most one `(index, value)`
//! write, applied after all blocks finish, so results never depend on block
//! scheduling.

use std::fmt;

use rayon::prelude::*;

use crate::backend::{GemmDims, MatrixView};

pub const BLOCK_DIM: usize = 16;
const THREADS_PER_BLOCK: usize = BLOCK_DIM * BLOCK_DIM;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Dim3 {
    const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    const fn volume(self) -> usize {
        self.x * self.y * self.z
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: Dim3,
    pub block: Dim3,
}

impl LaunchConfig {
    /// One thread per element of a `rows x cols` output.
    #[must_use]
    pub fn for_matrix(rows: usize, cols: usize) -> Self {
        Self {
            grid: Dim3::new(cols.div_ceil(BLOCK_DIM), rows.div_ceil(BLOCK_DIM), 1),
            block: Dim3::new(BLOCK_DIM, BLOCK_DIM, 1),
        }
    }

    #[must_use]
    pub fn for_elements(len: usize) -> Self {
        Self {
            grid: Dim3::new(len.div_ceil(THREADS_PER_BLOCK), 1, 1),
            block: Dim3::new(BLOCK_DIM, BLOCK_DIM, 1),
        }
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.grid.volume()
    }

    fn block_coord(&self, linear: usize) -> Dim3 {
        let x = linear % self.grid.x;
        let y = (linear / self.grid.x) % self.grid.y;
        let z = linear / (self.grid.x * self.grid.y);
        Dim3::new(x, y, z)
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grid={},block={}", self.grid, self.block)
    }
}

#[derive(Debug, Clone, Copy)]
struct ThreadCoord {
    block: Dim3,
    thread: Dim3,
}

fn launch<F>(config: LaunchConfig, out: &mut [f32], accumulate: bool, kernel: F)
where
    F: Fn(ThreadCoord) -> Option<(usize, f32)> + Sync,
{
    let writes: Vec<Vec<(usize, f32)>> = (0..config.block_count())
        .into_par_iter()
        .map(|linear| {
            let block = config.block_coord(linear);
            let mut block_writes = Vec::with_capacity(config.block.volume());
            for tz in 0..config.block.z {
                for ty in 0..config.block.y {
                    for tx in 0..config.block.x {
                        let coord = ThreadCoord {
                            block,
                            thread: Dim3::new(tx, ty, tz),
                        };
                        if let Some(write) = kernel(coord) {
                            block_writes.push(write);
                        }
                    }
                }
            }
            block_writes
        })
        .collect();

    for (index, value) in writes.into_iter().flatten() {
        if accumulate {
            out[index] += value;
        } else {
            out[index] = value;
        }
    }
}

pub(crate) fn gemm(
    dims: GemmDims,
    a: MatrixView<'_>,
    b: MatrixView<'_>,
    out: &mut [f32],
    accumulate: bool,
) {
    let GemmDims { m, k, n } = dims;
    let config = LaunchConfig::for_matrix(m, n);
    tracing::trace!(%config, m, k, n, "simt matmul launch");
    launch(config, out, accumulate, |coord| {
        let row = coord.block.y * config.block.y + coord.thread.y;
        let col = coord.block.x * config.block.x + coord.thread.x;
        if row >= m || col >= n {
            return None;
        }
        let mut acc = 0.0f32;
        for p in 0..k {
            acc += a.at(row, p) * b.at(p, col);
        }
        Some((row * n + col, acc))
    });
}

pub(crate) fn add(lhs: &[f32], rhs: &[f32], out: &mut [f32]) {
    let len = out.len();
    let config = LaunchConfig::for_elements(len);
    launch(config, out, false, |coord| {
        let index = coord.block.x * THREADS_PER_BLOCK
            + coord.thread.y * config.block.x
            + coord.thread.x;
        (index < len).then(|| (index, lhs[index] + rhs[index]))
    });
}

#[cfg(test)]
mod tests {
    use super::{BLOCK_DIM, Dim3, LaunchConfig, add, gemm};
    use crate::backend::{GemmDims, MatrixView};

    #[test]
    fn launch_geometry_covers_output() {
        let config = LaunchConfig::for_matrix(4, 32);
        assert_eq!(config.grid, Dim3 { x: 2, y: 1, z: 1 });
        assert_eq!(config.block, Dim3 { x: BLOCK_DIM, y: BLOCK_DIM, z: 1 });
        assert_eq!(config.block_count(), 2);
        assert_eq!(LaunchConfig::for_elements(257).block_count(), 2);
        assert_eq!(config.to_string(), "grid=(2,1,1),block=(16,16,1)");
    }

    #[test]
    fn simt_gemm_matches_hand_values_across_blocks() {
        let (m, k, n) = (17, 2, 18);
        let a: Vec<f32> = (0..m * k).map(|i| (i % 5) as f32).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 3) as f32).collect();
        let mut out = vec![0.0f32; m * n];
        gemm(
            GemmDims { m, k, n },
            MatrixView::row_major(&a, 0, k),
            MatrixView::row_major(&b, 0, n),
            &mut out,
            false,
        );
        for i in 0..m {
            for j in 0..n {
                let expected: f32 = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
                assert_eq!(out[i * n + j], expected, "mismatch at ({i}, {j})");
            }
        }
    }

    #[test]
    fn simt_add_handles_partial_block() {
        let lhs: Vec<f32> = (0..300).map(|i| i as f32).collect();
        let rhs = vec![0.5f32; 300];
        let mut out = vec![0.0f32; 300];
        add(&lhs, &rhs, &mut out);
        assert_eq!(out[0], 0.5);
        assert_eq!(out[299], 299.5);
    }
}
