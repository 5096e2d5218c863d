//! GEMM execution over implicit views.
//!
//! Two consumers of [`GemmViews`]:
//!
//! - [`run_implicit_gemm`]: tiled kernel. Each workgroup owns one
//!   `TILE x TILE` block of C (256 "threads", one element each), gathers the
//!   A/B columns it needs through the descriptors, accumulates in `f32` in
//!   GemmK order and skips padded operands. With the reduction orders chosen
//!   in [`super::make_gemm_views`] this is bit-identical to the naive kernels.
//! - [`run_materialized_gemm`]: im2col-style reference. A and B are written
//!   out densely (padding as 0) and multiplied with `ndarray`. Agrees with the
//!   naive kernels within tolerance only.

use std::fmt;

use clap::ValueEnum;
use ndarray::linalg::general_mat_mul;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{make_gemm_views, ConvTensors, GemmOperandView, GemmViews};
use crate::dtype::Element;
use crate::error::{ConvError, Result};
use crate::problem::ConvProblem;

/// Edge of the square output tile owned by one workgroup.
pub const TILE: usize = 16;

/// Which GEMM consumer runs the views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GemmBackend {
    /// Tiled kernel reading through the descriptors.
    #[default]
    Implicit,
    /// Dense A/B copies multiplied by ndarray.
    Materialized,
}

impl GemmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implicit => "implicit",
            Self::Materialized => "materialized",
        }
    }

    /// Run `tensors` with this backend.
    pub fn run<E: Element>(&self, problem: &ConvProblem, tensors: ConvTensors<'_, E>) -> Result<()> {
        match self {
            Self::Implicit => run_implicit_gemm(problem, tensors),
            Self::Materialized => run_materialized_gemm(problem, tensors),
        }
    }
}

impl fmt::Display for GemmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Implicit (tiled) ─────────────────────────────────────────────────────────

/// Gather `tile` columns of `view` starting at `col0`, every GemmK row.
/// `None` marks padding.
fn load_tile<E: Element>(view: &GemmOperandView, src: &[E], col0: usize, width: usize) -> Vec<Option<f32>> {
    let mut tile = Vec::with_capacity(view.rows * width);
    for row in 0..view.rows {
        for col in col0..col0 + width {
            tile.push(view.offset(row, col).map(|off| src[off].to_f32()));
        }
    }
    tile
}

/// One workgroup: compute the C tile at (`tile_m`, `tile_n`).
fn compute_tile<E: Element>(
    views: &GemmViews,
    a_src: &[E],
    b_src: &[E],
    tile_m: usize,
    tile_n: usize,
) -> Result<Vec<(usize, E)>> {
    let (m0, n0) = (tile_m * TILE, tile_n * TILE);
    let width_m = TILE.min(views.dims.m - m0);
    let width_n = TILE.min(views.dims.n - n0);
    let a_tile = load_tile(&views.a, a_src, m0, width_m);
    let b_tile = load_tile(&views.b, b_src, n0, width_n);

    let mut out = Vec::with_capacity(width_m * width_n);
    for thread in 0..TILE * TILE {
        let (tm, tn) = (thread / TILE, thread % TILE);
        if tm >= width_m || tn >= width_n {
            continue;
        }
        let (m, n) = (m0 + tm, n0 + tn);
        let dst = views.c.offset(m, n).ok_or(ConvError::PaddedOutput {
            view: views.c.role.as_str(),
            row: m,
            col: n,
        })?;

        let mut acc = 0.0f32;
        for k in 0..views.dims.k {
            if let (Some(a), Some(b)) = (a_tile[k * width_m + tm], b_tile[k * width_n + tn]) {
                acc += a * b;
            }
        }
        out.push((dst, E::from_f32(acc)));
    }
    Ok(out)
}

/// Run one direction as an implicit GEMM per group.
pub fn run_implicit_gemm<E: Element>(problem: &ConvProblem, mut tensors: ConvTensors<'_, E>) -> Result<()> {
    problem.validate()?;
    tensors.check_lengths(problem)?;
    let direction = tensors.direction();
    let (a_src, b_src, c_dst) = tensors.gemm_operands();

    for group in 0..problem.group {
        let views = make_gemm_views(problem, direction, group)?;
        let tiles_m = views.dims.m.div_ceil(TILE);
        let tiles_n = views.dims.n.div_ceil(TILE);
        log::debug!(
            "implicit gemm {direction} group {group}: grid {}x{} tiles, block {}",
            tiles_m,
            tiles_n,
            TILE * TILE
        );

        let results = (0..tiles_m * tiles_n)
            .into_par_iter()
            .map(|t| compute_tile(&views, a_src, b_src, t / tiles_n, t % tiles_n))
            .collect::<Result<Vec<_>>>()?;

        for (dst, value) in results.into_iter().flatten() {
            c_dst[dst] = value;
        }
    }
    Ok(())
}

// ── Materialized (ndarray) ───────────────────────────────────────────────────

/// Dense copy of a view, padding written as 0.
fn materialize<E: Element>(view: &GemmOperandView, src: &[E]) -> Array2<f32> {
    Array2::from_shape_fn((view.rows, view.cols), |(r, c)| {
        view.offset(r, c).map_or(0.0, |off| src[off].to_f32())
    })
}

/// Run one direction by materializing A and B and calling `general_mat_mul`.
pub fn run_materialized_gemm<E: Element>(problem: &ConvProblem, mut tensors: ConvTensors<'_, E>) -> Result<()> {
    problem.validate()?;
    tensors.check_lengths(problem)?;
    let direction = tensors.direction();
    let (a_src, b_src, c_dst) = tensors.gemm_operands();

    for group in 0..problem.group {
        let views = make_gemm_views(problem, direction, group)?;
        let a = materialize(&views.a, a_src);
        let b = materialize(&views.b, b_src);
        let mut c = Array2::<f32>::zeros((views.dims.m, views.dims.n));
        general_mat_mul(1.0, &a.t(), &b, 0.0, &mut c);
        log::debug!(
            "materialized gemm {direction} group {group}: a {:?} b {:?}",
            a.dim(),
            b.dim()
        );

        for ((m, n), &value) in c.indexed_iter() {
            let dst = views.c.offset(m, n).ok_or(ConvError::PaddedOutput {
                view: views.c.role.as_str(),
                row: m,
                col: n,
            })?;
            c_dst[dst] = E::from_f32(value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::Direction;

    #[test]
    fn one_by_one_conv_is_a_plain_matmul() {
        // 1x1 filter: output[k][p] = Σ_c weight[k][c] * input[c][p]
        let p = ConvProblem::new_2d(1, 2, 2, [1, 3], [1, 1]);
        let input = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let weight = [1.0f32, 0.0, 1.0, 1.0];
        let mut output = [0.0f32; 6];
        run_implicit_gemm(
            &p,
            ConvTensors::Forward {
                input: &input,
                weight: &weight,
                output: &mut output,
            },
        )
        .unwrap();
        assert_eq!(output, [1.0, 2.0, 3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn tiles_cover_ragged_edges() {
        // m = 17, n = 18 forces partial tiles in both directions
        let p = ConvProblem::new_2d(2, 1, 17, [3, 3], [1, 1]);
        let input: Vec<f32> = (0..p.input_len()).map(|i| i as f32).collect();
        let weight: Vec<f32> = (0..p.weight_len()).map(|i| (i % 3) as f32).collect();
        let mut output = vec![f32::NAN; p.output_len()];
        run_implicit_gemm(
            &p,
            ConvTensors::Forward {
                input: &input,
                weight: &weight,
                output: &mut output,
            },
        )
        .unwrap();
        for n in 0..2 {
            for k in 0..17 {
                for px in 0..9 {
                    let expected = weight[k] * input[n * 9 + px];
                    assert_eq!(output[(n * 17 + k) * 9 + px], expected);
                }
            }
        }
    }

    #[test]
    fn materialized_matches_implicit_on_integers() {
        let p = ConvProblem::new_2d(1, 2, 3, [4, 4], [2, 2]).with_pads(&[1, 1]);
        let input: Vec<f32> = (0..p.input_len()).map(|i| (i % 5) as f32).collect();
        let output_grad: Vec<f32> = (0..p.output_len()).map(|i| (i % 3) as f32 - 1.0).collect();
        let mut implicit = vec![0.0f32; p.weight_len()];
        let mut dense = vec![0.0f32; p.weight_len()];
        for (backend, dst) in [
            (GemmBackend::Implicit, &mut implicit),
            (GemmBackend::Materialized, &mut dense),
        ] {
            backend
                .run(
                    &p,
                    ConvTensors::BackwardWeight {
                        input: &input,
                        output_grad: &output_grad,
                        weight_grad: dst,
                    },
                )
                .unwrap();
        }
        // small integers: every summation order is exact
        assert_eq!(implicit, dense);
        assert!(implicit.iter().any(|&v| v != 0.0));
        assert_eq!(
            make_gemm_views(&p, Direction::BackwardWeight, 0).unwrap().dims.k,
            p.output_len() / 3
        );
    }
}
