//! Implicit-GEMM views of the three convolution tensors.
//!
//! Every direction is expressed in one convention, per group:
//!
//! ```text
//!   A : GemmK x GemmM      B : GemmK x GemmN      C : GemmM x GemmN
//!   C[m][n] = Σ_k A[k][m] · B[k][n]
//!
//!               A                 B                        C
//!   fwd     weight (C·F, K)   input   (C·F, N·O)        output (K, N·O)
//!   bwd     weight (K·F, C)   out-grd (K·F, N·I)        in-grd (C, N·I)
//!   wrw     out-grd (N·O, K)  input   (N·O, C·F)        weight (K, C·F)
//! ```
//!
//! `C`/`K` are per-group channel counts, `F`/`I`/`O` the filter, input and
//! output spatial products. Each view is a [`TensorDescriptor`] over the
//! group's slice of the full packed tensor, so nothing is copied. The
//! reduction index is merged in the same order the naive kernels loop in.

pub mod gemm;

use crate::descriptor::{packed_strides, TensorDescriptor, Transform};
use crate::dtype::Element;
use crate::error::{ConvError, Result};
use crate::problem::{ConvProblem, Direction, TensorRole};

pub use gemm::{run_implicit_gemm, run_materialized_gemm, GemmBackend, TILE};

/// A 2-D (row, col) view of one tensor.
#[derive(Debug, Clone)]
pub struct GemmOperandView {
    pub role: TensorRole,
    pub descriptor: TensorDescriptor,
    pub rows: usize,
    pub cols: usize,
}

impl GemmOperandView {
    fn new(role: TensorRole, descriptor: TensorDescriptor) -> Self {
        let (rows, cols) = (descriptor.lengths()[0], descriptor.lengths()[1]);
        Self {
            role,
            descriptor,
            rows,
            cols,
        }
    }

    /// Physical offset of `(row, col)`, `None` for padding. Callers keep
    /// `row < rows` and `col < cols`; use [`TensorDescriptor::calculate_offset`]
    /// for unchecked coordinates.
    #[inline]
    pub(crate) fn offset(&self, row: usize, col: usize) -> Option<usize> {
        self.descriptor.offset_of(&[row, col])
    }

    pub fn may_pad(&self) -> bool {
        self.descriptor.may_pad()
    }
}

/// GEMM problem sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmDims {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// The three operand views for one group of one direction.
#[derive(Debug, Clone)]
pub struct GemmViews {
    pub direction: Direction,
    pub group: usize,
    pub a: GemmOperandView,
    pub b: GemmOperandView,
    pub c: GemmOperandView,
    pub dims: GemmDims,
}

/// Build the GEMM views for `group` of `problem`.
pub fn make_gemm_views(problem: &ConvProblem, direction: Direction, group: usize) -> Result<GemmViews> {
    problem.validate()?;
    if group >= problem.group {
        return Err(ConvError::InvalidProblem(format!(
            "group index {group} out of range for {} groups",
            problem.group
        )));
    }
    let slices = GroupSlices::new(problem, group)?;

    let (a, b, c) = match direction {
        Direction::Forward => (
            weight_reduce_channels(problem, &slices)?,
            input_windows(problem, &slices, WindowOrder::ChannelsFirst)?,
            output_by_channel(problem, &slices)?,
        ),
        Direction::BackwardData => (
            weight_reduce_filters(problem, &slices)?,
            output_grad_windows(problem, &slices)?,
            input_by_channel(problem, &slices)?,
        ),
        Direction::BackwardWeight => (
            output_reduce_pixels(problem, &slices)?,
            input_windows(problem, &slices, WindowOrder::PixelsFirst)?,
            weight_by_filter(problem, &slices)?,
        ),
    };

    let dims = check_dims(&a, &b, &c)?;
    log::debug!(
        "{direction} group {group}: gemm m={} n={} k={} (b pads: {})",
        dims.m,
        dims.n,
        dims.k,
        b.may_pad()
    );
    Ok(GemmViews {
        direction,
        group,
        a,
        b,
        c,
        dims,
    })
}

fn check_dims(a: &GemmOperandView, b: &GemmOperandView, c: &GemmOperandView) -> Result<GemmDims> {
    let mismatch = |dim, lhs: &GemmOperandView, lhs_len, rhs: &GemmOperandView, rhs_len| {
        ConvError::GemmDimMismatch {
            dim,
            lhs: lhs.role.as_str(),
            lhs_len,
            rhs: rhs.role.as_str(),
            rhs_len,
        }
    };
    if a.rows != b.rows {
        return Err(mismatch("GemmK", a, a.rows, b, b.rows));
    }
    if a.cols != c.rows {
        return Err(mismatch("GemmM", a, a.cols, c, c.rows));
    }
    if b.cols != c.cols {
        return Err(mismatch("GemmN", b, b.cols, c, c.cols));
    }
    Ok(GemmDims {
        m: a.cols,
        n: b.cols,
        k: a.rows,
    })
}

// ── Per-group native descriptors ─────────────────────────────────────────────

/// Native descriptors of one group's slice of each full tensor.
struct GroupSlices {
    input: TensorDescriptor,
    weight: TensorDescriptor,
    output: TensorDescriptor,
}

impl GroupSlices {
    fn new(problem: &ConvProblem, group: usize) -> Result<Self> {
        let (cpg, kpg) = (problem.c_per_group(), problem.k_per_group());
        // Per-group lengths over the full tensor's strides.
        let slice = |full: Vec<usize>, channel_dim: usize, per_group: usize| {
            let strides = packed_strides(&full);
            let mut lengths = full;
            lengths[channel_dim] = per_group;
            let base = group * per_group * strides[channel_dim];
            TensorDescriptor::native(&lengths, &strides).map(|d| d.with_base_offset(base))
        };
        Ok(Self {
            input: slice(problem.input_lengths(), 1, cpg)?,
            weight: slice(problem.weight_lengths(), 0, kpg)?,
            output: slice(problem.output_lengths(), 1, kpg)?,
        })
    }
}

// ── Id helpers ───────────────────────────────────────────────────────────────

fn range(start: usize, len: usize) -> Vec<usize> {
    (start..start + len).collect()
}

/// `first` followed by every second id starting at `start`.
fn strided_ids(first: usize, start: usize, count: usize) -> Vec<usize> {
    std::iter::once(first).chain((0..count).map(|i| start + 2 * i)).collect()
}

fn with_leading(first: usize, rest: &[usize]) -> Vec<usize> {
    std::iter::once(first).chain(rest.iter().copied()).collect()
}

// ── A / C views: merges and pass-throughs ────────────────────────────────────

fn weight_reduce_channels(problem: &ConvProblem, s: &GroupSlices) -> Result<GemmOperandView> {
    let r = problem.spatial_rank();
    let desc = s.weight.clone().transform(
        vec![
            Transform::merge(&with_leading(problem.c_per_group(), &problem.filter_spatial)),
            Transform::pass_through(problem.k_per_group()),
        ],
        vec![range(1, r + 1), vec![0]],
        vec![vec![0], vec![1]],
    )?;
    Ok(GemmOperandView::new(TensorRole::Weight, desc))
}

fn weight_reduce_filters(problem: &ConvProblem, s: &GroupSlices) -> Result<GemmOperandView> {
    let r = problem.spatial_rank();
    let desc = s.weight.clone().transform(
        vec![
            Transform::merge(&with_leading(problem.k_per_group(), &problem.filter_spatial)),
            Transform::pass_through(problem.c_per_group()),
        ],
        vec![with_leading(0, &range(2, r)), vec![1]],
        vec![vec![0], vec![1]],
    )?;
    Ok(GemmOperandView::new(TensorRole::Weight, desc))
}

fn weight_by_filter(problem: &ConvProblem, s: &GroupSlices) -> Result<GemmOperandView> {
    let r = problem.spatial_rank();
    let desc = s.weight.clone().transform(
        vec![
            Transform::pass_through(problem.k_per_group()),
            Transform::merge(&with_leading(problem.c_per_group(), &problem.filter_spatial)),
        ],
        vec![vec![0], range(1, r + 1)],
        vec![vec![0], vec![1]],
    )?;
    Ok(GemmOperandView::new(TensorRole::Weight, desc))
}

fn output_by_channel(problem: &ConvProblem, s: &GroupSlices) -> Result<GemmOperandView> {
    let r = problem.spatial_rank();
    let desc = s.output.clone().transform(
        vec![
            Transform::pass_through(problem.k_per_group()),
            Transform::merge(&with_leading(problem.n, &problem.output_spatial())),
        ],
        vec![vec![1], with_leading(0, &range(2, r))],
        vec![vec![0], vec![1]],
    )?;
    Ok(GemmOperandView::new(TensorRole::Output, desc))
}

fn output_reduce_pixels(problem: &ConvProblem, s: &GroupSlices) -> Result<GemmOperandView> {
    let r = problem.spatial_rank();
    let desc = s.output.clone().transform(
        vec![
            Transform::merge(&with_leading(problem.n, &problem.output_spatial())),
            Transform::pass_through(problem.k_per_group()),
        ],
        vec![with_leading(0, &range(2, r)), vec![1]],
        vec![vec![0], vec![1]],
    )?;
    Ok(GemmOperandView::new(TensorRole::Output, desc))
}

fn input_by_channel(problem: &ConvProblem, s: &GroupSlices) -> Result<GemmOperandView> {
    let r = problem.spatial_rank();
    let desc = s.input.clone().transform(
        vec![
            Transform::pass_through(problem.c_per_group()),
            Transform::merge(&with_leading(problem.n, &problem.input_spatial)),
        ],
        vec![vec![1], with_leading(0, &range(2, r))],
        vec![vec![0], vec![1]],
    )?;
    Ok(GemmOperandView::new(TensorRole::Input, desc))
}

// ── B views: sliding windows ─────────────────────────────────────────────────

/// Which merged window dimension becomes the GEMM row (reduction) index.
#[derive(Clone, Copy)]
enum WindowOrder {
    /// rows = (c, filter...), cols = (n, output...)
    ChannelsFirst,
    /// rows = (n, output...), cols = (c, filter...)
    PixelsFirst,
}

/// Input seen as `(c, f0, o0, f1, o1, ...)` windows: pad, then split every
/// padded axis into (filter tap, output position).
fn input_windows(problem: &ConvProblem, s: &GroupSlices, order: WindowOrder) -> Result<GemmOperandView> {
    let r = problem.spatial_rank();
    let (n, cpg) = (problem.n, problem.c_per_group());
    let out = problem.output_spatial();

    let padded = s.input.clone().transform(
        vec![
            Transform::pass_through(n),
            Transform::pass_through(cpg),
            Transform::pad(&problem.input_spatial, &problem.left_pads, &problem.right_pads),
        ],
        vec![vec![0], vec![1], range(2, r)],
        vec![vec![0], vec![1], range(2, r)],
    )?;

    let mut embeds = vec![Transform::pass_through(n), Transform::pass_through(cpg)];
    let mut lower_ids = vec![vec![0], vec![1]];
    let mut upper_ids = vec![vec![0], vec![1]];
    for i in 0..r {
        let padded_len = problem.input_spatial[i] + problem.left_pads[i] + problem.right_pads[i];
        embeds.push(Transform::embed(
            padded_len,
            &[problem.filter_spatial[i], out[i]],
            &[problem.dilations[i] as isize, problem.strides[i] as isize, 0],
        ));
        lower_ids.push(vec![2 + i]);
        upper_ids.push(vec![2 + 2 * i, 3 + 2 * i]);
    }
    let windows = padded.transform(embeds, lower_ids, upper_ids)?;

    let channels = Transform::merge(&with_leading(cpg, &problem.filter_spatial));
    let pixels = Transform::merge(&with_leading(n, &out));
    let channel_ids = strided_ids(1, 2, r);
    let pixel_ids = strided_ids(0, 3, r);
    let desc = match order {
        WindowOrder::ChannelsFirst => windows.transform(
            vec![channels, pixels],
            vec![channel_ids, pixel_ids],
            vec![vec![0], vec![1]],
        )?,
        WindowOrder::PixelsFirst => windows.transform(
            vec![pixels, channels],
            vec![pixel_ids, channel_ids],
            vec![vec![0], vec![1]],
        )?,
    };
    Ok(GemmOperandView::new(TensorRole::Input, desc))
}

/// Output gradient seen from every input position:
/// `cur = i + pad - dilation * f` must land on a stride multiple inside the
/// dilated output, which `Dilate` followed by `Embed` encodes directly.
fn output_grad_windows(problem: &ConvProblem, s: &GroupSlices) -> Result<GemmOperandView> {
    let r = problem.spatial_rank();
    let (n, kpg) = (problem.n, problem.k_per_group());
    let out = problem.output_spatial();

    let mut dilates = vec![Transform::pass_through(n), Transform::pass_through(kpg)];
    let mut ids = vec![vec![0], vec![1]];
    for (i, &len) in out.iter().enumerate() {
        dilates.push(Transform::dilate(len, problem.strides[i]));
        ids.push(vec![2 + i]);
    }
    let dilated = s.output.clone().transform(dilates, ids.clone(), ids)?;

    let mut embeds = vec![Transform::pass_through(n), Transform::pass_through(kpg)];
    let mut lower_ids = vec![vec![0], vec![1]];
    let mut upper_ids = vec![vec![0], vec![1]];
    for i in 0..r {
        let dilated_len = dilated.lengths()[2 + i];
        embeds.push(Transform::embed(
            dilated_len,
            &[problem.filter_spatial[i], problem.input_spatial[i]],
            &[-(problem.dilations[i] as isize), 1, problem.left_pads[i] as isize],
        ));
        lower_ids.push(vec![2 + i]);
        upper_ids.push(vec![2 + 2 * i, 3 + 2 * i]);
    }
    let windows = dilated.transform(embeds, lower_ids, upper_ids)?;

    let desc = windows.transform(
        vec![
            Transform::merge(&with_leading(kpg, &problem.filter_spatial)),
            Transform::merge(&with_leading(n, &problem.input_spatial)),
        ],
        vec![strided_ids(1, 2, r), strided_ids(0, 3, r)],
        vec![vec![0], vec![1]],
    )?;
    Ok(GemmOperandView::new(TensorRole::Output, desc))
}

// ── Buffers ──────────────────────────────────────────────────────────────────

/// Buffers of one convolution, named by what each direction reads and writes.
#[derive(Debug)]
pub enum ConvTensors<'a, E> {
    Forward {
        input: &'a [E],
        weight: &'a [E],
        output: &'a mut [E],
    },
    BackwardData {
        output_grad: &'a [E],
        weight: &'a [E],
        input_grad: &'a mut [E],
    },
    BackwardWeight {
        input: &'a [E],
        output_grad: &'a [E],
        weight_grad: &'a mut [E],
    },
}

impl<'a, E: Element> ConvTensors<'a, E> {
    /// Route buffers given in (input, weight, output) order to `direction`.
    pub fn for_direction(
        direction: Direction,
        input: &'a mut [E],
        weight: &'a mut [E],
        output: &'a mut [E],
    ) -> Self {
        match direction {
            Direction::Forward => Self::Forward {
                input,
                weight,
                output,
            },
            Direction::BackwardData => Self::BackwardData {
                output_grad: output,
                weight,
                input_grad: input,
            },
            Direction::BackwardWeight => Self::BackwardWeight {
                input,
                output_grad: output,
                weight_grad: weight,
            },
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Forward { .. } => Direction::Forward,
            Self::BackwardData { .. } => Direction::BackwardData,
            Self::BackwardWeight { .. } => Direction::BackwardWeight,
        }
    }

    /// Check every buffer against the problem.
    pub fn check_lengths(&self, problem: &ConvProblem) -> Result<()> {
        let (input, weight, output) = match self {
            Self::Forward {
                input,
                weight,
                output,
            } => (input.len(), weight.len(), output.len()),
            Self::BackwardData {
                output_grad,
                weight,
                input_grad,
            } => (input_grad.len(), weight.len(), output_grad.len()),
            Self::BackwardWeight {
                input,
                output_grad,
                weight_grad,
            } => (input.len(), weight_grad.len(), output_grad.len()),
        };
        for (role, found) in [
            (TensorRole::Input, input),
            (TensorRole::Weight, weight),
            (TensorRole::Output, output),
        ] {
            let expected = problem.len_of(role);
            if found != expected {
                return Err(ConvError::BufferSize {
                    tensor: role.as_str(),
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// `(A source, B source, C destination)` in GEMM role order.
    pub(crate) fn gemm_operands(&mut self) -> (&[E], &[E], &mut [E]) {
        match self {
            Self::Forward {
                input,
                weight,
                output,
            } => (*weight, *input, &mut **output),
            Self::BackwardData {
                output_grad,
                weight,
                input_grad,
            } => (*weight, *output_grad, &mut **input_grad),
            Self::BackwardWeight {
                input,
                output_grad,
                weight_grad,
            } => (*output_grad, *input, &mut **weight_grad),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem() -> ConvProblem {
        ConvProblem::new_2d(2, 4, 6, [5, 6], [3, 2])
            .with_group(2)
            .with_strides(&[2, 1])
            .with_dilations(&[1, 2])
            .with_pads(&[1, 1])
    }

    #[test]
    fn dims_follow_role_table() {
        let p = problem();
        let out: usize = p.output_spatial().iter().product();
        let (cpg, kpg, f, i) = (2, 3, 6, 30);

        let fwd = make_gemm_views(&p, Direction::Forward, 1).unwrap();
        assert_eq!(fwd.dims, GemmDims { m: kpg, n: 2 * out, k: cpg * f });

        let bwd = make_gemm_views(&p, Direction::BackwardData, 0).unwrap();
        assert_eq!(bwd.dims, GemmDims { m: cpg, n: 2 * i, k: kpg * f });

        let wrw = make_gemm_views(&p, Direction::BackwardWeight, 1).unwrap();
        assert_eq!(wrw.dims, GemmDims { m: kpg, n: cpg * f, k: 2 * out });
    }

    #[test]
    fn only_the_window_operand_pads() {
        let p = problem();
        for direction in Direction::ALL {
            let v = make_gemm_views(&p, direction, 0).unwrap();
            assert!(!v.a.may_pad(), "{direction}");
            assert!(v.b.may_pad(), "{direction}");
            assert!(!v.c.may_pad(), "{direction}");
        }
    }

    #[test]
    fn group_slice_offsets() {
        let p = problem();
        let v = make_gemm_views(&p, Direction::Forward, 1).unwrap();
        // C (k=0 of group 1, n=0, pixel 0) is output channel 3.
        let out: usize = p.output_spatial().iter().product();
        assert_eq!(v.c.offset(0, 0), Some(3 * out));
        // A (c=0, f=0; k=0) of group 1 is weight filter 3.
        assert_eq!(v.a.offset(0, 0), Some(3 * 2 * 6));
    }

    #[test]
    fn forward_window_matches_affine_relation() {
        let p = ConvProblem::new_2d(1, 1, 1, [4, 4], [3, 3]).with_pads(&[1, 1]);
        let v = make_gemm_views(&p, Direction::Forward, 0).unwrap();
        // tap (0, 0) at output (0, 0) falls into the padding
        assert_eq!(v.b.offset(0, 0), None);
        // tap (1, 1) at output (0, 0) reads input (0, 0)
        assert_eq!(v.b.offset(4, 0), Some(0));
        // tap (2, 2) at output (3, 3) is past the right border
        assert_eq!(v.b.offset(8, 15), None);
        // tap (2, 2) at output (1, 2) reads input (2, 3)
        assert_eq!(v.b.offset(8, 6), Some(2 * 4 + 3));
    }

    #[test]
    fn backward_data_window_inverts_stride() {
        // out = (5 + 2 - 3) / 2 + 1 = 3
        let p = ConvProblem::new(1, 1, 1, &[5], &[3]).with_strides(&[2]).with_pads(&[1]);
        let v = make_gemm_views(&p, Direction::BackwardData, 0).unwrap();
        // row = filter tap f, col = input position i; cur = i + 1 - f
        let expect = |f: usize, i: usize| {
            let cur = i as isize + 1 - f as isize;
            (cur >= 0 && cur % 2 == 0 && cur / 2 < 3).then(|| (cur / 2) as usize)
        };
        for f in 0..3 {
            for i in 0..5 {
                assert_eq!(v.b.offset(f, i), expect(f, i), "f={f} i={i}");
            }
        }
    }

    #[test]
    fn bad_group_index_is_rejected() {
        assert!(make_gemm_views(&problem(), Direction::Forward, 2).is_err());
    }

    #[test]
    fn buffer_lengths_are_checked() {
        let p = ConvProblem::new_2d(1, 1, 1, [3, 3], [2, 2]);
        let input = vec![0.0f32; 9];
        let weight = vec![0.0f32; 4];
        let mut output = vec![0.0f32; 5];
        let tensors = ConvTensors::Forward {
            input: &input,
            weight: &weight,
            output: &mut output,
        };
        assert_eq!(
            tensors.check_lengths(&p).unwrap_err(),
            ConvError::BufferSize {
                tensor: "output",
                expected: 4,
                found: 5
            }
        );
    }
}
