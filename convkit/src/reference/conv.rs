//! Naive direct convolution: ground truth for the GEMM paths.
//!
//! Each kernel mirrors a GPU launch. A workgroup owns one contiguous run of
//! the result tensor (one `(n, k)` output plane, one `(n, c)` input plane, or
//! one filter's `c/g x filter` block) and its [`BLOCK_SIZE`] threads stride
//! through that run. Workgroups become `rayon` tasks over disjoint
//! `par_chunks_mut` slices; threads become a strided loop inside the task.
//!
//! All accumulation is `f32`, converted once on the final store. Positions
//! outside the input are skipped, never read.
//!
//! 2-D entry points run the 3-D core with a unit depth axis.

use rayon::prelude::*;

use crate::dtype::Element;
use crate::error::Result;
use crate::igemm::ConvTensors;
use crate::problem::{ConvProblem, Direction};

/// Threads per workgroup.
pub const BLOCK_SIZE: usize = 256;

/// Scalar parameters of a 2-D launch, `[h, w]` per spatial field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dArgs {
    pub n: usize,
    pub group: usize,
    pub c_per_group: usize,
    pub k_per_group: usize,
    pub input: [usize; 2],
    pub output: [usize; 2],
    pub filter: [usize; 2],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub pad: [usize; 2],
}

/// Scalar parameters of a 3-D launch, `[d, h, w]` per spatial field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv3dArgs {
    pub n: usize,
    pub group: usize,
    pub c_per_group: usize,
    pub k_per_group: usize,
    pub input: [usize; 3],
    pub output: [usize; 3],
    pub filter: [usize; 3],
    pub stride: [usize; 3],
    pub dilation: [usize; 3],
    pub pad: [usize; 3],
}

impl From<Conv2dArgs> for Conv3dArgs {
    fn from(a: Conv2dArgs) -> Self {
        let lift = |v: [usize; 2], unit: usize| [unit, v[0], v[1]];
        Self {
            n: a.n,
            group: a.group,
            c_per_group: a.c_per_group,
            k_per_group: a.k_per_group,
            input: lift(a.input, 1),
            output: lift(a.output, 1),
            filter: lift(a.filter, 1),
            stride: lift(a.stride, 1),
            dilation: lift(a.dilation, 1),
            pad: lift(a.pad, 0),
        }
    }
}

impl Conv3dArgs {
    /// Lift a 1-, 2- or 3-D problem onto the 3-D core. Only left pads are
    /// needed; the right pads are folded into the output extents.
    pub fn from_problem(problem: &ConvProblem) -> Self {
        let lift = |v: &[usize], unit: usize| {
            let mut out = [unit; 3];
            let skip = 3usize.saturating_sub(v.len());
            for (slot, &x) in out.iter_mut().skip(skip).zip(v) {
                *slot = x;
            }
            out
        };
        Self {
            n: problem.n,
            group: problem.group,
            c_per_group: problem.c_per_group(),
            k_per_group: problem.k_per_group(),
            input: lift(&problem.input_spatial, 1),
            output: lift(&problem.output_spatial(), 1),
            filter: lift(&problem.filter_spatial, 1),
            stride: lift(&problem.strides, 1),
            dilation: lift(&problem.dilations, 1),
            pad: lift(&problem.left_pads, 0),
        }
    }

    fn input_plane(&self) -> usize {
        self.input.iter().product()
    }

    fn output_plane(&self) -> usize {
        self.output.iter().product()
    }

    fn filter_volume(&self) -> usize {
        self.filter.iter().product()
    }
}

/// Grid geometry of one naive launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: usize,
    pub block: usize,
    /// Result elements owned by one workgroup.
    pub elements_per_workgroup: usize,
}

pub fn launch_config(problem: &ConvProblem, direction: Direction) -> LaunchConfig {
    let a = Conv3dArgs::from_problem(problem);
    let (grid, elements_per_workgroup) = match direction {
        Direction::Forward => (a.group * a.n * a.k_per_group, a.output_plane()),
        Direction::BackwardData => (a.group * a.n * a.c_per_group, a.input_plane()),
        Direction::BackwardWeight => (a.group * a.k_per_group, a.c_per_group * a.filter_volume()),
    };
    LaunchConfig {
        grid,
        block: BLOCK_SIZE,
        elements_per_workgroup,
    }
}

/// Input coordinate read by output position `out` through tap `tap`.
#[inline]
fn input_pos(out: usize, tap: usize, stride: usize, dilation: usize, pad: usize, extent: usize) -> Option<usize> {
    let cur = (stride * out + dilation * tap) as isize - pad as isize;
    (cur >= 0 && (cur as usize) < extent).then_some(cur as usize)
}

/// Output coordinate that reads input position `inp` through tap `tap`.
#[inline]
fn output_pos(inp: usize, tap: usize, stride: usize, dilation: usize, pad: usize, extent: usize) -> Option<usize> {
    let cur = (inp + pad) as isize - (dilation * tap) as isize;
    if cur < 0 || cur as usize % stride != 0 {
        return None;
    }
    let cur = cur as usize / stride;
    (cur < extent).then_some(cur)
}

#[inline]
fn split3(tid: usize, dims: [usize; 3]) -> [usize; 3] {
    let plane = dims[1] * dims[2];
    [tid / plane, (tid % plane) / dims[2], tid % dims[2]]
}

// ── 3-D cores ────────────────────────────────────────────────────────────────

fn fwd_core<E: Element>(input: &[E], weight: &[E], output: &mut [E], a: &Conv3dArgs) {
    let [di, hi, wi] = a.input;
    let [_, fy, fx] = a.filter;
    let (cpg, kpg) = (a.c_per_group, a.k_per_group);
    let (k_total, c_total) = (a.group * kpg, a.group * cpg);
    let (in_plane, out_plane, fil) = (a.input_plane(), a.output_plane(), a.filter_volume());
    debug_assert_eq!(input.len(), a.n * c_total * in_plane);
    debug_assert_eq!(weight.len(), k_total * cpg * fil);
    debug_assert_eq!(output.len(), a.n * k_total * out_plane);

    output
        .par_chunks_mut(out_plane)
        .enumerate()
        .for_each(|(wg, out)| {
            let (batch, kg) = (wg / k_total, wg % k_total);
            let group = kg / kpg;
            let in_base = (batch * c_total + group * cpg) * in_plane;
            let wei_base = kg * cpg * fil;

            for thread in 0..BLOCK_SIZE {
                for tid in (thread..out_plane).step_by(BLOCK_SIZE) {
                    let [od, oh, ow] = split3(tid, a.output);
                    let mut value = 0.0f32;
                    for ic in 0..cpg {
                        for iz in 0..a.filter[0] {
                            let Some(cd) = input_pos(od, iz, a.stride[0], a.dilation[0], a.pad[0], di) else {
                                continue;
                            };
                            for iy in 0..fy {
                                let Some(ch) = input_pos(oh, iy, a.stride[1], a.dilation[1], a.pad[1], hi) else {
                                    continue;
                                };
                                for ix in 0..fx {
                                    let Some(cw) = input_pos(ow, ix, a.stride[2], a.dilation[2], a.pad[2], wi) else {
                                        continue;
                                    };
                                    let x = input[in_base + ic * in_plane + (cd * hi + ch) * wi + cw];
                                    let w = weight[wei_base + ic * fil + (iz * fy + iy) * fx + ix];
                                    value += x.to_f32() * w.to_f32();
                                }
                            }
                        }
                    }
                    out[tid] = E::from_f32(value);
                }
            }
        });
}

fn bwd_core<E: Element>(output_grad: &[E], weight: &[E], input_grad: &mut [E], a: &Conv3dArgs) {
    let [od, oh, ow] = a.output;
    let [_, fy, fx] = a.filter;
    let (cpg, kpg) = (a.c_per_group, a.k_per_group);
    let (k_total, c_total) = (a.group * kpg, a.group * cpg);
    let (in_plane, out_plane, fil) = (a.input_plane(), a.output_plane(), a.filter_volume());
    debug_assert_eq!(input_grad.len(), a.n * c_total * in_plane);
    debug_assert_eq!(weight.len(), k_total * cpg * fil);
    debug_assert_eq!(output_grad.len(), a.n * k_total * out_plane);

    input_grad
        .par_chunks_mut(in_plane)
        .enumerate()
        .for_each(|(wg, dx)| {
            let (batch, cg) = (wg / c_total, wg % c_total);
            let (group, ic) = (cg / cpg, cg % cpg);
            let out_base = (batch * k_total + group * kpg) * out_plane;
            let wei_base = group * kpg * cpg * fil;

            for thread in 0..BLOCK_SIZE {
                for tid in (thread..in_plane).step_by(BLOCK_SIZE) {
                    let [id, ih, iw] = split3(tid, a.input);
                    let mut value = 0.0f32;
                    for ik in 0..kpg {
                        for iz in 0..a.filter[0] {
                            let Some(cd) = output_pos(id, iz, a.stride[0], a.dilation[0], a.pad[0], od) else {
                                continue;
                            };
                            for iy in 0..fy {
                                let Some(ch) = output_pos(ih, iy, a.stride[1], a.dilation[1], a.pad[1], oh) else {
                                    continue;
                                };
                                for ix in 0..fx {
                                    let Some(cw) = output_pos(iw, ix, a.stride[2], a.dilation[2], a.pad[2], ow) else {
                                        continue;
                                    };
                                    let dy = output_grad[out_base + ik * out_plane + (cd * oh + ch) * ow + cw];
                                    let w = weight[wei_base + (ik * cpg + ic) * fil + (iz * fy + iy) * fx + ix];
                                    value += dy.to_f32() * w.to_f32();
                                }
                            }
                        }
                    }
                    dx[tid] = E::from_f32(value);
                }
            }
        });
}

fn wrw_core<E: Element>(input: &[E], output_grad: &[E], weight_grad: &mut [E], a: &Conv3dArgs) {
    let [di, hi, wi] = a.input;
    let [od, oh, ow] = a.output;
    let (cpg, kpg) = (a.c_per_group, a.k_per_group);
    let (k_total, c_total) = (a.group * kpg, a.group * cpg);
    let (in_plane, out_plane, fil) = (a.input_plane(), a.output_plane(), a.filter_volume());
    let per_filter = cpg * fil;
    debug_assert_eq!(input.len(), a.n * c_total * in_plane);
    debug_assert_eq!(weight_grad.len(), k_total * per_filter);
    debug_assert_eq!(output_grad.len(), a.n * k_total * out_plane);

    weight_grad
        .par_chunks_mut(per_filter)
        .enumerate()
        .for_each(|(kg, dw)| {
            let group = kg / kpg;

            for thread in 0..BLOCK_SIZE {
                for tid in (thread..per_filter).step_by(BLOCK_SIZE) {
                    let (ic, tap) = (tid / fil, tid % fil);
                    let [iz, iy, ix] = split3(tap, a.filter);
                    let mut value = 0.0f32;
                    for batch in 0..a.n {
                        let in_base = (batch * c_total + group * cpg + ic) * in_plane;
                        let out_base = (batch * k_total + kg) * out_plane;
                        for iod in 0..od {
                            let Some(cd) = input_pos(iod, iz, a.stride[0], a.dilation[0], a.pad[0], di) else {
                                continue;
                            };
                            for ioh in 0..oh {
                                let Some(ch) = input_pos(ioh, iy, a.stride[1], a.dilation[1], a.pad[1], hi) else {
                                    continue;
                                };
                                for iow in 0..ow {
                                    let Some(cw) = input_pos(iow, ix, a.stride[2], a.dilation[2], a.pad[2], wi) else {
                                        continue;
                                    };
                                    let x = input[in_base + (cd * hi + ch) * wi + cw];
                                    let dy = output_grad[out_base + (iod * oh + ioh) * ow + iow];
                                    value += x.to_f32() * dy.to_f32();
                                }
                            }
                        }
                    }
                    dw[tid] = E::from_f32(value);
                }
            }
        });
}

// ── Entry points ─────────────────────────────────────────────────────────────

pub fn conv_fwd_nchw<E: Element>(input: &[E], weight: &[E], output: &mut [E], args: &Conv2dArgs) {
    fwd_core(input, weight, output, &Conv3dArgs::from(*args));
}

pub fn conv_bwd_nchw<E: Element>(output_grad: &[E], weight: &[E], input_grad: &mut [E], args: &Conv2dArgs) {
    bwd_core(output_grad, weight, input_grad, &Conv3dArgs::from(*args));
}

pub fn conv_wrw_nchw<E: Element>(input: &[E], output_grad: &[E], weight_grad: &mut [E], args: &Conv2dArgs) {
    wrw_core(input, output_grad, weight_grad, &Conv3dArgs::from(*args));
}

pub fn conv_fwd_ncdhw<E: Element>(input: &[E], weight: &[E], output: &mut [E], args: &Conv3dArgs) {
    fwd_core(input, weight, output, args);
}

pub fn conv_bwd_ncdhw<E: Element>(output_grad: &[E], weight: &[E], input_grad: &mut [E], args: &Conv3dArgs) {
    bwd_core(output_grad, weight, input_grad, args);
}

pub fn conv_wrw_ncdhw<E: Element>(input: &[E], output_grad: &[E], weight_grad: &mut [E], args: &Conv3dArgs) {
    wrw_core(input, output_grad, weight_grad, args);
}

/// Validate `problem` and run the naive kernel for the direction `tensors` encodes.
pub fn naive_conv<E: Element>(problem: &ConvProblem, tensors: ConvTensors<'_, E>) -> Result<()> {
    problem.validate()?;
    tensors.check_lengths(problem)?;
    let args = Conv3dArgs::from_problem(problem);
    let launch = launch_config(problem, tensors.direction());
    log::debug!(
        "naive {} ({}): grid {} x block {}, {} elements per workgroup",
        tensors.direction(),
        E::DATA_TYPE,
        launch.grid,
        launch.block,
        launch.elements_per_workgroup
    );
    match tensors {
        ConvTensors::Forward {
            input,
            weight,
            output,
        } => conv_fwd_ncdhw(input, weight, output, &args),
        ConvTensors::BackwardData {
            output_grad,
            weight,
            input_grad,
        } => conv_bwd_ncdhw(output_grad, weight, input_grad, &args),
        ConvTensors::BackwardWeight {
            input,
            output_grad,
            weight_grad,
        } => conv_wrw_ncdhw(input, output_grad, weight_grad, &args),
    }
    Ok(())
}
