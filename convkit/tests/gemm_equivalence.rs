//! Property tests: both GEMM backends against the naive kernels.
//!
//! The implicit backend reduces in the same order as the naive loops, so the
//! results must agree bit for bit. The materialized backend multiplies with
//! a different summation order and only has to meet the RMS tolerance.

use half::f16;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use convkit::dtype::{convert_to_f32, Bf16, Element};
use convkit::igemm::{run_implicit_gemm, run_materialized_gemm, ConvTensors};
use convkit::problem::{ConvProblem, Direction, TensorRole};
use convkit::reference::naive_conv;
use convkit::verify::{compare, default_tolerance};

// ============================================================================
// Strategies
// ============================================================================

/// One spatial axis: (filter, stride, dilation, left pad, right pad, input).
/// The input is sized so the dilated filter always fits.
fn axis() -> impl Strategy<Value = (usize, usize, usize, usize, usize, usize)> {
    (1usize..=3, 1usize..=3, 1usize..=2, 0usize..=2, 0usize..=2, 0usize..=4).prop_map(
        |(fil, stride, dil, lp, rp, extra)| {
            let window = dil * (fil - 1) + 1;
            let input = (window + extra).saturating_sub(lp + rp).max(1);
            (fil, stride, dil, lp, rp, input)
        },
    )
}

fn conv_problem() -> impl Strategy<Value = ConvProblem> {
    (1usize..=3)
        .prop_flat_map(|rank| {
            (
                1usize..=2,
                1usize..=3,
                1usize..=3,
                1usize..=3,
                prop::collection::vec(axis(), rank),
            )
        })
        .prop_map(|(n, group, c_per_group, k_per_group, axes)| {
            let pick = |f: fn(&(usize, usize, usize, usize, usize, usize)) -> usize| {
                axes.iter().map(f).collect::<Vec<_>>()
            };
            ConvProblem::new(
                n,
                group * c_per_group,
                group * k_per_group,
                &pick(|a| a.5),
                &pick(|a| a.0),
            )
            .with_group(group)
            .with_strides(&pick(|a| a.1))
            .with_dilations(&pick(|a| a.2))
            .with_left_pads(&pick(|a| a.3))
            .with_right_pads(&pick(|a| a.4))
        })
        .prop_filter("dilated filter must fit", |p| p.validate().is_ok())
}

// ============================================================================
// Helpers
// ============================================================================

fn slot(role: TensorRole) -> usize {
    match role {
        TensorRole::Input => 0,
        TensorRole::Weight => 1,
        TensorRole::Output => 2,
    }
}

fn operands<E: Element>(problem: &ConvProblem, direction: Direction, seed: u64) -> [Vec<E>; 3] {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut fill = |len: usize| -> Vec<E> {
        (0..len)
            .map(|_| E::from_f32(rng.gen_range(-1.0f32..1.0)))
            .collect()
    };
    let mut bufs = [
        fill(problem.input_len()),
        fill(problem.weight_len()),
        fill(problem.output_len()),
    ];
    bufs[slot(direction.result_role())]
        .iter_mut()
        .for_each(|v| *v = E::default());
    bufs
}

type Runner<E> = fn(&ConvProblem, ConvTensors<'_, E>) -> convkit::Result<()>;

fn run<E: Element>(problem: &ConvProblem, direction: Direction, seed: u64, runner: Runner<E>) -> Vec<E> {
    let mut bufs = operands::<E>(problem, direction, seed);
    {
        let [input, weight, output] = &mut bufs;
        runner(problem, ConvTensors::for_direction(direction, input, weight, output)).unwrap();
    }
    let [input, weight, output] = bufs;
    match direction.result_role() {
        TensorRole::Input => input,
        TensorRole::Weight => weight,
        TensorRole::Output => output,
    }
}

fn bits<E: Element>(values: &[E]) -> Vec<u32> {
    values.iter().map(|v| v.to_bits_u32()).collect()
}

fn assert_bit_exact<E: Element>(problem: &ConvProblem, seed: u64) -> Result<(), TestCaseError> {
    for direction in Direction::ALL {
        let naive = run::<E>(problem, direction, seed, naive_conv::<E>);
        let implicit = run::<E>(problem, direction, seed, run_implicit_gemm::<E>);
        prop_assert_eq!(
            bits(&naive),
            bits(&implicit),
            "{} {} {}",
            direction,
            E::DATA_TYPE,
            problem
        );
    }
    Ok(())
}

// ============================================================================
// Implicit GEMM is bit-exact
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: fp32 implicit GEMM reproduces the naive kernels exactly
    #[test]
    fn prop_implicit_fp32_bit_exact(problem in conv_problem(), seed in any::<u64>()) {
        assert_bit_exact::<f32>(&problem, seed)?;
    }

    /// Property: fp16 storage with f32 accumulation is exact too
    #[test]
    fn prop_implicit_fp16_bit_exact(problem in conv_problem(), seed in any::<u64>()) {
        assert_bit_exact::<f16>(&problem, seed)?;
    }

    /// Property: bf16 storage with f32 accumulation is exact too
    #[test]
    fn prop_implicit_bf16_bit_exact(problem in conv_problem(), seed in any::<u64>()) {
        assert_bit_exact::<Bf16>(&problem, seed)?;
    }

    /// Property: materialized GEMM meets the fp32 tolerance
    #[test]
    fn prop_materialized_within_tolerance(problem in conv_problem(), seed in any::<u64>()) {
        for direction in Direction::ALL {
            let naive = run::<f32>(&problem, direction, seed, naive_conv::<f32>);
            let dense = run::<f32>(&problem, direction, seed, run_materialized_gemm::<f32>);
            let report = compare(
                &convert_to_f32(&naive),
                &convert_to_f32(&dense),
                default_tolerance(convkit::DataType::Fp32),
            );
            prop_assert!(report.passed, "{} {}: {}", direction, problem, report);
        }
    }
}

// ============================================================================
// Padding
// ============================================================================

/// Forward with padding equals forward on an explicitly zero-padded input
/// with no padding.
#[test]
fn padding_contributes_nothing() {
    let padded = ConvProblem::new_2d(1, 2, 3, [4, 5], [3, 3])
        .with_left_pads(&[1, 2])
        .with_right_pads(&[2, 0]);
    let explicit = ConvProblem::new_2d(1, 2, 3, [4 + 3, 5 + 2], [3, 3]);
    assert_eq!(padded.output_lengths(), explicit.output_lengths());

    let [input, mut weight, _] = operands::<f32>(&padded, Direction::Forward, 11);
    let mut big = vec![0.0f32; explicit.input_len()];
    for c in 0..2 {
        for h in 0..4 {
            for w in 0..5 {
                big[(c * 7 + h + 1) * 7 + w + 2] = input[(c * 4 + h) * 5 + w];
            }
        }
    }

    let mut expected = vec![0.0f32; explicit.output_len()];
    naive_conv(
        &explicit,
        ConvTensors::Forward {
            input: &big,
            weight: &weight,
            output: &mut expected,
        },
    )
    .unwrap();

    let mut input = input;
    let mut got = vec![0.0f32; padded.output_len()];
    run_implicit_gemm(
        &padded,
        ConvTensors::for_direction(Direction::Forward, &mut input, &mut weight, &mut got),
    )
    .unwrap();
    assert_eq!(got, expected);
}

/// Large strides with a 1x1 filter skip input pixels; their gradient is zero.
#[test]
fn skipped_pixels_get_zero_gradient() {
    let problem = ConvProblem::new_2d(1, 1, 1, [5, 5], [1, 1]).with_strides(&[3, 3]);
    let mut input_grad = vec![f32::NAN; problem.input_len()];
    run_implicit_gemm(
        &problem,
        ConvTensors::BackwardData {
            output_grad: &[1.0, 2.0, 3.0, 4.0],
            weight: &[2.0],
            input_grad: &mut input_grad,
        },
    )
    .unwrap();
    for (i, &v) in input_grad.iter().enumerate() {
        let (h, w) = (i / 5, i % 5);
        if h % 3 == 0 && w % 3 == 0 {
            assert_eq!(v, 2.0 * (1 + (h / 3) * 2 + w / 3) as f32);
        } else {
            assert_eq!(v, 0.0, "pixel ({h}, {w})");
        }
    }
}
