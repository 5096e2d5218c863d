//! Seeded self-checks for the activation and batch-norm references.
//!
//! These layers have a single host implementation, so each check compares two
//! paths through it: analytic gradients against central differences of the
//! forward pass, training-mode normalization against inference with the
//! recovered batch statistics, and saved against recomputed statistics.

use std::fmt;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::reference::{
    activation_backward, activation_forward, ActivationDescriptor, ActivationMode, BatchNorm,
};
use crate::verify::{compare, VerificationReport};

/// Half-width of the central difference for activations.
const STEP: f32 = 1e-2;

/// Half-width for batch norm, whose output curves on the scale of one
/// standard deviation.
const BATCH_NORM_STEP: f32 = 1e-3;

/// Analytic vs numeric activation gradients.
pub const ACTIVATION_GRADIENT_TOLERANCE: f64 = 1e-3;

/// Two f64 paths that only differ by f32 storage of the statistics.
pub const CONSISTENCY_TOLERANCE: f64 = 1e-5;

/// Analytic vs numeric batch-norm input gradients. The numeric side sums
/// every output rounded to f32.
pub const BATCH_NORM_GRADIENT_TOLERANCE: f64 = 1e-2;

/// Input gradients checked numerically per batch-norm run.
const SAMPLED_GRADIENTS: usize = 8;

/// Below this many elements per statistic the normalized output is constant
/// up to epsilon and its gradient is rounding noise.
const MIN_GRADIENT_REDUCTION: usize = 3;

/// One named comparison inside a layer check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerCheck {
    pub name: String,
    pub verification: VerificationReport,
}

/// Outcome of checking one layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerReport {
    pub layer: String,
    pub seed: u64,
    pub checks: Vec<LayerCheck>,
    pub timestamp: String,
}

impl LayerReport {
    fn new(layer: String, seed: u64) -> Self {
        Self {
            layer,
            seed,
            checks: Vec::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn push(&mut self, name: &str, verification: VerificationReport) {
        log::debug!("{} {name}: {verification}", self.layer);
        self.checks.push(LayerCheck {
            name: name.to_string(),
            verification,
        });
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.verification.passed)
    }
}

impl fmt::Display for LayerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (seed {:#x})", self.layer, self.seed)?;
        for check in &self.checks {
            write!(f, "\n  {:<20} {}", check.name, check.verification)?;
        }
        Ok(())
    }
}

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

// ── Activation ───────────────────────────────────────────────────────────────

/// Points where the forward function or its derivative jumps.
fn kinks(desc: &ActivationDescriptor) -> Vec<f32> {
    match desc.mode {
        ActivationMode::Relu | ActivationMode::Abs | ActivationMode::LeakyRelu | ActivationMode::Elu => {
            vec![0.0]
        }
        ActivationMode::ClippedRelu => vec![0.0, desc.alpha],
        ActivationMode::Power if desc.beta != 0.0 => vec![(f32::EPSILON - desc.alpha) / desc.beta],
        _ => Vec::new(),
    }
}

/// Inputs in `[-1, 1)` at least two steps away from every kink.
fn activation_inputs(rng: &mut StdRng, desc: &ActivationDescriptor, len: usize) -> Vec<f32> {
    let kinks = kinks(desc);
    (0..len)
        .map(|_| loop {
            let x = rng.gen_range(-1.0f32..1.0);
            if kinks.iter().all(|k| (x - k).abs() >= 2.0 * STEP) {
                break x;
            }
        })
        .collect()
}

/// Run the slice entry points on `len` seeded elements and compare the
/// backward pass against central differences of the forward pass.
pub fn check_activation(desc: &ActivationDescriptor, len: usize, seed: u64) -> Result<LayerReport> {
    anyhow::ensure!(len > 0, "activation check needs at least one element");
    let mut rng = StdRng::seed_from_u64(seed);
    let x = activation_inputs(&mut rng, desc, len);
    let dy = random_vec(&mut rng, len);

    let mut y = vec![0.0f32; len];
    let mut dx = vec![0.0f32; len];
    activation_forward(desc, &x, &mut y).context("activation forward failed")?;
    activation_backward(desc, &x, &y, &dy, &mut dx).context("activation backward failed")?;

    let numeric: Vec<f32> = x
        .iter()
        .zip(&dy)
        .map(|(&x, &dy)| {
            let (lo, hi) = (x - STEP, x + STEP);
            let slope = (f64::from(desc.forward(hi)) - f64::from(desc.forward(lo)))
                / (f64::from(hi) - f64::from(lo));
            (slope * f64::from(dy)) as f32
        })
        .collect();

    let mut report = LayerReport::new(format!("activation {}", desc.mode), seed);
    report.push("backward", compare(&numeric, &dx, ACTIVATION_GRADIENT_TOLERANCE));
    Ok(report)
}

// ── Batch norm ───────────────────────────────────────────────────────────────

/// Seeded training forward and backward of `bn`, checked three ways:
///
/// - `inference`: training output vs inference with the saved batch mean and
///   the variance recovered from the saved inverse.
/// - `saved_stats`: backward with saved vs recomputed statistics.
/// - `backward`: sampled input gradients vs central differences of
///   `sum(y * dy)`.
///
/// The two gradient checks need at least three elements per statistic.
pub fn check_batch_norm(bn: &BatchNorm, seed: u64) -> Result<LayerReport> {
    let (len, params) = (bn.tensor_len(), bn.param_len());
    let mut rng = StdRng::seed_from_u64(seed);
    let x = random_vec(&mut rng, len);
    let dy = random_vec(&mut rng, len);
    let scale = random_vec(&mut rng, params);
    let bias = random_vec(&mut rng, params);

    let mut y = vec![0.0f32; len];
    let saved = bn
        .forward_training(&x, &scale, &bias, &mut y, 0.0, None)
        .context("batch norm training forward failed")?;

    let variance: Vec<f32> = saved
        .inv_variance
        .iter()
        .map(|&inv| (1.0 / f64::from(inv).powi(2) - bn.epsilon).max(0.0) as f32)
        .collect();
    let mut y_inference = vec![0.0f32; len];
    bn.forward_inference(&x, &scale, &bias, &saved.mean, &variance, &mut y_inference)
        .context("batch norm inference forward failed")?;

    let [n, c, h, w] = bn.shape;
    let mut report = LayerReport::new(format!("batch_norm {} n={n} c={c} h={h} w={w}", bn.mode), seed);
    report.push("inference", compare(&y, &y_inference, CONSISTENCY_TOLERANCE));

    if bn.reduction_len() < MIN_GRADIENT_REDUCTION {
        log::info!(
            "{}: {} element(s) per statistic, skipping gradient checks",
            report.layer,
            bn.reduction_len()
        );
        return Ok(report);
    }

    let mut dx = vec![0.0f32; len];
    let mut dx_recomputed = vec![0.0f32; len];
    bn.backward(&x, &dy, &scale, Some(&saved), &mut dx)
        .context("batch norm backward failed")?;
    bn.backward(&x, &dy, &scale, None, &mut dx_recomputed)
        .context("batch norm backward failed")?;
    report.push("saved_stats", compare(&dx_recomputed, &dx, CONSISTENCY_TOLERANCE));

    let loss = |x: &[f32]| -> Result<f64> {
        let mut y = vec![0.0f32; len];
        bn.forward_training(x, &scale, &bias, &mut y, 0.0, None)?;
        Ok(y.iter().zip(&dy).map(|(&a, &b)| f64::from(a) * f64::from(b)).sum())
    };
    let sampled: Vec<usize> = (0..SAMPLED_GRADIENTS.min(len))
        .map(|_| rng.gen_range(0..len))
        .collect();
    let mut numeric = Vec::with_capacity(sampled.len());
    let mut x_step = x.clone();
    for &i in &sampled {
        let (lo, hi) = (x[i] - BATCH_NORM_STEP, x[i] + BATCH_NORM_STEP);
        x_step[i] = hi;
        let plus = loss(&x_step)?;
        x_step[i] = lo;
        let minus = loss(&x_step)?;
        x_step[i] = x[i];
        numeric.push(((plus - minus) / (f64::from(hi) - f64::from(lo))) as f32);
    }
    let analytic: Vec<f32> = sampled.iter().map(|&i| dx[i]).collect();
    report.push("backward", compare(&numeric, &analytic, BATCH_NORM_GRADIENT_TOLERANCE));
    Ok(report)
}
