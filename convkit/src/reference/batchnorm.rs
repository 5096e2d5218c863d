//! Host reference for batch normalization over NCHW tensors.
//!
//! Statistics are accumulated in `f64`. `Spatial` keeps one mean/variance per
//! channel (reduced over N, H, W); `PerActivation` keeps one per `(c, h, w)`
//! position (reduced over N).

use std::fmt;

use clap::ValueEnum;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ConvError, Result};

/// Epsilon added to the variance before the inverse square root.
pub const DEFAULT_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchNormMode {
    PerActivation,
    Spatial,
}

impl fmt::Display for BatchNormMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PerActivation => "per_activation",
            Self::Spatial => "spatial",
        })
    }
}

/// Running averages updated in place by a training pass.
#[derive(Debug)]
pub struct RunningStats<'a> {
    pub mean: &'a mut [f32],
    pub variance: &'a mut [f32],
}

/// Batch statistics saved by a training pass for reuse in backward.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedStats {
    pub mean: Vec<f32>,
    pub inv_variance: Vec<f32>,
}

/// Parameter gradients from a backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormGrads {
    pub dscale: Vec<f32>,
    pub dbias: Vec<f32>,
}

/// Shape, mode and epsilon of one batch-norm layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNorm {
    pub mode: BatchNormMode,
    /// `[N, C, H, W]`
    pub shape: [usize; 4],
    pub epsilon: f64,
}

impl BatchNorm {
    pub fn new(mode: BatchNormMode, shape: [usize; 4]) -> Self {
        Self {
            mode,
            shape,
            epsilon: DEFAULT_EPSILON,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn tensor_len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Length of scale, bias and every statistics vector.
    pub fn param_len(&self) -> usize {
        let [_, c, h, w] = self.shape;
        match self.mode {
            BatchNormMode::Spatial => c,
            BatchNormMode::PerActivation => c * h * w,
        }
    }

    /// Elements reduced into one statistic.
    pub fn reduction_len(&self) -> usize {
        let [n, _, h, w] = self.shape;
        match self.mode {
            BatchNormMode::Spatial => n * h * w,
            BatchNormMode::PerActivation => n,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.shape.contains(&0) {
            return Err(ConvError::InvalidProblem(format!(
                "batch norm shape {:?} has an empty dimension",
                self.shape
            )));
        }
        if self.epsilon.is_nan() || self.epsilon <= 0.0 {
            return Err(ConvError::InvalidProblem(format!(
                "batch norm epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }

    fn check(&self, tensor: &'static str, expected: usize, found: usize) -> Result<()> {
        if expected != found {
            return Err(ConvError::BufferSize {
                tensor,
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Flat indices of the elements reduced into parameter `p`.
    fn members(&self, p: usize) -> impl Iterator<Item = usize> {
        let [n, c, h, w] = self.shape;
        let chw = c * h * w;
        let (base, inner) = match self.mode {
            BatchNormMode::Spatial => (p * h * w, h * w),
            BatchNormMode::PerActivation => (p, 1),
        };
        (0..n).flat_map(move |b| (0..inner).map(move |i| b * chw + base + i))
    }

    /// Parameter index of flat element `i`.
    fn param_of(&self, i: usize) -> usize {
        let [_, c, h, w] = self.shape;
        match self.mode {
            BatchNormMode::Spatial => (i / (h * w)) % c,
            BatchNormMode::PerActivation => i % (c * h * w),
        }
    }

    /// Mean and biased variance of parameter `p`, two passes in `f64`.
    fn moments(&self, x: &[f32], p: usize) -> (f64, f64) {
        let count = self.reduction_len() as f64;
        let mean = self.members(p).map(|i| f64::from(x[i])).sum::<f64>() / count;
        let variance = self
            .members(p)
            .map(|i| {
                let d = f64::from(x[i]) - mean;
                d * d
            })
            .sum::<f64>()
            / count;
        (mean, variance)
    }

    fn normalize(
        &self,
        x: &[f32],
        scale: &[f32],
        bias: &[f32],
        mean: &[f64],
        inv_std: &[f64],
        y: &mut [f32],
    ) {
        y.par_iter_mut().enumerate().for_each(|(i, y)| {
            let p = self.param_of(i);
            let xhat = (f64::from(x[i]) - mean[p]) * inv_std[p];
            *y = (f64::from(scale[p]) * xhat + f64::from(bias[p])) as f32;
        });
    }

    /// Normalize with batch statistics; optionally fold them into `running`
    /// with `exp_avg_factor` (variance is unbiased there).
    pub fn forward_training(
        &self,
        x: &[f32],
        scale: &[f32],
        bias: &[f32],
        y: &mut [f32],
        exp_avg_factor: f64,
        running: Option<RunningStats<'_>>,
    ) -> Result<SavedStats> {
        self.validate()?;
        let (len, params) = (self.tensor_len(), self.param_len());
        self.check("x", len, x.len())?;
        self.check("y", len, y.len())?;
        self.check("scale", params, scale.len())?;
        self.check("bias", params, bias.len())?;
        if let Some(running) = &running {
            self.check("running mean", params, running.mean.len())?;
            self.check("running variance", params, running.variance.len())?;
        }

        let moments: Vec<(f64, f64)> = (0..params).into_par_iter().map(|p| self.moments(x, p)).collect();
        let mean: Vec<f64> = moments.iter().map(|m| m.0).collect();
        let inv_std: Vec<f64> = moments
            .iter()
            .map(|&(_, var)| 1.0 / (var + self.epsilon).sqrt())
            .collect();
        self.normalize(x, scale, bias, &mean, &inv_std, y);

        if let Some(running) = running {
            let count = self.reduction_len();
            for (p, &(m, var)) in moments.iter().enumerate() {
                let unbiased = if count == 1 {
                    var
                } else {
                    var * count as f64 / (count - 1) as f64
                };
                let rm = f64::from(running.mean[p]);
                let rv = f64::from(running.variance[p]);
                running.mean[p] = ((1.0 - exp_avg_factor) * rm + exp_avg_factor * m) as f32;
                running.variance[p] = ((1.0 - exp_avg_factor) * rv + exp_avg_factor * unbiased) as f32;
            }
        }
        log::debug!(
            "batch norm {} training: {} params over {} elements each",
            self.mode,
            params,
            self.reduction_len()
        );

        Ok(SavedStats {
            mean: mean.iter().map(|&m| m as f32).collect(),
            inv_variance: inv_std.iter().map(|&v| v as f32).collect(),
        })
    }

    /// Normalize with externally estimated mean and variance.
    pub fn forward_inference(
        &self,
        x: &[f32],
        scale: &[f32],
        bias: &[f32],
        estimated_mean: &[f32],
        estimated_variance: &[f32],
        y: &mut [f32],
    ) -> Result<()> {
        self.validate()?;
        let (len, params) = (self.tensor_len(), self.param_len());
        self.check("x", len, x.len())?;
        self.check("y", len, y.len())?;
        for (name, v) in [
            ("scale", scale),
            ("bias", bias),
            ("estimated mean", estimated_mean),
            ("estimated variance", estimated_variance),
        ] {
            self.check(name, params, v.len())?;
        }

        let mean: Vec<f64> = estimated_mean.iter().map(|&m| f64::from(m)).collect();
        let inv_std: Vec<f64> = estimated_variance
            .iter()
            .map(|&v| 1.0 / (f64::from(v) + self.epsilon).sqrt())
            .collect();
        self.normalize(x, scale, bias, &mean, &inv_std, y);
        Ok(())
    }

    /// Input and parameter gradients. Uses `saved` statistics when given,
    /// otherwise recomputes them from `x`.
    pub fn backward(
        &self,
        x: &[f32],
        dy: &[f32],
        scale: &[f32],
        saved: Option<&SavedStats>,
        dx: &mut [f32],
    ) -> Result<BatchNormGrads> {
        self.validate()?;
        let (len, params) = (self.tensor_len(), self.param_len());
        self.check("x", len, x.len())?;
        self.check("dy", len, dy.len())?;
        self.check("dx", len, dx.len())?;
        self.check("scale", params, scale.len())?;

        let (mean, inv_std): (Vec<f64>, Vec<f64>) = match saved {
            Some(saved) => {
                self.check("saved mean", params, saved.mean.len())?;
                self.check("saved inverse variance", params, saved.inv_variance.len())?;
                saved
                    .mean
                    .iter()
                    .zip(&saved.inv_variance)
                    .map(|(&m, &v)| (f64::from(m), f64::from(v)))
                    .unzip()
            }
            None => (0..params)
                .into_par_iter()
                .map(|p| {
                    let (m, var) = self.moments(x, p);
                    (m, 1.0 / (var + self.epsilon).sqrt())
                })
                .unzip(),
        };

        let sums: Vec<(f64, f64)> = (0..params)
            .into_par_iter()
            .map(|p| {
                self.members(p).fold((0.0, 0.0), |(db, ds), i| {
                    let g = f64::from(dy[i]);
                    let xhat = (f64::from(x[i]) - mean[p]) * inv_std[p];
                    (db + g, ds + g * xhat)
                })
            })
            .collect();

        let count = self.reduction_len() as f64;
        dx.par_iter_mut().enumerate().for_each(|(i, dx)| {
            let p = self.param_of(i);
            let (dbias, dscale) = sums[p];
            let xhat = (f64::from(x[i]) - mean[p]) * inv_std[p];
            let g = f64::from(dy[i]);
            let coeff = f64::from(scale[p]) * inv_std[p] / count;
            *dx = (coeff * (count * g - dbias - xhat * dscale)) as f32;
        });

        Ok(BatchNormGrads {
            dbias: sums.iter().map(|s| s.0 as f32).collect(),
            dscale: sums.iter().map(|s| s.1 as f32).collect(),
        })
    }
}
