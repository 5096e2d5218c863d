//! Host reference for element-wise activations and their gradients.

use std::fmt;

use clap::ValueEnum;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ConvError, Result};

/// Activation functions, in the numbering GPU libraries use (0 = pass-through).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    PassThru,
    Logistic,
    Tanh,
    Relu,
    SoftRelu,
    Abs,
    Power,
    ClippedRelu,
    LeakyRelu,
    Elu,
}

impl ActivationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PassThru => "pass_thru",
            Self::Logistic => "logistic",
            Self::Tanh => "tanh",
            Self::Relu => "relu",
            Self::SoftRelu => "soft_relu",
            Self::Abs => "abs",
            Self::Power => "power",
            Self::ClippedRelu => "clipped_relu",
            Self::LeakyRelu => "leaky_relu",
            Self::Elu => "elu",
        }
    }
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode plus the three scalar parameters. Their meaning depends on the mode:
///
/// | mode          | forward                         |
/// |---------------|---------------------------------|
/// | tanh          | `beta * tanh(alpha * x)`        |
/// | power         | `(alpha + beta * x) ^ power`    |
/// | clipped relu  | `min(alpha, max(0, x))`         |
/// | leaky relu    | `x > 0 ? x : alpha * x`         |
/// | elu           | `x > 0 ? x : alpha * (e^x - 1)` |
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivationDescriptor {
    pub mode: ActivationMode,
    pub alpha: f32,
    pub beta: f32,
    pub power: f32,
}

impl ActivationDescriptor {
    pub fn new(mode: ActivationMode) -> Self {
        Self {
            mode,
            alpha: 0.0,
            beta: 0.0,
            power: 1.0,
        }
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_power(mut self, power: f32) -> Self {
        self.power = power;
        self
    }

    /// `y = f(x)`
    pub fn forward(&self, x: f32) -> f32 {
        let Self {
            alpha, beta, power, ..
        } = *self;
        match self.mode {
            ActivationMode::PassThru => x,
            ActivationMode::Logistic => 1.0 / (1.0 + (-x).exp()),
            ActivationMode::Tanh => beta * (alpha * x).tanh(),
            ActivationMode::Relu => x.max(0.0),
            // ln(1 + e^x) without overflowing for large x
            ActivationMode::SoftRelu => x.max(0.0) + (-x.abs()).exp().ln_1p(),
            ActivationMode::Abs => x.abs(),
            ActivationMode::Power => {
                let base = alpha + beta * x;
                if base <= f32::EPSILON {
                    0.0
                } else {
                    base.powf(power)
                }
            }
            ActivationMode::ClippedRelu => x.max(0.0).min(alpha),
            ActivationMode::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            ActivationMode::Elu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x.exp_m1()
                }
            }
        }
    }

    /// `dx` from `x`, the forward result `y` and the incoming gradient `dy`.
    pub fn backward(&self, x: f32, y: f32, dy: f32) -> f32 {
        let Self {
            alpha, beta, power, ..
        } = *self;
        match self.mode {
            ActivationMode::PassThru => dy,
            ActivationMode::Logistic => dy * y * (1.0 - y),
            ActivationMode::Tanh => {
                if beta.abs() <= f32::EPSILON {
                    0.0
                } else {
                    dy * alpha * (beta - y * y / beta)
                }
            }
            ActivationMode::Relu => {
                if x > 0.0 {
                    dy
                } else {
                    0.0
                }
            }
            ActivationMode::SoftRelu => dy / (1.0 + (-x).exp()),
            ActivationMode::Abs => {
                if x > 0.0 {
                    dy
                } else {
                    -dy
                }
            }
            ActivationMode::Power => {
                let base = alpha + beta * x;
                if base <= f32::EPSILON {
                    0.0
                } else {
                    dy * power * beta * y / base
                }
            }
            ActivationMode::ClippedRelu => {
                if x > 0.0 && x <= alpha {
                    dy
                } else {
                    0.0
                }
            }
            ActivationMode::LeakyRelu => {
                if x > 0.0 {
                    dy
                } else {
                    alpha * dy
                }
            }
            ActivationMode::Elu => {
                if x > 0.0 {
                    dy
                } else {
                    dy * (y + alpha)
                }
            }
        }
    }
}

fn check_len(tensor: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(ConvError::BufferSize {
            tensor,
            expected,
            found,
        });
    }
    Ok(())
}

/// Element-wise forward pass into `y`.
pub fn activation_forward(desc: &ActivationDescriptor, x: &[f32], y: &mut [f32]) -> Result<()> {
    check_len("y", x.len(), y.len())?;
    y.par_iter_mut()
        .zip(x.par_iter())
        .for_each(|(y, &x)| *y = desc.forward(x));
    Ok(())
}

/// Element-wise backward pass into `dx`.
pub fn activation_backward(
    desc: &ActivationDescriptor,
    x: &[f32],
    y: &[f32],
    dy: &[f32],
    dx: &mut [f32],
) -> Result<()> {
    check_len("y", x.len(), y.len())?;
    check_len("dy", x.len(), dy.len())?;
    check_len("dx", x.len(), dx.len())?;
    dx.par_iter_mut()
        .enumerate()
        .for_each(|(i, dx)| *dx = desc.backward(x[i], y[i], dy[i]));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODES: [ActivationMode; 10] = [
        ActivationMode::PassThru,
        ActivationMode::Logistic,
        ActivationMode::Tanh,
        ActivationMode::Relu,
        ActivationMode::SoftRelu,
        ActivationMode::Abs,
        ActivationMode::Power,
        ActivationMode::ClippedRelu,
        ActivationMode::LeakyRelu,
        ActivationMode::Elu,
    ];

    fn desc(mode: ActivationMode) -> ActivationDescriptor {
        ActivationDescriptor::new(mode)
            .with_alpha(0.7)
            .with_beta(1.3)
            .with_power(2.0)
    }

    #[test]
    fn forward_values() {
        assert_eq!(desc(ActivationMode::Relu).forward(-2.0), 0.0);
        assert_eq!(desc(ActivationMode::ClippedRelu).forward(5.0), 0.7);
        assert_eq!(desc(ActivationMode::LeakyRelu).forward(-2.0), -1.4);
        assert_eq!(desc(ActivationMode::Abs).forward(-3.0), 3.0);
        assert_eq!(desc(ActivationMode::Logistic).forward(0.0), 0.5);
        // (0.7 + 1.3 * 1)^2
        assert!((desc(ActivationMode::Power).forward(1.0) - 4.0).abs() < 1e-6);
        assert_eq!(desc(ActivationMode::Power).forward(-1.0), 0.0);
        assert!((desc(ActivationMode::SoftRelu).forward(0.0) - 2f32.ln()).abs() < 1e-7);
        assert_eq!(desc(ActivationMode::SoftRelu).forward(200.0), 200.0);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let h = 1e-3f32;
        // stay clear of the kinks at 0 and alpha
        for mode in ALL_MODES {
            let d = desc(mode);
            for &x in &[-1.1f32, -0.4, 0.35, 0.9, 1.6] {
                let y = d.forward(x);
                let analytic = d.backward(x, y, 1.0);
                let numeric = (d.forward(x + h) - d.forward(x - h)) / (2.0 * h);
                assert!(
                    (analytic - numeric).abs() < 1e-2 * (1.0 + numeric.abs()),
                    "{mode} at {x}: analytic {analytic}, numeric {numeric}"
                );
            }
        }
    }

    #[test]
    fn slice_entry_points_check_lengths() {
        let d = desc(ActivationMode::Elu);
        let x = [-1.0f32, 0.0, 1.0];
        let mut y = [0.0f32; 3];
        activation_forward(&d, &x, &mut y).unwrap();
        assert_eq!(y[2], 1.0);
        let mut dx = [0.0f32; 3];
        activation_backward(&d, &x, &y, &[1.0; 3], &mut dx).unwrap();
        assert_eq!(dx[2], 1.0);
        assert!((dx[0] - (-1f32).exp() * 0.7).abs() < 1e-6);
        assert!(activation_forward(&d, &x, &mut [0.0; 2]).is_err());
    }
}
