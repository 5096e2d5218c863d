//! Tolerance-based comparison of a result buffer against a reference.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::DataType;

/// Root-mean-square error relative to the largest magnitude in either buffer.
///
/// Returns `f64::MAX` when the lengths differ.
pub fn rms_range(reference: &[f32], result: &[f32]) -> f64 {
    if reference.len() != result.len() {
        return f64::MAX;
    }
    if reference.is_empty() {
        return 0.0;
    }
    let (mut square_sum, mut max_mag) = (0.0f64, 0.0f64);
    for (&a, &b) in reference.iter().zip(result) {
        let (a, b) = (f64::from(a), f64::from(b));
        square_sum += (a - b) * (a - b);
        max_mag = max_mag.max(a.abs()).max(b.abs());
    }
    square_sum.sqrt() / ((reference.len() as f64).sqrt() * max_mag.max(f64::MIN_POSITIVE))
}

/// Acceptance threshold for [`rms_range`] per storage format.
pub fn default_tolerance(data_type: DataType) -> f64 {
    match data_type {
        DataType::Fp32 => 1.5e-6,
        DataType::Fp16 => 8.2e-3,
        // bfloat16 keeps 3 fewer mantissa bits than half
        DataType::Bf16 => 8.2e-3 * 8.0,
    }
}

/// Outcome of one comparison. A failed check is data, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub rms: f64,
    pub tolerance: f64,
    pub max_diff: f64,
    pub max_diff_index: Option<usize>,
    /// NaNs in the result where the reference is finite.
    pub nan_count: usize,
    pub len: usize,
    pub passed: bool,
}

/// Compare `result` against `reference`.
pub fn compare(reference: &[f32], result: &[f32], tolerance: f64) -> VerificationReport {
    let rms = rms_range(reference, result);
    let mut max_diff = 0.0f64;
    let mut max_diff_index = None;
    let mut nan_count = 0;
    for (i, (&a, &b)) in reference.iter().zip(result).enumerate() {
        if b.is_nan() && !a.is_nan() {
            nan_count += 1;
            continue;
        }
        let diff = (f64::from(a) - f64::from(b)).abs();
        if diff > max_diff || max_diff_index.is_none() {
            max_diff = diff;
            max_diff_index = Some(i);
        }
    }
    // NaN rms fails the `<=` check too
    let passed = rms <= tolerance && nan_count == 0;
    if !passed {
        log::warn!(
            "verification failed: rms {rms:.3e} > {tolerance:.3e} or {nan_count} NaN(s), max diff {max_diff:.3e}"
        );
    }
    VerificationReport {
        rms,
        tolerance,
        max_diff,
        max_diff_index,
        nan_count,
        len: reference.len(),
        passed,
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "PASSED" } else { "FAILED" };
        write!(
            f,
            "{verdict}: rms {:.3e} (tolerance {:.3e}) over {} elements",
            self.rms, self.tolerance, self.len
        )?;
        if let Some(i) = self.max_diff_index {
            write!(f, ", max diff {:.3e} at {i}", self.max_diff)?;
        }
        if self.nan_count > 0 {
            write!(f, ", {} NaN(s)", self.nan_count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_buffers_have_zero_error() {
        let a = [1.0f32, -2.0, 3.0];
        assert_eq!(rms_range(&a, &a), 0.0);
        assert!(compare(&a, &a, 0.0).passed);
    }

    #[test]
    fn rms_is_relative_to_largest_magnitude() {
        // sqrt(1) / (sqrt(4) * 10)
        let a = [10.0f32, 0.0, 0.0, 0.0];
        let b = [10.0f32, 1.0, 0.0, 0.0];
        assert!((rms_range(&a, &b) - 0.05).abs() < 1e-12);
        assert_eq!(rms_range(&a, &b[..3]), f64::MAX);
    }

    #[test]
    fn all_zero_buffers_do_not_divide_by_zero() {
        assert_eq!(rms_range(&[0.0; 4], &[0.0; 4]), 0.0);
    }

    #[test]
    fn nan_in_result_fails() {
        let report = compare(&[1.0, 2.0], &[1.0, f32::NAN], 1.0);
        assert!(!report.passed);
        assert_eq!(report.nan_count, 1);
        assert!(report.to_string().starts_with("FAILED"));
    }

    #[test]
    fn max_diff_is_located() {
        let report = compare(&[1.0, 2.0, 3.0], &[1.0, 2.5, 3.1], 1.0);
        assert_eq!(report.max_diff_index, Some(1));
        assert!((report.max_diff - 0.5).abs() < 1e-9);
        assert!(report.passed);
    }

    #[test]
    fn tolerances_loosen_with_narrower_formats() {
        assert!(default_tolerance(DataType::Fp32) < default_tolerance(DataType::Fp16));
        assert!(default_tolerance(DataType::Fp16) < default_tolerance(DataType::Bf16));
    }
}
