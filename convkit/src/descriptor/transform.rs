//! Single coordinate transforms.
//!
//! A transform maps coordinates of its *upper* dimensions (the side closer to
//! the GEMM view) to coordinates of its *lower* dimensions (the side closer to
//! memory). `None` from [`Transform::calculate_lower_index`] is the padding
//! sentinel: the upper coordinate has no backing element.

use smallvec::smallvec;

use super::Index;
use crate::error::{ConvError, Result};

/// One coordinate transform with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Identity on one dimension.
    PassThrough { length: usize },
    /// Virtual border on each of `lengths.len()` dimensions.
    Pad {
        lengths: Vec<usize>,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    /// One lower dimension addressed as an affine function of several upper
    /// dimensions: `lower = sum(coefficients[i] * upper[i]) + coefficients[last]`.
    Embed {
        lower_length: usize,
        upper_lengths: Vec<usize>,
        coefficients: Vec<isize>,
    },
    /// Several lower dimensions folded into one upper dimension, first listed
    /// dimension most significant.
    Merge { lengths: Vec<usize> },
    /// Inserts `factor - 1` holes between consecutive elements of one dimension.
    Dilate { lower_length: usize, factor: usize },
}

impl Transform {
    pub fn pass_through(length: usize) -> Self {
        Self::PassThrough { length }
    }

    pub fn pad(lengths: &[usize], left: &[usize], right: &[usize]) -> Self {
        Self::Pad {
            lengths: lengths.to_vec(),
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }

    pub fn embed(lower_length: usize, upper_lengths: &[usize], coefficients: &[isize]) -> Self {
        Self::Embed {
            lower_length,
            upper_lengths: upper_lengths.to_vec(),
            coefficients: coefficients.to_vec(),
        }
    }

    pub fn merge(lengths: &[usize]) -> Self {
        Self::Merge {
            lengths: lengths.to_vec(),
        }
    }

    pub fn dilate(lower_length: usize, factor: usize) -> Self {
        Self::Dilate {
            lower_length,
            factor,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PassThrough { .. } => "PassThrough",
            Self::Pad { .. } => "Pad",
            Self::Embed { .. } => "Embed",
            Self::Merge { .. } => "Merge",
            Self::Dilate { .. } => "Dilate",
        }
    }

    /// Check the transform's own parameters.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ConvError::InvalidTransform {
            transform: self.name(),
            reason,
        };
        match self {
            Self::PassThrough { length } => {
                if *length == 0 {
                    return Err(invalid("zero length".into()));
                }
                Ok(())
            }
            Self::Pad {
                lengths,
                left,
                right,
            } => {
                if lengths.is_empty() {
                    return Err(invalid("no dimensions".into()));
                }
                if left.len() != lengths.len() || right.len() != lengths.len() {
                    return Err(invalid(format!(
                        "{} dimensions but {} left and {} right pads",
                        lengths.len(),
                        left.len(),
                        right.len()
                    )));
                }
                Ok(())
            }
            Self::Embed {
                upper_lengths,
                coefficients,
                ..
            } => {
                if upper_lengths.is_empty() {
                    return Err(invalid("no upper dimensions".into()));
                }
                if coefficients.len() != upper_lengths.len() + 1 {
                    return Err(invalid(format!(
                        "{} upper dimensions need {} coefficients, got {}",
                        upper_lengths.len(),
                        upper_lengths.len() + 1,
                        coefficients.len()
                    )));
                }
                Ok(())
            }
            Self::Merge { lengths } => {
                if lengths.is_empty() {
                    return Err(invalid("no dimensions to merge".into()));
                }
                if let Some(dim) = lengths.iter().position(|&len| len == 0) {
                    return Err(invalid(format!("dimension {dim} has zero length")));
                }
                Ok(())
            }
            Self::Dilate { lower_length, factor } => {
                if *factor == 0 {
                    return Err(invalid("factor must be positive".into()));
                }
                if *lower_length == 0 {
                    return Err(invalid("zero lower length".into()));
                }
                Ok(())
            }
        }
    }

    /// Extents of the dimensions this transform reads.
    pub fn lower_lengths(&self) -> Index {
        match self {
            Self::PassThrough { length } => smallvec![*length],
            Self::Pad { lengths, .. } | Self::Merge { lengths } => lengths.iter().copied().collect(),
            Self::Embed { lower_length, .. } | Self::Dilate { lower_length, .. } => {
                smallvec![*lower_length]
            }
        }
    }

    /// Extents of the dimensions this transform produces.
    pub fn upper_lengths(&self) -> Index {
        match self {
            Self::PassThrough { length } => smallvec![*length],
            Self::Pad {
                lengths,
                left,
                right,
            } => lengths
                .iter()
                .zip(left)
                .zip(right)
                .map(|((len, l), r)| len + l + r)
                .collect(),
            Self::Embed { upper_lengths, .. } => upper_lengths.iter().copied().collect(),
            Self::Merge { lengths } => smallvec![lengths.iter().product()],
            Self::Dilate {
                lower_length,
                factor,
            } => match *lower_length {
                0 => smallvec![0],
                len => smallvec![(len - 1) * factor + 1],
            },
        }
    }

    /// Map upper coordinates to lower coordinates, `None` for padding.
    pub fn calculate_lower_index(&self, upper: &[usize]) -> Option<Index> {
        match self {
            Self::PassThrough { .. } => Some(smallvec![upper[0]]),
            Self::Pad { lengths, left, .. } => {
                let mut lower = Index::with_capacity(lengths.len());
                for ((&u, &len), &l) in upper.iter().zip(lengths).zip(left) {
                    if u < l || u - l >= len {
                        return None;
                    }
                    lower.push(u - l);
                }
                Some(lower)
            }
            Self::Embed {
                lower_length,
                coefficients,
                ..
            } => {
                let (offset, coeffs) = coefficients.split_last()?;
                let pos = upper
                    .iter()
                    .zip(coeffs)
                    .fold(*offset, |acc, (&u, &c)| acc + c * u as isize);
                if pos < 0 || pos as usize >= *lower_length {
                    return None;
                }
                Some(smallvec![pos as usize])
            }
            Self::Merge { lengths } => {
                let mut rest = upper[0];
                let mut lower: Index = smallvec![0; lengths.len()];
                for (slot, &len) in lower.iter_mut().zip(lengths).rev() {
                    *slot = rest % len;
                    rest /= len;
                }
                Some(lower)
            }
            Self::Dilate { factor, .. } => {
                let u = upper[0];
                if u % factor != 0 {
                    return None;
                }
                Some(smallvec![u / factor])
            }
        }
    }

    /// Inverse map. Defined for every transform except `Embed`, which is
    /// many-to-one in general.
    pub fn calculate_upper_index(&self, lower: &[usize]) -> Option<Index> {
        match self {
            Self::PassThrough { .. } => Some(smallvec![lower[0]]),
            Self::Pad { left, .. } => Some(lower.iter().zip(left).map(|(x, l)| x + l).collect()),
            Self::Embed { .. } => None,
            Self::Merge { lengths } => {
                let packed = lower
                    .iter()
                    .zip(lengths)
                    .fold(0, |acc, (&x, &len)| acc * len + x);
                Some(smallvec![packed])
            }
            Self::Dilate { factor, .. } => Some(smallvec![lower[0] * factor]),
        }
    }

    pub fn is_invertible(&self) -> bool {
        !matches!(self, Self::Embed { .. })
    }

    /// Whether some upper coordinate resolves to the padding sentinel.
    pub fn may_pad(&self) -> bool {
        match self {
            Self::PassThrough { .. } | Self::Merge { .. } => false,
            Self::Pad { left, right, .. } => left.iter().chain(right).any(|&p| p > 0),
            Self::Embed {
                lower_length,
                upper_lengths,
                coefficients,
            } => {
                let Some((offset, coeffs)) = coefficients.split_last() else {
                    return false;
                };
                let (mut lo, mut hi) = (*offset, *offset);
                for (&len, &c) in upper_lengths.iter().zip(coeffs) {
                    let span = c * len.saturating_sub(1) as isize;
                    lo += span.min(0);
                    hi += span.max(0);
                }
                lo < 0 || hi >= *lower_length as isize
            }
            Self::Dilate {
                lower_length,
                factor,
            } => *factor > 1 && *lower_length > 1,
        }
    }
}
