//! Tensor descriptors: a native strided layout plus a chain of coordinate
//! transform stages.
//!
//! ```text
//!   upper (view) coordinate
//!        │  stage k   transforms read upper ids, write lower ids
//!        ▼
//!       ...
//!        │  stage 1
//!        ▼
//!   native multi-index ──► base_offset + Σ index[i] * stride[i]
//! ```
//!
//! Descriptors are plain values built once per problem. Every method is pure,
//! so one descriptor can be evaluated from any number of threads.

pub mod transform;

use smallvec::SmallVec;

use crate::error::{ConvError, Result};

pub use transform::Transform;

/// Multi-index (or list of extents) of a descriptor.
pub type Index = SmallVec<[usize; 8]>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stage {
    transforms: Vec<Transform>,
    lower_ids: Vec<Vec<usize>>,
    upper_ids: Vec<Vec<usize>>,
    lower_rank: usize,
}

/// A strided tensor seen through zero or more transform stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    native_lengths: Index,
    strides: Index,
    base_offset: usize,
    stages: Vec<Stage>,
    lengths: Index,
}

impl TensorDescriptor {
    /// Native layout with explicit strides.
    pub fn native(lengths: &[usize], strides: &[usize]) -> Result<Self> {
        if lengths.len() != strides.len() {
            return Err(ConvError::RankMismatch {
                expected: lengths.len(),
                found: strides.len(),
            });
        }
        Ok(Self {
            native_lengths: lengths.iter().copied().collect(),
            strides: strides.iter().copied().collect(),
            base_offset: 0,
            stages: Vec::new(),
            lengths: lengths.iter().copied().collect(),
        })
    }

    /// Native layout, row-major and densely packed.
    pub fn packed(lengths: &[usize]) -> Self {
        let strides = packed_strides(lengths);
        Self {
            native_lengths: lengths.iter().copied().collect(),
            strides,
            base_offset: 0,
            stages: Vec::new(),
            lengths: lengths.iter().copied().collect(),
        }
    }

    /// Shift every physical offset, e.g. to select one group's slice.
    pub fn with_base_offset(mut self, base_offset: usize) -> Self {
        self.base_offset = base_offset;
        self
    }

    /// Append a stage. `lower_ids[i]` lists the current dimensions read by
    /// `transforms[i]`, `upper_ids[i]` the new dimensions it produces.
    pub fn transform(
        mut self,
        transforms: Vec<Transform>,
        lower_ids: Vec<Vec<usize>>,
        upper_ids: Vec<Vec<usize>>,
    ) -> Result<Self> {
        if transforms.len() != lower_ids.len() || transforms.len() != upper_ids.len() {
            return Err(ConvError::DimensionCoverage(format!(
                "{} transforms with {} lower and {} upper id lists",
                transforms.len(),
                lower_ids.len(),
                upper_ids.len()
            )));
        }

        let lower_rank = self.lengths.len();
        let upper_rank: usize = upper_ids.iter().map(Vec::len).sum();
        let mut lower_seen = vec![false; lower_rank];
        let mut upper_seen = vec![false; upper_rank];
        let mut new_lengths: Index = SmallVec::from_elem(0, upper_rank);

        for ((t, lower), upper) in transforms.iter().zip(&lower_ids).zip(&upper_ids) {
            t.validate()?;
            let declared_lower = t.lower_lengths();
            let produced_upper = t.upper_lengths();
            if lower.len() != declared_lower.len() || upper.len() != produced_upper.len() {
                return Err(ConvError::DimensionCoverage(format!(
                    "{} reads {} and writes {} dimensions, given {} lower and {} upper ids",
                    t.name(),
                    declared_lower.len(),
                    produced_upper.len(),
                    lower.len(),
                    upper.len()
                )));
            }
            for (&id, &declared) in lower.iter().zip(&declared_lower) {
                match lower_seen.get_mut(id) {
                    Some(seen) if !*seen => *seen = true,
                    Some(_) => {
                        return Err(ConvError::DimensionCoverage(format!(
                            "lower dimension {id} consumed twice"
                        )))
                    }
                    None => {
                        return Err(ConvError::DimensionCoverage(format!(
                            "lower dimension {id} out of range for rank {lower_rank}"
                        )))
                    }
                }
                if self.lengths[id] != declared {
                    return Err(ConvError::ShapeMismatch {
                        transform: t.name(),
                        dim: id,
                        expected: self.lengths[id],
                        found: declared,
                    });
                }
            }
            for (&id, &len) in upper.iter().zip(&produced_upper) {
                match upper_seen.get_mut(id) {
                    Some(seen) if !*seen => *seen = true,
                    _ => {
                        return Err(ConvError::DimensionCoverage(format!(
                            "upper dimension {id} produced twice or out of range for rank {upper_rank}"
                        )))
                    }
                }
                new_lengths[id] = len;
            }
        }

        if let Some(id) = lower_seen.iter().position(|seen| !seen) {
            return Err(ConvError::DimensionCoverage(format!(
                "lower dimension {id} is not consumed by any transform"
            )));
        }

        self.stages.push(Stage {
            transforms,
            lower_ids,
            upper_ids,
            lower_rank,
        });
        self.lengths = new_lengths;
        Ok(self)
    }

    /// Extents of the outermost (view) dimensions.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn rank(&self) -> usize {
        self.lengths.len()
    }

    pub fn native_lengths(&self) -> &[usize] {
        &self.native_lengths
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// Smallest buffer length that holds every addressable element.
    pub fn element_space_size(&self) -> usize {
        if self.native_lengths.contains(&0) {
            return self.base_offset;
        }
        self.native_lengths
            .iter()
            .zip(&self.strides)
            .fold(self.base_offset + 1, |acc, (len, stride)| acc + (len - 1) * stride)
    }

    /// Native multi-index for a view coordinate, `None` for padding.
    pub fn calculate_lower_index(&self, upper: &[usize]) -> Result<Option<Index>> {
        check_index(upper, &self.lengths)?;
        Ok(self.lower_index_of(upper))
    }

    /// Physical offset for a view coordinate, `None` for padding.
    pub fn calculate_offset(&self, upper: &[usize]) -> Result<Option<usize>> {
        check_index(upper, &self.lengths)?;
        Ok(self.offset_of(upper))
    }

    /// View coordinate of a native multi-index. `None` when some stage is not
    /// invertible.
    pub fn calculate_upper_index(&self, native: &[usize]) -> Result<Option<Index>> {
        check_index(native, &self.native_lengths)?;
        let mut current: Index = native.iter().copied().collect();
        for stage in &self.stages {
            let upper_rank: usize = stage.upper_ids.iter().map(Vec::len).sum();
            let mut upper: Index = SmallVec::from_elem(0, upper_rank);
            for ((t, lower_ids), upper_ids) in
                stage.transforms.iter().zip(&stage.lower_ids).zip(&stage.upper_ids)
            {
                let lower: Index = lower_ids.iter().map(|&id| current[id]).collect();
                let Some(produced) = t.calculate_upper_index(&lower) else {
                    return Ok(None);
                };
                for (&id, &value) in upper_ids.iter().zip(&produced) {
                    upper[id] = value;
                }
            }
            current = upper;
        }
        Ok(Some(current))
    }

    pub fn is_invertible(&self) -> bool {
        self.stages
            .iter()
            .flat_map(|s| &s.transforms)
            .all(Transform::is_invertible)
    }

    /// Whether any view coordinate can resolve to the padding sentinel.
    pub fn may_pad(&self) -> bool {
        self.stages
            .iter()
            .flat_map(|s| &s.transforms)
            .any(Transform::may_pad)
    }

    /// Unchecked variant used by kernels whose views have a fixed rank.
    pub(crate) fn lower_index_of(&self, upper: &[usize]) -> Option<Index> {
        debug_assert!(upper.iter().zip(&self.lengths).all(|(u, len)| u < len));
        let mut current: Index = upper.iter().copied().collect();
        for stage in self.stages.iter().rev() {
            let mut lower: Index = SmallVec::from_elem(0, stage.lower_rank);
            for ((t, lower_ids), upper_ids) in
                stage.transforms.iter().zip(&stage.lower_ids).zip(&stage.upper_ids)
            {
                let up: Index = upper_ids.iter().map(|&id| current[id]).collect();
                let produced = t.calculate_lower_index(&up)?;
                for (&id, &value) in lower_ids.iter().zip(&produced) {
                    lower[id] = value;
                }
            }
            current = lower;
        }
        Some(current)
    }

    pub(crate) fn offset_of(&self, upper: &[usize]) -> Option<usize> {
        let native = self.lower_index_of(upper)?;
        Some(
            native
                .iter()
                .zip(&self.strides)
                .fold(self.base_offset, |acc, (i, s)| acc + i * s),
        )
    }
}

/// Rank and per-dimension bounds of a caller-supplied coordinate.
fn check_index(index: &[usize], lengths: &[usize]) -> Result<()> {
    if index.len() != lengths.len() {
        return Err(ConvError::RankMismatch {
            expected: lengths.len(),
            found: index.len(),
        });
    }
    match index.iter().zip(lengths).position(|(i, len)| i >= len) {
        Some(dim) => Err(ConvError::IndexOutOfRange {
            dim,
            index: index[dim],
            length: lengths[dim],
        }),
        None => Ok(()),
    }
}

/// Row-major strides for `lengths`.
pub fn packed_strides(lengths: &[usize]) -> Index {
    let mut strides: Index = SmallVec::from_elem(1, lengths.len());
    for i in (0..lengths.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * lengths[i + 1];
    }
    strides
}
