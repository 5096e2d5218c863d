//! Configuration errors raised while building descriptors and problems.
//!
//! Everything here is detected before a kernel runs. Numeric mismatches are
//! not errors; they come back as a [`crate::verify::VerificationReport`].

use thiserror::Error;

/// Library-level error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvError {
    /// A transform declared a lower extent that does not match the extent
    /// produced by the previous stage.
    #[error("shape mismatch in {transform}: dimension {dim} expected length {expected}, found {found}")]
    ShapeMismatch {
        transform: &'static str,
        dim: usize,
        expected: usize,
        found: usize,
    },

    /// A transform is malformed on its own (wrong coefficient count, zero factor, ...).
    #[error("invalid {transform} transform: {reason}")]
    InvalidTransform {
        transform: &'static str,
        reason: String,
    },

    /// The lower/upper dimension ids of a transform stage do not cover the
    /// dimensions exactly once.
    #[error("dimension coverage error: {0}")]
    DimensionCoverage(String),

    /// An index of the wrong rank was passed to a descriptor.
    #[error("index rank {found} does not match descriptor rank {expected}")]
    RankMismatch { expected: usize, found: usize },

    /// A coordinate lies outside the descriptor's extents.
    #[error("index {index} out of range for dimension {dim} of length {length}")]
    IndexOutOfRange { dim: usize, index: usize, length: usize },

    /// The convolution problem itself is malformed.
    #[error("invalid convolution problem: {0}")]
    InvalidProblem(String),

    /// GemmM/GemmN/GemmK disagree between the three operand views.
    #[error("gemm {dim} mismatch: {lhs} has {lhs_len}, {rhs} has {rhs_len}")]
    GemmDimMismatch {
        dim: &'static str,
        lhs: &'static str,
        lhs_len: usize,
        rhs: &'static str,
        rhs_len: usize,
    },

    /// A caller-supplied buffer does not have the length the problem needs.
    #[error("{tensor} buffer holds {found} elements, problem needs {expected}")]
    BufferSize {
        tensor: &'static str,
        expected: usize,
        found: usize,
    },

    /// An output view resolved to the padding sentinel, which would drop a result.
    #[error("output view {view} resolved to padding at ({row}, {col})")]
    PaddedOutput {
        view: &'static str,
        row: usize,
        col: usize,
    },
}

/// Convenience alias used across the library.
pub type Result<T> = std::result::Result<T, ConvError>;
