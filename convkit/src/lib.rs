//! Convolution kernels expressed as implicit GEMM over composable tensor
//! descriptors, checked against naive reference kernels.
//!
//! - [`descriptor`]: index-space transforms (pad, embed, merge, ...) stacked
//!   into views over densely packed buffers.
//! - [`igemm`]: the GemmM x GemmN x GemmK views of each convolution
//!   direction and two GEMM backends that consume them.
//! - [`reference`]: naive convolution, activation and batch-norm kernels.
//! - [`harness`]: seeded runs of a backend against the naive kernel, with
//!   [`verify`] tolerances and [`dump`] files for offline comparison.
//! - [`layers`]: gradient and consistency checks of the activation and
//!   batch-norm references.

pub mod config;
pub mod descriptor;
pub mod dtype;
pub mod dump;
pub mod error;
pub mod harness;
pub mod igemm;
pub mod layers;
pub mod problem;
pub mod reference;
pub mod verify;

pub use descriptor::{TensorDescriptor, Transform};
pub use dtype::{Bf16, Bf16Rounding, DataType, Element};
pub use error::{ConvError, Result};
pub use igemm::{make_gemm_views, ConvTensors, GemmBackend, GemmViews};
pub use problem::{ConvProblem, Direction, TensorRole};
pub use reference::naive_conv;
