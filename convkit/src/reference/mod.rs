//! Naive host references used as ground truth.
//!
//! - [`conv`]: direct convolution in every direction, 2-D and 3-D, any
//!   [`crate::dtype::Element`].
//! - [`activation`]: element-wise activation functions.
//! - [`batchnorm`]: batch normalization, training, inference and backward.

pub mod activation;
pub mod batchnorm;
pub mod conv;

pub use activation::{activation_backward, activation_forward, ActivationDescriptor, ActivationMode};
pub use batchnorm::{BatchNorm, BatchNormGrads, BatchNormMode, RunningStats, SavedStats};
pub use conv::{
    conv_bwd_ncdhw, conv_bwd_nchw, conv_fwd_ncdhw, conv_fwd_nchw, conv_wrw_ncdhw, conv_wrw_nchw,
    launch_config, naive_conv, Conv2dArgs, Conv3dArgs, LaunchConfig, BLOCK_SIZE,
};
