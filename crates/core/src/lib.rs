//! Core PixelDP primitives.
//!
//! This crate provides the building blocks for certifiably robust networks:
//! multi-draw duplication, per-layer sensitivity bounds, calibrated noise
//! layers, and the convolutional and dense primitives they wrap.

#![cfg_attr(not(test), forbid(unsafe_code))]
#![cfg_attr(test, deny(unsafe_code))]
#![warn(missing_docs)]

pub mod config;
pub mod duplicate;
pub mod error;
pub mod layers;
pub mod noise;
pub mod sensitivity;
pub mod tensor;

pub use config::{ControlScheme, Hps, Mode, SensitivityNorm, MAX_NOISE_POSITION};
pub use duplicate::{draw_rows, duplicate, duplicate_pair, source_row};
pub use error::{PixelDpError, Result};
pub use layers::{
    conv2d, conv_output_shape, dense, flatten, init_conv_filter, init_dense, leaky_relu, softmax,
    softmax_cross_entropy, weight_decay,
};
pub use noise::{
    add_gaussian_noise, add_laplace_noise, dp_multiplier, NoiseCalibration, NoiseDistribution,
    NoiseLayer,
};
pub use sensitivity::{
    enforce_bound, operator_norm_bound, spectral_norm, EnforcementReport, LayerKind,
    SensitivityChain, SensitivityTracker, TrackedLayer,
};
pub use tensor::{ensure_finite, expect_rank, l1_norm, l2_norm, Scalar, Tensor};

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        conv2d, dense, duplicate, duplicate_pair, leaky_relu, softmax, softmax_cross_entropy,
        weight_decay, ControlScheme, Hps, LayerKind, Mode, NoiseCalibration, NoiseDistribution,
        NoiseLayer, PixelDpError, Result, Scalar, SensitivityChain, SensitivityNorm,
        SensitivityTracker, Tensor,
    };
}
