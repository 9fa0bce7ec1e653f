//! Facade crate: CNN assembly with PixelDP noise layers.
//!
//! Builds a network from [`Hps`](pixeldp_core::Hps) and an [`Architecture`],
//! runs multi-draw forward passes, and re-exports the primitive and
//! certification crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cnn;
pub mod context;
pub mod model;
pub mod plan;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use pixeldp_certify as certify;
pub use pixeldp_core as core;
pub use pixeldp_prng as prng;

pub use pixeldp_certify::{
    aggregate_draws, certified_accuracy, certify, Certificate, CertificationParams,
};
pub use cnn::{Cnn, ConvSpec};
pub use context::{param_name, BuildContext, ParamStore, BIASES, WEIGHTS};
pub use pixeldp_core::{ControlScheme, Hps, Mode, PixelDpError, Result, SensitivityNorm, Tensor};
pub use model::{build_model, ForwardOutput, Model, ModelBuilder, NoiseState, Prediction};
pub use plan::{Architecture, BuildPlan, BuildStep};
pub use pixeldp_prng::NoiseKey;

/// Convenience prelude covering model assembly and certification.
pub mod prelude {
    pub use crate::cnn::Cnn;
    pub use crate::model::{build_model, ForwardOutput, Model, ModelBuilder, NoiseState};
    pub use crate::plan::{Architecture, BuildPlan, BuildStep};
    pub use pixeldp_certify::prelude::*;
    pub use pixeldp_core::prelude::*;
    pub use pixeldp_prng::prelude::*;
}
