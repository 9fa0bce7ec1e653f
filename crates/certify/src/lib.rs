//! Robustness certification from Monte-Carlo noise draws.
//!
//! A PixelDP network emits one prediction per noise draw. This crate folds
//! those draws back onto their examples, bounds the expected label
//! distribution with a chosen confidence, and converts the gap between the top
//! label and the runner-up into a certified attack size.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod draws;
mod robustness;
mod stats;

pub use draws::{aggregate_draws, DrawSummary};
pub use robustness::{
    certified_accuracy, certify, robustness_size_gaussian, robustness_size_laplace, Certificate,
    CertificationParams, DrawStatistic,
};
pub use stats::{
    clopper_pearson_lower, clopper_pearson_upper, hoeffding_margin, proportion_bounds, BoundMethod,
};

/// Common imports for certification.
pub mod prelude {
    pub use crate::{
        aggregate_draws, certified_accuracy, certify, BoundMethod, Certificate,
        CertificationParams, DrawStatistic, DrawSummary,
    };
}
