//! Error types for building and running noisy networks.

/// Errors raised while configuring, building or running a PixelDP model.
///
/// None of these are recoverable at this layer; they propagate to the
/// training or evaluation driver.
#[derive(Debug, thiserror::Error)]
pub enum PixelDpError {
    /// Inconsistent or unsupported hyperparameters.
    #[error("configuration error: {msg}")]
    ConfigError {
        /// Human-readable error description.
        msg: String,
    },

    /// Tensor rank or dimension mismatch.
    #[error("shape error: {msg}")]
    ShapeError {
        /// Human-readable error description.
        msg: String,
    },

    /// Non-finite sensitivity, weights or noise scale.
    #[error("numerical error: {msg}")]
    NumericalError {
        /// Human-readable error description.
        msg: String,
    },

    /// Invalid argument to a standalone routine.
    #[error("invalid parameter: {msg}")]
    InvalidParameters {
        /// Human-readable error description.
        msg: String,
    },
}

/// Result type for PixelDP operations.
pub type Result<T> = std::result::Result<T, PixelDpError>;

impl PixelDpError {
    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError { msg: msg.into() }
    }

    /// Create a shape error.
    pub fn shape<S: Into<String>>(msg: S) -> Self {
        Self::ShapeError { msg: msg.into() }
    }

    /// Create a numerical error.
    pub fn numerical<S: Into<String>>(msg: S) -> Self {
        Self::NumericalError { msg: msg.into() }
    }

    /// Create an invalid parameter error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameters { msg: msg.into() }
    }

    /// Whether this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::ConfigError { .. })
    }

    /// Whether this is a shape error.
    pub fn is_shape(&self) -> bool {
        matches!(self, Self::ShapeError { .. })
    }

    /// Whether this is a numerical error.
    pub fn is_numerical(&self) -> bool {
        matches!(self, Self::NumericalError { .. })
    }
}
