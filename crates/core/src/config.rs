//! Hyperparameters for a noisy, certifiable network.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PixelDpError, Result};

/// Highest noise insertion point wired into the network (0, 1 or 2).
pub const MAX_NOISE_POSITION: usize = 2;

/// Norm under which sensitivity is bounded and attacks are measured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityNorm {
    /// L1 norm; paired with Laplace noise.
    L1,
    /// L2 norm; paired with Gaussian noise.
    L2,
}

impl fmt::Display for SensitivityNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => f.write_str("l1"),
            Self::L2 => f.write_str("l2"),
        }
    }
}

impl FromStr for SensitivityNorm {
    type Err = PixelDpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            other => Err(PixelDpError::config(format!(
                "unsupported sensitivity norm '{other}'"
            ))),
        }
    }
}

/// How a pre-noise layer's sensitivity bound is established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlScheme {
    /// Rescale weights so the layer's Lipschitz constant is at most the target.
    Bound,
    /// Leave weights alone and measure the bound from their norms.
    Optimize,
}

impl fmt::Display for ControlScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bound => f.write_str("bound"),
            Self::Optimize => f.write_str("optimize"),
        }
    }
}

impl FromStr for ControlScheme {
    type Err = PixelDpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bound" => Ok(Self::Bound),
            "optimize" => Ok(Self::Optimize),
            other => Err(PixelDpError::config(format!(
                "unsupported sensitivity control scheme '{other}'"
            ))),
        }
    }
}

/// Whether a forward pass is used for training or evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Training: the weight-decay term is added to the cost.
    Train,
    /// Evaluation: the cost is the cross-entropy alone.
    Eval,
}

impl FromStr for Mode {
    type Err = PixelDpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "eval" => Ok(Self::Eval),
            other => Err(PixelDpError::config(format!("unsupported mode '{other}'"))),
        }
    }
}

/// Model hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hps {
    /// Number of noise draws per example.
    pub n_draws: usize,
    /// Number of output classes.
    pub num_classes: usize,
    /// Norm for sensitivity and attack size.
    pub sensitivity_norm: SensitivityNorm,
    /// Bound enforcement or empirical measurement.
    pub sensitivity_control_scheme: ControlScheme,
    /// Target sensitivity for each pre-noise layer, in layer order.
    pub layer_sensitivity_bounds: Vec<f64>,
    /// Number of layers before the noise layer (0 puts noise on the image).
    pub noise_after_n_layers: usize,
    /// When false, the activation runs before the noise insertion point;
    /// when true, noise is injected first and the activation follows.
    pub noise_after_activation: bool,
    /// Negative-side slope of the leaky ReLU.
    pub relu_leakiness: f64,
    /// Largest attack (in `sensitivity_norm`) the noise is calibrated for.
    pub attack_norm_bound: f64,
    /// Privacy budget epsilon at `attack_norm_bound`.
    pub dp_epsilon: f64,
    /// Privacy budget delta (Gaussian mechanism only).
    pub dp_delta: f64,
    /// Weight-decay multiplier applied in training mode.
    pub weight_decay_rate: f64,
    /// Failure probability of the certification confidence bounds.
    pub robustness_confidence_proba: f64,
}

impl Default for Hps {
    fn default() -> Self {
        Self {
            n_draws: 1,
            num_classes: 10,
            sensitivity_norm: SensitivityNorm::L2,
            sensitivity_control_scheme: ControlScheme::Bound,
            layer_sensitivity_bounds: vec![1.0],
            noise_after_n_layers: 1,
            noise_after_activation: false,
            relu_leakiness: 0.1,
            attack_norm_bound: 0.1,
            dp_epsilon: 1.0,
            dp_delta: 0.05,
            weight_decay_rate: 2e-4,
            robustness_confidence_proba: 0.05,
        }
    }
}

impl Hps {
    /// Set the number of noise draws.
    pub fn with_n_draws(mut self, n_draws: usize) -> Self {
        self.n_draws = n_draws;
        self
    }

    /// Set the number of classes.
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Set the sensitivity norm.
    pub fn with_sensitivity_norm(mut self, norm: SensitivityNorm) -> Self {
        self.sensitivity_norm = norm;
        self
    }

    /// Set the sensitivity control scheme.
    pub fn with_control_scheme(mut self, scheme: ControlScheme) -> Self {
        self.sensitivity_control_scheme = scheme;
        self
    }

    /// Set the per-layer sensitivity bounds.
    pub fn with_layer_sensitivity_bounds(mut self, bounds: Vec<f64>) -> Self {
        self.layer_sensitivity_bounds = bounds;
        self
    }

    /// Set the noise insertion point.
    pub fn with_noise_after_n_layers(mut self, n: usize) -> Self {
        self.noise_after_n_layers = n;
        self
    }

    /// Set the activation/noise ordering flag.
    pub fn with_noise_after_activation(mut self, flag: bool) -> Self {
        self.noise_after_activation = flag;
        self
    }

    /// Set the leaky ReLU slope.
    pub fn with_relu_leakiness(mut self, leakiness: f64) -> Self {
        self.relu_leakiness = leakiness;
        self
    }

    /// Set the privacy budget and attack bound used to calibrate noise.
    pub fn with_dp_budget(mut self, attack_norm_bound: f64, epsilon: f64, delta: f64) -> Self {
        self.attack_norm_bound = attack_norm_bound;
        self.dp_epsilon = epsilon;
        self.dp_delta = delta;
        self
    }

    /// Set the weight-decay multiplier.
    pub fn with_weight_decay_rate(mut self, rate: f64) -> Self {
        self.weight_decay_rate = rate;
        self
    }

    /// Whether layer `index` (0-based) precedes the noise layer.
    pub fn is_pre_noise(&self, index: usize) -> bool {
        index < self.noise_after_n_layers
    }

    /// Target sensitivity of pre-noise layer `index`.
    pub fn layer_bound(&self, index: usize) -> Result<f64> {
        self.layer_sensitivity_bounds
            .get(index)
            .copied()
            .ok_or_else(|| {
                PixelDpError::config(format!(
                    "no sensitivity bound configured for pre-noise layer {index}"
                ))
            })
    }

    /// Parse norm and scheme identifiers as they appear in flag files.
    pub fn with_identifiers(mut self, norm: &str, scheme: &str) -> Result<Self> {
        self.sensitivity_norm = norm.parse()?;
        self.sensitivity_control_scheme = scheme.parse()?;
        Ok(self)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.noise_after_n_layers > MAX_NOISE_POSITION {
            return Err(PixelDpError::config(format!(
                "noise_after_n_layers must be <= {MAX_NOISE_POSITION}, got {}",
                self.noise_after_n_layers
            )));
        }
        if self.layer_sensitivity_bounds.len() < self.noise_after_n_layers {
            return Err(PixelDpError::config(format!(
                "{} pre-noise layers need sensitivity bounds, only {} given",
                self.noise_after_n_layers,
                self.layer_sensitivity_bounds.len()
            )));
        }
        if let Some(bad) = self
            .layer_sensitivity_bounds
            .iter()
            .find(|b| !b.is_finite() || **b <= 0.0)
        {
            return Err(PixelDpError::config(format!(
                "layer sensitivity bounds must be finite and positive, got {bad}"
            )));
        }
        if self.n_draws == 0 {
            return Err(PixelDpError::config("n_draws must be positive"));
        }
        if self.num_classes < 2 {
            return Err(PixelDpError::config("num_classes must be at least 2"));
        }
        if !self.relu_leakiness.is_finite() || !(0.0..=1.0).contains(&self.relu_leakiness) {
            return Err(PixelDpError::config("relu_leakiness must be in [0, 1]"));
        }
        if !self.attack_norm_bound.is_finite() || self.attack_norm_bound <= 0.0 {
            return Err(PixelDpError::config("attack_norm_bound must be positive"));
        }
        if !self.dp_epsilon.is_finite() || self.dp_epsilon <= 0.0 {
            return Err(PixelDpError::config("dp_epsilon must be positive"));
        }
        if !self.dp_delta.is_finite() || self.dp_delta <= 0.0 || self.dp_delta >= 1.0 {
            return Err(PixelDpError::config("dp_delta must be in (0, 1)"));
        }
        if !self.weight_decay_rate.is_finite() || self.weight_decay_rate < 0.0 {
            return Err(PixelDpError::config("weight_decay_rate must be non-negative"));
        }
        let p = self.robustness_confidence_proba;
        if !p.is_finite() || p <= 0.0 || p >= 1.0 {
            return Err(PixelDpError::config(
                "robustness_confidence_proba must be in (0, 1)",
            ));
        }
        Ok(())
    }
}
