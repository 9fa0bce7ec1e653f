//! Typed, enumerable build plans.
//!
//! A plan is the ordered list of operations a forward pass performs. It is
//! derived once from [`Hps`] and an [`Architecture`]; all configuration
//! branching (noise position, activation/noise order) happens here and never
//! during execution.

use std::fmt;

use pixeldp_core::{Hps, PixelDpError, Result};

/// One operation of a forward pass.
#[derive(Clone, Debug, PartialEq)]
pub enum BuildStep {
    /// Tile the image batch `n_draws` times.
    DuplicateInputs {
        /// Tiling factor.
        n_draws: usize,
    },
    /// Add calibrated noise.
    InjectNoise {
        /// Insertion point (0, 1 or 2).
        position: usize,
    },
    /// SAME-padded convolution.
    Conv {
        /// Scope path of the layer's parameters.
        scope: String,
        /// Square filter size.
        filter_size: usize,
        /// Output channels.
        out_filters: usize,
        /// Stride along both spatial axes.
        stride: usize,
        /// Index into `layer_sensitivity_bounds` if the layer precedes noise.
        pre_noise: Option<usize>,
    },
    /// Leaky ReLU.
    Activate {
        /// Negative-side slope.
        leakiness: f64,
    },
    /// Fully connected hidden layer.
    Dense {
        /// Scope path of the layer's parameters.
        scope: String,
        /// Output width.
        units: usize,
        /// Index into `layer_sensitivity_bounds` if the layer precedes noise.
        pre_noise: Option<usize>,
    },
    /// Fully connected layer producing class logits.
    Logits {
        /// Scope path of the layer's parameters.
        scope: String,
        /// Number of classes.
        num_classes: usize,
    },
    /// Softmax over logits, producing predictions.
    Softmax,
    /// Tile the label batch `n_draws` times.
    DuplicateLabels {
        /// Tiling factor.
        n_draws: usize,
    },
    /// Mean cross-entropy plus weight decay in training mode.
    Loss {
        /// Weight-decay multiplier.
        weight_decay_rate: f64,
    },
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateInputs { n_draws } => write!(f, "duplicate-inputs x{n_draws}"),
            Self::InjectNoise { position } => write!(f, "noise@{position}"),
            Self::Conv {
                scope,
                filter_size,
                out_filters,
                stride,
                pre_noise,
            } => {
                write!(f, "conv {scope} {filter_size}x{filter_size}/{out_filters} s{stride}")?;
                if let Some(i) = pre_noise {
                    write!(f, " [pre-noise {i}]")?;
                }
                Ok(())
            }
            Self::Activate { leakiness } => write!(f, "leaky-relu {leakiness}"),
            Self::Dense {
                scope,
                units,
                pre_noise,
            } => {
                write!(f, "dense {scope} {units}")?;
                if let Some(i) = pre_noise {
                    write!(f, " [pre-noise {i}]")?;
                }
                Ok(())
            }
            Self::Logits { scope, num_classes } => write!(f, "logits {scope} {num_classes}"),
            Self::Softmax => f.write_str("softmax"),
            Self::DuplicateLabels { n_draws } => write!(f, "duplicate-labels x{n_draws}"),
            Self::Loss { .. } => f.write_str("loss"),
        }
    }
}

impl BuildStep {
    /// Scope and pre-noise index of a layer with weights, `None` otherwise.
    pub fn weighted_layer(&self) -> Option<(&str, Option<usize>)> {
        match self {
            Self::Conv {
                scope, pre_noise, ..
            }
            | Self::Dense {
                scope, pre_noise, ..
            } => Some((scope.as_str(), *pre_noise)),
            Self::Logits { scope, .. } => Some((scope.as_str(), None)),
            _ => None,
        }
    }
}

/// A network body that can be wrapped with noise certification scaffolding.
///
/// Implementations describe the layers between input duplication and the
/// softmax; duplication, label handling and the loss are added by
/// [`BuildPlan::new`].
pub trait Architecture {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Body steps, from the first noise site to the logits.
    fn body(&self, hps: &Hps) -> Result<Vec<BuildStep>>;
}

/// Push the noise step for `position` if noise is injected there.
pub fn push_noise_site(steps: &mut Vec<BuildStep>, hps: &Hps, position: usize) {
    if hps.noise_after_n_layers == position {
        steps.push(BuildStep::InjectNoise { position });
    }
}

/// Push the activation and the noise site after a layer, ordered by
/// `hps.noise_after_activation`.
pub fn push_activation_and_noise(steps: &mut Vec<BuildStep>, hps: &Hps, position: usize) {
    let activate = BuildStep::Activate {
        leakiness: hps.relu_leakiness,
    };
    if hps.noise_after_activation {
        push_noise_site(steps, hps, position);
        steps.push(activate);
    } else {
        steps.push(activate);
        push_noise_site(steps, hps, position);
    }
}

/// Pre-noise index for the `layer`-th (0-based) sensitivity-tracked layer.
pub fn pre_noise_index(hps: &Hps, layer: usize) -> Option<usize> {
    hps.is_pre_noise(layer).then_some(layer)
}

/// Ordered steps of a full forward pass.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildPlan {
    steps: Vec<BuildStep>,
    noise_position: usize,
}

impl BuildPlan {
    /// Build and check the plan for `arch` under `hps`.
    pub fn new<A: Architecture + ?Sized>(arch: &A, hps: &Hps) -> Result<Self> {
        hps.validate()?;
        let body = arch.body(hps)?;

        let mut steps = Vec::with_capacity(body.len() + 4);
        steps.push(BuildStep::DuplicateInputs {
            n_draws: hps.n_draws,
        });
        steps.extend(body);
        steps.push(BuildStep::Softmax);
        steps.push(BuildStep::DuplicateLabels {
            n_draws: hps.n_draws,
        });
        steps.push(BuildStep::Loss {
            weight_decay_rate: hps.weight_decay_rate,
        });

        let plan = Self {
            steps,
            noise_position: hps.noise_after_n_layers,
        };
        plan.check(arch.name(), hps)?;
        Ok(plan)
    }

    fn check(&self, arch: &str, hps: &Hps) -> Result<()> {
        let noise_at: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, BuildStep::InjectNoise { .. }))
            .map(|(i, _)| i)
            .collect();
        let noise_idx = match noise_at.as_slice() {
            [i] => *i,
            [] => {
                return Err(PixelDpError::config(format!(
                    "{arch} does not wire noise position {}",
                    hps.noise_after_n_layers
                )))
            }
            _ => {
                return Err(PixelDpError::config(format!(
                    "{arch} injects noise more than once"
                )))
            }
        };

        let mut expected = 0usize;
        for (i, step) in self.steps.iter().enumerate() {
            let Some((scope, pre_noise)) = step.weighted_layer() else {
                continue;
            };
            match pre_noise {
                None if i < noise_idx => {
                    return Err(PixelDpError::config(format!(
                        "layer {scope} precedes the noise layer without a sensitivity bound"
                    )));
                }
                None => {}
                Some(_) if i > noise_idx => {
                    return Err(PixelDpError::config(format!(
                        "pre-noise layer {scope} follows the noise layer"
                    )));
                }
                Some(layer) if layer != expected => {
                    return Err(PixelDpError::config(format!(
                        "pre-noise layer {scope} has index {layer}, expected {expected}"
                    )));
                }
                Some(_) => expected += 1,
            }
        }
        if expected != hps.noise_after_n_layers {
            return Err(PixelDpError::config(format!(
                "{arch} marks {expected} pre-noise layers, noise_after_n_layers is {}",
                hps.noise_after_n_layers
            )));
        }
        Ok(())
    }

    /// All steps in execution order.
    pub fn steps(&self) -> &[BuildStep] {
        &self.steps
    }

    /// Insertion point of the noise layer.
    pub fn noise_position(&self) -> usize {
        self.noise_position
    }

    /// Scopes of the layers whose sensitivity is tracked.
    pub fn pre_noise_scopes(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(BuildStep::weighted_layer)
            .filter_map(|(scope, pre_noise)| pre_noise.map(|_| scope))
            .collect()
    }

    /// One line per step, for logs and tests.
    pub fn describe(&self) -> Vec<String> {
        self.steps.iter().map(ToString::to_string).collect()
    }
}
