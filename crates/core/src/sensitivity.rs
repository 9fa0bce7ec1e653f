//! Lipschitz sensitivity of layers that precede a noise layer.
//!
//! A layer's sensitivity is an upper bound on `‖f(x) - f(x')‖ / ‖x - x'‖`
//! under the configured norm. Sensitivities of consecutive pre-noise layers
//! multiply, and the product calibrates the noise injected after them.

use ndarray::{Array2, ArrayView2};
use tracing::{debug, warn};

use crate::config::{ControlScheme, SensitivityNorm};
use crate::error::{PixelDpError, Result};
use crate::tensor::{ensure_finite, Scalar, Tensor};

const GRAM_SQUARINGS: usize = 12;
const GRAM_TOL: f64 = 1e-12;
// Covers floating-point error in the Gram products.
const ROUNDING_SLACK: f64 = 1e-9;

/// Shape of the linear map a weight tensor parameterizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    /// `[kh, kw, in, out]` filter with a square stride and SAME padding.
    Conv {
        /// Stride along both spatial axes.
        stride: usize,
    },
    /// `[in, out]` matrix.
    Dense,
}

/// Outcome of enforcing a sensitivity bound on a weight tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct EnforcementReport {
    /// Operator-norm bound of the weights before rescaling.
    pub measured: f64,
    /// Factor the weights were multiplied by (1.0 if untouched).
    pub scale: f64,
    /// Whether the weights were rescaled.
    pub clipped: bool,
}

/// Weights to use in a forward pass together with their sensitivity.
#[derive(Clone, Debug)]
pub struct TrackedLayer {
    /// Effective weights (rescaled under the bound scheme).
    pub weights: Tensor,
    /// Sensitivity bound reported to the noise layer.
    pub sensitivity: f64,
    /// Present under the bound scheme.
    pub enforcement: Option<EnforcementReport>,
}

/// Computes or enforces per-layer sensitivity under one norm and scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensitivityTracker {
    /// Norm the bound is expressed in.
    pub norm: SensitivityNorm,
    /// Enforcement or measurement.
    pub scheme: ControlScheme,
}

impl SensitivityTracker {
    /// Create a tracker.
    pub fn new(norm: SensitivityNorm, scheme: ControlScheme) -> Self {
        Self { norm, scheme }
    }

    /// Bound a pre-noise layer's weights against `target`.
    ///
    /// Under [`ControlScheme::Bound`] the returned weights are rescaled so the
    /// layer's operator norm is at most `target`, and `target` is reported.
    /// Under [`ControlScheme::Optimize`] weights are returned unchanged and the
    /// measured bound is reported.
    pub fn track(&self, name: &str, weights: &Tensor, kind: LayerKind, target: f64) -> Result<TrackedLayer> {
        let tracked = match self.scheme {
            ControlScheme::Bound => {
                let (weights, report) = enforce_bound(weights, kind, self.norm, target)?;
                if report.clipped {
                    debug!(
                        layer = name,
                        measured = report.measured,
                        scale = report.scale,
                        "rescaled weights to sensitivity bound"
                    );
                }
                TrackedLayer {
                    weights,
                    sensitivity: target,
                    enforcement: Some(report),
                }
            }
            ControlScheme::Optimize => {
                let measured = operator_norm_bound(weights, kind, self.norm)?;
                TrackedLayer {
                    weights: weights.clone(),
                    sensitivity: measured,
                    enforcement: None,
                }
            }
        };
        debug!(
            layer = name,
            norm = %self.norm,
            scheme = %self.scheme,
            sensitivity = tracked.sensitivity,
            "tracked layer sensitivity"
        );
        Ok(tracked)
    }
}

/// Upper bound on the operator norm of the layer under `norm`.
pub fn operator_norm_bound(weights: &Tensor, kind: LayerKind, norm: SensitivityNorm) -> Result<f64> {
    ensure_finite(weights, "layer weights")?;
    let bound = match (kind, norm) {
        (LayerKind::Dense, SensitivityNorm::L1) => max_row_l1(as_matrix(weights, kind)?.view()),
        (LayerKind::Dense, SensitivityNorm::L2) => spectral_norm(as_matrix(weights, kind)?.view()),
        (LayerKind::Conv { .. }, SensitivityNorm::L1) => {
            let [_, _, in_c, _] = filter_dims(weights)?;
            let mut per_channel = vec![0.0f64; in_c];
            for (ix, &w) in weights.indexed_iter() {
                per_channel[ix[2]] += (w as f64).abs();
            }
            per_channel.into_iter().fold(0.0, f64::max)
        }
        (LayerKind::Conv { stride }, SensitivityNorm::L2) => {
            let [kh, kw, _, _] = filter_dims(weights)?;
            let overlap = (ceil_div(kh, stride) * ceil_div(kw, stride)) as f64;
            overlap.sqrt() * spectral_norm(as_matrix(weights, kind)?.view())
        }
    };
    if !bound.is_finite() || bound < 0.0 {
        return Err(PixelDpError::numerical(format!(
            "layer sensitivity is not finite: {bound}"
        )));
    }
    Ok(bound)
}

/// Rescale weights so their operator norm bound is at most `target`.
pub fn enforce_bound(
    weights: &Tensor,
    kind: LayerKind,
    norm: SensitivityNorm,
    target: f64,
) -> Result<(Tensor, EnforcementReport)> {
    if !target.is_finite() || target <= 0.0 {
        return Err(PixelDpError::numerical(format!(
            "sensitivity target must be finite and positive, got {target}"
        )));
    }
    let measured = operator_norm_bound(weights, kind, norm)?;
    if measured <= target {
        return Ok((
            weights.clone(),
            EnforcementReport {
                measured,
                scale: 1.0,
                clipped: false,
            },
        ));
    }
    let scale = target / measured;
    if scale < 1e-3 {
        warn!(measured, target, "weights shrunk by more than 1000x to meet bound");
    }
    let rescaled = weights.mapv(|w| w * scale as Scalar);
    Ok((
        rescaled,
        EnforcementReport {
            measured,
            scale,
            clipped: true,
        },
    ))
}

/// Upper bound on the largest singular value of `m`.
///
/// Works on the smaller Gram matrix `G`, using `σ_max² = λ_max(G) ≤
/// ‖G^k‖_F^(1/k)` for every `k ≥ 1`. Repeated squaring tightens the bound
/// from above; it is further capped by `sqrt(‖m‖_1 ‖m‖_∞)`. The result never
/// underestimates, whatever the singular vectors look like.
pub fn spectral_norm(m: ArrayView2<'_, f64>) -> f64 {
    let (rows, cols) = m.dim();
    if rows == 0 || cols == 0 {
        return 0.0;
    }
    let holder = (max_row_l1(m) * max_row_l1(m.t())).sqrt();
    let gram = if cols <= rows { m.t().dot(&m) } else { m.dot(&m.t()) };
    let fro = frobenius(&gram);
    if fro == 0.0 {
        return 0.0;
    }
    if !fro.is_finite() {
        return holder * (1.0 + ROUNDING_SLACK);
    }

    // `power` holds G^k / ‖G^k‖_F and `log_norm` holds ln ‖G^k‖_F.
    let mut power = gram / fro;
    let mut log_norm = fro.ln();
    let mut k = 1.0f64;
    let mut lambda = fro;
    for _ in 0..GRAM_SQUARINGS {
        let squared = power.dot(&power);
        let n = frobenius(&squared);
        if n == 0.0 || !n.is_finite() {
            break;
        }
        log_norm = 2.0 * log_norm + n.ln();
        k *= 2.0;
        power = squared / n;
        let next = (log_norm / k).exp();
        let improved = next < lambda * (1.0 - GRAM_TOL);
        lambda = lambda.min(next);
        if !improved {
            break;
        }
    }
    lambda.sqrt().min(holder) * (1.0 + ROUNDING_SLACK)
}

fn frobenius(a: &Array2<f64>) -> f64 {
    a.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Product of the bounds of every transformation between two noise layers.
#[derive(Clone, Debug, PartialEq)]
pub struct SensitivityChain {
    bounds: Vec<f64>,
}

impl Default for SensitivityChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SensitivityChain {
    /// An empty chain: the identity map, sensitivity 1.
    pub fn new() -> Self {
        Self { bounds: Vec::new() }
    }

    /// Compose with a layer of the given sensitivity.
    pub fn push(&mut self, bound: f64) -> Result<()> {
        if !bound.is_finite() || bound < 0.0 {
            return Err(PixelDpError::numerical(format!(
                "sensitivity bound must be finite and non-negative, got {bound}"
            )));
        }
        self.bounds.push(bound);
        Ok(())
    }

    /// Compose with a leaky ReLU of slope `leakiness`.
    pub fn push_activation(&mut self, leakiness: f64) -> Result<()> {
        self.push(leakiness.abs().max(1.0))
    }

    /// Combined sensitivity.
    pub fn sensitivity(&self) -> f64 {
        self.bounds.iter().product()
    }

    /// Per-stage bounds in composition order.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }
}

fn ceil_div(x: usize, y: usize) -> usize {
    let y = y.max(1);
    (x + y - 1) / y
}

fn filter_dims(weights: &Tensor) -> Result<[usize; 4]> {
    match *weights.shape() {
        [kh, kw, i, o] => Ok([kh, kw, i, o]),
        _ => Err(PixelDpError::shape(format!(
            "conv filter must be [kh, kw, in, out], got {:?}",
            weights.shape()
        ))),
    }
}

/// View weights as the `[fan_in, out]` matrix they multiply patches by.
fn as_matrix(weights: &Tensor, kind: LayerKind) -> Result<Array2<f64>> {
    let (rows, cols) = match kind {
        LayerKind::Dense => match *weights.shape() {
            [i, o] => (i, o),
            _ => {
                return Err(PixelDpError::shape(format!(
                    "dense weights must be [in, out], got {:?}",
                    weights.shape()
                )))
            }
        },
        LayerKind::Conv { .. } => {
            let [kh, kw, i, o] = filter_dims(weights)?;
            (kh * kw * i, o)
        }
    };
    let flat: Vec<f64> = weights.iter().map(|&w| w as f64).collect();
    Array2::from_shape_vec((rows, cols), flat)
        .map_err(|e| PixelDpError::shape(e.to_string()))
}

fn max_row_l1(m: ArrayView2<'_, f64>) -> f64 {
    m.rows()
        .into_iter()
        .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}
