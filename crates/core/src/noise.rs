//! Calibrated noise layers.
//!
//! L1 sensitivity pairs with Laplace noise and L2 with Gaussian noise. The
//! noise scale is `sensitivity * dp_multiplier`, where the multiplier turns an
//! attack of size `attack_norm_bound` into an `(dp_epsilon, dp_delta)` budget.

use ndarray::{ArrayViewMut, Axis, IxDyn};
use pixeldp_prng::NoiseKey;
use rand::Rng;
use rand_distr::{Distribution, Exp, Normal};
use tracing::debug;

use crate::config::{Hps, SensitivityNorm};
use crate::error::{PixelDpError, Result};
use crate::tensor::{Scalar, Tensor};

/// Noise family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoiseDistribution {
    /// Laplace noise, scale `b`.
    Laplace,
    /// Gaussian noise, standard deviation `sigma`.
    Gaussian,
}

impl NoiseDistribution {
    /// Family matching a sensitivity norm.
    pub fn for_norm(norm: SensitivityNorm) -> Self {
        match norm {
            SensitivityNorm::L1 => Self::Laplace,
            SensitivityNorm::L2 => Self::Gaussian,
        }
    }
}

/// Noise per unit of sensitivity for the given budget.
///
/// Laplace: `L / eps`. Gaussian: `L * sqrt(2 ln(1.25 / delta)) / eps`.
pub fn dp_multiplier(norm: SensitivityNorm, attack_norm_bound: f64, epsilon: f64, delta: f64) -> f64 {
    match norm {
        SensitivityNorm::L1 => attack_norm_bound / epsilon,
        SensitivityNorm::L2 => attack_norm_bound * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon,
    }
}

/// Parameters of the noise distribution for one noise layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoiseCalibration {
    /// Distribution family.
    pub distribution: NoiseDistribution,
    /// Sensitivity of everything between the input and the noise layer.
    pub sensitivity: f64,
    /// Laplace scale or Gaussian standard deviation.
    pub scale: f64,
}

impl NoiseCalibration {
    /// Calibrate noise from a sensitivity and the budget in `hps`.
    pub fn new(sensitivity: f64, hps: &Hps) -> Result<Self> {
        Self::with_budget(
            hps.sensitivity_norm,
            sensitivity,
            hps.attack_norm_bound,
            hps.dp_epsilon,
            hps.dp_delta,
        )
    }

    /// Calibrate noise from an explicit budget.
    pub fn with_budget(
        norm: SensitivityNorm,
        sensitivity: f64,
        attack_norm_bound: f64,
        epsilon: f64,
        delta: f64,
    ) -> Result<Self> {
        if !sensitivity.is_finite() || sensitivity < 0.0 {
            return Err(PixelDpError::numerical(format!(
                "sensitivity must be finite and non-negative, got {sensitivity}"
            )));
        }
        let scale = sensitivity * dp_multiplier(norm, attack_norm_bound, epsilon, delta);
        if !scale.is_finite() {
            return Err(PixelDpError::numerical(format!("noise scale is not finite: {scale}")));
        }
        Ok(Self {
            distribution: NoiseDistribution::for_norm(norm),
            sensitivity,
            scale,
        })
    }

    /// Add noise from this distribution to every element of `view`.
    pub fn add_to<R: Rng>(&self, view: ArrayViewMut<'_, Scalar, IxDyn>, rng: &mut R) -> Result<()> {
        match self.distribution {
            NoiseDistribution::Laplace => add_laplace_noise_view(view, self.scale, rng),
            NoiseDistribution::Gaussian => add_gaussian_noise_view(view, self.scale, rng),
        }
    }
}

/// Add Gaussian noise to a tensor in-place.
///
/// A zero `sigma` leaves the tensor untouched; a negative or non-finite one
/// is a numerical error.
pub fn add_gaussian_noise<R: Rng>(tensor: &mut Tensor, sigma: f64, rng: &mut R) -> Result<()> {
    add_gaussian_noise_view(tensor.view_mut(), sigma, rng)
}

/// Add Laplace noise to a tensor in-place.
pub fn add_laplace_noise<R: Rng>(tensor: &mut Tensor, scale: f64, rng: &mut R) -> Result<()> {
    add_laplace_noise_view(tensor.view_mut(), scale, rng)
}

/// `Ok(false)` when no noise needs adding.
fn check_scale(scale: f64, len: usize) -> Result<bool> {
    if !scale.is_finite() || scale < 0.0 {
        return Err(PixelDpError::numerical(format!(
            "noise scale must be finite and non-negative, got {scale}"
        )));
    }
    Ok(scale > 0.0 && len > 0)
}

fn add_gaussian_noise_view<R: Rng>(
    mut view: ArrayViewMut<'_, Scalar, IxDyn>,
    sigma: f64,
    rng: &mut R,
) -> Result<()> {
    if !check_scale(sigma, view.len())? {
        return Ok(());
    }
    let dist = Normal::new(0.0, sigma)
        .map_err(|e| PixelDpError::numerical(format!("gaussian noise with sigma {sigma}: {e}")))?;
    view.map_inplace(|x| *x += dist.sample(rng) as Scalar);
    Ok(())
}

fn add_laplace_noise_view<R: Rng>(
    mut view: ArrayViewMut<'_, Scalar, IxDyn>,
    scale: f64,
    rng: &mut R,
) -> Result<()> {
    if !check_scale(scale, view.len())? {
        return Ok(());
    }
    // Laplace noise is the difference of two exponentials.
    let dist = Exp::new(1.0 / scale)
        .map_err(|e| PixelDpError::numerical(format!("laplace noise with scale {scale}: {e}")))?;
    view.map_inplace(|x| *x += (dist.sample(rng) - dist.sample(rng)) as Scalar);
    Ok(())
}

/// Noise injection point in the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoiseLayer {
    /// Insertion point: 0 on the image, 1 after the first conv, 2 after the second.
    pub position: usize,
}

impl NoiseLayer {
    /// Noise layer at `position`.
    pub fn new(position: usize) -> Self {
        Self { position }
    }

    /// Whether noise is injected at this position under `hps`.
    pub fn is_active(&self, hps: &Hps) -> bool {
        self.position == hps.noise_after_n_layers
    }

    /// Return `x` plus calibrated noise.
    ///
    /// `x` holds `draw_keys.len()` consecutive draw blocks along axis 0; block
    /// `k` takes its noise from the stream of `draw_keys[k]`.
    pub fn apply(&self, x: &Tensor, calibration: &NoiseCalibration, draw_keys: &[NoiseKey]) -> Result<Tensor> {
        if draw_keys.is_empty() {
            return Err(PixelDpError::config("noise layer needs at least one draw key"));
        }
        let rows = x
            .shape()
            .first()
            .copied()
            .ok_or_else(|| PixelDpError::shape("noise input has no batch axis"))?;
        if rows % draw_keys.len() != 0 {
            return Err(PixelDpError::shape(format!(
                "batch of {rows} rows cannot be split into {} draws",
                draw_keys.len()
            )));
        }
        let per_draw = rows / draw_keys.len();
        debug!(
            position = self.position,
            distribution = ?calibration.distribution,
            sensitivity = calibration.sensitivity,
            scale = calibration.scale,
            "injecting noise"
        );

        let mut out = x.clone();
        if per_draw == 0 {
            return Ok(out);
        }
        for (block, key) in out.axis_chunks_iter_mut(Axis(0), per_draw).zip(draw_keys) {
            let mut rng = key.to_rng();
            calibration.add_to(block, &mut rng)?;
        }
        Ok(out)
    }

    /// Apply noise when a calibration is given, pass `x` through otherwise.
    pub fn maybe_apply(
        &self,
        x: &Tensor,
        calibration: Option<&NoiseCalibration>,
        draw_keys: &[NoiseKey],
    ) -> Result<Tensor> {
        match calibration {
            Some(c) => self.apply(x, c, draw_keys),
            None => Ok(x.clone()),
        }
    }
}
