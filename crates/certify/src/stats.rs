//! Confidence bounds on per-class probabilities estimated from noise draws.

use pixeldp_core::{PixelDpError, Result};
use statrs::distribution::{Beta, ContinuousCDF};

/// How a one-sided confidence bound is computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundMethod {
    /// Hoeffding's inequality; valid for any statistic in `[0, 1]`.
    Hoeffding,
    /// Exact binomial (Clopper-Pearson) interval; valid for argmax counts.
    ClopperPearson,
}

/// Half-width of a one-sided Hoeffding bound on a mean of `n` values in `[0, 1]`.
pub fn hoeffding_margin(n: usize, alpha: f64) -> f64 {
    if n == 0 {
        return f64::INFINITY;
    }
    ((1.0 / alpha).ln() / (2.0 * n as f64)).sqrt()
}

/// One-sided Clopper-Pearson lower bound on a binomial proportion.
pub fn clopper_pearson_lower(successes: u64, trials: u64, alpha: f64) -> Result<f64> {
    check_counts(successes, trials, alpha)?;
    if successes == 0 {
        return Ok(0.0);
    }
    let beta = Beta::new(successes as f64, (trials - successes + 1) as f64)
        .map_err(|e| PixelDpError::numerical(format!("beta distribution: {e}")))?;
    Ok(beta.inverse_cdf(alpha).clamp(0.0, 1.0))
}

/// One-sided Clopper-Pearson upper bound on a binomial proportion.
pub fn clopper_pearson_upper(successes: u64, trials: u64, alpha: f64) -> Result<f64> {
    check_counts(successes, trials, alpha)?;
    if successes == trials {
        return Ok(1.0);
    }
    let beta = Beta::new((successes + 1) as f64, (trials - successes) as f64)
        .map_err(|e| PixelDpError::numerical(format!("beta distribution: {e}")))?;
    Ok(beta.inverse_cdf(1.0 - alpha).clamp(0.0, 1.0))
}

fn check_counts(successes: u64, trials: u64, alpha: f64) -> Result<()> {
    if trials == 0 {
        return Err(PixelDpError::invalid("at least one trial is required"));
    }
    if successes > trials {
        return Err(PixelDpError::invalid(format!(
            "{successes} successes exceed {trials} trials"
        )));
    }
    if !alpha.is_finite() || alpha <= 0.0 || alpha >= 1.0 {
        return Err(PixelDpError::invalid("alpha must be in (0, 1)"));
    }
    Ok(())
}

/// Lower and upper one-sided bounds, each holding with probability `1 - alpha`.
///
/// `estimate` is the observed mean over `n` draws. Clopper-Pearson treats it
/// as a proportion of `n` trials.
pub fn proportion_bounds(method: BoundMethod, estimate: f64, n: usize, alpha: f64) -> Result<(f64, f64)> {
    if !estimate.is_finite() || !(-1e-9..=1.0 + 1e-9).contains(&estimate) {
        return Err(PixelDpError::numerical(format!(
            "draw statistic must be in [0, 1], got {estimate}"
        )));
    }
    let estimate = estimate.clamp(0.0, 1.0);
    match method {
        BoundMethod::Hoeffding => {
            let margin = hoeffding_margin(n, alpha);
            Ok(((estimate - margin).max(0.0), (estimate + margin).min(1.0)))
        }
        BoundMethod::ClopperPearson => {
            let trials = n as u64;
            let successes = (estimate * n as f64).round() as u64;
            Ok((
                clopper_pearson_lower(successes, trials, alpha)?,
                clopper_pearson_upper(successes, trials, alpha)?,
            ))
        }
    }
}
