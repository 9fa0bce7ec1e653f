//! Certified robustness radii from the DP label distribution.
//!
//! If the noisy network is `(eps, delta)`-DP with respect to input changes of
//! size `L`, the expected output probabilities move by at most a factor
//! `e^eps` (plus `delta`). A label is robust to attacks of size `r` when the
//! lower bound on its probability beats `e^{2 eps(r)}` times the upper bound on
//! any other class, plus `(1 + e^{eps(r)}) delta` for the Gaussian mechanism.

use ndarray::ArrayView1;
use pixeldp_core::{Hps, PixelDpError, Result, SensitivityNorm};
use tracing::debug;

use crate::draws::DrawSummary;
use crate::stats::{proportion_bounds, BoundMethod};

/// Which per-draw statistic is bounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawStatistic {
    /// Mean softmax probability.
    Softmax,
    /// Fraction of draws whose argmax is the class.
    Argmax,
}

/// Parameters for turning draw statistics into certificates.
#[derive(Clone, Debug, PartialEq)]
pub struct CertificationParams {
    /// Norm the attack is measured in; selects the mechanism.
    pub norm: SensitivityNorm,
    /// Attack size the noise was calibrated for.
    pub attack_norm_bound: f64,
    /// Epsilon at `attack_norm_bound`.
    pub dp_epsilon: f64,
    /// Delta of the Gaussian mechanism.
    pub dp_delta: f64,
    /// Total failure probability of the confidence bounds.
    pub confidence_proba: f64,
    /// Confidence bound construction.
    pub method: BoundMethod,
    /// Statistic bounded per class.
    pub statistic: DrawStatistic,
}

impl CertificationParams {
    /// Parameters matching the noise a model built from `hps` injects.
    pub fn from_hps(hps: &Hps) -> Self {
        Self {
            norm: hps.sensitivity_norm,
            attack_norm_bound: hps.attack_norm_bound,
            dp_epsilon: hps.dp_epsilon,
            dp_delta: hps.dp_delta,
            confidence_proba: hps.robustness_confidence_proba,
            method: BoundMethod::Hoeffding,
            statistic: DrawStatistic::Softmax,
        }
    }

    /// Use a different bound construction and statistic.
    pub fn with_method(mut self, method: BoundMethod, statistic: DrawStatistic) -> Self {
        self.method = method;
        self.statistic = statistic;
        self
    }

    /// Validate parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.attack_norm_bound.is_finite() || self.attack_norm_bound <= 0.0 {
            return Err(PixelDpError::invalid("attack_norm_bound must be positive"));
        }
        if !self.dp_epsilon.is_finite() || self.dp_epsilon <= 0.0 {
            return Err(PixelDpError::invalid("dp_epsilon must be positive"));
        }
        if self.norm == SensitivityNorm::L2 && !(self.dp_delta > 0.0 && self.dp_delta < 1.0) {
            return Err(PixelDpError::invalid("dp_delta must be in (0, 1)"));
        }
        if !(self.confidence_proba > 0.0 && self.confidence_proba < 1.0) {
            return Err(PixelDpError::invalid("confidence_proba must be in (0, 1)"));
        }
        if self.method == BoundMethod::ClopperPearson && self.statistic == DrawStatistic::Softmax {
            return Err(PixelDpError::invalid(
                "Clopper-Pearson bounds require the argmax statistic",
            ));
        }
        Ok(())
    }
}

/// Certified prediction for one example.
#[derive(Clone, Debug, PartialEq)]
pub struct Certificate {
    /// Predicted label (largest statistic).
    pub label: usize,
    /// Lower confidence bound on the predicted label's statistic.
    pub p_lower: f64,
    /// Upper confidence bound on every other label's statistic.
    pub p_upper: f64,
    /// Largest attack size the prediction is certified against; 0 when abstaining.
    pub robustness_size: f64,
}

impl Certificate {
    /// Whether the prediction is certified against attacks of size `size`.
    pub fn is_robust(&self, size: f64) -> bool {
        self.robustness_size > 0.0 && self.robustness_size >= size
    }
}

/// Largest attack size under the Laplace mechanism.
///
/// Robust at size `r` iff `p_lower > e^{2 eps r / L} p_upper`.
pub fn robustness_size_laplace(p_lower: f64, p_upper: f64, attack_norm_bound: f64, dp_epsilon: f64) -> f64 {
    if p_lower <= p_upper || p_lower <= 0.0 {
        return 0.0;
    }
    if p_upper <= 0.0 {
        return f64::INFINITY;
    }
    attack_norm_bound * (p_lower / p_upper).ln() / (2.0 * dp_epsilon)
}

/// Largest attack size under the Gaussian mechanism.
///
/// The Gaussian calibration only holds for `eps <= 1`, so sizes are capped at
/// `L / eps`.
pub fn robustness_size_gaussian(
    p_lower: f64,
    p_upper: f64,
    attack_norm_bound: f64,
    dp_epsilon: f64,
    dp_delta: f64,
) -> f64 {
    let robust_at = |eps: f64| p_lower > (2.0 * eps).exp() * p_upper + (1.0 + eps.exp()) * dp_delta;
    let max_eps = 1.0;
    // eps -> 0 gives the weakest condition.
    if !robust_at(1e-12) {
        return 0.0;
    }
    if robust_at(max_eps) {
        return max_eps * attack_norm_bound / dp_epsilon;
    }
    let (mut lo, mut hi) = (0.0f64, max_eps);
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if robust_at(mid) {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-12 {
            break;
        }
    }
    lo * attack_norm_bound / dp_epsilon
}

/// Certify every example in `summary`.
pub fn certify(summary: &DrawSummary, params: &CertificationParams) -> Result<Vec<Certificate>> {
    params.validate()?;
    let stats = match params.statistic {
        DrawStatistic::Softmax => summary.mean_probs.clone(),
        DrawStatistic::Argmax => summary.argmax_frequencies(),
    };
    // Bonferroni over the per-class bounds of each example.
    let alpha = params.confidence_proba / summary.num_classes().max(1) as f64;

    stats
        .outer_iter()
        .map(|row| certify_row(row, summary.n_draws, alpha, params))
        .collect()
}

fn certify_row(row: ArrayView1<'_, f64>, n_draws: usize, alpha: f64, params: &CertificationParams) -> Result<Certificate> {
    let label = row
        .iter()
        .enumerate()
        .fold(0usize, |best, (c, &v)| if v > row[best] { c } else { best });

    let (p_lower, _) = proportion_bounds(params.method, row[label], n_draws, alpha)?;
    let mut p_upper = 0.0f64;
    for (c, &v) in row.iter().enumerate() {
        if c != label {
            let (_, hi) = proportion_bounds(params.method, v, n_draws, alpha)?;
            p_upper = p_upper.max(hi);
        }
    }

    let robustness_size = match params.norm {
        SensitivityNorm::L1 => {
            robustness_size_laplace(p_lower, p_upper, params.attack_norm_bound, params.dp_epsilon)
        }
        SensitivityNorm::L2 => robustness_size_gaussian(
            p_lower,
            p_upper,
            params.attack_norm_bound,
            params.dp_epsilon,
            params.dp_delta,
        ),
    };
    debug!(label, p_lower, p_upper, robustness_size, "certified example");
    Ok(Certificate {
        label,
        p_lower,
        p_upper,
        robustness_size,
    })
}

/// Fraction of examples that are correct and certified at `size`.
pub fn certified_accuracy(certificates: &[Certificate], labels: &[usize], size: f64) -> Result<f64> {
    if certificates.len() != labels.len() {
        return Err(PixelDpError::shape(format!(
            "{} certificates for {} labels",
            certificates.len(),
            labels.len()
        )));
    }
    if certificates.is_empty() {
        return Ok(0.0);
    }
    let hits = certificates
        .iter()
        .zip(labels)
        .filter(|&(c, &y)| c.label == y && c.is_robust(size))
        .count();
    Ok(hits as f64 / certificates.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draws::aggregate_draws;
    use ndarray::{Array, IxDyn};
    use proptest::prelude::*;

    fn params(norm: SensitivityNorm) -> CertificationParams {
        CertificationParams {
            norm,
            attack_norm_bound: 0.1,
            dp_epsilon: 1.0,
            dp_delta: 0.05,
            confidence_proba: 0.05,
            method: BoundMethod::Hoeffding,
            statistic: DrawStatistic::Softmax,
        }
    }

    #[test]
    fn laplace_radius_formula() {
        let r = robustness_size_laplace(0.8, 0.1, 0.1, 1.0);
        assert!((r - 0.1 * 8.0f64.ln() / 2.0).abs() < 1e-12);
        assert_eq!(robustness_size_laplace(0.4, 0.5, 0.1, 1.0), 0.0);
        assert!(robustness_size_laplace(0.4, 0.0, 0.1, 1.0).is_infinite());
    }

    #[test]
    fn gaussian_radius_is_capped_and_abstains() {
        assert_eq!(robustness_size_gaussian(0.99, 0.0, 0.1, 1.0, 0.05), 0.1);
        assert_eq!(robustness_size_gaussian(0.5, 0.45, 0.1, 1.0, 0.05), 0.0);
        let r = robustness_size_gaussian(0.7, 0.2, 0.1, 1.0, 0.05);
        assert!(r > 0.0 && r < 0.1);
        // Condition holds just below the radius.
        let eps = r * 1.0 / 0.1;
        assert!(0.7 >= (2.0 * eps).exp() * 0.2 + (1.0 + eps.exp()) * 0.05 - 1e-9);
    }

    #[test]
    fn confident_draws_are_certified() {
        let mut preds = Array::zeros(IxDyn(&[2 * 500, 3]));
        for row in 0..1000 {
            let label = row % 2;
            preds[[row, label]] = 0.95;
            preds[[row, 2]] = 0.05;
        }
        let summary = aggregate_draws(&preds, 2).unwrap();
        let certs = certify(&summary, &params(SensitivityNorm::L1)).unwrap();
        assert_eq!(certs[0].label, 0);
        assert_eq!(certs[1].label, 1);
        assert!(certs.iter().all(|c| c.is_robust(0.05)));
        assert_eq!(certified_accuracy(&certs, &[0, 1], 0.05).unwrap(), 1.0);
        assert_eq!(certified_accuracy(&certs, &[1, 1], 0.05).unwrap(), 0.5);
    }

    #[test]
    fn split_draws_abstain() {
        let preds = Array::from_elem(IxDyn(&[40, 2]), 0.5);
        let summary = aggregate_draws(&preds, 4).unwrap();
        let certs = certify(&summary, &params(SensitivityNorm::L2)).unwrap();
        assert!(certs.iter().all(|c| c.robustness_size == 0.0 && !c.is_robust(0.0)));
    }

    #[test]
    fn argmax_counts_with_clopper_pearson() {
        let mut preds = Array::zeros(IxDyn(&[200, 2]));
        for row in 0..200 {
            preds[[row, 0]] = 0.6;
            preds[[row, 1]] = 0.4;
        }
        let summary = aggregate_draws(&preds, 1).unwrap();
        let p = params(SensitivityNorm::L1).with_method(BoundMethod::ClopperPearson, DrawStatistic::Argmax);
        let certs = certify(&summary, &p).unwrap();
        assert_eq!(certs[0].label, 0);
        assert!(certs[0].p_lower > 0.9);
        assert!(certs[0].robustness_size > 0.0);
    }

    #[test]
    fn clopper_pearson_on_softmax_is_rejected() {
        let p = params(SensitivityNorm::L1).with_method(BoundMethod::ClopperPearson, DrawStatistic::Softmax);
        assert!(p.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_laplace_radius_grows_with_margin(
            p_upper in 0.01f64..0.4,
            gap in 0.01f64..0.5,
            extra in 0.001f64..0.1,
        ) {
            let lo = p_upper + gap;
            prop_assume!(lo + extra <= 1.0);
            let r1 = robustness_size_laplace(lo, p_upper, 0.1, 1.0);
            let r2 = robustness_size_laplace(lo + extra, p_upper, 0.1, 1.0);
            prop_assert!(r2 > r1);
        }

        #[test]
        fn prop_gaussian_radius_never_exceeds_cap(
            p_lower in 0.0f64..1.0,
            p_upper in 0.0f64..1.0,
        ) {
            let r = robustness_size_gaussian(p_lower, p_upper, 0.1, 2.0, 0.05);
            prop_assert!(r >= 0.0 && r <= 0.1 / 2.0 + 1e-12);
        }
    }
}
