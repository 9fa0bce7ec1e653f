//! Tensor types and norms.

use ndarray::ArrayD;

use crate::error::{PixelDpError, Result};

/// Scalar type (f64 by default, f32 with feature flag).
#[cfg(not(feature = "f32"))]
pub type Scalar = f64;

/// Scalar type (f64 by default, f32 with feature flag).
#[cfg(feature = "f32")]
pub type Scalar = f32;

/// Dynamic-dimensional tensor.
pub type Tensor = ArrayD<Scalar>;

/// L2 norm of a tensor; NaN if any entry is NaN, inf if any entry is infinite.
pub fn l2_norm(t: &Tensor) -> f64 {
    let mut sum_sq: f64 = 0.0;
    for &v in t.iter() {
        let v = v as f64;
        if v.is_nan() {
            return f64::NAN;
        }
        if !v.is_finite() {
            return f64::INFINITY;
        }
        sum_sq += v * v;
    }
    sum_sq.sqrt()
}

/// L1 norm of a tensor with the same NaN/inf conventions as [`l2_norm`].
pub fn l1_norm(t: &Tensor) -> f64 {
    let mut sum: f64 = 0.0;
    for &v in t.iter() {
        let v = v as f64;
        if v.is_nan() {
            return f64::NAN;
        }
        sum += v.abs();
    }
    sum
}

/// Fail with a numerical error if any entry is NaN or infinite.
pub fn ensure_finite(t: &Tensor, what: &str) -> Result<()> {
    if t.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(PixelDpError::numerical(format!(
            "{what} contains non-finite values"
        )))
    }
}

/// Fail with a shape error unless `t` has exactly `rank` axes.
pub fn expect_rank(t: &Tensor, rank: usize, what: &str) -> Result<()> {
    if t.ndim() == rank {
        Ok(())
    } else {
        Err(PixelDpError::shape(format!(
            "{what} must have rank {rank}, got shape {:?}",
            t.shape()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_l2_norm() {
        let t = array![3.0, 4.0].into_dyn();
        assert!((l2_norm(&t) - 5.0).abs() < 1e-10);
    }

    #[test]
    fn test_l2_norm_nan() {
        let t = array![1.0, f64::NAN, 2.0].into_dyn();
        assert!(l2_norm(&t).is_nan());
    }

    #[test]
    fn test_l1_norm() {
        let t = array![[-1.0, 2.0], [0.5, -0.5]].into_dyn();
        assert!((l1_norm(&t) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn ensure_finite_rejects_inf() {
        let t = array![1.0, f64::INFINITY].into_dyn();
        assert!(ensure_finite(&t, "w").unwrap_err().is_numerical());
        assert!(ensure_finite(&array![1.0].into_dyn(), "w").is_ok());
    }

    #[test]
    fn expect_rank_reports_shape() {
        let t = array![[1.0]].into_dyn();
        let err = expect_rank(&t, 4, "images").unwrap_err();
        assert!(err.is_shape());
        assert!(err.to_string().contains("rank 4"));
    }
}
