//! Network primitives over NHWC tensors.

use ndarray::{Array, Array1, Array2, Axis, IxDyn};
use rand::distributions::Uniform;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{PixelDpError, Result};
use crate::tensor::{expect_rank, Scalar, Tensor};

/// Output length and leading pad of a SAME-padded axis.
fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let out = (input + stride - 1) / stride;
    let total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(input);
    (out, total / 2)
}

/// Output shape of a SAME-padded conv over `[N, H, W, C]`.
pub fn conv_output_shape(
    input: &[usize],
    kernel: usize,
    out_filters: usize,
    stride: usize,
) -> Result<Vec<usize>> {
    if stride == 0 {
        return Err(PixelDpError::config("conv stride must be positive"));
    }
    let &[n, h, w, _] = input else {
        return Err(PixelDpError::shape(format!(
            "conv input expects rank 4, got shape {input:?}"
        )));
    };
    let (oh, _) = same_padding(h, kernel, stride);
    let (ow, _) = same_padding(w, kernel, stride);
    Ok(vec![n, oh, ow, out_filters])
}

/// 2-D convolution with SAME padding.
///
/// `x` is `[N, H, W, C]`, `filter` is `[kh, kw, C, O]`; the output is
/// `[N, ceil(H / stride), ceil(W / stride), O]`.
pub fn conv2d(x: &Tensor, filter: &Tensor, stride: usize) -> Result<Tensor> {
    expect_rank(x, 4, "conv input")?;
    expect_rank(filter, 4, "conv filter")?;
    if stride == 0 {
        return Err(PixelDpError::config("conv stride must be positive"));
    }
    let (n, h, w, c) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    let (kh, kw, fc, o) = (
        filter.shape()[0],
        filter.shape()[1],
        filter.shape()[2],
        filter.shape()[3],
    );
    if fc != c {
        return Err(PixelDpError::shape(format!(
            "conv filter expects {fc} input channels, input has {c}"
        )));
    }
    let (oh, pad_top) = same_padding(h, kh, stride);
    let (ow, pad_left) = same_padding(w, kw, stride);

    // im2col: one row per output pixel, columns ordered like the filter.
    let cols = kh * kw * c;
    let mut patches = Array2::<Scalar>::zeros((n * oh * ow, cols));
    for b in 0..n {
        for oy in 0..oh {
            for ox in 0..ow {
                let row = (b * oh + oy) * ow + ox;
                for i in 0..kh {
                    let Some(y) = (oy * stride + i).checked_sub(pad_top).filter(|&y| y < h) else {
                        continue;
                    };
                    for j in 0..kw {
                        let Some(xx) = (ox * stride + j).checked_sub(pad_left).filter(|&v| v < w)
                        else {
                            continue;
                        };
                        let base = (i * kw + j) * c;
                        for ch in 0..c {
                            patches[[row, base + ch]] = x[[b, y, xx, ch]];
                        }
                    }
                }
            }
        }
    }

    let w_mat = Array2::from_shape_vec((cols, o), filter.iter().copied().collect())
        .map_err(|e| PixelDpError::shape(e.to_string()))?;
    patches
        .dot(&w_mat)
        .into_shape((n, oh, ow, o))
        .map(|a| a.into_dyn())
        .map_err(|e| PixelDpError::shape(e.to_string()))
}

/// Flatten all non-batch axes into one.
pub fn flatten(x: &Tensor) -> Result<Array2<Scalar>> {
    let n = *x
        .shape()
        .first()
        .ok_or_else(|| PixelDpError::shape("cannot flatten a rank-0 tensor"))?;
    let d = x.shape()[1..].iter().product();
    Array2::from_shape_vec((n, d), x.iter().copied().collect())
        .map_err(|e| PixelDpError::shape(e.to_string()))
}

/// Fully connected layer: flatten, then `x W + b`.
pub fn dense(x: &Tensor, weights: &Tensor, biases: &Tensor) -> Result<Tensor> {
    expect_rank(weights, 2, "dense weights")?;
    expect_rank(biases, 1, "dense biases")?;
    let flat = flatten(x)?;
    let (d, o) = (weights.shape()[0], weights.shape()[1]);
    if flat.ncols() != d {
        return Err(PixelDpError::shape(format!(
            "dense layer expects {d} inputs, got {}",
            flat.ncols()
        )));
    }
    if biases.len() != o {
        return Err(PixelDpError::shape(format!(
            "dense layer has {o} outputs but {} biases",
            biases.len()
        )));
    }
    let w = weights
        .view()
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|e| PixelDpError::shape(e.to_string()))?;
    let b = biases
        .view()
        .into_dimensionality::<ndarray::Ix1>()
        .map_err(|e| PixelDpError::shape(e.to_string()))?;
    Ok((flat.dot(&w) + &b).into_dyn())
}

/// Leaky ReLU: `max(x, leakiness * x)` for `leakiness` in `[0, 1]`.
pub fn leaky_relu(x: &Tensor, leakiness: f64) -> Tensor {
    let a = leakiness as Scalar;
    x.mapv(|v| if v < 0.0 { a * v } else { v })
}

/// Row-wise softmax of `[N, C]` logits.
pub fn softmax(logits: &Tensor) -> Result<Tensor> {
    expect_rank(logits, 2, "logits")?;
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(Scalar::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    Ok(out)
}

/// Per-row softmax cross-entropy between `[N, C]` logits and label distributions.
pub fn softmax_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Array1<f64>> {
    expect_rank(logits, 2, "logits")?;
    expect_rank(labels, 2, "labels")?;
    if logits.shape() != labels.shape() {
        return Err(PixelDpError::shape(format!(
            "logits {:?} and labels {:?} differ in shape",
            logits.shape(),
            labels.shape()
        )));
    }
    let xent = logits
        .axis_iter(Axis(0))
        .zip(labels.axis_iter(Axis(0)))
        .map(|(z, y)| {
            let max = z.fold(f64::NEG_INFINITY, |m, &v| m.max(v as f64));
            let lse = max + z.iter().map(|&v| (v as f64 - max).exp()).sum::<f64>().ln();
            z.iter()
                .zip(y.iter())
                .map(|(&zi, &yi)| yi as f64 * (lse - zi as f64))
                .sum::<f64>()
        })
        .collect();
    Ok(xent)
}

/// `rate * sum(‖W‖² / 2)` over the given weight tensors.
pub fn weight_decay<'a, I>(weights: I, rate: f64) -> f64
where
    I: IntoIterator<Item = &'a Tensor>,
{
    let total: f64 = weights
        .into_iter()
        .map(|w| w.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>() / 2.0)
        .sum();
    rate * total
}

/// Conv filter drawn from `N(0, sqrt(2 / (k * k * out)))`.
pub fn init_conv_filter<R: Rng>(kernel: usize, in_filters: usize, out_filters: usize, rng: &mut R) -> Result<Tensor> {
    let fan_out = (kernel * kernel * out_filters) as f64;
    let normal = Normal::new(0.0, (2.0 / fan_out).sqrt())
        .map_err(|e| PixelDpError::invalid(format!("conv initializer: {e}")))?;
    Ok(Array::from_shape_simple_fn(
        IxDyn(&[kernel, kernel, in_filters, out_filters]),
        || normal.sample(rng) as Scalar,
    ))
}

/// Dense weights drawn uniformly from `±sqrt(3 / in)`, zero biases.
pub fn init_dense<R: Rng>(in_dim: usize, out_dim: usize, rng: &mut R) -> Result<(Tensor, Tensor)> {
    if in_dim == 0 || out_dim == 0 {
        return Err(PixelDpError::shape("dense layer dimensions must be positive"));
    }
    let limit = (3.0 / in_dim as f64).sqrt();
    let uniform = Uniform::new_inclusive(-limit, limit);
    let weights = Array::from_shape_simple_fn(IxDyn(&[in_dim, out_dim]), || {
        uniform.sample(rng) as Scalar
    });
    Ok((weights, Tensor::zeros(IxDyn(&[out_dim]))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Direct SAME convolution for cross-checking the im2col path.
    fn conv_reference(x: &Tensor, f: &Tensor, stride: usize) -> Tensor {
        let (n, h, w, c) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
        let (kh, kw, o) = (f.shape()[0], f.shape()[1], f.shape()[3]);
        let (oh, pt) = same_padding(h, kh, stride);
        let (ow, pl) = same_padding(w, kw, stride);
        let mut out = Tensor::zeros(IxDyn(&[n, oh, ow, o]));
        for b in 0..n {
            for oy in 0..oh {
                for ox in 0..ow {
                    for oc in 0..o {
                        let mut acc = 0.0;
                        for i in 0..kh {
                            for j in 0..kw {
                                let y = (oy * stride + i) as isize - pt as isize;
                                let xx = (ox * stride + j) as isize - pl as isize;
                                if y < 0 || xx < 0 || y >= h as isize || xx >= w as isize {
                                    continue;
                                }
                                for ch in 0..c {
                                    acc += x[[b, y as usize, xx as usize, ch]] * f[[i, j, ch, oc]];
                                }
                            }
                        }
                        out[[b, oy, ox, oc]] = acc;
                    }
                }
            }
        }
        out
    }

    #[test]
    fn same_padding_splits_extra_pad_to_the_end() {
        assert_eq!(same_padding(32, 5, 2), (16, 1));
        assert_eq!(same_padding(16, 5, 2), (8, 1));
        assert_eq!(same_padding(5, 3, 1), (5, 1));
    }

    #[test]
    fn conv_matches_reference() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let x = Array::from_shape_simple_fn(IxDyn(&[2, 7, 6, 3]), || rng.gen_range(-1.0..1.0));
        let f = init_conv_filter(5, 3, 4, &mut rng).unwrap();
        for stride in [1, 2, 3] {
            let got = conv2d(&x, &f, stride).unwrap();
            let want = conv_reference(&x, &f, stride);
            assert_eq!(got.shape(), want.shape());
            for (a, b) in got.iter().zip(want.iter()) {
                assert!((a - b).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn conv_rejects_channel_mismatch() {
        let x = Tensor::zeros(IxDyn(&[1, 4, 4, 3]));
        let f = Tensor::zeros(IxDyn(&[3, 3, 1, 2]));
        assert!(conv2d(&x, &f, 1).unwrap_err().is_shape());
        let bad_rank = Tensor::zeros(IxDyn(&[4, 4, 3]));
        assert!(conv2d(&bad_rank, &f, 1).unwrap_err().is_shape());
    }

    #[test]
    fn conv_output_shape_halves_with_stride_two() {
        assert_eq!(conv_output_shape(&[8, 32, 32, 3], 5, 32, 2).unwrap(), vec![8, 16, 16, 32]);
    }

    #[test]
    fn conv_output_shape_rejects_bad_input() {
        assert!(conv_output_shape(&[32, 32, 3], 5, 32, 2).unwrap_err().is_shape());
        assert!(conv_output_shape(&[8, 32, 32, 3], 5, 32, 0).unwrap_err().is_config());
    }

    #[test]
    fn dense_flattens_and_adds_bias() {
        let x = array![[[1.0, 2.0]], [[3.0, 4.0]]].into_dyn();
        let w = array![[1.0, 0.0, 1.0], [0.0, 1.0, 1.0]].into_dyn();
        let b = array![0.5, -0.5, 0.0].into_dyn();
        let y = dense(&x, &w, &b).unwrap();
        assert_eq!(y, array![[1.5, 1.5, 3.0], [3.5, 3.5, 7.0]].into_dyn());
    }

    #[test]
    fn dense_rejects_wrong_fan_in() {
        let x = Tensor::zeros(IxDyn(&[2, 3]));
        let w = Tensor::zeros(IxDyn(&[4, 2]));
        let b = Tensor::zeros(IxDyn(&[2]));
        assert!(dense(&x, &w, &b).unwrap_err().is_shape());
    }

    #[test]
    fn leaky_relu_scales_negatives() {
        let x = array![-2.0, 0.0, 3.0].into_dyn();
        assert_eq!(leaky_relu(&x, 0.1), array![-0.2, 0.0, 3.0].into_dyn());
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let z = array![[1000.0, 1000.0], [0.0, 2.0_f64.ln()]].into_dyn();
        let p = softmax(&z).unwrap();
        assert!((p[[0, 0]] - 0.5).abs() < 1e-12);
        assert!((p[[1, 1]] - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn cross_entropy_of_uniform_logits() {
        let z = Tensor::zeros(IxDyn(&[2, 4]));
        let y = array![[0.0, 1.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0]].into_dyn();
        let xent = softmax_cross_entropy(&z, &y).unwrap();
        for v in xent.iter() {
            assert!((v - 4.0f64.ln()).abs() < 1e-12);
        }
        let bad = Tensor::zeros(IxDyn(&[2, 3]));
        assert!(softmax_cross_entropy(&z, &bad).unwrap_err().is_shape());
    }

    #[test]
    fn weight_decay_is_half_squared_norm() {
        let a = array![1.0, 2.0].into_dyn();
        let b = array![[2.0]].into_dyn();
        assert!((weight_decay([&a, &b], 0.1) - 0.1 * (5.0 + 4.0) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn initializers_have_expected_shapes() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let f = init_conv_filter(5, 3, 32, &mut rng).unwrap();
        assert_eq!(f.shape(), &[5, 5, 3, 32]);
        let (w, b) = init_dense(12, 4, &mut rng).unwrap();
        assert_eq!(w.shape(), &[12, 4]);
        assert!(b.iter().all(|&v| v == 0.0));
        let limit = (3.0f64 / 12.0).sqrt();
        assert!(w.iter().all(|&v| v.abs() <= limit));
    }
}
