//! Aggregation of per-draw predictions back onto the original examples.

use ndarray::Array2;
use pixeldp_core::{expect_rank, source_row, PixelDpError, Result, Tensor};

/// Per-example statistics over all noise draws.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawSummary {
    /// Number of noise draws per example.
    pub n_draws: usize,
    /// Mean softmax probability per example and class, `[B, C]`.
    pub mean_probs: Array2<f64>,
    /// Number of draws whose argmax is each class, `[B, C]`.
    pub argmax_counts: Array2<u64>,
}

impl DrawSummary {
    /// Number of original examples.
    pub fn batch(&self) -> usize {
        self.mean_probs.nrows()
    }

    /// Number of classes.
    pub fn num_classes(&self) -> usize {
        self.mean_probs.ncols()
    }

    /// Fraction of draws voting for each class, `[B, C]`.
    pub fn argmax_frequencies(&self) -> Array2<f64> {
        let n = self.n_draws as f64;
        self.argmax_counts.mapv(|c| c as f64 / n)
    }
}

/// Fold `[B * n_draws, C]` predictions into per-example statistics.
///
/// Row `b + k * batch` is draw `k` of example `b`, matching the layout
/// produced by [`pixeldp_core::duplicate`].
pub fn aggregate_draws(predictions: &Tensor, batch: usize) -> Result<DrawSummary> {
    expect_rank(predictions, 2, "predictions")?;
    let (rows, classes) = (predictions.shape()[0], predictions.shape()[1]);
    if batch == 0 || rows == 0 || rows % batch != 0 {
        return Err(PixelDpError::shape(format!(
            "{rows} prediction rows are not a whole number of draws of batch {batch}"
        )));
    }
    let n_draws = rows / batch;

    let mut mean_probs = Array2::<f64>::zeros((batch, classes));
    let mut argmax_counts = Array2::<u64>::zeros((batch, classes));
    for (row, probs) in predictions.outer_iter().enumerate() {
        let b = source_row(row, batch)?;
        let mut best = 0usize;
        for (c, &p) in probs.iter().enumerate() {
            mean_probs[[b, c]] += p as f64;
            if p > probs[best] {
                best = c;
            }
        }
        argmax_counts[[b, best]] += 1;
    }
    mean_probs.mapv_inplace(|v| v / n_draws as f64);

    Ok(DrawSummary {
        n_draws,
        mean_probs,
        argmax_counts,
    })
}
