//! Multi-draw duplication of batches.
//!
//! Every example is repeated `n_draws` times along the batch axis so that each
//! copy receives an independent noise draw downstream. The whole batch is
//! tiled, so the draw index varies slowest: row `b + k * batch` of the output
//! is draw `k` of example `b`.

use std::ops::Range;

use ndarray::{concatenate, ArrayView, Axis, IxDyn};

use crate::error::{PixelDpError, Result};
use crate::tensor::Tensor;

/// Tile `x` `n_draws` times along axis 0.
pub fn duplicate(x: &Tensor, n_draws: usize) -> Result<Tensor> {
    if n_draws == 0 {
        return Err(PixelDpError::config("n_draws must be positive"));
    }
    if x.ndim() == 0 {
        return Err(PixelDpError::shape("cannot duplicate a rank-0 tensor"));
    }
    if n_draws == 1 {
        return Ok(x.clone());
    }

    let views: Vec<ArrayView<'_, _, IxDyn>> = (0..n_draws).map(|_| x.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| PixelDpError::shape(e.to_string()))
}

/// Tile images and labels in lockstep, checking their batch sizes agree.
pub fn duplicate_pair(images: &Tensor, labels: &Tensor, n_draws: usize) -> Result<(Tensor, Tensor)> {
    let (ib, lb) = (batch_size(images)?, batch_size(labels)?);
    if ib != lb {
        return Err(PixelDpError::shape(format!(
            "image batch {ib} does not match label batch {lb}"
        )));
    }
    Ok((duplicate(images, n_draws)?, duplicate(labels, n_draws)?))
}

/// Rows of the duplicated batch that belong to draw `draw`.
pub fn draw_rows(draw: usize, batch: usize) -> Range<usize> {
    draw * batch..(draw + 1) * batch
}

/// Original example index of a row in the duplicated batch.
pub fn source_row(row: usize, batch: usize) -> Result<usize> {
    if batch == 0 {
        return Err(PixelDpError::shape("source row of an empty batch"));
    }
    Ok(row % batch)
}

fn batch_size(t: &Tensor) -> Result<usize> {
    t.shape()
        .first()
        .copied()
        .ok_or_else(|| PixelDpError::shape("tensor has no batch axis"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s, Array, IxDyn};
    use proptest::prelude::*;

    #[test]
    fn one_draw_is_identity() {
        let x = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        assert_eq!(duplicate(&x, 1).unwrap(), x);
    }

    #[test]
    fn zero_draws_is_config_error() {
        let x = array![1.0].into_dyn();
        assert!(duplicate(&x, 0).unwrap_err().is_config());
    }

    #[test]
    fn draw_index_varies_slowest() {
        let x = array![[1.0], [2.0], [3.0]].into_dyn();
        let d = duplicate(&x, 2).unwrap();
        let col: Vec<f64> = d.iter().copied().collect();
        assert_eq!(col, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn labels_tile_like_images() {
        let images = Array::from_shape_fn(IxDyn(&[3, 2, 2, 1]), |ix| ix[0] as f64);
        let labels = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0]].into_dyn();
        let (di, dl) = duplicate_pair(&images, &labels, 4).unwrap();
        assert_eq!(di.shape()[0], 12);
        assert_eq!(dl.shape(), &[12, 2]);
        for row in 0..12 {
            let b = source_row(row, 3).unwrap();
            assert_eq!(di[[row, 0, 0, 0]], b as f64);
            assert_eq!(dl.slice(s![row, ..]), labels.slice(s![b, ..]));
        }
    }

    #[test]
    fn mismatched_batches_are_shape_errors() {
        let images = Array::zeros(IxDyn(&[2, 1, 1, 1]));
        let labels = Array::zeros(IxDyn(&[3, 10]));
        assert!(duplicate_pair(&images, &labels, 2).unwrap_err().is_shape());
    }

    #[test]
    fn draw_rows_partition_batch() {
        assert_eq!(draw_rows(0, 8), 0..8);
        assert_eq!(draw_rows(3, 8), 24..32);
    }

    #[test]
    fn source_row_of_empty_batch_is_shape_error() {
        assert_eq!(source_row(7, 3).unwrap(), 1);
        assert!(source_row(0, 0).unwrap_err().is_shape());
    }

    proptest! {
        #[test]
        fn prop_duplicate_tiles_rows(
            b in 1usize..5,
            h in 1usize..4,
            w in 1usize..4,
            c in 1usize..4,
            n in 1usize..5,
        ) {
            let x = Array::from_shape_fn(IxDyn(&[b, h, w, c]), |ix| {
                (ix[0] * 1000 + ix[1] * 100 + ix[2] * 10 + ix[3]) as f64
            });
            let d = duplicate(&x, n).unwrap();
            prop_assert_eq!(d.shape(), &[b * n, h, w, c]);
            for k in 0..n {
                for row in 0..b {
                    prop_assert_eq!(
                        d.index_axis(Axis(0), row + k * b),
                        x.index_axis(Axis(0), row)
                    );
                }
            }
        }
    }
}
