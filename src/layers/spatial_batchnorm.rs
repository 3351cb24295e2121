use tracing::trace;

use crate::error::Result;
use crate::layers::batchnorm::{batchnorm_backward, batchnorm_forward, BatchNormCache, BatchNormParam};
use crate::math::{Scalar, Tensor};

/// Values saved by [`spatial_batchnorm_forward`]: the inner 2-D batchnorm
/// cache plus the 4-D shape needed to undo the reshape.
#[derive(Debug, Clone)]
pub struct SpatialBatchNormCache<T> {
    inner: BatchNormCache<T>,
    dims: (usize, usize, usize, usize),
}

/// Batch normalization of an `(N, C, H, W)` feature map with one feature per
/// channel: statistics are taken over the `N·H·W` positions of each channel.
///
/// `gamma`, `beta` and the running statistics in `bn_param` have shape `(C,)`.
pub fn spatial_batchnorm_forward<T: Scalar>(
    x: &Tensor<T>,
    gamma: &Tensor<T>,
    beta: &Tensor<T>,
    bn_param: &mut BatchNormParam<T>,
) -> Result<(Tensor<T>, SpatialBatchNormCache<T>)> {
    let dims = x.dims4("spatial_batchnorm_forward")?;
    trace!(input = ?x.shape(), "spatial_batchnorm_forward");
    let rows = channels_last(x, dims);
    let (out_rows, inner) = batchnorm_forward(&rows, gamma, beta, bn_param)?;
    Ok((channels_first(&out_rows, dims), SpatialBatchNormCache { inner, dims }))
}

/// Returns `(dx, dgamma, dbeta)` with `dx: (N, C, H, W)` and the parameter
/// gradients of shape `(C,)`.
pub fn spatial_batchnorm_backward<T: Scalar>(
    dout: &Tensor<T>,
    cache: SpatialBatchNormCache<T>,
) -> Result<(Tensor<T>, Tensor<T>, Tensor<T>)> {
    let SpatialBatchNormCache { inner, dims } = cache;
    let (n, c, h, w) = dims;
    dout.expect_shape("spatial_batchnorm_backward", &[n, c, h, w])?;
    let (dx_rows, dgamma, dbeta) = batchnorm_backward(&channels_last(dout, dims), inner)?;
    Ok((channels_first(&dx_rows, dims), dgamma, dbeta))
}

/// `(N, C, H, W)` → `(N·H·W, C)`: channel moves to the last axis and the
/// remaining axes flatten in `(N, H, W)` order.
fn channels_last<T: Scalar>(x: &Tensor<T>, (n, c, h, w): (usize, usize, usize, usize)) -> Tensor<T> {
    let mut rows = Tensor::zeros(&[n * h * w, c]);
    let src = x.data();
    let dst = rows.data_mut();
    for ni in 0..n {
        for ci in 0..c {
            for hi in 0..h {
                for wi in 0..w {
                    let row = (ni * h + hi) * w + wi;
                    dst[row * c + ci] = src[((ni * c + ci) * h + hi) * w + wi];
                }
            }
        }
    }
    rows
}

/// Inverse of [`channels_last`].
fn channels_first<T: Scalar>(rows: &Tensor<T>, (n, c, h, w): (usize, usize, usize, usize)) -> Tensor<T> {
    let mut x = Tensor::zeros(&[n, c, h, w]);
    let src = rows.data();
    let dst = x.data_mut();
    for ni in 0..n {
        for ci in 0..c {
            for hi in 0..h {
                for wi in 0..w {
                    let row = (ni * h + hi) * w + wi;
                    dst[((ni * c + ci) * h + hi) * w + wi] = src[row * c + ci];
                }
            }
        }
    }
    x
}
