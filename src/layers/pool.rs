use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{CnnError, Result};
use crate::math::{Scalar, Tensor};

/// Window size and stride of a max-pooling layer. Pooling never pads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolParam {
    pub pool_height: usize,
    pub pool_width: usize,
    pub stride: usize,
}

impl PoolParam {
    pub fn new(pool_height: usize, pool_width: usize, stride: usize) -> PoolParam {
        PoolParam { pool_height, pool_width, stride }
    }

    /// Non-overlapping square windows: `size × size` with stride `size`.
    pub fn square(size: usize) -> PoolParam {
        PoolParam::new(size, size, size)
    }
}

impl Default for PoolParam {
    fn default() -> Self {
        PoolParam::square(2)
    }
}

/// `⌊(input − window) / stride⌋ + 1`.
pub fn pool_output_dim(input: usize, window: usize, stride: usize) -> Result<usize> {
    if stride == 0 || window == 0 {
        return Err(CnnError::InvalidConfig(
            "pool window and stride must be at least 1".into(),
        ));
    }
    if window > input {
        return Err(CnnError::shape("pool_output_dim", format!("window <= {input}"), window));
    }
    Ok((input - window) / stride + 1)
}

/// Values saved by [`max_pool_forward`] for [`max_pool_backward`].
#[derive(Debug, Clone)]
pub struct PoolCache<T> {
    x: Tensor<T>,
    param: PoolParam,
}

/// Max over every `pool_height × pool_width` window of an `(N, C, H, W)`
/// input, producing `(N, C, H', W')`.
pub fn max_pool_forward<T: Scalar>(
    x: &Tensor<T>,
    param: &PoolParam,
) -> Result<(Tensor<T>, PoolCache<T>)> {
    let (n, c, h, w) = x.dims4("max_pool_forward")?;
    let out_h = pool_output_dim(h, param.pool_height, param.stride)?;
    let out_w = pool_output_dim(w, param.pool_width, param.stride)?;
    trace!(input = ?x.shape(), out_h, out_w, "max_pool_forward");

    let xs = x.data();
    let mut out = Tensor::zeros(&[n, c, out_h, out_w]);
    let os = out.data_mut();
    for plane in 0..n * c {
        for i in 0..out_h {
            for j in 0..out_w {
                os[(plane * out_h + i) * out_w + j] = window_max(xs, plane, h, w, i, j, param);
            }
        }
    }
    Ok((out, PoolCache { x: x.clone(), param: *param }))
}

/// Routes each upstream value to every element of its window that equals
/// the window maximum. Windows are revisited exactly as in the forward pass,
/// so with overlapping windows (stride smaller than the window) an input
/// accumulates one contribution per window it is the maximum of.
pub fn max_pool_backward<T: Scalar>(dout: &Tensor<T>, cache: PoolCache<T>) -> Result<Tensor<T>> {
    let PoolCache { x, param } = cache;
    let (n, c, h, w) = x.dims4("max_pool_backward")?;
    let out_h = pool_output_dim(h, param.pool_height, param.stride)?;
    let out_w = pool_output_dim(w, param.pool_width, param.stride)?;
    dout.expect_shape("max_pool_backward", &[n, c, out_h, out_w])?;

    let xs = x.data();
    let ds = dout.data();
    let mut dx = Tensor::zeros_like(&x);
    let dxs = dx.data_mut();
    for plane in 0..n * c {
        for i in 0..out_h {
            for j in 0..out_w {
                let g = ds[(plane * out_h + i) * out_w + j];
                let max = window_max(xs, plane, h, w, i, j, &param);
                for ki in 0..param.pool_height {
                    let row = (plane * h + i * param.stride + ki) * w + j * param.stride;
                    for kj in 0..param.pool_width {
                        if xs[row + kj] == max {
                            dxs[row + kj] += g;
                        }
                    }
                }
            }
        }
    }
    Ok(dx)
}

fn window_max<T: Scalar>(
    xs: &[T],
    plane: usize,
    h: usize,
    w: usize,
    i: usize,
    j: usize,
    param: &PoolParam,
) -> T {
    let mut best = T::neg_infinity();
    for ki in 0..param.pool_height {
        let row = (plane * h + i * param.stride + ki) * w + j * param.stride;
        for &v in &xs[row..row + param.pool_width] {
            if v > best {
                best = v;
            }
        }
    }
    best
}
