use tracing::trace;

use crate::error::{CnnError, Result};
use crate::math::{Scalar, Tensor};

/// Values saved by [`affine_forward`] for [`affine_backward`].
#[derive(Debug, Clone)]
pub struct AffineCache<T> {
    x: Tensor<T>,
    w: Tensor<T>,
}

/// Fully-connected layer: `out = x · w + b`.
///
/// `x` has shape `(N, d1, ..., dk)` and is flattened row-wise to `(N, D)`
/// with `D = d1 * ... * dk`; `w` is `(D, M)` and `b` is `(M,)`. The output is
/// `(N, M)`.
pub fn affine_forward<T: Scalar>(
    x: &Tensor<T>,
    w: &Tensor<T>,
    b: &Tensor<T>,
) -> Result<(Tensor<T>, AffineCache<T>)> {
    let (d, m) = w.dims2("affine_forward")?;
    let x2d = flatten_rows(x, d)?;
    if b.shape() != [m] {
        return Err(CnnError::shape("affine_forward", [m], b.shape()));
    }
    trace!(input = ?x.shape(), weights = ?w.shape(), "affine_forward");

    let mut out = x2d.matmul(w)?;
    let n = out.shape()[0];
    let bias = b.data();
    for row in 0..n {
        for (o, &bj) in out.data_mut()[row * m..(row + 1) * m].iter_mut().zip(bias) {
            *o += bj;
        }
    }
    Ok((out, AffineCache { x: x.clone(), w: w.clone() }))
}

/// Returns `(dx, dw, db)`; `dx` has the original (unflattened) shape of `x`.
pub fn affine_backward<T: Scalar>(
    dout: &Tensor<T>,
    cache: AffineCache<T>,
) -> Result<(Tensor<T>, Tensor<T>, Tensor<T>)> {
    let AffineCache { x, w } = cache;
    let (d, m) = w.dims2("affine_backward")?;
    let x2d = flatten_rows(&x, d)?;
    let n = x2d.shape()[0];
    dout.expect_shape("affine_backward", &[n, m])?;

    let dx = dout.matmul(&w.transpose()?)?.reshape(x.shape())?;
    let dw = x2d.transpose()?.matmul(dout)?;
    let db = dout.sum_rows()?;
    Ok((dx, dw, db))
}

/// Views `x` as `(N, D)` where `N` is its leading dimension.
fn flatten_rows<T: Scalar>(x: &Tensor<T>, d: usize) -> Result<Tensor<T>> {
    let n = x.shape().first().copied().unwrap_or(0);
    let rest: usize = x.shape().iter().skip(1).product();
    if x.shape().len() < 2 || rest != d {
        return Err(CnnError::shape("affine", ("N", d), x.shape()));
    }
    x.clone().reshape(&[n, d])
}
