use crate::error::Result;
use crate::math::{Scalar, Tensor};

/// Values saved by [`relu_forward`] for [`relu_backward`]: the
/// pre-activation input.
#[derive(Debug, Clone)]
pub struct ReluCache<T> {
    x: Tensor<T>,
}

/// Element-wise `max(0, x)` for a tensor of any shape.
pub fn relu_forward<T: Scalar>(x: &Tensor<T>) -> (Tensor<T>, ReluCache<T>) {
    let out = x.map(|v| if v > T::zero() { v } else { T::zero() });
    (out, ReluCache { x: x.clone() })
}

/// Routes `dout` through the positions where the forward input was
/// strictly positive; everything else receives zero.
pub fn relu_backward<T: Scalar>(dout: &Tensor<T>, cache: ReluCache<T>) -> Result<Tensor<T>> {
    dout.zip_map(&cache.x, "relu_backward", |d, x| {
        if x > T::zero() { d } else { T::zero() }
    })
}
