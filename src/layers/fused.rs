//! Multi-stage layers that thread one cache per stage through a single
//! forward/backward pair.

use crate::activation::relu::{relu_backward, relu_forward, ReluCache};
use crate::error::Result;
use crate::layers::affine::{affine_backward, affine_forward, AffineCache};
use crate::layers::conv::{conv_backward, conv_forward, ConvCache, ConvParam};
use crate::layers::pool::{max_pool_backward, max_pool_forward, PoolCache, PoolParam};
use crate::math::{Scalar, Tensor};

#[derive(Debug, Clone)]
pub struct ConvReluPoolCache<T> {
    conv: ConvCache<T>,
    relu: ReluCache<T>,
    pool: PoolCache<T>,
}

/// conv → relu → max-pool.
pub fn conv_relu_pool_forward<T: Scalar>(
    x: &Tensor<T>,
    w: &Tensor<T>,
    b: &Tensor<T>,
    conv_param: &ConvParam,
    pool_param: &PoolParam,
) -> Result<(Tensor<T>, ConvReluPoolCache<T>)> {
    let (a, conv) = conv_forward(x, w, b, conv_param)?;
    let (s, relu) = relu_forward(&a);
    let (out, pool) = max_pool_forward(&s, pool_param)?;
    Ok((out, ConvReluPoolCache { conv, relu, pool }))
}

/// Returns `(dx, dw, db)`, running pool → relu → conv.
pub fn conv_relu_pool_backward<T: Scalar>(
    dout: &Tensor<T>,
    cache: ConvReluPoolCache<T>,
) -> Result<(Tensor<T>, Tensor<T>, Tensor<T>)> {
    let ConvReluPoolCache { conv, relu, pool } = cache;
    let ds = max_pool_backward(dout, pool)?;
    let da = relu_backward(&ds, relu)?;
    conv_backward(&da, conv)
}

#[derive(Debug, Clone)]
pub struct AffineReluCache<T> {
    affine: AffineCache<T>,
    relu: ReluCache<T>,
}

/// affine → relu.
pub fn affine_relu_forward<T: Scalar>(
    x: &Tensor<T>,
    w: &Tensor<T>,
    b: &Tensor<T>,
) -> Result<(Tensor<T>, AffineReluCache<T>)> {
    let (a, affine) = affine_forward(x, w, b)?;
    let (out, relu) = relu_forward(&a);
    Ok((out, AffineReluCache { affine, relu }))
}

/// Returns `(dx, dw, db)`.
pub fn affine_relu_backward<T: Scalar>(
    dout: &Tensor<T>,
    cache: AffineReluCache<T>,
) -> Result<(Tensor<T>, Tensor<T>, Tensor<T>)> {
    let AffineReluCache { affine, relu } = cache;
    let da = relu_backward(dout, relu)?;
    affine_backward(&da, affine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{eval_numerical_gradient_array, rel_error};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn conv_relu_pool_backward_matches_numerical_gradient() {
        let mut rng = StdRng::seed_from_u64(17);
        let x = Tensor::<f64>::randn_with(&[2, 3, 8, 8], 1.0, &mut rng);
        let w = Tensor::randn_with(&[3, 3, 3, 3], 1.0, &mut rng);
        let b = Tensor::randn_with(&[3], 1.0, &mut rng);
        let dout = Tensor::randn_with(&[2, 3, 4, 4], 1.0, &mut rng);
        let conv_param = ConvParam::same(3);
        let pool_param = PoolParam::square(2);

        let (out, cache) = conv_relu_pool_forward(&x, &w, &b, &conv_param, &pool_param).unwrap();
        assert_eq!(out.shape(), dout.shape());
        let (dx, dw, db) = conv_relu_pool_backward(&dout, cache).unwrap();

        let f = |x: &Tensor<f64>, w: &Tensor<f64>, b: &Tensor<f64>| {
            conv_relu_pool_forward(x, w, b, &conv_param, &pool_param).map(|r| r.0)
        };
        let dx_num = eval_numerical_gradient_array(|x| f(x, &w, &b), &x, &dout, 1e-5).unwrap();
        let dw_num = eval_numerical_gradient_array(|w| f(&x, w, &b), &w, &dout, 1e-5).unwrap();
        let db_num = eval_numerical_gradient_array(|b| f(&x, &w, b), &b, &dout, 1e-5).unwrap();

        assert!(rel_error(&dx, &dx_num) < 1e-6);
        assert!(rel_error(&dw, &dw_num) < 1e-6);
        assert!(rel_error(&db, &db_num) < 1e-6);
    }

    #[test]
    fn affine_relu_backward_matches_numerical_gradient() {
        let mut rng = StdRng::seed_from_u64(19);
        let x = Tensor::<f64>::randn_with(&[2, 3, 4], 1.0, &mut rng);
        let w = Tensor::randn_with(&[12, 10], 1.0, &mut rng);
        let b = Tensor::randn_with(&[10], 1.0, &mut rng);
        let dout = Tensor::randn_with(&[2, 10], 1.0, &mut rng);

        let (_, cache) = affine_relu_forward(&x, &w, &b).unwrap();
        let (dx, dw, db) = affine_relu_backward(&dout, cache).unwrap();

        let dx_num = eval_numerical_gradient_array(|x| Ok(affine_relu_forward(x, &w, &b)?.0), &x, &dout, 1e-5).unwrap();
        let dw_num = eval_numerical_gradient_array(|w| Ok(affine_relu_forward(&x, w, &b)?.0), &w, &dout, 1e-5).unwrap();
        let db_num = eval_numerical_gradient_array(|b| Ok(affine_relu_forward(&x, &w, b)?.0), &b, &dout, 1e-5).unwrap();

        assert_eq!(dx.shape(), x.shape());
        assert!(rel_error(&dx, &dx_num) < 1e-7);
        assert!(rel_error(&dw, &dw_num) < 1e-7);
        assert!(rel_error(&db, &db_num) < 1e-7);
    }
}
