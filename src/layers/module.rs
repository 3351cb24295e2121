//! Stateful layer objects built on the functional kernels.
//!
//! Each layer keeps the cache of its most recent `forward` call until the
//! matching `backward` consumes it. A second `backward`, or one with no
//! forward before it, fails with [`CnnError::MissingCache`].

use rand::Rng;

use crate::activation::relu::{relu_backward, relu_forward, ReluCache};
use crate::error::{CnnError, Result};
use crate::layers::batchnorm::{BatchNormParam, BnMode};
use crate::layers::conv::{conv_backward, conv_forward, ConvCache, ConvParam};
use crate::layers::pool::{max_pool_backward, max_pool_forward, PoolCache, PoolParam};
use crate::layers::spatial_batchnorm::{
    spatial_batchnorm_backward, spatial_batchnorm_forward, SpatialBatchNormCache,
};
use crate::math::{Scalar, Tensor};

pub trait Layer<T: Scalar> {
    fn name(&self) -> &'static str;

    fn forward(&mut self, x: &Tensor<T>) -> Result<Tensor<T>>;

    /// Gradient with respect to the input of the last `forward` call.
    /// Parameter gradients, if any, are kept on the layer.
    fn backward(&mut self, dout: &Tensor<T>) -> Result<Tensor<T>>;
}

/// Takes the pending cache out of its slot.
fn take_cache<C>(slot: &mut Option<C>, layer: &'static str) -> Result<C> {
    slot.take().ok_or(CnnError::MissingCache(layer))
}

#[derive(Debug, Clone)]
pub struct Conv2d<T> {
    pub weights: Tensor<T>,
    pub bias: Tensor<T>,
    pub param: ConvParam,
    grads: Option<(Tensor<T>, Tensor<T>)>,
    cache: Option<ConvCache<T>>,
}

impl<T: Scalar> Conv2d<T> {
    /// `filters` filters of shape `(channels, size, size)` drawn from
    /// N(0, weight_scale²); zero biases.
    pub fn new<R: Rng + ?Sized>(
        channels: usize,
        filters: usize,
        size: usize,
        param: ConvParam,
        weight_scale: f64,
        rng: &mut R,
    ) -> Conv2d<T> {
        Conv2d {
            weights: Tensor::randn_with(&[filters, channels, size, size], weight_scale, rng),
            bias: Tensor::zeros(&[filters]),
            param,
            grads: None,
            cache: None,
        }
    }

    /// `(dw, db)` from the last backward pass.
    pub fn gradients(&self) -> Option<(&Tensor<T>, &Tensor<T>)> {
        self.grads.as_ref().map(|(dw, db)| (dw, db))
    }
}

impl<T: Scalar> Layer<T> for Conv2d<T> {
    fn name(&self) -> &'static str {
        "Conv2d"
    }

    fn forward(&mut self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let (out, cache) = conv_forward(x, &self.weights, &self.bias, &self.param)?;
        self.cache = Some(cache);
        Ok(out)
    }

    fn backward(&mut self, dout: &Tensor<T>) -> Result<Tensor<T>> {
        let name = self.name();
        let cache = take_cache(&mut self.cache, name)?;
        let (dx, dw, db) = conv_backward(dout, cache)?;
        self.grads = Some((dw, db));
        Ok(dx)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Relu<T> {
    cache: Option<ReluCache<T>>,
}

impl<T: Scalar> Layer<T> for Relu<T> {
    fn name(&self) -> &'static str {
        "Relu"
    }

    fn forward(&mut self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let (out, cache) = relu_forward(x);
        self.cache = Some(cache);
        Ok(out)
    }

    fn backward(&mut self, dout: &Tensor<T>) -> Result<Tensor<T>> {
        let name = self.name();
        let cache = take_cache(&mut self.cache, name)?;
        relu_backward(dout, cache)
    }
}

#[derive(Debug, Clone)]
pub struct MaxPool2d<T> {
    pub param: PoolParam,
    cache: Option<PoolCache<T>>,
}

impl<T: Scalar> MaxPool2d<T> {
    pub fn new(param: PoolParam) -> MaxPool2d<T> {
        MaxPool2d { param, cache: None }
    }
}

impl<T: Scalar> Layer<T> for MaxPool2d<T> {
    fn name(&self) -> &'static str {
        "MaxPool2d"
    }

    fn forward(&mut self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let (out, cache) = max_pool_forward(x, &self.param)?;
        self.cache = Some(cache);
        Ok(out)
    }

    fn backward(&mut self, dout: &Tensor<T>) -> Result<Tensor<T>> {
        let name = self.name();
        let cache = take_cache(&mut self.cache, name)?;
        max_pool_backward(dout, cache)
    }
}

/// Spatial batch normalization that owns its `gamma`/`beta` and the
/// running statistics record.
#[derive(Debug, Clone)]
pub struct SpatialBatchNorm2d<T> {
    pub gamma: Tensor<T>,
    pub beta: Tensor<T>,
    pub bn_param: BatchNormParam<T>,
    grads: Option<(Tensor<T>, Tensor<T>)>,
    cache: Option<SpatialBatchNormCache<T>>,
}

impl<T: Scalar> SpatialBatchNorm2d<T> {
    /// Unit `gamma`, zero `beta`, train mode.
    pub fn new(channels: usize) -> SpatialBatchNorm2d<T> {
        SpatialBatchNorm2d {
            gamma: Tensor::zeros(&[channels]).map(|_| T::one()),
            beta: Tensor::zeros(&[channels]),
            bn_param: BatchNormParam::new(BnMode::Train),
            grads: None,
            cache: None,
        }
    }

    pub fn set_mode(&mut self, mode: BnMode) {
        self.bn_param.mode = mode;
    }

    /// `(dgamma, dbeta)` from the last backward pass.
    pub fn gradients(&self) -> Option<(&Tensor<T>, &Tensor<T>)> {
        self.grads.as_ref().map(|(dg, db)| (dg, db))
    }
}

impl<T: Scalar> Layer<T> for SpatialBatchNorm2d<T> {
    fn name(&self) -> &'static str {
        "SpatialBatchNorm2d"
    }

    fn forward(&mut self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let (out, cache) = spatial_batchnorm_forward(x, &self.gamma, &self.beta, &mut self.bn_param)?;
        self.cache = Some(cache);
        Ok(out)
    }

    fn backward(&mut self, dout: &Tensor<T>) -> Result<Tensor<T>> {
        let name = self.name();
        let cache = take_cache(&mut self.cache, name)?;
        let (dx, dgamma, dbeta) = spatial_batchnorm_backward(dout, cache)?;
        self.grads = Some((dgamma, dbeta));
        Ok(dx)
    }
}
