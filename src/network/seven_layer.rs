use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::layers::affine::{affine_backward, affine_forward, AffineCache};
use crate::layers::fused::{
    affine_relu_backward, affine_relu_forward, conv_relu_pool_backward, conv_relu_pool_forward,
    AffineReluCache, ConvReluPoolCache,
};
use crate::loss::softmax_loss;
use crate::math::{Scalar, Tensor};
use crate::network::{
    check_input, check_param_shapes, read_json, write_json, ConvNet, NetworkConfig, ParamSet,
};

/// Parameters of a [`SevenLayerConvNet`].
///
/// `w1` is `(F, C, fs, fs)`, `w2` and `w3` are `(F, F, fs, fs)`, `w4` maps
/// the flattened output of the third pool to `hidden_dim` and `w5` maps
/// `hidden_dim` to `num_classes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
pub struct SevenLayerParams<T> {
    pub w1: Tensor<T>,
    pub b1: Tensor<T>,
    pub w2: Tensor<T>,
    pub b2: Tensor<T>,
    pub w3: Tensor<T>,
    pub b3: Tensor<T>,
    pub w4: Tensor<T>,
    pub b4: Tensor<T>,
    pub w5: Tensor<T>,
    pub b5: Tensor<T>,
}

impl<T: Scalar> ParamSet<T> for SevenLayerParams<T> {
    fn named(&self) -> Vec<(&'static str, &Tensor<T>)> {
        vec![
            ("W1", &self.w1),
            ("b1", &self.b1),
            ("W2", &self.w2),
            ("b2", &self.b2),
            ("W3", &self.w3),
            ("b3", &self.b3),
            ("W4", &self.w4),
            ("b4", &self.b4),
            ("W5", &self.w5),
            ("b5", &self.b5),
        ]
    }

    fn named_mut(&mut self) -> Vec<(&'static str, &mut Tensor<T>)> {
        vec![
            ("W1", &mut self.w1),
            ("b1", &mut self.b1),
            ("W2", &mut self.w2),
            ("b2", &mut self.b2),
            ("W3", &mut self.w3),
            ("b3", &mut self.b3),
            ("W4", &mut self.w4),
            ("b4", &mut self.b4),
            ("W5", &mut self.w5),
            ("b5", &mut self.b5),
        ]
    }
}

/// [conv - relu - 2x2 max pool] x 3 - affine - relu - affine - softmax
///
/// Every pool halves H and W (floored), so the input must be at least 8x8
/// for the third pool to have a window to work on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
pub struct SevenLayerConvNet<T> {
    config: NetworkConfig,
    params: SevenLayerParams<T>,
}

struct Caches<T> {
    stages: [ConvReluPoolCache<T>; 3],
    hidden: AffineReluCache<T>,
    out: AffineCache<T>,
}

impl<T: Scalar> SevenLayerConvNet<T> {
    pub fn new(config: NetworkConfig) -> Result<Self> {
        Self::with_rng(config, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(config: NetworkConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let [w1, b1, w2, b2, w3, b3, w4, b4, w5, b5] = param_shapes(&config)?;
        let scale = config.weight_scale;
        let params = SevenLayerParams {
            w1: Tensor::randn_with(&w1, scale, rng),
            b1: Tensor::zeros(&b1),
            w2: Tensor::randn_with(&w2, scale, rng),
            b2: Tensor::zeros(&b2),
            w3: Tensor::randn_with(&w3, scale, rng),
            b3: Tensor::zeros(&b3),
            w4: Tensor::randn_with(&w4, scale, rng),
            b4: Tensor::zeros(&b4),
            w5: Tensor::randn_with(&w5, scale, rng),
            b5: Tensor::zeros(&b5),
        };
        debug!(
            input_dim = ?config.input_dim,
            num_parameters = params.num_parameters(),
            "initialised seven-layer convnet"
        );
        Ok(SevenLayerConvNet { config, params })
    }

    pub fn from_params(config: NetworkConfig, params: SevenLayerParams<T>) -> Result<Self> {
        config.validate()?;
        check_param_shapes(&params, &param_shapes(&config)?, "SevenLayerConvNet::from_params")?;
        Ok(SevenLayerConvNet { config, params })
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(self, path)
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let net: SevenLayerConvNet<T> = read_json(path)?;
        Self::from_params(net.config, net.params)
    }

    fn forward(&self, x: &Tensor<T>) -> Result<(Tensor<T>, Caches<T>)> {
        check_input(&self.config, x, "SevenLayerConvNet::forward")?;
        let p = &self.params;
        let conv_param = self.config.conv_param();
        let pool_param = self.config.pool_param();

        let (a1, c1) = conv_relu_pool_forward(x, &p.w1, &p.b1, &conv_param, &pool_param)?;
        let (a2, c2) = conv_relu_pool_forward(&a1, &p.w2, &p.b2, &conv_param, &pool_param)?;
        let (a3, c3) = conv_relu_pool_forward(&a2, &p.w3, &p.b3, &conv_param, &pool_param)?;
        let (a4, hidden) = affine_relu_forward(&a3, &p.w4, &p.b4)?;
        let (scores, out) = affine_forward(&a4, &p.w5, &p.b5)?;
        Ok((scores, Caches { stages: [c1, c2, c3], hidden, out }))
    }
}

impl<T: Scalar> ConvNet<T> for SevenLayerConvNet<T> {
    type Params = SevenLayerParams<T>;

    fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn params(&self) -> &SevenLayerParams<T> {
        &self.params
    }

    fn params_mut(&mut self) -> &mut SevenLayerParams<T> {
        &mut self.params
    }

    fn scores(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        Ok(self.forward(x)?.0)
    }

    fn loss_and_grads(&self, x: &Tensor<T>, y: &[usize]) -> Result<(T, SevenLayerParams<T>)> {
        let (scores, caches) = self.forward(x)?;
        let (data_loss, dscores) = softmax_loss(&scores, y)?;
        let reg = self.config.reg;
        let loss = data_loss + self.params.l2_penalty(reg);

        let Caches { stages: [c1, c2, c3], hidden, out } = caches;
        let (da4, w5, b5) = affine_backward(&dscores, out)?;
        let (da3, w4, b4) = affine_relu_backward(&da4, hidden)?;
        let (da2, w3, b3) = conv_relu_pool_backward(&da3, c3)?;
        let (da1, w2, b2) = conv_relu_pool_backward(&da2, c2)?;
        let (_, w1, b1) = conv_relu_pool_backward(&da1, c1)?;

        let mut grads = SevenLayerParams { w1, b1, w2, b2, w3, b3, w4, b4, w5, b5 };
        grads.add_l2_gradient(&self.params, reg)?;
        debug!(loss = loss.as_f64(), batch = y.len(), "seven-layer convnet loss");
        Ok((loss, grads))
    }
}

/// Parameter shapes in `ParamSet::named` order. The spatial size is
/// recomputed after every pooling stage.
fn param_shapes(config: &NetworkConfig) -> Result<[Vec<usize>; 10]> {
    let (c, h, w) = config.input_dim;
    let (f, fs) = (config.num_filters, config.filter_size);
    let (h1, w1) = config.stage_output(h, w)?;
    let (h2, w2) = config.stage_output(h1, w1)?;
    let (h3, w3) = config.stage_output(h2, w2)?;
    Ok([
        vec![f, c, fs, fs],
        vec![f],
        vec![f, f, fs, fs],
        vec![f],
        vec![f, f, fs, fs],
        vec![f],
        vec![f * h3 * w3, config.hidden_dim],
        vec![config.hidden_dim],
        vec![config.hidden_dim, config.num_classes],
        vec![config.num_classes],
    ])
}
