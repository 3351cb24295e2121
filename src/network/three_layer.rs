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

/// Parameters of a [`ThreeLayerConvNet`]. The gradients returned by
/// [`ConvNet::loss_and_grads`] use the same type with identical shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
pub struct ThreeLayerParams<T> {
    /// `(F, C, fs, fs)`
    pub w1: Tensor<T>,
    pub b1: Tensor<T>,
    /// `(F · H/2 · W/2, hidden_dim)`
    pub w2: Tensor<T>,
    pub b2: Tensor<T>,
    /// `(hidden_dim, num_classes)`
    pub w3: Tensor<T>,
    pub b3: Tensor<T>,
}

impl<T: Scalar> ParamSet<T> for ThreeLayerParams<T> {
    fn named(&self) -> Vec<(&'static str, &Tensor<T>)> {
        vec![
            ("W1", &self.w1),
            ("b1", &self.b1),
            ("W2", &self.w2),
            ("b2", &self.b2),
            ("W3", &self.w3),
            ("b3", &self.b3),
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
        ]
    }
}

/// conv - relu - 2x2 max pool - affine - relu - affine - softmax
///
/// Operates on minibatches of shape `(N, C, H, W)`. The convolution keeps
/// the spatial size, so the pooled map is `(F, H/2, W/2)` (floored).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
pub struct ThreeLayerConvNet<T> {
    config: NetworkConfig,
    params: ThreeLayerParams<T>,
}

struct Caches<T> {
    stage1: ConvReluPoolCache<T>,
    hidden: AffineReluCache<T>,
    out: AffineCache<T>,
}

impl<T: Scalar> ThreeLayerConvNet<T> {
    /// Builds a network with weights drawn from N(0, weight_scale²) and
    /// zero biases, using the thread-local RNG.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        Self::with_rng(config, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(config: NetworkConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let [w1, b1, w2, b2, w3, b3] = param_shapes(&config)?;
        let scale = config.weight_scale;
        let params = ThreeLayerParams {
            w1: Tensor::randn_with(&w1, scale, rng),
            b1: Tensor::zeros(&b1),
            w2: Tensor::randn_with(&w2, scale, rng),
            b2: Tensor::zeros(&b2),
            w3: Tensor::randn_with(&w3, scale, rng),
            b3: Tensor::zeros(&b3),
        };
        debug!(
            input_dim = ?config.input_dim,
            num_parameters = params.num_parameters(),
            "initialised three-layer convnet"
        );
        Ok(ThreeLayerConvNet { config, params })
    }

    /// Wraps existing parameters, checking them against the shapes `config`
    /// implies.
    pub fn from_params(config: NetworkConfig, params: ThreeLayerParams<T>) -> Result<Self> {
        config.validate()?;
        check_param_shapes(&params, &param_shapes(&config)?, "ThreeLayerConvNet::from_params")?;
        Ok(ThreeLayerConvNet { config, params })
    }

    /// Writes the config and all parameters as pretty-printed JSON.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(self, path)
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let net: ThreeLayerConvNet<T> = read_json(path)?;
        Self::from_params(net.config, net.params)
    }

    fn forward(&self, x: &Tensor<T>) -> Result<(Tensor<T>, Caches<T>)> {
        check_input(&self.config, x, "ThreeLayerConvNet::forward")?;
        let p = &self.params;
        let conv_param = self.config.conv_param();
        let pool_param = self.config.pool_param();

        let (a1, stage1) = conv_relu_pool_forward(x, &p.w1, &p.b1, &conv_param, &pool_param)?;
        let (a2, hidden) = affine_relu_forward(&a1, &p.w2, &p.b2)?;
        let (scores, out) = affine_forward(&a2, &p.w3, &p.b3)?;
        Ok((scores, Caches { stage1, hidden, out }))
    }
}

impl<T: Scalar> ConvNet<T> for ThreeLayerConvNet<T> {
    type Params = ThreeLayerParams<T>;

    fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn params(&self) -> &ThreeLayerParams<T> {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ThreeLayerParams<T> {
        &mut self.params
    }

    fn scores(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        Ok(self.forward(x)?.0)
    }

    fn loss_and_grads(&self, x: &Tensor<T>, y: &[usize]) -> Result<(T, ThreeLayerParams<T>)> {
        let (scores, caches) = self.forward(x)?;
        let (data_loss, dscores) = softmax_loss(&scores, y)?;
        let reg = self.config.reg;
        let loss = data_loss + self.params.l2_penalty(reg);

        let Caches { stage1, hidden, out } = caches;
        let (da2, w3, b3) = affine_backward(&dscores, out)?;
        let (da1, w2, b2) = affine_relu_backward(&da2, hidden)?;
        let (_, w1, b1) = conv_relu_pool_backward(&da1, stage1)?;

        let mut grads = ThreeLayerParams { w1, b1, w2, b2, w3, b3 };
        grads.add_l2_gradient(&self.params, reg)?;
        debug!(loss = loss.as_f64(), batch = y.len(), "three-layer convnet loss");
        Ok((loss, grads))
    }
}

/// Parameter shapes in `ParamSet::named` order.
fn param_shapes(config: &NetworkConfig) -> Result<[Vec<usize>; 6]> {
    let (c, h, w) = config.input_dim;
    let (f, fs) = (config.num_filters, config.filter_size);
    let (hp, wp) = config.stage_output(h, w)?;
    Ok([
        vec![f, c, fs, fs],
        vec![f],
        vec![f * hp * wp, config.hidden_dim],
        vec![config.hidden_dim],
        vec![config.hidden_dim, config.num_classes],
        vec![config.num_classes],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CnnError;
    use crate::gradcheck::check_network_gradients;
    use crate::network::Evaluation;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn small_config() -> NetworkConfig {
        NetworkConfig {
            input_dim: (3, 6, 6),
            num_filters: 3,
            filter_size: 3,
            hidden_dim: 7,
            num_classes: 4,
            weight_scale: 1e-1,
            reg: 0.0,
        }
    }

    #[test]
    fn parameter_shapes_follow_config() {
        let net = ThreeLayerConvNet::<f64>::with_rng(small_config(), &mut StdRng::seed_from_u64(1)).unwrap();
        let shapes: Vec<(&str, Vec<usize>)> =
            net.params().named().into_iter().map(|(n, t)| (n, t.shape().to_vec())).collect();
        assert_eq!(
            shapes,
            vec![
                ("W1", vec![3, 3, 3, 3]),
                ("b1", vec![3]),
                ("W2", vec![27, 7]),
                ("b2", vec![7]),
                ("W3", vec![7, 4]),
                ("b3", vec![4]),
            ]
        );
        assert!(net.params().b1.data().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn initial_loss_is_near_log_num_classes() {
        let config = NetworkConfig { weight_scale: 1e-3, num_classes: 10, ..small_config() };
        let mut rng = StdRng::seed_from_u64(2);
        let net = ThreeLayerConvNet::<f64>::with_rng(config, &mut rng).unwrap();
        let x = Tensor::randn_with(&[4, 3, 6, 6], 1.0, &mut rng);
        let (loss, _) = net.loss_and_grads(&x, &[0, 1, 2, 9]).unwrap();
        assert_abs_diff_eq!(loss, (10.0f64).ln(), epsilon = 1e-3);
    }

    #[test]
    fn scores_without_labels() {
        let mut rng = StdRng::seed_from_u64(3);
        let net = ThreeLayerConvNet::<f64>::with_rng(small_config(), &mut rng).unwrap();
        let x = Tensor::randn_with(&[5, 3, 6, 6], 1.0, &mut rng);
        match net.loss(&x, None).unwrap() {
            Evaluation::Scores(scores) => assert_eq!(scores.shape(), &[5, 4]),
            Evaluation::Training { .. } => panic!("expected scores"),
        }
        assert_eq!(net.predict(&x).unwrap().len(), 5);
    }

    #[test]
    fn gradients_match_numerical() {
        let config = NetworkConfig { reg: 0.1, ..small_config() };
        let mut rng = StdRng::seed_from_u64(4);
        let mut net = ThreeLayerConvNet::<f64>::with_rng(config, &mut rng).unwrap();
        let x = Tensor::randn_with(&[2, 3, 6, 6], 1.0, &mut rng);
        let report = check_network_gradients(&mut net, &x, &[1, 3], 1e-5).unwrap();
        assert_eq!(report.len(), 6);
        for (name, err) in report {
            assert!(err < 1e-3, "{name}: relative error {err}");
        }
    }

    #[test]
    fn rejects_wrong_image_size() {
        let net = ThreeLayerConvNet::<f32>::new(small_config()).unwrap();
        let x = Tensor::zeros(&[1, 3, 8, 8]);
        assert!(matches!(net.scores(&x), Err(CnnError::ShapeMismatch { .. })));
    }

    #[test]
    fn from_params_rejects_mismatched_shapes() {
        let net = ThreeLayerConvNet::<f64>::new(small_config()).unwrap();
        let mut params = net.params().clone();
        params.w2 = Tensor::zeros(&[26, 7]);
        assert!(ThreeLayerConvNet::from_params(small_config(), params).is_err());
    }
}
