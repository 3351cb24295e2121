//! Per-feature batch normalization over `(N, D)` inputs.
//!
//! In `Train` mode the batch mean and biased batch variance normalise the
//! input and are folded into the running statistics:
//!
//! ```text
//! running_mean = momentum * running_mean + (1 - momentum) * batch_mean
//! running_var  = momentum * running_var  + (1 - momentum) * batch_var
//! ```
//!
//! In `Test` mode the running statistics are used as-is and never written.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{CnnError, Result};
use crate::math::{Scalar, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BnMode {
    Train,
    Test,
}

impl FromStr for BnMode {
    type Err = CnnError;

    fn from_str(s: &str) -> Result<BnMode> {
        match s {
            "train" => Ok(BnMode::Train),
            "test" => Ok(BnMode::Test),
            other => Err(CnnError::InvalidConfig(format!(
                "unrecognized batchnorm mode {other:?} (expected \"train\" or \"test\")"
            ))),
        }
    }
}

impl fmt::Display for BnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BnMode::Train => write!(f, "train"),
            BnMode::Test => write!(f, "test"),
        }
    }
}

/// Configuration and running statistics of one batch-normalization layer.
///
/// The running statistics are the only state carried from one call to the
/// next; the caller keeps this record alive across training steps. They are
/// zero-initialised on the first forward call that sees the feature count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
pub struct BatchNormParam<T> {
    pub mode: BnMode,
    pub eps: f64,
    pub momentum: f64,
    pub running_mean: Option<Tensor<T>>,
    pub running_var: Option<Tensor<T>>,
}

impl<T: Scalar> BatchNormParam<T> {
    /// `eps = 1e-5`, `momentum = 0.9`, no running statistics yet.
    pub fn new(mode: BnMode) -> BatchNormParam<T> {
        BatchNormParam {
            mode,
            eps: 1e-5,
            momentum: 0.9,
            running_mean: None,
            running_var: None,
        }
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.eps > 0.0 && self.eps.is_finite()) {
            return Err(CnnError::InvalidConfig(format!("eps must be positive, got {}", self.eps)));
        }
        if !(0.0..=1.0).contains(&self.momentum) {
            return Err(CnnError::InvalidConfig(format!(
                "momentum must be in [0, 1], got {}",
                self.momentum
            )));
        }
        Ok(())
    }

    /// Running statistics for `d` features, created as zeros when absent.
    fn running_stats(&mut self, d: usize) -> Result<(&mut Tensor<T>, &mut Tensor<T>)> {
        let mean = self.running_mean.get_or_insert_with(|| Tensor::zeros(&[d]));
        mean.expect_shape("batchnorm running_mean", &[d])?;
        let var = self.running_var.get_or_insert_with(|| Tensor::zeros(&[d]));
        var.expect_shape("batchnorm running_var", &[d])?;
        Ok((mean, var))
    }
}

/// Values saved by [`batchnorm_forward`] for [`batchnorm_backward`].
#[derive(Debug, Clone)]
pub struct BatchNormCache<T> {
    mode: BnMode,
    x_hat: Tensor<T>,
    gamma: Tensor<T>,
    inv_std: Vec<T>,
}

/// Normalises each column of `x: (N, D)` then applies `gamma[d] * x̂ + beta[d]`.
pub fn batchnorm_forward<T: Scalar>(
    x: &Tensor<T>,
    gamma: &Tensor<T>,
    beta: &Tensor<T>,
    bn_param: &mut BatchNormParam<T>,
) -> Result<(Tensor<T>, BatchNormCache<T>)> {
    let (n, d) = x.dims2("batchnorm_forward")?;
    gamma.expect_shape("batchnorm_forward gamma", &[d])?;
    beta.expect_shape("batchnorm_forward beta", &[d])?;
    bn_param.validate()?;
    if n == 0 {
        return Err(CnnError::shape("batchnorm_forward", "at least one row", x.shape()));
    }
    trace!(input = ?x.shape(), mode = %bn_param.mode, "batchnorm_forward");

    let eps = T::cast(bn_param.eps);
    let momentum = T::cast(bn_param.momentum);
    let mode = bn_param.mode;
    let (running_mean, running_var) = bn_param.running_stats(d)?;

    let (mean, var) = match mode {
        BnMode::Train => {
            let (mean, var) = column_stats(x);
            for k in 0..d {
                let rm = &mut running_mean.data_mut()[k];
                *rm = momentum * *rm + (T::one() - momentum) * mean[k];
                let rv = &mut running_var.data_mut()[k];
                *rv = momentum * *rv + (T::one() - momentum) * var[k];
            }
            (mean, var)
        }
        BnMode::Test => (running_mean.data().to_vec(), running_var.data().to_vec()),
    };

    let inv_std: Vec<T> = var.iter().map(|&v| T::one() / (v + eps).sqrt()).collect();
    let xs = x.data();
    let mut x_hat = Tensor::zeros(&[n, d]);
    let mut out = Tensor::zeros(&[n, d]);
    for row in 0..n {
        for k in 0..d {
            let idx = row * d + k;
            let xh = (xs[idx] - mean[k]) * inv_std[k];
            x_hat.data_mut()[idx] = xh;
            out.data_mut()[idx] = gamma.data()[k] * xh + beta.data()[k];
        }
    }

    let cache = BatchNormCache { mode, x_hat, gamma: gamma.clone(), inv_std };
    Ok((out, cache))
}

/// Returns `(dx, dgamma, dbeta)`.
///
/// For a `Train` cache the statistics depend on the batch, giving
/// `dx = γ·σ⁻¹/N · (N·dy − Σdy − x̂·Σ(dy·x̂))`. For a `Test` cache the
/// statistics are constants and `dx = γ·σ⁻¹·dy`.
pub fn batchnorm_backward<T: Scalar>(
    dout: &Tensor<T>,
    cache: BatchNormCache<T>,
) -> Result<(Tensor<T>, Tensor<T>, Tensor<T>)> {
    let BatchNormCache { mode, x_hat, gamma, inv_std } = cache;
    let (n, d) = x_hat.dims2("batchnorm_backward")?;
    dout.expect_shape("batchnorm_backward", &[n, d])?;

    let ds = dout.data();
    let xh = x_hat.data();
    let mut dgamma = Tensor::zeros(&[d]);
    let mut dbeta = Tensor::zeros(&[d]);
    for row in 0..n {
        for k in 0..d {
            let idx = row * d + k;
            dbeta.data_mut()[k] += ds[idx];
            dgamma.data_mut()[k] += ds[idx] * xh[idx];
        }
    }

    let count = T::from_usize(n);
    let mut dx = Tensor::zeros(&[n, d]);
    for row in 0..n {
        for k in 0..d {
            let idx = row * d + k;
            let scale = gamma.data()[k] * inv_std[k];
            dx.data_mut()[idx] = match mode {
                BnMode::Train => {
                    scale / count
                        * (count * ds[idx] - dbeta.data()[k] - xh[idx] * dgamma.data()[k])
                }
                BnMode::Test => scale * ds[idx],
            };
        }
    }
    Ok((dx, dgamma, dbeta))
}

/// Per-column mean and biased variance of an `(N, D)` tensor.
fn column_stats<T: Scalar>(x: &Tensor<T>) -> (Vec<T>, Vec<T>) {
    let (n, d) = (x.shape()[0], x.shape()[1]);
    let count = T::from_usize(n);
    let xs = x.data();
    let mut mean = vec![T::zero(); d];
    for row in 0..n {
        for k in 0..d {
            mean[k] += xs[row * d + k];
        }
    }
    for m in &mut mean {
        *m /= count;
    }
    let mut var = vec![T::zero(); d];
    for row in 0..n {
        for k in 0..d {
            let diff = xs[row * d + k] - mean[k];
            var[k] += diff * diff;
        }
    }
    for v in &mut var {
        *v /= count;
    }
    (mean, var)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{eval_numerical_gradient_array, rel_error};
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn shifted_input(rng: &mut StdRng, n: usize, d: usize) -> Tensor<f64> {
        let mut x = Tensor::<f64>::randn_with(&[n, d], 2.0, rng);
        for v in x.data_mut() {
            *v += 5.0;
        }
        x
    }

    #[test]
    fn train_mode_output_is_standardised() {
        let mut rng = StdRng::seed_from_u64(0);
        let x = shifted_input(&mut rng, 200, 3);
        let gamma = Tensor::from_f64(&[3], &[1.0, 1.0, 1.0]).unwrap();
        let beta = Tensor::zeros(&[3]);
        let mut param = BatchNormParam::new(BnMode::Train);
        let (out, _) = batchnorm_forward(&x, &gamma, &beta, &mut param).unwrap();

        let (mean, var) = column_stats(&out);
        for k in 0..3 {
            assert_abs_diff_eq!(mean[k], 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(var[k], 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn gamma_and_beta_scale_and_shift() {
        let mut rng = StdRng::seed_from_u64(1);
        let x = shifted_input(&mut rng, 100, 2);
        let gamma = Tensor::from_f64(&[2], &[3.0, 0.5]).unwrap();
        let beta = Tensor::from_f64(&[2], &[-1.0, 4.0]).unwrap();
        let mut param = BatchNormParam::new(BnMode::Train);
        let (out, _) = batchnorm_forward(&x, &gamma, &beta, &mut param).unwrap();
        let (mean, var) = column_stats(&out);
        assert_abs_diff_eq!(mean[0], -1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(mean[1], 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(var[0].sqrt(), 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(var[1].sqrt(), 0.5, epsilon = 1e-3);
    }

    #[test]
    fn running_stats_follow_moving_average() {
        let x = Tensor::<f64>::from_f64(&[2, 1], &[1.0, 3.0]).unwrap();
        let gamma = Tensor::from_f64(&[1], &[1.0]).unwrap();
        let beta = Tensor::zeros(&[1]);
        let mut param = BatchNormParam::new(BnMode::Train).with_momentum(0.9);

        batchnorm_forward(&x, &gamma, &beta, &mut param).unwrap();
        // batch mean 2, biased variance 1
        assert_abs_diff_eq!(param.running_mean.as_ref().unwrap().data()[0], 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(param.running_var.as_ref().unwrap().data()[0], 0.1, epsilon = 1e-12);

        batchnorm_forward(&x, &gamma, &beta, &mut param).unwrap();
        assert_abs_diff_eq!(param.running_mean.as_ref().unwrap().data()[0], 0.38, epsilon = 1e-12);
        assert_abs_diff_eq!(param.running_var.as_ref().unwrap().data()[0], 0.19, epsilon = 1e-12);
    }

    #[test]
    fn test_mode_uses_running_stats_without_mutating() {
        let mut rng = StdRng::seed_from_u64(2);
        let gamma = Tensor::from_f64(&[3], &[1.0, 2.0, 0.5]).unwrap();
        let beta = Tensor::from_f64(&[3], &[0.0, 1.0, -1.0]).unwrap();
        let mut param = BatchNormParam::new(BnMode::Train);
        for _ in 0..50 {
            let x = shifted_input(&mut rng, 64, 3);
            batchnorm_forward(&x, &gamma, &beta, &mut param).unwrap();
        }

        param.mode = BnMode::Test;
        let before = (param.running_mean.clone(), param.running_var.clone());
        let x = shifted_input(&mut rng, 500, 3);
        let (out, _) = batchnorm_forward(&x, &gamma, &beta, &mut param).unwrap();
        assert_eq!(param.running_mean, before.0);
        assert_eq!(param.running_var, before.1);

        // After enough steps the running stats track the data, so test-mode
        // output roughly recovers beta as its mean.
        let (mean, _) = column_stats(&out);
        for k in 0..3 {
            assert_abs_diff_eq!(mean[k], beta.data()[k], epsilon = 0.5);
        }
    }

    #[test]
    fn train_backward_matches_numerical_gradient() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = shifted_input(&mut rng, 4, 5);
        let gamma = Tensor::randn_with(&[5], 1.0, &mut rng);
        let beta = Tensor::randn_with(&[5], 1.0, &mut rng);
        let dout = Tensor::randn_with(&[4, 5], 1.0, &mut rng);

        let forward = |x: &Tensor<f64>, g: &Tensor<f64>, b: &Tensor<f64>| {
            let mut p = BatchNormParam::new(BnMode::Train);
            batchnorm_forward(x, g, b, &mut p).map(|r| r.0)
        };

        let mut param = BatchNormParam::new(BnMode::Train);
        let (_, cache) = batchnorm_forward(&x, &gamma, &beta, &mut param).unwrap();
        let (dx, dgamma, dbeta) = batchnorm_backward(&dout, cache).unwrap();

        let dx_num = eval_numerical_gradient_array(|x| forward(x, &gamma, &beta), &x, &dout, 1e-5).unwrap();
        let dg_num = eval_numerical_gradient_array(|g| forward(&x, g, &beta), &gamma, &dout, 1e-5).unwrap();
        let db_num = eval_numerical_gradient_array(|b| forward(&x, &gamma, b), &beta, &dout, 1e-5).unwrap();

        assert!(rel_error(&dx, &dx_num) < 1e-6);
        assert!(rel_error(&dgamma, &dg_num) < 1e-6);
        assert!(rel_error(&dbeta, &db_num) < 1e-6);
    }

    #[test]
    fn test_backward_matches_numerical_gradient() {
        let mut rng = StdRng::seed_from_u64(4);
        let x = Tensor::<f64>::randn_with(&[3, 4], 1.0, &mut rng);
        let gamma = Tensor::randn_with(&[4], 1.0, &mut rng);
        let beta = Tensor::randn_with(&[4], 1.0, &mut rng);
        let dout = Tensor::randn_with(&[3, 4], 1.0, &mut rng);

        let mut param = BatchNormParam::new(BnMode::Test);
        param.running_mean = Some(Tensor::from_f64(&[4], &[0.1, -0.2, 0.3, 0.0]).unwrap());
        param.running_var = Some(Tensor::from_f64(&[4], &[1.5, 0.5, 2.0, 1.0]).unwrap());

        let (_, cache) = batchnorm_forward(&x, &gamma, &beta, &mut param).unwrap();
        let (dx, _, _) = batchnorm_backward(&dout, cache).unwrap();
        let dx_num = eval_numerical_gradient_array(
            |x| batchnorm_forward(x, &gamma, &beta, &mut param.clone()).map(|r| r.0),
            &x,
            &dout,
            1e-5,
        )
        .unwrap();
        assert!(rel_error(&dx, &dx_num) < 1e-7);
    }

    #[test]
    fn unknown_mode_string_is_rejected() {
        assert_eq!("train".parse::<BnMode>().unwrap(), BnMode::Train);
        assert_eq!("test".parse::<BnMode>().unwrap(), BnMode::Test);
        assert!(matches!("eval".parse::<BnMode>(), Err(CnnError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_gamma_of_wrong_length() {
        let x = Tensor::<f64>::zeros(&[2, 3]);
        let gamma = Tensor::zeros(&[2]);
        let beta = Tensor::zeros(&[3]);
        let mut param = BatchNormParam::new(BnMode::Train);
        assert!(batchnorm_forward(&x, &gamma, &beta, &mut param).is_err());
        assert!(param.running_mean.is_none());
    }
}
