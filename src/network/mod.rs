//! Complete classifiers assembled from the layer kernels.
//!
//! A network is a [`NetworkConfig`] plus a named parameter set. Evaluating
//! it without labels yields class scores; with labels it yields the
//! regularized softmax loss and one gradient per parameter, packed in a
//! value of the same parameter-set type.

pub mod config;
pub mod seven_layer;
pub mod three_layer;

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CnnError, Result};
use crate::math::{Scalar, Tensor};

pub use config::NetworkConfig;
pub use seven_layer::{SevenLayerConvNet, SevenLayerParams};
pub use three_layer::{ThreeLayerConvNet, ThreeLayerParams};

/// A fixed, ordered collection of named parameter tensors.
///
/// Weight tensors are named `W1`, `W2`, … and biases `b1`, `b2`, …; only the
/// weights take part in L2 regularization.
pub trait ParamSet<T: Scalar> {
    fn named(&self) -> Vec<(&'static str, &Tensor<T>)>;

    fn named_mut(&mut self) -> Vec<(&'static str, &mut Tensor<T>)>;

    fn get(&self, name: &str) -> Option<&Tensor<T>> {
        self.named().into_iter().find(|(n, _)| *n == name).map(|(_, t)| t)
    }

    /// `0.5 · reg · Σ ‖W‖²` over the weight tensors.
    fn l2_penalty(&self, reg: f64) -> T {
        let sum_sq = self
            .named()
            .into_iter()
            .filter(|(name, _)| is_weight(name))
            .fold(T::zero(), |acc, (_, w)| acc + w.sum_sq());
        T::cast(0.5 * reg) * sum_sq
    }

    /// Adds `reg · W` to every weight gradient in `self`, reading `W` from
    /// `params`.
    fn add_l2_gradient(&mut self, params: &Self, reg: f64) -> Result<()> {
        let reg = T::cast(reg);
        for ((name, grad), (_, w)) in self.named_mut().into_iter().zip(params.named()) {
            if is_weight(name) {
                grad.add_scaled(w, reg)?;
            }
        }
        Ok(())
    }

    fn num_parameters(&self) -> usize {
        self.named().iter().map(|(_, t)| t.len()).sum()
    }
}

fn is_weight(name: &str) -> bool {
    name.starts_with('W')
}

/// Result of evaluating a network on a batch.
#[derive(Debug, Clone)]
pub enum Evaluation<T, P> {
    /// `(N, num_classes)` class scores; no labels were given.
    Scores(Tensor<T>),
    /// Regularized loss and a gradient for every parameter.
    Training { loss: T, grads: P },
}

pub trait ConvNet<T: Scalar> {
    type Params: ParamSet<T>;

    fn config(&self) -> &NetworkConfig;

    fn params(&self) -> &Self::Params;

    fn params_mut(&mut self) -> &mut Self::Params;

    /// Class scores of shape `(N, num_classes)` for `x: (N, C, H, W)`.
    fn scores(&self, x: &Tensor<T>) -> Result<Tensor<T>>;

    /// Softmax loss plus `0.5 · reg · Σ ‖W‖²`, and the gradient of that
    /// total with respect to every parameter.
    fn loss_and_grads(&self, x: &Tensor<T>, y: &[usize]) -> Result<(T, Self::Params)>;

    /// Scores when `y` is `None`, otherwise loss and gradients.
    fn loss(&self, x: &Tensor<T>, y: Option<&[usize]>) -> Result<Evaluation<T, Self::Params>> {
        match y {
            None => Ok(Evaluation::Scores(self.scores(x)?)),
            Some(y) => {
                let (loss, grads) = self.loss_and_grads(x, y)?;
                Ok(Evaluation::Training { loss, grads })
            }
        }
    }

    /// Highest-scoring class per sample; ties resolve to the lower index.
    fn predict(&self, x: &Tensor<T>) -> Result<Vec<usize>> {
        let scores = self.scores(x)?;
        let (_, classes) = scores.dims2("ConvNet::predict")?;
        Ok(scores.data().chunks(classes).map(argmax).collect())
    }

    /// Fraction of samples whose prediction equals the label.
    fn accuracy(&self, x: &Tensor<T>, y: &[usize]) -> Result<f64> {
        let predicted = self.predict(x)?;
        if predicted.len() != y.len() {
            return Err(CnnError::shape("ConvNet::accuracy labels", predicted.len(), y.len()));
        }
        if y.is_empty() {
            return Ok(0.0);
        }
        let correct = predicted.iter().zip(y).filter(|(p, t)| p == t).count();
        Ok(correct as f64 / y.len() as f64)
    }
}

/// Index of the maximum element in a slice.
fn argmax<T: Scalar>(v: &[T]) -> usize {
    v.iter()
        .enumerate()
        .fold((0, T::neg_infinity()), |(best, max), (i, &x)| if x > max { (i, x) } else { (best, max) })
        .0
}

/// Checks that `x` is a batch of images of the configured `(C, H, W)` and
/// returns the batch size.
pub(crate) fn check_input<T: Scalar>(
    config: &NetworkConfig,
    x: &Tensor<T>,
    op: &'static str,
) -> Result<usize> {
    let (n, c, h, w) = x.dims4(op)?;
    if (c, h, w) != config.input_dim {
        return Err(CnnError::shape(op, config.input_dim, (c, h, w)));
    }
    Ok(n)
}

/// Fails unless every parameter has the shape the config implies.
pub(crate) fn check_param_shapes<T: Scalar, P: ParamSet<T>>(
    params: &P,
    expected: &[Vec<usize>],
    op: &'static str,
) -> Result<()> {
    let named = params.named();
    if named.len() != expected.len() {
        return Err(CnnError::shape(op, expected.len(), named.len()));
    }
    for ((name, tensor), shape) in named.into_iter().zip(expected) {
        if tensor.shape() != &shape[..] {
            return Err(CnnError::shape(op, (name, shape), (name, tensor.shape())));
        }
    }
    Ok(())
}

pub(crate) fn write_json<S: Serialize>(value: &S, path: impl AsRef<Path>) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

pub(crate) fn read_json<D: DeserializeOwned>(path: impl AsRef<Path>) -> Result<D> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}
