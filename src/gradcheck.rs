//! Centered finite-difference gradient checks.
//!
//! Every analytic backward pass in this crate is tested against these
//! helpers. They are also what the `ferrite-cnn` binary runs to sanity-check
//! a freshly built network.

use tracing::debug;

use crate::error::{CnnError, Result};
use crate::math::{Scalar, Tensor};
use crate::network::{ConvNet, ParamSet};

/// Default perturbation for centered differences.
pub const DEFAULT_STEP: f64 = 1e-5;

/// Numerical gradient of a scalar-valued `f` at `x`:
/// `(f(x + h·e_i) − f(x − h·e_i)) / 2h` for every element `i`.
pub fn eval_numerical_gradient<T, F>(mut f: F, x: &Tensor<T>, h: f64) -> Result<Tensor<T>>
where
    T: Scalar,
    F: FnMut(&Tensor<T>) -> Result<T>,
{
    let mut probe = x.clone();
    let mut grad = Tensor::zeros_like(x);
    let step = T::cast(h);
    for i in 0..x.len() {
        let old = probe.data()[i];
        probe.data_mut()[i] = old + step;
        let pos = f(&probe)?;
        probe.data_mut()[i] = old - step;
        let neg = f(&probe)?;
        probe.data_mut()[i] = old;
        grad.data_mut()[i] = (pos - neg) / (step + step);
    }
    Ok(grad)
}

/// Numerical gradient of `Σ f(x) ⊙ dout` for a tensor-valued `f`, i.e. the
/// vector-Jacobian product a backward pass is expected to return for `x`.
pub fn eval_numerical_gradient_array<T, F>(
    mut f: F,
    x: &Tensor<T>,
    dout: &Tensor<T>,
    h: f64,
) -> Result<Tensor<T>>
where
    T: Scalar,
    F: FnMut(&Tensor<T>) -> Result<Tensor<T>>,
{
    let mut probe = x.clone();
    let mut grad = Tensor::zeros_like(x);
    let step = T::cast(h);
    for i in 0..x.len() {
        let old = probe.data()[i];
        probe.data_mut()[i] = old + step;
        let pos = f(&probe)?;
        probe.data_mut()[i] = old - step;
        let neg = f(&probe)?;
        probe.data_mut()[i] = old;

        let diff = pos.zip_map(&neg, "eval_numerical_gradient_array", |a, b| a - b)?;
        let weighted = diff.zip_map(dout, "eval_numerical_gradient_array", |a, d| a * d)?;
        grad.data_mut()[i] = weighted.sum() / (step + step);
    }
    Ok(grad)
}

/// Maximum element-wise relative error `|a − b| / max(1e-8, |a| + |b|)`.
/// Returns infinity when the shapes differ.
pub fn rel_error<T: Scalar>(a: &Tensor<T>, b: &Tensor<T>) -> f64 {
    if a.shape() != b.shape() {
        return f64::INFINITY;
    }
    a.data()
        .iter()
        .zip(b.data())
        .map(|(&x, &y)| {
            let (x, y) = (x.as_f64(), y.as_f64());
            (x - y).abs() / (x.abs() + y.abs()).max(1e-8)
        })
        .fold(0.0, f64::max)
}

/// Compares every analytic parameter gradient of `net` on `(x, y)` with a
/// numerical one and returns the relative error per parameter name.
///
/// Parameters are perturbed in place and restored afterwards.
pub fn check_network_gradients<T, N>(
    net: &mut N,
    x: &Tensor<T>,
    y: &[usize],
    h: f64,
) -> Result<Vec<(&'static str, f64)>>
where
    T: Scalar,
    N: ConvNet<T>,
{
    let (_, grads) = net.loss_and_grads(x, y)?;
    let step = T::cast(h);
    let mut report = Vec::new();

    for (slot, (name, analytic)) in grads.named().into_iter().enumerate() {
        let mut numeric = Tensor::zeros_like(analytic);
        for i in 0..analytic.len() {
            let old = param_at(net, slot)?.data()[i];

            param_at(net, slot)?.data_mut()[i] = old + step;
            let (pos, _) = net.loss_and_grads(x, y)?;
            param_at(net, slot)?.data_mut()[i] = old - step;
            let (neg, _) = net.loss_and_grads(x, y)?;
            param_at(net, slot)?.data_mut()[i] = old;

            numeric.data_mut()[i] = (pos - neg) / (step + step);
        }
        let err = rel_error(analytic, &numeric);
        debug!(param = name, rel_error = err, "gradient check");
        report.push((name, err));
    }
    Ok(report)
}

fn param_at<T: Scalar, N: ConvNet<T>>(net: &mut N, slot: usize) -> Result<&mut Tensor<T>> {
    net.params_mut()
        .named_mut()
        .into_iter()
        .nth(slot)
        .map(|(_, t)| t)
        .ok_or_else(|| CnnError::InvalidConfig(format!("no parameter at position {slot}")))
}
