use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{CnnError, Result};
use crate::math::scalar::Scalar;

/// Dense row-major tensor with a fixed shape.
///
/// Kernels never mutate their inputs: every operation below that changes
/// values either returns a fresh tensor or is an explicit in-place method
/// (`add_scaled`, `data_mut`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: Scalar> Tensor<T> {
    pub fn zeros(shape: &[usize]) -> Tensor<T> {
        Tensor {
            shape: shape.to_vec(),
            data: vec![T::zero(); shape.iter().product()],
        }
    }

    pub fn zeros_like(other: &Tensor<T>) -> Tensor<T> {
        Tensor::zeros(&other.shape)
    }

    pub fn from_vec(shape: &[usize], data: Vec<T>) -> Result<Tensor<T>> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(CnnError::shape("Tensor::from_vec", expected, data.len()));
        }
        Ok(Tensor { shape: shape.to_vec(), data })
    }

    /// Builds a tensor from `f64` values, converting to the element type.
    pub fn from_f64(shape: &[usize], values: &[f64]) -> Result<Tensor<T>> {
        Tensor::from_vec(shape, values.iter().map(|&v| T::cast(v)).collect())
    }

    /// Evenly spaced values from `lo` to `hi` (inclusive) laid out in
    /// row-major order. Handy for deterministic kernel fixtures.
    pub fn linspace(shape: &[usize], lo: f64, hi: f64) -> Tensor<T> {
        let n: usize = shape.iter().product();
        let step = if n > 1 { (hi - lo) / (n - 1) as f64 } else { 0.0 };
        Tensor {
            shape: shape.to_vec(),
            data: (0..n).map(|i| T::cast(lo + step * i as f64)).collect(),
        }
    }

    /// Samples every element from N(0, std²) using the thread-local RNG.
    pub fn randn(shape: &[usize], std: f64) -> Tensor<T> {
        Tensor::randn_with(shape, std, &mut rand::thread_rng())
    }

    /// Samples every element from N(0, std²) using the given RNG.
    pub fn randn_with<R: Rng + ?Sized>(shape: &[usize], std: f64, rng: &mut R) -> Tensor<T> {
        let n: usize = shape.iter().product();
        let data = (0..n)
            .map(|_| {
                let z: f64 = StandardNormal.sample(rng);
                T::cast(z * std)
            })
            .collect();
        Tensor { shape: shape.to_vec(), data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Element at a full multi-index, or `None` when out of bounds.
    pub fn get(&self, index: &[usize]) -> Option<T> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for (&i, &dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            offset = offset * dim + i;
        }
        Some(self.data[offset])
    }

    pub fn dims1(&self, op: &'static str) -> Result<usize> {
        match self.shape[..] {
            [d] => Ok(d),
            _ => Err(CnnError::shape(op, "rank 1", &self.shape)),
        }
    }

    pub fn dims2(&self, op: &'static str) -> Result<(usize, usize)> {
        match self.shape[..] {
            [r, c] => Ok((r, c)),
            _ => Err(CnnError::shape(op, "rank 2", &self.shape)),
        }
    }

    pub fn dims4(&self, op: &'static str) -> Result<(usize, usize, usize, usize)> {
        match self.shape[..] {
            [n, c, h, w] => Ok((n, c, h, w)),
            _ => Err(CnnError::shape(op, "rank 4 (N, C, H, W)", &self.shape)),
        }
    }

    /// Reinterprets the data under a new shape with the same element count.
    pub fn reshape(self, shape: &[usize]) -> Result<Tensor<T>> {
        let expected: usize = shape.iter().product();
        if expected != self.data.len() {
            return Err(CnnError::shape("Tensor::reshape", shape, &self.shape));
        }
        Ok(Tensor { shape: shape.to_vec(), data: self.data })
    }

    pub fn map<F>(&self, functor: F) -> Tensor<T>
    where
        F: Fn(T) -> T,
    {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| functor(x)).collect(),
        }
    }

    /// Element-wise combination of two same-shape tensors.
    pub fn zip_map<F>(&self, other: &Tensor<T>, op: &'static str, functor: F) -> Result<Tensor<T>>
    where
        F: Fn(T, T) -> T,
    {
        self.expect_shape(op, &other.shape)?;
        Ok(Tensor {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| functor(a, b))
                .collect(),
        })
    }

    pub fn transpose(&self) -> Result<Tensor<T>> {
        let (rows, cols) = self.dims2("Tensor::transpose")?;
        let mut res = Tensor::zeros(&[cols, rows]);
        for i in 0..rows {
            for j in 0..cols {
                res.data[j * rows + i] = self.data[i * cols + j];
            }
        }
        Ok(res)
    }

    pub fn matmul(&self, rhs: &Tensor<T>) -> Result<Tensor<T>> {
        let (m, k) = self.dims2("Tensor::matmul")?;
        let (k2, n) = rhs.dims2("Tensor::matmul")?;
        if k != k2 {
            return Err(CnnError::shape("Tensor::matmul", [k, n], [k2, n]));
        }
        let mut res = Tensor::zeros(&[m, n]);
        for i in 0..m {
            for p in 0..k {
                let a = self.data[i * k + p];
                let rhs_row = &rhs.data[p * n..(p + 1) * n];
                let out_row = &mut res.data[i * n..(i + 1) * n];
                for (o, &b) in out_row.iter_mut().zip(rhs_row) {
                    *o += a * b;
                }
            }
        }
        Ok(res)
    }

    /// Sums a 2-D tensor over its rows, giving one value per column.
    pub fn sum_rows(&self) -> Result<Tensor<T>> {
        let (rows, cols) = self.dims2("Tensor::sum_rows")?;
        let mut res = Tensor::zeros(&[cols]);
        for i in 0..rows {
            for (acc, &x) in res.data.iter_mut().zip(&self.data[i * cols..(i + 1) * cols]) {
                *acc += x;
            }
        }
        Ok(res)
    }

    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x)
    }

    /// Squared Frobenius norm, the L2 penalty term of a weight tensor.
    pub fn sum_sq(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x * x)
    }

    pub fn scale(&self, alpha: T) -> Tensor<T> {
        self.map(|x| x * alpha)
    }

    /// In-place `self += alpha * other`.
    pub fn add_scaled(&mut self, other: &Tensor<T>, alpha: T) -> Result<()> {
        self.expect_shape("Tensor::add_scaled", &other.shape)?;
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a += alpha * b;
        }
        Ok(())
    }

    pub fn max_abs(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc.max(x.abs()))
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    pub(crate) fn expect_shape(&self, op: &'static str, shape: &[usize]) -> Result<()> {
        if self.shape != shape {
            return Err(CnnError::shape(op, shape, &self.shape));
        }
        Ok(())
    }
}

impl<T: Scalar> Default for Tensor<T> {
    fn default() -> Self {
        Tensor { shape: vec![0], data: vec![] }
    }
}
