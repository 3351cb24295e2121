use crate::error::{CnnError, Result};
use crate::math::{Scalar, Tensor};

/// Softmax cross-entropy averaged over the batch.
///
/// `scores` is `(N, classes)` and `y[i]` is the class index of row `i`.
/// Returns `(loss, dscores)` where
///   loss    = −(1/N) Σᵢ log softmax(scores[i])[y[i]]
///   dscores = (softmax(scores) − onehot(y)) / N
///
/// Each row is shifted by its maximum before exponentiation so large scores
/// cannot overflow.
pub fn softmax_loss<T: Scalar>(scores: &Tensor<T>, y: &[usize]) -> Result<(T, Tensor<T>)> {
    let (n, classes) = scores.dims2("softmax_loss")?;
    if y.len() != n {
        return Err(CnnError::shape("softmax_loss labels", n, y.len()));
    }
    if n == 0 {
        return Err(CnnError::shape("softmax_loss", "at least one row", scores.shape()));
    }
    if let Some(&label) = y.iter().find(|&&label| label >= classes) {
        return Err(CnnError::InvalidLabel { label, num_classes: classes });
    }

    let count = T::from_usize(n);
    let mut loss = T::zero();
    let mut dscores = Tensor::zeros(&[n, classes]);
    for (i, &label) in y.iter().enumerate() {
        let row = &scores.data()[i * classes..(i + 1) * classes];
        let max = row.iter().fold(T::neg_infinity(), |m, &v| m.max(v));
        let sum_exp = row.iter().fold(T::zero(), |acc, &v| acc + (v - max).exp());
        let log_sum = sum_exp.ln();

        loss -= row[label] - max - log_sum;

        let grad_row = &mut dscores.data_mut()[i * classes..(i + 1) * classes];
        for (g, &v) in grad_row.iter_mut().zip(row) {
            *g = (v - max - log_sum).exp() / count;
        }
        grad_row[label] -= T::one() / count;
    }
    Ok((loss / count, dscores))
}
