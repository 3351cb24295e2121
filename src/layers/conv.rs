use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{CnnError, Result};
use crate::math::{Scalar, Tensor};

/// Stride and symmetric zero-padding of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvParam {
    pub stride: usize,
    pub pad: usize,
}

impl ConvParam {
    pub fn new(stride: usize, pad: usize) -> ConvParam {
        ConvParam { stride, pad }
    }

    /// Stride 1 with `(filter_size - 1) / 2` padding, which keeps the spatial
    /// size unchanged for odd filter sizes.
    pub fn same(filter_size: usize) -> ConvParam {
        ConvParam { stride: 1, pad: filter_size.saturating_sub(1) / 2 }
    }
}

/// `⌊(input + 2·pad − kernel) / stride⌋ + 1`.
///
/// Fails when the stride is zero or the kernel does not fit inside the
/// padded input.
pub fn conv_output_dim(input: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize> {
    if stride == 0 {
        return Err(CnnError::InvalidConfig("convolution stride must be at least 1".into()));
    }
    let padded = input + 2 * pad;
    if kernel == 0 || kernel > padded {
        return Err(CnnError::shape("conv_output_dim", format!("kernel in 1..={padded}"), kernel));
    }
    Ok((padded - kernel) / stride + 1)
}

/// Values saved by [`conv_forward`] for [`conv_backward`].
#[derive(Debug, Clone)]
pub struct ConvCache<T> {
    x: Tensor<T>,
    w: Tensor<T>,
    b: Tensor<T>,
    param: ConvParam,
}

/// Convolution by direct summation over every receptive field.
///
/// - `x`: `(N, C, H, W)`
/// - `w`: `(F, C, HH, WW)`
/// - `b`: `(F,)`
///
/// Returns `(N, F, H', W')` with `H' = ⌊(H + 2p − HH)/s⌋ + 1` and likewise
/// for `W'`.
pub fn conv_forward<T: Scalar>(
    x: &Tensor<T>,
    w: &Tensor<T>,
    b: &Tensor<T>,
    param: &ConvParam,
) -> Result<(Tensor<T>, ConvCache<T>)> {
    let (n, c, h, wd) = x.dims4("conv_forward")?;
    let (f, wc, hh, ww) = w.dims4("conv_forward")?;
    if wc != c {
        return Err(CnnError::shape("conv_forward", ("filter channels", c), ("filter channels", wc)));
    }
    if b.dims1("conv_forward")? != f {
        return Err(CnnError::shape("conv_forward", [f], b.shape()));
    }
    let ConvParam { stride, pad } = *param;
    let out_h = conv_output_dim(h, hh, stride, pad)?;
    let out_w = conv_output_dim(wd, ww, stride, pad)?;
    trace!(input = ?x.shape(), filters = ?w.shape(), out_h, out_w, "conv_forward");

    let xpad = pad_spatial(x, pad)?;
    let (hp, wp) = (h + 2 * pad, wd + 2 * pad);
    let xs = xpad.data();
    let ws = w.data();
    let mut out = Tensor::zeros(&[n, f, out_h, out_w]);
    let os = out.data_mut();

    for ni in 0..n {
        for fi in 0..f {
            for i in 0..out_h {
                for j in 0..out_w {
                    let mut acc = b.data()[fi];
                    for ci in 0..c {
                        for ki in 0..hh {
                            let x_row = ((ni * c + ci) * hp + i * stride + ki) * wp + j * stride;
                            let w_row = ((fi * c + ci) * hh + ki) * ww;
                            for kj in 0..ww {
                                acc += xs[x_row + kj] * ws[w_row + kj];
                            }
                        }
                    }
                    os[((ni * f + fi) * out_h + i) * out_w + j] = acc;
                }
            }
        }
    }

    let cache = ConvCache { x: x.clone(), w: w.clone(), b: b.clone(), param: *param };
    Ok((out, cache))
}

/// Returns `(dx, dw, db)` for an upstream gradient of shape `(N, F, H', W')`.
///
/// Every output position adds its contribution into the window it was
/// computed from, so overlapping windows accumulate. The padded input
/// gradient is then stripped back to `(N, C, H, W)`.
pub fn conv_backward<T: Scalar>(
    dout: &Tensor<T>,
    cache: ConvCache<T>,
) -> Result<(Tensor<T>, Tensor<T>, Tensor<T>)> {
    let ConvCache { x, w, b, param } = cache;
    let (n, c, h, wd) = x.dims4("conv_backward")?;
    let (f, _, hh, ww) = w.dims4("conv_backward")?;
    let ConvParam { stride, pad } = param;
    let out_h = conv_output_dim(h, hh, stride, pad)?;
    let out_w = conv_output_dim(wd, ww, stride, pad)?;
    dout.expect_shape("conv_backward", &[n, f, out_h, out_w])?;

    let xpad = pad_spatial(&x, pad)?;
    let (hp, wp) = (h + 2 * pad, wd + 2 * pad);
    let xs = xpad.data();
    let ws = w.data();
    let ds = dout.data();

    let mut dxpad = Tensor::zeros(&[n, c, hp, wp]);
    let mut dw = Tensor::zeros_like(&w);
    let mut db = Tensor::zeros_like(&b);

    for ni in 0..n {
        for fi in 0..f {
            for i in 0..out_h {
                for j in 0..out_w {
                    let g = ds[((ni * f + fi) * out_h + i) * out_w + j];
                    db.data_mut()[fi] += g;
                    for ci in 0..c {
                        for ki in 0..hh {
                            let x_row = ((ni * c + ci) * hp + i * stride + ki) * wp + j * stride;
                            let w_row = ((fi * c + ci) * hh + ki) * ww;
                            for kj in 0..ww {
                                dxpad.data_mut()[x_row + kj] += ws[w_row + kj] * g;
                                dw.data_mut()[w_row + kj] += xs[x_row + kj] * g;
                            }
                        }
                    }
                }
            }
        }
    }

    let dx = strip_spatial(&dxpad, pad)?;
    Ok((dx, dw, db))
}

/// Zero-pads the two spatial axes of an `(N, C, H, W)` tensor by `pad` on
/// every side.
pub fn pad_spatial<T: Scalar>(x: &Tensor<T>, pad: usize) -> Result<Tensor<T>> {
    let (n, c, h, w) = x.dims4("pad_spatial")?;
    if pad == 0 {
        return Ok(x.clone());
    }
    let (hp, wp) = (h + 2 * pad, w + 2 * pad);
    let mut out = Tensor::zeros(&[n, c, hp, wp]);
    let src = x.data();
    let dst = out.data_mut();
    for plane in 0..n * c {
        for i in 0..h {
            let from = (plane * h + i) * w;
            let to = (plane * hp + i + pad) * wp + pad;
            dst[to..to + w].copy_from_slice(&src[from..from + w]);
        }
    }
    Ok(out)
}

/// Inverse of [`pad_spatial`]: drops a `pad`-wide border from both spatial
/// axes.
pub fn strip_spatial<T: Scalar>(x: &Tensor<T>, pad: usize) -> Result<Tensor<T>> {
    let (n, c, hp, wp) = x.dims4("strip_spatial")?;
    if pad == 0 {
        return Ok(x.clone());
    }
    if hp < 2 * pad || wp < 2 * pad {
        return Err(CnnError::shape("strip_spatial", ("at least", 2 * pad), (hp, wp)));
    }
    let (h, w) = (hp - 2 * pad, wp - 2 * pad);
    let mut out = Tensor::zeros(&[n, c, h, w]);
    let src = x.data();
    let dst = out.data_mut();
    for plane in 0..n * c {
        for i in 0..h {
            let from = (plane * hp + i + pad) * wp + pad;
            let to = (plane * h + i) * w;
            dst[to..to + w].copy_from_slice(&src[from..from + w]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{eval_numerical_gradient_array, rel_error};
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn forward_matches_reference_values() {
        let x = Tensor::<f64>::linspace(&[2, 3, 4, 4], -0.1, 0.5);
        let w = Tensor::linspace(&[3, 3, 4, 4], -0.2, 0.3);
        let b = Tensor::linspace(&[3], -0.1, 0.2);
        let (out, _) = conv_forward(&x, &w, &b, &ConvParam::new(2, 1)).unwrap();

        let correct = Tensor::from_f64(
            &[2, 3, 2, 2],
            &[
                -0.08759809, -0.10987781, -0.18387192, -0.2109216,
                0.21027089, 0.21661097, 0.22847626, 0.23004637,
                0.50813986, 0.54309974, 0.64082444, 0.67101435,
                -0.98053589, -1.03143541, -1.19128892, -1.24695841,
                0.69108355, 0.66880383, 0.59480972, 0.56776003,
                2.36270298, 2.36904306, 2.38090835, 2.38247847,
            ],
        )
        .unwrap();
        assert!(rel_error(&out, &correct) < 1e-7);
    }

    #[test]
    fn forward_sums_each_window_plus_bias() {
        // 3x3 input, 2x2 all-ones filter, no padding: each output is a window sum.
        let x = Tensor::<f64>::from_f64(&[1, 1, 3, 3], &[1., 2., 3., 4., 5., 6., 7., 8., 9.]).unwrap();
        let w = Tensor::from_f64(&[1, 1, 2, 2], &[1., 1., 1., 1.]).unwrap();
        let b = Tensor::from_f64(&[1], &[0.5]).unwrap();
        let (out, _) = conv_forward(&x, &w, &b, &ConvParam::new(1, 0)).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        assert_eq!(out.data(), &[12.5, 16.5, 24.5, 28.5]);
    }

    #[test]
    fn padding_contributes_zeros() {
        // 1x1 input with a 3x3 filter and pad 1: only the centre tap sees data.
        let x = Tensor::<f64>::from_f64(&[1, 1, 1, 1], &[2.0]).unwrap();
        let w = Tensor::linspace(&[1, 1, 3, 3], 1.0, 9.0);
        let b = Tensor::zeros(&[1]);
        let (out, _) = conv_forward(&x, &w, &b, &ConvParam::same(3)).unwrap();
        assert_eq!(out.shape(), &[1, 1, 1, 1]);
        assert_abs_diff_eq!(out.data()[0], 10.0, epsilon = 1e-12);
    }

    #[test]
    fn backward_matches_numerical_gradient() {
        let mut rng = StdRng::seed_from_u64(231);
        let x = Tensor::<f64>::randn_with(&[2, 3, 5, 5], 1.0, &mut rng);
        let w = Tensor::randn_with(&[2, 3, 3, 3], 1.0, &mut rng);
        let b = Tensor::randn_with(&[2], 1.0, &mut rng);
        let param = ConvParam::new(1, 1);
        let dout = Tensor::randn_with(&[2, 2, 5, 5], 1.0, &mut rng);

        let (_, cache) = conv_forward(&x, &w, &b, &param).unwrap();
        let (dx, dw, db) = conv_backward(&dout, cache).unwrap();

        let dx_num = eval_numerical_gradient_array(|x| Ok(conv_forward(x, &w, &b, &param)?.0), &x, &dout, 1e-5).unwrap();
        let dw_num = eval_numerical_gradient_array(|w| Ok(conv_forward(&x, w, &b, &param)?.0), &w, &dout, 1e-5).unwrap();
        let db_num = eval_numerical_gradient_array(|b| Ok(conv_forward(&x, &w, b, &param)?.0), &b, &dout, 1e-5).unwrap();

        assert!(rel_error(&dx, &dx_num) < 1e-7);
        assert!(rel_error(&dw, &dw_num) < 1e-7);
        assert!(rel_error(&db, &db_num) < 1e-7);
    }

    #[test]
    fn backward_with_overlapping_strided_windows() {
        let mut rng = StdRng::seed_from_u64(5);
        let x = Tensor::<f64>::randn_with(&[1, 2, 7, 6], 1.0, &mut rng);
        let w = Tensor::randn_with(&[3, 2, 3, 2], 1.0, &mut rng);
        let b = Tensor::randn_with(&[3], 1.0, &mut rng);
        let param = ConvParam::new(2, 2);
        let (out, cache) = conv_forward(&x, &w, &b, &param).unwrap();
        let dout = Tensor::randn_with(out.shape(), 1.0, &mut rng);
        let (dx, dw, _) = conv_backward(&dout, cache).unwrap();

        let dx_num = eval_numerical_gradient_array(|x| Ok(conv_forward(x, &w, &b, &param)?.0), &x, &dout, 1e-5).unwrap();
        let dw_num = eval_numerical_gradient_array(|w| Ok(conv_forward(&x, w, &b, &param)?.0), &w, &dout, 1e-5).unwrap();
        assert_eq!(dx.shape(), x.shape());
        assert!(rel_error(&dx, &dx_num) < 1e-7);
        assert!(rel_error(&dw, &dw_num) < 1e-7);
    }

    #[test]
    fn bias_gradient_sums_upstream() {
        let x = Tensor::<f64>::linspace(&[2, 1, 3, 3], -1.0, 1.0);
        let w = Tensor::linspace(&[2, 1, 2, 2], -1.0, 1.0);
        let b = Tensor::zeros(&[2]);
        let (out, cache) = conv_forward(&x, &w, &b, &ConvParam::new(1, 0)).unwrap();
        let dout = Tensor::linspace(out.shape(), 0.0, 1.0);
        let (_, _, db) = conv_backward(&dout, cache).unwrap();

        let ds = dout.data();
        for f in 0..2 {
            let expected: f64 = (0..2)
                .flat_map(|n| (0..4).map(move |k| ((n * 2 + f) * 4) + k))
                .map(|i| ds[i])
                .sum();
            assert_abs_diff_eq!(db.data()[f], expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn rejects_channel_mismatch() {
        let x = Tensor::<f32>::zeros(&[1, 3, 4, 4]);
        let w = Tensor::zeros(&[2, 2, 3, 3]);
        let b = Tensor::zeros(&[2]);
        let err = conv_forward(&x, &w, &b, &ConvParam::new(1, 1)).unwrap_err();
        assert!(matches!(err, CnnError::ShapeMismatch { .. }));
    }

    #[test]
    fn rejects_filter_larger_than_padded_input() {
        let x = Tensor::<f32>::zeros(&[1, 1, 2, 2]);
        let w = Tensor::zeros(&[1, 1, 5, 5]);
        let b = Tensor::zeros(&[1]);
        assert!(conv_forward(&x, &w, &b, &ConvParam::new(1, 1)).is_err());
    }

    #[test]
    fn rejects_zero_stride() {
        assert!(matches!(conv_output_dim(4, 3, 0, 1), Err(CnnError::InvalidConfig(_))));
    }

    #[test]
    fn pad_then_strip_round_trips() {
        let x = Tensor::<f64>::linspace(&[2, 2, 3, 4], -1.0, 1.0);
        let padded = pad_spatial(&x, 2).unwrap();
        assert_eq!(padded.shape(), &[2, 2, 7, 8]);
        assert_eq!(padded.sum(), x.sum());
        assert_eq!(strip_spatial(&padded, 2).unwrap(), x);
    }

    proptest! {
        #[test]
        fn output_shape_follows_closed_form(
            n in 1usize..3, c in 1usize..3, f in 1usize..3,
            h in 1usize..8, w in 1usize..8,
            hh in 1usize..5, ww in 1usize..5,
            stride in 1usize..4, pad in 0usize..3,
        ) {
            prop_assume!(hh <= h + 2 * pad && ww <= w + 2 * pad);
            let x = Tensor::<f64>::zeros(&[n, c, h, w]);
            let wt = Tensor::zeros(&[f, c, hh, ww]);
            let b = Tensor::zeros(&[f]);
            let (out, cache) = conv_forward(&x, &wt, &b, &ConvParam::new(stride, pad)).unwrap();
            let expected_h = (h + 2 * pad - hh) / stride + 1;
            let expected_w = (w + 2 * pad - ww) / stride + 1;
            prop_assert_eq!(out.shape(), &[n, f, expected_h, expected_w][..]);

            let (dx, dw, db) = conv_backward(&out, cache).unwrap();
            prop_assert_eq!(dx.shape(), x.shape());
            prop_assert_eq!(dw.shape(), wt.shape());
            prop_assert_eq!(db.shape(), b.shape());
        }
    }
}
