use num_traits::{Float, NumAssign};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::{Debug, Display};

/// Floating-point element type a network or kernel computes in.
///
/// Implemented for `f32` and `f64`; the choice is made per network instance
/// through the type parameter (`ThreeLayerConvNet<f32>`).
pub trait Scalar:
    Float
    + NumAssign
    + Debug
    + Display
    + Default
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    /// Converts an `f64` literal or statistic into this element type.
    fn cast(v: f64) -> Self;

    fn as_f64(self) -> f64;

    /// Converts a count (batch size, window size) into this element type.
    fn from_usize(n: usize) -> Self {
        Self::cast(n as f64)
    }
}

impl Scalar for f32 {
    #[inline]
    fn cast(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    #[inline]
    fn cast(v: f64) -> Self {
        v
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}
