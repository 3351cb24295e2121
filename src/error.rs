use thiserror::Error;

/// Errors raised by the kernels, layers and networks.
///
/// Kernels validate their inputs before touching any data, so a returned
/// error never leaves a half-written output behind.
#[derive(Debug, Error)]
pub enum CnnError {
    /// A tensor had the wrong rank, size or channel count for an operation,
    /// or a window did not fit inside the (padded) input.
    #[error("{op}: shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        op: &'static str,
        expected: String,
        actual: String,
    },

    /// A configuration record held a value the kernel cannot work with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `backward` was called on a layer with no pending forward cache.
    #[error("{0}: backward called without a matching forward cache")]
    MissingCache(&'static str),

    /// A class label was outside `0..num_classes`.
    #[error("label {label} out of range for {num_classes} classes")]
    InvalidLabel { label: usize, num_classes: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CnnError>;

impl CnnError {
    /// Shorthand used by the kernels when comparing shapes.
    pub(crate) fn shape(
        op: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> CnnError {
        CnnError::ShapeMismatch {
            op,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}
