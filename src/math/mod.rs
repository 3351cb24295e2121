pub mod scalar;
pub mod tensor;

pub use scalar::Scalar;
pub use tensor::Tensor;
