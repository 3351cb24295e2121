pub mod math;
pub mod error;
pub mod activation;
pub mod layers;
pub mod loss;
pub mod network;
pub mod gradcheck;

// Convenience re-exports
pub use math::{Scalar, Tensor};
pub use error::{CnnError, Result};
pub use layers::{BatchNormParam, BnMode, ConvParam, PoolParam};
pub use network::{
    ConvNet, Evaluation, NetworkConfig, ParamSet, SevenLayerConvNet, SevenLayerParams,
    ThreeLayerConvNet, ThreeLayerParams,
};
pub use loss::softmax_loss;
