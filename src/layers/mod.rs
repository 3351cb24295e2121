pub mod affine;
pub mod batchnorm;
pub mod conv;
pub mod fused;
pub mod module;
pub mod pool;
pub mod spatial_batchnorm;

pub use affine::{affine_backward, affine_forward, AffineCache};
pub use batchnorm::{batchnorm_backward, batchnorm_forward, BatchNormCache, BatchNormParam, BnMode};
pub use conv::{conv_backward, conv_forward, conv_output_dim, ConvCache, ConvParam};
pub use fused::{
    affine_relu_backward, affine_relu_forward, conv_relu_pool_backward, conv_relu_pool_forward,
    AffineReluCache, ConvReluPoolCache,
};
pub use module::{Conv2d, Layer, MaxPool2d, Relu, SpatialBatchNorm2d};
pub use pool::{max_pool_backward, max_pool_forward, pool_output_dim, PoolCache, PoolParam};
pub use spatial_batchnorm::{
    spatial_batchnorm_backward, spatial_batchnorm_forward, SpatialBatchNormCache,
};
