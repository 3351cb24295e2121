use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CnnError, Result};
use crate::layers::conv::{conv_output_dim, ConvParam};
use crate::layers::pool::{pool_output_dim, PoolParam};
use crate::network::{read_json, write_json};

/// Hyperparameters that fix a network's parameter shapes and loss.
///
/// Fields:
/// - `input_dim`    — `(C, H, W)` of one input image
/// - `num_filters`  — filters per convolution stage
/// - `filter_size`  — odd side length of every filter; padding is
///                    `(filter_size - 1) / 2` so convolutions keep H and W
/// - `hidden_dim`   — units in the hidden affine layer
/// - `num_classes`  — scores produced by the last affine layer
/// - `weight_scale` — standard deviation of the Gaussian weight init
/// - `reg`          — L2 regularization strength
///
/// Missing fields in JSON fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub input_dim: (usize, usize, usize),
    pub num_filters: usize,
    pub filter_size: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    pub weight_scale: f64,
    pub reg: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            input_dim: (3, 32, 32),
            num_filters: 32,
            filter_size: 7,
            hidden_dim: 100,
            num_classes: 10,
            weight_scale: 1e-3,
            reg: 0.0,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        let (c, h, w) = self.input_dim;
        if c == 0 || h == 0 || w == 0 {
            return Err(CnnError::InvalidConfig(format!(
                "input_dim must be non-zero, got {:?}",
                self.input_dim
            )));
        }
        if self.filter_size == 0 || self.filter_size % 2 == 0 {
            return Err(CnnError::InvalidConfig(format!(
                "filter_size must be odd, got {}",
                self.filter_size
            )));
        }
        if self.num_filters == 0 || self.hidden_dim == 0 || self.num_classes == 0 {
            return Err(CnnError::InvalidConfig(
                "num_filters, hidden_dim and num_classes must be non-zero".into(),
            ));
        }
        if !(self.weight_scale.is_finite() && self.weight_scale >= 0.0) {
            return Err(CnnError::InvalidConfig(format!(
                "weight_scale must be finite and non-negative, got {}",
                self.weight_scale
            )));
        }
        if !(self.reg.is_finite() && self.reg >= 0.0) {
            return Err(CnnError::InvalidConfig(format!(
                "reg must be finite and non-negative, got {}",
                self.reg
            )));
        }
        Ok(())
    }

    /// Stride 1, size-preserving padding.
    pub fn conv_param(&self) -> ConvParam {
        ConvParam::same(self.filter_size)
    }

    /// 2×2 windows with stride 2.
    pub fn pool_param(&self) -> PoolParam {
        PoolParam::square(2)
    }

    /// Spatial size after one conv → relu → pool stage applied to an
    /// `h × w` map.
    pub fn stage_output(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        let conv = self.conv_param();
        let pool = self.pool_param();
        let ch = conv_output_dim(h, self.filter_size, conv.stride, conv.pad)?;
        let cw = conv_output_dim(w, self.filter_size, conv.stride, conv.pad)?;
        Ok((
            pool_output_dim(ch, pool.pool_height, pool.stride)?,
            pool_output_dim(cw, pool.pool_width, pool.stride)?,
        ))
    }

    /// Serializes the config to a pretty-printed JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(self, path)
    }

    /// Deserializes and validates a config previously written by `save_json`.
    pub fn load_json(path: impl AsRef<Path>) -> Result<NetworkConfig> {
        let config: NetworkConfig = read_json(path)?;
        config.validate()?;
        Ok(config)
    }
}
