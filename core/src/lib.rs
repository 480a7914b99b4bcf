// SPDX-License-Identifier: MIT OR Apache-2.0

//! HiveNet Core - reusable network kernels
//!
//! This crate provides the numerically interesting building blocks shared by every
//! HiveNet model variant:
//! - Segmented (grouped) log-softmax and cross-entropy over a variable number of
//!   candidate moves per board
//! - Parity-aware hexagonal convolution over a skewed rectangular grid, and the
//!   residual layer wrapping it
//! - Skip-connection feed-forward builders
//! - An explicit weight store keyed by symbolic parameter paths

#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod activation;
pub mod ffnn;
pub mod hex;
pub mod layers;
pub mod segmented;
pub mod store;

use thiserror::Error;

pub use activation::{
    sigmoid_to_max, Activation, MAX_Q_LINEAR_VALUE, MAX_Q_VALUE, SIGMOID_SMOOTHNESS,
};
pub use ffnn::{build_ffnn, build_skip_ffnn, FfnnConfig};
pub use hex::{
    column_parity_mask, hexagonal_conv2d, hexagonal_filters, hexagonal_layer, FilterInit,
    HexFilters,
};
pub use layers::{
    batch_norm, concat, dense, dropout, BatchNormConfig, ForwardMode, LayerConfig, LayerContext,
};
pub use segmented::{group_count, sparse_cross_entropy_loss, sparse_log_softmax};
pub use store::{Fans, ParamPath, WeightStore};

/// Errors raised while building or evaluating network kernels
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NetError {
    /// Tensor shapes disagree with what the kernel or the stored parameter expects
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Channel counts that cannot be used to build a kernel
    #[error("invalid channel configuration: {0}")]
    InvalidChannels(String),

    /// Valid input for which no behaviour is defined
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Group ids must be non-negative
    #[error("invalid group id {id} at item {index}")]
    InvalidGroupId { index: usize, id: i64 },

    /// The weight store was already locked by another construction call
    #[error("weight store is busy while building {0}")]
    StoreContended(String),

    /// A parameter path was registered with a different tensor rank
    #[error("parameter {path} has rank {stored}, requested rank {requested}")]
    RankMismatch {
        path: String,
        stored: usize,
        requested: usize,
    },

    /// Layer or model configuration values out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reading tensor values back from the backend failed
    #[error("tensor data error: {0}")]
    TensorData(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, NetError>;

pub(crate) fn check_shape(what: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(NetError::ShapeMismatch {
            what: what.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}
