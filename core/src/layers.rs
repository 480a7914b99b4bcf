// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layer primitives shared by every builder: dense, batch normalization, dropout
//!
//! Builders never read global state. The activation, normalization and dropout
//! settings travel in a [`LayerConfig`], and the training / inference switch in a
//! [`ForwardMode`], both bundled with the weight store in a [`LayerContext`].

use std::ops::Range;

use burn::nn::Initializer;
use burn::tensor::{backend::Backend, Distribution, Tensor};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::activation::Activation;
use crate::store::{Fans, ParamPath, WeightStore};
use crate::{check_shape, NetError, Result};

/// Selects between the two forward code paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Batch statistics, moving average updates, active dropout
    Training,
    /// Moving averages, no dropout
    #[default]
    Inference,
}

impl ForwardMode {
    pub fn is_training(self) -> bool {
        matches!(self, ForwardMode::Training)
    }
}

/// Batch normalization hyper-parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchNormConfig {
    /// Decay of the moving mean / variance
    pub momentum: f64,
    pub epsilon: f64,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            momentum: 0.99,
            epsilon: 1e-3,
        }
    }
}

/// Settings threaded into every layer construction call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub activation: Activation,
    /// Batch normalization applied before the activation, when set
    pub normalization: Option<BatchNormConfig>,
    /// Probability of keeping a unit during training
    pub dropout_keep_probability: f64,
    /// Initializer for dense kernels and hexagonal filters
    pub initializer: Initializer,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Swish,
            normalization: Some(BatchNormConfig::default()),
            dropout_keep_probability: 1.0,
            initializer: Initializer::XavierUniform { gain: 1.0 },
        }
    }
}

impl LayerConfig {
    pub fn validate(&self) -> Result<()> {
        let keep = self.dropout_keep_probability;
        if !(keep > 0.0 && keep <= 1.0) {
            return Err(NetError::InvalidConfig(format!(
                "dropout keep probability must be in (0, 1], got {keep}"
            )));
        }
        if let Activation::LeakyRelu { slope } = self.activation {
            if !slope.is_finite() {
                return Err(NetError::InvalidConfig(format!(
                    "leaky relu slope must be finite, got {slope}"
                )));
            }
        }
        if let Some(norm) = &self.normalization {
            if !(0.0..1.0).contains(&norm.momentum) {
                return Err(NetError::InvalidConfig(format!(
                    "batch norm momentum must be in [0, 1), got {}",
                    norm.momentum
                )));
            }
            if norm.epsilon <= 0.0 {
                return Err(NetError::InvalidConfig(format!(
                    "batch norm epsilon must be positive, got {}",
                    norm.epsilon
                )));
            }
        }
        Ok(())
    }
}

/// Everything a builder needs besides its input: where the weights live, how layers
/// are configured and which forward path to take
#[derive(Debug)]
pub struct LayerContext<'a, B: Backend> {
    pub store: &'a WeightStore<B>,
    pub config: &'a LayerConfig,
    pub mode: ForwardMode,
}

impl<B: Backend> Clone for LayerContext<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for LayerContext<'_, B> {}

impl<'a, B: Backend> LayerContext<'a, B> {
    pub fn new(store: &'a WeightStore<B>, config: &'a LayerConfig, mode: ForwardMode) -> Self {
        Self {
            store,
            config,
            mode,
        }
    }

    pub fn device(&self) -> &B::Device {
        self.store.device()
    }

    /// Same store and config, different forward path
    pub fn with_mode(&self, mode: ForwardMode) -> Self {
        Self { mode, ..*self }
    }

    /// Optional batch normalization (under `path/batch_norm`) followed by the
    /// configured activation
    pub fn activate<const D: usize>(&self, path: &ParamPath, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let x = match self.config.normalization {
            Some(norm) => batch_norm(self, &(path / "batch_norm"), x, norm)?,
            None => x,
        };
        Ok(self.config.activation.apply(x))
    }

    /// Dropout with the configured keep probability
    pub fn dropout<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        dropout(x, self.config.dropout_keep_probability, self.mode)
    }
}

/// Fully connected layer without activation: `x · kernel + bias`.
///
/// The kernel `[in, units]` lives at `path/kernel` and counts towards L2
/// regularization; the zero-initialized bias lives at `path/bias`.
pub fn dense<B: Backend>(
    ctx: &LayerContext<'_, B>,
    path: &ParamPath,
    x: Tensor<B, 2>,
    units: usize,
) -> Result<Tensor<B, 2>> {
    let [batch, inputs] = x.dims();
    if inputs == 0 || units == 0 {
        return Err(NetError::InvalidChannels(format!(
            "dense layer {path} needs non-empty input and output, got {inputs} -> {units}"
        )));
    }

    let kernel = ctx.store.get_or_init(
        &(path / "kernel"),
        [inputs, units],
        &ctx.config.initializer,
        Fans::new(inputs, units),
        true,
    )?;
    let bias = ctx.store.get_or_init(
        &(path / "bias"),
        [units],
        &Initializer::Zeros,
        Fans::default(),
        false,
    )?;
    trace!(path = %path, batch, inputs, units, "dense");

    Ok(x.matmul(kernel) + bias.unsqueeze::<2>())
}

/// Channels-last batch normalization over every axis but the last.
///
/// Training normalizes with the batch statistics and folds them into the moving
/// averages kept at `path/moving_mean` and `path/moving_variance`; inference
/// normalizes with the moving averages and leaves them untouched.
pub fn batch_norm<B: Backend, const D: usize>(
    ctx: &LayerContext<'_, B>,
    path: &ParamPath,
    x: Tensor<B, D>,
    norm: BatchNormConfig,
) -> Result<Tensor<B, D>> {
    let shape = x.shape();
    let channels = shape.dims[D - 1];
    if channels == 0 {
        return Err(NetError::InvalidChannels(format!(
            "batch norm {path} over zero channels"
        )));
    }

    let gamma = ctx.store.get_or_init(
        &(path / "gamma"),
        [channels],
        &Initializer::Ones,
        Fans::default(),
        false,
    )?;
    let beta = ctx.store.get_or_init(
        &(path / "beta"),
        [channels],
        &Initializer::Zeros,
        Fans::default(),
        false,
    )?;
    let mean_path = path / "moving_mean";
    let variance_path = path / "moving_variance";
    let moving_mean = ctx
        .store
        .running_stat(&mean_path, |device| Tensor::zeros([channels], device))?;
    let moving_variance = ctx
        .store
        .running_stat(&variance_path, |device| Tensor::ones([channels], device))?;

    let flat: Tensor<B, 2> = x.reshape([-1, channels as i32]);
    let (mean, variance) = match ctx.mode {
        ForwardMode::Training => {
            let (variance, mean) = flat.clone().var_mean_bias(0);
            let decay = norm.momentum;
            let updated_mean = moving_mean.mul_scalar(decay)
                + mean.clone().detach().reshape([channels]).mul_scalar(1.0 - decay);
            let updated_variance = moving_variance.mul_scalar(decay)
                + variance.clone().detach().reshape([channels]).mul_scalar(1.0 - decay);
            ctx.store.set_running_stat(&mean_path, updated_mean)?;
            ctx.store.set_running_stat(&variance_path, updated_variance)?;
            (mean, variance)
        }
        ForwardMode::Inference => (
            moving_mean.unsqueeze::<2>(),
            moving_variance.unsqueeze::<2>(),
        ),
    };

    let normalized = (flat - mean) / variance.add_scalar(norm.epsilon).sqrt();
    let out = normalized * gamma.unsqueeze::<2>() + beta.unsqueeze::<2>();
    Ok(out.reshape(shape))
}

/// Inverted dropout: in training each unit survives with probability `keep` and is
/// scaled by `1 / keep`; inference is the identity.
pub fn dropout<B: Backend, const D: usize>(x: Tensor<B, D>, keep: f64, mode: ForwardMode) -> Tensor<B, D> {
    if !mode.is_training() || keep >= 1.0 {
        return x;
    }
    let mask = x.random_like(Distribution::Bernoulli(keep));
    (x * mask).div_scalar(keep)
}

/// Concatenation along `dim` for inputs that may not all track gradients.
///
/// Each part is written into its own slice of a zero tensor, so the gradient of a
/// tracked part is always read back from that part's slice, whatever constants or
/// detached tensors come before it. Plain `Tensor::cat` is fine when every input is
/// tracked, or when untracked inputs only come last.
pub fn concat<B: Backend, const D: usize>(tensors: Vec<Tensor<B, D>>, dim: usize) -> Result<Tensor<B, D>> {
    let Some(first) = tensors.first() else {
        return Err(NetError::InvalidChannels("nothing to concatenate".to_string()));
    };
    if dim >= D {
        return Err(NetError::InvalidChannels(format!(
            "cannot concatenate rank {D} tensors along axis {dim}"
        )));
    }

    let device = first.device();
    let mut dims = first.dims();
    dims[dim] = 0;
    for tensor in &tensors {
        let mut expected = dims;
        expected[dim] = tensor.dims()[dim];
        check_shape("concatenated tensor", &expected, &tensor.dims())?;
        dims[dim] += expected[dim];
    }

    let mut out = Tensor::<B, D>::zeros(dims, &device);
    let mut offset = 0;
    for tensor in tensors {
        let width = tensor.dims()[dim];
        let ranges: [Range<usize>; D] = std::array::from_fn(|axis| {
            if axis == dim {
                offset..offset + width
            } else {
                0..dims[axis]
            }
        });
        out = out.slice_assign(ranges, tensor);
        offset += width;
    }
    Ok(out)
}
