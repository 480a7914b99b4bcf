// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation functions and the bounded prediction squash

use burn::tensor::{activation, backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

/// Largest absolute value a board prediction can take
pub const MAX_Q_VALUE: f64 = 10.0;

/// Predictions with absolute value up to this threshold pass through unchanged
pub const MAX_Q_LINEAR_VALUE: f64 = 9.8;

/// Horizontal stretch of the sigmoid used above the linear threshold
pub const SIGMOID_SMOOTHNESS: f64 = 4.0;

const SELU_ALPHA: f64 = 1.673_263_242_354_377_3;
const SELU_SCALE: f64 = 1.050_700_987_355_480_5;

/// Non-linearity applied after every dense or convolution layer
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Activation {
    Identity,
    Relu,
    LeakyRelu { slope: f64 },
    Selu,
    #[default]
    Swish,
    Sigmoid,
    Tanh,
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Identity => x,
            Activation::Relu => activation::relu(x),
            Activation::LeakyRelu { slope } => activation::leaky_relu(x, *slope),
            Activation::Selu => selu(x),
            Activation::Swish => activation::silu(x),
            Activation::Sigmoid => activation::sigmoid(x),
            Activation::Tanh => activation::tanh(x),
        }
    }
}

fn selu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let negative = x
        .clone()
        .clamp_max(0.0)
        .exp()
        .sub_scalar(1.0)
        .mul_scalar(SELU_ALPHA);
    activation::relu(x).add(negative).mul_scalar(SELU_SCALE)
}

/// Identity on `[-linear_threshold, linear_threshold]`, a scaled sigmoid beyond it.
///
/// Above the threshold the magnitude becomes
/// `t + (sigmoid((|x| - t) / smoothness) - 0.5) * 2 * (absolute_max - t)`, so the output
/// is continuous at `|x| = t`, strictly increasing and bounded by `absolute_max`.
/// The sign of `x` is preserved.
pub fn sigmoid_to_max<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    absolute_max: f64,
    linear_threshold: f64,
    smoothness: f64,
) -> Tensor<B, D> {
    let magnitude = x.clone().abs();
    let saturated = magnitude.clone().greater_elem(linear_threshold);

    let squashed = activation::sigmoid(
        magnitude
            .sub_scalar(linear_threshold)
            .div_scalar(smoothness),
    )
    .sub_scalar(0.5)
    .mul_scalar(2.0 * (absolute_max - linear_threshold))
    .add_scalar(linear_threshold);
    let squashed = x.clone().sign().mul(squashed);

    x.mask_where(saturated, squashed)
}
