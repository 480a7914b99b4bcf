// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feed-forward embedding builders

use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::layers::{dense, LayerContext};
use crate::store::ParamPath;
use crate::{NetError, Result};

/// Shape of a feed-forward stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FfnnConfig {
    /// Number of dense layers, the embedding layer included. Zero means identity.
    pub num_hidden_layers: usize,
    pub nodes_per_layer: usize,
    pub embedding_dim: usize,
    /// Concatenate the original input to the final embedding as well
    #[serde(default)]
    pub skip_final: bool,
}

impl FfnnConfig {
    /// Width of the skip-connection stack output for an input of width `input_dim`
    pub fn skip_output_dim(&self, input_dim: usize) -> usize {
        match (self.num_hidden_layers, self.skip_final) {
            (0, _) => input_dim,
            (_, true) => self.embedding_dim + input_dim,
            (_, false) => self.embedding_dim,
        }
    }

    /// Width of the plain stack output
    pub fn output_dim(&self, input_dim: usize) -> usize {
        if self.num_hidden_layers == 0 {
            input_dim
        } else {
            self.embedding_dim
        }
    }

    fn check(&self, path: &ParamPath, input_dim: usize) -> Result<()> {
        if input_dim == 0 {
            return Err(NetError::InvalidChannels(format!("{path}: empty input vectors")));
        }
        if self.embedding_dim == 0 {
            return Err(NetError::InvalidChannels(format!("{path}: zero embedding width")));
        }
        if self.num_hidden_layers > 1 && self.nodes_per_layer == 0 {
            return Err(NetError::InvalidChannels(format!("{path}: zero hidden width")));
        }
        Ok(())
    }
}

/// Dense stack whose hidden outputs are re-concatenated with the original input.
///
/// For `H > 0` hidden layers: `H - 1` rounds of dense `nodes_per_layer` plus activation
/// (under `path/hidden_{i}`), each followed by concatenation with `input`; then dense
/// `embedding_dim` plus activation under `path/embedding`, concatenated with `input`
/// again iff `skip_final`. `H = 0` returns `input` and creates no parameter.
pub fn build_skip_ffnn<B: Backend>(
    ctx: &LayerContext<'_, B>,
    path: &ParamPath,
    input: Tensor<B, 2>,
    config: &FfnnConfig,
) -> Result<Tensor<B, 2>> {
    if config.num_hidden_layers == 0 {
        return Ok(input);
    }
    let [_, input_dim] = input.dims();
    config.check(path, input_dim)?;

    let mut x = input.clone();
    for layer in 0..config.num_hidden_layers - 1 {
        let layer_path = path / format!("hidden_{layer}");
        let hidden = dense(ctx, &layer_path, ctx.dropout(x), config.nodes_per_layer)?;
        let hidden = ctx.activate(&layer_path, hidden)?;
        x = Tensor::cat(vec![hidden, input.clone()], 1);
    }

    let layer_path = path / "embedding";
    let embedding = dense(ctx, &layer_path, ctx.dropout(x), config.embedding_dim)?;
    let embedding = ctx.activate(&layer_path, embedding)?;
    let out = if config.skip_final {
        Tensor::cat(vec![embedding, input], 1)
    } else {
        embedding
    };
    trace!(path = %path, dims = ?out.dims(), "skip ffnn");
    Ok(out)
}

/// Plain dense stack: `H - 1` hidden layers of `nodes_per_layer` then the
/// `embedding_dim` layer, each with activation, no skip connections.
pub fn build_ffnn<B: Backend>(
    ctx: &LayerContext<'_, B>,
    path: &ParamPath,
    input: Tensor<B, 2>,
    config: &FfnnConfig,
) -> Result<Tensor<B, 2>> {
    if config.num_hidden_layers == 0 {
        return Ok(input);
    }
    let [_, input_dim] = input.dims();
    config.check(path, input_dim)?;

    let mut x = input;
    for layer in 0..config.num_hidden_layers - 1 {
        let layer_path = path / format!("hidden_{layer}");
        let hidden = dense(ctx, &layer_path, ctx.dropout(x), config.nodes_per_layer)?;
        x = ctx.activate(&layer_path, hidden)?;
    }

    let layer_path = path / "embedding";
    let embedding = dense(ctx, &layer_path, ctx.dropout(x), config.embedding_dim)?;
    let out = ctx.activate(&layer_path, embedding)?;
    trace!(path = %path, dims = ?out.dims(), "ffnn");
    Ok(out)
}
