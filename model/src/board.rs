// SPDX-License-Identifier: MIT OR Apache-2.0

//! Board sub-network: grid convolutions, scalar feature embedding and value head

use anyhow::{ensure, Result};
use burn::tensor::{backend::Backend, Tensor};
use hivenet_core::{
    build_skip_ffnn, dense, hexagonal_layer, sigmoid_to_max, FfnnConfig, LayerContext, ParamPath,
    MAX_Q_LINEAR_VALUE, MAX_Q_VALUE, SIGMOID_SMOOTHNESS,
};
use tracing::trace;

use crate::config::LossConfig;

/// Runs the stack of hexagonal residual layers over `full_board` (`[B,H,W,C]`).
///
/// Layer `i` lives under `hex_layer_{i}`. Returns the final grid embeddings and the
/// per-board `[max | mean | sum]` pooling over rows and columns.
pub fn full_board_convolutions<B: Backend>(
    ctx: &LayerContext<'_, B>,
    root: &ParamPath,
    full_board: Tensor<B, 4>,
    layers: usize,
    depth: usize,
) -> Result<(Tensor<B, 4>, Tensor<B, 2>)> {
    let mut grid = full_board;
    for layer in 0..layers {
        grid = ctx.dropout(grid);
        grid = hexagonal_layer(ctx, &(root / format!("hex_layer_{layer}")), grid, Some(depth), None)?;
    }

    // reduce over one flattened cell axis, kept last
    let [batch, rows, columns, channels] = grid.dims();
    let cells = grid
        .clone()
        .reshape([batch, rows * columns, channels])
        .swap_dims(1, 2);
    let max = cells.clone().max_dim(2).reshape([batch, channels]);
    let mean = cells.clone().mean_dim(2).reshape([batch, channels]);
    let sum = cells.sum_dim(2).reshape([batch, channels]);
    trace!(batch, channels, "pooled full board");

    Ok((grid, Tensor::cat(vec![max, mean, sum], 1)))
}

/// Skip-connection embedding of the per-board scalar features under `board_kernel`
pub fn board_embeddings<B: Backend>(
    ctx: &LayerContext<'_, B>,
    root: &ParamPath,
    board_features: Tensor<B, 2>,
    ffnn: &FfnnConfig,
) -> Result<Tensor<B, 2>> {
    Ok(build_skip_ffnn(ctx, &(root / "board_kernel"), board_features, ffnn)?)
}

/// Targets for the board value head
#[derive(Debug, Clone)]
pub struct BoardLabels<B: Backend> {
    pub labels: Tensor<B, 1>,
    /// Moves until the end of the game, required when `td_lambda != 1`
    pub moves_to_end: Option<Tensor<B, 1>>,
}

#[derive(Debug, Clone)]
pub struct BoardOutput<B: Backend> {
    /// Raw linear output, `[B]`
    pub raw_predictions: Tensor<B, 1>,
    /// Raw output squashed into `[-MAX_Q_VALUE, MAX_Q_VALUE]`
    pub predictions: Tensor<B, 1>,
    pub loss: Option<Tensor<B, 1>>,
}

/// Value head: dropout, a single linear unit under `board_output/linear_layer` and
/// the bounded prediction.
///
/// The loss is the mean absolute difference between labels and raw predictions,
/// weighted by `td_lambda ^ moves_to_end` when `td_lambda != 1`, plus
/// `prediction_l2_regularization * sum(raw^2)`.
pub fn board_model<B: Backend>(
    ctx: &LayerContext<'_, B>,
    root: &ParamPath,
    embeddings: Tensor<B, 2>,
    labels: Option<&BoardLabels<B>>,
    loss: &LossConfig,
) -> Result<BoardOutput<B>> {
    let [batch, _] = embeddings.dims();
    let embeddings = ctx.dropout(embeddings);
    let raw_predictions =
        dense(ctx, &(root / "board_output" / "linear_layer"), embeddings, 1)?.reshape([batch]);
    let predictions = sigmoid_to_max(
        raw_predictions.clone(),
        MAX_Q_VALUE,
        MAX_Q_LINEAR_VALUE,
        SIGMOID_SMOOTHNESS,
    );

    let loss = match labels {
        Some(labels) => Some(board_loss(raw_predictions.clone(), labels, loss)?),
        None => None,
    };
    Ok(BoardOutput {
        raw_predictions,
        predictions,
        loss,
    })
}

fn board_loss<B: Backend>(
    raw_predictions: Tensor<B, 1>,
    labels: &BoardLabels<B>,
    config: &LossConfig,
) -> Result<Tensor<B, 1>> {
    ensure!(
        labels.labels.dims() == raw_predictions.dims(),
        "board labels {:?} do not match predictions {:?}",
        labels.labels.dims(),
        raw_predictions.dims()
    );
    let differences = (labels.labels.clone() - raw_predictions.clone()).abs();

    let absolute = if config.td_lambda == 1.0 {
        differences.mean()
    } else {
        let moves_to_end = match &labels.moves_to_end {
            Some(moves) => moves.clone(),
            None => anyhow::bail!("td_lambda {} needs moves_to_end", config.td_lambda),
        };
        ensure!(
            moves_to_end.dims() == raw_predictions.dims(),
            "moves_to_end {:?} do not match predictions {:?}",
            moves_to_end.dims(),
            raw_predictions.dims()
        );
        let weights = moves_to_end.mul_scalar(config.td_lambda.ln()).exp();
        (differences * weights.clone()).sum() / weights.sum()
    };

    let prediction_l2 = raw_predictions
        .powf_scalar(2.0)
        .sum()
        .mul_scalar(config.prediction_l2_regularization);
    Ok(absolute + prediction_l2)
}
