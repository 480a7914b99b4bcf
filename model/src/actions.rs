// SPDX-License-Identifier: MIT OR Apache-2.0

//! Actions sub-network: scores every candidate action of every board

use anyhow::{ensure, Context, Result};
use burn::tensor::{backend::Backend, Bool, Int, Tensor, TensorData};
use hivenet_core::{
    build_ffnn, concat, dense, sparse_cross_entropy_loss, sparse_log_softmax, FfnnConfig,
    LayerContext, ParamPath,
};
use tracing::trace;

/// Per-action inputs, flattened over all boards of a batch
#[derive(Debug, Clone)]
pub struct ActionsBatch<B: Backend> {
    /// Index of the board each action belongs to, `[N]`
    pub board_indices: Tensor<B, 1, Int>,
    /// Whether the action moves a piece already on the board (false for placements)
    pub is_move: Tensor<B, 1, Bool>,
    /// `[row, column]` of the source cell in the full board grid, `[N, 2]`
    pub src_positions: Tensor<B, 2, Int>,
    /// `[row, column]` of the target cell, `[N, 2]`
    pub tgt_positions: Tensor<B, 2, Int>,
    /// One-hot piece kind, `[N, num_piece_types]`
    pub pieces: Tensor<B, 2>,
    /// Target probability per action, one-hot or a distribution per board
    pub labels: Option<Tensor<B, 1>>,
}

impl<B: Backend> ActionsBatch<B> {
    pub fn len(&self) -> usize {
        self.board_indices.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ActionsOutput<B: Backend> {
    /// Probability of each action within its board, `[N]`
    pub predictions: Tensor<B, 1>,
    pub log_probabilities: Tensor<B, 1>,
    /// Summed cross-entropy divided by the number of boards
    pub loss: Option<Tensor<B, 1>>,
}

fn host_ints<B: Backend, const D: usize>(tensor: &Tensor<B, D, Int>) -> Result<Vec<i64>> {
    tensor
        .clone()
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| anyhow::anyhow!("failed to read indices: {err:?}"))
}

/// Gathers the grid embedding at `positions[i]` of board `board_indices[i]`.
///
/// `grid` is `[B,H,W,C]`, `positions` is `[N,2]` of `[row, column]`; the result is
/// `[N,C]`. Out of range boards or positions are rejected.
pub fn dereference_position_embedding<B: Backend>(
    grid: Tensor<B, 4>,
    board_indices: &Tensor<B, 1, Int>,
    positions: &Tensor<B, 2, Int>,
) -> Result<Tensor<B, 2>> {
    let [boards, rows, columns, channels] = grid.dims();
    let [actions] = board_indices.dims();
    ensure!(
        positions.dims() == [actions, 2],
        "positions {:?} do not match {} actions",
        positions.dims(),
        actions
    );

    let board_ids = host_ints(board_indices)?;
    let cells = host_ints(positions)?;
    let mut flat_indices = Vec::with_capacity(actions);
    for (action, (&board, cell)) in board_ids.iter().zip(cells.chunks(2)).enumerate() {
        let (row, column) = (cell[0], cell[1]);
        ensure!(
            (0..boards as i64).contains(&board)
                && (0..rows as i64).contains(&row)
                && (0..columns as i64).contains(&column),
            "action {action} points at board {board} cell ({row}, {column}) outside a {boards}x{rows}x{columns} grid"
        );
        flat_indices.push((board * rows as i64 + row) * columns as i64 + column);
    }

    let device = grid.device();
    let indices = Tensor::<B, 1, Int>::from_data(TensorData::new(flat_indices, [actions]), &device);
    Ok(grid
        .reshape([boards * rows * columns, channels])
        .select(0, indices))
}

/// Scores actions and, with labels, computes the actions loss.
///
/// Features per action are `[board embedding (detached) | is_move | source cell
/// embedding | target cell embedding | piece]`, where the source embedding is zeroed
/// for placements. They go through the plain FFNN under `actions_kernel`, dropout and
/// a single linear unit under `actions_kernel/final_linear_layer`; the logits are
/// normalized per board with the grouped log-softmax.
pub fn actions_model<B: Backend>(
    ctx: &LayerContext<'_, B>,
    root: &ParamPath,
    grid_embeddings: Tensor<B, 4>,
    board_embeddings: Tensor<B, 2>,
    batch: &ActionsBatch<B>,
    ffnn: &FfnnConfig,
) -> Result<ActionsOutput<B>> {
    let actions = batch.len();
    ensure!(actions > 0, "actions batch without any action");
    let [boards, _] = board_embeddings.dims();
    let channels = grid_embeddings.dims()[3];
    ensure!(
        batch.is_move.dims() == [actions],
        "is_move {:?} does not match {} actions",
        batch.is_move.dims(),
        actions
    );
    ensure!(
        batch.pieces.dims()[0] == actions,
        "pieces {:?} do not match {} actions",
        batch.pieces.dims(),
        actions
    );

    let src = dereference_position_embedding(
        grid_embeddings.clone(),
        &batch.board_indices,
        &batch.src_positions,
    )
    .context("dereferencing source positions")?;
    let placements = batch
        .is_move
        .clone()
        .bool_not()
        .reshape([actions, 1])
        .expand([actions, channels]);
    let src = src.mask_fill(placements, 0.0);
    let tgt = dereference_position_embedding(
        grid_embeddings,
        &batch.board_indices,
        &batch.tgt_positions,
    )
    .context("dereferencing target positions")?;

    let is_move = batch.is_move.clone().float().reshape([actions, 1]);
    let boards_per_action = board_embeddings
        .detach()
        .select(0, batch.board_indices.clone());
    // the board embedding and is_move lead the row without tracking gradients
    let features = concat(
        vec![boards_per_action, is_move, src, tgt, batch.pieces.clone()],
        1,
    )?;
    trace!(actions, boards, width = features.dims()[1], "action features");

    let scope = root / "actions_kernel";
    let embeddings = build_ffnn(ctx, &scope, features, ffnn)?;
    let embeddings = ctx.dropout(embeddings);
    let logits = dense(ctx, &(&scope / "final_linear_layer"), embeddings, 1)?.reshape([actions]);

    let log_probabilities = sparse_log_softmax(logits, batch.board_indices.clone())?;
    let predictions = log_probabilities.clone().exp();

    let loss = match &batch.labels {
        Some(labels) => {
            let terms = sparse_cross_entropy_loss(log_probabilities.clone(), labels.clone())?;
            Some(terms.sum().div_scalar(boards as f64))
        }
        None => None,
    };
    Ok(ActionsOutput {
        predictions,
        log_probabilities,
        loss,
    })
}
