// SPDX-License-Identifier: MIT OR Apache-2.0

//! Complete network: board value and action scoring over one weight store

use anyhow::{bail, ensure, Result};
use burn::tensor::{backend::Backend, Tensor};
use hivenet_core::{ForwardMode, LayerContext, ParamPath, WeightStore};
use tracing::{debug, info, warn};

use crate::actions::{actions_model, ActionsBatch};
use crate::board::{board_embeddings, board_model, full_board_convolutions, BoardLabels};
use crate::config::ModelConfig;

/// Inputs for one forward pass
#[derive(Debug, Clone)]
pub struct HiveBatch<B: Backend> {
    /// Per-board scalar features, `[B, board_features_dim]`
    pub board_features: Tensor<B, 2>,
    /// Hexagonal feature grid, `[B, H, W, features_per_position]`
    pub full_board: Option<Tensor<B, 4>>,
    pub board_labels: Option<BoardLabels<B>>,
    pub actions: Option<ActionsBatch<B>>,
}

impl<B: Backend> HiveBatch<B> {
    pub fn num_boards(&self) -> usize {
        self.board_features.dims()[0]
    }
}

/// Outputs of one forward pass
#[derive(Debug, Clone)]
pub struct HiveOutput<B: Backend> {
    /// Bounded board values, `[B]`
    pub board_predictions: Tensor<B, 1>,
    pub board_loss: Option<Tensor<B, 1>>,
    /// Per-action probabilities, `[N]`
    pub action_predictions: Option<Tensor<B, 1>>,
    pub actions_loss: Option<Tensor<B, 1>>,
    /// Weighted board and actions losses plus L2 regularization
    pub total_loss: Option<Tensor<B, 1>>,
}

/// Board and action scoring network.
///
/// Weights are created on the first forward pass and reused by every later one.
pub struct HiveNetwork<B: Backend> {
    config: ModelConfig,
    store: WeightStore<B>,
}

impl<B: Backend> HiveNetwork<B> {
    pub fn new(config: ModelConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        info!(
            full_board = config.full_board,
            actions = config.actions,
            conv_layers = config.conv_layers,
            conv_depth = config.conv_depth,
            "building hive network"
        );
        Ok(Self {
            config,
            store: WeightStore::new(device),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Weights, for the optimizer and for inspection
    pub fn store(&self) -> &WeightStore<B> {
        &self.store
    }

    pub fn num_params(&self) -> usize {
        self.store.num_params()
    }

    fn validate_batch(&self, batch: &HiveBatch<B>) -> Result<()> {
        let config = &self.config;
        let [boards, features] = batch.board_features.dims();
        ensure!(boards > 0, "empty batch");
        ensure!(
            features == config.board_features_dim,
            "board features have width {features}, expected {}",
            config.board_features_dim
        );

        match (&batch.full_board, config.full_board) {
            (Some(grid), true) => {
                let [grid_boards, rows, columns, channels] = grid.dims();
                ensure!(
                    grid_boards == boards,
                    "full board has {grid_boards} boards, board features have {boards}"
                );
                ensure!(rows > 0 && columns > 0, "full board grid is empty");
                ensure!(
                    channels == config.features_per_position,
                    "full board has {channels} channels per position, expected {}",
                    config.features_per_position
                );
            }
            (None, true) => bail!("full board grid missing"),
            (Some(_), false) => bail!("full board grid given but full_board is disabled"),
            (None, false) => {}
        }

        if let Some(labels) = &batch.board_labels {
            ensure!(
                labels.labels.dims() == [boards],
                "board labels {:?} do not match {boards} boards",
                labels.labels.dims()
            );
        }

        if let Some(actions) = &batch.actions {
            ensure!(config.actions, "actions given but action scoring is disabled");
            ensure!(
                actions.pieces.dims()[1] == config.num_piece_types,
                "pieces have width {}, expected {}",
                actions.pieces.dims()[1],
                config.num_piece_types
            );
            if let Some(labels) = &actions.labels {
                ensure!(
                    labels.dims() == [actions.len()],
                    "action labels {:?} do not match {} actions",
                    labels.dims(),
                    actions.len()
                );
            }
        }
        Ok(())
    }

    /// Runs the network over `batch`.
    ///
    /// Losses are only reported for the heads whose labels are present; the total loss
    /// additionally needs action labels whenever actions are scored.
    pub fn forward(&self, batch: &HiveBatch<B>, mode: ForwardMode) -> Result<HiveOutput<B>> {
        self.validate_batch(batch)?;
        let config = &self.config;
        let ctx = LayerContext::new(&self.store, &config.layer, mode);
        let root = ParamPath::root();

        let (grid_embeddings, embeddings) = match &batch.full_board {
            Some(full_board) => {
                let (grid, pooled) = full_board_convolutions(
                    &ctx,
                    &root,
                    full_board.clone(),
                    config.conv_layers,
                    config.conv_depth,
                )?;
                let scalar = board_embeddings(
                    &ctx,
                    &root,
                    batch.board_features.clone(),
                    &config.board_ffnn,
                )?;
                (Some(grid), Tensor::cat(vec![pooled, scalar], 1))
            }
            None => (
                None,
                board_embeddings(&ctx, &root, batch.board_features.clone(), &config.board_ffnn)?,
            ),
        };

        let board = board_model(
            &ctx,
            &root,
            embeddings.clone(),
            batch.board_labels.as_ref(),
            &config.loss,
        )?;

        let actions = match (&batch.actions, grid_embeddings) {
            (Some(actions), Some(grid)) => Some(actions_model(
                &ctx,
                &root,
                grid,
                embeddings,
                actions,
                &config.actions_ffnn,
            )?),
            (Some(_), None) => bail!("actions need the full board grid"),
            (None, _) => None,
        };

        let actions_loss = actions.as_ref().and_then(|out| out.loss.clone());
        let total_loss = match (&board.loss, &batch.actions, &actions_loss) {
            (Some(board_loss), None, _) => Some(self.total_loss(board_loss.clone(), None)?),
            (Some(board_loss), Some(_), Some(actions_loss)) => {
                Some(self.total_loss(board_loss.clone(), Some(actions_loss.clone()))?)
            }
            _ => None,
        };
        if mode.is_training() && total_loss.is_none() {
            warn!("training forward pass without complete labels, no total loss");
        }
        debug!(
            boards = batch.num_boards(),
            actions = batch.actions.as_ref().map_or(0, |a| a.len()),
            params = self.store.len(),
            "forward pass"
        );

        Ok(HiveOutput {
            board_predictions: board.predictions,
            board_loss: board.loss,
            action_predictions: actions.map(|out| out.predictions),
            actions_loss,
            total_loss,
        })
    }

    fn total_loss(
        &self,
        board_loss: Tensor<B, 1>,
        actions_loss: Option<Tensor<B, 1>>,
    ) -> Result<Tensor<B, 1>> {
        let loss = &self.config.loss;
        let mut total = board_loss.mul_scalar(loss.board_loss_ratio);
        if let Some(actions_loss) = actions_loss {
            total = total + actions_loss.mul_scalar(loss.actions_loss_ratio);
        }
        let regularization = self.store.regularization_loss()?;
        Ok(total + regularization.mul_scalar(loss.l2_regularization))
    }
}
