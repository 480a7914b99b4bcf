// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model configuration: feature widths, sub-network sizes and loss weights

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use hivenet_core::{FfnnConfig, LayerConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Width of the per-board scalar feature vector
pub const BOARD_FEATURES_DIM: usize = 41;

/// Channels of every cell of the full board grid
pub const FEATURES_PER_POSITION: usize = 16;

/// Piece kinds, one-hot encoded per action
pub const NUM_PIECE_TYPES: usize = 5;

/// Loss weights and regularization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Board loss terms are weighted by `td_lambda ^ moves_to_end` unless this is 1
    pub td_lambda: f64,
    /// Weight of the sum of squared raw board predictions
    pub prediction_l2_regularization: f64,
    /// Weight of the sum of squared dense kernels
    pub l2_regularization: f64,
    pub board_loss_ratio: f64,
    pub actions_loss_ratio: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            td_lambda: 1.0,
            prediction_l2_regularization: 1e-3,
            l2_regularization: 1e-5,
            board_loss_ratio: 1.0,
            actions_loss_ratio: 1.0,
        }
    }
}

/// Full network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub board_features_dim: usize,
    pub features_per_position: usize,
    pub num_piece_types: usize,

    /// Convolve over the full board grid
    pub full_board: bool,
    /// Score actions; requires `full_board`
    pub actions: bool,

    pub conv_layers: usize,
    /// Output channels of every hexagonal layer
    pub conv_depth: usize,

    pub board_ffnn: FfnnConfig,
    pub actions_ffnn: FfnnConfig,

    pub layer: LayerConfig,
    pub loss: LossConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            board_features_dim: BOARD_FEATURES_DIM,
            features_per_position: FEATURES_PER_POSITION,
            num_piece_types: NUM_PIECE_TYPES,
            full_board: true,
            actions: true,
            conv_layers: 4,
            conv_depth: 256,
            board_ffnn: FfnnConfig {
                num_hidden_layers: 4,
                nodes_per_layer: 256 - BOARD_FEATURES_DIM,
                embedding_dim: 256 - BOARD_FEATURES_DIM,
                skip_final: true,
            },
            actions_ffnn: FfnnConfig {
                num_hidden_layers: 4,
                nodes_per_layer: 128,
                embedding_dim: 128,
                skip_final: false,
            },
            layer: LayerConfig::default(),
            loss: LossConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Loads a configuration from a `.json` or `.toml` file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?;

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&text)
                .with_context(|| format!("invalid TOML in {}", path.display()))?,
            Some("json") => serde_json::from_str(&text)
                .with_context(|| format!("invalid JSON in {}", path.display()))?,
            other => bail!("unsupported config format {:?} for {}", other, path.display()),
        };
        config.validate()?;

        info!(path = %path.display(), "loaded model config");
        Ok(config)
    }

    /// Writes the configuration as JSON or TOML, chosen by extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::to_string_pretty(self)?,
            Some("json") => serde_json::to_string_pretty(self)?,
            other => bail!("unsupported config format {:?} for {}", other, path.display()),
        };
        std::fs::write(path, text)
            .with_context(|| format!("failed to write model config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.layer.validate()?;

        ensure!(self.board_features_dim > 0, "board_features_dim must be positive");
        ensure!(
            self.board_ffnn.num_hidden_layers == 0 || self.board_ffnn.embedding_dim > 0,
            "board embedding width must be positive"
        );
        if self.full_board {
            ensure!(self.features_per_position > 0, "features_per_position must be positive");
            ensure!(
                self.conv_layers == 0 || self.conv_depth >= self.features_per_position,
                "conv_depth ({}) must be at least features_per_position ({})",
                self.conv_depth,
                self.features_per_position
            );
        }
        if self.actions {
            ensure!(self.full_board, "scoring actions requires full_board convolutions");
            ensure!(self.num_piece_types > 0, "num_piece_types must be positive");
            ensure!(
                self.actions_ffnn.num_hidden_layers > 0,
                "the actions network needs at least one layer"
            );
        }

        let loss = &self.loss;
        ensure!(
            loss.td_lambda > 0.0 && loss.td_lambda <= 1.0,
            "td_lambda must be in (0, 1], got {}",
            loss.td_lambda
        );
        for (name, value) in [
            ("prediction_l2_regularization", loss.prediction_l2_regularization),
            ("l2_regularization", loss.l2_regularization),
            ("board_loss_ratio", loss.board_loss_ratio),
            ("actions_loss_ratio", loss.actions_loss_ratio),
        ] {
            ensure!(value >= 0.0, "{name} must not be negative, got {value}");
        }
        Ok(())
    }

    /// Channels of the grid embeddings after the convolution stack
    pub fn grid_channels(&self) -> usize {
        if self.conv_layers == 0 {
            self.features_per_position
        } else {
            self.conv_depth
        }
    }

    /// Width of the per-board embedding fed to the board and actions heads
    pub fn board_embedding_dim(&self) -> usize {
        let scalar = self.board_ffnn.skip_output_dim(self.board_features_dim);
        if self.full_board {
            3 * self.grid_channels() + scalar
        } else {
            scalar
        }
    }

    /// Width of the per-action feature vector
    pub fn action_features_dim(&self) -> usize {
        self.board_embedding_dim() + 1 + 2 * self.grid_channels() + self.num_piece_types
    }
}
