// SPDX-License-Identifier: MIT OR Apache-2.0

//! HiveNet Model - board value and move scoring networks for Hive
//!
//! Wires the kernels of `hivenet-core` into the full network: a stack of hexagonal
//! residual layers over the board grid, a skip-connection embedding of the scalar
//! board features, a bounded value head and a per-board softmax over candidate
//! actions.

#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod actions;
pub mod board;
pub mod config;
pub mod logging;
pub mod network;

// Re-export key types
pub use actions::{actions_model, dereference_position_embedding, ActionsBatch, ActionsOutput};
pub use board::{board_embeddings, board_model, full_board_convolutions, BoardLabels, BoardOutput};
pub use config::{LossConfig, ModelConfig, BOARD_FEATURES_DIM, FEATURES_PER_POSITION, NUM_PIECE_TYPES};
pub use logging::init_tracing;
pub use network::{HiveBatch, HiveNetwork, HiveOutput};
