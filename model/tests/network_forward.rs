// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end forward pass tests on a small network

use burn::backend::{Autodiff, NdArray};
use burn::tensor::{backend::Backend, Bool, Distribution, Int, Tensor, TensorData, Tolerance};
use hivenet_core::{FfnnConfig, ForwardMode, LayerConfig, ParamPath};
use hivenet_model::{ActionsBatch, BoardLabels, HiveBatch, HiveNetwork, LossConfig, ModelConfig};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

const BOARD_INDICES: [i64; 5] = [0, 0, 0, 1, 1];

fn small_config() -> ModelConfig {
    ModelConfig {
        board_features_dim: 6,
        features_per_position: 4,
        num_piece_types: 5,
        full_board: true,
        actions: true,
        conv_layers: 2,
        conv_depth: 8,
        board_ffnn: FfnnConfig {
            num_hidden_layers: 2,
            nodes_per_layer: 8,
            embedding_dim: 8,
            skip_final: true,
        },
        actions_ffnn: FfnnConfig {
            num_hidden_layers: 2,
            nodes_per_layer: 8,
            embedding_dim: 8,
            skip_final: false,
        },
        layer: LayerConfig::default(),
        loss: LossConfig::default(),
    }
}

fn actions<B: Backend>(with_labels: bool) -> ActionsBatch<B> {
    let device = Default::default();
    let cells = |values: [[i64; 2]; 5]| {
        let flat: Vec<i64> = values.iter().flatten().copied().collect();
        Tensor::<B, 2, Int>::from_data(TensorData::new(flat, [5, 2]), &device)
    };
    let mut pieces = vec![0.0f32; 25];
    for (action, piece) in [0, 2, 2, 4, 1].iter().enumerate() {
        pieces[action * 5 + piece] = 1.0;
    }

    ActionsBatch {
        board_indices: Tensor::from_data(TensorData::new(BOARD_INDICES.to_vec(), [5]), &device),
        is_move: Tensor::<B, 1, Bool>::from_data(
            TensorData::from([false, true, true, false, true]),
            &device,
        ),
        src_positions: cells([[0, 0], [1, 1], [2, 3], [0, 0], [1, 2]]),
        tgt_positions: cells([[1, 0], [2, 2], [0, 3], [1, 1], [2, 0]]),
        pieces: Tensor::from_data(TensorData::new(pieces, [5, 5]), &device),
        labels: with_labels.then(|| Tensor::from_floats([1.0, 0.0, 0.0, 0.0, 1.0], &device)),
    }
}

fn batch<B: Backend>(with_labels: bool) -> HiveBatch<B> {
    let device = Default::default();
    HiveBatch {
        board_features: Tensor::random([2, 6], Distribution::Normal(0.0, 1.0), &device),
        full_board: Some(Tensor::random(
            [2, 3, 4, 4],
            Distribution::Uniform(0.0, 1.0),
            &device,
        )),
        board_labels: with_labels.then(|| BoardLabels {
            labels: Tensor::from_floats([1.0, -1.0], &device),
            moves_to_end: None,
        }),
        actions: Some(actions(with_labels)),
    }
}

fn group_totals(probabilities: Vec<f32>) -> [f32; 2] {
    let mut totals = [0.0; 2];
    for (probability, board) in probabilities.iter().zip(BOARD_INDICES.iter()) {
        totals[*board as usize] += probability;
    }
    totals
}

#[test]
fn test_inference_shapes_and_probabilities() {
    let network = HiveNetwork::<TestBackend>::new(small_config(), Default::default()).unwrap();
    let output = network.forward(&batch(false), ForwardMode::Inference).unwrap();

    assert_eq!(output.board_predictions.dims(), [2]);
    assert!(output.board_loss.is_none());
    assert!(output.total_loss.is_none());

    let predictions: Vec<f32> = output
        .action_predictions
        .unwrap()
        .into_data()
        .to_vec()
        .unwrap();
    assert_eq!(predictions.len(), 5);
    for total in group_totals(predictions) {
        assert!((total - 1.0).abs() < 1e-5, "board total {total}");
    }

    let values: Vec<f32> = output.board_predictions.into_data().to_vec().unwrap();
    assert!(values.iter().all(|v| v.abs() < 10.0));
}

#[test]
fn test_weights_are_created_once() {
    let network = HiveNetwork::<TestBackend>::new(small_config(), Default::default()).unwrap();
    let input = batch(false);

    let first = network.forward(&input, ForwardMode::Inference).unwrap();
    let params = network.store().len();
    let second = network.forward(&input, ForwardMode::Inference).unwrap();

    assert_eq!(network.store().len(), params);
    first
        .board_predictions
        .into_data()
        .assert_approx_eq::<f32>(&second.board_predictions.into_data(), Tolerance::default());

    for path in [
        "hex_layer_0/hex_filter_center",
        "hex_layer_1/batch_norm/gamma",
        "board_kernel/hidden_0/kernel",
        "board_kernel/embedding/kernel",
        "board_output/linear_layer/kernel",
        "actions_kernel/hidden_0/kernel",
        "actions_kernel/final_linear_layer/kernel",
    ] {
        assert!(network.store().contains(&ParamPath::new(path)), "missing {path}");
    }
}

#[test]
fn test_training_loss_and_gradients() {
    let network =
        HiveNetwork::<TestAutodiffBackend>::new(small_config(), Default::default()).unwrap();
    let output = network.forward(&batch(true), ForwardMode::Training).unwrap();

    let total = output.total_loss.unwrap();
    let value: f32 = total.clone().into_scalar();
    assert!(value.is_finite() && value > 0.0);

    let grads = total.backward();
    let store = network.store();
    for path in [
        "hex_layer_0/hex_filter_left",
        "board_kernel/embedding/kernel",
        "actions_kernel/final_linear_layer/kernel",
    ] {
        let weight = store.get::<2>(&ParamPath::new(path)).ok().flatten();
        let has_grad = match weight {
            Some(weight) => weight.grad(&grads).is_some(),
            None => store
                .get::<4>(&ParamPath::new(path))
                .unwrap()
                .unwrap()
                .grad(&grads)
                .is_some(),
        };
        assert!(has_grad, "no gradient for {path}");
    }
}

#[test]
fn test_actions_loss_does_not_reach_board_features_network() {
    let network =
        HiveNetwork::<TestAutodiffBackend>::new(small_config(), Default::default()).unwrap();
    let mut input = batch::<TestAutodiffBackend>(true);
    input.board_labels = None;

    let output = network.forward(&input, ForwardMode::Training).unwrap();
    assert!(output.total_loss.is_none());
    let grads = output.actions_loss.unwrap().backward();

    let board_kernel = network
        .store()
        .get::<2>(&ParamPath::new("board_kernel/embedding/kernel"))
        .unwrap()
        .unwrap();
    assert!(board_kernel.grad(&grads).is_none());

    let hex_center = network
        .store()
        .get::<4>(&ParamPath::new("hex_layer_1/hex_filter_center"))
        .unwrap()
        .unwrap();
    assert!(hex_center.grad(&grads).is_some());
}

#[test]
fn test_board_only_network() {
    let config = ModelConfig {
        full_board: false,
        actions: false,
        ..small_config()
    };
    let network = HiveNetwork::<TestBackend>::new(config, Default::default()).unwrap();
    let mut input = batch::<TestBackend>(true);
    input.full_board = None;
    input.actions = None;

    let output = network.forward(&input, ForwardMode::Inference).unwrap();
    assert!(output.action_predictions.is_none());
    assert!(output.total_loss.is_some());
    assert!(!network
        .store()
        .paths()
        .iter()
        .any(|path| path.as_str().starts_with("hex_layer")));
}

#[test]
fn test_batch_validation() {
    let network = HiveNetwork::<TestBackend>::new(small_config(), Default::default()).unwrap();
    let device = Default::default();

    let mut input = batch::<TestBackend>(false);
    input.board_features = Tensor::zeros([2, 7], &device);
    assert!(network.forward(&input, ForwardMode::Inference).is_err());

    let mut input = batch::<TestBackend>(false);
    input.full_board = None;
    assert!(network.forward(&input, ForwardMode::Inference).is_err());

    let mut input = batch::<TestBackend>(true);
    if let Some(actions) = input.actions.as_mut() {
        actions.labels = Some(Tensor::from_floats([1.0, 0.0], &device));
    }
    assert!(network.forward(&input, ForwardMode::Inference).is_err());

    let mut input = batch::<TestBackend>(false);
    if let Some(actions) = input.actions.as_mut() {
        actions.src_positions = Tensor::from_data(
            TensorData::new(vec![0i64, 0, 1, 1, 2, 3, 0, 0, 9, 9], [5, 2]),
            &device,
        );
    }
    assert!(network.forward(&input, ForwardMode::Inference).is_err());
}
