// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hexagonal convolution and residual layer tests

use burn::backend::{Autodiff, NdArray};
use burn::nn::Initializer;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData, Tolerance};
use hivenet_core::{
    hexagonal_conv2d, hexagonal_layer, Activation, FilterInit, ForwardMode, LayerConfig,
    LayerContext, NetError, ParamPath, WeightStore,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

fn column<B: Backend>(values: &[f32]) -> Tensor<B, 4> {
    Tensor::from_data(
        TensorData::new(values.to_vec(), [values.len(), 1, 1, 1]),
        &Default::default(),
    )
}

fn small_filters<B: Backend>() -> FilterInit<B> {
    FilterInit::Explicit {
        center: column(&[0.001, 1.0, 0.001]),
        left: column(&[0.001, 0.001]),
        right: column(&[0.001, 0.001]),
    }
}

fn plain_config() -> LayerConfig {
    LayerConfig {
        activation: Activation::Identity,
        normalization: None,
        dropout_keep_probability: 1.0,
        initializer: Initializer::Zeros,
    }
}

/// Direct neighbour sum over the offset-coordinate hex lattice
fn reference_conv(
    input: &[f32],
    [batch, rows, columns, in_channels]: [usize; 4],
    out_channels: usize,
    center: &[f32],
    left: &[f32],
    right: &[f32],
) -> Vec<f32> {
    let at = |b: usize, r: isize, c: isize, i: usize| -> f32 {
        if r < 0 || c < 0 || r >= rows as isize || c >= columns as isize {
            return 0.0;
        }
        input[((b * rows + r as usize) * columns + c as usize) * in_channels + i]
    };
    // weights are [taps, 1, in, out] in row-major order
    let tap = |w: &[f32], k: usize, i: usize, o: usize| w[(k * in_channels + i) * out_channels + o];

    let mut out = vec![0.0; batch * rows * columns * out_channels];
    for b in 0..batch {
        for r in 0..rows as isize {
            for c in 0..columns as isize {
                let shift = c % 2;
                for o in 0..out_channels {
                    let mut acc = 0.0;
                    for i in 0..in_channels {
                        for k in 0..3 {
                            acc += tap(center, k, i, o) * at(b, r + k as isize - 1, c, i);
                        }
                        for k in 0..2 {
                            let row = r + k as isize - 1 + shift;
                            acc += tap(left, k, i, o) * at(b, row, c - 1, i);
                            acc += tap(right, k, i, o) * at(b, row, c + 1, i);
                        }
                    }
                    let index = ((b * rows + r as usize) * columns + c as usize) * out_channels + o;
                    out[index] = acc;
                }
            }
        }
    }
    out
}

#[test]
fn test_literal_convolution() {
    let device = Default::default();
    let store = WeightStore::<TestBackend>::new(device);
    let input = Tensor::<TestBackend, 1, Int>::arange(0..50, &device)
        .float()
        .reshape([2, 5, 5, 1]);

    let out = hexagonal_conv2d(&store, &ParamPath::new("hex"), input, 1, &small_filters()).unwrap();
    assert_eq!(out.dims(), [2, 5, 5, 1]);

    let expected = TensorData::from([
        [
            [0.006f32, 1.020, 2.011, 3.030, 4.012],
            [5.017, 6.046, 7.032, 8.058, 9.029],
            [10.037, 11.076, 12.062, 13.088, 14.049],
            [15.057, 16.106, 17.092, 18.118, 19.069],
            [20.052, 21.058, 22.095, 23.064, 24.060],
        ],
        [
            [25.056, 26.145, 27.086, 28.155, 29.062],
            [30.117, 31.196, 32.182, 33.208, 34.129],
            [35.137, 36.226, 37.212, 38.238, 39.149],
            [40.157, 41.256, 42.242, 43.268, 44.169],
            [45.127, 46.133, 47.220, 48.139, 49.135],
        ],
    ]);
    out.reshape([2, 5, 5])
        .into_data()
        .assert_approx_eq::<f32>(&expected, Tolerance::absolute(1e-3));
}

#[test]
fn test_convolution_matches_neighbour_sum() {
    let device = Default::default();
    let store = WeightStore::<TestBackend>::new(device);
    let mut rng = StdRng::seed_from_u64(7);
    let (batch, rows, columns, in_channels, out_channels) = (2, 4, 6, 3, 2);

    let mut sample = |len: usize| -> Vec<f32> { (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect() };
    let input = sample(batch * rows * columns * in_channels);
    let center = sample(3 * in_channels * out_channels);
    let left = sample(2 * in_channels * out_channels);
    let right = sample(2 * in_channels * out_channels);

    let weights = |values: &Vec<f32>, taps: usize| {
        Tensor::<TestBackend, 4>::from_data(
            TensorData::new(values.clone(), [taps, 1, in_channels, out_channels]),
            &device,
        )
    };
    let init = FilterInit::Explicit {
        center: weights(&center, 3),
        left: weights(&left, 2),
        right: weights(&right, 2),
    };
    let grid = Tensor::<TestBackend, 4>::from_data(
        TensorData::new(input.clone(), [batch, rows, columns, in_channels]),
        &device,
    );

    let out = hexagonal_conv2d(&store, &ParamPath::new("hex"), grid, out_channels, &init).unwrap();
    let expected = reference_conv(
        &input,
        [batch, rows, columns, in_channels],
        out_channels,
        &center,
        &left,
        &right,
    );
    out.into_data().assert_approx_eq::<f32>(
        &TensorData::new(expected, [batch, rows, columns, out_channels]),
        Tolerance::absolute(1e-4),
    );
}

#[test]
fn test_varying_grid_sizes_reuse_filters() {
    let device = Default::default();
    let store = WeightStore::<TestBackend>::new(device);
    let init = FilterInit::Initializer(Initializer::Normal { mean: 0.0, std: 0.1 });
    let path = ParamPath::new("hex_layer_0");

    let a = hexagonal_conv2d(&store, &path, Tensor::ones([1, 3, 4, 2], &device), 5, &init).unwrap();
    let b = hexagonal_conv2d(&store, &path, Tensor::ones([3, 7, 5, 2], &device), 5, &init).unwrap();
    assert_eq!(a.dims(), [1, 3, 4, 5]);
    assert_eq!(b.dims(), [3, 7, 5, 5]);
    assert_eq!(store.len(), 3);

    // same channel count is required on every later call
    let err = hexagonal_conv2d(&store, &path, Tensor::ones([1, 3, 4, 3], &device), 5, &init)
        .unwrap_err();
    assert!(matches!(err, NetError::ShapeMismatch { .. }));
}

#[test]
fn test_gradients_land_on_shared_weights() {
    let device = Default::default();
    let store = WeightStore::<TestAutodiffBackend>::new(device);
    let path = ParamPath::new("hex");
    let input = Tensor::<TestAutodiffBackend, 4>::ones([1, 3, 2, 1], &device);

    let out = hexagonal_conv2d(&store, &path, input, 1, &small_filters()).unwrap();
    let grads = out.sum().backward();

    let grad_of = |name: &str| -> Vec<f32> {
        let weight = store.get::<4>(&(&path / name)).unwrap().unwrap();
        weight.grad(&grads).unwrap().into_data().to_vec().unwrap()
    };
    // the center column is used by both kernels
    assert_eq!(grad_of("hex_filter_center"), vec![4.0, 6.0, 4.0]);
    // the single odd column reaches left, the single even column reaches right
    assert_eq!(grad_of("hex_filter_left"), vec![3.0, 2.0]);
    assert_eq!(grad_of("hex_filter_right"), vec![2.0, 3.0]);
}

#[test]
fn test_residual_with_equal_channels() {
    let device = Default::default();
    let store = WeightStore::<TestBackend>::new(device);
    let config = plain_config();
    let ctx = LayerContext::new(&store, &config, ForwardMode::Inference);
    let path = ParamPath::new("hex_layer_0");

    let input = Tensor::<TestBackend, 1, Int>::arange(0..50, &device)
        .float()
        .reshape([2, 5, 5, 1]);
    let out = hexagonal_layer(&ctx, &path, input.clone(), None, Some(&small_filters())).unwrap();
    let conv = hexagonal_conv2d(&store, &path, input.clone(), 1, &small_filters()).unwrap();

    out.into_data()
        .assert_approx_eq::<f32>(&(conv + input).into_data(), Tolerance::absolute(1e-4));
}

#[test]
fn test_residual_pads_extra_channels() {
    let device = Default::default();
    let store = WeightStore::<TestBackend>::new(device);
    let config = LayerConfig {
        activation: Activation::Relu,
        initializer: Initializer::Constant { value: -1.0 },
        ..plain_config()
    };
    let ctx = LayerContext::new(&store, &config, ForwardMode::Inference);

    // negative filters on a positive grid: relu(conv) is zero everywhere, leaving the
    // zero-padded residual
    let input = Tensor::<TestBackend, 4>::ones([1, 3, 3, 2], &device).mul_scalar(2.0);
    let out = hexagonal_layer(&ctx, &ParamPath::new("hex_layer_1"), input, Some(5), None).unwrap();
    assert_eq!(out.dims(), [1, 3, 3, 5]);

    let values: Vec<f32> = out.into_data().to_vec().unwrap();
    for (index, value) in values.iter().enumerate() {
        let expected = if index % 5 < 2 { 2.0 } else { 0.0 };
        assert!((value - expected).abs() < 1e-6, "index {index}: {value}");
    }
}

#[test]
fn test_residual_pads_input_under_a_nonzero_conv() {
    let device = Default::default();
    let store = WeightStore::<TestBackend>::new(device);
    let config = plain_config();
    let ctx = LayerContext::new(&store, &config, ForwardMode::Inference);
    let mut rng = StdRng::seed_from_u64(11);
    let (batch, rows, columns, in_channels, out_channels) = (2, 3, 4, 2, 5);

    let mut sample = |len: usize| -> Vec<f32> { (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect() };
    let input = sample(batch * rows * columns * in_channels);
    let center = sample(3 * in_channels * out_channels);
    let left = sample(2 * in_channels * out_channels);
    let right = sample(2 * in_channels * out_channels);

    let weights = |values: &Vec<f32>, taps: usize| {
        Tensor::<TestBackend, 4>::from_data(
            TensorData::new(values.clone(), [taps, 1, in_channels, out_channels]),
            &device,
        )
    };
    let init = FilterInit::Explicit {
        center: weights(&center, 3),
        left: weights(&left, 2),
        right: weights(&right, 2),
    };
    let grid = Tensor::<TestBackend, 4>::from_data(
        TensorData::new(input.clone(), [batch, rows, columns, in_channels]),
        &device,
    );

    let out = hexagonal_layer(
        &ctx,
        &ParamPath::new("hex_layer_0"),
        grid,
        Some(out_channels),
        Some(&init),
    )
    .unwrap();

    // identity activation: conv plus the input zero-padded from 2 to 5 channels
    let mut expected = reference_conv(
        &input,
        [batch, rows, columns, in_channels],
        out_channels,
        &center,
        &left,
        &right,
    );
    assert!(expected.iter().any(|v| v.abs() > 0.1));
    for cell in 0..batch * rows * columns {
        for channel in 0..in_channels {
            expected[cell * out_channels + channel] += input[cell * in_channels + channel];
        }
    }
    out.into_data().assert_approx_eq::<f32>(
        &TensorData::new(expected, [batch, rows, columns, out_channels]),
        Tolerance::absolute(1e-4),
    );
}

#[test]
fn test_residual_with_fewer_channels_is_unsupported() {
    let device = Default::default();
    let store = WeightStore::<TestBackend>::new(device);
    let config = plain_config();
    let ctx = LayerContext::new(&store, &config, ForwardMode::Inference);

    let input = Tensor::<TestBackend, 4>::ones([1, 3, 3, 4], &device);
    let err = hexagonal_layer(&ctx, &ParamPath::new("hex"), input, Some(2), None).unwrap_err();
    assert!(matches!(err, NetError::UnsupportedConfiguration(_)));
    assert!(store.is_empty());
}

#[test]
fn test_residual_layer_with_batch_norm_trains() {
    let device = Default::default();
    let store = WeightStore::<TestAutodiffBackend>::new(device);
    let config = LayerConfig::default();
    let ctx = LayerContext::new(&store, &config, ForwardMode::Training);
    let path = ParamPath::new("hex_layer_0");

    let input = Tensor::<TestAutodiffBackend, 4>::random(
        [2, 4, 4, 3],
        burn::tensor::Distribution::Normal(0.0, 1.0),
        &device,
    );
    let out = hexagonal_layer(&ctx, &path, input, Some(4), None).unwrap();
    let grads = out.powf_scalar(2.0).mean().backward();

    let center = store
        .get::<4>(&(&path / "hex_filter_center"))
        .unwrap()
        .unwrap();
    assert!(center.grad(&grads).is_some());
    assert!(store.contains(&ParamPath::new("hex_layer_0/batch_norm/gamma")));
}
