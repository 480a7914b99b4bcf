// SPDX-License-Identifier: MIT OR Apache-2.0

//! Radius-1 convolution over a hexagonal lattice stored as a rectangular grid
//!
//! Hexagons are laid out in offset coordinates: each column is a vertical stack of
//! cells and every other column is shifted half a cell down. A cell then has two
//! neighbours in its own column (above and below) and two in each adjacent column,
//! but which two rows those are depends on the parity of the cell's column.
//!
//! The convolution therefore uses two 3x3 kernels, one for even columns and one for
//! odd columns, composed from the same trainable weights:
//!
//! ```text
//!  even columns        odd columns
//!  [ l0  c0  r0 ]      [ 0   c0  0  ]
//!  [ l1  c1  r1 ]      [ l0  c1  r0 ]
//!  [ 0   c2  0  ]      [ l1  c2  r1 ]
//! ```
//!
//! Grids are channels-last (`[batch, rows, columns, channels]`) and kernels are
//! `[rows, columns, in_channels, out_channels]`.

use burn::nn::Initializer;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{backend::Backend, Bool, Int, Tensor};
use tracing::{debug, trace};

use crate::layers::{concat, LayerContext};
use crate::store::{Fans, ParamPath, WeightStore};
use crate::{check_shape, NetError, Result};

const CENTER: &str = "hex_filter_center";
const LEFT: &str = "hex_filter_left";
const RIGHT: &str = "hex_filter_right";

/// How the three filter components are created on first use of a layer path
#[derive(Debug, Clone)]
pub enum FilterInit<B: Backend> {
    /// Draw every component from an initializer
    Initializer(Initializer),
    /// Use explicit values: `center` is `[3,1,Cin,Cout]`, `left` and `right` are
    /// `[2,1,Cin,Cout]`
    Explicit {
        center: Tensor<B, 4>,
        left: Tensor<B, 4>,
        right: Tensor<B, 4>,
    },
}

/// The pair of `[3,3,Cin,Cout]` kernels backed by one set of weights
#[derive(Debug, Clone)]
pub struct HexFilters<B: Backend> {
    pub even: Tensor<B, 4>,
    pub odd: Tensor<B, 4>,
}

fn initialized_component<B: Backend>(
    store: &WeightStore<B>,
    path: &ParamPath,
    shape: [usize; 4],
    initializer: &Initializer,
) -> Result<Tensor<B, 4>> {
    let taps = shape[0];
    let fans = Fans::new(taps * shape[2], taps * shape[3]);
    store.get_or_init(path, shape, initializer, fans, false)
}

fn explicit_component<B: Backend>(
    store: &WeightStore<B>,
    path: &ParamPath,
    shape: [usize; 4],
    value: &Tensor<B, 4>,
) -> Result<Tensor<B, 4>> {
    check_shape(path.as_str(), &shape, &value.dims())?;
    store.get_or_insert(path, value.clone())
}

/// Returns the even and odd column kernels for the layer at `path`.
///
/// The weights live at `path/hex_filter_center`, `path/hex_filter_left` and
/// `path/hex_filter_right`. Both kernels are built from these three tensors, so a
/// gradient through either of them lands on the shared weights.
pub fn hexagonal_filters<B: Backend>(
    store: &WeightStore<B>,
    path: &ParamPath,
    in_channels: usize,
    out_channels: usize,
    init: &FilterInit<B>,
) -> Result<HexFilters<B>> {
    if in_channels == 0 || out_channels == 0 {
        return Err(NetError::InvalidChannels(format!(
            "hexagonal filters at {path} need non-zero channels, got {in_channels} -> {out_channels}"
        )));
    }

    let center_shape = [3, 1, in_channels, out_channels];
    let side_shape = [2, 1, in_channels, out_channels];
    let (center, left, right) = match init {
        FilterInit::Initializer(initializer) => (
            initialized_component(store, &(path / CENTER), center_shape, initializer)?,
            initialized_component(store, &(path / LEFT), side_shape, initializer)?,
            initialized_component(store, &(path / RIGHT), side_shape, initializer)?,
        ),
        FilterInit::Explicit {
            center,
            left,
            right,
        } => (
            explicit_component(store, &(path / CENTER), center_shape, center)?,
            explicit_component(store, &(path / LEFT), side_shape, left)?,
            explicit_component(store, &(path / RIGHT), side_shape, right)?,
        ),
    };

    // the zero tap is a constant, so side taps are placed with `concat`
    let padding = Tensor::<B, 4>::zeros([1, 1, in_channels, out_channels], store.device());
    let pad_below = |side: Tensor<B, 4>| concat(vec![side, padding.clone()], 0);
    let pad_above = |side: Tensor<B, 4>| concat(vec![padding.clone(), side], 0);

    let even = Tensor::cat(
        vec![pad_below(left.clone())?, center.clone(), pad_below(right.clone())?],
        1,
    );
    let odd = Tensor::cat(vec![pad_above(left)?, center, pad_above(right)?], 1);
    Ok(HexFilters { even, odd })
}

/// Boolean mask of shape `[batch, rows, columns, channels]`, true on even columns
pub fn column_parity_mask<B: Backend>(
    batch: usize,
    rows: usize,
    columns: usize,
    channels: usize,
    device: &B::Device,
) -> Tensor<B, 4, Bool> {
    Tensor::<B, 1, Int>::arange(0..columns as i64, device)
        .remainder_scalar(2)
        .equal_elem(0)
        .reshape([1, 1, columns, 1])
        .expand([batch, rows, columns, channels])
}

/// Stride 1, same padding cross-correlation of a channels-last grid
fn conv_same<B: Backend>(input: Tensor<B, 4>, kernel: Tensor<B, 4>) -> Tensor<B, 4> {
    let options = ConvOptions::new([1, 1], [1, 1], [1, 1], 1);
    conv2d(
        input.permute([0, 3, 1, 2]),
        kernel.permute([3, 2, 0, 1]),
        None,
        options,
    )
    .permute([0, 2, 3, 1])
}

/// Hexagonal convolution of `input` (`[B,H,W,Cin]`) into `out_channels` channels.
///
/// The whole grid is convolved with both kernels; each output cell then takes the
/// value from the kernel matching its column parity.
pub fn hexagonal_conv2d<B: Backend>(
    store: &WeightStore<B>,
    path: &ParamPath,
    input: Tensor<B, 4>,
    out_channels: usize,
    init: &FilterInit<B>,
) -> Result<Tensor<B, 4>> {
    let [batch, rows, columns, in_channels] = input.dims();
    let filters = hexagonal_filters(store, path, in_channels, out_channels, init)?;

    let even_out = conv_same(input.clone(), filters.even);
    let odd_out = conv_same(input, filters.odd);
    let mask = column_parity_mask::<B>(batch, rows, columns, out_channels, store.device());
    trace!(path = %path, batch, rows, columns, in_channels, out_channels, "hexagonal conv");

    Ok(odd_out.mask_where(mask, even_out))
}

/// Hexagonal convolution, activation and residual connection.
///
/// With `out_channels` equal to the input channels (the default) the input is added
/// back unchanged; with more channels it is zero-padded on the channel axis first.
/// Fewer output channels than input channels is rejected.
pub fn hexagonal_layer<B: Backend>(
    ctx: &LayerContext<'_, B>,
    path: &ParamPath,
    input: Tensor<B, 4>,
    out_channels: Option<usize>,
    init: Option<&FilterInit<B>>,
) -> Result<Tensor<B, 4>> {
    let [batch, rows, columns, in_channels] = input.dims();
    let out_channels = out_channels.unwrap_or(in_channels);
    if out_channels < in_channels {
        return Err(NetError::UnsupportedConfiguration(format!(
            "hexagonal layer {path} cannot reduce channels from {in_channels} to {out_channels}"
        )));
    }

    let default_init;
    let init = match init {
        Some(init) => init,
        None => {
            default_init = FilterInit::Initializer(ctx.config.initializer.clone());
            &default_init
        }
    };
    let conv = hexagonal_conv2d(ctx.store, path, input.clone(), out_channels, init)?;
    let activated = ctx.activate(path, conv)?;

    let residual = if out_channels == in_channels {
        input
    } else {
        debug!(path = %path, in_channels, out_channels, "zero-padding residual channels");
        let padding = Tensor::zeros(
            [batch, rows, columns, out_channels - in_channels],
            ctx.device(),
        );
        Tensor::cat(vec![input, padding], 3)
    };
    Ok(activated + residual)
}
