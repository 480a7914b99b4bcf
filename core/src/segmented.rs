// SPDX-License-Identifier: MIT OR Apache-2.0

//! Log-softmax and cross-entropy over items partitioned into groups
//!
//! Every board in a batch has its own, data dependent, number of candidate moves.
//! All moves of the batch are scored as one flat vector and tagged with the index of
//! the board they belong to; normalization then happens within each group.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use tracing::trace;

use crate::{check_shape, NetError, Result};

/// Reads the group ids back from the device, rejecting negative ids
fn host_group_ids<B: Backend>(group_ids: &Tensor<B, 1, Int>) -> Result<Vec<usize>> {
    let ids = group_ids
        .clone()
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| NetError::TensorData(format!("{err:?}")))?;

    ids.into_iter()
        .enumerate()
        .map(|(index, id)| usize::try_from(id).map_err(|_| NetError::InvalidGroupId { index, id }))
        .collect()
}

/// Number of groups addressed by `group_ids`, that is `max(id) + 1`, or 0 when empty
pub fn group_count<B: Backend>(group_ids: &Tensor<B, 1, Int>) -> Result<usize> {
    let ids = host_group_ids(group_ids)?;
    Ok(ids.iter().max().map_or(0, |max| max + 1))
}

/// Log-softmax of `logits` within the groups given by `group_ids`.
///
/// Item `i` in group `g` gets `logits[i] - log(sum_{j in g} exp(logits[j]))`. The
/// per-group maximum is subtracted before exponentiation and is not differentiated
/// through; a group with a single item therefore yields exactly 0. Group ids must
/// be non-negative. Ids that no item uses are legal and have no effect.
///
/// The group ids and the detached logits are read back to the host to validate the
/// ids and take the per-group maxima, since the backend has no scatter-max. Every
/// call therefore synchronizes with the device once; the sums, logs and gradients
/// stay on the device.
pub fn sparse_log_softmax<B: Backend>(
    logits: Tensor<B, 1>,
    group_ids: Tensor<B, 1, Int>,
) -> Result<Tensor<B, 1>> {
    let [items] = logits.dims();
    check_shape("group ids", &[items], &group_ids.dims())?;
    if items == 0 {
        return Ok(logits);
    }

    let ids = host_group_ids(&group_ids)?;
    let groups = ids.iter().max().map_or(0, |max| max + 1);
    let values = logits
        .clone()
        .detach()
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|err| NetError::TensorData(format!("{err:?}")))?;

    let mut maxima = vec![0.0f64; groups];
    let mut used = vec![false; groups];
    for (&id, &value) in ids.iter().zip(values.iter()) {
        maxima[id] = if used[id] { maxima[id].max(value) } else { value };
        used[id] = true;
    }
    // unused groups sum to one so their log stays finite
    let filler: Vec<f64> = used.iter().map(|&used| if used { 0.0 } else { 1.0 }).collect();
    trace!(items, groups, "sparse log softmax");

    let device = logits.device();
    let maxima = Tensor::<B, 1>::from_data(TensorData::new(maxima, [groups]), &device)
        .select(0, group_ids.clone());
    let shifted = logits - maxima;

    let sums = Tensor::<B, 1>::from_data(TensorData::new(filler, [groups]), &device)
        .select_assign(0, group_ids.clone(), shifted.clone().exp());
    let log_sums = sums.log().select(0, group_ids);

    Ok(shifted - log_sums)
}

/// Per-item cross-entropy terms `label_i * -log_prob_i`.
///
/// The caller reduces the terms, usually summing and dividing by the number of groups.
pub fn sparse_cross_entropy_loss<B: Backend>(
    log_probs: Tensor<B, 1>,
    labels: Tensor<B, 1>,
) -> Result<Tensor<B, 1>> {
    check_shape("labels", &log_probs.dims(), &labels.dims())?;
    Ok(labels * log_probs.neg())
}
