// SPDX-License-Identifier: MIT OR Apache-2.0

//! Small tensor-to-`Vec` helpers shared by the probes.

use candle_core::{DType, Tensor};

use crate::error::{LensError, Result};

/// Logits at the final sequence position of batch item 0, as `f32`.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - returns: `vocab` values
///
/// # Errors
///
/// Returns [`LensError::Model`] if `logits` is not 3D.
pub fn last_position_logits(logits: &Tensor) -> Result<Vec<f32>> {
    let (_batch, seq_len, _vocab) = logits.dims3()?;
    position_logits(logits, seq_len.saturating_sub(1))
}

/// Logits at `position` of batch item 0, as `f32`.
///
/// # Errors
///
/// Returns [`LensError::Hook`] if `position` is out of range.
pub fn position_logits(logits: &Tensor, position: usize) -> Result<Vec<f32>> {
    let (_batch, seq_len, _vocab) = logits.dims3()?;
    if position >= seq_len {
        return Err(LensError::Hook(format!(
            "position {position} out of range (seq_len={seq_len})"
        )));
    }
    Ok(logits
        .get(0)?
        .get(position)?
        .to_dtype(DType::F32)?
        .to_vec1()?)
}

/// Numerically stable softmax over a slice.
#[must_use]
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let max_val = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = values.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();
    exp_vals.iter().map(|x| x / sum).collect()
}

/// The `k` largest values with their indices, largest first.
///
/// `k` is clamped to `values.len()`. Ties keep the lower index first.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub fn top_k(values: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = values
        .iter()
        .enumerate()
        .map(|(idx, &v)| (idx as u32, v))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k.min(values.len()));
    indexed
}

/// Value at `token_id`.
///
/// # Errors
///
/// Returns [`LensError::Hook`] if `token_id` is out of range.
pub fn logit_at(logits: &[f32], token_id: u32) -> Result<f32> {
    #[allow(clippy::as_conversions)]
    let idx = token_id as usize;
    logits.get(idx).copied().ok_or_else(|| {
        LensError::Hook(format!(
            "token ID {token_id} out of range (vocab_size={})",
            logits.len()
        ))
    })
}

/// Dot product of two equal-length slices.
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Convert a 4D tensor to nested `Vec`s.
///
/// # Errors
///
/// Returns [`LensError::Hook`] if the tensor is not 4D.
pub fn tensor_to_vec4(tensor: &Tensor) -> Result<Vec<Vec<Vec<Vec<f32>>>>> {
    let &[s0, s1, s2, s3] = tensor.dims() else {
        return Err(LensError::Hook(format!(
            "expected 4D tensor, got {}D",
            tensor.dims().len()
        )));
    };

    let flat: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

    let mut result = Vec::with_capacity(s0);
    let mut iter = flat.into_iter();
    for _ in 0..s0 {
        let mut axis1 = Vec::with_capacity(s1);
        for _ in 0..s1 {
            let mut axis2 = Vec::with_capacity(s2);
            for _ in 0..s2 {
                let row: Vec<f32> = iter.by_ref().take(s3).collect();
                axis2.push(row);
            }
            axis1.push(axis2);
        }
        result.push(axis1);
    }
    Ok(result)
}
