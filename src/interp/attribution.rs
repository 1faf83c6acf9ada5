// SPDX-License-Identifier: MIT OR Apache-2.0

//! Direct logit attribution per attention head and MLP.
//!
//! Every component writes additively into the residual stream, so its
//! direct effect on a token's logit is its output at the final position
//! dotted with that token's unembedding column. No final norm is applied,
//! matching the logit lens.

use candle_core::{DType, Tensor};
use serde::Serialize;
use tracing::debug;

use crate::backend::LensModel;
use crate::error::{LensError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec};

/// Number of components kept by [`top_contributors`] in the default report.
pub const DEFAULT_TOP_CONTRIBUTORS: usize = 10;

/// A residual-stream writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Component {
    /// Attention head `head` of `layer`.
    Head {
        /// Layer index.
        layer: usize,
        /// Head index.
        head: usize,
    },
    /// The MLP of `layer`.
    Mlp {
        /// Layer index.
        layer: usize,
    },
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Head { layer, head } => write!(f, "L{layer}H{head}"),
            Self::Mlp { layer } => write!(f, "L{layer}MLP"),
        }
    }
}

/// One component's direct contribution to a target logit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Contribution {
    /// Which component.
    pub component: Component,
    /// `output[final_pos] · W_U[:, target]`.
    pub value: f32,
}

/// All component contributions for one target token, in layer order
/// (heads of a layer first, then its MLP).
#[derive(Debug, Clone, Serialize)]
pub struct TokenContributions {
    /// Target token text.
    pub token: String,
    /// Target token ID.
    pub token_id: u32,
    /// One entry per head and per MLP.
    pub components: Vec<Contribution>,
}

impl TokenContributions {
    /// Contribution of the component named `name` (e.g. `"L9H8"`).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f32> {
        self.components
            .iter()
            .find(|c| c.component.to_string() == name)
            .map(|c| c.value)
    }

    /// Sum of every component's contribution.
    #[must_use]
    pub fn total(&self) -> f32 {
        self.components.iter().map(|c| c.value).sum()
    }
}

/// Hooks that [`component_contributions`] and [`attention_patterns`] read.
#[must_use]
pub fn attribution_hooks(n_layers: usize) -> HookSpec {
    let mut hooks = HookSpec::new();
    for layer in 0..n_layers {
        hooks
            .capture(HookPoint::AttnResult(layer))
            .capture(HookPoint::MlpOut(layer))
            .capture(HookPoint::AttnPattern(layer));
    }
    hooks
}

/// Slice `[0, final_pos]` out of a `[batch, seq, ..]` activation.
fn at_final_position(tensor: &Tensor, final_pos: usize, hook: &HookPoint) -> Result<Tensor> {
    let seq_len = tensor.dim(1)?;
    if final_pos >= seq_len {
        return Err(LensError::Hook(format!(
            "{hook}: position {final_pos} out of range (seq_len={seq_len})"
        )));
    }
    Ok(tensor.get(0)?.get(final_pos)?)
}

/// Direct contribution of every head and MLP to each target's logit at
/// `final_pos`.
///
/// `cache` must come from a run with [`attribution_hooks`].
///
/// # Errors
///
/// Returns [`LensError::Tokenizer`] if a target is not a single token,
/// [`LensError::Hook`] if a capture is missing or `final_pos` is out of
/// range, and [`LensError::Model`] on tensor failures.
pub fn component_contributions(
    model: &LensModel,
    cache: &HookCache,
    final_pos: usize,
    targets: &[&str],
) -> Result<Vec<TokenContributions>> {
    let target_ids = targets
        .iter()
        .map(|t| model.to_single_token(t))
        .collect::<Result<Vec<_>>>()?;

    // [d_model, n_targets]
    let columns = target_ids
        .iter()
        .map(|&id| model.backend().unembedding_vector(id))
        .collect::<Result<Vec<_>>>()?;
    let w_u = Tensor::stack(&columns, 1)?.to_dtype(DType::F32)?;

    let n_heads = model.num_heads();
    let mut per_target: Vec<Vec<Contribution>> = target_ids
        .iter()
        .map(|_| Vec::with_capacity(model.num_layers() * (n_heads + 1)))
        .collect();

    for layer in 0..model.num_layers() {
        let hook = HookPoint::AttnResult(layer);
        // [heads, d_model] @ [d_model, n_targets] -> [heads, n_targets]
        let heads: Vec<Vec<f32>> = at_final_position(cache.require(&hook)?, final_pos, &hook)?
            .to_dtype(DType::F32)?
            .matmul(&w_u)?
            .to_vec2()?;

        let hook = HookPoint::MlpOut(layer);
        // [1, d_model] @ [d_model, n_targets] -> [n_targets]
        let mlp: Vec<f32> = at_final_position(cache.require(&hook)?, final_pos, &hook)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .matmul(&w_u)?
            .squeeze(0)?
            .to_vec1()?;

        for (t, contributions) in per_target.iter_mut().enumerate() {
            for (head, row) in heads.iter().enumerate() {
                if let Some(&value) = row.get(t) {
                    contributions.push(Contribution {
                        component: Component::Head { layer, head },
                        value,
                    });
                }
            }
            if let Some(&value) = mlp.get(t) {
                contributions.push(Contribution {
                    component: Component::Mlp { layer },
                    value,
                });
            }
        }
        debug!(layer, "attribution layer done");
    }

    Ok(targets
        .iter()
        .zip(target_ids)
        .zip(per_target)
        .map(|((&token, token_id), components)| TokenContributions {
            token: token.to_owned(),
            token_id,
            components,
        })
        .collect())
}

/// The `n` components with the largest `|value|`, largest first.
#[must_use]
pub fn top_contributors(contributions: &TokenContributions, n: usize) -> Vec<Contribution> {
    let mut sorted = contributions.components.clone();
    sorted.sort_by(|a, b| {
        b.value
            .abs()
            .partial_cmp(&a.value.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    sorted.truncate(n);
    sorted
}

/// Stack `AttnPattern(l)[0]` for every layer.
///
/// # Shapes
/// - returns: `[n_layers, n_heads, seq, seq]`
///
/// # Errors
///
/// Returns [`LensError::Hook`] if a pattern was not captured.
pub fn attention_patterns(cache: &HookCache, n_layers: usize) -> Result<Tensor> {
    let patterns = (0..n_layers)
        .map(|layer| Ok(cache.require(&HookPoint::AttnPattern(layer))?.get(0)?))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&patterns, 0)?)
}
