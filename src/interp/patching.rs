// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation patching and causal tracing.
//!
//! All three probes compare a clean prompt against a corrupted one (the
//! same prompt with one word swapped) and measure how a target logit at the
//! final position responds when a single activation is transplanted:
//!
//! - [`logit_difference_sweep`]: corrupted residual into the clean run, at
//!   every `(layer, position)`.
//! - [`causal_trace`]: clean residual at the final position into the
//!   corrupted run, one layer at a time.
//! - [`token_influence`]: replace one input token at a time with a neutral
//!   token.
//!
//! Patching works on token positions, so clean and corrupted prompts must
//! tokenize to the same length.

use candle_core::Tensor;
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::LensModel;
use crate::config::TraceConfig;
use crate::error::{LensError, Result};
use crate::hooks::{HookPoint, HookSpec, Intervention};
use crate::interp::grid::Grid;
use crate::util::tensor::{last_position_logits, logit_at};

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Apply `replacements` to `prompt` in order, replacing every occurrence.
///
/// ```
/// use candle_lens::interp::patching::corrupt_prompt;
///
/// let corrupted = corrupt_prompt("Dallas is in the state called", &[("Dallas", "Phoenix")]);
/// assert_eq!(corrupted, "Phoenix is in the state called");
/// ```
#[must_use]
pub fn corrupt_prompt(prompt: &str, replacements: &[(&str, &str)]) -> String {
    replacements
        .iter()
        .fold(prompt.to_owned(), |acc, &(original, replacement)| {
            acc.replace(original, replacement)
        })
}

/// Prompts and answer tokens for a logit-difference sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchingSetup {
    /// Prompt whose forward pass gets patched.
    pub clean_prompt: String,
    /// Prompt whose activations are patched in.
    pub corrupted_prompt: String,
    /// Answer expected from the clean prompt (e.g. `"Austin"`).
    pub answer_token: String,
    /// Answer expected from the corrupted prompt (e.g. `"Phoenix"`).
    pub corrupt_answer_token: String,
}

impl PatchingSetup {
    /// Build a setup by corrupting `clean_prompt` with `replacements`.
    #[must_use]
    pub fn from_replacements(
        clean_prompt: &str,
        replacements: &[(&str, &str)],
        answer_token: &str,
        corrupt_answer_token: &str,
    ) -> Self {
        Self {
            clean_prompt: clean_prompt.to_owned(),
            corrupted_prompt: corrupt_prompt(clean_prompt, replacements),
            answer_token: answer_token.to_owned(),
            corrupt_answer_token: corrupt_answer_token.to_owned(),
        }
    }

    /// The setup described by an experiment config.
    #[must_use]
    pub fn from_config(config: &TraceConfig) -> Self {
        Self {
            clean_prompt: config.clean_prompt.clone(),
            corrupted_prompt: config.corrupted_prompt(),
            answer_token: config.answer_token.clone(),
            corrupt_answer_token: config.corrupt_answer_token.clone(),
        }
    }
}

/// Tokenize both prompts and check they line up position by position.
fn aligned_ids(model: &LensModel, clean: &str, corrupted: &str) -> Result<(Vec<u32>, Vec<u32>)> {
    let clean_ids = model.to_tokens(clean)?;
    let corrupt_ids = model.to_tokens(corrupted)?;
    if clean_ids.len() != corrupt_ids.len() {
        return Err(LensError::Patching(format!(
            "clean prompt has {} tokens but corrupted prompt has {}; \
             patching needs aligned positions",
            clean_ids.len(),
            corrupt_ids.len()
        )));
    }
    Ok((clean_ids, corrupt_ids))
}

/// Final-position logits of `ids` with a single residual patch.
fn patched_final_logits(
    model: &LensModel,
    ids: &[u32],
    hook: HookPoint,
    position: usize,
    value: Tensor,
) -> Result<Vec<f32>> {
    let mut hooks = HookSpec::new();
    hooks.intervene(hook, Intervention::PatchPosition { position, value });
    let cache = model.run_ids(ids, &hooks)?;
    last_position_logits(cache.output())
}

// ---------------------------------------------------------------------------
// Logit-difference sweep
// ---------------------------------------------------------------------------

/// Result of [`logit_difference_sweep`].
#[derive(Debug, Clone, Serialize)]
pub struct PatchingSweep {
    /// Clean prompt tokens (grid columns).
    pub tokens: Vec<String>,
    /// Hook name of each grid row.
    pub row_labels: Vec<String>,
    /// `[(n_layers + 1) × seq_len]` of `logit[corrupt] - logit[answer]`.
    pub grid: Grid,
}

impl PatchingSweep {
    /// Row label and token of the cell where patching pushes hardest
    /// towards the corrupt answer.
    #[must_use]
    pub fn strongest_cell(&self) -> Option<(&str, &str, f32)> {
        let (row, col) = self.grid.argmax()?;
        Some((
            self.row_labels.get(row)?.as_str(),
            self.tokens.get(col)?.as_str(),
            self.grid.get(row, col)?,
        ))
    }
}

/// Hook points swept by [`logit_difference_sweep`]: the embedding sum,
/// then the output of every block.
#[must_use]
pub fn sweep_hooks(n_layers: usize) -> Vec<HookPoint> {
    std::iter::once(HookPoint::ResidPre(0))
        .chain((0..n_layers).map(HookPoint::ResidPost))
        .collect()
}

/// Patch the corrupted residual stream into the clean run at every
/// `(hook, position)` and record `logit[corrupt_answer] - logit[answer]`
/// at the final position.
///
/// Row 0 is `blocks.0.hook_resid_pre`; row `l + 1` is
/// `blocks.{l}.hook_resid_post`. Costs `(n_layers + 1) * seq_len` forward
/// passes.
///
/// # Errors
///
/// Returns [`LensError::Patching`] if the prompts tokenize to different
/// lengths, [`LensError::Tokenizer`] if an answer is not a single token,
/// and [`LensError::Model`] on tensor failures.
pub fn logit_difference_sweep(model: &LensModel, setup: &PatchingSetup) -> Result<PatchingSweep> {
    let (clean_ids, corrupt_ids) =
        aligned_ids(model, &setup.clean_prompt, &setup.corrupted_prompt)?;
    let answer_id = model.to_single_token(&setup.answer_token)?;
    let corrupt_answer_id = model.to_single_token(&setup.corrupt_answer_token)?;

    let hooks = sweep_hooks(model.num_layers());
    let mut capture = HookSpec::new();
    capture.capture_all(hooks.iter().cloned());
    let corrupt_cache = model.run_ids(&corrupt_ids, &capture)?;

    let seq_len = clean_ids.len();
    info!(
        rows = hooks.len(),
        seq_len,
        corrupted = %setup.corrupted_prompt,
        "running logit-difference sweep"
    );

    let mut grid = Grid::zeros(hooks.len(), seq_len);
    for (row, hook) in hooks.iter().enumerate() {
        // [seq, d_model]
        let corrupt_resid = corrupt_cache.require(hook)?.get(0)?;
        for pos in 0..seq_len {
            let logits = patched_final_logits(
                model,
                &clean_ids,
                hook.clone(),
                pos,
                corrupt_resid.get(pos)?,
            )?;
            let diff = logit_at(&logits, corrupt_answer_id)? - logit_at(&logits, answer_id)?;
            grid.set(row, pos, diff);
        }
        debug!(hook = %hook, "sweep row done");
    }

    Ok(PatchingSweep {
        tokens: model.to_str_tokens(&setup.clean_prompt)?,
        row_labels: hooks.iter().map(ToString::to_string).collect(),
        grid,
    })
}

// ---------------------------------------------------------------------------
// Causal trace
// ---------------------------------------------------------------------------

/// Recovery of one target token's logit at one layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LayerEffect {
    /// Layer whose `resid_post` was patched.
    pub layer: usize,
    /// `(patched - corrupt) / (clean - corrupt)`.
    pub effect: f32,
}

/// Causal trace of one target token across layers.
#[derive(Debug, Clone, Serialize)]
pub struct CausalTrace {
    /// Target token text.
    pub token: String,
    /// Target token ID.
    pub token_id: u32,
    /// Final-position logit on the clean prompt.
    pub clean_logit: f32,
    /// Final-position logit on the corrupted prompt.
    pub corrupt_logit: f32,
    /// One entry per layer.
    pub effects: Vec<LayerEffect>,
}

/// Fraction of the clean-vs-corrupt logit gap recovered by a patch.
///
/// Returns `0.0` when the clean and corrupt logits are identical.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn recovery_effect(clean: f32, corrupt: f32, patched: f32) -> f32 {
    if clean == corrupt {
        return 0.0;
    }
    (patched - corrupt) / (clean - corrupt)
}

/// Patch the clean `resid_post` at the final position into the corrupted
/// run, one layer at a time, and report how much of each target's clean
/// logit is recovered.
///
/// # Errors
///
/// Returns [`LensError::Patching`] if the prompts tokenize to different
/// lengths, [`LensError::Tokenizer`] if a target is not a single token,
/// and [`LensError::Model`] on tensor failures.
pub fn causal_trace(
    model: &LensModel,
    prompt: &str,
    replacements: &[(&str, &str)],
    targets: &[&str],
) -> Result<Vec<CausalTrace>> {
    let corrupted = corrupt_prompt(prompt, replacements);
    let (clean_ids, corrupt_ids) = aligned_ids(model, prompt, &corrupted)?;
    let target_ids = targets
        .iter()
        .map(|t| model.to_single_token(t))
        .collect::<Result<Vec<_>>>()?;

    let n_layers = model.num_layers();
    let final_pos = clean_ids.len() - 1;

    let mut capture = HookSpec::new();
    capture.capture_all((0..n_layers).map(HookPoint::ResidPost));
    let clean_cache = model.run_ids(&clean_ids, &capture)?;
    let clean_logits = last_position_logits(clean_cache.output())?;
    let corrupt_logits =
        last_position_logits(model.run_ids(&corrupt_ids, &HookSpec::new())?.output())?;
    info!(n_layers, final_pos, corrupted = %corrupted, "running causal trace");

    // One patched run per layer, shared by every target.
    let mut patched_logits = Vec::with_capacity(n_layers);
    for layer in 0..n_layers {
        let hook = HookPoint::ResidPost(layer);
        let clean_resid = clean_cache.require(&hook)?.get(0)?.get(final_pos)?;
        patched_logits.push(patched_final_logits(
            model,
            &corrupt_ids,
            hook,
            final_pos,
            clean_resid,
        )?);
        debug!(layer, "causal trace layer done");
    }

    targets
        .iter()
        .zip(&target_ids)
        .map(|(&token, &token_id)| {
            let clean_logit = logit_at(&clean_logits, token_id)?;
            let corrupt_logit = logit_at(&corrupt_logits, token_id)?;
            let effects = patched_logits
                .iter()
                .enumerate()
                .map(|(layer, logits)| {
                    let patched = logit_at(logits, token_id)?;
                    Ok(LayerEffect {
                        layer,
                        effect: recovery_effect(clean_logit, corrupt_logit, patched),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(CausalTrace {
                token: token.to_owned(),
                token_id,
                clean_logit,
                corrupt_logit,
                effects,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Token influence
// ---------------------------------------------------------------------------

/// Effect of masking one input position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenInfluence {
    /// Masked position.
    pub position: usize,
    /// Input token at that position.
    pub token: String,
    /// `normal - masked` target logit at the final position.
    pub influence: f32,
}

/// Influence ranking for one target token.
#[derive(Debug, Clone, Serialize)]
pub struct InfluenceRanking {
    /// Target token text.
    pub token: String,
    /// Target token ID.
    pub token_id: u32,
    /// Sorted by `|influence|`, largest first.
    pub influences: Vec<TokenInfluence>,
}

/// The default neutral token: the first id of `" "`.
///
/// # Errors
///
/// Returns [`LensError::Tokenizer`] if `" "` encodes to nothing.
pub fn default_neutral_token(model: &LensModel) -> Result<u32> {
    model
        .tokenizer()
        .encode_raw(" ")?
        .first()
        .copied()
        .ok_or_else(|| LensError::Tokenizer("\" \" encodes to no tokens".into()))
}

/// Replace each position except the last with `neutral` (default:
/// [`default_neutral_token`]) and measure the drop in each target's
/// final-position logit.
///
/// # Errors
///
/// Returns [`LensError::Tokenizer`] if a target is not a single token,
/// and [`LensError::Model`] on tensor failures.
pub fn token_influence(
    model: &LensModel,
    prompt: &str,
    targets: &[&str],
    neutral: Option<u32>,
) -> Result<Vec<InfluenceRanking>> {
    let neutral = match neutral {
        Some(id) => id,
        None => default_neutral_token(model)?,
    };
    let ids = model.to_tokens(prompt)?;
    let tokens = model.to_str_tokens(prompt)?;
    let target_ids = targets
        .iter()
        .map(|t| model.to_single_token(t))
        .collect::<Result<Vec<_>>>()?;

    let normal = last_position_logits(model.run_ids(&ids, &HookSpec::new())?.output())?;
    info!(positions = ids.len() - 1, neutral, "running token influence");

    let mut rankings: Vec<InfluenceRanking> = targets
        .iter()
        .zip(&target_ids)
        .map(|(&token, &token_id)| InfluenceRanking {
            token: token.to_owned(),
            token_id,
            influences: Vec::with_capacity(ids.len()),
        })
        .collect();

    for (position, token) in tokens.iter().enumerate().take(ids.len() - 1) {
        let mut masked_ids = ids.clone();
        if let Some(slot) = masked_ids.get_mut(position) {
            *slot = neutral;
        }
        let masked = last_position_logits(model.run_ids(&masked_ids, &HookSpec::new())?.output())?;

        for ranking in &mut rankings {
            let influence =
                logit_at(&normal, ranking.token_id)? - logit_at(&masked, ranking.token_id)?;
            ranking.influences.push(TokenInfluence {
                position,
                token: token.clone(),
                influence,
            });
        }
        debug!(position, "token influence position done");
    }

    for ranking in &mut rankings {
        ranking.influences.sort_by(|a, b| {
            b.influence
                .abs()
                .partial_cmp(&a.influence.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    Ok(rankings)
}
