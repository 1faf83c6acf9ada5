// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logit lens: project hidden states to vocabulary at each layer.
//!
//! Multiplies the residual stream after each block by the unembedding
//! matrix to see what the model would predict if it stopped there. By
//! default the final layer norm is skipped, so layer `L-1` does not
//! reproduce the model's own logits exactly;
//! [`LensOptions::apply_final_norm`] turns it on.

use candle_core::{DType, Tensor};
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::LensModel;
use crate::cache::ResidualCache;
use crate::error::{LensError, Result};
use crate::interp::grid::Grid;
use crate::util::tensor::{softmax, top_k};

/// Default number of predictions kept per layer.
pub const DEFAULT_TOP_K: usize = 5;

/// Number of tokens tracked when none are given.
const DEFAULT_TRACKED: usize = 3;

/// Result of applying logit lens at a single layer.
#[derive(Debug, Clone, Serialize)]
pub struct LogitLensResult {
    /// Layer index (0-indexed).
    pub layer: usize,
    /// Top-k token predictions with probabilities.
    pub predictions: Vec<TokenPrediction>,
}

/// A single token prediction from logit lens analysis.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPrediction {
    /// Token ID in the vocabulary.
    pub token_id: u32,
    /// Decoded token string.
    pub token: String,
    /// Probability (0.0 to 1.0).
    pub probability: f32,
}

/// Full logit lens analysis across all layers.
///
/// Collects per-layer predictions and provides summary methods
/// for identifying convergence and first appearance of tokens.
///
/// # Example
///
/// ```
/// use candle_lens::{LogitLensAnalysis, LogitLensResult, TokenPrediction};
///
/// let mut analysis = LogitLensAnalysis::new("Dallas is in the state called".into(), 2);
/// analysis.push(LogitLensResult {
///     layer: 0,
///     predictions: vec![TokenPrediction { token_id: 262, token: " the".into(), probability: 0.2 }],
/// });
/// analysis.push(LogitLensResult {
///     layer: 1,
///     predictions: vec![TokenPrediction { token_id: 3936, token: " Texas".into(), probability: 0.6 }],
/// });
/// assert_eq!(analysis.first_appearance("Texas", 1), Some(1));
/// ```
#[derive(Debug, Serialize)]
pub struct LogitLensAnalysis {
    /// Input text that was analyzed.
    pub input_text: String,
    /// Results for each layer.
    pub layer_results: Vec<LogitLensResult>,
    /// Number of layers analyzed.
    pub n_layers: usize,
}

impl LogitLensAnalysis {
    /// Create a new analysis with capacity for `n_layers` layers.
    #[must_use]
    pub fn new(input_text: String, n_layers: usize) -> Self {
        Self {
            input_text,
            layer_results: Vec::with_capacity(n_layers),
            n_layers,
        }
    }

    /// Add a layer's result.
    pub fn push(&mut self, result: LogitLensResult) {
        self.layer_results.push(result);
    }

    /// Get the top prediction at each layer.
    ///
    /// Returns `(token_str, probability)` for the highest-probability
    /// token at each analyzed layer.
    #[must_use]
    pub fn top_predictions(&self) -> Vec<(&str, f32)> {
        self.layer_results
            .iter()
            .filter_map(|r| r.predictions.first())
            .map(|p| (p.token.as_str(), p.probability))
            .collect()
    }

    /// Find at which layer a specific token first appears in top-k.
    ///
    /// Searches predictions using `contains()` on the token string, so
    /// `"Texas"` matches GPT-2's `" Texas"`.
    #[must_use]
    pub fn first_appearance(&self, token: &str, k: usize) -> Option<usize> {
        self.layer_results
            .iter()
            .find(|result| {
                result
                    .predictions
                    .iter()
                    .take(k)
                    .any(|p| p.token.contains(token))
            })
            .map(|result| result.layer)
    }

    /// Print a summary showing the top prediction at each layer.
    pub fn print_summary(&self) {
        println!("=== Logit Lens Analysis ===");
        println!("Input: {}", self.input_text);
        println!("\nTop prediction at each layer:");
        for result in &self.layer_results {
            if let Some(top) = result.predictions.first() {
                println!(
                    "  Layer {:2}: {:>12} ({:.1}%)",
                    result.layer,
                    format!("\"{}\"", format_token(&top.token)),
                    top.probability * 100.0
                );
            }
        }
    }

    /// Print detailed predictions for each layer (top-k per layer).
    pub fn print_detailed(&self, top_k: usize) {
        println!("=== Logit Lens Detailed Analysis ===");
        println!("Input: {}", self.input_text);
        for result in &self.layer_results {
            println!("\nLayer {}:", result.layer);
            for (i, pred) in result.predictions.iter().take(top_k).enumerate() {
                println!(
                    "  {}. {:>15} ({:.2}%)",
                    i + 1,
                    format!("\"{}\"", format_token(&pred.token)),
                    pred.probability * 100.0
                );
            }
        }
    }
}

/// Decode token IDs to [`TokenPrediction`] using a decode function.
///
/// # Example
///
/// ```
/// use candle_lens::interp::logit_lens::decode_predictions_with;
///
/// let preds = decode_predictions_with(&[(42, 0.7), (99, 0.2)], |id| {
///     format!("token_{id}")
/// });
/// assert_eq!(preds.len(), 2);
/// assert_eq!(preds[0].token, "token_42");
/// ```
pub fn decode_predictions_with(
    predictions: &[(u32, f32)],
    decode_fn: impl Fn(u32) -> String,
) -> Vec<TokenPrediction> {
    predictions
        .iter()
        .map(|&(token_id, prob)| TokenPrediction {
            token_id,
            token: decode_fn(token_id),
            probability: prob,
        })
        .collect()
}

/// Format a token for display, escaping whitespace characters.
#[must_use]
pub fn format_token(token: &str) -> String {
    token
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Knobs shared by the logit lens runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LensOptions {
    /// Predictions kept per cell (clamped to the vocabulary size).
    pub top_k: usize,
    /// Apply `ln_f` before projecting.
    pub apply_final_norm: bool,
    /// Rank by softmax probability; when `false`, rank by raw logit.
    pub include_probs: bool,
}

impl Default for LensOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            apply_final_norm: false,
            include_probs: true,
        }
    }
}

/// Project `hidden` (`[.., d_model]`) to vocabulary logits.
fn lens_logits(model: &LensModel, hidden: &Tensor, apply_final_norm: bool) -> Result<Tensor> {
    let hidden = if apply_final_norm {
        model.backend().apply_final_norm(hidden)?
    } else {
        hidden.clone()
    };
    model.project_to_vocab(&hidden)
}

/// Run the model once and collect `resid_post` for every layer.
fn residuals(model: &LensModel, prompt: &str) -> Result<ResidualCache> {
    let n_layers = model.num_layers();
    let cache = model.run_with_cache(prompt, &ResidualCache::hook_spec(n_layers))?;
    ResidualCache::from_hook_cache(&cache, n_layers)
}

// ---------------------------------------------------------------------------
// Final-position lens
// ---------------------------------------------------------------------------

/// Logit lens at the final position of `prompt`, top-`top_k` per layer.
///
/// For each layer `l`: `softmax(resid_post[l][0, -1] @ W_U)`, no final norm.
///
/// # Errors
///
/// Returns [`LensError::Tokenizer`] for an empty prompt and
/// [`LensError::Model`] on tensor failures.
pub fn run_logit_lens(model: &LensModel, prompt: &str, top_k: usize) -> Result<LogitLensAnalysis> {
    run_logit_lens_with(
        model,
        prompt,
        &LensOptions {
            top_k,
            ..LensOptions::default()
        },
    )
}

/// [`run_logit_lens`] with explicit [`LensOptions`].
///
/// `include_probs` is ignored: final-position predictions always carry
/// probabilities.
///
/// # Errors
///
/// Same as [`run_logit_lens`].
pub fn run_logit_lens_with(
    model: &LensModel,
    prompt: &str,
    options: &LensOptions,
) -> Result<LogitLensAnalysis> {
    let n_layers = model.num_layers();
    let cache = residuals(model, prompt)?;
    let last = cache.seq_len()?.saturating_sub(1);
    info!(n_layers, last_position = last, "running logit lens");

    let mut analysis = LogitLensAnalysis::new(prompt.to_owned(), n_layers);
    for layer in 0..n_layers {
        let residual = cache.get_position(layer, last)?.unsqueeze(0)?;
        let logits: Vec<f32> = lens_logits(model, &residual, options.apply_final_norm)?
            .squeeze(0)?
            .to_dtype(DType::F32)?
            .to_vec1()?;
        let probs = softmax(&logits);
        let top = top_k(&probs, options.top_k);
        debug!(layer, top_token = ?top.first(), "logit lens layer");

        analysis.push(LogitLensResult {
            layer,
            predictions: decode_predictions_with(&top, |id| model.to_single_str_token(id)),
        });
    }
    Ok(analysis)
}

// ---------------------------------------------------------------------------
// All-positions lens
// ---------------------------------------------------------------------------

/// Top-k predictions at one `(layer, position)` cell.
#[derive(Debug, Clone, Serialize)]
pub struct PositionPrediction {
    /// Token position.
    pub position: usize,
    /// Input token at this position.
    pub token: String,
    /// Decoded top-k tokens.
    pub top_tokens: Vec<String>,
    /// Top-k token IDs.
    pub top_token_ids: Vec<u32>,
    /// Probabilities, present when ranked by probability.
    pub top_probs: Option<Vec<f32>>,
    /// Raw logits, present when ranked by logit.
    pub top_logits: Option<Vec<f32>>,
}

impl PositionPrediction {
    /// Score of `token` in this cell's top-k, if present.
    ///
    /// Uses the probability when available, otherwise the raw logit.
    #[must_use]
    pub fn score_of(&self, token: &str) -> Option<f32> {
        let idx = self.top_tokens.iter().position(|t| t == token)?;
        self.top_probs
            .as_ref()
            .or(self.top_logits.as_ref())
            .and_then(|scores| scores.get(idx).copied())
    }
}

/// Every position of one layer.
#[derive(Debug, Clone, Serialize)]
pub struct LayerPositions {
    /// Layer index.
    pub layer: usize,
    /// One entry per token position.
    pub positions: Vec<PositionPrediction>,
}

/// A token's score across every `(layer, position)` cell.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedToken {
    /// The tracked token string.
    pub token: String,
    /// `[n_layers × n_positions]`, zero where the token is outside top-k.
    pub grid: Grid,
}

/// Logit lens over every layer and position of a prompt.
#[derive(Debug, Clone, Serialize)]
pub struct AllPositionsLens {
    /// Prompt tokens, BOS included.
    pub tokens: Vec<String>,
    /// One entry per layer.
    pub layers: Vec<LayerPositions>,
    /// Default tracking: top tokens of the last layer's last position.
    pub token_tracking: Vec<TrackedToken>,
}

/// Logit lens at every layer and position.
///
/// When `options.include_probs` is `false`, cells are ranked by raw logit
/// and carry `top_logits` instead of `top_probs`.
///
/// # Errors
///
/// Returns [`LensError::Tokenizer`] for an empty prompt and
/// [`LensError::Model`] on tensor failures.
pub fn run_logit_lens_all_positions(
    model: &LensModel,
    prompt: &str,
    options: &LensOptions,
) -> Result<AllPositionsLens> {
    let tokens = model.to_str_tokens(prompt)?;
    let cache = residuals(model, prompt)?;
    let n_layers = cache.n_layers();
    info!(n_layers, seq_len = tokens.len(), "running logit lens at all positions");

    let mut layers = Vec::with_capacity(n_layers);
    for layer in 0..n_layers {
        let resid = cache
            .get_layer(layer)
            .ok_or_else(|| LensError::Hook(format!("layer {layer} not in cache")))?;
        // [seq, d_model] -> [seq, vocab]
        let logits: Vec<Vec<f32>> = lens_logits(model, resid, options.apply_final_norm)?
            .to_dtype(DType::F32)?
            .to_vec2()?;

        let positions = logits
            .iter()
            .zip(&tokens)
            .enumerate()
            .map(|(position, (row, token))| {
                let (top, top_probs, top_logits) = if options.include_probs {
                    let top = top_k(&softmax(row), options.top_k);
                    let scores: Vec<f32> = top.iter().map(|&(_, p)| p).collect();
                    (top, Some(scores), None)
                } else {
                    let top = top_k(row, options.top_k);
                    let scores: Vec<f32> = top.iter().map(|&(_, l)| l).collect();
                    (top, None, Some(scores))
                };
                PositionPrediction {
                    position,
                    token: token.clone(),
                    top_tokens: top.iter().map(|&(id, _)| model.to_single_str_token(id)).collect(),
                    top_token_ids: top.iter().map(|&(id, _)| id).collect(),
                    top_probs,
                    top_logits,
                }
            })
            .collect();
        debug!(layer, "logit lens layer done");
        layers.push(LayerPositions { layer, positions });
    }

    let mut lens = AllPositionsLens {
        tokens,
        layers,
        token_tracking: Vec::new(),
    };
    lens.token_tracking = track_tokens_across_layers(&lens, None);
    Ok(lens)
}

/// Score of each tracked token at every `(layer, position)` cell.
///
/// A cell holds the token's probability (or logit, when the lens was run
/// without probabilities) if the token is in that cell's top-k, and `0.0`
/// otherwise. With `tokens_to_track = None`, the top 3 tokens of the last
/// layer's last position are tracked.
#[must_use]
pub fn track_tokens_across_layers(
    lens: &AllPositionsLens,
    tokens_to_track: Option<&[String]>,
) -> Vec<TrackedToken> {
    let tracked: Vec<String> = match tokens_to_track {
        Some(tokens) => tokens.to_vec(),
        None => lens
            .layers
            .last()
            .and_then(|layer| layer.positions.last())
            .map(|cell| cell.top_tokens.iter().take(DEFAULT_TRACKED).cloned().collect())
            .unwrap_or_default(),
    };

    tracked
        .into_iter()
        .map(|token| {
            let mut grid = Grid::zeros(lens.layers.len(), lens.tokens.len());
            for (row, layer) in lens.layers.iter().enumerate() {
                for (col, cell) in layer.positions.iter().enumerate() {
                    if let Some(score) = cell.score_of(&token) {
                        grid.set(row, col, score);
                    }
                }
            }
            TrackedToken { token, grid }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn cell(position: usize, tokens: &[&str], probs: &[f32]) -> PositionPrediction {
        PositionPrediction {
            position,
            token: format!("t{position}"),
            top_tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
            top_token_ids: (0..tokens.len()).map(|i| u32::try_from(i).unwrap()).collect(),
            top_probs: Some(probs.to_vec()),
            top_logits: None,
        }
    }

    fn two_by_two() -> AllPositionsLens {
        AllPositionsLens {
            tokens: vec!["t0".into(), "t1".into()],
            layers: vec![
                LayerPositions {
                    layer: 0,
                    positions: vec![
                        cell(0, &[" the", " a"], &[0.5, 0.2]),
                        cell(1, &[" a", " Texas"], &[0.4, 0.1]),
                    ],
                },
                LayerPositions {
                    layer: 1,
                    positions: vec![
                        cell(0, &[" the", " Texas"], &[0.3, 0.3]),
                        cell(1, &[" Texas", " the"], &[0.7, 0.1]),
                    ],
                },
            ],
            token_tracking: Vec::new(),
        }
    }

    #[test]
    fn first_appearance_respects_rank_window() {
        // Layer 0 softmax ranks " Texas" second, layer 1 ranks it first.
        let vocab = [" the", " Texas", " Austin"];
        let decode = |id: u32| vocab[usize::try_from(id).unwrap()].to_owned();
        let mut analysis = LogitLensAnalysis::new("Dallas is in the state called".into(), 2);
        for (layer, logits) in [[2.0_f32, 1.0, 0.0], [0.0, 3.0, 1.0]].iter().enumerate() {
            let top = top_k(&softmax(logits), 2);
            analysis.push(LogitLensResult {
                layer,
                predictions: decode_predictions_with(&top, decode),
            });
        }

        assert_eq!(analysis.first_appearance("Texas", 1), Some(1));
        assert_eq!(analysis.first_appearance("Texas", 2), Some(0));
        assert_eq!(analysis.first_appearance("Austin", 1), None);

        let tops = analysis.top_predictions();
        assert_eq!(tops.iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec![" the", " Texas"]);
        assert!(tops.iter().all(|&(_, p)| p > 0.5));
    }

    #[test]
    fn logit_ranked_cell_serializes_null_probs() {
        let mut logit_cell = cell(1, &[" x"], &[0.9]);
        logit_cell.top_probs = None;
        logit_cell.top_logits = Some(vec![4.0]);
        let json = serde_json::to_value(&logit_cell).unwrap();
        assert!(json["top_probs"].is_null());
        assert_eq!(json["top_logits"][0], 4.0);
        assert_eq!(json["top_token_ids"][0], 0);
    }

    #[test]
    fn tracking_defaults_to_last_cell_top_tokens() {
        let lens = two_by_two();
        let tracked = track_tokens_across_layers(&lens, None);
        let names: Vec<&str> = tracked.iter().map(|t| t.token.as_str()).collect();
        assert_eq!(names, vec![" Texas", " the"]);

        let texas = &tracked.first().unwrap().grid;
        assert_eq!(texas.get(0, 0), Some(0.0));
        assert_eq!(texas.get(0, 1), Some(0.1));
        assert_eq!(texas.get(1, 0), Some(0.3));
        assert_eq!(texas.get(1, 1), Some(0.7));
    }

    #[test]
    fn tracking_explicit_tokens() {
        let lens = two_by_two();
        let tracked = track_tokens_across_layers(&lens, Some([" a".to_owned(), " zzz".to_owned()].as_slice()));
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked.first().unwrap().grid.data, vec![0.2, 0.4, 0.0, 0.0]);
        assert!(tracked.get(1).unwrap().grid.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn score_falls_back_to_logits() {
        let mut c = cell(0, &[" x"], &[0.9]);
        c.top_probs = None;
        c.top_logits = Some(vec![12.5]);
        assert_eq!(c.score_of(" x"), Some(12.5));
        assert_eq!(c.score_of(" y"), None);
    }

    #[test]
    fn default_options() {
        let opts = LensOptions::default();
        assert_eq!(opts.top_k, 5);
        assert!(!opts.apply_final_norm);
        assert!(opts.include_probs);
    }
}
