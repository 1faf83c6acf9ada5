// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-call prompt analysis bundling every probe.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::backend::LensModel;
use crate::error::Result;
use crate::interp::attribution::{
    self, Contribution, DEFAULT_TOP_CONTRIBUTORS, TokenContributions,
};
use crate::interp::logit_lens::{self, AllPositionsLens, LensOptions};
use crate::interp::patching::{self, CausalTrace, InfluenceRanking};
use crate::util::tensor::{last_position_logits, logit_at, tensor_to_vec4};

/// Optional sections of a [`PromptAnalysis`].
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// Run the all-positions logit lens with these options.
    pub logit_lens: Option<LensOptions>,
    /// Run a causal trace with these `(original, replacement)` pairs.
    pub causal_trace: Option<Vec<(String, String)>>,
    /// Run token influence.
    pub token_influence: bool,
    /// Neutral token for token influence; defaults to the first id of `" "`.
    pub neutral_token: Option<u32>,
    /// Components kept per target in `top_contributors`.
    pub top_contributors: Option<usize>,
}

/// Everything [`CircuitDiscoverer::analyse_prompt`] found about a prompt.
#[derive(Debug, Serialize)]
pub struct PromptAnalysis {
    /// The analysed prompt.
    pub prompt: String,
    /// Target token strings.
    pub target_tokens: Vec<String>,
    /// Prompt tokens, BOS included.
    pub tokens: Vec<String>,
    /// Prompt token IDs, BOS included.
    pub token_ids: Vec<u32>,
    /// Target token IDs.
    pub target_indices: Vec<u32>,
    /// Final-position logits of each target.
    pub final_logits: Vec<f32>,
    /// Final-position logits over the whole vocabulary.
    pub last_logits: Vec<f32>,
    /// `[n_layers][n_heads][seq][seq]`.
    pub attention_patterns: Vec<Vec<Vec<Vec<f32>>>>,
    /// Per-target contributions of every component.
    pub component_contributions: Vec<TokenContributions>,
    /// Per-target strongest components.
    pub top_contributors: BTreeMap<String, Vec<Contribution>>,
    /// All-positions logit lens, if requested.
    pub logit_lens: Option<AllPositionsLens>,
    /// Causal trace, if requested.
    pub causal_tracing: Option<Vec<CausalTrace>>,
    /// Token influence, if requested.
    pub token_influences: Option<Vec<InfluenceRanking>>,
}

/// Runs the full battery of probes against one model.
#[derive(Debug)]
pub struct CircuitDiscoverer<'a> {
    /// Model under analysis.
    model: &'a LensModel,
}

impl<'a> CircuitDiscoverer<'a> {
    /// Wrap a model.
    #[must_use]
    pub const fn new(model: &'a LensModel) -> Self {
        Self { model }
    }

    /// Analyse `prompt` against `targets`.
    ///
    /// Always extracts attention patterns and component contributions;
    /// the remaining sections follow `options`.
    ///
    /// # Errors
    ///
    /// Propagates tokenizer, hook and model errors from every probe run.
    pub fn analyse_prompt(
        &self,
        prompt: &str,
        targets: &[&str],
        options: &AnalysisOptions,
    ) -> Result<PromptAnalysis> {
        let model = self.model;
        let n_layers = model.num_layers();
        let token_ids = model.to_tokens(prompt)?;
        let tokens = model.to_str_tokens(prompt)?;
        let target_indices = targets
            .iter()
            .map(|t| model.to_single_token(t))
            .collect::<Result<Vec<_>>>()?;

        info!(prompt, targets = ?targets, "running model with activation caching");
        let cache = model.run_ids(&token_ids, &attribution::attribution_hooks(n_layers))?;
        let logits = last_position_logits(cache.output())?;
        let final_logits = target_indices
            .iter()
            .map(|&id| logit_at(&logits, id))
            .collect::<Result<Vec<_>>>()?;

        info!("extracting attention patterns");
        let attention_patterns =
            tensor_to_vec4(&attribution::attention_patterns(&cache, n_layers)?)?;

        info!("analysing component contributions");
        let final_pos = token_ids.len() - 1;
        let component_contributions =
            attribution::component_contributions(model, &cache, final_pos, targets)?;
        let keep = options.top_contributors.unwrap_or(DEFAULT_TOP_CONTRIBUTORS);
        let top_contributors = component_contributions
            .iter()
            .map(|c| (c.token.clone(), attribution::top_contributors(c, keep)))
            .collect();
        drop(cache);

        let logit_lens = options
            .logit_lens
            .as_ref()
            .map(|lens| logit_lens::run_logit_lens_all_positions(model, prompt, lens))
            .transpose()?;

        let causal_tracing = options
            .causal_trace
            .as_ref()
            .map(|pairs| {
                let pairs: Vec<(&str, &str)> = pairs
                    .iter()
                    .map(|(a, b)| (a.as_str(), b.as_str()))
                    .collect();
                patching::causal_trace(model, prompt, &pairs, targets)
            })
            .transpose()?;

        let token_influences = if options.token_influence {
            Some(patching::token_influence(
                model,
                prompt,
                targets,
                options.neutral_token,
            )?)
        } else {
            None
        };

        Ok(PromptAnalysis {
            prompt: prompt.to_owned(),
            target_tokens: targets.iter().map(|&t| t.to_owned()).collect(),
            tokens,
            token_ids,
            target_indices,
            final_logits,
            last_logits: logits,
            attention_patterns,
            component_contributions,
            top_contributors,
            logit_lens,
            causal_tracing,
            token_influences,
        })
    }
}
