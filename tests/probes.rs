// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: every probe against a tiny random GPT-2.
//!
//! The model weights are random, so these tests check structural
//! properties that hold for any weights: shapes, residual-stream
//! decomposition, and the fixed points of activation patching.
//!
//! Run with:
//!   `cargo test --test probes`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::as_conversions,
    missing_docs
)]

mod common;

use candle_core::{D, DType, Tensor};
use candle_lens::util::tensor::{last_position_logits, position_logits, top_k};
use candle_lens::{
    AnalysisOptions, CircuitDiscoverer, Component, HookPoint, HookSpec, Intervention, LensBackend,
    LensError, LensOptions, PatchingSetup, attention_patterns, attribution_hooks, causal_trace,
    component_contributions, cosine_similarity_grids, logit_difference_sweep,
    run_logit_lens_all_positions, run_logit_lens_with, token_influence, top_contributors,
};
use common::{HIDDEN, N_HEADS, N_LAYERS, PROMPT, assert_close, tiny_model};

/// `<bos> Dallas is in the state called`
const SEQ: usize = 7;

/// Token id of `"_"` in the fixture vocabulary.
const NEUTRAL: u32 = 15;

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

fn final_logit_diff(model: &candle_lens::LensModel, prompt: &str, plus: u32, minus: u32) -> f32 {
    let ids = model.to_tokens(prompt).unwrap();
    let cache = model.run_ids(&ids, &HookSpec::new()).unwrap();
    let logits = last_position_logits(cache.output()).unwrap();
    logits[plus as usize] - logits[minus as usize]
}

// ---------------------------------------------------------------------------
// Forward pass and hooks
// ---------------------------------------------------------------------------

#[test]
fn tokens_prepend_bos() {
    let model = tiny_model();
    let ids = model.to_tokens(PROMPT).unwrap();
    assert_eq!(ids, vec![0, 2, 4, 5, 6, 7, 8]);
    let tokens = model.to_str_tokens(PROMPT).unwrap();
    assert_eq!(tokens.first().map(String::as_str), Some("<bos>"));
    assert_eq!(tokens.len(), SEQ);
}

#[test]
fn hook_shapes() {
    let model = tiny_model();
    let mut hooks = HookSpec::new();
    hooks
        .capture(HookPoint::Embed)
        .capture(HookPoint::PosEmbed)
        .capture(HookPoint::ResidPre(0))
        .capture(HookPoint::AttnPattern(0))
        .capture(HookPoint::AttnResult(0))
        .capture(HookPoint::AttnOut(0))
        .capture(HookPoint::ResidMid(0))
        .capture(HookPoint::MlpPost(0))
        .capture(HookPoint::MlpOut(0))
        .capture(HookPoint::ResidPost(N_LAYERS - 1))
        .capture(HookPoint::FinalNorm);
    let cache = model.run_with_cache(PROMPT, &hooks).unwrap();

    let dims = |hook: HookPoint| cache.require(&hook).unwrap().dims().to_vec();
    assert_eq!(dims(HookPoint::Embed), vec![1, SEQ, HIDDEN]);
    assert_eq!(dims(HookPoint::PosEmbed), vec![1, SEQ, HIDDEN]);
    assert_eq!(dims(HookPoint::ResidPre(0)), vec![1, SEQ, HIDDEN]);
    assert_eq!(dims(HookPoint::AttnPattern(0)), vec![1, N_HEADS, SEQ, SEQ]);
    assert_eq!(dims(HookPoint::AttnResult(0)), vec![1, SEQ, N_HEADS, HIDDEN]);
    assert_eq!(dims(HookPoint::AttnOut(0)), vec![1, SEQ, HIDDEN]);
    assert_eq!(dims(HookPoint::ResidMid(0)), vec![1, SEQ, HIDDEN]);
    assert_eq!(dims(HookPoint::MlpPost(0)), vec![1, SEQ, 4 * HIDDEN]);
    assert_eq!(dims(HookPoint::MlpOut(0)), vec![1, SEQ, HIDDEN]);
    assert_eq!(dims(HookPoint::ResidPost(N_LAYERS - 1)), vec![1, SEQ, HIDDEN]);
    assert_eq!(dims(HookPoint::FinalNorm), vec![1, SEQ, HIDDEN]);
    assert_eq!(cache.output().dims(), &[1, SEQ, common::VOCAB.len()]);
    assert!(cache.get(&HookPoint::ResidPost(0)).is_none());
}

#[test]
fn residual_stream_decomposes() {
    let model = tiny_model();
    let mut hooks = HookSpec::new();
    for layer in 0..N_LAYERS {
        hooks
            .capture(HookPoint::ResidPre(layer))
            .capture(HookPoint::AttnOut(layer))
            .capture(HookPoint::AttnResult(layer))
            .capture(HookPoint::ResidMid(layer))
            .capture(HookPoint::MlpOut(layer))
            .capture(HookPoint::ResidPost(layer));
    }
    hooks.capture(HookPoint::Embed).capture(HookPoint::PosEmbed);
    let cache = model.run_with_cache(PROMPT, &hooks).unwrap();
    let get = |hook: HookPoint| cache.require(&hook).unwrap().clone();

    let embed_sum = (get(HookPoint::Embed) + get(HookPoint::PosEmbed)).unwrap();
    assert!(max_abs_diff(&embed_sum, &get(HookPoint::ResidPre(0))) < 1e-5);

    for layer in 0..N_LAYERS {
        let mid = (get(HookPoint::ResidPre(layer)) + get(HookPoint::AttnOut(layer))).unwrap();
        assert!(max_abs_diff(&mid, &get(HookPoint::ResidMid(layer))) < 1e-5);

        let post = (get(HookPoint::ResidMid(layer)) + get(HookPoint::MlpOut(layer))).unwrap();
        assert!(max_abs_diff(&post, &get(HookPoint::ResidPost(layer))) < 1e-5);

        // The fixture has a zero attention output bias.
        let heads = get(HookPoint::AttnResult(layer)).sum(2).unwrap();
        assert!(max_abs_diff(&heads, &get(HookPoint::AttnOut(layer))) < 1e-4);
    }
}

#[test]
fn zeroed_final_residual_gives_position_independent_logits() {
    let model = tiny_model();
    let mut hooks = HookSpec::new();
    hooks.intervene(HookPoint::ResidPost(N_LAYERS - 1), Intervention::Zero);
    let logits = model.run_with_hooks(PROMPT, &hooks).unwrap();

    let first = position_logits(&logits, 0).unwrap();
    let last = position_logits(&logits, SEQ - 1).unwrap();
    for (a, b) in first.iter().zip(&last) {
        assert_close(*a, *b, 1e-5);
    }
}

#[test]
fn patch_position_out_of_range() {
    let model = tiny_model();
    let mut hooks = HookSpec::new();
    hooks.intervene(
        HookPoint::ResidPost(0),
        Intervention::PatchPosition {
            position: SEQ,
            value: Tensor::zeros(HIDDEN, DType::F32, model.device()).unwrap(),
        },
    );
    let result = model.run_with_hooks(PROMPT, &hooks);
    assert!(matches!(result, Err(LensError::Hook(_))));
}

#[test]
fn replace_with_zeros_matches_zero() {
    let model = tiny_model();
    let hook = HookPoint::ResidPost(N_LAYERS - 1);

    let mut zeroed = HookSpec::new();
    zeroed.intervene(hook.clone(), Intervention::Zero);
    let mut replaced = HookSpec::new();
    let zeros = Tensor::zeros((1, SEQ, HIDDEN), DType::F32, model.device()).unwrap();
    replaced.intervene(hook, Intervention::Replace(zeros));

    let a = model.run_with_hooks(PROMPT, &zeroed).unwrap();
    let b = model.run_with_hooks(PROMPT, &replaced).unwrap();
    assert!(max_abs_diff(&a, &b) < 1e-6);
}

#[test]
fn add_at_embed_shifts_resid_pre() {
    let model = tiny_model();
    let mut baseline_hooks = HookSpec::new();
    baseline_hooks.capture(HookPoint::ResidPre(0));
    let baseline = model.run_with_cache(PROMPT, &baseline_hooks).unwrap();

    let delta_values: Vec<f32> = std::iter::successors(Some(0.25_f32), |v| Some(v + 0.25))
        .take(HIDDEN)
        .collect();
    let delta = Tensor::new(delta_values.as_slice(), model.device()).unwrap();
    let mut shifted_hooks = HookSpec::new();
    shifted_hooks
        .capture(HookPoint::ResidPre(0))
        .intervene(HookPoint::Embed, Intervention::Add(delta.clone()));
    let shifted = model.run_with_cache(PROMPT, &shifted_hooks).unwrap();

    let expected = baseline
        .require(&HookPoint::ResidPre(0))
        .unwrap()
        .broadcast_add(&delta)
        .unwrap();
    let actual = shifted.require(&HookPoint::ResidPre(0)).unwrap();
    assert!(max_abs_diff(&expected, actual) < 1e-5);
    assert!(max_abs_diff(baseline.output(), shifted.output()) > 1e-4);
}

#[test]
fn zeroed_attention_pattern_changes_logits() {
    let model = tiny_model();
    let clean = model.run_with_hooks(PROMPT, &HookSpec::new()).unwrap();

    let mut hooks = HookSpec::new();
    hooks
        .capture(HookPoint::AttnOut(0))
        .intervene(HookPoint::AttnPattern(0), Intervention::Zero);
    let cache = model.run_with_cache(PROMPT, &hooks).unwrap();
    assert!(max_abs_diff(&clean, cache.output()) > 1e-6);

    // A zero pattern mixes no values, so only the zero c_proj bias survives.
    let attn_out = cache.require(&HookPoint::AttnOut(0)).unwrap();
    assert!(max_abs_diff(attn_out, &attn_out.zeros_like().unwrap()) < 1e-6);
}

#[test]
fn unapplied_interventions_are_rejected() {
    let model = tiny_model();
    for hook in [
        HookPoint::from("blocks.0.attn.hook_z"),
        HookPoint::AttnResult(0),
        HookPoint::ResidPost(N_LAYERS),
    ] {
        let mut hooks = HookSpec::new();
        hooks.intervene(hook.clone(), Intervention::Zero);
        let result = model.run_with_hooks(PROMPT, &hooks);
        assert!(matches!(result, Err(LensError::Hook(_))), "{hook}: {result:?}");
    }

    // Capture-only use of the same points still works.
    let mut hooks = HookSpec::new();
    hooks.capture(HookPoint::AttnResult(0)).capture("blocks.0.attn.hook_z");
    assert!(model.run_with_cache(PROMPT, &hooks).is_ok());
}

#[test]
fn tokenizer_errors() {
    let model = tiny_model();
    assert!(matches!(model.to_tokens(""), Err(LensError::Tokenizer(_))));
    assert!(matches!(
        model.to_single_token("New York"),
        Err(LensError::Tokenizer(_))
    ));
    assert_eq!(model.to_single_token("Texas").unwrap(), 9);
}

// ---------------------------------------------------------------------------
// Logit lens
// ---------------------------------------------------------------------------

#[test]
fn lens_final_layer_with_norm_matches_model() {
    let model = tiny_model();
    let options = LensOptions {
        top_k: 3,
        apply_final_norm: true,
        ..LensOptions::default()
    };
    let lens = run_logit_lens_with(&model, PROMPT, &options).unwrap();
    assert_eq!(lens.layer_results.len(), N_LAYERS);

    let logits = model.run_with_hooks(PROMPT, &HookSpec::new()).unwrap();
    let expected = top_k(&last_position_logits(&logits).unwrap(), 1);
    let last = lens.layer_results.last().unwrap();
    assert_eq!(last.predictions.len(), 3);
    assert_eq!(last.predictions[0].token_id, expected[0].0);

    let probs: Vec<f32> = last.predictions.iter().map(|p| p.probability).collect();
    assert!(probs.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn lens_all_positions_shapes() {
    let model = tiny_model();
    let lens = run_logit_lens_all_positions(&model, PROMPT, &LensOptions::default()).unwrap();
    assert_eq!(lens.tokens.len(), SEQ);
    assert_eq!(lens.layers.len(), N_LAYERS);
    for layer in &lens.layers {
        assert_eq!(layer.positions.len(), SEQ);
        for cell in &layer.positions {
            assert_eq!(cell.top_tokens.len(), 5);
            assert_eq!(cell.top_token_ids.len(), 5);
            assert!(cell.top_probs.is_some());
            assert!(cell.top_logits.is_none());
        }
    }

    // Default tracking: top 3 of the last layer's last position.
    assert_eq!(lens.token_tracking.len(), 3);
    let last_cell = lens.layers.last().unwrap().positions.last().unwrap();
    for (tracked, expected) in lens.token_tracking.iter().zip(&last_cell.top_tokens) {
        assert_eq!(&tracked.token, expected);
        assert_eq!((tracked.grid.rows, tracked.grid.cols), (N_LAYERS, SEQ));
        let score = tracked.grid.get(N_LAYERS - 1, SEQ - 1).unwrap();
        assert_eq!(Some(score), last_cell.score_of(expected));
    }
}

#[test]
fn lens_all_positions_by_logit() {
    let model = tiny_model();
    let options = LensOptions {
        top_k: 2,
        include_probs: false,
        ..LensOptions::default()
    };
    let lens = run_logit_lens_all_positions(&model, PROMPT, &options).unwrap();
    let cell = &lens.layers[0].positions[0];
    assert!(cell.top_probs.is_none());
    let logits = cell.top_logits.as_ref().unwrap();
    assert_eq!(logits.len(), 2);
    assert!(logits[0] >= logits[1]);
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

#[test]
fn similarity_grids_are_bounded() {
    let model = tiny_model();
    let grids = cosine_similarity_grids(&model, PROMPT, &["Texas", "Austin"]).unwrap();
    assert_eq!(grids.len(), 2);
    assert_eq!(grids[0].concept, "Texas");
    assert_eq!(grids[1].token_id, 11);
    for concept in &grids {
        assert_eq!((concept.grid.rows, concept.grid.cols), (N_LAYERS, SEQ));
        assert!(concept.grid.data.iter().all(|v| (-1.0001..=1.0001).contains(v)));
    }
}

#[test]
fn similarity_rejects_multi_token_concept() {
    let model = tiny_model();
    let result = cosine_similarity_grids(&model, PROMPT, &["New York"]);
    assert!(matches!(result, Err(LensError::Tokenizer(_))));
}

// ---------------------------------------------------------------------------
// Patching
// ---------------------------------------------------------------------------

#[test]
fn sweep_fixed_points() {
    let model = tiny_model();
    let setup = PatchingSetup::from_replacements(PROMPT, &[("Dallas", "Phoenix")], "Austin", "Phoenix");
    assert_eq!(setup.corrupted_prompt, "Phoenix is in the state called");
    let sweep = logit_difference_sweep(&model, &setup).unwrap();

    assert_eq!((sweep.grid.rows, sweep.grid.cols), (N_LAYERS + 1, SEQ));
    assert_eq!(sweep.row_labels[0], "blocks.0.hook_resid_pre");
    assert_eq!(sweep.row_labels[N_LAYERS], format!("blocks.{}.hook_resid_post", N_LAYERS - 1));
    assert_eq!(sweep.tokens.len(), SEQ);

    let answer = model.to_single_token("Austin").unwrap();
    let corrupt_answer = model.to_single_token("Phoenix").unwrap();
    let clean_diff = final_logit_diff(&model, &setup.clean_prompt, corrupt_answer, answer);
    let corrupt_diff = final_logit_diff(&model, &setup.corrupted_prompt, corrupt_answer, answer);

    // BOS sees nothing after it, so its activations match in both runs.
    for row in 0..=N_LAYERS {
        assert_close(sweep.grid.get(row, 0).unwrap(), clean_diff, 1e-4);
    }
    // The last block's output at the final position fixes the logits.
    assert_close(sweep.grid.get(N_LAYERS, SEQ - 1).unwrap(), corrupt_diff, 1e-4);
    assert!(sweep.strongest_cell().is_some());
}

#[test]
fn sweep_rejects_misaligned_prompts() {
    let model = tiny_model();
    let setup = PatchingSetup::from_replacements(PROMPT, &[("Dallas", "New York")], "Austin", "Phoenix");
    let result = logit_difference_sweep(&model, &setup);
    assert!(matches!(result, Err(LensError::Patching(_))));
}

#[test]
fn causal_trace_recovers_at_last_layer() {
    let model = tiny_model();
    let traces = causal_trace(&model, PROMPT, &[("Dallas", "Phoenix")], &["Texas", "Arizona"]).unwrap();
    assert_eq!(traces.len(), 2);

    let ids = model.to_tokens(PROMPT).unwrap();
    let clean = last_position_logits(model.run_ids(&ids, &HookSpec::new()).unwrap().output()).unwrap();
    for trace in &traces {
        assert_eq!(trace.effects.len(), N_LAYERS);
        assert_eq!(
            trace.effects.iter().map(|e| e.layer).collect::<Vec<_>>(),
            (0..N_LAYERS).collect::<Vec<_>>()
        );
        assert_close(trace.clean_logit, clean[trace.token_id as usize], 1e-5);
        let last = trace.effects.last().unwrap().effect;
        assert_close(last, 1.0, 1e-2);
    }
}

#[test]
fn token_influence_ranks_every_position_but_last() {
    let model = tiny_model();
    let rankings = token_influence(&model, PROMPT, &["Texas"], Some(NEUTRAL)).unwrap();
    assert_eq!(rankings.len(), 1);
    let ranking = &rankings[0];
    assert_eq!(ranking.token_id, 9);
    assert_eq!(ranking.influences.len(), SEQ - 1);

    let mut positions: Vec<usize> = ranking.influences.iter().map(|i| i.position).collect();
    positions.sort_unstable();
    assert_eq!(positions, (0..SEQ - 1).collect::<Vec<_>>());
    assert!(
        ranking
            .influences
            .windows(2)
            .all(|w| w[0].influence.abs() >= w[1].influence.abs())
    );
}

#[test]
fn token_influence_needs_a_neutral_token() {
    let model = tiny_model();
    // The whitespace pre-tokenizer drops " " entirely.
    let result = token_influence(&model, PROMPT, &["Texas"], None);
    assert!(matches!(result, Err(LensError::Tokenizer(_))));
}

// ---------------------------------------------------------------------------
// Attribution and analysis
// ---------------------------------------------------------------------------

#[test]
fn component_contributions_layout() {
    let model = tiny_model();
    let ids = model.to_tokens(PROMPT).unwrap();
    let cache = model.run_ids(&ids, &attribution_hooks(N_LAYERS)).unwrap();
    let contributions = component_contributions(&model, &cache, SEQ - 1, &["Texas", "Austin"]).unwrap();
    assert_eq!(contributions.len(), 2);

    let texas = &contributions[0];
    assert_eq!(texas.components.len(), N_LAYERS * (N_HEADS + 1));
    assert_eq!(texas.components[0].component, Component::Head { layer: 0, head: 0 });
    assert_eq!(texas.components[N_HEADS].component, Component::Mlp { layer: 0 });

    // Direct attribution of the last MLP: MlpOut[0, -1] . W_U[:, Texas]
    let mlp_out = cache
        .require(&HookPoint::MlpOut(N_LAYERS - 1))
        .unwrap()
        .get(0)
        .unwrap()
        .get(SEQ - 1)
        .unwrap();
    let w_u = model.backend().unembedding_vector(texas.token_id).unwrap();
    let expected = (mlp_out * w_u).unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
    let name = format!("L{}MLP", N_LAYERS - 1);
    assert_close(texas.get(&name).unwrap(), expected, 1e-4);

    let top = top_contributors(texas, 3);
    assert_eq!(top.len(), 3);
    assert!(top.windows(2).all(|w| w[0].value.abs() >= w[1].value.abs()));
}

#[test]
fn attention_patterns_are_causal_distributions() {
    let model = tiny_model();
    let ids = model.to_tokens(PROMPT).unwrap();
    let cache = model.run_ids(&ids, &attribution_hooks(N_LAYERS)).unwrap();
    let patterns = attention_patterns(&cache, N_LAYERS).unwrap();
    assert_eq!(patterns.dims(), &[N_LAYERS, N_HEADS, SEQ, SEQ]);

    let row_sums: Vec<f32> = patterns.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    for sum in row_sums {
        assert_close(sum, 1.0, 1e-4);
    }
    // Query 0 attends only to itself.
    let first_row: Vec<f32> = patterns.get(0).unwrap().get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
    assert!(first_row[1..].iter().all(|&p| p == 0.0));
}

#[test]
fn analyse_prompt_all_sections() {
    let model = tiny_model();
    let options = AnalysisOptions {
        logit_lens: Some(LensOptions::default()),
        causal_trace: Some(vec![("Dallas".into(), "Phoenix".into())]),
        token_influence: true,
        neutral_token: Some(NEUTRAL),
        top_contributors: Some(3),
    };
    let analysis = CircuitDiscoverer::new(&model)
        .analyse_prompt(PROMPT, &["Texas", "Arizona"], &options)
        .unwrap();

    assert_eq!(analysis.token_ids.len(), SEQ);
    assert_eq!(analysis.target_indices, vec![9, 10]);
    assert_eq!(analysis.final_logits.len(), 2);
    assert_eq!(analysis.last_logits.len(), common::VOCAB.len());
    assert_close(analysis.final_logits[0], analysis.last_logits[9], 0.0);
    assert_close(analysis.final_logits[1], analysis.last_logits[10], 0.0);
    assert_eq!(analysis.attention_patterns.len(), N_LAYERS);
    assert_eq!(analysis.attention_patterns[0].len(), N_HEADS);
    assert_eq!(analysis.attention_patterns[0][0].len(), SEQ);
    assert_eq!(analysis.attention_patterns[0][0][0].len(), SEQ);
    assert_eq!(analysis.component_contributions.len(), 2);
    assert_eq!(analysis.top_contributors["Texas"].len(), 3);
    assert_eq!(analysis.logit_lens.as_ref().unwrap().layers.len(), N_LAYERS);
    assert_eq!(analysis.causal_tracing.as_ref().unwrap().len(), 2);
    assert_eq!(analysis.token_influences.as_ref().unwrap().len(), 2);

    let json = serde_json::to_value(&analysis).unwrap();
    assert_eq!(json["prompt"], PROMPT);
    assert!(json["component_contributions"][0]["components"].is_array());
}

#[test]
fn analyse_prompt_minimal() {
    let model = tiny_model();
    let analysis = CircuitDiscoverer::new(&model)
        .analyse_prompt(PROMPT, &["Texas"], &AnalysisOptions::default())
        .unwrap();
    assert!(analysis.logit_lens.is_none());
    assert!(analysis.causal_tracing.is_none());
    assert!(analysis.token_influences.is_none());
    // All components fit under the default cap of 10.
    assert_eq!(analysis.top_contributors["Texas"].len(), N_LAYERS * (N_HEADS + 1));
}
