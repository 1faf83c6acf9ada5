// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared fixtures: a tiny randomly-initialised GPT-2 and a word-level
//! tokenizer over the Dallas/Phoenix vocabulary.

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_lens::{Activation, Gpt2, Gpt2Config, LensModel, LensTokenizer};

/// Word-level vocabulary, in id order.
pub const VOCAB: &[&str] = &[
    "<bos>", "[UNK]", "Dallas", "Phoenix", "is", "in", "the", "state", "called", "Texas",
    "Arizona", "Austin", "city", "of", "a", "_",
];

/// Prompt used throughout the integration tests.
pub const PROMPT: &str = "Dallas is in the state called";

pub const N_LAYERS: usize = 2;
pub const N_HEADS: usize = 2;
pub const HIDDEN: usize = 8;

/// Config of the tiny model.
pub fn tiny_config() -> Gpt2Config {
    Gpt2Config {
        hidden_size: HIDDEN,
        num_layers: N_LAYERS,
        num_heads: N_HEADS,
        head_dim: HIDDEN / N_HEADS,
        intermediate_size: 4 * HIDDEN,
        vocab_size: VOCAB.len(),
        max_position_embeddings: 16,
        layer_norm_eps: 1e-5,
        activation: Activation::GeluApprox,
        bos_token_id: Some(0),
    }
}

/// Word-level tokenizer over [`VOCAB`], BOS id 0.
pub fn tiny_tokenizer() -> LensTokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(id, word)| ((*word).to_owned(), serde_json::Value::from(id)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "[UNK]"
        }
    });
    LensTokenizer::from_json(&json.to_string(), Some(0)).unwrap()
}

fn randn(shape: &[usize], std: f32, device: &Device) -> Tensor {
    Tensor::randn(0_f32, std, shape, device).unwrap()
}

/// Random GPT-2 weights in the `openai-community/gpt2` layout.
///
/// The attention output bias is zero, so the per-head results sum exactly
/// to the attention output.
pub fn tiny_weights(config: &Gpt2Config, device: &Device) -> HashMap<String, Tensor> {
    let d = config.hidden_size;
    let ff = config.intermediate_size;
    let mut w = HashMap::new();

    w.insert("wte.weight".into(), randn(&[config.vocab_size, d], 0.5, device));
    w.insert(
        "wpe.weight".into(),
        randn(&[config.max_position_embeddings, d], 0.1, device),
    );

    let layer_norm = |w: &mut HashMap<String, Tensor>, prefix: &str| {
        w.insert(format!("{prefix}.weight"), Tensor::ones(d, DType::F32, device).unwrap());
        w.insert(format!("{prefix}.bias"), randn(&[d], 0.05, device));
    };

    for i in 0..config.num_layers {
        let p = format!("h.{i}");
        layer_norm(&mut w, &format!("{p}.ln_1"));
        layer_norm(&mut w, &format!("{p}.ln_2"));
        w.insert(format!("{p}.attn.c_attn.weight"), randn(&[d, 3 * d], 0.3, device));
        w.insert(format!("{p}.attn.c_attn.bias"), randn(&[3 * d], 0.05, device));
        w.insert(format!("{p}.attn.c_proj.weight"), randn(&[d, d], 0.3, device));
        w.insert(
            format!("{p}.attn.c_proj.bias"),
            Tensor::zeros(d, DType::F32, device).unwrap(),
        );
        w.insert(format!("{p}.mlp.c_fc.weight"), randn(&[d, ff], 0.3, device));
        w.insert(format!("{p}.mlp.c_fc.bias"), randn(&[ff], 0.05, device));
        w.insert(format!("{p}.mlp.c_proj.weight"), randn(&[ff, d], 0.3, device));
        w.insert(format!("{p}.mlp.c_proj.bias"), randn(&[d], 0.05, device));
    }
    layer_norm(&mut w, "ln_f");
    w
}

/// The tiny backend on its own.
pub fn tiny_gpt2(weights: HashMap<String, Tensor>) -> Gpt2 {
    let device = Device::Cpu;
    let vb = candle_nn::VarBuilder::from_tensors(weights, DType::F32, &device);
    Gpt2::load(tiny_config(), vb).unwrap()
}

/// Tiny GPT-2 plus tokenizer, on CPU.
pub fn tiny_model() -> LensModel {
    let device = Device::Cpu;
    let weights = tiny_weights(&tiny_config(), &device);
    LensModel::new(Box::new(tiny_gpt2(weights)), tiny_tokenizer(), device)
}

/// Assert two floats agree to `tol`.
pub fn assert_close(a: f32, b: f32, tol: f32) {
    assert!((a - b).abs() <= tol, "{a} != {b} (tol {tol})");
}
