// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trace why GPT-2 says "Texas" after "Dallas is in the state called".
//!
//! ```bash
//! cargo run --release --example trace_dallas
//! ```
//!
//! On first run, downloads GPT-2 small (~550 MB) from `HuggingFace` Hub.
//! Subsequent runs use the local cache.

use candle_lens::{
    LensModel, PatchingSetup, TraceConfig, causal_trace, cosine_similarity_grids,
    logit_difference_sweep, run_logit_lens,
};

fn main() -> candle_lens::Result<()> {
    let config = TraceConfig::default();

    // 1. Load GPT-2 small
    println!("Loading {}...", config.model_id);
    let model = LensModel::from_pretrained(&config.model_id, config.force_cpu)?;
    println!(
        "  {} layers, {} heads, {} hidden, device: {:?}",
        model.num_layers(),
        model.num_heads(),
        model.hidden_size(),
        model.device()
    );

    // 2. Logit lens: when does " Texas" show up?
    let lens = run_logit_lens(&model, &config.clean_prompt, config.top_k)?;
    lens.print_summary();
    match lens.first_appearance("Texas", config.top_k) {
        Some(layer) => println!("\n\"Texas\" enters the top-{} at layer {layer}", config.top_k),
        None => println!("\n\"Texas\" never enters the top-{}", config.top_k),
    }

    // 3. Where does the residual stream look like "Texas"?
    let concepts: Vec<&str> = config.concept_tokens.iter().map(String::as_str).collect();
    for concept in cosine_similarity_grids(&model, &config.clean_prompt, &concepts)? {
        if let Some((layer, pos)) = concept.grid.argmax() {
            println!(
                "Residual most similar to \"{}\": layer {layer}, position {pos}",
                concept.concept
            );
        }
    }

    // 4. Patch the Phoenix run into the Dallas run
    let sweep = logit_difference_sweep(&model, &PatchingSetup::from_config(&config))?;
    if let Some((hook, token, diff)) = sweep.strongest_cell() {
        println!("\nStrongest patch: {hook} at {token:?} ({diff:+.3})");
    }

    // 5. Which layer restores " Texas" in the corrupted run?
    let targets: Vec<&str> = config.target_tokens.iter().map(String::as_str).collect();
    let replacement = [(config.clean_city.as_str(), config.corrupted_city.as_str())];
    for trace in causal_trace(&model, &config.clean_prompt, &replacement, &targets)? {
        let best = trace
            .effects
            .iter()
            .max_by(|a, b| a.effect.partial_cmp(&b.effect).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(best) = best {
            println!(
                "{:?}: best recovery at layer {} ({:.2})",
                trace.token, best.layer, best.effect
            );
        }
    }

    Ok(())
}
