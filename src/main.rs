// SPDX-License-Identifier: MIT OR Apache-2.0

//! candle-lens CLI: interpretability probes for GPT-2.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use candle_lens::interp::logit_lens::format_token;
use candle_lens::{
    AnalysisOptions, CircuitDiscoverer, LensModel, LensOptions, PatchingSetup, TraceConfig,
    attribution_hooks, causal_trace, component_contributions, cosine_similarity_grids,
    logit_difference_sweep, run_logit_lens_all_positions, run_logit_lens_with, token_influence,
    top_contributors,
};

#[derive(Parser)]
#[command(name = "candle-lens")]
#[command(about = "Logit lens, activation patching and attribution for GPT-2")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` or a local directory (overrides the config file)
    #[arg(short, long)]
    model: Option<String>,

    /// Experiment config (JSON); defaults to the Dallas/Texas example
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the probe result as JSON to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Logit lens at the final position of the prompt
    Lens {
        /// Prompt (defaults to the config's clean prompt)
        prompt: Option<String>,
        /// Apply the final layer norm before projecting
        #[arg(long)]
        final_norm: bool,
    },
    /// Logit lens at every layer and position
    LensAll {
        /// Prompt (defaults to the config's clean prompt)
        prompt: Option<String>,
        /// Rank by raw logit instead of probability
        #[arg(long)]
        logits: bool,
        /// Apply the final layer norm before projecting
        #[arg(long)]
        final_norm: bool,
    },
    /// Logit-difference sweep over (layer, position)
    Patch,
    /// Causal trace of the target tokens across layers
    Trace,
    /// Token influence of each input position on the target tokens
    Influence,
    /// Cosine similarity of the residual stream with concept embeddings
    Similarity,
    /// Per-head and per-MLP contributions to the target logits
    Attribute {
        /// Components shown per target
        #[arg(short = 'n', long, default_value_t = 10)]
        top: usize,
    },
    /// Every probe at once
    Analyse,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => TraceConfig::from_file(path)?,
        None => TraceConfig::default(),
    };
    if let Some(model) = &cli.model {
        config.model_id.clone_from(model);
    }
    config.force_cpu |= cli.cpu;

    println!("=== candle-lens ===");
    println!("Model:  {}", config.model_id);
    if config.force_cpu {
        println!("Mode:   CPU (forced)");
    }

    let model = LensModel::from_pretrained(&config.model_id, config.force_cpu)
        .with_context(|| format!("loading {}", config.model_id))?;
    info!(
        "Model: {} layers, {} heads, {} hidden",
        model.num_layers(),
        model.num_heads(),
        model.hidden_size()
    );

    let targets: Vec<&str> = config.target_tokens.iter().map(String::as_str).collect();
    let replacement = [(config.clean_city.as_str(), config.corrupted_city.as_str())];
    let output = cli.output.as_deref();

    match cli.command {
        Command::Lens { prompt, final_norm } => {
            let prompt = prompt.unwrap_or_else(|| config.clean_prompt.clone());
            let options = LensOptions {
                top_k: config.top_k,
                apply_final_norm: final_norm,
                ..LensOptions::default()
            };
            let analysis = run_logit_lens_with(&model, &prompt, &options)?;
            analysis.print_detailed(config.top_k);
            write_json(output, &analysis)?;
        }
        Command::LensAll {
            prompt,
            logits,
            final_norm,
        } => {
            let prompt = prompt.unwrap_or_else(|| config.clean_prompt.clone());
            let options = LensOptions {
                top_k: config.top_k,
                apply_final_norm: final_norm,
                include_probs: !logits,
            };
            let lens = run_logit_lens_all_positions(&model, &prompt, &options)?;
            for layer in &lens.layers {
                let tops: Vec<String> = layer
                    .positions
                    .iter()
                    .map(|p| {
                        let top = p.top_tokens.first().map_or("", String::as_str);
                        format!("{:>10}", format!("\"{}\"", format_token(top)))
                    })
                    .collect();
                println!("Layer {:2}: {}", layer.layer, tops.join(" "));
            }
            for tracked in &lens.token_tracking {
                println!(
                    "Tracked \"{}\": max {:.3}",
                    format_token(&tracked.token),
                    tracked.grid.max_abs()
                );
            }
            write_json(output, &lens)?;
        }
        Command::Patch => {
            let setup = PatchingSetup::from_config(&config);
            let sweep = logit_difference_sweep(&model, &setup)?;
            println!(
                "\n=== Logit difference (\"{}\" - \"{}\") ===",
                setup.corrupt_answer_token, setup.answer_token
            );
            let header: Vec<String> = sweep
                .tokens
                .iter()
                .map(|t| format!("{:>10}", format_token(t)))
                .collect();
            println!("{:>28} {}", "", header.join(" "));
            for (row, label) in sweep.row_labels.iter().enumerate() {
                let cells: Vec<String> = sweep
                    .grid
                    .row(row)
                    .unwrap_or_default()
                    .iter()
                    .map(|v| format!("{v:>10.3}"))
                    .collect();
                println!("{label:>28} {}", cells.join(" "));
            }
            if let Some((label, token, value)) = sweep.strongest_cell() {
                println!("\nStrongest: {label} at \"{}\" ({value:.3})", format_token(token));
            }
            write_json(output, &sweep)?;
        }
        Command::Trace => {
            let traces = causal_trace(&model, &config.clean_prompt, &replacement, &targets)?;
            for trace in &traces {
                println!(
                    "\n\"{}\": clean {:.3}, corrupt {:.3}",
                    format_token(&trace.token),
                    trace.clean_logit,
                    trace.corrupt_logit
                );
                for effect in &trace.effects {
                    println!("  Layer {:2}: {:.3}", effect.layer, effect.effect);
                }
            }
            write_json(output, &traces)?;
        }
        Command::Influence => {
            let rankings = token_influence(&model, &config.clean_prompt, &targets, None)?;
            for ranking in &rankings {
                println!("\n\"{}\":", format_token(&ranking.token));
                for inf in &ranking.influences {
                    println!(
                        "  {:2} {:>12} {:+.3}",
                        inf.position,
                        format!("\"{}\"", format_token(&inf.token)),
                        inf.influence
                    );
                }
            }
            write_json(output, &rankings)?;
        }
        Command::Similarity => {
            let concepts: Vec<&str> = config.concept_tokens.iter().map(String::as_str).collect();
            let grids = cosine_similarity_grids(&model, &config.clean_prompt, &concepts)?;
            for concept in &grids {
                println!("\n=== Cosine similarity with \"{}\" ===", concept.concept);
                for layer in 0..concept.grid.rows {
                    let cells: Vec<String> = concept
                        .grid
                        .row(layer)
                        .unwrap_or_default()
                        .iter()
                        .map(|v| format!("{v:>7.3}"))
                        .collect();
                    println!("  Layer {layer:2}: {}", cells.join(" "));
                }
            }
            write_json(output, &grids)?;
        }
        Command::Attribute { top } => {
            let ids = model.to_tokens(&config.clean_prompt)?;
            let cache = model.run_ids(&ids, &attribution_hooks(model.num_layers()))?;
            let contributions =
                component_contributions(&model, &cache, ids.len() - 1, &targets)?;
            for c in &contributions {
                println!("\nTop contributors to \"{}\":", format_token(&c.token));
                for contribution in top_contributors(c, top) {
                    println!(
                        "  {:>8} {:+.3}",
                        contribution.component.to_string(),
                        contribution.value
                    );
                }
            }
            write_json(output, &contributions)?;
        }
        Command::Analyse => {
            let options = AnalysisOptions {
                logit_lens: Some(LensOptions {
                    top_k: config.top_k,
                    ..LensOptions::default()
                }),
                causal_trace: Some(vec![(
                    config.clean_city.clone(),
                    config.corrupted_city.clone(),
                )]),
                token_influence: true,
                neutral_token: None,
                top_contributors: None,
            };
            let analysis = CircuitDiscoverer::new(&model).analyse_prompt(
                &config.clean_prompt,
                &targets,
                &options,
            )?;
            for (token, contributors) in &analysis.top_contributors {
                let names: Vec<String> =
                    contributors.iter().map(|c| c.component.to_string()).collect();
                println!("\"{}\": {}", format_token(token), names.join(", "));
            }
            write_json(output, &analysis)?;
        }
    }

    Ok(())
}

/// Serialize `value` to `path` when an output file was requested.
fn write_json<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Results saved to {}", path.display());
    Ok(())
}
