// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-lens
//!
//! Interpretability probes for GPT-2 in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! candle-lens runs a pretrained GPT-2 checkpoint through a forward pass
//! with built-in hook points (following the `TransformerLens` naming), and
//! asks it why it predicts what it predicts:
//!
//! - **Logit lens** ([`interp::logit_lens`]): decode the residual stream
//!   after every block through the unembedding matrix.
//! - **Activation patching** ([`interp::patching`]): transplant one
//!   activation between a clean and a corrupted run and watch a logit move.
//! - **Concept similarity** ([`interp::similarity`]): cosine similarity of
//!   the residual stream against token embeddings.
//! - **Component attribution** ([`interp::attribution`]): direct
//!   contribution of each head and MLP to a target logit.
//!
//! ## Quick start
//!
//! ```no_run
//! use candle_lens::{LensModel, run_logit_lens};
//!
//! # fn main() -> candle_lens::Result<()> {
//! let model = LensModel::from_pretrained("openai-community/gpt2", false)?;
//! let lens = run_logit_lens(&model, "Dallas is in the state called", 5)?;
//! lens.print_summary();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod gpt2;
pub mod hooks;
pub mod interp;
pub mod tokenizer;
pub mod util;

// --- Public re-exports ---------------------------------------------------

// Backend
pub use backend::{LensBackend, LensModel};
pub use gpt2::Gpt2;

// Config
pub use config::{Activation, Gpt2Config, TraceConfig};

// Cache
pub use cache::ResidualCache;

// Download
pub use download::{ModelFiles, resolve_model_files};

// Error
pub use error::{LensError, Result};

// Hooks
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention};

// Tokenizer
pub use tokenizer::LensTokenizer;

// Interpretability
pub use interp::analysis::{AnalysisOptions, CircuitDiscoverer, PromptAnalysis};
pub use interp::attribution::{
    Component, Contribution, TokenContributions, attention_patterns, attribution_hooks,
    component_contributions, top_contributors,
};
pub use interp::grid::Grid;
pub use interp::logit_lens::{
    AllPositionsLens, LensOptions, LogitLensAnalysis, LogitLensResult, TokenPrediction,
    run_logit_lens, run_logit_lens_all_positions, run_logit_lens_with,
    track_tokens_across_layers,
};
pub use interp::patching::{
    CausalTrace, InfluenceRanking, PatchingSetup, PatchingSweep, causal_trace, corrupt_prompt,
    logit_difference_sweep, token_influence,
};
pub use interp::similarity::{ConceptGrid, cosine_similarity_grids};
