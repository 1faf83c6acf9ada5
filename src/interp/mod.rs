// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interpretability probes.
//!
//! - [`logit_lens`]: residual-stream-to-vocabulary projection per layer.
//! - [`similarity`]: cosine similarity against concept embeddings.
//! - [`patching`]: activation patching, causal tracing and token influence.
//! - [`attribution`]: direct logit attribution per head and MLP.
//! - [`analysis`]: every probe above, for one prompt.
//! - [`grid`]: the layer-by-position result table.

pub mod analysis;
pub mod attribution;
pub mod grid;
pub mod logit_lens;
pub mod patching;
pub mod similarity;
