// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cosine similarity of the residual stream against concept embeddings.
//!
//! For each concept token, builds an `[n_layers × seq_len]` grid of
//! `cos(resid_post[l][pos], W_E[concept])`. A bright cell means the
//! residual at that layer and position points in the direction of the
//! concept's input embedding.

use candle_core::DType;
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::LensModel;
use crate::cache::ResidualCache;
use crate::error::{LensError, Result};
use crate::interp::grid::Grid;
use crate::util::tensor::dot;

/// Norm floor used by [`cosine_similarity`].
pub const COSINE_EPS: f32 = 1e-8;

/// Cosine similarity with each norm clamped to at least [`COSINE_EPS`].
///
/// ```
/// use candle_lens::interp::similarity::cosine_similarity;
///
/// assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
/// assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
/// ```
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot(a, a).sqrt().max(COSINE_EPS);
    let norm_b = dot(b, b).sqrt().max(COSINE_EPS);
    dot(a, b) / (norm_a * norm_b)
}

/// Similarity grid for one concept token.
#[derive(Debug, Clone, Serialize)]
pub struct ConceptGrid {
    /// Concept text as given.
    pub concept: String,
    /// Its single token ID.
    pub token_id: u32,
    /// `[n_layers × seq_len]` cosine similarities.
    pub grid: Grid,
}

/// Cosine similarity of every `resid_post` vector with each concept's embedding.
///
/// # Errors
///
/// Returns [`LensError::Tokenizer`] if a concept is not a single token or
/// the prompt is empty, and [`LensError::Model`] on tensor failures.
pub fn cosine_similarity_grids(
    model: &LensModel,
    prompt: &str,
    concepts: &[&str],
) -> Result<Vec<ConceptGrid>> {
    let concept_vectors = concepts
        .iter()
        .map(|&concept| {
            let token_id = model.to_single_token(concept)?;
            let vector: Vec<f32> = model
                .backend()
                .embedding_vector(token_id)?
                .to_dtype(DType::F32)?
                .to_vec1()?;
            Ok((concept, token_id, vector))
        })
        .collect::<Result<Vec<_>>>()?;

    let n_layers = model.num_layers();
    let hook_cache = model.run_with_cache(prompt, &ResidualCache::hook_spec(n_layers))?;
    let cache = ResidualCache::from_hook_cache(&hook_cache, n_layers)?;
    let seq_len = cache.seq_len()?;
    info!(n_layers, seq_len, concepts = concepts.len(), "computing cosine similarity grids");

    let mut grids: Vec<Grid> = concepts.iter().map(|_| Grid::zeros(n_layers, seq_len)).collect();
    for layer in 0..n_layers {
        let resid: Vec<Vec<f32>> = cache
            .get_layer(layer)
            .ok_or_else(|| LensError::Hook(format!("layer {layer} not in cache")))?
            .to_dtype(DType::F32)?
            .to_vec2()?;
        for (pos, residual) in resid.iter().enumerate() {
            for (grid, (_, _, vector)) in grids.iter_mut().zip(&concept_vectors) {
                grid.set(layer, pos, cosine_similarity(residual, vector));
            }
        }
        debug!(layer, "similarity layer done");
    }

    Ok(concept_vectors
        .into_iter()
        .zip(grids)
        .map(|((concept, token_id, _), grid)| ConceptGrid {
            concept: concept.to_owned(),
            token_id,
            grid,
        })
        .collect())
}
