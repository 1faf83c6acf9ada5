// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model file resolution via [`hf-hub`](https://github.com/huggingface/hf-hub).
//!
//! [`resolve_model_files()`] turns a model id into local paths for
//! `config.json`, the safetensors weights, and `tokenizer.json`. A model id
//! that names an existing directory is read from disk as-is; anything else
//! goes through the `HuggingFace` cache (`~/.cache/huggingface/hub/`),
//! downloading on a cache miss.
//!
//! ```rust,no_run
//! # fn example() -> candle_lens::Result<()> {
//! let files = candle_lens::resolve_model_files("openai-community/gpt2")?;
//! tracing::info!("weights at {}", files.weights[0].display());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{LensError, Result};

/// Local paths of every file needed to load a model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// `config.json`.
    pub config: PathBuf,
    /// Safetensors weight files (one, or several shards).
    pub weights: Vec<PathBuf>,
    /// `tokenizer.json`.
    pub tokenizer: PathBuf,
}

/// Index structure for sharded safetensors models.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name to shard filename.
    weight_map: std::collections::HashMap<String, String>,
}

/// Resolve (and download if needed) the files of `model_id`.
///
/// # Errors
///
/// Returns [`LensError::Download`] if the hub cannot be reached or a
/// required file is missing, and [`LensError::Config`] if a shard index
/// cannot be parsed.
pub fn resolve_model_files(model_id: &str) -> Result<ModelFiles> {
    let local = Path::new(model_id);
    if local.is_dir() {
        info!(path = %local.display(), "loading model from local directory");
        return resolve_with(|name| {
            let path = local.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(LensError::Download(format!(
                    "{name} not found in {}",
                    local.display()
                )))
            }
        });
    }

    info!(model_id, "resolving model files from the HuggingFace hub");
    let api = hf_hub::api::sync::Api::new()
        .map_err(|e| LensError::Download(format!("failed to initialise hub API: {e}")))?;
    let repo = api.repo(hf_hub::Repo::new(
        model_id.to_owned(),
        hf_hub::RepoType::Model,
    ));
    resolve_with(|name| {
        repo.get(name)
            .map_err(|e| LensError::Download(format!("{model_id}/{name}: {e}")))
    })
}

/// Resolve every required file through `fetch`.
fn resolve_with(fetch: impl Fn(&str) -> Result<PathBuf>) -> Result<ModelFiles> {
    let config = fetch("config.json")?;
    let tokenizer = fetch("tokenizer.json")?;

    // Sharded checkpoints ship an index; single-file ones do not.
    let weights = match fetch("model.safetensors.index.json") {
        Ok(index_path) => {
            let index_str = std::fs::read_to_string(&index_path)?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)
                .map_err(|e| LensError::Config(format!("parse safetensors index: {e}")))?;

            let mut shard_names: Vec<String> = index.weight_map.into_values().collect();
            shard_names.sort();
            shard_names.dedup();
            debug!(shards = shard_names.len(), "model is sharded");

            shard_names
                .iter()
                .map(|name| fetch(name))
                .collect::<Result<Vec<_>>>()?
        }
        Err(_) => vec![fetch("model.safetensors")?],
    };

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
    })
}
