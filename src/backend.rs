// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait and model wrapper.
//!
//! [`LensBackend`] is the trait a hook-instrumented model implements.
//! [`LensModel`] pairs a backend with its tokenizer and device and adds the
//! prompt-level conveniences every probe uses.

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::config::Gpt2Config;
use crate::error::{LensError, Result};
use crate::gpt2::Gpt2;
use crate::hooks::{HookCache, HookSpec};
use crate::tokenizer::LensTokenizer;

// ---------------------------------------------------------------------------
// LensBackend trait
// ---------------------------------------------------------------------------

/// Interface for model backends with hook-aware forward passes.
///
/// The single [`forward`](Self::forward) method takes a [`HookSpec`]
/// describing captures and interventions, and returns a [`HookCache`]
/// containing the logits plus any requested activations.
pub trait LensBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of transformer blocks.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Number of attention heads per layer.
    fn num_heads(&self) -> usize;

    // --- Core forward pass -----------------------------------------------

    /// Forward pass with optional hook capture and interventions.
    ///
    /// With an empty `hooks`, this is a plain forward pass.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing `logits` at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor operation failures and
    /// [`LensError::Hook`] if an intervention does not fit the activation.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    // --- Weight projections ----------------------------------------------

    /// Multiply hidden states by the unembedding matrix `W_U`.
    ///
    /// No final norm is applied; see [`apply_final_norm`](Self::apply_final_norm).
    ///
    /// # Shapes
    /// - `hidden`: `[.., hidden_size]`
    /// - returns: `[.., vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on shape mismatch.
    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor>;

    /// Apply the model's final layer norm.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on shape mismatch.
    fn apply_final_norm(&self, hidden: &Tensor) -> Result<Tensor>;

    /// Row `token_id` of the token embedding matrix `W_E`.
    ///
    /// # Shapes
    /// - returns: `[hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if `token_id` is out of range.
    fn embedding_vector(&self, token_id: u32) -> Result<Tensor>;

    /// Column `token_id` of the unembedding matrix `W_U`.
    ///
    /// # Shapes
    /// - returns: `[hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if `token_id` is out of range.
    fn unembedding_vector(&self, token_id: u32) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// LensModel
// ---------------------------------------------------------------------------

/// High-level model wrapper: backend, tokenizer and device.
pub struct LensModel {
    /// The underlying model backend.
    // TRAIT_OBJECT: tests swap in small in-memory backends
    backend: Box<dyn LensBackend>,
    /// Tokenizer matching the backend's vocabulary.
    tokenizer: LensTokenizer,
    /// The device this model lives on.
    device: Device,
}

impl LensModel {
    /// Load a GPT-2 checkpoint from a `HuggingFace` model ID or local directory.
    ///
    /// Uses CUDA device 0 when available unless `force_cpu` is set. Weights
    /// are loaded in `F32` on every device.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Download`] if files cannot be fetched,
    /// [`LensError::Config`] if `config.json` is not a GPT-2 config, or
    /// [`LensError::Model`] if weight loading fails.
    pub fn from_pretrained(model_id: &str, force_cpu: bool) -> Result<Self> {
        let device = if force_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)?
        };
        info!(model_id, device = ?device, "loading model");

        let files = crate::download::resolve_model_files(model_id)?;

        let config_str = std::fs::read_to_string(&files.config)?;
        let json: serde_json::Value = serde_json::from_str(&config_str)
            .map_err(|e| LensError::Config(format!("parse config.json: {e}")))?;
        let config = Gpt2Config::from_hf_config(&json)?;
        info!(
            layers = config.num_layers,
            hidden = config.hidden_size,
            heads = config.num_heads,
            vocab = config.vocab_size,
            "model config"
        );

        let tokenizer = LensTokenizer::from_file(&files.tokenizer, config.bos_token_id)?;
        let vb = create_var_builder(&files.weights, DType::F32, &device)?;
        let model = Gpt2::load(config, vb)?;

        Ok(Self::new(Box::new(model), tokenizer, device))
    }

    /// Wrap an existing backend and tokenizer.
    #[must_use]
    pub fn new(backend: Box<dyn LensBackend>, tokenizer: LensTokenizer, device: Device) -> Self {
        Self {
            backend,
            tokenizer,
            device,
        }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// The tokenizer.
    #[must_use]
    pub const fn tokenizer(&self) -> &LensTokenizer {
        &self.tokenizer
    }

    /// Access the underlying backend.
    #[must_use]
    pub fn backend(&self) -> &dyn LensBackend {
        &*self.backend
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Number of attention heads.
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.backend.num_heads()
    }

    // --- Tokenization ----------------------------------------------------

    /// Token IDs of `prompt`, BOS included.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] on encoding failure or an empty prompt.
    pub fn to_tokens(&self, prompt: &str) -> Result<Vec<u32>> {
        self.tokenizer.encode(prompt)
    }

    /// Per-position token strings of `prompt`, BOS included.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] on encoding failure.
    pub fn to_str_tokens(&self, prompt: &str) -> Result<Vec<String>> {
        self.tokenizer.to_str_tokens(prompt)
    }

    /// The single token ID for `text`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] unless `text` is exactly one token.
    pub fn to_single_token(&self, text: &str) -> Result<u32> {
        self.tokenizer.to_single_token(text)
    }

    /// Decoded string of one token ID.
    #[must_use]
    pub fn to_single_str_token(&self, token_id: u32) -> String {
        self.tokenizer.to_single_str_token(token_id)
    }

    // --- Forward passes --------------------------------------------------

    /// Run the model on explicit token IDs.
    ///
    /// # Shapes
    /// - returns: [`HookCache`] with logits at `[1, ids.len(), vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the backend.
    pub fn run_ids(&self, ids: &[u32], hooks: &HookSpec) -> Result<HookCache> {
        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        self.backend.forward(&input, hooks)
    }

    /// Tokenize `prompt` and run it, returning logits and captured activations.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] on encoding failure, otherwise
    /// propagates errors from the backend.
    pub fn run_with_cache(&self, prompt: &str, hooks: &HookSpec) -> Result<HookCache> {
        let ids = self.to_tokens(prompt)?;
        self.run_ids(&ids, hooks)
    }

    /// Tokenize `prompt` and run it with interventions, returning only logits.
    ///
    /// # Shapes
    /// - returns: `[1, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Same as [`run_with_cache`](Self::run_with_cache).
    pub fn run_with_hooks(&self, prompt: &str, hooks: &HookSpec) -> Result<Tensor> {
        Ok(self.run_with_cache(prompt, hooks)?.into_output())
    }

    /// Project hidden states to vocabulary logits (no final norm).
    ///
    /// # Errors
    ///
    /// Propagates errors from the backend.
    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        self.backend.project_to_vocab(hidden)
    }
}

impl std::fmt::Debug for LensModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LensModel")
            .field("num_layers", &self.num_layers())
            .field("hidden_size", &self.hidden_size())
            .field("device", &self.device)
            .field("tokenizer", &self.tokenizer)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Weight loading helpers (used by from_pretrained)
// ---------------------------------------------------------------------------

/// Create a `VarBuilder` from safetensors file paths.
///
/// Uses buffered (safe) loading by default. With the `mmap` feature,
/// uses memory-mapped loading.
fn create_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Load weights via buffered (safe) reading. Single-file checkpoints only.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    let [path] = paths else {
        return Err(LensError::Config(format!(
            "buffered loading needs exactly one safetensors file, got {}; \
             enable the `mmap` feature for sharded checkpoints",
            paths.len()
        )));
    };
    let data = std::fs::read(path)?;
    Ok(candle_nn::VarBuilder::from_buffered_safetensors(
        data, dtype, device,
    )?)
}

/// Load weights via memory-mapped files.
///
/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}
