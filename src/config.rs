// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model and experiment configuration.
//!
//! [`Gpt2Config`] is parsed from a `HuggingFace` `config.json`.
//! [`TraceConfig`] describes one probing experiment and is loaded from a
//! JSON file; every field defaults to the Dallas/Texas running example.
//!
//! ```
//! use candle_lens::Gpt2Config;
//!
//! let json: serde_json::Value = serde_json::from_str(
//!     r#"{"model_type": "gpt2", "n_embd": 768, "n_layer": 12, "n_head": 12,
//!         "n_positions": 1024, "vocab_size": 50257}"#,
//! ).unwrap();
//! let config = Gpt2Config::from_hf_config(&json).unwrap();
//! assert_eq!(config.head_dim, 64);
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LensError, Result};

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Activation function used in the MLP.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// GELU, tanh approximation (`gelu_new`, the GPT-2 default).
    GeluApprox,
    /// GELU, exact erf variant.
    Gelu,
    /// ReLU.
    Relu,
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GeluApprox => write!(f, "GELU (tanh approx)"),
            Self::Gelu => write!(f, "GELU"),
            Self::Relu => write!(f, "ReLU"),
        }
    }
}

// ---------------------------------------------------------------------------
// Gpt2Config
// ---------------------------------------------------------------------------

/// Configuration of a GPT-2 family checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Gpt2Config {
    /// Hidden dimension (`n_embd`).
    pub hidden_size: usize,
    /// Number of transformer blocks (`n_layer`).
    pub num_layers: usize,
    /// Number of attention heads (`n_head`).
    pub num_heads: usize,
    /// Dimension per head (`hidden_size / num_heads`).
    pub head_dim: usize,
    /// MLP hidden dimension (`n_inner`, default `4 * n_embd`).
    pub intermediate_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Maximum sequence length (`n_positions`).
    pub max_position_embeddings: usize,
    /// Epsilon of every layer norm.
    pub layer_norm_eps: f64,
    /// MLP activation.
    pub activation: Activation,
    /// Beginning-of-sequence token id, prepended to prompts when set.
    pub bos_token_id: Option<u32>,
}

impl Gpt2Config {
    /// GPT-2 small (124M), the model the running example targets.
    #[must_use]
    pub const fn gpt2_small() -> Self {
        Self {
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            head_dim: 64,
            intermediate_size: 3072,
            vocab_size: 50257,
            max_position_embeddings: 1024,
            layer_norm_eps: 1e-5,
            activation: Activation::GeluApprox,
            bos_token_id: Some(50256),
        }
    }

    /// Parse a [`Gpt2Config`] from a `HuggingFace` `config.json` value.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if `model_type` is not `gpt2`, a
    /// required dimension is missing, or the head count does not divide
    /// the hidden size.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| LensError::Config("missing 'model_type' field".into()))?;
        if model_type != "gpt2" {
            return Err(LensError::Config(format!(
                "unsupported model_type: '{model_type}'"
            )));
        }

        let hidden_size = get_usize(config, "n_embd")?;
        let num_heads = get_usize(config, "n_head")?;
        if num_heads == 0 || hidden_size % num_heads != 0 {
            return Err(LensError::Config(format!(
                "n_embd {hidden_size} is not divisible by n_head {num_heads}"
            )));
        }

        let activation = match config
            .get("activation_function")
            .and_then(Value::as_str)
            .unwrap_or("gelu_new")
        {
            "gelu_new" | "gelu_pytorch_tanh" => Activation::GeluApprox,
            "gelu" => Activation::Gelu,
            "relu" => Activation::Relu,
            other => {
                return Err(LensError::Config(format!(
                    "unsupported activation_function: '{other}'"
                )));
            }
        };

        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "n_layer")?,
            num_heads,
            head_dim: hidden_size / num_heads,
            // `n_inner` is explicitly null in most GPT-2 configs.
            intermediate_size: get_optional_usize(config, "n_inner").unwrap_or(4 * hidden_size),
            vocab_size: get_usize(config, "vocab_size")?,
            max_position_embeddings: get_usize_or(config, "n_positions", 1024),
            layer_norm_eps: get_f64_or(config, "layer_norm_epsilon", 1e-5),
            activation,
            bos_token_id: get_optional_usize(config, "bos_token_id")
                .and_then(|id| u32::try_from(id).ok()),
        })
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| LensError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| LensError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    get_optional_usize(config, key).unwrap_or(default)
}

/// Extract an optional `usize` field, returning `None` if absent or null.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// TraceConfig
// ---------------------------------------------------------------------------

/// One probing experiment: which model, which prompts, which tokens.
///
/// Missing fields in the JSON file take their default, so `{}` is the
/// running example.
///
/// ```
/// use candle_lens::TraceConfig;
///
/// let config: TraceConfig = serde_json::from_str(r#"{"corrupted_city": "Seattle"}"#).unwrap();
/// assert_eq!(config.corrupted_city, "Seattle");
/// assert_eq!(config.corrupted_prompt(), "Seattle is in the state called");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// `HuggingFace` model id.
    pub model_id: String,
    /// Prompt whose completion is being explained.
    pub clean_prompt: String,
    /// Word in the clean prompt that gets replaced to build the corrupted prompt.
    pub clean_city: String,
    /// Replacement for [`clean_city`](Self::clean_city).
    pub corrupted_city: String,
    /// Token whose logit the clean prompt should favour.
    pub answer_token: String,
    /// Token whose logit the corrupted prompt should favour.
    pub corrupt_answer_token: String,
    /// Tokens whose embeddings serve as concept vectors.
    pub concept_tokens: Vec<String>,
    /// Target tokens for attribution and causal tracing.
    pub target_tokens: Vec<String>,
    /// Number of predictions kept per layer by the logit lens.
    pub top_k: usize,
    /// Force CPU even when CUDA is available.
    pub force_cpu: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            model_id: "openai-community/gpt2".into(),
            clean_prompt: "Dallas is in the state called".into(),
            clean_city: "Dallas".into(),
            corrupted_city: "Phoenix".into(),
            answer_token: "Austin".into(),
            corrupt_answer_token: "Phoenix".into(),
            concept_tokens: vec!["Texas".into(), "Austin".into()],
            target_tokens: vec![" Texas".into(), " Arizona".into()],
            top_k: 5,
            force_cpu: false,
        }
    }
}

impl TraceConfig {
    /// Load an experiment config from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Io`] if the file cannot be read and
    /// [`LensError::Config`] if it is not valid JSON for this struct.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text).map_err(|e| {
            LensError::Config(format!("parse {}: {e}", path.as_ref().display()))
        })
    }

    /// The clean prompt with the clean city replaced by the corrupted one.
    #[must_use]
    pub fn corrupted_prompt(&self) -> String {
        self.clean_prompt
            .replace(&self.clean_city, &self.corrupted_city)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gpt2_config_json() -> Value {
        serde_json::json!({
            "model_type": "gpt2",
            "activation_function": "gelu_new",
            "n_embd": 768,
            "n_layer": 12,
            "n_head": 12,
            "n_inner": null,
            "n_positions": 1024,
            "vocab_size": 50257,
            "layer_norm_epsilon": 1e-5,
            "bos_token_id": 50256
        })
    }

    #[test]
    fn parse_gpt2_small() {
        let config = Gpt2Config::from_hf_config(&gpt2_config_json()).unwrap();
        assert_eq!(config, Gpt2Config::gpt2_small());
    }

    #[test]
    fn explicit_n_inner_is_honoured() {
        let mut json = gpt2_config_json();
        json["n_inner"] = serde_json::json!(1024);
        let config = Gpt2Config::from_hf_config(&json).unwrap();
        assert_eq!(config.intermediate_size, 1024);
    }

    #[test]
    fn indivisible_heads_error() {
        let mut json = gpt2_config_json();
        json["n_head"] = serde_json::json!(5);
        assert!(Gpt2Config::from_hf_config(&json).is_err());
    }

    #[test]
    fn unsupported_model_type_errors() {
        let json = serde_json::json!({ "model_type": "llama", "n_embd": 768 });
        assert!(matches!(
            Gpt2Config::from_hf_config(&json),
            Err(LensError::Config(_))
        ));
    }

    #[test]
    fn missing_dimension_errors() {
        let json = serde_json::json!({ "model_type": "gpt2", "n_head": 12 });
        assert!(Gpt2Config::from_hf_config(&json).is_err());
    }

    #[test]
    fn trace_config_defaults_to_running_example() {
        let config: TraceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TraceConfig::default());
        assert_eq!(config.corrupted_prompt(), "Phoenix is in the state called");
    }

    #[test]
    fn trace_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        std::fs::write(&path, r#"{"top_k": 3, "concept_tokens": ["Ohio"]}"#).unwrap();

        let config = TraceConfig::from_file(&path).unwrap();
        assert_eq!(config.top_k, 3);
        assert_eq!(config.concept_tokens, vec!["Ohio".to_string()]);
        assert_eq!(config.clean_city, "Dallas");
    }

    #[test]
    fn trace_config_bad_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            TraceConfig::from_file(&path),
            Err(LensError::Config(_))
        ));
    }
}
