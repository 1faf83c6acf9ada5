// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook-instrumented GPT-2 forward pass.
//!
//! Inference only: loads an existing `HuggingFace` GPT-2 checkpoint and
//! fires every [`HookPoint`] on the way through, so the probes in
//! [`crate::interp`] can read and patch activations.

pub(crate) mod attention;
pub(crate) mod mlp;

use candle_core::{DType, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};

use crate::backend::LensBackend;
use crate::config::Gpt2Config;
use crate::error::{LensError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::util::masks;

use self::attention::Attention;
use self::mlp::Mlp;

// ---------------------------------------------------------------------------
// Weight helpers
// ---------------------------------------------------------------------------

/// Load a GPT-2 `Conv1D` as a [`Linear`].
///
/// `Conv1D` stores its weight as `[in, out]`; `Linear` expects `[out, in]`.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder<'_>) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Load a layer norm with the configured epsilon.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
fn layer_norm(config: &Gpt2Config, vb: VarBuilder<'_>) -> Result<LayerNorm> {
    let ln_config = candle_nn::LayerNormConfig {
        eps: config.layer_norm_eps,
        ..Default::default()
    };
    Ok(candle_nn::layer_norm(config.hidden_size, ln_config, vb)?)
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A single pre-LN GPT-2 block.
struct Block {
    /// Norm before attention.
    ln_1: LayerNorm,
    /// Causal self-attention.
    attention: Attention,
    /// Norm before the MLP.
    ln_2: LayerNorm,
    /// Feed-forward block.
    mlp: Mlp,
}

impl Block {
    /// Load block `h.{i}`.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &Gpt2Config, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(config, vb.pp("ln_1"))?,
            attention: Attention::load(config, vb.pp("attn"))?,
            ln_2: layer_norm(config, vb.pp("ln_2"))?,
            mlp: Mlp::load(config, vb.pp("mlp"))?,
        })
    }

    /// Run the block, firing every per-layer hook point.
    fn forward(
        &self,
        hidden: Tensor,
        mask: &Tensor,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let resid_pre = hooks.run_hook(HookPoint::ResidPre(layer_idx), hidden, cache)?;

        let attn_out = self.attention.forward(
            &self.ln_1.forward(&resid_pre)?,
            mask,
            layer_idx,
            hooks,
            cache,
        )?;
        let attn_out = hooks.run_hook(HookPoint::AttnOut(layer_idx), attn_out, cache)?;

        let resid_mid = (resid_pre + attn_out)?;
        let resid_mid = hooks.run_hook(HookPoint::ResidMid(layer_idx), resid_mid, cache)?;

        let mlp_out = self
            .mlp
            .forward(&self.ln_2.forward(&resid_mid)?, layer_idx, hooks, cache)?;
        let mlp_out = hooks.run_hook(HookPoint::MlpOut(layer_idx), mlp_out, cache)?;

        let resid_post = (resid_mid + mlp_out)?;
        hooks.run_hook(HookPoint::ResidPost(layer_idx), resid_post, cache)
    }
}

// ---------------------------------------------------------------------------
// Gpt2
// ---------------------------------------------------------------------------

/// GPT-2 backend with hook points at every residual-stream boundary.
pub struct Gpt2 {
    /// Token embedding (`wte`), also the tied unembedding.
    wte: Embedding,
    /// Learned position embedding (`wpe`).
    wpe: Embedding,
    /// Transformer blocks.
    blocks: Vec<Block>,
    /// Final layer norm (`ln_f`).
    ln_f: LayerNorm,
    /// Model configuration.
    config: Gpt2Config,
}

impl Gpt2 {
    /// Load GPT-2 weights from a [`VarBuilder`].
    ///
    /// Accepts both the bare layout (`wte.weight`, `h.0.attn...`) used by
    /// `openai-community/gpt2` and the `transformer.`-prefixed layout of
    /// `GPT2LMHeadModel` exports.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: Gpt2Config, vb: VarBuilder<'_>) -> Result<Self> {
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("wte"))?;
        let wpe = candle_nn::embedding(
            config.max_position_embeddings,
            config.hidden_size,
            vb.pp("wpe"),
        )?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(Block::load(&config, vb.pp(format!("h.{i}")))?);
        }

        let ln_f = layer_norm(&config, vb.pp("ln_f"))?;

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            config,
        })
    }

    /// Access the model configuration.
    #[must_use]
    pub const fn config(&self) -> &Gpt2Config {
        &self.config
    }

    /// Row `token_id` of the token embedding matrix.
    fn wte_row(&self, token_id: u32) -> Result<Tensor> {
        #[allow(clippy::as_conversions)]
        let idx = token_id as usize;
        if idx >= self.config.vocab_size {
            return Err(LensError::Hook(format!(
                "token id {token_id} out of range (vocab_size={})",
                self.config.vocab_size
            )));
        }
        Ok(self.wte.embeddings().get(idx)?)
    }
}

impl Gpt2 {
    /// Reject interventions this forward pass would never apply.
    ///
    /// `AttnResult` is a read-only view (the block sums heads through
    /// `c_proj`, not through the per-head tensor) and `Custom` hooks are
    /// never fired.
    fn check_interventions(&self, hooks: &HookSpec) -> Result<()> {
        let n_layers = self.config.num_layers;
        for hook in hooks.intervention_points() {
            let supported = match hook {
                HookPoint::Embed | HookPoint::PosEmbed | HookPoint::FinalNorm => true,
                HookPoint::ResidPre(l)
                | HookPoint::AttnPattern(l)
                | HookPoint::AttnOut(l)
                | HookPoint::ResidMid(l)
                | HookPoint::MlpPost(l)
                | HookPoint::MlpOut(l)
                | HookPoint::ResidPost(l) => *l < n_layers,
                HookPoint::AttnResult(_) | HookPoint::Custom(_) => false,
            };
            if !supported {
                return Err(LensError::Hook(format!(
                    "GPT-2 cannot apply an intervention at {hook} ({n_layers} layers)"
                )));
            }
        }
        Ok(())
    }
}

impl LensBackend for Gpt2 {
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let device = input_ids.device();
        let (_batch, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_position_embeddings {
            return Err(LensError::Config(format!(
                "sequence length {seq_len} exceeds n_positions {}",
                self.config.max_position_embeddings
            )));
        }

        self.check_interventions(hooks)?;

        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, device)?);

        // --- Embeddings ---
        let tok = self.wte.forward(input_ids)?;
        let tok = hooks.run_hook(HookPoint::Embed, tok, &mut cache)?;

        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let positions = Tensor::arange(0_u32, seq_len as u32, device)?;
        let pos = self.wpe.forward(&positions)?.unsqueeze(0)?;
        let pos = hooks.run_hook(HookPoint::PosEmbed, pos, &mut cache)?;

        let mut hidden = tok.broadcast_add(&pos)?;
        let mask = masks::create_causal_mask(seq_len, device, hidden.dtype())?;

        // --- Blocks ---
        for (layer_idx, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(hidden, &mask, layer_idx, hooks, &mut cache)?;
        }

        // --- Final norm + tied unembedding ---
        let normed = self.ln_f.forward(&hidden)?;
        let normed = hooks.run_hook(HookPoint::FinalNorm, normed, &mut cache)?;
        let logits = self.project_to_vocab(&normed)?;

        cache.set_output(logits);
        Ok(cache)
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        // [.., d] @ [d, vocab]
        let w_u = self.wte.embeddings().t()?;
        Ok(hidden.broadcast_matmul(&w_u)?)
    }

    fn apply_final_norm(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.ln_f.forward(hidden)?)
    }

    fn embedding_vector(&self, token_id: u32) -> Result<Tensor> {
        self.wte_row(token_id)
    }

    fn unembedding_vector(&self, token_id: u32) -> Result<Tensor> {
        // Tied weights: W_U[:, t] == W_E[t].
        self.wte_row(token_id)
    }
}

impl std::fmt::Debug for Gpt2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpt2")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
