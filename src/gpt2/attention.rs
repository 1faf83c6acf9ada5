// SPDX-License-Identifier: MIT OR Apache-2.0

//! GPT-2 causal self-attention with per-head result hooks.
//!
//! Q, K and V come from one fused `c_attn` projection. Besides the usual
//! pattern capture, the block can expose each head's contribution to the
//! residual stream (`attn.hook_result`), which component attribution reads.

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::Gpt2Config;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};

use super::conv1d;

/// Multi-head causal self-attention layer.
pub struct Attention {
    /// Fused QKV projection: `[hidden] -> [3 * hidden]`.
    c_attn: Linear,
    /// Output projection: `[hidden] -> [hidden]`.
    c_proj: Linear,
    /// Output projection split per head.
    ///
    /// Shape: `[n_heads, head_dim, hidden]` (`W_O` in head-major form).
    w_o_heads: Tensor,
    /// Number of heads.
    num_heads: usize,
    /// Dimension per head.
    head_dim: usize,
    /// `1 / sqrt(head_dim)`.
    scale: f64,
}

impl Attention {
    /// Load attention weights (`c_attn`, `c_proj`) from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &Gpt2Config, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        let c_attn = conv1d(hidden, 3 * hidden, vb.pp("c_attn"))?;
        let c_proj = conv1d(hidden, hidden, vb.pp("c_proj"))?;

        // Linear weight is [out, in]; W_O^T is [in, out] = [heads * head_dim, hidden].
        let w_o_heads = c_proj
            .weight()
            .t()?
            .contiguous()?
            .reshape((config.num_heads, config.head_dim, hidden))?;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (config.head_dim as f64).sqrt();

        Ok(Self {
            c_attn,
            c_proj,
            w_o_heads,
            num_heads: config.num_heads,
            head_dim: config.head_dim,
            scale,
        })
    }

    /// Run the attention forward pass with hook capture.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden]` (already layer-normed)
    /// - `mask`: `[1, 1, seq, seq]` causal mask
    /// - returns: `[batch, seq, hidden]`, the block's attention output
    ///   including the `c_proj` bias
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor operation failures.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let (batch, seq_len, hidden) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, i * hidden, hidden)?
                .reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(1)?;
        let v = split(2)?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let scores = scores.broadcast_add(mask)?;

        // PROMOTE: softmax in F32 regardless of model dtype
        let original_dtype = scores.dtype();
        let pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
            .to_dtype(original_dtype)?;

        let pattern = hooks.run_hook(HookPoint::AttnPattern(layer_idx), pattern, cache)?;

        // z: [batch, heads, seq, head_dim]
        let z = pattern.matmul(&v)?;

        if hooks.is_captured(&HookPoint::AttnResult(layer_idx)) {
            cache.store(HookPoint::AttnResult(layer_idx), self.per_head_result(&z)?);
        }

        let z_flat = z
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, hidden))?;
        Ok(self.c_proj.forward(&z_flat)?)
    }

    /// Project each head's `z` through its slice of `W_O`.
    ///
    /// # Shapes
    /// - `z`: `[batch, heads, seq, head_dim]`
    /// - returns: `[batch, seq, heads, hidden]` (no output bias)
    fn per_head_result(&self, z: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq_len, head_dim) = z.dims4()?;
        let hidden = self.w_o_heads.dim(2)?;

        // [heads, batch * seq, head_dim] @ [heads, head_dim, hidden]
        let z_heads = z
            .transpose(0, 1)?
            .contiguous()?
            .reshape((heads, batch * seq_len, head_dim))?;
        let result = z_heads
            .matmul(&self.w_o_heads.to_dtype(z.dtype())?)?
            .reshape((heads, batch, seq_len, hidden))?
            .permute((1, 2, 0, 3))?
            .contiguous()?;
        Ok(result)
    }
}
