// SPDX-License-Identifier: MIT OR Apache-2.0

//! GPT-2 feed-forward block: `c_proj(act(c_fc(x)))`.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::{Activation, Gpt2Config};
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};

use super::conv1d;

/// Plain (non-gated) MLP with biases on both projections.
pub struct Mlp {
    /// Up projection: `[hidden] -> [intermediate]`.
    c_fc: Linear,
    /// Down projection: `[intermediate] -> [hidden]`.
    c_proj: Linear,
    /// Activation function.
    activation: Activation,
}

impl Mlp {
    /// Load MLP weights (`c_fc`, `c_proj`) from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &Gpt2Config, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            c_fc: conv1d(config.hidden_size, config.intermediate_size, vb.pp("c_fc"))?,
            c_proj: conv1d(config.intermediate_size, config.hidden_size, vb.pp("c_proj"))?,
            activation: config.activation,
        })
    }

    /// Run the MLP forward pass, capturing `mlp.hook_post` when requested.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden]`
    /// - returns: `[batch, seq, hidden]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor operation failures.
    pub fn forward(
        &self,
        x: &Tensor,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let post = apply_activation(&self.c_fc.forward(x)?, self.activation)?;
        let post = hooks.run_hook(HookPoint::MlpPost(layer_idx), post, cache)?;
        Ok(self.c_proj.forward(&post)?)
    }
}

/// Apply the selected activation function.
fn apply_activation(x: &Tensor, activation: Activation) -> Result<Tensor> {
    match activation {
        Activation::GeluApprox => Ok(x.gelu()?),
        Activation::Gelu => Ok(x.gelu_erf()?),
        Activation::Relu => Ok(x.relu()?),
    }
}
