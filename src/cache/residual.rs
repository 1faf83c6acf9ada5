// SPDX-License-Identifier: MIT OR Apache-2.0

//! Residual stream cache for one forward pass.

use candle_core::Tensor;

use crate::error::{LensError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec};

/// All-position `blocks.{l}.hook_resid_post` activations from one forward
/// pass, one `[seq_len, d_model]` tensor per layer (batch index 0).
///
/// # Example
///
/// ```
/// use candle_lens::{HookCache, HookPoint, ResidualCache};
/// use candle_core::{DType, Device, Tensor};
///
/// let mut run = HookCache::new(Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
/// // shape [batch=1, seq_len=4, d_model=8]
/// run.store(HookPoint::ResidPost(0), Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap());
///
/// let cache = ResidualCache::from_hook_cache(&run, 1).unwrap();
/// let act = cache.get_position(0, 3).unwrap(); // shape [d_model]
/// assert_eq!(act.dims(), &[8]);
/// ```
#[derive(Debug)]
pub struct ResidualCache {
    /// `resid_post` per layer, each shape `[seq_len, d_model]`.
    resid_post: Vec<Tensor>,
}

impl ResidualCache {
    /// Hooks to capture so that [`from_hook_cache`](Self::from_hook_cache)
    /// finds everything it needs.
    #[must_use]
    pub fn hook_spec(n_layers: usize) -> HookSpec {
        let mut hooks = HookSpec::new();
        hooks.capture_all((0..n_layers).map(HookPoint::ResidPost));
        hooks
    }

    /// Collect residual activations from a run made with
    /// [`hook_spec`](Self::hook_spec).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if a `resid_post` capture is missing.
    pub fn from_hook_cache(cache: &HookCache, n_layers: usize) -> Result<Self> {
        let resid_post = (0..n_layers)
            .map(|layer| Ok(cache.require(&HookPoint::ResidPost(layer))?.get(0)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { resid_post })
    }

    /// `resid_post` for `layer`, shape `[seq_len, d_model]`.
    #[must_use]
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.resid_post.get(layer)
    }

    /// `resid_post` of `layer` at `position`, shape `[d_model]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if the layer is not in the cache or
    /// the position is out of range.
    pub fn get_position(&self, layer: usize, position: usize) -> Result<Tensor> {
        let layer_tensor = self
            .resid_post
            .get(layer)
            .ok_or_else(|| LensError::Hook(format!("layer {layer} not in cache")))?;
        let seq_len = layer_tensor.dim(0)?;
        if position >= seq_len {
            return Err(LensError::Hook(format!(
                "position {position} out of range (seq_len={seq_len})"
            )));
        }
        Ok(layer_tensor.get(position)?)
    }

    /// Number of cached layers.
    #[must_use]
    pub fn n_layers(&self) -> usize {
        self.resid_post.len()
    }

    /// Sequence length (from the first layer's tensor).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if the cache is empty.
    pub fn seq_len(&self) -> Result<usize> {
        let first = self
            .resid_post
            .first()
            .ok_or_else(|| LensError::Hook("cache is empty".into()))?;
        Ok(first.dim(0)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn run_with_layers(n_layers: usize, seq_len: usize, d_model: usize) -> HookCache {
        let device = Device::Cpu;
        let mut hook_cache = HookCache::new(Tensor::zeros(1, DType::F32, &device).unwrap());
        for layer in 0..n_layers {
            #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
            let fill = layer as f64;
            let t = (Tensor::ones((1, seq_len, d_model), DType::F32, &device).unwrap() * fill)
                .unwrap();
            hook_cache.store(HookPoint::ResidPost(layer), t);
        }
        hook_cache
    }

    #[test]
    fn from_hook_cache_strips_batch() {
        let cache = ResidualCache::from_hook_cache(&run_with_layers(2, 3, 4), 2).unwrap();
        assert_eq!(cache.n_layers(), 2);
        assert_eq!(cache.seq_len().unwrap(), 3);
        assert_eq!(cache.get_layer(1).unwrap().dims(), &[3, 4]);
        let row: Vec<f32> = cache.get_position(1, 2).unwrap().to_vec1().unwrap();
        assert_eq!(row, vec![1.0; 4]);
    }

    #[test]
    fn missing_layers_and_positions_error() {
        assert!(ResidualCache::from_hook_cache(&run_with_layers(2, 3, 4), 3).is_err());

        let cache = ResidualCache::from_hook_cache(&run_with_layers(2, 3, 4), 2).unwrap();
        assert!(cache.get_position(0, 3).is_err());
        assert!(cache.get_position(5, 0).is_err());

        let empty = ResidualCache::from_hook_cache(&run_with_layers(0, 3, 4), 0).unwrap();
        assert!(empty.seq_len().is_err());
    }

    #[test]
    fn hook_spec_captures_every_layer() {
        let hooks = ResidualCache::hook_spec(3);
        assert_eq!(hooks.num_captures(), 3);
        assert!(!hooks.is_captured(&HookPoint::ResidPre(0)));
        assert!(hooks.is_captured(&HookPoint::ResidPost(2)));
    }
}
