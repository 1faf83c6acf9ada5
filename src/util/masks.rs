// SPDX-License-Identifier: MIT OR Apache-2.0

//! Causal attention masks.
//!
//! Activation-patching sweeps run hundreds of forward passes over prompts
//! of identical length, so masks are cached by `(seq_len, device, dtype)`.
//! Cached tensors are shallow clones (`Arc` bump, no data copy).

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Cache key: `(seq_len, device kind, dtype)`.
type MaskKey = (usize, usize, DType);

/// Process-wide causal mask cache.
static CAUSAL_MASK_CACHE: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Coarse device identifier for the cache key (assumes one device per kind).
const fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Create or fetch a causal mask.
///
/// # Shapes
/// - returns: `[1, 1, seq_len, seq_len]`, `0.0` where `j <= i`, `-inf` elsewhere.
///
/// # Errors
///
/// Returns [`LensError::Model`](crate::LensError::Model) if tensor creation fails.
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (seq_len, device_id(device), dtype);

    // A poisoned lock only loses the cache, never the mask.
    if let Some(cached) = CAUSAL_MASK_CACHE
        .lock()
        .ok()
        .and_then(|cache| cache.get(&key).cloned())
    {
        return Ok(cached);
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    if let Ok(mut cache) = CAUSAL_MASK_CACHE.lock() {
        cache.insert(key, mask.clone());
    }

    Ok(mask)
}
