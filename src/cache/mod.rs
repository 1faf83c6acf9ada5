// SPDX-License-Identifier: MIT OR Apache-2.0

//! Residual-stream caches read by the probes.
//!
//! - [`ResidualCache`]: all-position residual stream activations per layer.

mod residual;

pub use residual::ResidualCache;
