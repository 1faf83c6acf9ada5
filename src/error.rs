// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-lens.

/// Errors that can occur while running a probe.
#[derive(Debug, thiserror::Error)]
pub enum LensError {
    /// Model loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Activation patching setup or application error.
    #[error("patching error: {0}")]
    Patching(String),

    /// Model or experiment configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Model download error.
    #[error("download error: {0}")]
    Download(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-lens operations.
pub type Result<T> = std::result::Result<T, LensError>;
