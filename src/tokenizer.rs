// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer wrapper with BOS handling and single-token lookups.
//!
//! [`LensTokenizer`] wraps a `HuggingFace` [`tokenizers::Tokenizer`] and
//! adds the conveniences the probes rely on: optional BOS prepending,
//! per-token strings for labelling grid columns, and strict single-token
//! lookups for answer and concept words.

use crate::error::{LensError, Result};

/// Tokenizer used by every probe.
///
/// GPT-2's `tokenizer.json` does not add a BOS token on its own. Prompts
/// are run with `<|endoftext|>` prepended (when a BOS id is configured),
/// so position 0 of every grid is the BOS token and the first prompt word
/// sits at position 1.
///
/// # Example
///
/// ```no_run
/// use candle_lens::LensTokenizer;
///
/// # fn main() -> candle_lens::Result<()> {
/// let tok = LensTokenizer::from_file("tokenizer.json", Some(50256))?;
/// let ids = tok.encode("Dallas is in the state called")?;
/// assert_eq!(ids[0], 50256);
/// let texas = tok.to_single_token(" Texas")?;
/// # Ok(())
/// # }
/// ```
pub struct LensTokenizer {
    /// Underlying `HuggingFace` tokenizer.
    inner: Box<tokenizers::Tokenizer>,
    /// BOS id prepended by [`encode`](Self::encode), if any.
    bos_token_id: Option<u32>,
}

impl LensTokenizer {
    /// Load a `HuggingFace` tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>, bos_token_id: Option<u32>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            LensError::Tokenizer(format!(
                "failed to load tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::new(tok, bos_token_id))
    }

    /// Parse a tokenizer from its JSON serialization.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if the JSON is not a valid tokenizer.
    pub fn from_json(json: &str, bos_token_id: Option<u32>) -> Result<Self> {
        let tok: tokenizers::Tokenizer = json
            .parse()
            .map_err(|e| LensError::Tokenizer(format!("failed to parse tokenizer JSON: {e}")))?;
        Ok(Self::new(tok, bos_token_id))
    }

    /// Wrap an already-loaded tokenizer.
    #[must_use]
    pub fn new(tokenizer: tokenizers::Tokenizer, bos_token_id: Option<u32>) -> Self {
        Self {
            inner: Box::new(tokenizer),
            bos_token_id,
        }
    }

    /// The BOS id prepended to prompts, if any.
    #[must_use]
    pub const fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    /// Encode a prompt into token IDs, prepending BOS when configured.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails or the prompt
    /// produces no tokens at all.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let raw = self.encode_raw(text)?;
        if raw.is_empty() {
            return Err(LensError::Tokenizer(format!(
                "prompt {text:?} produced no tokens"
            )));
        }
        let mut ids = Vec::with_capacity(raw.len() + 1);
        ids.extend(self.bos_token_id);
        ids.extend(raw);
        Ok(ids)
    }

    /// Encode text into token IDs without BOS or other special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails.
    pub fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| LensError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token IDs back to a string.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| LensError::Tokenizer(format!("decode failed: {e}")))
    }

    /// Decode a single token ID, falling back to `<id>` on failure.
    ///
    /// Used when labelling predictions, where one undecodable id should
    /// not abort a whole sweep.
    #[must_use]
    pub fn to_single_str_token(&self, token_id: u32) -> String {
        self.decode(&[token_id])
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    /// Per-token strings of a prompt, including the BOS token when configured.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails.
    pub fn to_str_tokens(&self, text: &str) -> Result<Vec<String>> {
        Ok(self
            .encode(text)?
            .into_iter()
            .map(|id| self.to_single_str_token(id))
            .collect())
    }

    /// Look up the single token ID for `text`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] unless `text` encodes to exactly
    /// one token. GPT-2 distinguishes `"Texas"` from `" Texas"`; callers
    /// must pass the variant they mean.
    pub fn to_single_token(&self, text: &str) -> Result<u32> {
        match self.encode_raw(text)?.as_slice() {
            [id] => Ok(*id),
            ids => Err(LensError::Tokenizer(format!(
                "{text:?} is not a single token (encodes to {} tokens)",
                ids.len()
            ))),
        }
    }

    /// Get vocabulary size (including added tokens).
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl std::fmt::Debug for LensTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LensTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_token_id", &self.bos_token_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
