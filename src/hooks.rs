// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and patching.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookSpec`] (what to capture and where to intervene), and
//! [`HookCache`] (captured tensors from a forward pass).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{LensError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or patched.
///
/// Uses the `TransformerLens` hook naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`], so probe results can be
/// compared directly against notebooks written for that library.
///
/// ```
/// use candle_lens::HookPoint;
///
/// let hook = HookPoint::ResidPost(5);
/// assert_eq!(hook.to_string(), "blocks.5.hook_resid_post");
///
/// let parsed: HookPoint = "blocks.5.hook_resid_post".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    // -- Embedding --
    /// After token embedding (`hook_embed`).
    Embed,
    /// After learned position embedding (`hook_pos_embed`).
    PosEmbed,

    // -- Per-layer --
    /// Residual stream before layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Post-softmax attention pattern in layer `i` (`blocks.{i}.attn.hook_pattern`).
    ///
    /// Shape: `[batch, heads, seq_query, seq_key]`.
    AttnPattern(usize),
    /// Per-head attention output projected into the residual stream
    /// (`blocks.{i}.attn.hook_result`).
    ///
    /// Shape: `[batch, seq, heads, d_model]`. Summing over heads and adding
    /// the output bias gives [`HookPoint::AttnOut`]. Capture only: GPT-2
    /// rejects interventions here.
    AttnResult(usize),
    /// Attention output in layer `i` (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Residual stream between attention and MLP (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// MLP hidden activation after GELU (`blocks.{i}.mlp.hook_post`).
    MlpPost(usize),
    /// MLP output in layer `i` (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Residual stream after full layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),

    // -- Final --
    /// After final layer norm (`ln_final.hook_normalized`).
    FinalNorm,

    /// Hook point not covered by the standard enum. Never fired, so it can
    /// be captured (and stays empty) but not intervened on.
    Custom(String),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::PosEmbed => write!(f, "hook_pos_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnPattern(i) => write!(f, "blocks.{i}.attn.hook_pattern"),
            Self::AttnResult(i) => write!(f, "blocks.{i}.attn.hook_result"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "ln_final.hook_normalized"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

/// Allow `hooks.capture("blocks.5.hook_resid_post")` via `Into<HookPoint>`.
impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`] for unknown patterns.
fn parse_hook_string(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_pos_embed" => return HookPoint::PosEmbed,
        "ln_final.hook_normalized" => return HookPoint::FinalNorm,
        _ => {}
    }

    if let Some((layer, suffix)) = s
        .strip_prefix("blocks.")
        .and_then(|rest| rest.split_once('.'))
        .and_then(|(layer_str, suffix)| Some((layer_str.parse::<usize>().ok()?, suffix)))
    {
        return match suffix {
            "hook_resid_pre" => HookPoint::ResidPre(layer),
            "attn.hook_pattern" => HookPoint::AttnPattern(layer),
            "attn.hook_result" => HookPoint::AttnResult(layer),
            "hook_attn_out" => HookPoint::AttnOut(layer),
            "hook_resid_mid" => HookPoint::ResidMid(layer),
            "mlp.hook_post" => HookPoint::MlpPost(layer),
            "hook_mlp_out" => HookPoint::MlpOut(layer),
            "hook_resid_post" => HookPoint::ResidPost(layer),
            _ => HookPoint::Custom(s.to_string()),
        };
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// An intervention applied to the activation at a hook point.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Replace the tensor entirely with a provided value.
    Replace(Tensor),

    /// Add a vector to the activation (broadcast).
    Add(Tensor),

    /// Overwrite the activation at a single token position.
    ///
    /// `value` has shape `[d_model]` and is written into
    /// `activation[b, position, :]` for every batch row. This is the
    /// primitive behind activation patching.
    PatchPosition {
        /// Token position to overwrite.
        position: usize,
        /// Replacement vector, shape `[d_model]`.
        value: Tensor,
    },

    /// Zero the tensor at this hook point.
    Zero,
}

/// Apply a single [`Intervention`] to a residual-shaped tensor.
///
/// # Shapes
/// - `tensor`: `[batch, seq, d_model]` for [`Intervention::PatchPosition`];
///   any shape otherwise.
/// - returns: same shape as `tensor`.
///
/// # Errors
///
/// Returns [`LensError::Hook`] if a patch position is out of range, and
/// [`LensError::Model`] if the underlying tensor operation fails.
pub(crate) fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Replace(replacement) => Ok(replacement.clone()),
        Intervention::Add(delta) => Ok(tensor.broadcast_add(delta)?),
        Intervention::PatchPosition { position, value } => {
            patch_position(tensor, *position, value)
        }
        Intervention::Zero => Ok(tensor.zeros_like()?),
    }
}

/// Write `value` into `tensor[:, position, :]`.
fn patch_position(tensor: &Tensor, position: usize, value: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, d_model) = tensor.dims3()?;
    if position >= seq_len {
        return Err(LensError::Hook(format!(
            "patch position {position} out of range (seq_len={seq_len})"
        )));
    }
    let row = value
        .to_dtype(tensor.dtype())?
        .to_device(tensor.device())?
        .reshape((1, 1, d_model))?
        .broadcast_as((batch, 1, d_model))?
        .contiguous()?;
    Ok(tensor.slice_assign(&[0..batch, position..position + 1, 0..d_model], &row)?)
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which interventions to apply.
///
/// ```
/// use candle_lens::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::AttnPattern(5))
///      .capture("blocks.5.hook_resid_post");
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
    /// Interventions in registration order.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Request capture of several hook points at once.
    pub fn capture_all<I, H>(&mut self, hooks: I) -> &mut Self
    where
        I: IntoIterator<Item = H>,
        H: Into<HookPoint>,
    {
        self.captures.extend(hooks.into_iter().map(Into::into));
        self
    }

    /// Register an intervention at the given hook point.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Whether this spec has no captures and no interventions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered interventions.
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Iterate over interventions registered at a specific hook point.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Hook points that carry at least one intervention, in registration order.
    pub fn intervention_points(&self) -> impl Iterator<Item = &HookPoint> {
        self.interventions.iter().map(|(h, _)| h)
    }

    /// Check whether any intervention targets the given hook point.
    #[must_use]
    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.interventions.iter().any(|(h, _)| h == hook)
    }

    /// Capture-or-intervene helper used by backends at each hook point.
    ///
    /// Stores a clone when `hook` is captured, then applies every
    /// intervention registered at `hook` in order. Captures see the value
    /// *before* interventions, matching the hooking library convention of
    /// caching the unmodified activation.
    ///
    /// # Errors
    ///
    /// Propagates intervention failures.
    pub(crate) fn run_hook(
        &self,
        hook: HookPoint,
        mut tensor: Tensor,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        if self.is_captured(&hook) {
            cache.store(hook.clone(), tensor.clone());
        }
        for intervention in self.interventions_at(&hook) {
            tensor = apply_intervention(&tensor, intervention)?;
        }
        Ok(tensor)
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the output logits.
///
/// ```
/// use candle_lens::{HookCache, HookPoint};
/// use candle_core::{Device, Tensor};
///
/// let logits = Tensor::zeros((1, 10, 50257), candle_core::DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
///
/// let resid = Tensor::zeros((1, 10, 768), candle_core::DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::ResidPost(3), resid);
///
/// assert!(cache.get(&HookPoint::ResidPost(3)).is_some());
/// assert!(cache.require(&HookPoint::ResidPost(4)).is_err());
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| LensError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor once the final logits are known.
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
