use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Per-class concurrency limits for the three provider classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub text: u32,
    pub image: u32,
    pub vision: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            text: 8,
            image: 4,
            vision: 4,
        }
    }
}

/// Optional second-stage image pass applied to each iteration's winner:
/// re-run generation with the winner's image as input at `denoise_strength`
/// under an alternate model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotorealPass {
    pub model: String,
    pub denoise_strength: f32,
}

/// Configuration for one beam-search run.
///
/// `beam_width` (N) is the number of candidates attempted per iteration,
/// `keep_top` (M) the number of survivors, `max_iterations` (K) the total
/// iteration count including the initial expansion. The engine requires
/// `M ≤ N` and `N mod M = 0` so every parent expands into the same number of
/// children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub beam_width: u32,
    pub keep_top: u32,
    pub max_iterations: u32,
    /// Weight of alignment vs. normalized aesthetics in the total score.
    pub alpha: f32,
    /// Sampling temperature handed to expand calls to encourage variety.
    pub temperature: f32,
    /// Number of pairwise-judge votes per compared pair; majority decides.
    pub ensemble_size: u32,
    /// When true, a single pairwise-judge failure is recorded and the pair
    /// treated as unknown instead of aborting the ranking step.
    pub graceful_degradation: bool,
    pub limits: RateLimits,
    /// Opaque session identifier passed through to providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photoreal_pass: Option<PhotorealPass>,
}

impl RunConfig {
    pub fn new(beam_width: u32, keep_top: u32, max_iterations: u32) -> Self {
        Self {
            beam_width,
            keep_top,
            max_iterations,
            alpha: 0.7,
            temperature: 0.7,
            ensemble_size: 1,
            graceful_degradation: false,
            limits: RateLimits::default(),
            session_id: None,
            photoreal_pass: None,
        }
    }

    /// Children per parent in refinement iterations.
    pub fn expansion_ratio(&self) -> u32 {
        self.beam_width / self.keep_top
    }

    /// Check the run preconditions. Violations surface as
    /// [`EngineError::InvalidConfig`] at driver construction, before any
    /// provider is touched.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.beam_width == 0 {
            return Err(EngineError::InvalidConfig(
                "beam_width must be >= 1".into(),
            ));
        }
        if self.keep_top == 0 {
            return Err(EngineError::InvalidConfig("keep_top must be >= 1".into()));
        }
        if self.max_iterations == 0 {
            return Err(EngineError::InvalidConfig(
                "max_iterations must be >= 1".into(),
            ));
        }
        if self.keep_top > self.beam_width {
            return Err(EngineError::InvalidConfig(format!(
                "keep_top ({}) must not exceed beam_width ({})",
                self.keep_top, self.beam_width
            )));
        }
        if self.max_iterations > 1 && self.beam_width % self.keep_top != 0 {
            // Refinement needs a whole number of children per parent; a
            // single-iteration run never refines.
            return Err(EngineError::InvalidConfig(format!(
                "beam_width ({}) must be divisible by keep_top ({})",
                self.beam_width, self.keep_top
            )));
        }
        if !self.alpha.is_finite() || !(0.0..=1.0).contains(&self.alpha) {
            return Err(EngineError::InvalidConfig(format!(
                "alpha must be within [0, 1], got {}",
                self.alpha
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if self.ensemble_size == 0 {
            return Err(EngineError::InvalidConfig(
                "ensemble_size must be >= 1".into(),
            ));
        }
        for (name, limit) in [
            ("limits.text", self.limits.text),
            ("limits.image", self.limits.image),
            ("limits.vision", self.limits.vision),
        ] {
            if limit == 0 {
                return Err(EngineError::InvalidConfig(format!(
                    "{name} must be >= 1"
                )));
            }
        }
        if let Some(pass) = &self.photoreal_pass {
            if !pass.denoise_strength.is_finite()
                || !(0.0..=1.0).contains(&pass.denoise_strength)
            {
                return Err(EngineError::InvalidConfig(format!(
                    "photoreal_pass.denoise_strength must be within [0, 1], got {}",
                    pass.denoise_strength
                )));
            }
        }
        Ok(())
    }
}
