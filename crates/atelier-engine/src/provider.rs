//! Abstract provider capabilities consumed by the engine.
//!
//! Each role is a small object-safe trait; production backends and test
//! mocks satisfy the same contract. Every call takes a request-scoped
//! [`CancellationToken`] and is expected to honor it at its own suspension
//! points.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use atelier_core::{
    CandidateId, Dimension, EngineError, Evaluation, ImageArtifact, Ranking,
};

/// Text produced by an LLM call, with pass-through token accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextOutput {
    pub text: String,
    pub tokens_used: u32,
}

/// Options for the free-form generation call used by the safety-rephrase
/// path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateTextOptions {
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait TextProvider: Send + Sync {
    /// Expand the user's prompt along one dimension, seeded with
    /// `temperature` to encourage variety across sibling candidates.
    async fn expand(
        &self,
        user_prompt: &str,
        dimension: Dimension,
        temperature: f32,
        cancel: CancellationToken,
    ) -> Result<TextOutput, EngineError>;

    /// Refine the current value of one dimension using a parent critique.
    async fn refine(
        &self,
        current: &str,
        dimension: Dimension,
        critique: &str,
        user_prompt: &str,
        cancel: CancellationToken,
    ) -> Result<TextOutput, EngineError>;

    /// Synthesize a combined prompt from a `(what, how)` pair.
    async fn combine(
        &self,
        what: &str,
        how: &str,
        cancel: CancellationToken,
    ) -> Result<TextOutput, EngineError>;

    /// Free-form generation. Used only by the safety-rephrase path.
    async fn generate_text(
        &self,
        user_message: &str,
        options: GenerateTextOptions,
        cancel: CancellationToken,
    ) -> Result<String, EngineError>;
}

/// Options passed through to image generation. An enumerated struct rather
/// than an open bag: unknown options are rejected at the type level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageOptions {
    pub candidate: Option<CandidateId>,
    pub dimension: Option<Dimension>,
    pub seed: Option<u64>,
    pub size: Option<String>,
    pub quality: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    /// Source image for the second-stage refinement pass.
    pub input_image: Option<ImageArtifact>,
    pub denoise_strength: Option<f32>,
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Generate one image. Safety rejections are distinguishable by error
    /// message content (see [`crate::safety`]).
    async fn generate(
        &self,
        prompt: &str,
        options: ImageOptions,
        cancel: CancellationToken,
    ) -> Result<ImageArtifact, EngineError>;
}

#[async_trait]
pub trait EvaluationProvider: Send + Sync {
    /// Score one image against the combined prompt it was generated from.
    async fn analyze(
        &self,
        image: &ImageArtifact,
        combined: &str,
        cancel: CancellationToken,
    ) -> Result<Evaluation, EngineError>;
}

/// Which operand won a pairwise comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairWinner {
    A,
    B,
}

/// One pairwise-judge verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct PairDecision {
    pub winner: PairWinner,
    pub reason: String,
    pub confidence: f32,
    pub tokens_used: u32,
}

#[async_trait]
pub trait PairwiseJudge: Send + Sync {
    async fn compare(
        &self,
        a: &ImageArtifact,
        b: &ImageArtifact,
        user_prompt: &str,
        cancel: CancellationToken,
    ) -> Result<PairDecision, EngineError>;
}

/// The parent's latest feedback handed to the critique generator: its
/// within-iteration ranking when comparative mode ran, otherwise its
/// evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ParentFeedback {
    Ranking(Ranking),
    Evaluation(Evaluation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CritiqueRequest {
    pub feedback: Option<ParentFeedback>,
    pub what: String,
    pub how: String,
    pub combined: String,
    pub user_prompt: String,
    pub dimension: Dimension,
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CritiqueOutput {
    pub critique: String,
    pub recommendation: String,
    pub reason: String,
    pub tokens_used: u32,
}

#[async_trait]
pub trait CritiqueProvider: Send + Sync {
    async fn critique(
        &self,
        request: CritiqueRequest,
        cancel: CancellationToken,
    ) -> Result<CritiqueOutput, EngineError>;
}

/// Attempt metadata persisted *before* risky provider calls so a later
/// failure still leaves a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub id: CandidateId,
    pub parent_id: Option<u32>,
    pub dimension: Dimension,
    pub what: String,
    pub how: String,
}

/// Results written back to a recorded attempt after the candidate succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResults {
    pub combined: String,
    pub image: ImageArtifact,
    pub evaluation: Option<Evaluation>,
    pub total_score: Option<f32>,
}

#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn record_attempt(&self, attempt: AttemptRecord) -> Result<(), EngineError>;

    async fn update_attempt(
        &self,
        id: CandidateId,
        results: AttemptResults,
    ) -> Result<(), EngineError>;

    async fn mark_final_winner(
        &self,
        id: CandidateId,
        total_score: Option<f32>,
    ) -> Result<(), EngineError>;
}

/// Sink that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetadataSink;

#[async_trait]
impl MetadataSink for NoopMetadataSink {
    async fn record_attempt(&self, _attempt: AttemptRecord) -> Result<(), EngineError> {
        Ok(())
    }

    async fn update_attempt(
        &self,
        _id: CandidateId,
        _results: AttemptResults,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn mark_final_winner(
        &self,
        _id: CandidateId,
        _total_score: Option<f32>,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}
