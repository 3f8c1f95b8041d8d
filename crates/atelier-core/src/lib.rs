//! `atelier-core` holds the value objects shared by the Atelier beam-search
//! engine: candidate identity, prompt pairs, image artifacts, evaluation and
//! ranking results, run configuration, progress events, and the engine error
//! taxonomy.
//!
//! Everything here is plain data. Candidates are constructed once per
//! iteration and referenced by composite id; downstream stages produce new
//! derived values instead of mutating a shared graph.

mod candidate;
mod config;
mod error;
mod event;
mod id;
mod score;

pub use candidate::{
    Candidate, Comparison, Dimension, Evaluation, GlobalRankNote, ImageArtifact, ImageMetadata,
    PromptPair, Ranking,
};
pub use config::{PhotorealPass, RateLimits, RunConfig};
pub use error::EngineError;
pub use event::{
    NoopProgressSink, Progress, ProgressEvent, ProgressSink, ProgressStage, ProgressStatus,
};
pub use id::CandidateId;
pub use score::total_score;
