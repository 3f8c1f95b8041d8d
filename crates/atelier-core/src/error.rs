use thiserror::Error;

/// Failure modes surfaced by the engine.
///
/// `Cancelled` propagates immediately and is never swallowed. A
/// `SafetyViolation` triggers the one-shot rephrase retry before it is
/// surfaced. `Provider` failures are isolated at the iteration boundary:
/// the failing candidate becomes an empty slot and the iteration continues
/// unless every slot failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("run cancelled")]
    Cancelled,

    #[error("image prompt rejected by safety filter: {message}")]
    SafetyViolation {
        message: String,
        category: Option<String>,
    },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("all {attempted} candidates failed in iteration {iteration}")]
    AllCandidatesFailed { iteration: u32, attempted: u32 },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }
}
