use serde::{Deserialize, Serialize};

use crate::CandidateId;

/// Pipeline stage a progress event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Expand,
    Combine,
    ImageGen,
    Vision,
    Ranking,
    Safety,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Starting,
    Complete,
    Progress,
    Failed,
    /// Safety retry: asking the text provider for a safer prompt.
    Rephrasing,
    /// Safety retry: re-running image generation with the rephrased prompt.
    Retrying,
    /// Safety retry: the rephrased prompt generated successfully.
    Success,
}

/// Completed / total counter for batch stages such as ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
}

/// One structured progress event.
///
/// Everything except `stage`, `status`, and `message` is optional. Ranking
/// events carry the compared pair in `candidate_a` / `candidate_b` and set
/// `inferred` for pairs resolved from the comparison graph without a
/// provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub status: ProgressStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aesthetic: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_a: Option<CandidateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_b: Option<CandidateId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inferred: bool,
}

impl ProgressEvent {
    pub fn new(stage: ProgressStage, status: ProgressStatus, message: impl Into<String>) -> Self {
        Self {
            stage,
            status,
            message: message.into(),
            candidate: None,
            iteration: None,
            image_url: None,
            alignment: None,
            aesthetic: None,
            total_score: None,
            progress: None,
            candidate_a: None,
            candidate_b: None,
            inferred: false,
        }
    }

    pub fn with_candidate(mut self, id: CandidateId) -> Self {
        self.candidate = Some(id);
        self.iteration = Some(id.iteration);
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn with_scores(mut self, alignment: f32, aesthetic: f32, total: f32) -> Self {
        self.alignment = Some(alignment);
        self.aesthetic = Some(aesthetic);
        self.total_score = Some(total);
        self
    }

    pub fn with_progress(mut self, completed: u32, total: u32) -> Self {
        self.progress = Some(Progress { completed, total });
        self
    }

    pub fn with_pair(mut self, a: CandidateId, b: CandidateId) -> Self {
        self.candidate_a = Some(a);
        self.candidate_b = Some(b);
        self
    }

    pub fn inferred(mut self) -> Self {
        self.inferred = true;
        self
    }
}

/// Consumer of engine progress events.
///
/// Events are published from worker tasks and may interleave across
/// candidates; implementations must tolerate concurrent invocation or
/// serialize internally.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn publish(&self, _event: ProgressEvent) {}
}
