use serde::{Deserialize, Serialize};

use crate::CandidateId;

/// The two orthogonal prompt dimensions refined on alternating iterations:
/// `what` is the content half, `how` the style half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    What,
    How,
}

impl Dimension {
    /// The dimension a refinement iteration works on: odd iterations refine
    /// content, even iterations refine style.
    pub fn for_iteration(iteration: u32) -> Self {
        if iteration % 2 == 1 {
            Self::What
        } else {
            Self::How
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::What => "what",
            Self::How => "how",
        }
    }
}

/// The content and style halves of a prompt. Non-empty, immutable after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPair {
    pub what: String,
    pub how: String,
}

impl PromptPair {
    pub fn new(what: impl Into<String>, how: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            how: how.into(),
        }
    }
}

/// Provider-reported metadata attached to a generated image.
///
/// `safety_rephrased` and the prompt pair around it are filled in by the
/// engine when the one-shot safety retry produced this image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub safety_rephrased: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rephrased_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A generated image. At least one of `url` / `local_path` is present;
/// `local_path` is preferred for stable references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    pub metadata: ImageMetadata,
}

impl ImageArtifact {
    /// The stable reference for this image, preferring the local path.
    pub fn locator(&self) -> Option<&str> {
        self.local_path.as_deref().or(self.url.as_deref())
    }
}

/// Vision-provider output for one candidate. Present only when score-based
/// ranking is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// How faithfully the image matches its prompt, in `[0, 100]`.
    pub alignment_score: f32,
    /// Image-intrinsic visual quality, in `[0, 10]`.
    pub aesthetic_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    pub tokens_used: u32,
}

/// Within-iteration rank produced by the pairwise ranker. Present only when
/// comparative ranking is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranking {
    /// 1 = best.
    pub rank: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wins: Option<u32>,
}

/// Marker attached to children collapsed into the floor equivalence class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalRankNote {
    TiedAtFloor,
}

/// One fully populated beam-search candidate.
///
/// Created once by the pipeline, then enriched by the ranker and the
/// global-rank assigner. Lineage is by id only: `parent_id` is the parent's
/// local id in the previous iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u32>,
    pub dimension: Dimension,
    pub what: String,
    pub how: String,
    pub combined: String,
    pub image: ImageArtifact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranking: Option<Ranking>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_rank_note: Option<GlobalRankNote>,
}

/// A decided pairwise comparison, accumulated across iterations so the
/// ranker never re-asks the judge about a known pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Comparison {
    pub winner: CandidateId,
    pub loser: CandidateId,
}
