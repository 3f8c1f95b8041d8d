//! Shared mock providers for the engine integration tests.
//!
//! Mocks capture their inputs behind `Arc<Mutex<…>>` so tests can assert on
//! exactly what the engine sent, and key their outputs off the candidate id
//! threaded through `ImageOptions` (image urls are the rendered id, e.g.
//! `i0c1`), which keeps parallel runs deterministic.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use atelier_core::{
    Candidate, CandidateId, Dimension, EngineError, Evaluation, ImageArtifact, ImageMetadata,
    ProgressEvent, ProgressSink, ProgressStage, RunConfig,
};
use atelier_engine::provider::{
    AttemptRecord, AttemptResults, CritiqueOutput, CritiqueProvider, CritiqueRequest,
    EvaluationProvider, GenerateTextOptions, ImageOptions, ImageProvider, MetadataSink,
    PairDecision, PairWinner, PairwiseJudge, TextOutput, TextProvider,
};
use atelier_engine::{Providers, RunObserver};

#[derive(Default)]
pub struct MockText {
    expand_counter: AtomicU32,
    pub rephrase: Mutex<Option<String>>,
    pub generate_text_calls: AtomicU32,
}

#[async_trait]
impl TextProvider for MockText {
    async fn expand(
        &self,
        _user_prompt: &str,
        dimension: Dimension,
        _temperature: f32,
        _cancel: CancellationToken,
    ) -> Result<TextOutput, EngineError> {
        let n = self.expand_counter.fetch_add(1, Ordering::SeqCst);
        Ok(TextOutput {
            text: format!("{}{n}", dimension.as_str()),
            tokens_used: 1,
        })
    }

    async fn refine(
        &self,
        current: &str,
        dimension: Dimension,
        _critique: &str,
        _user_prompt: &str,
        _cancel: CancellationToken,
    ) -> Result<TextOutput, EngineError> {
        Ok(TextOutput {
            text: format!("refined-{}-{current}", dimension.as_str()),
            tokens_used: 1,
        })
    }

    async fn combine(
        &self,
        what: &str,
        how: &str,
        _cancel: CancellationToken,
    ) -> Result<TextOutput, EngineError> {
        Ok(TextOutput {
            text: format!("{what}+{how}"),
            tokens_used: 1,
        })
    }

    async fn generate_text(
        &self,
        _user_message: &str,
        _options: GenerateTextOptions,
        _cancel: CancellationToken,
    ) -> Result<String, EngineError> {
        self.generate_text_calls.fetch_add(1, Ordering::SeqCst);
        match self.rephrase.lock().unwrap().clone() {
            Some(text) => Ok(text),
            None => Err(EngineError::provider("rephrase model unavailable")),
        }
    }
}

pub struct MockImage {
    /// Candidates whose first generation fails with `safety_message`.
    pub safety_fail_once: Mutex<HashSet<CandidateId>>,
    pub safety_message: String,
    /// Candidates that always fail with a non-safety error.
    pub fail: Mutex<HashSet<CandidateId>>,
    /// Every call as `(candidate, prompt)`, in arrival order.
    pub calls: Mutex<Vec<(Option<CandidateId>, String)>>,
    /// Full options for every call, in arrival order.
    pub options_seen: Mutex<Vec<ImageOptions>>,
    concurrent: AtomicU32,
    pub max_concurrent: AtomicU32,
    pub delay: Duration,
}

impl Default for MockImage {
    fn default() -> Self {
        Self {
            safety_fail_once: Mutex::new(HashSet::new()),
            safety_message: "safety_violations=[violence]".to_string(),
            fail: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            options_seen: Mutex::new(Vec::new()),
            concurrent: AtomicU32::new(0),
            max_concurrent: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }
}

impl MockImage {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ImageProvider for MockImage {
    async fn generate(
        &self,
        prompt: &str,
        options: ImageOptions,
        cancel: CancellationToken,
    ) -> Result<ImageArtifact, EngineError> {
        let candidate = options.candidate;
        self.calls
            .lock()
            .unwrap()
            .push((candidate, prompt.to_string()));
        self.options_seen.lock().unwrap().push(options.clone());

        let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.concurrent.fetch_sub(1, Ordering::SeqCst);
                    return Err(EngineError::Cancelled);
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        if let Some(id) = candidate {
            if self.fail.lock().unwrap().contains(&id) {
                return Err(EngineError::provider("image backend unavailable"));
            }
            if self.safety_fail_once.lock().unwrap().remove(&id) {
                return Err(EngineError::provider(self.safety_message.clone()));
            }
        }

        Ok(ImageArtifact {
            url: candidate.map(|id| id.to_string()),
            local_path: None,
            metadata: ImageMetadata {
                model: "mock-image".to_string(),
                ..ImageMetadata::default()
            },
        })
    }
}

pub struct MockVision {
    /// Alignment score per image url; `default_alignment` otherwise.
    pub alignment: Mutex<HashMap<String, f32>>,
    pub default_alignment: f32,
    pub aesthetic: f32,
}

impl Default for MockVision {
    fn default() -> Self {
        Self {
            alignment: Mutex::new(HashMap::new()),
            default_alignment: 80.0,
            aesthetic: 5.0,
        }
    }
}

impl MockVision {
    pub fn set_alignment(&self, url: &str, score: f32) {
        self.alignment.lock().unwrap().insert(url.to_string(), score);
    }
}

#[async_trait]
impl EvaluationProvider for MockVision {
    async fn analyze(
        &self,
        image: &ImageArtifact,
        _combined: &str,
        _cancel: CancellationToken,
    ) -> Result<Evaluation, EngineError> {
        let url = image.locator().unwrap_or_default();
        let alignment = self
            .alignment
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(self.default_alignment);
        Ok(Evaluation {
            alignment_score: alignment,
            aesthetic_score: self.aesthetic,
            analysis: None,
            tokens_used: 5,
        })
    }
}

/// Judge that prefers the image with the higher configured strength; ties
/// go to operand A. Records every compared pair by url.
pub struct MockJudge {
    pub strength: Mutex<HashMap<String, f32>>,
    pub asked: Mutex<Vec<(String, String)>>,
    /// Unordered url pairs that fail.
    pub fail_pairs: Mutex<HashSet<(String, String)>>,
}

impl Default for MockJudge {
    fn default() -> Self {
        Self {
            strength: Mutex::new(HashMap::new()),
            asked: Mutex::new(Vec::new()),
            fail_pairs: Mutex::new(HashSet::new()),
        }
    }
}

impl MockJudge {
    pub fn set_strength(&self, url: &str, strength: f32) {
        self.strength.lock().unwrap().insert(url.to_string(), strength);
    }

    pub fn fail_pair(&self, a: &str, b: &str) {
        let key = if a <= b { (a.to_string(), b.to_string()) } else { (b.to_string(), a.to_string()) };
        self.fail_pairs.lock().unwrap().insert(key);
    }

    pub fn asked_pairs(&self) -> Vec<(String, String)> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl PairwiseJudge for MockJudge {
    async fn compare(
        &self,
        a: &ImageArtifact,
        b: &ImageArtifact,
        _user_prompt: &str,
        _cancel: CancellationToken,
    ) -> Result<PairDecision, EngineError> {
        let a_url = a.locator().unwrap_or_default().to_string();
        let b_url = b.locator().unwrap_or_default().to_string();
        self.asked
            .lock()
            .unwrap()
            .push((a_url.clone(), b_url.clone()));

        let key = if a_url <= b_url {
            (a_url.clone(), b_url.clone())
        } else {
            (b_url.clone(), a_url.clone())
        };
        if self.fail_pairs.lock().unwrap().contains(&key) {
            return Err(EngineError::provider("judge backend unavailable"));
        }

        let strengths = self.strength.lock().unwrap();
        let a_strength = strengths.get(&a_url).copied().unwrap_or(50.0);
        let b_strength = strengths.get(&b_url).copied().unwrap_or(50.0);
        let winner = if b_strength > a_strength {
            PairWinner::B
        } else {
            PairWinner::A
        };
        Ok(PairDecision {
            winner,
            reason: "stronger composition".to_string(),
            confidence: 0.9,
            tokens_used: 3,
        })
    }
}

pub struct MockCritic {
    pub requests: Mutex<Vec<CritiqueRequest>>,
    pub fail: Mutex<bool>,
}

impl Default for MockCritic {
    fn default() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
        }
    }
}

#[async_trait]
impl CritiqueProvider for MockCritic {
    async fn critique(
        &self,
        request: CritiqueRequest,
        _cancel: CancellationToken,
    ) -> Result<CritiqueOutput, EngineError> {
        self.requests.lock().unwrap().push(request);
        if *self.fail.lock().unwrap() {
            return Err(EngineError::provider("critique model unavailable"));
        }
        Ok(CritiqueOutput {
            critique: "push the contrast".to_string(),
            recommendation: "lean into dramatic lighting".to_string(),
            reason: "flat lighting in the current render".to_string(),
            tokens_used: 2,
        })
    }
}

#[derive(Default)]
pub struct RecordingMetadata {
    pub attempts: Mutex<Vec<AttemptRecord>>,
    pub updates: Mutex<Vec<(CandidateId, AttemptResults)>>,
    pub winner: Mutex<Option<(CandidateId, Option<f32>)>>,
}

impl RecordingMetadata {
    pub fn attempts_for(&self, id: CandidateId) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|attempt| attempt.id == id)
            .count()
    }

    pub fn updates_for(&self, id: CandidateId) -> usize {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(updated, _)| *updated == id)
            .count()
    }
}

#[async_trait]
impl MetadataSink for RecordingMetadata {
    async fn record_attempt(&self, attempt: AttemptRecord) -> Result<(), EngineError> {
        self.attempts.lock().unwrap().push(attempt);
        Ok(())
    }

    async fn update_attempt(
        &self,
        id: CandidateId,
        results: AttemptResults,
    ) -> Result<(), EngineError> {
        self.updates.lock().unwrap().push((id, results));
        Ok(())
    }

    async fn mark_final_winner(
        &self,
        id: CandidateId,
        total_score: Option<f32>,
    ) -> Result<(), EngineError> {
        *self.winner.lock().unwrap() = Some((id, total_score));
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectingProgress {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    pub fn for_candidate(&self, id: CandidateId, stage: ProgressStage) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.candidate == Some(id) && event.stage == stage)
            .cloned()
            .collect()
    }
}

impl ProgressSink for CollectingProgress {
    fn publish(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
pub struct CollectingObserver {
    pub candidates: Mutex<Vec<CandidateId>>,
    pub steps: Mutex<Vec<ProgressStage>>,
    pub iterations: Mutex<Vec<u32>>,
    pub rankings: Mutex<Vec<u32>>,
}

impl RunObserver for CollectingObserver {
    fn on_candidate_processed(&self, candidate: &Candidate) {
        self.candidates.lock().unwrap().push(candidate.id);
    }

    fn on_step_progress(&self, event: &ProgressEvent) {
        self.steps.lock().unwrap().push(event.stage);
    }

    fn on_iteration_complete(&self, iteration: u32, _survivors: &[Candidate]) {
        self.iterations.lock().unwrap().push(iteration);
    }

    fn on_ranking_complete(&self, iteration: u32, _ranked: &[Candidate]) {
        self.rankings.lock().unwrap().push(iteration);
    }
}

/// One bundle of mocks wired into a `Providers` set.
pub struct Harness {
    pub text: Arc<MockText>,
    pub image: Arc<MockImage>,
    pub vision: Arc<MockVision>,
    pub judge: Arc<MockJudge>,
    pub critic: Arc<MockCritic>,
    pub metadata: Arc<RecordingMetadata>,
    pub progress: Arc<CollectingProgress>,
}

/// Install a test subscriber once so `RUST_LOG=debug cargo test` shows
/// engine traces.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl Default for Harness {
    fn default() -> Self {
        init_tracing();
        Self {
            text: Arc::new(MockText::default()),
            image: Arc::new(MockImage::default()),
            vision: Arc::new(MockVision::default()),
            judge: Arc::new(MockJudge::default()),
            critic: Arc::new(MockCritic::default()),
            metadata: Arc::new(RecordingMetadata::default()),
            progress: Arc::new(CollectingProgress::default()),
        }
    }
}

impl Harness {
    /// Score mode: evaluation provider supplied, no judge.
    pub fn score_providers(&self) -> Providers {
        Providers {
            text: self.text.clone(),
            image: self.image.clone(),
            evaluator: Some(self.vision.clone()),
            judge: None,
            critic: self.critic.clone(),
            metadata: self.metadata.clone(),
            progress: self.progress.clone(),
        }
    }

    /// Comparative mode: pairwise judge supplied, vision analysis skipped.
    pub fn judge_providers(&self) -> Providers {
        Providers {
            text: self.text.clone(),
            image: self.image.clone(),
            evaluator: None,
            judge: Some(self.judge.clone()),
            critic: self.critic.clone(),
            metadata: self.metadata.clone(),
            progress: self.progress.clone(),
        }
    }
}

/// A config with non-default limits so each test gets its own limiter
/// bundle rather than sharing the process-wide one.
pub fn isolated_config(beam_width: u32, keep_top: u32, max_iterations: u32) -> RunConfig {
    let mut config = RunConfig::new(beam_width, keep_top, max_iterations);
    config.limits.text = 16;
    config
}

pub fn id(iteration: u32, local: u32) -> CandidateId {
    CandidateId::new(iteration, local)
}
