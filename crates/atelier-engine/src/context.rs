use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use atelier_core::{ProgressEvent, ProgressSink, RunConfig};

use crate::driver::RunObserver;
use crate::limiter::ProviderLimiters;
use crate::provider::{
    CritiqueProvider, EvaluationProvider, ImageProvider, MetadataSink, PairwiseJudge, TextProvider,
};

/// Run-scoped bundle of everything the iteration stages need: providers,
/// limiters, configuration, the progress sink, the run observer, and the
/// pass-through token tally for this run.
pub(crate) struct EngineContext<'a> {
    pub text: Arc<dyn TextProvider>,
    pub image: Arc<dyn ImageProvider>,
    pub evaluator: Option<Arc<dyn EvaluationProvider>>,
    pub judge: Option<Arc<dyn PairwiseJudge>>,
    pub critic: Arc<dyn CritiqueProvider>,
    pub metadata: Arc<dyn MetadataSink>,
    pub progress: Arc<dyn ProgressSink>,
    pub observer: &'a dyn RunObserver,
    pub limiters: Arc<ProviderLimiters>,
    pub config: RunConfig,
    pub tokens: AtomicU64,
}

impl EngineContext<'_> {
    pub fn add_tokens(&self, tokens: u32) {
        self.tokens.fetch_add(u64::from(tokens), Ordering::Relaxed);
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    /// Derived from the provider bundle: supplying a pairwise judge skips
    /// vision analysis. Callers cannot set this independently.
    pub fn skip_vision_analysis(&self) -> bool {
        self.judge.is_some()
    }

    /// Deliver one progress event to the observer's step hook and the
    /// progress sink.
    pub fn publish(&self, event: ProgressEvent) {
        self.observer.on_step_progress(&event);
        self.progress.publish(event);
    }
}
