//! The beam-search driver: initial expansion, refinement iterations,
//! ranking, global-rank merging, and the final winner.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use atelier_core::{
    Candidate, EngineError, ProgressEvent, ProgressSink, ProgressStage, ProgressStatus, RateLimits,
    RunConfig,
};

use crate::context::EngineContext;
use crate::expand::run_initial_expansion;
use crate::global_rank::{assign_global_ranks, merge_global_ranks, sort_for_display};
use crate::limiter::ProviderLimiters;
use crate::provider::{
    CritiqueProvider, EvaluationProvider, ImageOptions, ImageProvider, MetadataSink, PairwiseJudge,
    TextProvider,
};
use crate::ranker::{rank_by_score, rank_comparative, ComparisonGraph};
use crate::refine::run_refinement_iteration;

/// Everything the engine needs to talk to the outside world. The ranker
/// mode is a capability swap: supplying a pairwise judge switches ranking
/// from score mode to comparative mode and skips vision analysis.
pub struct Providers {
    pub text: Arc<dyn TextProvider>,
    pub image: Arc<dyn ImageProvider>,
    pub evaluator: Option<Arc<dyn EvaluationProvider>>,
    pub judge: Option<Arc<dyn PairwiseJudge>>,
    pub critic: Arc<dyn CritiqueProvider>,
    pub metadata: Arc<dyn MetadataSink>,
    pub progress: Arc<dyn ProgressSink>,
}

/// Hooks invoked from worker tasks as the run progresses. Implementations
/// must tolerate concurrent invocation.
///
/// `on_step_progress` receives every event the engine publishes to the
/// progress sink, before the sink sees it.
pub trait RunObserver: Send + Sync {
    fn on_candidate_processed(&self, _candidate: &Candidate) {}
    fn on_step_progress(&self, _event: &ProgressEvent) {}
    fn on_iteration_complete(&self, _iteration: u32, _survivors: &[Candidate]) {}
    fn on_ranking_complete(&self, _iteration: u32, _ranked: &[Candidate]) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Final state of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub winner: Candidate,
    /// The last iteration's survivors, best first; `winner` is the head.
    pub finalists: Vec<Candidate>,
    /// Every ranked candidate across all iterations, ascending by global
    /// rank.
    pub all_global_ranked: Vec<Candidate>,
    pub iterations_run: u32,
    /// Pass-through sum of provider-reported token usage.
    pub tokens_used: u64,
}

/// Beam-search driver over a fixed provider set.
///
/// Construction validates the configuration; `run` may be called multiple
/// times and concurrently, each call with its own cancel token.
pub struct BeamSearch {
    providers: Providers,
    config: RunConfig,
    limiters: Arc<ProviderLimiters>,
}

impl std::fmt::Debug for BeamSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeamSearch")
            .field("config", &self.config)
            .field("limiters", &self.limiters)
            .finish_non_exhaustive()
    }
}

impl BeamSearch {
    pub fn new(providers: Providers, config: RunConfig) -> Result<Self, EngineError> {
        config.validate()?;
        if providers.judge.is_none() && providers.evaluator.is_none() {
            return Err(EngineError::InvalidConfig(
                "score ranking requires an evaluation provider; \
                 supply a pairwise judge to rank comparatively"
                    .into(),
            ));
        }

        // Default limits share the process-wide bundle so metrics reflect
        // global load; overridden limits get a dedicated bundle.
        let limiters = if config.limits == RateLimits::default() {
            ProviderLimiters::global()
        } else {
            Arc::new(ProviderLimiters::new(config.limits))
        };

        Ok(Self {
            providers,
            config,
            limiters,
        })
    }

    /// Share a limiter bundle between several drivers with non-default
    /// limits.
    pub fn with_limiters(mut self, limiters: Arc<ProviderLimiters>) -> Self {
        self.limiters = limiters;
        self
    }

    pub fn limiters(&self) -> &Arc<ProviderLimiters> {
        &self.limiters
    }

    /// Run the full beam search for one user prompt.
    pub async fn run(
        &self,
        user_prompt: &str,
        observer: &dyn RunObserver,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let ctx = EngineContext {
            text: self.providers.text.clone(),
            image: self.providers.image.clone(),
            evaluator: self.providers.evaluator.clone(),
            judge: self.providers.judge.clone(),
            critic: self.providers.critic.clone(),
            metadata: self.providers.metadata.clone(),
            progress: self.providers.progress.clone(),
            observer,
            limiters: self.limiters.clone(),
            config: self.config.clone(),
            tokens: AtomicU64::new(0),
        };

        let floor_rank = ctx.config.beam_width;
        let keep_top = ctx.config.keep_top as usize;
        let mut graph = ComparisonGraph::new();
        let mut all_global_ranked: Vec<Candidate> = Vec::new();

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        debug!(
            beam_width = ctx.config.beam_width,
            keep_top = ctx.config.keep_top,
            max_iterations = ctx.config.max_iterations,
            comparative = ctx.judge.is_some(),
            "starting beam search"
        );

        let pool = run_initial_expansion(&ctx, user_prompt, &cancel).await?;
        let attempted = ctx.config.beam_width;
        debug!(
            iteration = 0,
            attempted,
            succeeded = pool.len(),
            "initial expansion complete"
        );

        let mut ranked = self
            .rank_pool(&ctx, &mut graph, pool, &[], user_prompt, &cancel)
            .await?;
        assign_global_ranks(&mut ranked, &[], floor_rank, 0);
        merge_global_ranks(&mut all_global_ranked, &ranked);
        ctx.publish(
            ProgressEvent::new(
                ProgressStage::Ranking,
                ProgressStatus::Complete,
                "iteration 0 ranking complete",
            )
            .with_iteration(0),
        );
        observer.on_ranking_complete(0, &ranked);

        let mut parents: Vec<Candidate> = ranked.iter().take(keep_top).cloned().collect();
        self.apply_photoreal_pass(&ctx, &mut parents, &cancel).await?;
        observer.on_iteration_complete(0, &parents);

        for iteration in 1..ctx.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let children =
                run_refinement_iteration(&ctx, user_prompt, iteration, &parents, &cancel).await?;
            debug!(
                iteration,
                attempted,
                succeeded = children.len(),
                "refinement iteration complete"
            );

            // Parents stay eligible to win: pool them with their children.
            let prior_parents = parents.clone();
            let mut pool = parents;
            pool.extend(children);

            let mut ranked = self
                .rank_pool(&ctx, &mut graph, pool, &prior_parents, user_prompt, &cancel)
                .await?;
            assign_global_ranks(&mut ranked, &prior_parents, floor_rank, iteration);
            merge_global_ranks(&mut all_global_ranked, &ranked);
            ctx.publish(
                ProgressEvent::new(
                    ProgressStage::Ranking,
                    ProgressStatus::Complete,
                    format!("iteration {iteration} ranking complete"),
                )
                .with_iteration(iteration),
            );
            observer.on_ranking_complete(iteration, &ranked);

            parents = ranked.iter().take(keep_top).cloned().collect();
            self.apply_photoreal_pass(&ctx, &mut parents, &cancel).await?;
            observer.on_iteration_complete(iteration, &parents);
        }

        sort_for_display(&mut all_global_ranked);

        let winner = parents
            .first()
            .cloned()
            .ok_or_else(|| EngineError::provider("beam search produced no survivors"))?;
        if let Err(err) = ctx
            .metadata
            .mark_final_winner(winner.id, winner.total_score)
            .await
        {
            warn!(winner = %winner.id, error = %err, "failed to record final winner");
        }

        debug!(winner = %winner.id, tokens_used = ctx.tokens_used(), "beam search complete");

        Ok(RunOutcome {
            winner,
            finalists: parents,
            all_global_ranked,
            iterations_run: ctx.config.max_iterations,
            tokens_used: ctx.tokens_used(),
        })
    }

    async fn rank_pool(
        &self,
        ctx: &EngineContext<'_>,
        graph: &mut ComparisonGraph,
        pool: Vec<Candidate>,
        previous_top: &[Candidate],
        user_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>, EngineError> {
        match &ctx.judge {
            Some(judge) => {
                let outcome = rank_comparative(
                    ctx,
                    judge,
                    graph,
                    pool,
                    previous_top,
                    user_prompt,
                    cancel,
                )
                .await?;
                ctx.add_tokens(outcome.tokens_used);
                if !outcome.errors.is_empty() {
                    warn!(
                        failures = outcome.errors.len(),
                        "pairwise ranking completed with tolerated failures"
                    );
                }
                Ok(outcome.ranked)
            }
            None => Ok(rank_by_score(pool)),
        }
    }

    /// Optional second-stage pass on the iteration winner. Failure keeps
    /// the first-stage image; only cancellation propagates.
    async fn apply_photoreal_pass(
        &self,
        ctx: &EngineContext<'_>,
        parents: &mut [Candidate],
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let Some(pass) = &ctx.config.photoreal_pass else {
            return Ok(());
        };
        let Some(winner) = parents.first_mut() else {
            return Ok(());
        };

        let options = ImageOptions {
            candidate: Some(winner.id),
            model: Some(pass.model.clone()),
            input_image: Some(winner.image.clone()),
            denoise_strength: Some(pass.denoise_strength),
            session_id: ctx.config.session_id.clone(),
            ..ImageOptions::default()
        };
        let prompt = winner.combined.clone();

        let result = ctx
            .limiters
            .image
            .execute(cancel, async {
                ctx.image.generate(&prompt, options, cancel.clone()).await
            })
            .await;

        match result {
            Ok(image) => {
                ctx.publish(
                    ProgressEvent::new(
                        ProgressStage::ImageGen,
                        ProgressStatus::Complete,
                        "photoreal pass complete",
                    )
                    .with_candidate(winner.id),
                );
                winner.image = image;
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => {
                warn!(winner = %winner.id, error = %err, "photoreal pass failed");
                ctx.publish(
                    ProgressEvent::new(
                        ProgressStage::Error,
                        ProgressStatus::Failed,
                        err.to_string(),
                    )
                    .with_candidate(winner.id),
                );
            }
        }
        Ok(())
    }
}
