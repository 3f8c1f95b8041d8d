//! Iteration 0: expand the user's prompt into `beam_width` seed candidates
//! along the `what` and `how` dimensions, then run each through the
//! candidate pipeline.

use futures::future::{join_all, try_join};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use atelier_core::{
    Candidate, CandidateId, Dimension, EngineError, ProgressEvent, ProgressStage, ProgressStatus,
    PromptPair,
};

use crate::context::EngineContext;
use crate::pipeline::run_candidate;

pub(crate) async fn run_initial_expansion(
    ctx: &EngineContext<'_>,
    user_prompt: &str,
    cancel: &CancellationToken,
) -> Result<Vec<Candidate>, EngineError> {
    let attempted = ctx.config.beam_width;
    let slots = join_all((0..attempted).map(|local| {
        let id = CandidateId::new(0, local);
        async move {
            match expand_candidate(ctx, user_prompt, id, cancel).await {
                Ok(candidate) => {
                    // Fires as each candidate finishes, not at batch end.
                    ctx.observer.on_candidate_processed(&candidate);
                    Ok(Some(candidate))
                }
                Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
                Err(err) => {
                    warn!(candidate = %id, error = %err, "seed candidate failed");
                    ctx.publish(
                        ProgressEvent::new(
                            ProgressStage::Error,
                            ProgressStatus::Failed,
                            err.to_string(),
                        )
                        .with_candidate(id),
                    );
                    Ok(None)
                }
            }
        }
    }))
    .await;

    collect_iteration(slots, 0, attempted)
}

async fn expand_candidate(
    ctx: &EngineContext<'_>,
    user_prompt: &str,
    id: CandidateId,
    cancel: &CancellationToken,
) -> Result<Candidate, EngineError> {
    ctx.publish(
        ProgressEvent::new(
            ProgressStage::Expand,
            ProgressStatus::Starting,
            "expanding user prompt",
        )
        .with_candidate(id),
    );

    let temperature = ctx.config.temperature;
    let (what, how) = try_join(
        ctx.limiters.text.execute(cancel, async {
            ctx.text
                .expand(user_prompt, Dimension::What, temperature, cancel.clone())
                .await
        }),
        ctx.limiters.text.execute(cancel, async {
            ctx.text
                .expand(user_prompt, Dimension::How, temperature, cancel.clone())
                .await
        }),
    )
    .await?;
    ctx.add_tokens(what.tokens_used);
    ctx.add_tokens(how.tokens_used);

    ctx.publish(
        ProgressEvent::new(
            ProgressStage::Expand,
            ProgressStatus::Complete,
            "prompt expanded",
        )
        .with_candidate(id),
    );

    run_candidate(
        ctx,
        id,
        None,
        Dimension::What,
        PromptPair::new(what.text, how.text),
        cancel,
    )
    .await
}

/// Fold per-candidate slot results into the iteration outcome: cancellation
/// propagates, isolated failures are dropped, and an iteration with zero
/// successes fails as a whole.
pub(crate) fn collect_iteration(
    slots: Vec<Result<Option<Candidate>, EngineError>>,
    iteration: u32,
    attempted: u32,
) -> Result<Vec<Candidate>, EngineError> {
    let mut out = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Err(err) => return Err(err),
            Ok(Some(candidate)) => out.push(candidate),
            Ok(None) => {}
        }
    }
    if out.is_empty() {
        return Err(EngineError::AllCandidatesFailed {
            iteration,
            attempted,
        });
    }
    Ok(out)
}
