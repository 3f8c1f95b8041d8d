//! Refinement iterations: one critique per surviving parent, then
//! `beam_width / keep_top` children per parent with the iteration's
//! dimension refined and the other inherited verbatim.

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use atelier_core::{
    Candidate, CandidateId, Dimension, EngineError, ProgressEvent, ProgressStage, ProgressStatus,
    PromptPair,
};

use crate::context::EngineContext;
use crate::expand::collect_iteration;
use crate::pipeline::run_candidate;
use crate::provider::{CritiqueOutput, CritiqueRequest, ParentFeedback};

pub(crate) async fn run_refinement_iteration(
    ctx: &EngineContext<'_>,
    user_prompt: &str,
    iteration: u32,
    parents: &[Candidate],
    cancel: &CancellationToken,
) -> Result<Vec<Candidate>, EngineError> {
    let dimension = Dimension::for_iteration(iteration);
    let ratio = ctx.config.expansion_ratio();
    let attempted = ctx.config.beam_width;

    let critiques = join_all(parents.iter().map(|parent| async move {
        let request = CritiqueRequest {
            feedback: parent_feedback(parent),
            what: parent.what.clone(),
            how: parent.how.clone(),
            combined: parent.combined.clone(),
            user_prompt: user_prompt.to_string(),
            dimension,
            iteration,
        };
        let out = ctx
            .limiters
            .text
            .execute(cancel, async { ctx.critic.critique(request, cancel.clone()).await })
            .await?;
        ctx.add_tokens(out.tokens_used);
        Ok::<_, EngineError>(out)
    }))
    .await;

    if critiques.iter().any(|c| matches!(c, Err(err) if err.is_cancelled())) {
        return Err(EngineError::Cancelled);
    }

    let slots = join_all(parents.iter().enumerate().flat_map(|(parent_index, parent)| {
        let critique = &critiques[parent_index];
        (0..ratio).map(move |child_index| {
            let local = parent_index as u32 * ratio + child_index;
            let id = CandidateId::new(iteration, local);
            async move {
                let critique = match critique {
                    Ok(critique) => critique,
                    Err(err) => {
                        // The critique failed, so every child of this parent
                        // fails with it; the iteration continues.
                        warn!(
                            candidate = %id,
                            parent = %parent.id,
                            error = %err,
                            "critique failed, skipping child"
                        );
                        ctx.publish(
                            ProgressEvent::new(
                                ProgressStage::Error,
                                ProgressStatus::Failed,
                                err.to_string(),
                            )
                            .with_candidate(id),
                        );
                        return Ok(None);
                    }
                };

                match refine_candidate(ctx, user_prompt, id, parent, dimension, critique, cancel)
                    .await
                {
                    Ok(candidate) => {
                        ctx.observer.on_candidate_processed(&candidate);
                        Ok(Some(candidate))
                    }
                    Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
                    Err(err) => {
                        warn!(candidate = %id, error = %err, "child candidate failed");
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
        })
    }))
    .await;

    collect_iteration(slots, iteration, attempted)
}

async fn refine_candidate(
    ctx: &EngineContext<'_>,
    user_prompt: &str,
    id: CandidateId,
    parent: &Candidate,
    dimension: Dimension,
    critique: &CritiqueOutput,
    cancel: &CancellationToken,
) -> Result<Candidate, EngineError> {
    ctx.publish(
        ProgressEvent::new(
            ProgressStage::Expand,
            ProgressStatus::Starting,
            format!("refining {} dimension", dimension.as_str()),
        )
        .with_candidate(id),
    );

    let current = match dimension {
        Dimension::What => parent.what.as_str(),
        Dimension::How => parent.how.as_str(),
    };
    let refined = ctx
        .limiters
        .text
        .execute(cancel, async {
            ctx.text
                .refine(current, dimension, &critique.critique, user_prompt, cancel.clone())
                .await
        })
        .await?;
    ctx.add_tokens(refined.tokens_used);

    ctx.publish(
        ProgressEvent::new(
            ProgressStage::Expand,
            ProgressStatus::Complete,
            "dimension refined",
        )
        .with_candidate(id),
    );

    let prompts = match dimension {
        Dimension::What => PromptPair::new(refined.text, parent.how.clone()),
        Dimension::How => PromptPair::new(parent.what.clone(), refined.text),
    };

    run_candidate(ctx, id, Some(parent.id.local), dimension, prompts, cancel).await
}

/// The parent's most recent feedback: its within-iteration ranking when
/// comparative mode produced one, otherwise its evaluation.
fn parent_feedback(parent: &Candidate) -> Option<ParentFeedback> {
    if let Some(ranking) = &parent.ranking {
        return Some(ParentFeedback::Ranking(ranking.clone()));
    }
    parent
        .evaluation
        .as_ref()
        .map(|evaluation| ParentFeedback::Evaluation(evaluation.clone()))
}
