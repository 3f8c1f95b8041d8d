//! The per-candidate pipeline: combine → defensive record → image
//! generation with the one-shot safety retry → optional vision analysis →
//! defensive update.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use atelier_core::{
    total_score, Candidate, CandidateId, Dimension, EngineError, ImageArtifact, ProgressEvent,
    ProgressStage, ProgressStatus, PromptPair,
};

use crate::context::EngineContext;
use crate::provider::{AttemptRecord, AttemptResults, ImageOptions};
use crate::safety;

/// Run one candidate through the full pipeline and return it fully
/// populated (no ranking or global rank yet).
///
/// Stages run strictly sequentially; the cancel token is checked at every
/// stage boundary and inside every limiter acquisition.
pub(crate) async fn run_candidate(
    ctx: &EngineContext<'_>,
    id: CandidateId,
    parent_id: Option<u32>,
    dimension: Dimension,
    prompts: PromptPair,
    cancel: &CancellationToken,
) -> Result<Candidate, EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    ctx.publish(
        ProgressEvent::new(
            ProgressStage::Combine,
            ProgressStatus::Starting,
            "combining prompt dimensions",
        )
        .with_candidate(id),
    );

    let combined = ctx
        .limiters
        .text
        .execute(cancel, async {
            ctx.text
                .combine(&prompts.what, &prompts.how, cancel.clone())
                .await
        })
        .await?;
    ctx.add_tokens(combined.tokens_used);

    ctx.publish(
        ProgressEvent::new(
            ProgressStage::Combine,
            ProgressStatus::Complete,
            "combined prompt ready",
        )
        .with_candidate(id),
    );

    // Persist the attempt before any image call so a later failure still
    // leaves a trace. A sink failure is logged, never fatal.
    let attempt = AttemptRecord {
        id,
        parent_id,
        dimension,
        what: prompts.what.clone(),
        how: prompts.how.clone(),
    };
    if let Err(err) = ctx.metadata.record_attempt(attempt).await {
        warn!(candidate = %id, error = %err, "failed to record attempt metadata");
    }

    ctx.publish(
        ProgressEvent::new(
            ProgressStage::ImageGen,
            ProgressStatus::Starting,
            "generating image",
        )
        .with_candidate(id),
    );

    let image = generate_with_safety_retry(ctx, id, dimension, &combined.text, cancel).await?;

    let mut complete = ProgressEvent::new(
        ProgressStage::ImageGen,
        ProgressStatus::Complete,
        "image generated",
    )
    .with_candidate(id);
    if let Some(locator) = image.locator() {
        complete = complete.with_image_url(locator);
    }
    ctx.publish(complete);

    let (evaluation, score) = if !ctx.skip_vision_analysis() {
        match &ctx.evaluator {
            Some(evaluator) => {
                ctx.publish(
                    ProgressEvent::new(
                        ProgressStage::Vision,
                        ProgressStatus::Starting,
                        "analyzing image",
                    )
                    .with_candidate(id),
                );

                let evaluation = ctx
                    .limiters
                    .vision
                    .execute(cancel, async {
                        evaluator
                            .analyze(&image, &combined.text, cancel.clone())
                            .await
                    })
                    .await?;
                ctx.add_tokens(evaluation.tokens_used);

                let score = total_score(
                    evaluation.alignment_score,
                    evaluation.aesthetic_score,
                    ctx.config.alpha,
                );
                ctx.publish(
                    ProgressEvent::new(
                        ProgressStage::Vision,
                        ProgressStatus::Complete,
                        "image analyzed",
                    )
                    .with_candidate(id)
                    .with_scores(
                        evaluation.alignment_score,
                        evaluation.aesthetic_score,
                        score,
                    ),
                );

                (Some(evaluation), Some(score))
            }
            None => (None, None),
        }
    } else {
        (None, None)
    };

    let results = AttemptResults {
        combined: combined.text.clone(),
        image: image.clone(),
        evaluation: evaluation.clone(),
        total_score: score,
    };
    if let Err(err) = ctx.metadata.update_attempt(id, results).await {
        warn!(candidate = %id, error = %err, "failed to update attempt metadata");
    }

    debug!(candidate = %id, total_score = ?score, "candidate pipeline complete");

    Ok(Candidate {
        id,
        parent_id,
        dimension,
        what: prompts.what,
        how: prompts.how,
        combined: combined.text,
        image,
        evaluation,
        ranking: None,
        total_score: score,
        global_rank: None,
        global_rank_note: None,
    })
}

/// Generate an image, retrying exactly once through the rephrase path when
/// the failure is a recognized safety rejection. Non-safety errors
/// propagate untouched; if the retry still fails, the *original* violation
/// is surfaced.
async fn generate_with_safety_retry(
    ctx: &EngineContext<'_>,
    id: CandidateId,
    dimension: Dimension,
    combined: &str,
    cancel: &CancellationToken,
) -> Result<ImageArtifact, EngineError> {
    let options = ImageOptions {
        candidate: Some(id),
        dimension: Some(dimension),
        session_id: ctx.config.session_id.clone(),
        ..ImageOptions::default()
    };

    let first = ctx
        .limiters
        .image
        .execute(cancel, async {
            ctx.image
                .generate(combined, options.clone(), cancel.clone())
                .await
        })
        .await;

    let err = match first {
        Ok(image) => return Ok(image),
        Err(err) => err,
    };
    if err.is_cancelled() {
        return Err(err);
    }
    let Some(rejection) = safety::classify(&err) else {
        return Err(err);
    };

    warn!(
        candidate = %id,
        category = ?rejection.category,
        "image prompt rejected by safety filter, attempting rephrase"
    );
    ctx.publish(
        ProgressEvent::new(
            ProgressStage::Safety,
            ProgressStatus::Rephrasing,
            "rephrasing prompt after safety rejection",
        )
        .with_candidate(id),
    );

    let (message, text_options) = safety::rephrase_request(combined, rejection.category.as_deref());
    let rephrased = ctx
        .limiters
        .text
        .execute(cancel, async {
            ctx.text
                .generate_text(&message, text_options, cancel.clone())
                .await
        })
        .await;

    let rephrased = match rephrased {
        Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
        Err(rephrase_err) => {
            warn!(candidate = %id, error = %rephrase_err, "safety rephrase failed");
            ctx.publish(
                ProgressEvent::new(
                    ProgressStage::Safety,
                    ProgressStatus::Failed,
                    "safety rephrase failed",
                )
                .with_candidate(id),
            );
            return Err(rejection.into_error());
        }
        Ok(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                ctx.publish(
                    ProgressEvent::new(
                        ProgressStage::Safety,
                        ProgressStatus::Failed,
                        "safety rephrase returned an empty prompt",
                    )
                    .with_candidate(id),
                );
                return Err(rejection.into_error());
            }
            trimmed.to_string()
        }
    };

    ctx.publish(
        ProgressEvent::new(
            ProgressStage::Safety,
            ProgressStatus::Retrying,
            "retrying image generation with rephrased prompt",
        )
        .with_candidate(id),
    );

    let second = ctx
        .limiters
        .image
        .execute(cancel, async {
            ctx.image
                .generate(&rephrased, options.clone(), cancel.clone())
                .await
        })
        .await;

    match second {
        Ok(mut image) => {
            image.metadata.safety_rephrased = true;
            image.metadata.original_prompt = Some(combined.to_string());
            image.metadata.rephrased_prompt = Some(rephrased);
            ctx.publish(
                ProgressEvent::new(
                    ProgressStage::Safety,
                    ProgressStatus::Success,
                    "rephrased prompt generated successfully",
                )
                .with_candidate(id),
            );
            Ok(image)
        }
        Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
        Err(retry_err) => {
            warn!(candidate = %id, error = %retry_err, "safety retry failed");
            ctx.publish(
                ProgressEvent::new(
                    ProgressStage::Safety,
                    ProgressStatus::Failed,
                    "safety retry failed",
                )
                .with_candidate(id),
            );
            Err(rejection.into_error())
        }
    }
}
