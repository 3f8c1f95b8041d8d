//! Candidate ranking: score sort (Mode A) or pairwise comparative ranking
//! over a transitive comparison graph (Mode B).
//!
//! The graph is run-local and accumulates across iterations, so a pair
//! whose order is already established (seeded from prior parents or decided
//! by an earlier judge call) is never re-issued to the judge.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use atelier_core::{
    Candidate, CandidateId, EngineError, ProgressEvent, ProgressStage, ProgressStatus, Ranking,
};

use crate::context::EngineContext;
use crate::provider::{PairDecision, PairWinner, PairwiseJudge};

/// Directed graph of decided comparisons: an edge points winner → loser,
/// and "A beats B" is known whenever a directed path connects them.
#[derive(Debug, Default)]
pub struct ComparisonGraph {
    graph: DiGraph<CandidateId, ()>,
    nodes: HashMap<CandidateId, NodeIndex>,
}

impl ComparisonGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, id: CandidateId) -> NodeIndex {
        match self.nodes.get(&id) {
            Some(index) => *index,
            None => {
                let index = self.graph.add_node(id);
                self.nodes.insert(id, index);
                index
            }
        }
    }

    pub fn record(&mut self, winner: CandidateId, loser: CandidateId) {
        let winner = self.node(winner);
        let loser = self.node(loser);
        self.graph.update_edge(winner, loser, ());
    }

    /// The transitively known winner between `a` and `b`, if any.
    pub fn known_winner(&self, a: CandidateId, b: CandidateId) -> Option<CandidateId> {
        let (na, nb) = (self.nodes.get(&a)?, self.nodes.get(&b)?);
        if has_path_connecting(&self.graph, *na, *nb, None) {
            Some(a)
        } else if has_path_connecting(&self.graph, *nb, *na, None) {
            Some(b)
        } else {
            None
        }
    }

    /// How many of the other pool members `id` transitively beats.
    pub fn wins_among(&self, id: CandidateId, pool: &[CandidateId]) -> u32 {
        let Some(from) = self.nodes.get(&id) else {
            return 0;
        };
        pool.iter()
            .filter(|other| **other != id)
            .filter(|other| {
                self.nodes
                    .get(other)
                    .is_some_and(|to| has_path_connecting(&self.graph, *from, *to, None))
            })
            .count() as u32
    }
}

/// Output of one comparative ranking step: the full pool in rank order plus
/// judge token usage and any per-pair failures tolerated under graceful
/// degradation.
pub(crate) struct RankingOutcome {
    pub ranked: Vec<Candidate>,
    pub tokens_used: u32,
    pub errors: Vec<String>,
}

/// Mode A: stable sort by `total_score` descending, ties by ascending id.
pub(crate) fn rank_by_score(mut pool: Vec<Candidate>) -> Vec<Candidate> {
    pool.sort_by(|a, b| {
        let a_score = a.total_score.unwrap_or(f32::NEG_INFINITY);
        let b_score = b.total_score.unwrap_or(f32::NEG_INFINITY);
        b_score
            .partial_cmp(&a_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    pool
}

/// Mode B: pairwise comparative ranking.
///
/// All-pairs when the pool holds at most eight candidates, a knockout
/// bracket above that. Both strategies close the graph under transitivity
/// so known pairs are inferred instead of re-asked.
pub(crate) async fn rank_comparative(
    ctx: &EngineContext<'_>,
    judge: &Arc<dyn PairwiseJudge>,
    graph: &mut ComparisonGraph,
    mut pool: Vec<Candidate>,
    previous_top: &[Candidate],
    user_prompt: &str,
    cancel: &CancellationToken,
) -> Result<RankingOutcome, EngineError> {
    // Prior parents arrive already ordered by rank; their relative order is
    // established and must not be re-asked.
    for (i, better) in previous_top.iter().enumerate() {
        for worse in &previous_top[i + 1..] {
            graph.record(better.id, worse.id);
        }
    }

    pool.sort_by_key(|candidate| candidate.id);
    let ids: Vec<CandidateId> = pool.iter().map(|candidate| candidate.id).collect();
    let by_id: HashMap<CandidateId, usize> =
        ids.iter().enumerate().map(|(index, id)| (*id, index)).collect();

    let mut tokens_used = 0u32;
    let mut errors = Vec::new();
    let mut reasons: HashMap<CandidateId, String> = HashMap::new();

    if pool.len() <= ALL_PAIRS_THRESHOLD {
        rank_all_pairs(
            ctx,
            judge,
            graph,
            &pool,
            user_prompt,
            cancel,
            &mut tokens_used,
            &mut errors,
            &mut reasons,
        )
        .await?;
    } else {
        rank_tournament(
            ctx,
            judge,
            graph,
            &pool,
            &by_id,
            user_prompt,
            cancel,
            &mut tokens_used,
            &mut errors,
            &mut reasons,
        )
        .await?;
    }

    // Total order: transitive win count descending, ties by ascending id.
    let mut order: Vec<(CandidateId, u32)> = ids
        .iter()
        .map(|id| (*id, graph.wins_among(*id, &ids)))
        .collect();
    order.sort_by(|(a_id, a_wins), (b_id, b_wins)| {
        b_wins.cmp(a_wins).then_with(|| a_id.cmp(b_id))
    });

    let mut by_id_candidates: HashMap<CandidateId, Candidate> =
        pool.into_iter().map(|candidate| (candidate.id, candidate)).collect();
    let mut ranked = Vec::with_capacity(order.len());
    for (position, (id, wins)) in order.iter().enumerate() {
        let mut candidate = by_id_candidates
            .remove(id)
            .ok_or_else(|| EngineError::provider("ranking lost a candidate"))?;
        candidate.ranking = Some(Ranking {
            rank: position as u32 + 1,
            reason: reasons.get(id).cloned(),
            wins: Some(*wins),
        });
        ranked.push(candidate);
    }

    Ok(RankingOutcome {
        ranked,
        tokens_used,
        errors,
    })
}

const ALL_PAIRS_THRESHOLD: usize = 8;

#[allow(clippy::too_many_arguments)]
async fn rank_all_pairs(
    ctx: &EngineContext<'_>,
    judge: &Arc<dyn PairwiseJudge>,
    graph: &mut ComparisonGraph,
    pool: &[Candidate],
    user_prompt: &str,
    cancel: &CancellationToken,
    tokens_used: &mut u32,
    errors: &mut Vec<String>,
    reasons: &mut HashMap<CandidateId, String>,
) -> Result<(), EngineError> {
    let n = pool.len();
    let total = (n * (n - 1) / 2) as u32;
    let mut completed = 0u32;

    for i in 0..n {
        for j in i + 1..n {
            let (a, b) = (&pool[i], &pool[j]);
            completed += 1;

            if graph.known_winner(a.id, b.id).is_some() {
                ctx.publish(
                    ProgressEvent::new(
                        ProgressStage::Ranking,
                        ProgressStatus::Progress,
                        "pair resolved from comparison graph",
                    )
                    .with_pair(a.id, b.id)
                    .with_progress(completed, total)
                    .inferred(),
                );
                continue;
            }

            match decide_pair(ctx, judge, a, b, user_prompt, cancel).await {
                Ok(decision) => {
                    *tokens_used += decision.tokens_used;
                    apply_decision(graph, reasons, a.id, b.id, &decision);
                    ctx.publish(
                        ProgressEvent::new(
                            ProgressStage::Ranking,
                            ProgressStatus::Progress,
                            "pair compared",
                        )
                        .with_pair(a.id, b.id)
                        .with_progress(completed, total),
                    );
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) if ctx.config.graceful_degradation => {
                    warn!(a = %a.id, b = %b.id, error = %err, "pair comparison failed");
                    errors.push(format!("{} vs {}: {err}", a.id, b.id));
                    ctx.publish(
                        ProgressEvent::new(
                            ProgressStage::Ranking,
                            ProgressStatus::Failed,
                            err.to_string(),
                        )
                        .with_pair(a.id, b.id)
                        .with_progress(completed, total),
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn rank_tournament(
    ctx: &EngineContext<'_>,
    judge: &Arc<dyn PairwiseJudge>,
    graph: &mut ComparisonGraph,
    pool: &[Candidate],
    by_id: &HashMap<CandidateId, usize>,
    user_prompt: &str,
    cancel: &CancellationToken,
    tokens_used: &mut u32,
    errors: &mut Vec<String>,
    reasons: &mut HashMap<CandidateId, String>,
) -> Result<(), EngineError> {
    // A knockout needs exactly n - 1 matches; byes don't count.
    let total = (pool.len() - 1) as u32;
    let mut completed = 0u32;

    let mut entrants: Vec<CandidateId> = pool.iter().map(|candidate| candidate.id).collect();
    while entrants.len() > 1 {
        let mut next = Vec::with_capacity(entrants.len().div_ceil(2));
        for pair in entrants.chunks(2) {
            let (a_id, b_id) = match pair {
                [single] => {
                    next.push(*single);
                    continue;
                }
                [a, b] => (*a, *b),
                _ => unreachable!("chunks(2) yields one or two ids"),
            };
            completed += 1;

            if let Some(winner) = graph.known_winner(a_id, b_id) {
                ctx.publish(
                    ProgressEvent::new(
                        ProgressStage::Ranking,
                        ProgressStatus::Progress,
                        "match resolved from comparison graph",
                    )
                    .with_pair(a_id, b_id)
                    .with_progress(completed, total)
                    .inferred(),
                );
                next.push(winner);
                continue;
            }

            let a = &pool[by_id[&a_id]];
            let b = &pool[by_id[&b_id]];
            match decide_pair(ctx, judge, a, b, user_prompt, cancel).await {
                Ok(decision) => {
                    *tokens_used += decision.tokens_used;
                    let winner = match decision.winner {
                        PairWinner::A => a_id,
                        PairWinner::B => b_id,
                    };
                    apply_decision(graph, reasons, a_id, b_id, &decision);
                    next.push(winner);
                    ctx.publish(
                        ProgressEvent::new(
                            ProgressStage::Ranking,
                            ProgressStatus::Progress,
                            "match compared",
                        )
                        .with_pair(a_id, b_id)
                        .with_progress(completed, total),
                    );
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) if ctx.config.graceful_degradation => {
                    warn!(a = %a_id, b = %b_id, error = %err, "match comparison failed");
                    errors.push(format!("{a_id} vs {b_id}: {err}"));
                    ctx.publish(
                        ProgressEvent::new(
                            ProgressStage::Ranking,
                            ProgressStatus::Failed,
                            err.to_string(),
                        )
                        .with_pair(a_id, b_id)
                        .with_progress(completed, total),
                    );
                    // The pair stays unknown; the bracket advances the
                    // ascending-id operand so the round still resolves.
                    next.push(a_id.min(b_id));
                }
                Err(err) => return Err(err),
            }
        }
        entrants = next;
    }

    Ok(())
}

/// One judged pair, optionally as an ensemble decided by majority. A split
/// vote with an even ensemble goes to operand A (the lower id).
async fn decide_pair(
    ctx: &EngineContext<'_>,
    judge: &Arc<dyn PairwiseJudge>,
    a: &Candidate,
    b: &Candidate,
    user_prompt: &str,
    cancel: &CancellationToken,
) -> Result<PairDecision, EngineError> {
    let votes = join_all((0..ctx.config.ensemble_size).map(|_| {
        ctx.limiters.vision.execute(cancel, async {
            judge
                .compare(&a.image, &b.image, user_prompt, cancel.clone())
                .await
        })
    }))
    .await;

    let mut decided = Vec::with_capacity(votes.len());
    let mut last_err = None;
    for vote in votes {
        match vote {
            Ok(decision) => decided.push(decision),
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => last_err = Some(err),
        }
    }
    if decided.is_empty() {
        return Err(last_err.unwrap_or_else(|| EngineError::provider("pairwise judge failed")));
    }

    let tokens_used = decided.iter().map(|decision| decision.tokens_used).sum();
    let a_votes = decided
        .iter()
        .filter(|decision| decision.winner == PairWinner::A)
        .count();
    let winner = if a_votes * 2 >= decided.len() {
        PairWinner::A
    } else {
        PairWinner::B
    };
    let representative = decided
        .iter()
        .find(|decision| decision.winner == winner)
        .unwrap_or(&decided[0]);

    Ok(PairDecision {
        winner,
        reason: representative.reason.clone(),
        confidence: representative.confidence,
        tokens_used,
    })
}

fn apply_decision(
    graph: &mut ComparisonGraph,
    reasons: &mut HashMap<CandidateId, String>,
    a: CandidateId,
    b: CandidateId,
    decision: &PairDecision,
) {
    let (winner, loser) = match decision.winner {
        PairWinner::A => (a, b),
        PairWinner::B => (b, a),
    };
    graph.record(winner, loser);
    reasons.insert(winner, decision.reason.clone());
}
