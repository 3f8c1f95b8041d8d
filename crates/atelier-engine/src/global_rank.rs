//! Stable cross-iteration ranks.
//!
//! Each iteration's within-iteration ranking is converted into global
//! ranks: candidates at or above the worst surviving parent are numbered
//! sequentially, while children that lost to every parent collapse into a
//! single floor equivalence class so they never appear ahead of prior
//! losers.

use std::collections::HashSet;

use atelier_core::{Candidate, CandidateId, GlobalRankNote};

/// Assign global ranks to one iteration's ranking, in place.
///
/// `ranked` must be sorted by within-iteration rank (best first);
/// `parents` is the previous iteration's survivor set, empty for
/// iteration 0; `floor_rank` is the beam width N.
///
/// Idempotent: re-running on the same inputs writes identical output.
pub fn assign_global_ranks(
    ranked: &mut [Candidate],
    parents: &[Candidate],
    floor_rank: u32,
    iteration: u32,
) {
    if iteration == 0 || parents.is_empty() {
        assign_sequential(ranked);
        return;
    }

    let parent_ids: HashSet<CandidateId> = parents.iter().map(|parent| parent.id).collect();
    let Some(worst_parent_position) = ranked
        .iter()
        .rposition(|candidate| parent_ids.contains(&candidate.id))
    else {
        // No parent survived into the ranking at all; nothing anchors the
        // floor, so fall back to sequential ranks.
        assign_sequential(ranked);
        return;
    };

    let mut counter = 1u32;
    for (position, candidate) in ranked.iter_mut().enumerate() {
        if parent_ids.contains(&candidate.id) || position <= worst_parent_position {
            candidate.global_rank = Some(counter);
            candidate.global_rank_note = None;
            counter += 1;
        } else {
            candidate.global_rank = Some(floor_rank);
            candidate.global_rank_note = Some(GlobalRankNote::TiedAtFloor);
        }
    }
}

fn assign_sequential(ranked: &mut [Candidate]) {
    for (position, candidate) in ranked.iter_mut().enumerate() {
        candidate.global_rank = Some(position as u32 + 1);
        candidate.global_rank_note = None;
    }
}

/// Merge one iteration's output into the cross-run leaderboard, dropping
/// any candidate the new ranking re-ranked.
pub fn merge_global_ranks(all: &mut Vec<Candidate>, newly_ranked: &[Candidate]) {
    all.retain(|existing| {
        !newly_ranked
            .iter()
            .any(|candidate| candidate.id == existing.id)
    });
    all.extend_from_slice(newly_ranked);
}

/// Order the leaderboard for display: ascending global rank, ties by
/// ascending id.
pub fn sort_for_display(all: &mut [Candidate]) {
    all.sort_by(|a, b| {
        a.global_rank
            .unwrap_or(u32::MAX)
            .cmp(&b.global_rank.unwrap_or(u32::MAX))
            .then_with(|| a.id.cmp(&b.id))
    });
}
