// src/ranking.rs
//
// Leaderboard helpers over a points map. Sorting is stable, so members with
// equal points keep the order in which they entered the ledger.

use crate::error::{KujiError, KujiResult};
use crate::models::{MemberKey, PointsMap, Rank, RankEntry};

/// Members that appear on a leaderboard.
pub const DEFAULT_LEADERBOARD_SIZE: usize = 10;

fn sorted_desc(points: &PointsMap) -> Vec<&(String, i64)> {
    let mut sorted: Vec<&(String, i64)> = points.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    sorted
}

pub fn top_n(points: &PointsMap, n: usize) -> Vec<RankEntry> {
    sorted_desc(points)
        .into_iter()
        .take(n)
        .map(|(member_id, points)| RankEntry {
            member_id: member_id.clone(),
            points: *points,
        })
        .collect()
}

/// `NotFound` only when the member has no entry at all; a 0-point entry ranks.
pub fn rank_of(points: &PointsMap, key: &MemberKey) -> KujiResult<Rank> {
    let sorted = sorted_desc(points);
    sorted
        .iter()
        .position(|(member_id, _)| *member_id == key.member_id)
        .map(|index| Rank {
            rank: index + 1,
            points: sorted[index].1,
            participants: sorted.len(),
        })
        .ok_or_else(|| KujiError::NotFound { key: key.clone() })
}
