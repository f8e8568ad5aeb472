// src/models.rs
//
// Shared data types passed between the draw engine, the ledger, the ranking
// helpers and the dispatcher-facing service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Guild / server identifier as handed over by the dispatcher.
pub type CommunityId = String;
/// User identifier, unique within the chat platform.
pub type MemberId = String;
/// Signed point amount. Unlucky tiers carry negative deltas.
pub type Points = i64;

/// Points per member in insertion order (first ledger appearance first).
pub type PointsMap = Vec<(MemberId, Points)>;

/// The (community, member) pair every cooldown and ledger entry is keyed on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberKey {
    pub community_id: CommunityId,
    pub member_id: MemberId,
}

impl MemberKey {
    pub fn new(community_id: impl Into<CommunityId>, member_id: impl Into<MemberId>) -> Self {
        Self {
            community_id: community_id.into(),
            member_id: member_id.into(),
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.community_id, self.member_id)
    }
}

/// Per-member ledger entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberRecord {
    /// Stamped when a draw is admitted, before its outcome is applied
    pub last_draw: Option<DateTime<Utc>>,
    /// Cleared at every monthly rollover
    pub monthly_points: Points,
    /// `None` until the member's first completed draw. Never cleared.
    pub total_points: Option<Points>,
}

/// Result of one weighted draw. Lives only for the duration of a draw call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawOutcome {
    pub tier_name: String,
    pub point_delta: Points,
    pub item: String,
}

/// One leaderboard line.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RankEntry {
    pub member_id: MemberId,
    pub points: Points,
}

/// A single member's position in a points map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rank {
    /// 1-based
    pub rank: usize,
    pub points: Points,
    pub participants: usize,
}

/// Probability line for the rates table.
#[derive(Clone, Debug, PartialEq)]
pub struct TierRate {
    pub name: String,
    pub point_delta: Points,
    pub weight: u32,
    /// weight / total weight, in [0, 1]
    pub probability: f64,
}

impl TierRate {
    /// Probability as a percentage rounded to one decimal place.
    pub fn percent(&self) -> f64 {
        (self.probability * 1000.0).round() / 10.0
    }
}
