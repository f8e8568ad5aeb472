// src/service.rs
//
// The operation set the command dispatcher calls into. Everything returns a
// structured value; presentation is left to the dispatcher.

use chrono::{DateTime, FixedOffset, Utc};
use rand::Rng;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::KujiConfig;
use crate::cooldown::{CooldownGate, CooldownPolicy};
use crate::draw::DrawEngine;
use crate::error::{KujiError, KujiResult};
use crate::ledger::{Committed, Ledger};
use crate::models::{DrawOutcome, MemberKey, Points, PointsMap, Rank, RankEntry, TierRate};
use crate::ranking;
use crate::storage::{JsonFileStore, SnapshotStore};

/// Result of an admitted draw.
#[derive(Debug)]
pub struct DrawReceipt {
    pub key: MemberKey,
    pub outcome: DrawOutcome,
    pub drawn_at: DateTime<Utc>,
    pub monthly_points: Points,
    pub total_points: Points,
    /// Set when the ledger could not be written; the draw still counts.
    pub persist_error: Option<KujiError>,
}

/// A member's monthly and all-time position. At least one side is present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberStanding {
    pub monthly: Option<Rank>,
    pub total: Option<Rank>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjustMode {
    Add,
    Set,
}

pub struct KujiService {
    engine: DrawEngine,
    gate: CooldownGate,
    ledger: Ledger,
    clock: Arc<dyn Clock>,
    cooldown: CooldownPolicy,
    offset: FixedOffset,
    leaderboard_size: usize,
}

impl KujiService {
    /// Fails only on an invalid configuration; an unreadable snapshot starts empty.
    pub fn new(
        config: &KujiConfig,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> KujiResult<Self> {
        config.validate()?;
        Ok(Self {
            engine: DrawEngine::new(config.tier_table()?)?,
            gate: CooldownGate::new(),
            ledger: Ledger::open(store),
            clock,
            cooldown: config.cooldown,
            offset: config.utc_offset()?,
            leaderboard_size: config.leaderboard_size,
        })
    }

    /// JSON file at `config.data_file`, wall clock.
    pub fn from_config(config: &KujiConfig) -> KujiResult<Self> {
        let store = Arc::new(JsonFileStore::new(config.data_file.clone()));
        Self::new(config, store, Arc::new(SystemClock))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn leaderboard_size(&self) -> usize {
        self.leaderboard_size
    }

    // ========================================================================
    // DRAW
    // ========================================================================

    pub fn draw(&self, community_id: &str, member_id: &str) -> KujiResult<DrawReceipt> {
        self.draw_with(community_id, member_id, &mut rand::thread_rng())
    }

    pub fn draw_with<R: Rng + ?Sized>(
        &self,
        community_id: &str,
        member_id: &str,
        rng: &mut R,
    ) -> KujiResult<DrawReceipt> {
        let key = MemberKey::new(community_id, member_id);
        let _lease = self.gate.try_acquire(&key)?;

        let now = self.clock.now();
        if let Err(e) = self.ledger.begin_draw(&key, now, &self.cooldown, self.offset) {
            log::debug!("[Draw] {} rejected: {}", key, e);
            return Err(e);
        }

        let outcome = self.engine.draw_with(rng);
        let Committed {
            value: record,
            persist_error,
        } = self.ledger.apply_draw(&key, outcome.point_delta);
        // Always set once a draw has been applied.
        let total_points = record.total_points.unwrap_or(outcome.point_delta);

        log::info!(
            "[Draw] {} drew {} ({:+}pt, {}) -> monthly {} / total {}",
            key,
            outcome.tier_name,
            outcome.point_delta,
            outcome.item,
            record.monthly_points,
            total_points
        );

        Ok(DrawReceipt {
            key,
            outcome,
            drawn_at: now,
            monthly_points: record.monthly_points,
            total_points,
            persist_error,
        })
    }

    pub fn rates(&self) -> Vec<TierRate> {
        self.engine.rates()
    }

    // ========================================================================
    // RANKINGS
    // ========================================================================

    pub fn monthly_leaderboard(&self, community_id: &str) -> KujiResult<Vec<RankEntry>> {
        self.leaderboard(community_id, self.ledger.monthly_points(community_id))
    }

    pub fn total_leaderboard(&self, community_id: &str) -> KujiResult<Vec<RankEntry>> {
        self.leaderboard(community_id, self.ledger.total_points(community_id))
    }

    fn leaderboard(&self, community_id: &str, points: PointsMap) -> KujiResult<Vec<RankEntry>> {
        if points.is_empty() {
            return Err(KujiError::NoData {
                community_id: community_id.to_string(),
            });
        }
        Ok(ranking::top_n(&points, self.leaderboard_size))
    }

    pub fn rank_of(&self, community_id: &str, member_id: &str) -> KujiResult<MemberStanding> {
        let key = MemberKey::new(community_id, member_id);
        let community = self
            .ledger
            .snapshot(community_id)
            .ok_or_else(|| KujiError::NotFound { key: key.clone() })?;

        let standing = MemberStanding {
            monthly: ranking::rank_of(&community.monthly_points(), &key).ok(),
            total: ranking::rank_of(&community.total_points(), &key).ok(),
        };
        if standing.monthly.is_none() && standing.total.is_none() {
            return Err(KujiError::NotFound { key });
        }
        Ok(standing)
    }

    /// Ranking announced at the most recent rollover, as stored.
    pub fn last_monthly_ranking(&self, community_id: &str) -> KujiResult<serde_json::Value> {
        self.ledger
            .last_monthly_ranking(community_id)
            .ok_or_else(|| KujiError::NoData {
                community_id: community_id.to_string(),
            })
    }

    // ========================================================================
    // ADMIN
    // ========================================================================

    /// Capability checks belong to the dispatcher. Returns the new monthly total.
    pub fn admin_adjust(
        &self,
        community_id: &str,
        member_id: &str,
        amount: Points,
        mode: AdjustMode,
    ) -> Committed<Points> {
        let key = MemberKey::new(community_id, member_id);
        let committed = match mode {
            AdjustMode::Add => self.ledger.admin_add(&key, amount),
            AdjustMode::Set => self.ledger.admin_set(&key, amount).map(|_| amount),
        };
        log::info!(
            "[Admin] {:?} {} on {} -> monthly {}",
            mode,
            amount,
            key,
            committed.value
        );
        committed
    }
}
