// ============================================================================
// POINTS LEDGER
// ============================================================================
// Monthly and all-time points per community per member, plus draw stamps.
//
// - One mutex guards the whole snapshot; every mutation (draw stamp, draw
//   delta, admin add/set, rollover) runs under it
// - Every call that changes state persists the full snapshot before returning
// - A failed persist is reported through `Committed`, never rolled back
// ============================================================================

use chrono::{DateTime, FixedOffset, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cooldown::CooldownPolicy;
use crate::error::{KujiError, KujiResult};
use crate::models::{CommunityId, MemberId, MemberKey, MemberRecord, Points, PointsMap, RankEntry};
use crate::ranking;
use crate::storage::{load_or_default, OrderedMembers, SnapshotStore, StoredInstant, StoredSnapshot};

// ============================================================================
// IN-MEMORY SNAPSHOT
// ============================================================================

/// Members of one community in the order they first appeared.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommunityLedger {
    members: Vec<(MemberId, MemberRecord)>,
    index: HashMap<MemberId, usize>,
}

impl CommunityLedger {
    pub fn get(&self, member_id: &str) -> Option<&MemberRecord> {
        self.index.get(member_id).map(|&i| &self.members[i].1)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MemberId, &MemberRecord)> {
        self.members.iter().map(|(member_id, record)| (member_id, record))
    }

    pub fn monthly_points(&self) -> PointsMap {
        self.iter()
            .map(|(member_id, record)| (member_id.clone(), record.monthly_points))
            .collect()
    }

    /// Members that have completed at least one draw.
    pub fn total_points(&self) -> PointsMap {
        self.iter()
            .filter_map(|(member_id, record)| {
                record.total_points.map(|points| (member_id.clone(), points))
            })
            .collect()
    }

    fn entry(&mut self, member_id: &str) -> &mut MemberRecord {
        let slot = match self.index.get(member_id) {
            Some(&i) => i,
            None => {
                self.members.push((member_id.to_string(), MemberRecord::default()));
                self.index.insert(member_id.to_string(), self.members.len() - 1);
                self.members.len() - 1
            }
        };
        &mut self.members[slot].1
    }

    fn zero_monthly(&mut self) -> usize {
        for (_, record) in self.members.iter_mut() {
            record.monthly_points = 0;
        }
        self.members.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub communities: BTreeMap<CommunityId, CommunityLedger>,
    pub last_monthly_reset: Option<DateTime<Utc>>,
    /// Ranking announced at the latest rollover, kept as opaque JSON.
    pub last_monthly_ranking: BTreeMap<CommunityId, serde_json::Value>,
}

impl LedgerSnapshot {
    fn record_mut(&mut self, key: &MemberKey) -> &mut MemberRecord {
        self.communities
            .entry(key.community_id.clone())
            .or_default()
            .entry(&key.member_id)
    }

    fn record(&self, key: &MemberKey) -> Option<&MemberRecord> {
        self.communities
            .get(&key.community_id)
            .and_then(|community| community.get(&key.member_id))
    }

    /// Member order: monthly map first, then totals, then draw history.
    pub fn from_stored(stored: StoredSnapshot) -> Self {
        let StoredSnapshot {
            kuji_history,
            points,
            total_points,
            last_monthly_reset,
            last_monthly_ranking,
        } = stored;

        let mut snapshot = LedgerSnapshot {
            last_monthly_reset: last_monthly_reset.map(|instant| instant.0),
            last_monthly_ranking,
            ..Default::default()
        };

        for (community_id, members) in points {
            let community = snapshot.communities.entry(community_id).or_default();
            for (member_id, value) in members.0 {
                community.entry(&member_id).monthly_points = value;
            }
        }
        for (community_id, members) in total_points {
            let community = snapshot.communities.entry(community_id).or_default();
            for (member_id, value) in members.0 {
                community.entry(&member_id).total_points = Some(value);
            }
        }
        for (community_id, members) in kuji_history {
            let community = snapshot.communities.entry(community_id).or_default();
            for (member_id, instant) in members.0 {
                community.entry(&member_id).last_draw = Some(instant.0);
            }
        }

        snapshot
    }

    pub fn to_stored(&self) -> StoredSnapshot {
        let mut stored = StoredSnapshot {
            last_monthly_reset: self.last_monthly_reset.map(StoredInstant),
            last_monthly_ranking: self.last_monthly_ranking.clone(),
            ..Default::default()
        };

        for (community_id, community) in &self.communities {
            let history: Vec<(MemberId, StoredInstant)> = community
                .iter()
                .filter_map(|(member_id, record)| {
                    record.last_draw.map(|at| (member_id.clone(), StoredInstant(at)))
                })
                .collect();
            if !history.is_empty() {
                stored
                    .kuji_history
                    .insert(community_id.clone(), OrderedMembers(history));
            }
            stored
                .points
                .insert(community_id.clone(), OrderedMembers(community.monthly_points()));
            stored
                .total_points
                .insert(community_id.clone(), OrderedMembers(community.total_points()));
        }

        stored
    }
}

// ============================================================================
// MUTATION RESULT
// ============================================================================

/// Outcome of a mutation that has been applied in memory. `persist_error`
/// is set when the follow-up write to the store failed.
#[derive(Debug)]
pub struct Committed<T> {
    pub value: T,
    pub persist_error: Option<KujiError>,
}

impl<T> Committed<T> {
    pub fn is_durable(&self) -> bool {
        self.persist_error.is_none()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Committed<U> {
        Committed {
            value: f(self.value),
            persist_error: self.persist_error,
        }
    }
}

// ============================================================================
// LEDGER SERVICE
// ============================================================================

struct LedgerState {
    snapshot: LedgerSnapshot,
    /// Bumped by every persisted mutation.
    generation: u64,
}

pub struct Ledger {
    state: Mutex<LedgerState>,
    /// Generation most recently written to the store.
    written: Mutex<u64>,
    store: Arc<dyn SnapshotStore>,
}

impl Ledger {
    /// Loads the store's snapshot, or starts empty if it is missing or unreadable.
    pub fn open(store: Arc<dyn SnapshotStore>) -> Self {
        let snapshot = LedgerSnapshot::from_stored(load_or_default(store.as_ref()));
        log::info!(
            "[Ledger] Loaded {} communities (last monthly reset: {:?})",
            snapshot.communities.len(),
            snapshot.last_monthly_reset
        );
        Self::with_snapshot(store, snapshot)
    }

    pub fn with_snapshot(store: Arc<dyn SnapshotStore>, snapshot: LedgerSnapshot) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                snapshot,
                generation: 0,
            }),
            written: Mutex::new(0),
            store,
        }
    }

    // Every critical section leaves the snapshot consistent, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut LedgerSnapshot) -> T) -> Committed<T> {
        let (value, generation, stored) = {
            let mut state = self.lock();
            let value = f(&mut state.snapshot);
            state.generation += 1;
            (value, state.generation, state.snapshot.to_stored())
        };

        Committed {
            value,
            persist_error: self.persist(generation, &stored),
        }
    }

    /// Like `mutate`, but a closure returning `None` changed nothing: the
    /// generation stays put and nothing is written.
    fn mutate_if<T>(
        &self,
        f: impl FnOnce(&mut LedgerSnapshot) -> Option<T>,
    ) -> Committed<Option<T>> {
        let (value, generation, stored) = {
            let mut state = self.lock();
            let value = match f(&mut state.snapshot) {
                Some(value) => value,
                None => {
                    return Committed {
                        value: None,
                        persist_error: None,
                    }
                }
            };
            state.generation += 1;
            (value, state.generation, state.snapshot.to_stored())
        };

        Committed {
            value: Some(value),
            persist_error: self.persist(generation, &stored),
        }
    }

    fn persist(&self, generation: u64, stored: &StoredSnapshot) -> Option<KujiError> {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if generation <= *written {
            // A newer generation is already on disk.
            return None;
        }
        match self.store.persist(stored) {
            Ok(()) => {
                *written = generation;
                None
            }
            Err(e) => {
                log::error!("❌ [Ledger] Persist of generation {} failed: {}", generation, e);
                Some(KujiError::Persistence(e))
            }
        }
    }

    // --- Draw path ---

    /// Re-checks the stored stamp and, if the cooldown has elapsed, stamps
    /// `now`. In-memory only; the following `apply_draw` persists both.
    pub fn begin_draw(
        &self,
        key: &MemberKey,
        now: DateTime<Utc>,
        policy: &CooldownPolicy,
        offset: FixedOffset,
    ) -> KujiResult<()> {
        let mut state = self.lock();
        if let Some(last_draw) = state.snapshot.record(key).and_then(|r| r.last_draw) {
            if let Some(remaining) = policy.remaining(last_draw, now, offset) {
                return Err(KujiError::CooldownActive {
                    key: key.clone(),
                    remaining,
                });
            }
        }
        state.snapshot.record_mut(key).last_draw = Some(now);
        Ok(())
    }

    /// Adds a draw's delta to both monthly and total points.
    pub fn apply_draw(&self, key: &MemberKey, delta: Points) -> Committed<MemberRecord> {
        self.mutate(|snapshot| {
            let record = snapshot.record_mut(key);
            record.monthly_points += delta;
            record.total_points = Some(record.total_points.unwrap_or(0) + delta);
            record.clone()
        })
    }

    // --- Admin path ---

    /// Monthly points only. Returns the new monthly total.
    pub fn admin_add(&self, key: &MemberKey, delta: Points) -> Committed<Points> {
        self.mutate(|snapshot| {
            let record = snapshot.record_mut(key);
            record.monthly_points += delta;
            record.monthly_points
        })
    }

    pub fn admin_set(&self, key: &MemberKey, value: Points) -> Committed<()> {
        self.mutate(|snapshot| {
            snapshot.record_mut(key).monthly_points = value;
        })
    }

    // --- Rollover ---

    /// Zeroes monthly points everywhere, or in one community. Returns the
    /// number of members touched.
    pub fn reset_monthly(&self, community_id: Option<&str>) -> Committed<usize> {
        self.mutate(|snapshot| match community_id {
            Some(id) => snapshot
                .communities
                .get_mut(id)
                .map(CommunityLedger::zero_monthly)
                .unwrap_or(0),
            None => snapshot
                .communities
                .values_mut()
                .map(CommunityLedger::zero_monthly)
                .sum(),
        })
    }

    /// Captures each community's monthly top list, stores it as the last
    /// monthly ranking, zeroes all monthly points and records the period
    /// start, all under one lock. The returned lists are exactly the values
    /// that were cleared. `None` (and no write) if the period was already
    /// rolled over.
    pub fn complete_rollover(
        &self,
        period_start: DateTime<Utc>,
        leaderboard_size: usize,
    ) -> Committed<Option<BTreeMap<CommunityId, Vec<RankEntry>>>> {
        self.mutate_if(|snapshot| {
            if snapshot.last_monthly_reset.map_or(false, |last| last >= period_start) {
                return None;
            }
            let rankings: BTreeMap<CommunityId, Vec<RankEntry>> = snapshot
                .communities
                .iter()
                .map(|(community_id, community)| {
                    let top = ranking::top_n(&community.monthly_points(), leaderboard_size);
                    (community_id.clone(), top)
                })
                .collect();

            snapshot.last_monthly_ranking = rankings
                .iter()
                .map(|(community_id, entries)| {
                    let value = serde_json::to_value(entries).unwrap_or(serde_json::Value::Null);
                    (community_id.clone(), value)
                })
                .collect();
            for community in snapshot.communities.values_mut() {
                community.zero_monthly();
            }
            snapshot.last_monthly_reset = Some(period_start);
            Some(rankings)
        })
    }

    /// Sets the rollover marker without clearing anything. False (and no
    /// write) if the marker is already at or past `period_start`.
    pub fn mark_rollover(&self, period_start: DateTime<Utc>) -> Committed<bool> {
        self.mutate_if(|snapshot| {
            if snapshot.last_monthly_reset.map_or(false, |last| last >= period_start) {
                return None;
            }
            snapshot.last_monthly_reset = Some(period_start);
            Some(())
        })
        .map(|applied| applied.is_some())
    }

    // --- Reads ---

    pub fn snapshot(&self, community_id: &str) -> Option<CommunityLedger> {
        self.lock().snapshot.communities.get(community_id).cloned()
    }

    pub fn full_snapshot(&self) -> LedgerSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn record(&self, key: &MemberKey) -> Option<MemberRecord> {
        self.lock().snapshot.record(key).cloned()
    }

    pub fn monthly_points(&self, community_id: &str) -> PointsMap {
        self.snapshot(community_id)
            .map(|community| community.monthly_points())
            .unwrap_or_default()
    }

    pub fn total_points(&self, community_id: &str) -> PointsMap {
        self.snapshot(community_id)
            .map(|community| community.total_points())
            .unwrap_or_default()
    }

    pub fn communities(&self) -> Vec<CommunityId> {
        self.lock().snapshot.communities.keys().cloned().collect()
    }

    pub fn last_monthly_reset(&self) -> Option<DateTime<Utc>> {
        self.lock().snapshot.last_monthly_reset
    }

    pub fn last_monthly_ranking(&self, community_id: &str) -> Option<serde_json::Value> {
        self.lock()
            .snapshot
            .last_monthly_ranking
            .get(community_id)
            .cloned()
    }
}
