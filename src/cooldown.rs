//! # Draw Cooldown
//!
//! Two halves live here:
//! - `CooldownGate`: per-key exclusive lease, rejected (never queued) while held
//! - `CooldownPolicy`: when a member may draw again after their last draw
//!
//! The gate alone does not stop a second draw; it only guarantees that the
//! stored-timestamp check and stamp in the ledger are never raced by another
//! attempt for the same key.

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use crate::error::{KujiError, KujiResult};
use crate::models::MemberKey;

pub const DEFAULT_COOLDOWN_HOURS: u32 = 12;

// --- Policy ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CooldownPolicy {
    /// Fixed interval measured from the last draw.
    Rolling { hours: u32 },
    /// Ready again at the next local 12:00 or 00:00 after the last draw.
    HalfDayBoundary,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        CooldownPolicy::Rolling {
            hours: DEFAULT_COOLDOWN_HOURS,
        }
    }
}

impl CooldownPolicy {
    pub fn ready_at(&self, last_draw: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
        match self {
            CooldownPolicy::Rolling { hours } => last_draw + Duration::hours(i64::from(*hours)),
            CooldownPolicy::HalfDayBoundary => {
                let local = last_draw.with_timezone(&offset);
                let local_midnight = last_draw
                    - Duration::seconds(i64::from(local.num_seconds_from_midnight()))
                    - Duration::nanoseconds(i64::from(local.nanosecond()));
                if local.hour() < 12 {
                    local_midnight + Duration::hours(12)
                } else {
                    local_midnight + Duration::hours(24)
                }
            }
        }
    }

    /// `None` once the member may draw again. A last draw stamped in the
    /// future (clock skew) is treated as `now`.
    pub fn remaining(
        &self,
        last_draw: DateTime<Utc>,
        now: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Option<RemainingCooldown> {
        let ready_at = self.ready_at(last_draw.min(now), offset);
        if now >= ready_at {
            None
        } else {
            Some(RemainingCooldown::from_duration(ready_at - now))
        }
    }
}

/// Wait time shown to the member, floored to whole minutes and never negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemainingCooldown {
    pub hours: i64,
    pub minutes: i64,
}

impl RemainingCooldown {
    pub fn from_duration(duration: Duration) -> Self {
        let total_minutes = duration.num_minutes().max(0);
        Self {
            hours: total_minutes / 60,
            minutes: total_minutes % 60,
        }
    }
}

impl fmt::Display for RemainingCooldown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h {}m", self.hours, self.minutes)
    }
}

// --- Gate ---

/// Keys with a draw currently in flight.
#[derive(Debug, Default)]
pub struct CooldownGate {
    held: Mutex<HashSet<MemberKey>>,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking. Returns `Busy` if the key is already held.
    pub fn try_acquire(&self, key: &MemberKey) -> KujiResult<Lease<'_>> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            log::debug!("[Cooldown] {} busy, rejecting", key);
            return Err(KujiError::Busy { key: key.clone() });
        }
        Ok(Lease {
            gate: self,
            key: key.clone(),
        })
    }

    pub fn is_held(&self, key: &MemberKey) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    pub fn in_flight(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, key: &MemberKey) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Exclusive hold on one key. Released on drop, on every exit path.
#[derive(Debug)]
pub struct Lease<'a> {
    gate: &'a CooldownGate,
    key: MemberKey,
}

impl Lease<'_> {
    pub fn key(&self) -> &MemberKey {
        &self.key
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.gate.release(&self.key);
    }
}
