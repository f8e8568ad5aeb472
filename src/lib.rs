// ============================================================================
// KUJI REWARDS
// ============================================================================
// Reward-draw engine for chat communities: a weighted draw with a per-member
// cooldown, a monthly and all-time points ledger, leaderboards, and a monthly
// rollover that announces the final ranking before clearing monthly points.
//
// The crate installs no logger and formats nothing for a chat platform; the
// embedding dispatcher owns both.
// ============================================================================

// Shared types
pub mod error;
pub mod models;

// Draw
pub mod tiers_database; // Built-in tier tables
pub mod draw;
pub mod cooldown; // Per-key gate and cooldown policy

// State
pub mod storage; // Snapshot document and stores
pub mod ledger;
pub mod ranking;

// Wiring
pub mod clock;
pub mod config;
pub mod service;
pub mod reset_schedule; // Monthly rollover job

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::KujiConfig;
pub use cooldown::{CooldownPolicy, RemainingCooldown};
pub use error::{KujiError, KujiResult, StorageError};
pub use ledger::Committed;
pub use models::{DrawOutcome, MemberKey, Points, Rank, RankEntry, TierRate};
pub use reset_schedule::{LogNotifier, RankingNotifier, ResetScheduler, RolloverOutcome, SchedulerHandle};
pub use service::{AdjustMode, DrawReceipt, KujiService, MemberStanding};
pub use storage::{JsonFileStore, MemoryStore, SnapshotStore};
pub use tiers_database::{Tier, TierTable};
