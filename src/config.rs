use chrono::FixedOffset;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cooldown::CooldownPolicy;
use crate::error::{KujiError, KujiResult};
use crate::ranking::DEFAULT_LEADERBOARD_SIZE;
use crate::tiers_database::{Tier, TierTable, DEFAULT_TIERS};

// --- Configuration Constants ---
pub const DEFAULT_DATA_FILE: &str = "./kuji_data.json";
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 9; // JST, no DST
pub const DEFAULT_SCHEDULER_RECHECK_SECS: u64 = 60;

/// Service configuration. Every field has a default, so `{}` is a valid file.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct KujiConfig {
    /// Snapshot location for `JsonFileStore`
    pub data_file: PathBuf,
    pub cooldown: CooldownPolicy,
    /// Offset used for the half-day cooldown boundary and month boundaries
    pub utc_offset_hours: i32,
    pub leaderboard_size: usize,
    /// Upper bound on how long the reset scheduler sleeps between checks
    pub scheduler_recheck_secs: u64,
    pub tiers: Vec<Tier>,
}

impl Default for KujiConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from(DEFAULT_DATA_FILE),
            cooldown: CooldownPolicy::default(),
            utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
            leaderboard_size: DEFAULT_LEADERBOARD_SIZE,
            scheduler_recheck_secs: DEFAULT_SCHEDULER_RECHECK_SECS,
            tiers: DEFAULT_TIERS.clone(),
        }
    }
}

impl KujiConfig {
    pub fn from_json_str(json: &str) -> KujiResult<Self> {
        let config: KujiConfig = serde_json::from_str(json)
            .map_err(|e| KujiError::configuration(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> KujiResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KujiError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&raw)?;
        log::info!("[Config] Loaded {} ({} tiers)", path.display(), config.tiers.len());
        Ok(config)
    }

    pub fn validate(&self) -> KujiResult<()> {
        self.tier_table()?;
        self.utc_offset()?;
        if self.leaderboard_size == 0 {
            return Err(KujiError::configuration("leaderboard_size must be at least 1"));
        }
        if self.scheduler_recheck_secs == 0 {
            return Err(KujiError::configuration("scheduler_recheck_secs must be at least 1"));
        }
        if let CooldownPolicy::Rolling { hours: 0 } = self.cooldown {
            return Err(KujiError::configuration("rolling cooldown must be at least 1 hour"));
        }
        Ok(())
    }

    pub fn tier_table(&self) -> KujiResult<TierTable> {
        TierTable::new(self.tiers.clone())
    }

    pub fn utc_offset(&self) -> KujiResult<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).ok_or_else(|| {
            KujiError::configuration(format!("utc_offset_hours out of range: {}", self.utc_offset_hours))
        })
    }
}
