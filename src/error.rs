use thiserror::Error;

use crate::cooldown::RemainingCooldown;
use crate::models::{CommunityId, MemberKey};

#[derive(Error, Debug)]
pub enum KujiError {
    /// Invalid tier table or configuration file. Fatal at startup.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("a draw for {key} is already in progress")]
    Busy { key: MemberKey },

    #[error("{key} is on cooldown for another {remaining}")]
    CooldownActive {
        key: MemberKey,
        remaining: RemainingCooldown,
    },

    #[error("snapshot persist failed: {0}")]
    Persistence(#[source] StorageError),

    #[error("snapshot could not be loaded: {0}")]
    LoadCorruption(#[source] StorageError),

    #[error("no ledger entry for {key}")]
    NotFound { key: MemberKey },

    #[error("no point data yet for community {community_id}")]
    NoData { community_id: CommunityId },
}

impl KujiError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Busy and cooldown rejections are expected traffic, not faults.
    pub fn is_retry_later(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::CooldownActive { .. })
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt snapshot: {reason}")]
    Corrupt { reason: String },

    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
}

pub type KujiResult<T> = Result<T, KujiError>;
