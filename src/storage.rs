//! # Snapshot Storage
//!
//! The ledger is persisted as one JSON document, always written whole:
//!
//! ```text
//! {
//!   "kujiHistory":        { communityId: { memberId: <ms since epoch> } },
//!   "points":             { communityId: { memberId: <integer> } },
//!   "totalPoints":        { communityId: { memberId: <integer> } },
//!   "lastMonthlyReset":   <ms since epoch | null>,
//!   "lastMonthlyRanking": { communityId: <any> }
//! }
//! ```
//!
//! Member maps keep their key order on both write and read, since ranking
//! ties are broken by the order members first appeared.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{KujiError, StorageError};
use crate::models::{CommunityId, MemberId, Points};

// ============================================================================
// PERSISTED FORM
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredSnapshot {
    #[serde(default)]
    pub kuji_history: BTreeMap<CommunityId, OrderedMembers<StoredInstant>>,
    #[serde(default)]
    pub points: BTreeMap<CommunityId, OrderedMembers<Points>>,
    #[serde(default)]
    pub total_points: BTreeMap<CommunityId, OrderedMembers<Points>>,
    #[serde(default)]
    pub last_monthly_reset: Option<StoredInstant>,
    #[serde(default)]
    pub last_monthly_ranking: BTreeMap<CommunityId, serde_json::Value>,
}

/// Member id -> value, in insertion order. Serialized as a JSON object.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderedMembers<T>(pub Vec<(MemberId, T)>);

impl<T> Default for OrderedMembers<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: Serialize> Serialize for OrderedMembers<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (member_id, value) in &self.0 {
            map.serialize_entry(member_id, value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMembers<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMembersVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedMembersVisitor<T> {
            type Value = OrderedMembers<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an object keyed by member id")
            }

            // Entries arrive in document order; a repeated key keeps its first slot.
            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let capacity = access.size_hint().unwrap_or(0);
                let mut entries: Vec<(MemberId, T)> = Vec::with_capacity(capacity);
                let mut index: HashMap<MemberId, usize> = HashMap::with_capacity(capacity);
                while let Some((member_id, value)) = access.next_entry::<MemberId, T>()? {
                    match index.get(&member_id) {
                        Some(&slot) => entries[slot].1 = value,
                        None => {
                            index.insert(member_id.clone(), entries.len());
                            entries.push((member_id, value));
                        }
                    }
                }
                Ok(OrderedMembers(entries))
            }
        }

        deserializer.deserialize_map(OrderedMembersVisitor(PhantomData))
    }
}

/// Instant written as integer milliseconds since the Unix epoch. Reads the
/// integer form and RFC 3339 strings.
///
/// Some older files hold JST wall-clock time labelled `Z` (nine hours ahead
/// of the real instant). Those are read as written, not corrected: the draw
/// stamp lands in the future and the member waits until stamp + cooldown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredInstant(pub DateTime<Utc>);

impl Serialize for StoredInstant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0.timestamp_millis())
    }
}

impl<'de> Deserialize<'de> for StoredInstant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct InstantVisitor;

        impl<'de> Visitor<'de> for InstantVisitor {
            type Value = StoredInstant;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("milliseconds since epoch or an RFC 3339 timestamp")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Utc.timestamp_millis_opt(v)
                    .single()
                    .map(StoredInstant)
                    .ok_or_else(|| E::custom(format!("timestamp out of range: {}", v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                let v = i64::try_from(v).map_err(|_| E::custom(format!("timestamp out of range: {}", v)))?;
                self.visit_i64(v)
            }

            // JS numbers sometimes come back as floats
            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                if !v.is_finite() {
                    return Err(E::custom("timestamp is not finite"));
                }
                self.visit_i64(v.trunc() as i64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                DateTime::parse_from_rfc3339(v)
                    .map(|dt| StoredInstant(dt.with_timezone(&Utc)))
                    .map_err(|e| E::custom(format!("invalid timestamp '{}': {}", v, e)))
            }
        }

        deserializer.deserialize_any(InstantVisitor)
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> Result<Option<StoredSnapshot>, StorageError>;

    /// Replaces the whole persisted state.
    fn persist(&self, snapshot: &StoredSnapshot) -> Result<(), StorageError>;
}

/// Loads the persisted state, falling back to an empty one on any failure.
pub fn load_or_default(store: &dyn SnapshotStore) -> StoredSnapshot {
    match store.load() {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            log::info!("[Store] No persisted snapshot yet, starting empty");
            StoredSnapshot::default()
        }
        Err(e) => {
            log::warn!("⚠️ [Store] {}; reinitializing", KujiError::LoadCorruption(e));
            StoredSnapshot::default()
        }
    }
}

// ============================================================================
// JSON FILE STORE
// ============================================================================

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    /// Keeps a copy of an unreadable file so the next persist does not destroy it.
    fn quarantine(&self) {
        let target = self.sibling(".corrupt");
        match fs::copy(&self.path, &target) {
            Ok(_) => log::warn!("[Store] Copied unreadable snapshot to {}", target.display()),
            Err(e) => log::warn!("[Store] Could not back up unreadable snapshot: {}", e),
        }
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<StoredSnapshot>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Err(StorageError::Corrupt {
                reason: "empty file".to_string(),
            });
        }

        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                self.quarantine();
                Err(StorageError::Json(e))
            }
        }
    }

    fn persist(&self, snapshot: &StoredSnapshot) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        // Write-then-rename so readers never see a half-written file.
        let tmp = self.sibling(".tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Keeps the serialized document in memory. Failure can be switched on to
/// exercise the non-fatal persist path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<Option<String>>,
    failing: AtomicBool,
    persists: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(json: impl Into<String>) -> Self {
        Self {
            document: Mutex::new(Some(json.into())),
            ..Self::default()
        }
    }

    pub fn document(&self) -> Option<String> {
        self.document.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful persists so far.
    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Option<StoredSnapshot>, StorageError> {
        let document = self.document.lock().unwrap_or_else(|e| e.into_inner());
        match document.as_deref() {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Err(StorageError::Corrupt {
                reason: "empty document".to_string(),
            }),
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        }
    }

    fn persist(&self, snapshot: &StoredSnapshot) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "memory store set to fail".to_string(),
            });
        }
        let json = serde_json::to_string(snapshot)?;
        *self.document.lock().unwrap_or_else(|e| e.into_inner()) = Some(json);
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_DOCUMENT: &str = r#"{
        "kujiHistory": { "g1": { "zed": 1709971200000, "amy": "2024-03-09T08:00:00.000Z" } },
        "points": { "g1": { "zed": 10, "amy": 30, "bob": 30 } },
        "lastMonthlyReset": null,
        "lastMonthlyRanking": {},
        "totalPoints": { "g1": { "zed": 40 } }
    }"#;

    #[test]
    fn member_order_survives_parsing() {
        let snapshot: StoredSnapshot = serde_json::from_str(LEGACY_DOCUMENT).unwrap();
        let order: Vec<&str> = snapshot.points["g1"].0.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(order, vec!["zed", "amy", "bob"]);
    }

    #[test]
    fn repeated_member_keeps_first_slot_and_last_value() {
        let parsed: OrderedMembers<Points> =
            serde_json::from_str(r#"{"amy": 1, "bob": 2, "amy": 3, "cid": 4}"#).unwrap();
        assert_eq!(
            parsed.0,
            vec![("amy".to_string(), 3), ("bob".to_string(), 2), ("cid".to_string(), 4)]
        );
    }

    #[test]
    fn accepts_millisecond_and_rfc3339_instants() {
        let snapshot: StoredSnapshot = serde_json::from_str(LEGACY_DOCUMENT).unwrap();
        let history = &snapshot.kuji_history["g1"].0;
        assert_eq!(history[0].1 .0.timestamp_millis(), 1_709_971_200_000);
        assert_eq!(history[1].1 .0.to_rfc3339(), "2024-03-09T08:00:00+00:00");
        assert_eq!(snapshot.last_monthly_reset, None);
    }

    #[test]
    fn instants_are_written_as_milliseconds() {
        let mut snapshot = StoredSnapshot::default();
        snapshot.last_monthly_reset = Some(StoredInstant(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["lastMonthlyReset"], serde_json::json!(1_700_000_000_123i64));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let snapshot: StoredSnapshot = serde_json::from_str(r#"{"points": {}}"#).unwrap();
        assert_eq!(snapshot, StoredSnapshot::default());
    }

    #[test]
    fn corrupt_memory_document_falls_back_to_default() {
        let store = MemoryStore::with_document("{ not json");
        assert!(store.load().is_err());
        assert_eq!(load_or_default(&store), StoredSnapshot::default());

        let empty = MemoryStore::with_document("   ");
        assert!(matches!(empty.load(), Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn failing_memory_store_reports_error() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(store.persist(&StoredSnapshot::default()).is_err());
        assert_eq!(store.persist_count(), 0);

        store.set_failing(false);
        store.persist(&StoredSnapshot::default()).unwrap();
        assert_eq!(store.persist_count(), 1);
        assert!(store.load().unwrap().is_some());
    }

    #[test]
    fn file_store_writes_whole_document_and_reads_it_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("kuji_data.json"));
        assert!(store.load().unwrap().is_none());

        let snapshot: StoredSnapshot = serde_json::from_str(LEGACY_DOCUMENT).unwrap();
        store.persist(&snapshot).unwrap();

        assert_eq!(store.load().unwrap(), Some(snapshot));
        assert!(!dir.path().join("kuji_data.json.tmp").exists());
    }

    #[test]
    fn file_store_quarantines_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kuji_data.json");
        fs::write(&path, "{\"points\": ").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(store.load().is_err());
        assert_eq!(load_or_default(&store), StoredSnapshot::default());
        assert!(dir.path().join("kuji_data.json.corrupt").exists());
    }

    #[test]
    fn file_store_treats_empty_file_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kuji_data.json");
        fs::write(&path, "\n").unwrap();
        assert!(matches!(JsonFileStore::new(&path).load(), Err(StorageError::Corrupt { .. })));
    }
}
