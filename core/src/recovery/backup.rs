use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{ns, DefaultKv, Kv, KvSerde};

const NS: &str = "backup";

/// A checksummed snapshot of last-known-good data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// Unique id.
    pub id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Type tag, e.g. `race-result`.
    pub data_type: String,
    /// SHA-256 hex of the JSON payload.
    pub checksum: String,
    /// Stored data.
    pub payload: Value,
}

/// SHA-256 hex digest of the serialized payload.
pub fn checksum(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

impl Backup {
    /// Snapshot `payload` now.
    pub fn new(data_type: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            data_type: data_type.to_string(),
            checksum: checksum(&payload),
            payload,
        }
    }

    /// Whether the payload still matches its checksum.
    pub fn verify(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }
}

/// Outcome of reading every stored backup.
#[derive(Debug, Default)]
pub struct BackupScan {
    /// Entries that deserialized.
    pub backups: Vec<Backup>,
    /// Keys whose stored bytes could not be read as a backup.
    pub unreadable: Vec<String>,
}

/// Backups kept in the KV store under the `backup` namespace. Keys sort by
/// data type, then creation time.
#[derive(Clone)]
pub struct BackupStore {
    kv: DefaultKv,
    seq: Arc<AtomicU64>,
}

fn storage(e: anyhow::Error) -> Error {
    Error::Storage(format!("{e:#}"))
}

impl BackupStore {
    /// Store backed by `kv`.
    pub fn new(kv: DefaultKv) -> Self {
        Self { kv, seq: Arc::new(AtomicU64::new(0)) }
    }

    fn key_for(&self, b: &Backup) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}:{:016}-{:06}", b.data_type, b.created_at.timestamp_micros(), seq % 1_000_000)
    }

    /// Persist a new backup of `payload`.
    pub fn create(&self, data_type: &str, payload: Value) -> Result<Backup> {
        let backup = Backup::new(data_type, payload);
        self.kv.put_json(&ns(NS, &self.key_for(&backup)), &backup).map_err(storage)?;
        Ok(backup)
    }

    /// Most recent backup for `data_type`, unverified.
    pub fn latest(&self, data_type: &str) -> Result<Option<Backup>> {
        let prefix = format!("{data_type}:");
        let Some(key) = self.kv.keys_in(NS).into_iter().filter(|k| k.starts_with(&prefix)).max() else {
            return Ok(None);
        };
        self.kv.get_json(&ns(NS, &key)).map_err(storage)
    }

    /// Latest backup for `data_type` after checksum verification.
    pub fn restore(&self, data_type: &str) -> Result<Option<Backup>> {
        match self.latest(data_type)? {
            Some(b) if !b.verify() => {
                Err(Error::DataCorruption(format!("backup {} ({data_type}) failed checksum verification", b.id)))
            }
            other => Ok(other),
        }
    }

    /// Every stored backup. Fails on the first unreadable entry; see [`Self::scan`].
    pub fn all(&self) -> Result<Vec<Backup>> {
        let mut out = Vec::new();
        for key in self.kv.keys_in(NS) {
            if let Some(b) = self.kv.get_json::<Backup>(&ns(NS, &key)).map_err(storage)? {
                out.push(b);
            }
        }
        Ok(out)
    }

    /// Every stored backup, with unreadable entries listed instead of failing.
    pub fn scan(&self) -> BackupScan {
        let mut scan = BackupScan::default();
        for key in self.kv.keys_in(NS) {
            match self.kv.get_json::<Backup>(&ns(NS, &key)) {
                Ok(Some(b)) => scan.backups.push(b),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %format!("{e:#}"), "unreadable backup");
                    scan.unreadable.push(key);
                }
            }
        }
        scan
    }

    /// Delete backups older than `retention`; returns how many were removed.
    pub fn prune(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now() - retention;
        let mut removed = 0;
        for key in self.kv.keys_in(NS) {
            let full = ns(NS, &key);
            let expired = match self.kv.get_json::<Backup>(&full) {
                Ok(Some(b)) => b.created_at < cutoff,
                Ok(None) => false,
                // Unreadable entries cannot be restored anyway.
                Err(_) => true,
            };
            if expired && self.kv.delete(&full) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Overwrite a stored backup as is. Test hook for corruption scenarios.
    #[cfg(test)]
    pub(crate) fn overwrite_latest(&self, data_type: &str, backup: &Backup) -> Result<()> {
        let prefix = format!("{data_type}:");
        if let Some(key) = self.kv.keys_in(NS).into_iter().filter(|k| k.starts_with(&prefix)).max() {
            self.kv.put_json(&ns(NS, &key), backup).map_err(storage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_default;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, BackupStore) {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_default(dir.path()).unwrap();
        (dir, BackupStore::new(kv))
    }

    #[test]
    fn latest_per_type_and_verified_restore() {
        let (_d, s) = store();
        s.create("team-roster", json!({"riders": [1]})).unwrap();
        s.create("team-roster", json!({"riders": [1, 2]})).unwrap();
        s.create("rider-profile", json!({"name": "x"})).unwrap();
        let latest = s.restore("team-roster").unwrap().unwrap();
        assert_eq!(latest.payload, json!({"riders": [1, 2]}));
        assert!(s.restore("race-result").unwrap().is_none());
        assert_eq!(s.all().unwrap().len(), 3);
    }

    #[test]
    fn tampered_payload_is_corruption() {
        let (_d, s) = store();
        let mut b = s.create("race-result", json!({"results": []})).unwrap();
        b.payload = json!({"results": ["forged"]});
        s.overwrite_latest("race-result", &b).unwrap();
        assert!(matches!(s.restore("race-result"), Err(Error::DataCorruption(_))));
    }

    #[test]
    fn scan_lists_unreadable_entries() {
        let (dir, s) = store();
        s.create("team-roster", json!({"riders": []})).unwrap();
        s.create("rider-profile", json!({"name": "x"})).unwrap();
        let key = s.kv.keys_in(NS).into_iter().find(|k| k.starts_with("team-roster:")).unwrap();
        std::fs::write(dir.path().join(hex::encode(ns(NS, &key))), b"{\"trunc").unwrap();

        assert!(matches!(s.all(), Err(Error::Storage(_))));
        let scan = s.scan();
        assert_eq!(scan.backups.len(), 1);
        assert_eq!(scan.unreadable, vec![key]);
    }

    #[test]
    fn prune_drops_only_expired() {
        let (_d, s) = store();
        s.create("race-result", json!(1)).unwrap();
        assert_eq!(s.prune(Duration::days(7)).unwrap(), 0);
        assert_eq!(s.prune(Duration::seconds(-1)).unwrap(), 1);
        assert!(s.all().unwrap().is_empty());
    }
}
