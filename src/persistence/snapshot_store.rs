use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;

use crate::activity::ActivityState;
use crate::config::PersistenceSettings;
use crate::utils::Result;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StoredSnapshot {
    pub key: String,
    /// Epoch milliseconds.
    pub saved_at: i64,
    pub state: ActivityState,
}

/// Sled backed store for [`ActivityState`] snapshots.
///
/// Entry keys start with the zero padded save time so a tree iterates in
/// chronological order. A non-positive `ttl_secs` or a zero retention cap
/// disables the respective cleanup.
#[derive(Clone)]
pub struct SnapshotStore {
    db: Db,
    ttl_secs: i64,
    max_snapshots_per_key: usize,
}

impl SnapshotStore {
    pub fn open(path: &str, ttl_secs: i64, max_snapshots_per_key: usize) -> Result<Self> {
        let db = sled::open(path)?;
        debug!(path, "snapshot store opened");
        Ok(Self {
            db,
            ttl_secs,
            max_snapshots_per_key,
        })
    }

    pub fn from_settings(settings: &PersistenceSettings) -> Result<Self> {
        Self::open(
            &settings.path,
            settings.ttl_secs,
            settings.max_snapshots_per_key,
        )
    }

    pub fn save(&self, key: &str, state: &ActivityState) -> Result<StoredSnapshot> {
        let snapshot = StoredSnapshot {
            key: key.to_string(),
            saved_at: Utc::now().timestamp_millis(),
            state: state.clone(),
        };

        let serialized = serde_json::to_vec(&snapshot)?;
        let tree = self.tree(key)?;
        let entry_key = format!("{:020}_{}", snapshot.saved_at, uuid::Uuid::new_v4());
        tree.insert(entry_key.as_bytes(), serialized)?;
        self.enforce_retention(&tree)?;
        tree.flush()?;

        debug!(key, activity = %state.id, "snapshot saved");
        Ok(snapshot)
    }

    /// Most recent live snapshot stored under `key`.
    pub fn load_latest(&self, key: &str) -> Result<Option<StoredSnapshot>> {
        Ok(self.load_all(key)?.pop())
    }

    /// Every live snapshot under `key`, oldest first. Expired snapshots are
    /// removed on the way.
    pub fn load_all(&self, key: &str) -> Result<Vec<StoredSnapshot>> {
        self.cleanup_expired(key)?;
        let tree = self.tree(key)?;

        let mut snapshots = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            snapshots.push(serde_json::from_slice(&value)?);
        }
        Ok(snapshots)
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.db.drop_tree(key)?)
    }

    fn tree(&self, key: &str) -> Result<Tree> {
        Ok(self.db.open_tree(key)?)
    }

    fn cleanup_expired(&self, key: &str) -> Result<()> {
        if self.ttl_secs <= 0 {
            return Ok(());
        }

        let expiry = Utc::now().timestamp_millis() - self.ttl_secs * 1000;
        let tree = self.tree(key)?;
        let mut expired = Vec::new();
        for entry in tree.iter() {
            let (entry_key, _) = entry?;
            if saved_at(&entry_key).is_some_and(|ts| ts < expiry) {
                expired.push(entry_key);
            }
        }

        if !expired.is_empty() {
            debug!(key, count = expired.len(), "dropping expired snapshots");
        }
        for entry_key in expired {
            tree.remove(entry_key)?;
        }
        Ok(())
    }

    fn enforce_retention(&self, tree: &Tree) -> Result<()> {
        if self.max_snapshots_per_key == 0 {
            return Ok(());
        }

        let surplus = tree.len().saturating_sub(self.max_snapshots_per_key);
        let mut oldest = Vec::with_capacity(surplus);
        for entry in tree.iter().take(surplus) {
            let (entry_key, _) = entry?;
            oldest.push(entry_key);
        }
        for entry_key in oldest {
            tree.remove(entry_key)?;
        }
        Ok(())
    }
}

fn saved_at(entry_key: &[u8]) -> Option<i64> {
    let prefix = entry_key.get(..20)?;
    std::str::from_utf8(prefix).ok()?.parse().ok()
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("db", &"sled::Db")
            .field("ttl_secs", &self.ttl_secs)
            .field("max_snapshots_per_key", &self.max_snapshots_per_key)
            .finish()
    }
}
