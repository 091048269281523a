// =============================================================================
// Strategy Store — durable order_id → ExitStrategy map
// =============================================================================
//
// The whole map is held in memory behind a parking_lot RwLock and written
// through to a single JSON file on every mutation. A mutation is applied to a
// copy of the map, flushed, and only then swapped in, so memory never holds
// a change the disk refused. Writes use the same tmp + rename pattern as the
// runtime config so a crash mid-write leaves the previous snapshot intact.
//
// A file that cannot be read or parsed at startup is logged and replaced by
// an empty store; it never takes the process down.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::strategy::{ExitStrategy, StrategyStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to serialise strategy store: {0}")]
    Serialise(#[from] serde_json::Error),
    #[error("failed to write strategy store to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Keyed persistence for pending exit strategies.
///
/// `put` and `delete` are write-through: on `Ok` the change is on disk and
/// visible to readers; on `Err` neither memory nor disk has changed.
pub trait StrategyStore: Send + Sync {
    fn get(&self, order_id: &str) -> Option<ExitStrategy>;
    fn put(&self, record: ExitStrategy) -> Result<(), StoreError>;
    fn delete(&self, order_id: &str) -> Result<Option<ExitStrategy>, StoreError>;

    /// Drop a record from memory only. For records whose exit order is
    /// already live at the broker when `delete` could not reach the disk;
    /// the next successful write carries the removal.
    fn evict(&self, order_id: &str) -> Option<ExitStrategy>;

    fn list(&self) -> Vec<ExitStrategy>;

    fn len(&self) -> usize {
        self.list().len()
    }

    fn list_by_status(&self, status: StrategyStatus) -> Vec<ExitStrategy> {
        self.list()
            .into_iter()
            .filter(|r| r.status == status)
            .collect()
    }
}

// =============================================================================
// JsonFileStore
// =============================================================================

pub struct JsonFileStore {
    path: PathBuf,
    records: RwLock<HashMap<String, ExitStrategy>>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading any existing snapshot.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let records = Self::load(&path);
        info!(
            path = %path.display(),
            pending = records.len(),
            "strategy store opened"
        );
        Self {
            path,
            records: RwLock::new(records),
        }
    }

    fn load(path: &Path) -> HashMap<String, ExitStrategy> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "strategy store unreadable, starting empty");
                return HashMap::new();
            }
        };

        if content.trim().is_empty() {
            return HashMap::new();
        }

        match serde_json::from_str::<HashMap<String, ExitStrategy>>(&content) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "strategy store corrupt, starting empty");
                HashMap::new()
            }
        }
    }

    /// Write `records` atomically. Called with the write lock held so file
    /// snapshots land in mutation order.
    fn flush(&self, records: &HashMap<String, ExitStrategy>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(records)?;
        let tmp_path = self.path.with_extension("json.tmp");

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        std::fs::write(&tmp_path, content).map_err(|source| StoreError::Io {
            path: tmp_path.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        })?;

        debug!(path = %self.path.display(), pending = records.len(), "strategy store flushed");
        Ok(())
    }
}

impl StrategyStore for JsonFileStore {
    fn get(&self, order_id: &str) -> Option<ExitStrategy> {
        self.records.read().get(order_id).cloned()
    }

    fn put(&self, record: ExitStrategy) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let mut next = records.clone();
        next.insert(record.order_id.clone(), record);
        self.flush(&next)?;
        *records = next;
        Ok(())
    }

    fn delete(&self, order_id: &str) -> Result<Option<ExitStrategy>, StoreError> {
        let mut records = self.records.write();
        if !records.contains_key(order_id) {
            return Ok(None);
        }
        let mut next = records.clone();
        let removed = next.remove(order_id);
        self.flush(&next)?;
        *records = next;
        Ok(removed)
    }

    fn evict(&self, order_id: &str) -> Option<ExitStrategy> {
        self.records.write().remove(order_id)
    }

    fn list(&self) -> Vec<ExitStrategy> {
        let mut all: Vec<ExitStrategy> = self.records.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::strategy::{StrategyKind, StrategySpec};
    use crate::types::{Offset, Side};

    fn record(id: &str) -> ExitStrategy {
        ExitStrategy::new(
            id,
            StrategySpec {
                symbol: "AAPL".into(),
                quantity: 10,
                side: Side::Buy,
                kind: StrategyKind::ConfirmationStop {
                    trigger: Offset::dollar(5.0),
                    stop: Offset::dollar(1.0),
                },
                fill_timeout_secs: 15,
                trigger_timeout_secs: 300,
            },
        )
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("strategies.json"));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategies.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = JsonFileStore::open(&path);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategies.json");

        {
            let store = JsonFileStore::open(&path);
            let mut rec = record("ord-1");
            rec.status = StrategyStatus::WaitingTrigger;
            rec.fill_price = Some(100.0);
            rec.trigger_price = Some(105.0);
            store.put(rec).unwrap();
            store.put(record("ord-2")).unwrap();
            assert_eq!(store.delete("ord-2").unwrap().map(|r| r.order_id), Some("ord-2".into()));
        }

        let reopened = JsonFileStore::open(&path);
        assert_eq!(reopened.len(), 1);
        let rec = reopened.get("ord-1").unwrap();
        assert_eq!(rec.status, StrategyStatus::WaitingTrigger);
        assert_eq!(rec.trigger_price, Some(105.0));
        assert!(reopened.get("ord-2").is_none());
        assert!(!path.with_extension("json.tmp").exists());
    }

    /// A store whose parent "directory" is a regular file, so every flush
    /// fails.
    fn unwritable(dir: &tempfile::TempDir) -> JsonFileStore {
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        JsonFileStore::open(blocker.join("strategies.json"))
    }

    #[test]
    fn failed_put_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = unwritable(&dir);
        assert!(matches!(store.put(record("ord-1")), Err(StoreError::Io { .. })));
        assert!(store.get("ord-1").is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn failed_delete_keeps_record_until_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategies.json");
        let store = JsonFileStore::open(&path);
        store.put(record("ord-1")).unwrap();

        // A directory in the way of the tmp file fails the flush while the
        // file on disk still holds ord-1.
        let tmp = path.with_extension("json.tmp");
        std::fs::create_dir(&tmp).unwrap();

        assert!(store.delete("ord-1").is_err());
        assert!(store.get("ord-1").is_some());
        assert_eq!(store.evict("ord-1").map(|r| r.order_id), Some("ord-1".into()));
        assert!(store.get("ord-1").is_none());
        assert!(JsonFileStore::open(&path).get("ord-1").is_some());

        // The next successful write drops the evicted record from disk too.
        std::fs::remove_dir(&tmp).unwrap();
        store.put(record("ord-2")).unwrap();
        let reopened = JsonFileStore::open(&path);
        assert!(reopened.get("ord-1").is_none());
        assert!(reopened.get("ord-2").is_some());
    }

    #[test]
    fn delete_unknown_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("s.json"));
        assert!(store.delete("nope").unwrap().is_none());
    }

    #[test]
    fn list_by_status_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("s.json"));
        let mut armed = record("a");
        armed.status = StrategyStatus::WaitingTrigger;
        armed.fill_price = Some(1.0);
        store.put(armed).unwrap();
        store.put(record("b")).unwrap();

        let waiting = store.list_by_status(StrategyStatus::WaitingFill);
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].order_id, "b");
    }
}
