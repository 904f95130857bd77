use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_core::ObjectId;

use crate::StoreError;

/// One in-flight eviction-removal transaction.
///
/// Persisted before the removal is submitted downstream so a crash
/// between submission and completion is detected at restart and the
/// removal resubmitted rather than silently lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionRecord {
    pub object_id: ObjectId,
    pub cache_name: String,
    pub candidate_keys: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LogContents {
    evictions: BTreeMap<i64, EvictionRecord>,
    pending_deletes: BTreeSet<ObjectId>,
}

/// Durable record set of in-flight eviction transactions and pending
/// inline-GC deletions.
///
/// The whole set is rewritten on every mutation (it is small — one record
/// per in-flight eviction) via a temp file + rename so a crash mid-write
/// leaves either the old or the new contents, never a torn file.
pub struct RecoveryLog {
    path: PathBuf,
    contents: Mutex<LogContents>,
}

impl RecoveryLog {
    /// Opens the log at `path`, loading any records a previous process
    /// left behind.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let contents = match fs::read(&path) {
            Ok(bytes) => {
                bincode::deserialize(&bytes).map_err(|err| StoreError::Corrupt {
                    path: path.clone(),
                    detail: err.to_string(),
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LogContents::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            contents: Mutex::new(contents),
        })
    }

    /// Records an eviction-removal transaction as in flight.
    pub fn record_eviction(&self, record: EvictionRecord) -> Result<(), StoreError> {
        let mut contents = self.contents.lock();
        contents.evictions.insert(record.object_id.raw(), record);
        self.rewrite(&contents)
    }

    /// Removes the in-flight record once the removal transaction
    /// committed.
    pub fn complete_eviction(&self, object_id: ObjectId) -> Result<(), StoreError> {
        let mut contents = self.contents.lock();
        if contents.evictions.remove(&object_id.raw()).is_none() {
            tracing::debug!(
                target = "strata.store",
                %object_id,
                "eviction completion without a matching in-flight record"
            );
            return Ok(());
        }
        self.rewrite(&contents)
    }

    /// All eviction transactions that were submitted but never completed.
    pub fn in_flight_evictions(&self) -> Vec<EvictionRecord> {
        self.contents.lock().evictions.values().cloned().collect()
    }

    /// Adds object ids to the pending inline-GC delete set.
    pub fn record_pending_deletes(&self, ids: &BTreeSet<ObjectId>) -> Result<(), StoreError> {
        let mut contents = self.contents.lock();
        contents.pending_deletes.extend(ids.iter().copied());
        self.rewrite(&contents)
    }

    /// Clears ids whose delete transaction committed.
    pub fn clear_pending_deletes(&self, ids: &BTreeSet<ObjectId>) -> Result<(), StoreError> {
        let mut contents = self.contents.lock();
        for id in ids {
            contents.pending_deletes.remove(id);
        }
        self.rewrite(&contents)
    }

    pub fn pending_deletes(&self) -> BTreeSet<ObjectId> {
        self.contents.lock().pending_deletes.clone()
    }

    fn rewrite(&self, contents: &LogContents) -> Result<(), StoreError> {
        let bytes = bincode::serialize(contents).map_err(|err| StoreError::Encode(err.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Convenience for tests and single-directory deployments.
pub fn default_log_path(dir: &Path) -> PathBuf {
    dir.join("recovery.bin")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64) -> EvictionRecord {
        EvictionRecord {
            object_id: ObjectId::new(id),
            cache_name: format!("cache-{id}"),
            candidate_keys: vec!["k1".to_string(), "k2".to_string()],
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_log_path(dir.path());

        let log = RecoveryLog::open(&path).unwrap();
        log.record_eviction(record(42)).unwrap();
        log.record_pending_deletes(&BTreeSet::from([ObjectId::new(7)]))
            .unwrap();
        drop(log);

        let log = RecoveryLog::open(&path).unwrap();
        assert_eq!(log.in_flight_evictions(), vec![record(42)]);
        assert_eq!(log.pending_deletes(), BTreeSet::from([ObjectId::new(7)]));
    }

    #[test]
    fn completion_removes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_log_path(dir.path());

        let log = RecoveryLog::open(&path).unwrap();
        log.record_eviction(record(42)).unwrap();
        log.complete_eviction(ObjectId::new(42)).unwrap();
        drop(log);

        let log = RecoveryLog::open(&path).unwrap();
        assert!(log.in_flight_evictions().is_empty());
    }

    #[test]
    fn completing_an_unknown_record_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecoveryLog::open(default_log_path(dir.path())).unwrap();
        log.complete_eviction(ObjectId::new(1)).unwrap();
        assert!(log.in_flight_evictions().is_empty());
    }

    #[test]
    fn cleared_deletes_do_not_reappear() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_log_path(dir.path());

        let log = RecoveryLog::open(&path).unwrap();
        let ids = BTreeSet::from([ObjectId::new(1), ObjectId::new(2)]);
        log.record_pending_deletes(&ids).unwrap();
        log.clear_pending_deletes(&BTreeSet::from([ObjectId::new(1)]))
            .unwrap();
        drop(log);

        let log = RecoveryLog::open(&path).unwrap();
        assert_eq!(log.pending_deletes(), BTreeSet::from([ObjectId::new(2)]));
    }
}
