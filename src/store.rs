//! Durable storage for [`JobGroup`] records.
//!
//! [`JobStore`] is a plain key-value interface so nothing else in the crate
//! reaches into the filesystem for job state:
//!
//! * [`MemoryJobStore`]: tests and dry runs.
//! * [`FileJobStore`]: production; one `batch_info_{group_id}.json` per
//!   group in the job temp directory, written atomically.

use crate::error::StoreError;
use crate::model::JobGroup;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// File name prefix of a persisted job group record.
pub const RECORD_PREFIX: &str = "batch_info_";

/// Key-value store of job groups, keyed by `group_id`.
pub trait JobStore: Send + Sync {
    fn put(&self, group: &JobGroup) -> Result<(), StoreError>;
    fn get(&self, group_id: &str) -> Result<Option<JobGroup>, StoreError>;
    /// Returns `true` if a record was removed.
    fn delete(&self, group_id: &str) -> Result<bool, StoreError>;
    /// All stored group ids, sorted.
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

fn check_id(group_id: &str) -> Result<(), StoreError> {
    let ok = !group_id.is_empty()
        && group_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId {
            group_id: group_id.to_string(),
        })
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: Mutex<BTreeMap<String, JobGroup>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, JobGroup>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobStore for MemoryJobStore {
    fn put(&self, group: &JobGroup) -> Result<(), StoreError> {
        check_id(&group.group_id)?;
        group.validate()?;
        self.records().insert(group.group_id.clone(), group.clone());
        Ok(())
    }

    fn get(&self, group_id: &str) -> Result<Option<JobGroup>, StoreError> {
        check_id(group_id)?;
        Ok(self.records().get(group_id).cloned())
    }

    fn delete(&self, group_id: &str) -> Result<bool, StoreError> {
        check_id(group_id)?;
        Ok(self.records().remove(group_id).is_some())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records().keys().cloned().collect())
    }
}

/// JSON files in a directory.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `group_id`.
    pub fn record_path(&self, group_id: &str) -> PathBuf {
        self.dir.join(format!("{RECORD_PREFIX}{group_id}.json"))
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl JobStore for FileJobStore {
    fn put(&self, group: &JobGroup) -> Result<(), StoreError> {
        check_id(&group.group_id)?;
        group.validate()?;
        std::fs::create_dir_all(&self.dir).map_err(Self::io_err(&self.dir))?;

        let path = self.record_path(&group.group_id);
        let json = serde_json::to_vec_pretty(group).map_err(|e| StoreError::Corrupt {
            group_id: group.group_id.clone(),
            detail: e.to_string(),
        })?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(Self::io_err(&self.dir))?;
        tmp.write_all(&json).map_err(Self::io_err(&path))?;
        tmp.persist(&path).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e.error,
        })?;
        debug!("Persisted job group {} → {}", group.group_id, path.display());
        Ok(())
    }

    fn get(&self, group_id: &str) -> Result<Option<JobGroup>, StoreError> {
        check_id(group_id)?;
        let path = self.record_path(group_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_err(&path)(e)),
        };
        let group: JobGroup = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
            group_id: group_id.to_string(),
            detail: e.to_string(),
        })?;
        group.validate()?;
        Ok(Some(group))
    }

    fn delete(&self, group_id: &str) -> Result<bool, StoreError> {
        check_id(group_id)?;
        let path = self.record_path(group_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_err(&path)(e)),
        }
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(&self.dir)(e)),
        };
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_prefix(RECORD_PREFIX)
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .filter(|id| check_id(id).is_ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{CorrelationMap, MappingEntry};
    use crate::model::{ChunkRecord, JobHandle, JobStatus, RequestCounts};
    use chrono::Utc;

    fn sample_group(id: &str) -> JobGroup {
        let mut map = CorrelationMap::new();
        map.insert(
            "doc_page_0001",
            MappingEntry {
                document_id: "doc".into(),
                page_number: 1,
                working_dir: PathBuf::from("temp/temp_batch/doc"),
            },
        );
        JobGroup {
            group_id: id.into(),
            chunks: vec![ChunkRecord {
                index: 0,
                handle: JobHandle {
                    job_id: "batch_abc".into(),
                    status: JobStatus::Validating,
                    request_counts: RequestCounts::default(),
                    output_file_id: None,
                    error_file_id: None,
                },
                correlation_ids: vec!["doc_page_0001".into()],
            }],
            total_work_units: 1,
            correlation_map: map,
            created_at: Utc::now(),
            model: "gpt-4o-mini".into(),
            skipped_work_units: vec![],
            protected_paths: vec![],
            retrieved_at: None,
        }
    }

    fn exercise(store: &dyn JobStore) {
        assert!(store.get("g1").unwrap().is_none());
        store.put(&sample_group("g1")).unwrap();
        store.put(&sample_group("g2")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["g1".to_string(), "g2".to_string()]);

        let loaded = store.get("g1").unwrap().unwrap();
        assert_eq!(loaded, sample_group_with_time("g1", loaded.created_at));

        assert!(store.delete("g1").unwrap());
        assert!(!store.delete("g1").unwrap());
        assert_eq!(store.list().unwrap(), vec!["g2".to_string()]);
    }

    fn sample_group_with_time(id: &str, t: chrono::DateTime<Utc>) -> JobGroup {
        let mut g = sample_group(id);
        g.created_at = t;
        g
    }

    #[test]
    fn memory_store_round_trip() {
        exercise(&MemoryJobStore::new());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path().join("temp_batch"));
        exercise(&store);
        assert!(store.record_path("g2").exists());
    }

    #[test]
    fn file_store_reports_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path());
        std::fs::write(store.record_path("bad"), b"{ not json").unwrap();
        assert!(matches!(store.get("bad"), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn inconsistent_groups_are_rejected() {
        let mut g = sample_group("g1");
        g.total_work_units = 5;
        assert!(matches!(
            MemoryJobStore::new().put(&g),
            Err(StoreError::Inconsistent { .. })
        ));
    }

    #[test]
    fn unsafe_ids_are_rejected() {
        let store = MemoryJobStore::new();
        assert!(matches!(store.get("../etc"), Err(StoreError::InvalidId { .. })));
        assert!(matches!(store.get(""), Err(StoreError::InvalidId { .. })));
    }
}
