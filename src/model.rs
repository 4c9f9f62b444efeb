//! Core records of a batch run: work units, remote job handles, chunks and
//! the job group that ties them together.
//!
//! A [`JobGroup`] is the only state shared across process invocations. It is
//! serialised as JSON by a [`crate::store::JobStore`] so `status`,
//! `retrieve`, and `cleanup` can run in a later process than `submit`.

use crate::correlation::{self, CorrelationMap};
use crate::error::{BatchError, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of one inference request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitStatus {
    Pending,
    Submitted,
    Completed,
    Failed,
}

impl WorkUnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkUnitStatus::Completed | WorkUnitStatus::Failed)
    }
}

/// One page image to be converted by one request line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub correlation_id: String,
    pub document_id: String,
    pub page_number: u32,
    /// Pre-rendered page image sent as the request payload.
    pub image_path: PathBuf,
    /// Directory holding this document's working files.
    pub working_dir: PathBuf,
    status: WorkUnitStatus,
}

impl WorkUnit {
    pub fn new(
        document_id: impl Into<String>,
        page_number: u32,
        image_path: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Result<Self, BatchError> {
        let document_id = document_id.into();
        let correlation_id = correlation::format_id(&document_id, page_number)?;
        Ok(Self {
            correlation_id,
            document_id,
            page_number,
            image_path: image_path.into(),
            working_dir: working_dir.into(),
            status: WorkUnitStatus::Pending,
        })
    }

    pub fn status(&self) -> WorkUnitStatus {
        self.status
    }

    /// Pending → Submitted. No effect on any other state.
    pub fn mark_submitted(&mut self) {
        if self.status == WorkUnitStatus::Pending {
            self.status = WorkUnitStatus::Submitted;
        }
    }

    /// Move to a terminal state. Returns `false` (and changes nothing) if the
    /// unit already reached one.
    pub fn finish(&mut self, success: bool) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = if success {
            WorkUnitStatus::Completed
        } else {
            WorkUnitStatus::Failed
        };
        true
    }
}

/// Status of one remote batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Validating,
    Queued,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl JobStatus {
    /// Map the remote status string. Unknown values count as in progress.
    pub fn from_remote(status: &str) -> Self {
        match status {
            "validating" => JobStatus::Validating,
            "queued" => JobStatus::Queued,
            "in_progress" | "cancelling" => JobStatus::InProgress,
            "finalizing" => JobStatus::Finalizing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "expired" => JobStatus::Expired,
            "cancelled" => JobStatus::Cancelled,
            other => {
                tracing::warn!("Unknown remote job status '{}', treating as in progress", other);
                JobStatus::InProgress
            }
        }
    }

    /// Still waiting for admission.
    pub fn is_initial(self) -> bool {
        matches!(self, JobStatus::Validating | JobStatus::Queued)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Expired | JobStatus::Cancelled
        )
    }

    /// Terminal without usable output.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Expired | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Validating => "validating",
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-job request counters reported by the remote service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub total: usize,
}

/// Remote-assigned handle for one submitted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub request_counts: RequestCounts,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
}

impl JobHandle {
    /// Fold in a freshly polled observation.
    ///
    /// Terminal states have no exit: once a handle is terminal its status
    /// stays put, though counters and file ids may still be filled in.
    pub fn observe(&mut self, latest: JobHandle) {
        if !self.status.is_terminal() {
            self.status = latest.status;
        }
        self.request_counts = latest.request_counts;
        if latest.output_file_id.is_some() {
            self.output_file_id = latest.output_file_id;
        }
        if latest.error_file_id.is_some() {
            self.error_file_id = latest.error_file_id;
        }
    }
}

/// One submitted chunk: its remote handle plus the ids it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: usize,
    pub handle: JobHandle,
    pub correlation_ids: Vec<String>,
}

impl ChunkRecord {
    pub fn len(&self) -> usize {
        self.correlation_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.correlation_ids.is_empty()
    }
}

/// Aggregate of every chunk from one logical submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobGroup {
    pub group_id: String,
    pub chunks: Vec<ChunkRecord>,
    /// Always equal to the sum of chunk sizes.
    pub total_work_units: usize,
    pub correlation_map: CorrelationMap,
    pub created_at: DateTime<Utc>,
    pub model: String,
    /// Units dropped at submission time (unreadable image, chunk skipped
    /// after retries). Not part of any chunk.
    #[serde(default)]
    pub skipped_work_units: Vec<String>,
    /// Inputs that cleanup keeps regardless of scope, recorded at submission.
    #[serde(default)]
    pub protected_paths: Vec<PathBuf>,
    #[serde(default)]
    pub retrieved_at: Option<DateTime<Utc>>,
}

impl JobGroup {
    /// Generate a fresh group id, e.g. `group_20250716T101500_1a2b3c4d`.
    pub fn new_id(now: DateTime<Utc>) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("group_{}_{}", now.format("%Y%m%dT%H%M%S"), &suffix[..8])
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_chunked(&self) -> bool {
        self.chunks.len() > 1
    }

    pub fn job_ids(&self) -> Vec<&str> {
        self.chunks.iter().map(|c| c.handle.job_id.as_str()).collect()
    }

    /// At least one chunk has not reached a terminal state yet.
    pub fn is_active(&self) -> bool {
        self.chunks.iter().any(|c| !c.handle.status.is_terminal())
    }

    pub fn is_retrieved(&self) -> bool {
        self.retrieved_at.is_some()
    }

    pub fn working_dirs(&self) -> Vec<PathBuf> {
        self.correlation_map.working_dirs()
    }

    /// Check the structural invariants of a loaded or freshly built record.
    pub fn validate(&self) -> Result<(), StoreError> {
        let inconsistent = |detail: String| StoreError::Inconsistent {
            group_id: self.group_id.clone(),
            detail,
        };
        let sum: usize = self.chunks.iter().map(ChunkRecord::len).sum();
        if sum != self.total_work_units {
            return Err(inconsistent(format!(
                "total_work_units is {} but chunks hold {}",
                self.total_work_units, sum
            )));
        }
        let mut seen = std::collections::HashSet::with_capacity(sum);
        for id in self.chunks.iter().flat_map(|c| c.correlation_ids.iter()) {
            if !seen.insert(id.as_str()) {
                return Err(inconsistent(format!("duplicate correlation id '{id}'")));
            }
        }
        Ok(())
    }
}

/// Reported token counters for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// `total_tokens` if reported, else prompt + completion.
    pub fn effective_total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }
}

/// Token usage attributed to one page of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub correlation_id: String,
    pub document_id: String,
    pub page_number: u32,
    pub usage: TokenUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(status: JobStatus, completed: usize, total: usize) -> JobHandle {
        JobHandle {
            job_id: "batch_1".into(),
            status,
            request_counts: RequestCounts {
                completed,
                failed: 0,
                total,
            },
            output_file_id: None,
            error_file_id: None,
        }
    }

    #[test]
    fn work_unit_reaches_terminal_state_once() {
        let mut unit = WorkUnit::new("doc", 1, "doc/page_0001.png", "doc").unwrap();
        assert_eq!(unit.correlation_id, "doc_page_0001");
        assert_eq!(unit.status(), WorkUnitStatus::Pending);
        unit.mark_submitted();
        assert_eq!(unit.status(), WorkUnitStatus::Submitted);
        assert!(unit.finish(true));
        assert!(!unit.finish(false));
        assert_eq!(unit.status(), WorkUnitStatus::Completed);
        unit.mark_submitted();
        assert_eq!(unit.status(), WorkUnitStatus::Completed);
    }

    #[test]
    fn remote_status_mapping() {
        assert_eq!(JobStatus::from_remote("validating"), JobStatus::Validating);
        assert_eq!(JobStatus::from_remote("in_progress"), JobStatus::InProgress);
        assert_eq!(JobStatus::from_remote("cancelling"), JobStatus::InProgress);
        assert_eq!(JobStatus::from_remote("expired"), JobStatus::Expired);
        assert_eq!(JobStatus::from_remote("something_new"), JobStatus::InProgress);
        assert!(JobStatus::Expired.is_failure());
        assert!(JobStatus::Queued.is_initial());
        assert!(!JobStatus::Finalizing.is_terminal());
    }

    #[test]
    fn terminal_handles_do_not_regress() {
        let mut h = handle(JobStatus::Completed, 10, 10);
        h.observe(handle(JobStatus::InProgress, 10, 10));
        assert_eq!(h.status, JobStatus::Completed);

        let mut h = handle(JobStatus::Validating, 0, 10);
        h.observe(handle(JobStatus::InProgress, 4, 10));
        assert_eq!(h.status, JobStatus::InProgress);
        assert_eq!(h.request_counts.completed, 4);
    }

    #[test]
    fn validate_checks_totals_and_uniqueness() {
        let chunk = |index, ids: &[&str]| ChunkRecord {
            index,
            handle: handle(JobStatus::Validating, 0, ids.len()),
            correlation_ids: ids.iter().map(|s| s.to_string()).collect(),
        };
        let mut group = JobGroup {
            group_id: "g".into(),
            chunks: vec![chunk(0, &["a_page_0001", "a_page_0002"]), chunk(1, &["b_page_0001"])],
            total_work_units: 3,
            correlation_map: CorrelationMap::new(),
            created_at: Utc::now(),
            model: "gpt-4o-mini".into(),
            skipped_work_units: vec![],
            protected_paths: vec![],
            retrieved_at: None,
        };
        assert!(group.validate().is_ok());
        assert!(group.is_chunked());
        assert!(group.is_active());

        group.total_work_units = 4;
        assert!(group.validate().is_err());

        group.total_work_units = 3;
        group.chunks[1].correlation_ids[0] = "a_page_0001".into();
        assert!(group.validate().is_err());
    }

    #[test]
    fn group_ids_are_unique_and_prefixed() {
        let now = Utc::now();
        let a = JobGroup::new_id(now);
        let b = JobGroup::new_id(now);
        assert!(a.starts_with("group_"));
        assert_ne!(a, b);
    }

    #[test]
    fn effective_total_falls_back_to_sum() {
        let u = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 0,
        };
        assert_eq!(u.effective_total(), 150);
        assert_eq!(TokenUsage::new(1, 2).total_tokens, 3);
    }
}
