//! Remote batch service contract.
//!
//! [`BatchBackend`] is the only seam between orchestration and the network.
//! Submitter, monitor and retriever take an `&dyn BatchBackend`; the
//! production implementation is [`openai::OpenAiBatchClient`], tests use a
//! scripted in-process fake.
//!
//! Implementations perform exactly one attempt per call. Retrying is
//! [`crate::retry::RetryPolicy`]'s job, driven by
//! [`BackendError`]'s classification.

pub mod mock;
pub mod openai;

use crate::error::BackendError;
use crate::model::{JobHandle, JobStatus, RequestCounts};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A batch object as reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBatch {
    pub id: String,
    /// Raw remote status string, mapped through [`JobStatus::from_remote`].
    pub status: String,
    #[serde(default)]
    pub request_counts: RequestCounts,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
}

impl RemoteBatch {
    pub fn job_status(&self) -> JobStatus {
        JobStatus::from_remote(&self.status)
    }
}

impl From<RemoteBatch> for JobHandle {
    fn from(b: RemoteBatch) -> Self {
        JobHandle {
            status: b.job_status(),
            job_id: b.id,
            request_counts: b.request_counts,
            output_file_id: b.output_file_id,
            error_file_id: b.error_file_id,
        }
    }
}

/// Parameters for creating one batch from an uploaded request file.
#[derive(Debug, Clone)]
pub struct CreateBatch<'a> {
    pub input_file_id: &'a str,
    pub endpoint: &'a str,
    pub completion_window: &'a str,
    pub description: &'a str,
}

/// Files + Batches API of an OpenAI-compatible service.
#[async_trait]
pub trait BatchBackend: Send + Sync {
    /// Upload a JSONL request file; returns the remote file id.
    async fn upload_requests(&self, file_name: &str, body: Vec<u8>)
        -> Result<String, BackendError>;

    /// Create a batch job over an uploaded file.
    async fn create_batch(&self, request: CreateBatch<'_>) -> Result<RemoteBatch, BackendError>;

    /// Read the current state of a batch job.
    async fn get_batch(&self, job_id: &str) -> Result<RemoteBatch, BackendError>;

    /// Download a file's content (JSONL output or error file).
    async fn download_file(&self, file_id: &str) -> Result<String, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_batch_parses_service_json() {
        let json = r#"{
            "id": "batch_abc123",
            "object": "batch",
            "endpoint": "/v1/chat/completions",
            "status": "in_progress",
            "request_counts": {"total": 100, "completed": 42, "failed": 1},
            "output_file_id": null
        }"#;
        let batch: RemoteBatch = serde_json::from_str(json).unwrap();
        let handle = JobHandle::from(batch);
        assert_eq!(handle.job_id, "batch_abc123");
        assert_eq!(handle.status, JobStatus::InProgress);
        assert_eq!(handle.request_counts.completed, 42);
        assert_eq!(handle.request_counts.total, 100);
        assert!(handle.output_file_id.is_none());
    }

    #[test]
    fn missing_counts_default_to_zero() {
        let batch: RemoteBatch =
            serde_json::from_str(r#"{"id":"b","status":"validating"}"#).unwrap();
        assert_eq!(batch.request_counts, RequestCounts::default());
        assert!(batch.job_status().is_initial());
    }
}
