//! In-process [`BatchBackend`] for tests and dry runs.
//!
//! Uploaded files are kept in memory. Each created batch follows a
//! [`JobPlan`]: a scripted sequence of remote statuses advanced by one step
//! per `get_batch` call. When a batch reaches `completed` an output file is
//! generated with one successful line per completed request.
//!
//! ```rust
//! use edgequake_pdf2md_batch::backend::mock::{JobPlan, MockBatchBackend};
//!
//! let backend = MockBatchBackend::new();
//! backend.plan_job(1, JobPlan::failing());
//! ```

use super::{BatchBackend, CreateBatch, RemoteBatch};
use crate::error::BackendError;
use crate::model::{RequestCounts, TokenUsage};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Scripted behaviour of one batch.
#[derive(Debug, Clone)]
pub struct JobPlan {
    /// Status reported on the 1st, 2nd, … poll; the last one repeats.
    pub statuses: Vec<String>,
    /// Requests reported completed once terminal. `None` means all of them.
    pub completed: Option<usize>,
    /// Usage reported for every output line.
    pub usage: TokenUsage,
    /// Replaces the generated output file verbatim.
    pub output: Option<String>,
}

impl Default for JobPlan {
    fn default() -> Self {
        Self::with_statuses(&["in_progress", "completed"])
    }
}

impl JobPlan {
    pub fn with_statuses(statuses: &[&str]) -> Self {
        Self {
            statuses: statuses.iter().map(|s| s.to_string()).collect(),
            completed: None,
            usage: TokenUsage::new(100, 50),
            output: None,
        }
    }

    /// Ends `failed` with no output.
    pub fn failing() -> Self {
        Self {
            completed: Some(0),
            ..Self::with_statuses(&["in_progress", "failed"])
        }
    }

    /// Never leaves `in_progress`, reporting `completed` requests done.
    pub fn stuck(completed: usize) -> Self {
        Self {
            completed: Some(completed),
            ..Self::with_statuses(&["in_progress"])
        }
    }

    pub fn completed_count(mut self, n: usize) -> Self {
        self.completed = Some(n);
        self
    }

    pub fn usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn output(mut self, raw: impl Into<String>) -> Self {
        self.output = Some(raw.into());
        self
    }
}

#[derive(Debug)]
struct MockBatch {
    id: String,
    correlation_ids: Vec<String>,
    plan: JobPlan,
    polls: usize,
    output_file_id: Option<String>,
    description: String,
}

#[derive(Debug, Default)]
struct MockState {
    next_file: usize,
    files: HashMap<String, String>,
    batches: Vec<MockBatch>,
    plans: HashMap<usize, JobPlan>,
    upload_errors: VecDeque<BackendError>,
    create_errors: VecDeque<BackendError>,
    create_failures: HashMap<usize, BackendError>,
    creates: usize,
    poll_errors: VecDeque<BackendError>,
    uploads: usize,
}

/// Scripted in-memory batch service.
#[derive(Debug, Default)]
pub struct MockBatchBackend {
    state: Mutex<MockState>,
}

impl MockBatchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Use `plan` for the batch created `index`-th (0-based).
    pub fn plan_job(&self, index: usize, plan: JobPlan) {
        self.state().plans.insert(index, plan);
    }

    /// Fail the next upload calls with these errors, in order.
    pub fn fail_uploads(&self, errors: impl IntoIterator<Item = BackendError>) {
        self.state().upload_errors.extend(errors);
    }

    /// Fail the next create calls with these errors, in order.
    pub fn fail_creates(&self, errors: impl IntoIterator<Item = BackendError>) {
        self.state().create_errors.extend(errors);
    }

    /// Fail the `call`-th create call (0-based, retries included).
    pub fn fail_create_call(&self, call: usize, error: BackendError) {
        self.state().create_failures.insert(call, error);
    }

    /// Fail the next status polls with these errors, in order.
    pub fn fail_polls(&self, errors: impl IntoIterator<Item = BackendError>) {
        self.state().poll_errors.extend(errors);
    }

    /// Correlation ids of every created batch, in creation order.
    pub fn created_batches(&self) -> Vec<(String, Vec<String>)> {
        self.state()
            .batches
            .iter()
            .map(|b| (b.id.clone(), b.correlation_ids.clone()))
            .collect()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.state().batches.iter().map(|b| b.description.clone()).collect()
    }

    /// Upload attempts, including failed ones.
    pub fn upload_calls(&self) -> usize {
        self.state().uploads
    }
}

fn output_for(ids: &[String], usage: TokenUsage) -> String {
    ids.iter()
        .map(|id| {
            json!({
                "id": format!("batch_req_{id}"),
                "custom_id": id,
                "response": {
                    "status_code": 200,
                    "body": {
                        "choices": [{ "message": { "role": "assistant", "content": format!("Content of {id}") } }],
                        "usage": usage,
                    }
                },
                "error": null
            })
            .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn snapshot(state: &mut MockState, index: usize) -> RemoteBatch {
    let batch = &mut state.batches[index];
    let step = batch.polls.saturating_sub(1).min(batch.plan.statuses.len().saturating_sub(1));
    let status = if batch.polls == 0 {
        "validating".to_string()
    } else {
        batch
            .plan
            .statuses
            .get(step)
            .cloned()
            .unwrap_or_else(|| "completed".to_string())
    };
    let total = batch.correlation_ids.len();
    let completed = match status.as_str() {
        "completed" | "failed" | "expired" | "cancelled" | "in_progress" | "finalizing" => {
            batch.plan.completed.unwrap_or(if status == "completed" { total } else { 0 })
        }
        _ => 0,
    }
    .min(total);

    let mut pending_file = None;
    if status == "completed" && batch.output_file_id.is_none() && completed > 0 {
        let id = format!("file-out-{}", batch.id);
        let content = batch
            .plan
            .output
            .clone()
            .unwrap_or_else(|| output_for(&batch.correlation_ids[..completed], batch.plan.usage));
        batch.output_file_id = Some(id.clone());
        pending_file = Some((id, content));
    }
    let remote = RemoteBatch {
        id: batch.id.clone(),
        status: status.clone(),
        request_counts: RequestCounts {
            completed,
            failed: if status == "completed" || status == "failed" {
                total - completed
            } else {
                0
            },
            total,
        },
        output_file_id: batch.output_file_id.clone(),
        error_file_id: None,
    };
    if let Some((id, content)) = pending_file {
        state.files.insert(id, content);
    }
    remote
}

#[async_trait]
impl BatchBackend for MockBatchBackend {
    async fn upload_requests(
        &self,
        file_name: &str,
        body: Vec<u8>,
    ) -> Result<String, BackendError> {
        let mut state = self.state();
        state.uploads += 1;
        if let Some(err) = state.upload_errors.pop_front() {
            return Err(err);
        }
        let content = String::from_utf8(body).map_err(|e| BackendError::BadRequest {
            status: 400,
            detail: format!("{file_name}: {e}"),
        })?;
        state.next_file += 1;
        let id = format!("file-in-{}", state.next_file);
        state.files.insert(id.clone(), content);
        Ok(id)
    }

    async fn create_batch(&self, request: CreateBatch<'_>) -> Result<RemoteBatch, BackendError> {
        let mut state = self.state();
        let call = state.creates;
        state.creates += 1;
        if let Some(err) = state.create_failures.remove(&call) {
            return Err(err);
        }
        if let Some(err) = state.create_errors.pop_front() {
            return Err(err);
        }
        let content = state
            .files
            .get(request.input_file_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                resource: request.input_file_id.to_string(),
            })?;
        let mut correlation_ids = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let v: serde_json::Value =
                serde_json::from_str(line).map_err(|e| BackendError::BadRequest {
                    status: 400,
                    detail: e.to_string(),
                })?;
            let id = v["custom_id"].as_str().ok_or_else(|| BackendError::BadRequest {
                status: 400,
                detail: "line without custom_id".into(),
            })?;
            correlation_ids.push(id.to_string());
        }

        let index = state.batches.len();
        let plan = state.plans.remove(&index).unwrap_or_default();
        state.batches.push(MockBatch {
            id: format!("batch_{:03}", index + 1),
            correlation_ids,
            plan,
            polls: 0,
            output_file_id: None,
            description: request.description.to_string(),
        });
        Ok(snapshot(&mut state, index))
    }

    async fn get_batch(&self, job_id: &str) -> Result<RemoteBatch, BackendError> {
        let mut state = self.state();
        if let Some(err) = state.poll_errors.pop_front() {
            return Err(err);
        }
        let index = state
            .batches
            .iter()
            .position(|b| b.id == job_id)
            .ok_or_else(|| BackendError::NotFound {
                resource: job_id.to_string(),
            })?;
        state.batches[index].polls += 1;
        Ok(snapshot(&mut state, index))
    }

    async fn download_file(&self, file_id: &str) -> Result<String, BackendError> {
        self.state()
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                resource: file_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create(backend: &MockBatchBackend, ids: &[&str]) -> RemoteBatch {
        let body = ids
            .iter()
            .map(|id| format!(r#"{{"custom_id":"{id}"}}"#))
            .collect::<Vec<_>>()
            .join("\n");
        let file = backend.upload_requests("x.jsonl", body.into_bytes()).await.unwrap();
        backend
            .create_batch(CreateBatch {
                input_file_id: &file,
                endpoint: "/v1/chat/completions",
                completion_window: "24h",
                description: "test",
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn default_plan_completes_on_second_poll() {
        let backend = MockBatchBackend::new();
        let created = create(&backend, &["a_page_0001", "a_page_0002"]).await;
        assert_eq!(created.status, "validating");

        assert_eq!(backend.get_batch(&created.id).await.unwrap().status, "in_progress");
        let done = backend.get_batch(&created.id).await.unwrap();
        assert_eq!(done.status, "completed");
        assert_eq!(done.request_counts.completed, 2);

        let out = backend
            .download_file(done.output_file_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(out.contains("Content of a_page_0002"));
    }

    #[tokio::test]
    async fn failing_plan_has_no_output() {
        let backend = MockBatchBackend::new();
        backend.plan_job(0, JobPlan::failing());
        let created = create(&backend, &["a_page_0001"]).await;
        backend.get_batch(&created.id).await.unwrap();
        let failed = backend.get_batch(&created.id).await.unwrap();
        assert_eq!(failed.status, "failed");
        assert!(failed.output_file_id.is_none());
    }
}
