//! Job Submitter: chunk, upload, create, pace, persist.
//!
//! ## Submission flow
//!
//! ```text
//! units ──▶ plan_chunks ──▶ for each chunk (sequentially):
//!                             build JSONL → upload → create batch
//!                             └─ not final? → AdmissionPacer
//!                          ──▶ JobGroup ──▶ JobStore::put
//! ```
//!
//! ## Failure handling
//!
//! | Error class | Effect |
//! |-------------|--------|
//! | Fatal (quota, auth) | stop; chunks already created stay in the group |
//! | Transient (429, 5xx) | retry with backoff, then skip the chunk |
//! | Skip (400, malformed) | skip the chunk |
//!
//! The group is written to the store before [`JobSubmitter::submit`]
//! returns, so a later process can resume monitoring from the record alone.

use super::pacing::{AdmissionOutcome, AdmissionPacer, PacerEvent, PacerState};
use super::request::{BuiltChunk, RequestBuilder};
use crate::backend::{BatchBackend, CreateBatch};
use crate::config::{BatchConfig, ChunkStrategy};
use crate::correlation::{CorrelationMap, MappingEntry};
use crate::error::{BatchError, SubmissionError};
use crate::model::{ChunkRecord, JobGroup, JobHandle, WorkUnit};
use crate::store::JobStore;
use chrono::Utc;
use std::collections::HashSet;
use std::ops::Range;
use tracing::{debug, info, warn};

/// Partition `n` units into contiguous chunk ranges, preserving order.
///
/// `n ≤ threshold` gives exactly one range; otherwise `ceil(n / threshold)`
/// ranges whose lengths sum to `n`.
pub fn plan_chunks(n: usize, threshold: usize, strategy: ChunkStrategy) -> Vec<Range<usize>> {
    let threshold = threshold.max(1);
    if n == 0 {
        return Vec::new();
    }
    if n <= threshold {
        return vec![0..n];
    }
    let count = n.div_ceil(threshold);
    match strategy {
        ChunkStrategy::FixedStride => (0..count)
            .map(|i| i * threshold..((i + 1) * threshold).min(n))
            .collect(),
        ChunkStrategy::Balanced => {
            let base = n / count;
            let extra = n % count;
            let mut start = 0;
            (0..count)
                .map(|i| {
                    let len = base + usize::from(i < extra);
                    let range = start..start + len;
                    start += len;
                    range
                })
                .collect()
        }
    }
}

/// A chunk that was not submitted.
#[derive(Debug, Clone)]
pub struct SkippedChunk {
    pub index: usize,
    pub correlation_ids: Vec<String>,
    pub error: SubmissionError,
}

/// Result of a submission that created at least one batch.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    /// The persisted group, holding only chunks that were created remotely.
    pub group: JobGroup,
    pub skipped_chunks: Vec<SkippedChunk>,
    /// Set when a fatal error stopped submission early.
    pub aborted: Option<SubmissionError>,
}

impl SubmissionOutcome {
    /// Every planned chunk was created.
    pub fn is_complete(&self) -> bool {
        self.skipped_chunks.is_empty() && self.aborted.is_none()
    }
}

/// Submits work units as one job group.
pub struct JobSubmitter<'a> {
    backend: &'a dyn BatchBackend,
    store: &'a dyn JobStore,
    config: &'a BatchConfig,
    pacer: &'a dyn AdmissionPacer,
}

impl<'a> JobSubmitter<'a> {
    pub fn new(
        backend: &'a dyn BatchBackend,
        store: &'a dyn JobStore,
        config: &'a BatchConfig,
        pacer: &'a dyn AdmissionPacer,
    ) -> Self {
        Self {
            backend,
            store,
            config,
            pacer,
        }
    }

    /// Submit `units` and persist the resulting group.
    ///
    /// Returns `Err(BatchError::Submission)` only when no chunk at all was
    /// created; the error is the last one encountered.
    pub async fn submit(&self, units: &mut [WorkUnit]) -> Result<SubmissionOutcome, BatchError> {
        if units.is_empty() {
            return Err(SubmissionError::MalformedRequest {
                detail: "no work units to submit".into(),
            }
            .into());
        }

        // Ids are unique across the whole group, not only within a chunk.
        let mut seen = HashSet::with_capacity(units.len());
        if let Some(dup) = units.iter().find(|u| !seen.insert(u.correlation_id.as_str())) {
            return Err(SubmissionError::MalformedRequest {
                detail: format!("duplicate correlation id '{}'", dup.correlation_id),
            }
            .into());
        }

        let cfg = self.config;
        let ranges = plan_chunks(units.len(), cfg.chunk_threshold, cfg.chunk_strategy);
        let total_chunks = ranges.len();
        let created_at = Utc::now();
        let group_id = JobGroup::new_id(created_at);
        let progress = cfg.progress_callback.as_ref();
        let builder = RequestBuilder::new(cfg);

        info!(
            "Submitting {} work unit(s) as {} chunk(s), group {}",
            units.len(),
            total_chunks,
            group_id
        );
        progress.on_submission_start(units.len(), total_chunks);

        let mut chunks: Vec<ChunkRecord> = Vec::with_capacity(total_chunks);
        let mut map = CorrelationMap::new();
        let mut skipped_chunks = Vec::new();
        let mut skipped_units: Vec<String> = Vec::new();
        let mut aborted: Option<SubmissionError> = None;
        let mut state = PacerState::Idle;

        for (index, range) in ranges.into_iter().enumerate() {
            let chunk_units = &mut units[range];

            if aborted.is_some() {
                for u in chunk_units.iter_mut() {
                    u.finish(false);
                    skipped_units.push(u.correlation_id.clone());
                }
                continue;
            }

            state = state.next(PacerEvent::StartSubmit)?;
            let is_final = index + 1 == total_chunks;

            let result = match builder.build_chunk(chunk_units) {
                Ok(built) if built.is_empty() => Err(SubmissionError::MalformedRequest {
                    detail: "no readable page images in chunk".into(),
                }),
                Ok(built) => {
                    let submitted = self.submit_chunk(&group_id, index, total_chunks, &built).await;
                    submitted.map(|handle| (handle, built))
                }
                Err(e) => Err(e),
            };

            match result {
                Ok((handle, built)) => {
                    state = state.next(PacerEvent::Submitted { is_final })?;
                    info!(
                        "Chunk {}/{} submitted: {} ({} units)",
                        index + 1,
                        total_chunks,
                        handle.job_id,
                        built.len()
                    );
                    progress.on_chunk_submitted(index, total_chunks, &handle.job_id, built.len());

                    for u in chunk_units.iter_mut() {
                        if built.unreadable.contains(&u.correlation_id) {
                            u.finish(false);
                            continue;
                        }
                        u.mark_submitted();
                        map.insert(
                            u.correlation_id.clone(),
                            MappingEntry {
                                document_id: u.document_id.clone(),
                                page_number: u.page_number,
                                working_dir: u.working_dir.clone(),
                            },
                        );
                    }
                    skipped_units.extend(built.unreadable);

                    let mut record = ChunkRecord {
                        index,
                        handle,
                        correlation_ids: built.correlation_ids,
                    };

                    if !is_final {
                        match self
                            .pacer
                            .await_admission(self.backend, &record.handle, progress)
                            .await
                        {
                            AdmissionOutcome::Admitted(latest) => record.handle.observe(latest),
                            AdmissionOutcome::TimedOut { waited } => debug!(
                                "Admission wait for {} ended after {}ms",
                                record.handle.job_id,
                                waited.as_millis()
                            ),
                            AdmissionOutcome::Skipped => {}
                        }
                        state = state.next(PacerEvent::AdmissionEnded)?;
                    }
                    chunks.push(record);
                }
                Err(error) => {
                    state = state.next(PacerEvent::SubmitFailed)?;
                    let ids: Vec<String> =
                        chunk_units.iter().map(|u| u.correlation_id.clone()).collect();
                    for u in chunk_units.iter_mut() {
                        u.finish(false);
                    }
                    skipped_units.extend(ids.iter().cloned());

                    if error.is_fatal() {
                        warn!(
                            "Chunk {}/{} hit a fatal error, stopping submission: {}",
                            index + 1,
                            total_chunks,
                            error
                        );
                        aborted = Some(error.clone());
                    } else {
                        warn!("Chunk {}/{} skipped: {}", index + 1, total_chunks, error);
                        progress.on_chunk_skipped(index, total_chunks, &error.to_string());
                    }
                    skipped_chunks.push(SkippedChunk {
                        index,
                        correlation_ids: ids,
                        error,
                    });
                }
            }
        }

        if chunks.is_empty() {
            let error = aborted
                .or_else(|| skipped_chunks.pop().map(|s| s.error))
                .unwrap_or_else(|| SubmissionError::MalformedRequest {
                    detail: "no chunk could be submitted".into(),
                });
            return Err(error.into());
        }

        let total_work_units = chunks.iter().map(ChunkRecord::len).sum();
        let group = JobGroup {
            group_id,
            chunks,
            total_work_units,
            correlation_map: map,
            created_at,
            model: cfg.model.clone(),
            skipped_work_units: skipped_units,
            protected_paths: cfg.protected_paths.clone(),
            retrieved_at: None,
        };
        self.store.put(&group)?;
        info!(
            "Job group {} persisted: {} chunk(s), {} work unit(s)",
            group.group_id,
            group.total_chunks(),
            group.total_work_units
        );

        Ok(SubmissionOutcome {
            group,
            skipped_chunks,
            aborted,
        })
    }

    /// Upload one chunk's request file and create its batch, with retries.
    async fn submit_chunk(
        &self,
        group_id: &str,
        index: usize,
        total_chunks: usize,
        built: &BuiltChunk,
    ) -> Result<JobHandle, SubmissionError> {
        let cfg = self.config;
        let retry = cfg.retry_policy();
        let file_name = format!("batch_requests_{group_id}_{index:03}.jsonl");

        // Local copy for inspection while the upload is in flight.
        let temp_dir = cfg.job_temp_dir();
        let local = temp_dir.join(&file_name);
        if let Err(e) = std::fs::create_dir_all(&temp_dir)
            .and_then(|_| std::fs::write(&local, &built.jsonl))
        {
            warn!("Could not write {}: {}", local.display(), e);
        }

        let upload_label = format!("upload chunk {}/{}", index + 1, total_chunks);
        let uploaded = retry
            .run(&upload_label, || {
                self.backend.upload_requests(&file_name, built.jsonl.clone())
            })
            .await;
        if local.exists() {
            if let Err(e) = std::fs::remove_file(&local) {
                debug!("Could not remove {}: {}", local.display(), e);
            }
        }
        let file_id =
            uploaded.map_err(|f| SubmissionError::from_backend(&f.error, f.attempts))?;

        let description = if total_chunks > 1 {
            format!(
                "PDF conversion batch - {} pages (chunk {}/{})",
                built.len(),
                index + 1,
                total_chunks
            )
        } else {
            format!("PDF conversion batch - {} pages", built.len())
        };
        let create_label = format!("create batch {}/{}", index + 1, total_chunks);
        let remote = retry
            .run(&create_label, || {
                self.backend.create_batch(CreateBatch {
                    input_file_id: &file_id,
                    endpoint: &cfg.endpoint,
                    completion_window: &cfg.completion_window,
                    description: &description,
                })
            })
            .await
            .map_err(|f| SubmissionError::from_backend(&f.error, f.attempts))?;

        Ok(remote.into())
    }
}
