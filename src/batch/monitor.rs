//! Status Monitor: poll every chunk and fold the results into one view.
//!
//! ## Aggregation rules
//!
//! * A chunk in `failed`, `expired` or `cancelled` is failed.
//! * A chunk reporting `completed` with zero completed requests out of a
//!   non-zero total is **structurally failed** and counted as failed too.
//! * `completed_work_units` sums the `completed` counter of non-failed
//!   chunks only. A failed chunk's counter is not trusted.
//!
//! ## Progress policy
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | every chunk completed | [`ProgressDecision::Success`] |
//! | any failed, completed units **>** 50 % | [`ProgressDecision::PartialSuccess`] |
//! | any failed, completed units ≤ 50 % | [`ProgressDecision::Failed`] |
//! | otherwise | [`ProgressDecision::Pending`] |
//!
//! [`StatusMonitor::wait`] re-polls at a fixed interval with no overall
//! deadline. Cancellation is checked between iterations only.

use crate::backend::BatchBackend;
use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::model::{JobGroup, JobStatus};
use crate::progress::BatchProgressCallback;
use crate::store::JobStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Fraction of work units that must have completed, strictly exceeded, for a
/// group with failed chunks to be accepted.
pub const PARTIAL_SUCCESS_THRESHOLD: f64 = 0.5;

/// Latest known state of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkProgress {
    pub index: usize,
    pub job_id: String,
    pub status: JobStatus,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    /// Reported `completed` but nothing in it succeeded.
    pub structurally_failed: bool,
    /// Error of the most recent poll, if it failed.
    pub poll_error: Option<String>,
}

impl ChunkProgress {
    pub fn is_failed(&self) -> bool {
        self.status.is_failure() || self.structurally_failed
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed && !self.structurally_failed
    }
}

/// Aggregate progress of a job group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupProgress {
    pub group_id: String,
    pub total_chunks: usize,
    pub completed_chunks: usize,
    pub failed_chunks: usize,
    pub in_progress_chunks: usize,
    pub completed_work_units: usize,
    pub total_work_units: usize,
    pub chunks: Vec<ChunkProgress>,
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressDecision {
    Success,
    PartialSuccess { fraction: f64 },
    Failed { fraction: f64 },
    Pending,
}

impl ProgressDecision {
    /// Retrieval may proceed.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            ProgressDecision::Success | ProgressDecision::PartialSuccess { .. }
        )
    }
}

impl GroupProgress {
    /// Aggregate the handles currently stored in `group`.
    pub fn from_group(group: &JobGroup) -> Self {
        let chunks: Vec<ChunkProgress> = group
            .chunks
            .iter()
            .map(|c| {
                let counts = c.handle.request_counts;
                let status = c.handle.status;
                ChunkProgress {
                    index: c.index,
                    job_id: c.handle.job_id.clone(),
                    status,
                    completed: counts.completed,
                    failed: counts.failed,
                    total: counts.total,
                    structurally_failed: status == JobStatus::Completed
                        && counts.completed == 0
                        && counts.total > 0,
                    poll_error: None,
                }
            })
            .collect();

        let completed_chunks = chunks.iter().filter(|c| c.is_completed()).count();
        let failed_chunks = chunks.iter().filter(|c| c.is_failed()).count();
        let completed_work_units = chunks
            .iter()
            .filter(|c| !c.is_failed())
            .map(|c| c.completed)
            .sum();

        Self {
            group_id: group.group_id.clone(),
            total_chunks: chunks.len(),
            completed_chunks,
            failed_chunks,
            in_progress_chunks: chunks.len() - completed_chunks - failed_chunks,
            completed_work_units,
            total_work_units: group.total_work_units,
            chunks,
        }
    }

    pub fn all_completed(&self) -> bool {
        self.total_chunks > 0 && self.completed_chunks == self.total_chunks
    }

    pub fn any_failed(&self) -> bool {
        self.failed_chunks > 0
    }

    /// `completed_work_units / total_work_units`, 0 for an empty group.
    pub fn completion_fraction(&self) -> f64 {
        if self.total_work_units == 0 {
            0.0
        } else {
            self.completed_work_units as f64 / self.total_work_units as f64
        }
    }

    /// Apply the progress policy.
    pub fn decide(&self) -> ProgressDecision {
        let fraction = self.completion_fraction();
        if self.all_completed() {
            ProgressDecision::Success
        } else if self.any_failed() {
            // completed > 0.5 × total, in integers.
            if 2 * self.completed_work_units > self.total_work_units {
                ProgressDecision::PartialSuccess { fraction }
            } else {
                ProgressDecision::Failed { fraction }
            }
        } else {
            ProgressDecision::Pending
        }
    }
}

/// Final state of a [`StatusMonitor::wait`] that was not a failure.
#[derive(Debug, Clone)]
pub struct MonitorOutcome {
    pub group: JobGroup,
    pub progress: GroupProgress,
    pub decision: ProgressDecision,
    pub polls: usize,
}

/// Polls a job group's chunks through a [`BatchBackend`].
pub struct StatusMonitor<'a> {
    backend: &'a dyn BatchBackend,
    store: &'a dyn JobStore,
    interval: Duration,
    progress: &'a dyn BatchProgressCallback,
}

impl<'a> StatusMonitor<'a> {
    pub fn new(
        backend: &'a dyn BatchBackend,
        store: &'a dyn JobStore,
        config: &'a BatchConfig,
    ) -> Self {
        Self {
            backend,
            store,
            interval: config.poll_interval(),
            progress: config.progress_callback.as_ref(),
        }
    }

    /// Poll every non-terminal chunk once and fold the answers into `group`.
    ///
    /// A failed poll keeps the chunk's previous status; siblings are still
    /// polled.
    pub async fn poll_once(&self, group: &mut JobGroup) -> GroupProgress {
        let mut errors: Vec<(usize, String)> = Vec::new();
        for (pos, chunk) in group.chunks.iter_mut().enumerate() {
            if chunk.handle.status.is_terminal() {
                continue;
            }
            match self.backend.get_batch(&chunk.handle.job_id).await {
                Ok(remote) => {
                    let before = chunk.handle.status;
                    chunk.handle.observe(remote.into());
                    if before != chunk.handle.status {
                        debug!(
                            "Chunk {} ({}): {} → {}",
                            chunk.index, chunk.handle.job_id, before, chunk.handle.status
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "Status poll for chunk {} ({}) failed, keeping {}: {}",
                        chunk.index, chunk.handle.job_id, chunk.handle.status, e
                    );
                    errors.push((pos, e.to_string()));
                }
            }
        }

        let mut progress = GroupProgress::from_group(group);
        for (pos, err) in errors {
            if let Some(c) = progress.chunks.get_mut(pos) {
                c.poll_error = Some(err);
            }
        }
        progress
    }

    /// Poll until the group is accepted or failed, persisting each observation.
    ///
    /// Returns `Err(BatchError::GroupFailed)` when the policy rejects the
    /// group and `Err(BatchError::Cancelled)` when `cancel` is set.
    pub async fn wait(
        &self,
        mut group: JobGroup,
        cancel: &AtomicBool,
    ) -> Result<MonitorOutcome, BatchError> {
        let mut polls = 0usize;
        loop {
            if cancel.load(Ordering::SeqCst) {
                info!("Monitoring of {} cancelled after {} poll(s)", group.group_id, polls);
                return Err(BatchError::Cancelled {
                    group_id: group.group_id,
                });
            }

            let progress = self.poll_once(&mut group).await;
            polls += 1;
            self.store.put(&group)?;
            self.progress.on_poll(&progress);

            info!(
                "Group {}: {}/{} chunks completed, {} failed, {}/{} units ({:.1}%)",
                group.group_id,
                progress.completed_chunks,
                progress.total_chunks,
                progress.failed_chunks,
                progress.completed_work_units,
                progress.total_work_units,
                progress.completion_fraction() * 100.0
            );

            match progress.decide() {
                ProgressDecision::Pending => sleep(self.interval).await,
                ProgressDecision::Failed { .. } => {
                    return Err(BatchError::GroupFailed {
                        group_id: group.group_id,
                        failed_chunks: progress.failed_chunks,
                        completed: progress.completed_work_units,
                        total: progress.total_work_units,
                    });
                }
                decision => {
                    if let ProgressDecision::PartialSuccess { fraction } = decision {
                        warn!(
                            "Group {} accepted as partial success: {} chunk(s) failed, {:.1}% of units completed",
                            group.group_id,
                            progress.failed_chunks,
                            fraction * 100.0
                        );
                    }
                    return Ok(MonitorOutcome {
                        group,
                        progress,
                        decision,
                        polls,
                    });
                }
            }
        }
    }
}
