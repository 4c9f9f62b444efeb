//! Admission pacing between chunk submissions.
//!
//! The remote service validates uploads through a shared admission queue.
//! Submitting the next chunk while the previous one is still `validating`
//! tends to get both rejected, so the submitter walks an explicit sequencer:
//!
//! ```text
//!         StartSubmit            Submitted{final: false}
//!  Idle ───────────────▶ Submitting ─────────────────────▶ AwaitingAdmission
//!   ▲                      │  │                                  │
//!   │   Submitted{final}   │  │ SubmitFailed                     │ AdmissionEnded
//!   └──────────────────────┴──┴──────────────────────────────────┘
//! ```
//!
//! What happens in `AwaitingAdmission` is the [`AdmissionPacer`]'s business:
//! [`SequentialPacer`] polls until the chunk leaves its initial state, and
//! [`NoPacing`] returns at once.

use crate::backend::BatchBackend;
use crate::error::BatchError;
use crate::model::JobHandle;
use crate::progress::BatchProgressCallback;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Position of the submitter in the submit/wait cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    Idle,
    Submitting,
    AwaitingAdmission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerEvent {
    StartSubmit,
    Submitted { is_final: bool },
    SubmitFailed,
    AdmissionEnded,
}

impl PacerState {
    /// Apply an event. Any pairing outside the diagram is an internal error.
    pub fn next(self, event: PacerEvent) -> Result<PacerState, BatchError> {
        use PacerEvent::*;
        use PacerState::*;
        match (self, event) {
            (Idle, StartSubmit) => Ok(Submitting),
            (Submitting, Submitted { is_final: false }) => Ok(AwaitingAdmission),
            (Submitting, Submitted { is_final: true }) | (Submitting, SubmitFailed) => Ok(Idle),
            (AwaitingAdmission, AdmissionEnded) => Ok(Idle),
            (state, event) => Err(BatchError::Internal(format!(
                "invalid pacing transition {event:?} from {state:?}"
            ))),
        }
    }
}

/// How the admission wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// The chunk left `validating`/`queued`; carries the latest handle.
    Admitted(JobHandle),
    /// The wait ran out; submission continues anyway.
    TimedOut { waited: Duration },
    /// The pacer does not wait.
    Skipped,
}

/// Strategy for the `AwaitingAdmission` state.
#[async_trait]
pub trait AdmissionPacer: Send + Sync {
    async fn await_admission(
        &self,
        backend: &dyn BatchBackend,
        handle: &JobHandle,
        progress: &dyn BatchProgressCallback,
    ) -> AdmissionOutcome;
}

/// Poll the chunk at a fixed interval until it is admitted or the bounded
/// wait expires. Polling errors are logged and the wait continues.
#[derive(Debug, Clone, Copy)]
pub struct SequentialPacer {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl SequentialPacer {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

#[async_trait]
impl AdmissionPacer for SequentialPacer {
    async fn await_admission(
        &self,
        backend: &dyn BatchBackend,
        handle: &JobHandle,
        progress: &dyn BatchProgressCallback,
    ) -> AdmissionOutcome {
        let mut waited = Duration::ZERO;
        loop {
            match backend.get_batch(&handle.job_id).await {
                Ok(remote) => {
                    let status = remote.job_status();
                    if !status.is_initial() {
                        debug!("Batch {} admitted ({})", handle.job_id, status);
                        return AdmissionOutcome::Admitted(remote.into());
                    }
                    progress.on_admission_wait(&handle.job_id, &remote.status, waited.as_millis() as u64);
                }
                Err(e) => warn!("Admission check for {} failed: {}", handle.job_id, e),
            }

            if waited >= self.timeout {
                info!(
                    "Batch {} still not admitted after {}s, continuing",
                    handle.job_id,
                    waited.as_secs()
                );
                return AdmissionOutcome::TimedOut { waited };
            }
            sleep(self.poll_interval).await;
            waited += self.poll_interval;
        }
    }
}

/// Submit back to back.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPacing;

#[async_trait]
impl AdmissionPacer for NoPacing {
    async fn await_admission(
        &self,
        _backend: &dyn BatchBackend,
        _handle: &JobHandle,
        _progress: &dyn BatchProgressCallback,
    ) -> AdmissionOutcome {
        AdmissionOutcome::Skipped
    }
}
