//! Error types for the edgequake-pdf2md-batch library.
//!
//! The taxonomy mirrors how failures propagate through a batch run:
//!
//! * [`BackendError`]: a single remote call failed. Every variant maps to an
//!   [`ErrorClass`](crate::retry::ErrorClass) so one generic retry policy can
//!   decide between retrying, skipping and aborting.
//!
//! * [`SubmissionError`] / [`RetrievalError`]: component-level outcomes of
//!   the submitter and retriever. Fatal variants carry remediation text.
//!
//! * [`StoreError`]: the durable JobGroup record could not be read or written.
//!
//! * [`BatchError`]: **Fatal** for the whole job group. Returned as
//!   `Err(BatchError)` from [`crate::runner::BatchRunner`] operations.
//!
//! Partial data (a malformed output line, an unknown correlation id) never
//! reaches these types: it is logged and skipped where it is found.

use crate::retry::{Classify, ErrorClass};
use std::path::PathBuf;
use thiserror::Error;

/// A failure of one call against the remote batch API.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// HTTP 401/403: the key is invalid, revoked, or lacks permission.
    #[error("Authentication failed: {detail}")]
    Auth { detail: String },

    /// Billing hard limit or insufficient quota.
    #[error("Quota exhausted: {detail}")]
    Quota { detail: String },

    /// HTTP 429 without a quota code.
    #[error("Rate limited: {detail}")]
    RateLimited {
        detail: String,
        retry_after_secs: Option<u64>,
    },

    /// HTTP 5xx.
    #[error("Server error (HTTP {status}): {detail}")]
    Server { status: u16, detail: String },

    /// The call did not complete within the per-call timeout.
    #[error("Request timed out: {detail}")]
    Timeout { detail: String },

    /// Connection refused, DNS failure, reset mid-body.
    #[error("Network error: {detail}")]
    Network { detail: String },

    /// HTTP 400/422: the request itself is wrong.
    #[error("Request rejected (HTTP {status}): {detail}")]
    BadRequest { status: u16, detail: String },

    /// HTTP 404: the batch or file id is unknown (expired or deleted).
    #[error("Remote resource not found: {resource}")]
    NotFound { resource: String },

    /// The response body could not be decoded.
    #[error("Unexpected response body: {detail}")]
    Decode { detail: String },
}

impl Classify for BackendError {
    fn class(&self) -> ErrorClass {
        match self {
            BackendError::Auth { .. } | BackendError::Quota { .. } => ErrorClass::Fatal,
            BackendError::RateLimited { .. }
            | BackendError::Server { .. }
            | BackendError::Timeout { .. }
            | BackendError::Network { .. } => ErrorClass::Transient,
            BackendError::BadRequest { .. }
            | BackendError::NotFound { .. }
            | BackendError::Decode { .. } => ErrorClass::Skip,
        }
    }
}

/// Why submission of a batch (or one chunk of it) failed.
#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    #[error(
        "Quota or billing limit reached: {detail}\n\
Check your billing settings at https://platform.openai.com/account/billing\n\
and raise the limit or add credits before resubmitting."
    )]
    QuotaExceeded { detail: String },

    #[error(
        "API key rejected: {detail}\n\
Set a valid key with OPENAI_API_KEY (or --api-key).\n\
Keys can be managed at https://platform.openai.com/account/api-keys"
    )]
    AuthInvalid { detail: String },

    #[error("Malformed batch request: {detail}")]
    MalformedRequest { detail: String },

    #[error("Transient failure after {attempts} attempts: {detail}\nTry again in a few minutes.")]
    Transient { attempts: u32, detail: String },
}

impl SubmissionError {
    /// Map the last backend error of a retried operation to a submission error.
    pub fn from_backend(err: &BackendError, attempts: u32) -> Self {
        match err {
            BackendError::Auth { detail } => SubmissionError::AuthInvalid {
                detail: detail.clone(),
            },
            BackendError::Quota { detail } => SubmissionError::QuotaExceeded {
                detail: detail.clone(),
            },
            BackendError::BadRequest { .. }
            | BackendError::NotFound { .. }
            | BackendError::Decode { .. } => SubmissionError::MalformedRequest {
                detail: err.to_string(),
            },
            _ => SubmissionError::Transient {
                attempts,
                detail: err.to_string(),
            },
        }
    }

    /// `true` for quota and authentication failures, which abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SubmissionError::QuotaExceeded { .. } | SubmissionError::AuthInvalid { .. }
        )
    }
}

/// Why results of a job group could not be retrieved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrievalError {
    /// Fewer than 90 % of the work units have completed.
    #[error(
        "Job group not ready: {completed}/{total} work units completed ({pct:.1}%)\n\
Retrieval needs all chunks completed or at least 90% of work units.",
        pct = percent(.completed, .total)
    )]
    NotReady { completed: usize, total: usize },

    /// No completed chunk produced a usable output record.
    #[error("No output available for job group '{group_id}'")]
    NoOutput { group_id: String },

    /// Some work units never came back.
    ///
    /// Returned by [`crate::batch::retrieve::RetrievalReport::into_complete`]
    /// when the caller requires every page.
    #[error("{retrieved}/{expected} work units retrieved")]
    Partial { retrieved: usize, expected: usize },
}

/// The durable JobGroup record could not be read or written.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job store I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The record exists but cannot be parsed.
    #[error("Job group record '{group_id}' is corrupt: {detail}")]
    Corrupt { group_id: String, detail: String },

    /// The record parses but breaks a structural invariant.
    #[error("Job group record '{group_id}' is inconsistent: {detail}")]
    Inconsistent { group_id: String, detail: String },

    /// The id cannot safely be used as a record key.
    #[error("Invalid job group id '{group_id}'")]
    InvalidId { group_id: String },
}

/// All fatal errors returned by the edgequake-pdf2md-batch library.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Too many chunks failed for the group to be accepted.
    #[error(
        "Job group '{group_id}' failed: {failed_chunks} chunk(s) failed and only \
{completed}/{total} work units completed (more than 50% required)"
    )]
    GroupFailed {
        group_id: String,
        failed_chunks: usize,
        completed: usize,
        total: usize,
    },

    #[error("Job group '{group_id}' not found.\nRun `pdf2md-batch list` to see known groups.")]
    GroupNotFound { group_id: String },

    /// The caller cancelled monitoring between two polls.
    #[error("Monitoring of job group '{group_id}' was cancelled")]
    Cancelled { group_id: String },

    #[error("Input directory not found: '{path}'")]
    InputNotFound { path: PathBuf },

    #[error("No page images found under '{path}'\nExpected files named page_0001.png, page_0002.jpg, …")]
    NoWorkUnits { path: PathBuf },

    #[error("Invalid correlation id '{id}': {reason}")]
    InvalidCorrelationId { id: String, reason: String },

    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn percent(completed: &usize, total: &usize) -> f64 {
    if *total == 0 {
        0.0
    } else {
        *completed as f64 * 100.0 / *total as f64
    }
}
