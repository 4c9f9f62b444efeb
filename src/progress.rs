//! Progress-callback trait for batch lifecycle events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::BatchConfigBuilder::progress_callback`] to observe a run
//! as it submits chunks, waits for admission, polls, and writes documents.
//!
//! # Why callbacks instead of channels?
//!
//! The orchestration is one sequential task; a callback is the least
//! invasive hook. Callers can forward events to a progress bar, a log sink,
//! or a channel without the library knowing how the host communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2md_batch::{BatchConfig, BatchProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct ChunkCounter(AtomicUsize);
//!
//! impl BatchProgressCallback for ChunkCounter {
//!     fn on_chunk_submitted(&self, index: usize, total: usize, job_id: &str, units: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("chunk {}/{} → {} ({} pages)", index + 1, total, job_id, units);
//!     }
//! }
//!
//! let config = BatchConfig::builder()
//!     .progress_callback(Arc::new(ChunkCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::batch::monitor::GroupProgress;
use std::path::Path;
use std::sync::Arc;

/// Called by the submitter, monitor and retriever.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before the first chunk is uploaded.
    fn on_submission_start(&self, total_units: usize, total_chunks: usize) {
        let _ = (total_units, total_chunks);
    }

    /// Called after a chunk's batch was created.
    ///
    /// # Arguments
    /// * `index`: 0-based chunk index
    /// * `total_chunks`: planned chunk count
    /// * `job_id`: remote batch id
    /// * `units`: work units in the chunk
    fn on_chunk_submitted(&self, index: usize, total_chunks: usize, job_id: &str, units: usize) {
        let _ = (index, total_chunks, job_id, units);
    }

    /// Called when a chunk is given up on and submission moves to the next.
    fn on_chunk_skipped(&self, index: usize, total_chunks: usize, error: &str) {
        let _ = (index, total_chunks, error);
    }

    /// Called on each admission poll while a chunk is still validating or queued.
    fn on_admission_wait(&self, job_id: &str, status: &str, waited_ms: u64) {
        let _ = (job_id, status, waited_ms);
    }

    /// Called after every monitoring poll.
    fn on_poll(&self, progress: &GroupProgress) {
        let _ = progress;
    }

    /// Called after a composed document was written.
    fn on_document_written(&self, document_id: &str, pages: usize, path: &Path) {
        let _ = (document_id, pages, path);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::BatchConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracking {
        submitted: AtomicUsize,
        skipped: AtomicUsize,
        units: AtomicUsize,
    }

    impl BatchProgressCallback for Tracking {
        fn on_chunk_submitted(&self, _index: usize, _total: usize, _job_id: &str, units: usize) {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            self.units.fetch_add(units, Ordering::SeqCst);
        }

        fn on_chunk_skipped(&self, _index: usize, _total: usize, _error: &str) {
            self.skipped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_submission_start(250, 3);
        cb.on_chunk_submitted(0, 3, "batch_1", 100);
        cb.on_chunk_skipped(1, 3, "bad request");
        cb.on_admission_wait("batch_1", "validating", 10_000);
        cb.on_document_written("doc", 3, Path::new("converted/doc_batch.md"));
    }

    #[test]
    fn overridden_hooks_receive_events() {
        let t = Arc::new(Tracking::default());
        let cb: ProgressCallback = t.clone();
        cb.on_submission_start(100, 2);
        cb.on_chunk_submitted(0, 2, "a", 60);
        cb.on_chunk_submitted(1, 2, "b", 40);
        cb.on_chunk_skipped(1, 2, "x");
        assert_eq!(t.submitted.load(Ordering::SeqCst), 2);
        assert_eq!(t.units.load(Ordering::SeqCst), 100);
        assert_eq!(t.skipped.load(Ordering::SeqCst), 1);
    }
}
