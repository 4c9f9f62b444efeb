//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use edgequake_pdf2md_batch::backend::mock::MockBatchBackend;
use edgequake_pdf2md_batch::{BatchConfig, BatchConfigBuilder, BatchRunner, MemoryJobStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Write `pages` page images for `document` under `input`.
pub fn write_document(input: &Path, document: &str, pages: u32) -> PathBuf {
    let dir = input.join(document);
    std::fs::create_dir_all(&dir).unwrap();
    for n in 1..=pages {
        // Any non-empty bytes: images are only base64-wrapped.
        std::fs::write(dir.join(format!("page_{n:04}.png")), format!("png-{document}-{n}")).unwrap();
    }
    dir
}

/// Route library logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config rooted in `work`, with no waiting between polls or retries.
pub fn fast_config(work: &Path) -> BatchConfigBuilder {
    BatchConfig::builder()
        .work_dir(work.join("work"))
        .output_dir(work.join("out"))
        .chunk_threshold(100)
        .poll_interval_ms(1)
        .admission_timeout_ms(0)
        .retry_backoff_ms(0)
        .max_retries(2)
}

pub struct Harness {
    pub root: tempfile::TempDir,
    pub backend: Arc<MockBatchBackend>,
    pub store: Arc<MemoryJobStore>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            root: tempfile::tempdir().unwrap(),
            backend: Arc::new(MockBatchBackend::new()),
            store: Arc::new(MemoryJobStore::new()),
        }
    }

    pub fn input(&self) -> PathBuf {
        self.root.path().join("input")
    }

    pub fn config(&self) -> BatchConfigBuilder {
        fast_config(self.root.path())
    }

    pub fn runner(&self, config: BatchConfig) -> BatchRunner {
        BatchRunner::new(self.backend.clone(), self.store.clone(), config)
    }

    pub fn default_runner(&self) -> BatchRunner {
        self.runner(self.config().build().unwrap())
    }
}
