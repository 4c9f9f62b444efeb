//! # edgequake-pdf2md-batch
//!
//! Convert page images to Markdown through an OpenAI-style asynchronous
//! batch API, at half the price of synchronous calls.
//!
//! ## Why batch?
//!
//! Batch jobs trade latency (up to 24 h) for a 50 % discount and much higher
//! rate limits. The price is orchestration: a job is submitted, polled,
//! downloaded and demultiplexed in separate steps, possibly across process
//! restarts, and a large submission has to be split into chunks that the
//! service admits one at a time. This crate does that orchestration.
//!
//! ## Pipeline Overview
//!
//! ```text
//! page images
//!  │
//!  ├─ 1. Input     discover page_NNNN.{png,jpg} per document → WorkUnits
//!  ├─ 2. Request   one JSONL line per page (base64 image + prompt)
//!  ├─ 3. Submit    chunk, upload, create batch, wait for admission
//!  ├─ 4. Monitor   poll every chunk, aggregate, apply the progress policy
//!  ├─ 5. Retrieve  download, demultiplex by custom_id, one .md per document
//!  ├─ 6. Usage     token and cost totals, usage_stats_{group}.json
//!  └─ 7. Cleanup   remove working files behind a safety filter
//! ```
//!
//! Every step reads and writes the durable [`JobGroup`] record through a
//! [`JobStore`], so each can run in its own process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2md_batch::{BatchConfig, BatchRunner};
//! use std::path::Path;
//! use std::sync::atomic::AtomicBool;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BatchConfig::builder()
//!         .api_key(std::env::var("OPENAI_API_KEY")?)
//!         .chunk_threshold(100)
//!         .build()?;
//!     let runner = BatchRunner::from_config(config)?;
//!     let out = runner.run(Path::new("pages/"), &AtomicBool::new(false)).await?;
//!     for doc in &out.retrieved.report.artifacts {
//!         println!("{} ({} pages)", doc.path.display(), doc.pages);
//!     }
//!     eprintln!("cost: ${:.4}", out.retrieved.usage.total.total_cost);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2md-batch` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod batch;
pub mod config;
pub mod correlation;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod runner;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{BatchBackend, RemoteBatch};
pub use batch::cleanup::{CleanupReport, CleanupScope};
pub use batch::monitor::{GroupProgress, ProgressDecision};
pub use batch::retrieve::RetrievalReport;
pub use batch::submit::SubmissionOutcome;
pub use batch::usage::{CostRates, UsageReport, UsageSummary};
pub use config::{BatchConfig, BatchConfigBuilder, ChunkStrategy};
pub use error::{BackendError, BatchError, RetrievalError, StoreError, SubmissionError};
pub use model::{JobGroup, JobHandle, JobStatus, TokenUsage, UsageRecord, WorkUnit, WorkUnitStatus};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use runner::{BatchRunner, RetrievedGroup, RunOutcome};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
