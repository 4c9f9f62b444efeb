//! Batch job orchestration.
//!
//! ```text
//! request ──▶ submit ──▶ JobStore ──▶ monitor (loop) ──▶ retrieve ──▶ usage ──▶ cleanup
//!              │
//!              └── pacing (admission wait between chunks)
//! ```
//!
//! 1. [`request`]: one JSONL request line per work unit
//! 2. [`submit`]: chunking, sequential upload + create, durable record
//! 3. [`pacing`]: what happens between two chunk submissions
//! 4. [`monitor`]: poll every chunk and fold into one [`monitor::GroupProgress`]
//! 5. [`retrieve`]: download, demultiplex and compose one file per document
//! 6. [`usage`]: token and cost aggregation
//! 7. [`cleanup`]: safety-gated removal of working files

pub mod cleanup;
pub mod monitor;
pub mod pacing;
pub mod request;
pub mod retrieve;
pub mod submit;
pub mod usage;
