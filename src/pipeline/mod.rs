//! Local stages that turn page images into request payloads.
//!
//! ```text
//! input ──▶ encode ──▶ batch::request
//! (page files)  (base64)   (JSONL lines)
//! ```
//!
//! 1. [`input`]: discover pre-rendered page images and build WorkUnits
//! 2. [`encode`]: read and base64-wrap each image for the request body
//!
//! Rasterising PDFs into page images happens outside this crate.

pub mod encode;
pub mod input;
