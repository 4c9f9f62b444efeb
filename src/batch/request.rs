//! Request Builder: WorkUnits → newline-delimited JSON request lines.
//!
//! Each line targets the chat-completions endpoint with a system message and
//! a two-part user message (prompt text + page image as a data URI):
//!
//! ```json
//! {"custom_id":"manual_page_0001","method":"POST","url":"/v1/chat/completions",
//!  "body":{"model":"gpt-4o-mini","messages":[...],"temperature":0.05,"max_tokens":8192}}
//! ```

use crate::config::BatchConfig;
use crate::error::SubmissionError;
use crate::model::WorkUnit;
use crate::pipeline::encode::{data_uri, encode_page_file};
use edgequake_llm::ImageData;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::warn;

/// One line of a batch input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequestLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: Value,
}

/// Serialised request file for one chunk.
#[derive(Debug, Clone, Default)]
pub struct BuiltChunk {
    /// JSONL bytes, one request per line, newline-terminated.
    pub jsonl: Vec<u8>,
    /// Correlation ids in the file, in input order.
    pub correlation_ids: Vec<String>,
    /// Units whose image could not be read; not in the file.
    pub unreadable: Vec<String>,
}

impl BuiltChunk {
    pub fn len(&self) -> usize {
        self.correlation_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.correlation_ids.is_empty()
    }
}

/// Turns work units into request lines using one config's prompts and model.
pub struct RequestBuilder<'a> {
    config: &'a BatchConfig,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(config: &'a BatchConfig) -> Self {
        Self { config }
    }

    /// Build the request line for a unit whose image is already encoded.
    pub fn line(&self, unit: &WorkUnit, image: &ImageData) -> BatchRequestLine {
        let c = self.config;
        BatchRequestLine {
            custom_id: unit.correlation_id.clone(),
            method: "POST".to_string(),
            url: c.endpoint.clone(),
            body: json!({
                "model": c.model,
                "messages": [
                    { "role": "system", "content": c.system_prompt() },
                    {
                        "role": "user",
                        "content": [
                            { "type": "text", "text": c.user_prompt() },
                            { "type": "image_url", "image_url": { "url": data_uri(image) } }
                        ]
                    }
                ],
                "temperature": c.temperature,
                "max_tokens": c.max_tokens,
            }),
        }
    }

    /// Build the JSONL file for a chunk.
    ///
    /// Units whose image cannot be read are left out and listed in
    /// [`BuiltChunk::unreadable`]. A repeated correlation id makes the whole
    /// chunk malformed.
    pub fn build_chunk(&self, units: &[WorkUnit]) -> Result<BuiltChunk, SubmissionError> {
        let mut seen = HashSet::with_capacity(units.len());
        let mut out = BuiltChunk::default();

        for unit in units {
            if !seen.insert(unit.correlation_id.as_str()) {
                return Err(SubmissionError::MalformedRequest {
                    detail: format!("duplicate correlation id '{}'", unit.correlation_id),
                });
            }
            let image = match encode_page_file(&unit.image_path) {
                Ok(image) => image,
                Err(e) => {
                    warn!(
                        "Skipping {}: cannot read {}: {}",
                        unit.correlation_id,
                        unit.image_path.display(),
                        e
                    );
                    out.unreadable.push(unit.correlation_id.clone());
                    continue;
                }
            };
            let line = self.line(unit, &image);
            serde_json::to_writer(&mut out.jsonl, &line).map_err(|e| {
                SubmissionError::MalformedRequest {
                    detail: format!("{}: {}", unit.correlation_id, e),
                }
            })?;
            out.jsonl.push(b'\n');
            out.correlation_ids.push(unit.correlation_id.clone());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn unit(dir: &Path, doc: &str, page: u32) -> WorkUnit {
        let path = dir.join(format!("{doc}_{page}.jpg"));
        std::fs::write(&path, [0xFF, 0xD8, page as u8]).unwrap();
        WorkUnit::new(doc, page, path, dir).unwrap()
    }

    #[test]
    fn line_matches_wire_format() {
        let config = BatchConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        let u = unit(tmp.path(), "manual", 3);
        let image = ImageData::new("QUJD", "image/jpeg");
        let line = RequestBuilder::new(&config).line(&u, &image);
        let v = serde_json::to_value(&line).unwrap();

        assert_eq!(v["custom_id"], "manual_page_0003");
        assert_eq!(v["method"], "POST");
        assert_eq!(v["url"], "/v1/chat/completions");
        assert_eq!(v["body"]["model"], "gpt-4o-mini");
        assert_eq!(v["body"]["max_tokens"], 8192);
        assert_eq!(v["body"]["messages"][0]["role"], "system");
        assert_eq!(v["body"]["messages"][1]["content"][0]["type"], "text");
        assert_eq!(
            v["body"]["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
    }

    #[test]
    fn chunk_is_one_line_per_unit() {
        let config = BatchConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        let units: Vec<WorkUnit> = (1..=3).map(|p| unit(tmp.path(), "doc", p)).collect();
        let built = RequestBuilder::new(&config).build_chunk(&units).unwrap();

        let text = String::from_utf8(built.jsonl).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        for (line, u) in lines.iter().zip(&units) {
            let parsed: BatchRequestLine = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.custom_id, u.correlation_id);
        }
        assert_eq!(built.correlation_ids.len(), 3);
    }

    #[test]
    fn unreadable_images_are_left_out() {
        let config = BatchConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        let good = unit(tmp.path(), "doc", 1);
        let missing = WorkUnit::new("doc", 2, tmp.path().join("gone.jpg"), tmp.path()).unwrap();
        let built = RequestBuilder::new(&config)
            .build_chunk(&[good, missing])
            .unwrap();
        assert_eq!(built.correlation_ids, vec!["doc_page_0001"]);
        assert_eq!(built.unreadable, vec!["doc_page_0002"]);
    }

    #[test]
    fn duplicate_ids_are_malformed() {
        let config = BatchConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        let a = unit(tmp.path(), "doc", 1);
        let err = RequestBuilder::new(&config)
            .build_chunk(&[a.clone(), a])
            .unwrap_err();
        assert!(matches!(err, SubmissionError::MalformedRequest { .. }));
    }
}
