//! Result Retriever: download, demultiplex, compose.
//!
//! ## Readiness gate
//!
//! Retrieval proceeds when one of these holds:
//!
//! 1. every chunk completed;
//! 2. the monitor's policy accepts the group as a partial success;
//! 3. at least 90 % of work units completed (inclusive), even with chunks
//!    still running.
//!
//! The 90 % gate and the monitor's 50 % threshold are independent.
//!
//! ## Demultiplexing
//!
//! Output lines arrive in whatever order the service wrote them. Each
//! `custom_id` is resolved through [`CorrelationResolver`] (durable map first,
//! then the `{document_id}_page_{NNNN}` convention) and filed into a
//! per-document `BTreeMap<page, content>`, so page order never depends on
//! arrival order. The first record seen for an id wins.

use super::monitor::{GroupProgress, ProgressDecision};
use super::usage::{CostRates, UsageSummary};
use crate::backend::BatchBackend;
use crate::config::BatchConfig;
use crate::correlation::{CorrelationResolver, MappingSource, NamingConvention};
use crate::error::{BatchError, RetrievalError};
use crate::model::{JobGroup, JobStatus, TokenUsage, UsageRecord};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Completed fraction (inclusive) that allows retrieval before all chunks finish.
pub const PARTIAL_RETRIEVAL_THRESHOLD: f64 = 0.9;

// ── Output lines ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    response: Option<RawResponse>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    body: Option<RawBody>,
}

#[derive(Debug, Deserialize)]
struct RawBody {
    #[serde(default)]
    choices: Vec<RawChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    #[serde(default)]
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One successful line of an output file.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub correlation_id: String,
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// Parse one output line. `Err` carries a loggable reason.
pub fn parse_output_line(line: &str) -> Result<OutputRecord, String> {
    let raw: RawLine = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;
    let id = raw.custom_id.ok_or_else(|| "missing custom_id".to_string())?;

    if let Some(err) = raw.error.filter(|e| !e.is_null()) {
        return Err(format!("{id}: remote error {err}"));
    }
    let response = raw.response.ok_or_else(|| format!("{id}: missing response"))?;
    if let Some(code) = response.status_code {
        if !(200..300).contains(&code) {
            return Err(format!("{id}: HTTP {code}"));
        }
    }
    let body = response.body.ok_or_else(|| format!("{id}: missing response body"))?;
    let content = body
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .ok_or_else(|| format!("{id}: no message content"))?;

    Ok(OutputRecord {
        correlation_id: id,
        content,
        usage: body.usage,
    })
}

// ── Demultiplexing ───────────────────────────────────────────────────────

/// Ordered pages of one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentPages {
    pub document_id: String,
    pub pages: BTreeMap<u32, String>,
    pub usage: Vec<UsageRecord>,
}

impl DocumentPages {
    pub fn page_numbers(&self) -> Vec<u32> {
        self.pages.keys().copied().collect()
    }
}

/// Records filed by document.
#[derive(Debug, Clone, Default)]
pub struct Demultiplexed {
    pub documents: BTreeMap<String, DocumentPages>,
    /// Ids that neither the durable map nor the convention could resolve.
    pub unresolved: Vec<String>,
    /// Ids seen more than once; only the first record was kept.
    pub duplicates: Vec<String>,
    /// Records resolved through the naming convention.
    pub convention_hits: usize,
    /// Ids filed into a document.
    pub retrieved: BTreeSet<String>,
}

impl Demultiplexed {
    pub fn usage(&self) -> Vec<UsageRecord> {
        self.documents
            .values()
            .flat_map(|d| d.usage.iter().cloned())
            .collect()
    }

    pub fn page_count(&self) -> usize {
        self.documents.values().map(|d| d.pages.len()).sum()
    }
}

/// File records into documents and pages.
pub fn demultiplex(
    records: impl IntoIterator<Item = OutputRecord>,
    resolver: &CorrelationResolver<'_>,
) -> Demultiplexed {
    let mut out = Demultiplexed::default();
    for record in records {
        let Some(resolved) = resolver.resolve(&record.correlation_id) else {
            warn!("Cannot map result '{}' to a page, skipping", record.correlation_id);
            out.unresolved.push(record.correlation_id);
            continue;
        };
        if !out.retrieved.insert(record.correlation_id.clone()) {
            debug!("Duplicate result for {}, keeping the first", record.correlation_id);
            out.duplicates.push(record.correlation_id);
            continue;
        }
        if resolved.source == MappingSource::Convention {
            out.convention_hits += 1;
        }

        let entry = resolved.entry;
        let doc = out
            .documents
            .entry(entry.document_id.clone())
            .or_insert_with(|| DocumentPages {
                document_id: entry.document_id.clone(),
                ..Default::default()
            });
        doc.pages.insert(entry.page_number, record.content);
        if let Some(usage) = record.usage {
            doc.usage.push(UsageRecord {
                correlation_id: record.correlation_id,
                document_id: entry.document_id,
                page_number: entry.page_number,
                usage,
            });
        }
    }
    out
}

// ── Composition ──────────────────────────────────────────────────────────

/// Group-level facts stamped into every document footer.
#[derive(Debug, Clone)]
pub struct Provenance<'a> {
    pub group: &'a JobGroup,
    pub processed_at: DateTime<Utc>,
    pub rates: &'a CostRates,
}

fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Render a document: ordered pages, then the provenance footer.
pub fn compose_document(doc: &DocumentPages, prov: &Provenance<'_>) -> String {
    let group = prov.group;
    let mut md = String::new();
    for (n, content) in &doc.pages {
        md.push_str(&format!("---\n# Page {n}\n---\n\n{content}\n\n"));
    }

    md.push_str("---\n\n## Processing Metadata\n\n");
    md.push_str(&format!("- **Document:** {}\n", doc.document_id));
    md.push_str(&format!("- **Total Pages:** {}\n", doc.pages.len()));
    if group.is_chunked() {
        md.push_str("- **Processing Method:** OpenAI Batch API (Chunked)\n");
        md.push_str(&format!("- **Model:** {}\n", group.model));
        md.push_str(&format!("- **Master Batch ID:** {}\n", group.group_id));
        md.push_str(&format!("- **Chunks:** {}\n", group.total_chunks()));
        md.push_str(&format!("- **Chunk Job IDs:** {}\n", group.job_ids().join(", ")));
    } else {
        md.push_str("- **Processing Method:** OpenAI Batch API\n");
        md.push_str(&format!("- **Model:** {}\n", group.model));
        md.push_str(&format!("- **Batch ID:** {}\n", group.job_ids().join(", ")));
        md.push_str(&format!("- **Job Group:** {}\n", group.group_id));
    }
    md.push_str(&format!(
        "- **Processed:** {}\n\n",
        prov.processed_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    let s = UsageSummary::from_records(&doc.usage, prov.rates);
    if s.units > 0 {
        md.push_str("### 📊 Processing Statistics\n\n");
        md.push_str(&format!("- **Total Tokens Used:** {}\n", thousands(s.total_tokens)));
        md.push_str(&format!("- **Prompt Tokens:** {}\n", thousands(s.prompt_tokens)));
        md.push_str(&format!("- **Completion Tokens:** {}\n", thousands(s.completion_tokens)));
        md.push_str(&format!("- **Total Processing Cost:** ${:.4}\n", s.total_cost));
        md.push_str(&format!("- **Average Tokens per Page:** {:.0}\n", s.avg_tokens_per_unit));
        md.push_str(&format!("- **Average Cost per Page:** ${:.4}\n\n", s.avg_cost_per_unit));

        md.push_str("### 💰 Cost Breakdown\n\n");
        md.push_str(&format!("- **Input Processing:** ${:.4} (vision + text)\n", s.input_cost));
        md.push_str(&format!("- **Output Generation:** ${:.4} (markdown text)\n", s.output_cost));
        md.push_str("- **Batch API Discount:** 50% off regular pricing\n");
        md.push_str(&format!("- **Estimated Regular Cost:** ${:.4}\n\n", s.estimated_regular_cost));

        md.push_str("### ⚡ Efficiency Metrics\n\n");
        md.push_str(&format!("- **Tokens per Dollar:** {:.0}\n", s.tokens_per_currency));
        md.push_str(&format!("- **Pages per Dollar:** {:.1}\n", s.units_per_currency));
    }
    md
}

/// File name of a document's composed output.
pub fn artifact_name(document_id: &str) -> String {
    format!("{}_batch.md", safe_stem(document_id))
}

fn safe_stem(document_id: &str) -> String {
    document_id
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}

/// Output file names for `document_ids`, in order. An id whose sanitised
/// name is already taken gets `_2`, `_3`, ... appended to its stem.
pub fn artifact_names<'a>(document_ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut taken = BTreeSet::new();
    let mut names = Vec::new();
    for id in document_ids {
        let stem = safe_stem(id);
        let mut name = format!("{stem}_batch.md");
        let mut n = 2;
        while taken.contains(&name) {
            name = format!("{stem}_{n}_batch.md");
            n += 1;
        }
        if n > 2 {
            warn!("Document {} shares an output name, writing {}", id, name);
        }
        taken.insert(name.clone());
        names.push(name);
    }
    names
}

fn write_atomic(dir: &Path, path: &Path, contents: &str) -> Result<(), BatchError> {
    let err = |source: std::io::Error| BatchError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(err)?;
    tmp.write_all(contents.as_bytes()).map_err(err)?;
    tmp.persist(path).map_err(|e| err(e.error))?;
    Ok(())
}

// ── Retrieval ────────────────────────────────────────────────────────────

/// Decide whether `progress` allows retrieval. `Ok(true)` means partial.
pub fn retrieval_gate(progress: &GroupProgress) -> Result<bool, RetrievalError> {
    if progress.all_completed() {
        return Ok(false);
    }
    if matches!(progress.decide(), ProgressDecision::PartialSuccess { .. }) {
        return Ok(true);
    }
    // completed ≥ 0.9 × total, in integers.
    let total = progress.total_work_units;
    if total > 0 && 10 * progress.completed_work_units >= 9 * total {
        return Ok(true);
    }
    Err(RetrievalError::NotReady {
        completed: progress.completed_work_units,
        total,
    })
}

/// One written output file.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentArtifact {
    pub document_id: String,
    pub path: PathBuf,
    pub pages: usize,
}

/// Everything a retrieval produced.
#[derive(Debug, Clone)]
pub struct RetrievalReport {
    pub group_id: String,
    pub documents: BTreeMap<String, DocumentPages>,
    pub artifacts: Vec<DocumentArtifact>,
    pub usage: Vec<UsageRecord>,
    /// Work units with content.
    pub retrieved: usize,
    /// Work units in the group.
    pub expected: usize,
    /// Ids submitted but not retrieved.
    pub missing: Vec<String>,
    pub malformed_lines: usize,
    pub unresolved: Vec<String>,
    pub convention_hits: usize,
    /// Accepted through the partial-success or 90 % gate.
    pub partial: bool,
    pub completion_fraction: f64,
}

impl RetrievalReport {
    /// Require every work unit.
    pub fn into_complete(self) -> Result<Self, RetrievalError> {
        if self.missing.is_empty() {
            Ok(self)
        } else {
            Err(RetrievalError::Partial {
                retrieved: self.retrieved,
                expected: self.expected,
            })
        }
    }
}

/// Downloads and assembles a job group's results.
pub struct ResultRetriever<'a> {
    backend: &'a dyn BatchBackend,
    config: &'a BatchConfig,
}

impl<'a> ResultRetriever<'a> {
    pub fn new(backend: &'a dyn BatchBackend, config: &'a BatchConfig) -> Self {
        Self { backend, config }
    }

    /// Download raw output records of every completed chunk, in chunk order.
    async fn collect_records(&self, group: &JobGroup) -> (Vec<OutputRecord>, usize) {
        let retry = self.config.retry_policy();
        let mut records = Vec::new();
        let mut malformed = 0usize;

        for chunk in &group.chunks {
            let h = &chunk.handle;
            if h.status != JobStatus::Completed {
                debug!("Skipping chunk {} ({}): {}", chunk.index, h.job_id, h.status);
                continue;
            }
            let Some(file_id) = h.output_file_id.as_deref() else {
                warn!("Chunk {} ({}) completed without an output file", chunk.index, h.job_id);
                continue;
            };
            let label = format!("download {file_id}");
            let text = match retry.run(&label, || self.backend.download_file(file_id)).await {
                Ok(text) => text,
                Err(f) => {
                    warn!(
                        "Could not download output of chunk {} ({}): {}",
                        chunk.index, h.job_id, f.error
                    );
                    continue;
                }
            };
            for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                match parse_output_line(line) {
                    Ok(r) => records.push(r),
                    Err(reason) => {
                        malformed += 1;
                        warn!("{} line {}: {}, skipping", h.job_id, n + 1, reason);
                    }
                }
            }
        }
        (records, malformed)
    }

    /// Retrieve, demultiplex and write one `{document_id}_batch.md` per document.
    pub async fn retrieve(&self, group: &JobGroup) -> Result<RetrievalReport, BatchError> {
        let progress = GroupProgress::from_group(group);
        let partial = retrieval_gate(&progress)?;
        if partial {
            warn!(
                "Retrieving group {} with {:.1}% of work units completed",
                group.group_id,
                progress.completion_fraction() * 100.0
            );
        }

        let (records, malformed_lines) = self.collect_records(group).await;
        let resolver = CorrelationResolver::new(
            Some(&group.correlation_map),
            NamingConvention::new(self.config.job_temp_dir()),
        );
        let demux = demultiplex(records, &resolver);
        if demux.documents.is_empty() {
            return Err(RetrievalError::NoOutput {
                group_id: group.group_id.clone(),
            }
            .into());
        }
        if demux.convention_hits > 0 {
            info!(
                "{} result(s) mapped through the naming convention",
                demux.convention_hits
            );
        }

        let prov = Provenance {
            group,
            processed_at: Utc::now(),
            rates: &self.config.rates,
        };
        let out_dir = &self.config.output_dir;
        let mut artifacts = Vec::with_capacity(demux.documents.len());
        let names = artifact_names(demux.documents.keys().map(String::as_str));
        for (doc, name) in demux.documents.values().zip(names) {
            let path = out_dir.join(name);
            write_atomic(out_dir, &path, &compose_document(doc, &prov))?;
            info!("Created {} ({} pages)", path.display(), doc.pages.len());
            self.config
                .progress_callback
                .on_document_written(&doc.document_id, doc.pages.len(), &path);
            artifacts.push(DocumentArtifact {
                document_id: doc.document_id.clone(),
                path,
                pages: doc.pages.len(),
            });
        }

        let missing: Vec<String> = group
            .chunks
            .iter()
            .flat_map(|c| c.correlation_ids.iter())
            .filter(|id| !demux.retrieved.contains(*id))
            .cloned()
            .collect();

        Ok(RetrievalReport {
            group_id: group.group_id.clone(),
            usage: demux.usage(),
            retrieved: demux.page_count(),
            expected: group.total_work_units,
            missing,
            malformed_lines,
            unresolved: demux.unresolved.clone(),
            convention_hits: demux.convention_hits,
            partial,
            completion_fraction: progress.completion_fraction(),
            artifacts,
            documents: demux.documents,
        })
    }
}
