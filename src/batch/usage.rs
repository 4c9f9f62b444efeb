//! Usage & Cost Analyzer.
//!
//! Pure aggregation over per-page [`UsageRecord`]s:
//!
//! ```text
//! cost = prompt_tokens × rate_in + completion_tokens × rate_out
//! ```
//!
//! summed per document and per group, plus derived averages. Batch pricing
//! is half the synchronous price, so the estimated regular cost is twice the
//! batch cost. The only side effect is [`UsageReport::write_json`].

use crate::error::BatchError;
use crate::model::UsageRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Per-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostRates {
    pub input_per_token: f64,
    pub output_per_token: f64,
}

impl Default for CostRates {
    /// Batch pricing of `gpt-4o-mini`: $0.150 in / $0.600 out per 1M tokens.
    fn default() -> Self {
        Self::per_million(0.150, 0.600)
    }
}

impl CostRates {
    pub fn per_token(input: f64, output: f64) -> Self {
        Self {
            input_per_token: input,
            output_per_token: output,
        }
    }

    pub fn per_million(input: f64, output: f64) -> Self {
        Self::per_token(input / 1_000_000.0, output / 1_000_000.0)
    }

    pub fn input_per_million(&self) -> f64 {
        self.input_per_token * 1_000_000.0
    }

    pub fn output_per_million(&self) -> f64 {
        self.output_per_token * 1_000_000.0
    }
}

/// Token and cost totals over a set of work units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub units: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub avg_cost_per_unit: f64,
    pub avg_tokens_per_unit: f64,
    /// Tokens per USD; 0 when the cost is 0.
    pub tokens_per_currency: f64,
    /// Units per USD; 0 when the cost is 0.
    pub units_per_currency: f64,
    /// What the same work would cost without the batch discount.
    pub estimated_regular_cost: f64,
}

impl UsageSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>, rates: &CostRates) -> Self {
        let mut s = UsageSummary::default();
        for r in records {
            s.units += 1;
            s.prompt_tokens += r.usage.prompt_tokens;
            s.completion_tokens += r.usage.completion_tokens;
            s.total_tokens += r.usage.effective_total();
        }
        s.input_cost = s.prompt_tokens as f64 * rates.input_per_token;
        s.output_cost = s.completion_tokens as f64 * rates.output_per_token;
        s.total_cost = s.input_cost + s.output_cost;
        s.estimated_regular_cost = s.total_cost * 2.0;
        if s.units > 0 {
            s.avg_cost_per_unit = s.total_cost / s.units as f64;
            s.avg_tokens_per_unit = s.total_tokens as f64 / s.units as f64;
        }
        if s.total_cost > 0.0 {
            s.tokens_per_currency = s.total_tokens as f64 / s.total_cost;
            s.units_per_currency = s.units as f64 / s.total_cost;
        }
        s
    }

    /// Savings against synchronous pricing.
    pub fn batch_savings(&self) -> f64 {
        self.estimated_regular_cost - self.total_cost
    }
}

/// Usage of a whole job group, per document and in total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub group_id: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
    pub rates: CostRates,
    pub total: UsageSummary,
    pub documents: BTreeMap<String, UsageSummary>,
    pub pages: Vec<UsageRecord>,
}

impl UsageReport {
    pub fn analyze(
        group_id: impl Into<String>,
        model: impl Into<String>,
        records: &[UsageRecord],
        rates: &CostRates,
    ) -> Self {
        let mut by_doc: BTreeMap<&str, Vec<&UsageRecord>> = BTreeMap::new();
        for r in records {
            by_doc.entry(r.document_id.as_str()).or_default().push(r);
        }
        let documents = by_doc
            .into_iter()
            .map(|(doc, recs)| (doc.to_string(), UsageSummary::from_records(recs, rates)))
            .collect();

        let mut pages = records.to_vec();
        pages.sort_by(|a, b| {
            (a.document_id.as_str(), a.page_number).cmp(&(b.document_id.as_str(), b.page_number))
        });

        Self {
            group_id: group_id.into(),
            model: model.into(),
            generated_at: Utc::now(),
            rates: *rates,
            total: UsageSummary::from_records(records, rates),
            documents,
            pages,
        }
    }

    /// `usage_stats_{group_id}.json`
    pub fn file_name(group_id: &str) -> String {
        format!("usage_stats_{group_id}.json")
    }

    /// Write the report into `dir` atomically; returns the file path.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf, BatchError> {
        let path = dir.join(Self::file_name(&self.group_id));
        let write_err = |source: std::io::Error| BatchError::OutputWriteFailed {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(write_err)?;
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| BatchError::Internal(format!("usage report serialisation: {e}")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.persist(&path).map_err(|e| write_err(e.error))?;
        info!("Usage report written to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TokenUsage;

    fn rec(doc: &str, page: u32, p: u64, c: u64) -> UsageRecord {
        UsageRecord {
            correlation_id: format!("{doc}_page_{page:04}"),
            document_id: doc.into(),
            page_number: page,
            usage: TokenUsage::new(p, c),
        }
    }

    #[test]
    fn cost_is_linear_in_tokens() {
        let (rin, rout) = (0.003, 0.011);
        let rates = CostRates::per_token(rin, rout);
        let s = UsageSummary::from_records(&[rec("a", 1, 100, 50), rec("a", 2, 200, 80)], &rates);
        assert!((s.total_cost - (300.0 * rin + 130.0 * rout)).abs() < 1e-12);
        assert_eq!(s.prompt_tokens, 300);
        assert_eq!(s.completion_tokens, 130);
        assert_eq!(s.total_tokens, 430);
        assert!((s.avg_tokens_per_unit - 215.0).abs() < 1e-12);
        assert!((s.estimated_regular_cost - 2.0 * s.total_cost).abs() < 1e-12);
    }

    #[test]
    fn default_rates_are_per_million() {
        let r = CostRates::default();
        assert!((r.input_per_million() - 0.150).abs() < 1e-12);
        assert!((r.output_per_million() - 0.600).abs() < 1e-12);
    }

    #[test]
    fn zero_cost_has_zero_efficiency() {
        let s = UsageSummary::from_records(&[rec("a", 1, 10, 10)], &CostRates::per_token(0.0, 0.0));
        assert_eq!(s.tokens_per_currency, 0.0);
        assert_eq!(s.units_per_currency, 0.0);
        let empty = UsageSummary::from_records(&Vec::<UsageRecord>::new(), &CostRates::default());
        assert_eq!(empty.avg_cost_per_unit, 0.0);
    }

    #[test]
    fn report_groups_by_document() {
        let records = vec![rec("b", 2, 10, 5), rec("a", 1, 100, 50), rec("b", 1, 20, 5)];
        let report = UsageReport::analyze("g1", "gpt-4o-mini", &records, &CostRates::default());
        assert_eq!(report.documents.len(), 2);
        assert_eq!(report.documents["b"].units, 2);
        assert_eq!(report.documents["b"].prompt_tokens, 30);
        assert_eq!(report.total.units, 3);
        let order: Vec<(&str, u32)> = report
            .pages
            .iter()
            .map(|r| (r.document_id.as_str(), r.page_number))
            .collect();
        assert_eq!(order, vec![("a", 1), ("b", 1), ("b", 2)]);
    }

    #[test]
    fn report_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let report = UsageReport::analyze("g1", "m", &[rec("a", 1, 1, 1)], &CostRates::default());
        let path = report.write_json(dir.path()).unwrap();
        assert!(path.ends_with("usage_stats_g1.json"));
        let back: UsageReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.total.units, 1);
    }
}
