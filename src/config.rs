//! Configuration for batch submission, monitoring and retrieval.
//!
//! Every timing, path and sampling knob lives in [`BatchConfig`], built via
//! [`BatchConfigBuilder`]. One struct is passed to every stage, so a `submit`
//! in one process and a `retrieve` in another agree on where job records and
//! output files live as long as they are built from the same arguments.
//!
//! # Design choice: builder over constructor
//! Most callers change two or three fields (API key, model, input paths).
//! The builder lets them set only those and rely on documented defaults.

use crate::batch::usage::CostRates;
use crate::error::BatchError;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default OpenAI-compatible API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default vision model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Name of the job temp directory under `work_dir`.
pub const JOB_TEMP_DIR: &str = "temp_batch";

/// How a work-unit list larger than the chunk threshold is partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChunkStrategy {
    /// Full chunks of `chunk_threshold`, remainder last: 250 → 100, 100, 50.
    #[default]
    FixedStride,
    /// `ceil(n / threshold)` chunks whose sizes differ by at most one:
    /// 250 → 84, 83, 83.
    Balanced,
}

/// Configuration for a batch run.
///
/// Built via [`BatchConfig::builder()`] or [`BatchConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdf2md_batch::BatchConfig;
///
/// let config = BatchConfig::builder()
///     .api_key("sk-test")
///     .model("gpt-4o-mini")
///     .chunk_threshold(50)
///     .build()
///     .unwrap();
/// assert_eq!(config.chunk_threshold, 50);
/// ```
#[derive(Clone)]
pub struct BatchConfig {
    /// API key sent as a bearer token. Never printed by `Debug`.
    pub api_key: Option<String>,

    /// API base URL including the version segment. Default: [`DEFAULT_BASE_URL`].
    pub base_url: String,

    /// Model identifier placed in every request body. Default: `gpt-4o-mini`.
    pub model: String,

    /// Relative URL each request line targets. Default: `/v1/chat/completions`.
    pub endpoint: String,

    /// Completion window requested when creating a batch. Default: `24h`.
    ///
    /// The batch API only accepts `24h` today; it is configurable so a
    /// compatible service with other windows can be targeted.
    pub completion_window: String,

    /// Sampling temperature. Default: 0.05.
    pub temperature: f32,

    /// Output token cap per page. Default: 8192.
    pub max_tokens: u32,

    /// System prompt override. None uses [`crate::prompts::BATCH_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,

    /// User prompt override. None uses [`crate::prompts::BATCH_USER_PROMPT`].
    pub user_prompt: Option<String>,

    /// Maximum work units per remote job. Default: 100.
    ///
    /// Large uploads hit the service's enqueued-token limit and are rejected
    /// as a whole. Splitting into chunks keeps each job under the limit; the
    /// chunks are tracked together as one job group.
    pub chunk_threshold: usize,

    /// Partition used when `n > chunk_threshold`. Default: fixed stride.
    pub chunk_strategy: ChunkStrategy,

    /// Longest wait for a chunk to leave `validating`/`queued` before the next
    /// chunk is submitted anyway. Default: 120 000 ms.
    pub admission_timeout_ms: u64,

    /// Poll interval during the admission wait. Default: 10 000 ms.
    pub admission_poll_ms: u64,

    /// Interval between status polls while monitoring. Default: 30 000 ms.
    pub poll_interval_ms: u64,

    /// Retries on transient API failures. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay; doubles after each attempt. Default: 1000 ms.
    pub retry_backoff_ms: u64,

    /// Per-HTTP-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Root for working files. The job temp directory is `{work_dir}/temp_batch`.
    /// Default: `temp`.
    pub work_dir: PathBuf,

    /// Directory receiving `{document_id}_batch.md` files. Default: `converted`.
    pub output_dir: PathBuf,

    /// Paths cleanup must never touch (typically the input directory).
    pub protected_paths: Vec<PathBuf>,

    /// Pricing used by the usage analyzer. Default: 0.150 / 0.600 USD per 1M tokens.
    pub rates: CostRates,

    /// Write `usage_stats_{group_id}.json` after retrieval. Default: true.
    pub write_usage_report: bool,

    /// Receives submission and monitoring events.
    pub progress_callback: ProgressCallback,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            completion_window: "24h".to_string(),
            temperature: crate::prompts::BATCH_TEMPERATURE,
            max_tokens: crate::prompts::BATCH_MAX_TOKENS,
            system_prompt: None,
            user_prompt: None,
            chunk_threshold: 100,
            chunk_strategy: ChunkStrategy::default(),
            admission_timeout_ms: 120_000,
            admission_poll_ms: 10_000,
            poll_interval_ms: 30_000,
            max_retries: 3,
            retry_backoff_ms: 1000,
            api_timeout_secs: 60,
            work_dir: PathBuf::from("temp"),
            output_dir: PathBuf::from("converted"),
            protected_paths: Vec::new(),
            rates: CostRates::default(),
            write_usage_report: true,
            progress_callback: Arc::new(NoopProgressCallback),
        }
    }
}

impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("chunk_threshold", &self.chunk_threshold)
            .field("chunk_strategy", &self.chunk_strategy)
            .field("admission_timeout_ms", &self.admission_timeout_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_retries", &self.max_retries)
            .field("work_dir", &self.work_dir)
            .field("output_dir", &self.output_dir)
            .field("rates", &self.rates)
            .finish()
    }
}

impl BatchConfig {
    /// Create a new builder for `BatchConfig`.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: Self::default(),
        }
    }

    /// `{work_dir}/temp_batch`: job records, request files, page directories.
    pub fn job_temp_dir(&self) -> PathBuf {
        self.work_dir.join(JOB_TEMP_DIR)
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .unwrap_or(crate::prompts::BATCH_SYSTEM_PROMPT)
    }

    pub fn user_prompt(&self) -> &str {
        self.user_prompt
            .as_deref()
            .unwrap_or(crate::prompts::BATCH_USER_PROMPT)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }
}

/// Builder for [`BatchConfig`].
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl fmt::Debug for BatchConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.config.fmt(f)
    }
}

impl BatchConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn completion_window(mut self, window: impl Into<String>) -> Self {
        self.config.completion_window = window.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.max_tokens = n.max(1);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn user_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.user_prompt = Some(prompt.into());
        self
    }

    pub fn chunk_threshold(mut self, n: usize) -> Self {
        self.config.chunk_threshold = n;
        self
    }

    pub fn chunk_strategy(mut self, strategy: ChunkStrategy) -> Self {
        self.config.chunk_strategy = strategy;
        self
    }

    pub fn admission_timeout_ms(mut self, ms: u64) -> Self {
        self.config.admission_timeout_ms = ms;
        self
    }

    pub fn admission_poll_ms(mut self, ms: u64) -> Self {
        self.config.admission_poll_ms = ms;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(10);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    /// Add a path cleanup must never remove.
    pub fn protect(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.protected_paths.push(path.into());
        self
    }

    pub fn rates(mut self, rates: CostRates) -> Self {
        self.config.rates = rates;
        self
    }

    pub fn write_usage_report(mut self, v: bool) -> Self {
        self.config.write_usage_report = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = cb;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<BatchConfig, BatchError> {
        let c = &self.config;
        if c.chunk_threshold == 0 {
            return Err(BatchError::InvalidConfig(
                "chunk_threshold must be ≥ 1".into(),
            ));
        }
        if c.poll_interval_ms == 0 {
            return Err(BatchError::InvalidConfig(
                "poll_interval_ms must be ≥ 1".into(),
            ));
        }
        if c.admission_timeout_ms > 0 && c.admission_poll_ms == 0 {
            return Err(BatchError::InvalidConfig(
                "admission_poll_ms must be ≥ 1 when an admission wait is configured".into(),
            ));
        }
        if !c.endpoint.starts_with('/') {
            return Err(BatchError::InvalidConfig(format!(
                "endpoint must be a relative URL starting with '/', got '{}'",
                c.endpoint
            )));
        }
        if c.model.trim().is_empty() {
            return Err(BatchError::InvalidConfig("model must not be empty".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_batch_service() {
        let c = BatchConfig::default();
        assert_eq!(c.model, "gpt-4o-mini");
        assert_eq!(c.chunk_threshold, 100);
        assert_eq!(c.admission_timeout_ms, 120_000);
        assert_eq!(c.admission_poll_ms, 10_000);
        assert_eq!(c.poll_interval_ms, 30_000);
        assert_eq!(c.completion_window, "24h");
        assert_eq!(c.max_tokens, 8192);
        assert_eq!(c.job_temp_dir(), PathBuf::from("temp/temp_batch"));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = BatchConfig::builder().chunk_threshold(0).build().unwrap_err();
        assert!(matches!(err, BatchError::InvalidConfig(_)));
    }

    #[test]
    fn endpoint_must_be_relative() {
        assert!(BatchConfig::builder()
            .endpoint("https://api.openai.com/v1/chat/completions")
            .build()
            .is_err());
    }

    #[test]
    fn setters_clamp() {
        let c = BatchConfig::builder()
            .temperature(9.0)
            .max_retries(50)
            .base_url("http://localhost:8080/v1/")
            .build()
            .unwrap();
        assert_eq!(c.temperature, 2.0);
        assert_eq!(c.max_retries, 10);
        assert_eq!(c.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn debug_redacts_api_key() {
        let c = BatchConfig::builder().api_key("sk-secret").build().unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn prompt_overrides() {
        let c = BatchConfig::builder().user_prompt("just text").build().unwrap();
        assert_eq!(c.user_prompt(), "just text");
        assert_eq!(c.system_prompt(), crate::prompts::BATCH_SYSTEM_PROMPT);
    }
}
