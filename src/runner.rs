//! End-to-end entry points over one backend and one job store.
//!
//! [`BatchRunner`] owns the shared pieces (`Arc<dyn BatchBackend>`,
//! `Arc<dyn JobStore>`, [`BatchConfig`]) and hands short-lived borrows to the
//! components in [`crate::batch`]. Every operation works from the durable
//! record, so `submit`, `status`, `retrieve` and `cleanup` can run in separate
//! processes; [`BatchRunner::run`] chains them in one.

use crate::backend::openai::OpenAiBatchClient;
use crate::backend::BatchBackend;
use crate::batch::cleanup::{CleanupManager, CleanupReport, CleanupScope};
use crate::batch::monitor::{GroupProgress, MonitorOutcome, StatusMonitor};
use crate::batch::pacing::{AdmissionPacer, NoPacing, SequentialPacer};
use crate::batch::retrieve::{ResultRetriever, RetrievalReport};
use crate::batch::submit::{JobSubmitter, SubmissionOutcome};
use crate::batch::usage::UsageReport;
use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::model::JobGroup;
use crate::pipeline::input;
use crate::store::{FileJobStore, JobStore};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Output of [`BatchRunner::retrieve`].
#[derive(Debug, Clone)]
pub struct RetrievedGroup {
    pub report: RetrievalReport,
    pub usage: UsageReport,
    /// Where `usage_stats_{group_id}.json` was written, if enabled.
    pub usage_path: Option<PathBuf>,
}

/// Output of [`BatchRunner::run`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub submission: SubmissionOutcome,
    pub monitor: MonitorOutcome,
    pub retrieved: RetrievedGroup,
    pub cleanup: CleanupReport,
}

/// Every readable group in `store`, oldest first. Unreadable records are
/// logged and left out.
pub fn list_groups(store: &dyn JobStore) -> Result<Vec<JobGroup>, BatchError> {
    let mut groups = Vec::new();
    for id in store.list()? {
        match store.get(&id) {
            Ok(Some(g)) => groups.push(g),
            Ok(None) => {}
            Err(e) => warn!("Skipping job group {}: {}", id, e),
        }
    }
    groups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(groups)
}

pub struct BatchRunner {
    backend: Arc<dyn BatchBackend>,
    store: Arc<dyn JobStore>,
    config: BatchConfig,
}

impl BatchRunner {
    pub fn new(backend: Arc<dyn BatchBackend>, store: Arc<dyn JobStore>, config: BatchConfig) -> Self {
        Self {
            backend,
            store,
            config,
        }
    }

    /// OpenAI client plus a [`FileJobStore`] in the job temp directory.
    pub fn from_config(config: BatchConfig) -> Result<Self, BatchError> {
        let backend = OpenAiBatchClient::from_config(&config)?;
        let store = FileJobStore::new(config.job_temp_dir());
        Ok(Self::new(Arc::new(backend), Arc::new(store), config))
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    fn pacer(&self) -> Box<dyn AdmissionPacer> {
        let cfg = &self.config;
        if cfg.admission_timeout_ms == 0 {
            Box::new(NoPacing)
        } else {
            Box::new(SequentialPacer::new(
                Duration::from_millis(cfg.admission_timeout_ms),
                Duration::from_millis(cfg.admission_poll_ms),
            ))
        }
    }

    fn protecting(&self, path: &Path) -> BatchConfig {
        let mut cfg = self.config.clone();
        if !cfg.protected_paths.iter().any(|p| p == path) {
            cfg.protected_paths.push(path.to_path_buf());
        }
        cfg
    }

    /// Load a stored group or fail with `GroupNotFound`.
    pub fn load(&self, group_id: &str) -> Result<JobGroup, BatchError> {
        self.store
            .get(group_id)?
            .ok_or_else(|| BatchError::GroupNotFound {
                group_id: group_id.to_string(),
            })
    }

    /// Discover page images under `input_dir` and submit them as one group.
    ///
    /// `input_dir` is stored with the group as a protected path, so later
    /// cleanups in any process leave it alone.
    pub async fn submit(&self, input_dir: &Path) -> Result<SubmissionOutcome, BatchError> {
        let mut units = input::discover(input_dir)?;
        let cfg = self.protecting(input_dir);
        let pacer = self.pacer();
        let submitter =
            JobSubmitter::new(self.backend.as_ref(), self.store.as_ref(), &cfg, pacer.as_ref());
        let outcome = submitter.submit(&mut units).await?;
        if let Some(err) = &outcome.aborted {
            warn!(
                "Submission of {} stopped early, {} chunk(s) created: {}",
                outcome.group.group_id,
                outcome.group.total_chunks(),
                err
            );
        }
        Ok(outcome)
    }

    /// Poll every chunk once and persist the observation.
    pub async fn status(&self, group_id: &str) -> Result<GroupProgress, BatchError> {
        let mut group = self.load(group_id)?;
        let monitor = StatusMonitor::new(self.backend.as_ref(), self.store.as_ref(), &self.config);
        let progress = monitor.poll_once(&mut group).await;
        self.store.put(&group)?;
        Ok(progress)
    }

    /// Poll until the group is accepted, failed or `cancel` is set.
    pub async fn monitor(&self, group_id: &str, cancel: &AtomicBool) -> Result<MonitorOutcome, BatchError> {
        let group = self.load(group_id)?;
        StatusMonitor::new(self.backend.as_ref(), self.store.as_ref(), &self.config)
            .wait(group, cancel)
            .await
    }

    /// Refresh chunk statuses, then retrieve results, write documents and the
    /// usage report, and mark the group retrieved.
    pub async fn retrieve(&self, group_id: &str) -> Result<RetrievedGroup, BatchError> {
        let mut group = self.load(group_id)?;
        StatusMonitor::new(self.backend.as_ref(), self.store.as_ref(), &self.config)
            .poll_once(&mut group)
            .await;
        self.store.put(&group)?;

        let report = ResultRetriever::new(self.backend.as_ref(), &self.config)
            .retrieve(&group)
            .await?;

        let usage = UsageReport::analyze(&group.group_id, &group.model, &report.usage, &self.config.rates);
        let usage_path = if self.config.write_usage_report {
            Some(usage.write_json(&self.config.work_dir)?)
        } else {
            None
        };

        group.retrieved_at = Some(Utc::now());
        self.store.put(&group)?;
        info!(
            "Retrieved {}/{} work units of {} into {} document(s), cost ${:.4}",
            report.retrieved,
            report.expected,
            group.group_id,
            report.artifacts.len(),
            usage.total.total_cost
        );
        Ok(RetrievedGroup {
            report,
            usage,
            usage_path,
        })
    }

    pub fn list(&self) -> Result<Vec<JobGroup>, BatchError> {
        list_groups(self.store.as_ref())
    }

    pub fn cleanup(&self, scope: CleanupScope) -> Result<CleanupReport, BatchError> {
        CleanupManager::new(&self.config, self.store.as_ref()).remove(scope)
    }

    pub fn remove_group(&self, group_id: &str) -> Result<CleanupReport, BatchError> {
        CleanupManager::new(&self.config, self.store.as_ref()).remove_group(group_id)
    }

    /// Submit → monitor → retrieve → clean up request files.
    ///
    /// `input_dir` is protected from cleanup for the duration of the call.
    pub async fn run(&self, input_dir: &Path, cancel: &AtomicBool) -> Result<RunOutcome, BatchError> {
        // ── Step 1: Submit ───────────────────────────────────────────────
        let submission = self.submit(input_dir).await?;
        let group_id = submission.group.group_id.clone();

        // ── Step 2: Monitor ──────────────────────────────────────────────
        let monitor = StatusMonitor::new(self.backend.as_ref(), self.store.as_ref(), &self.config)
            .wait(submission.group.clone(), cancel)
            .await?;

        // ── Step 3: Retrieve + usage ─────────────────────────────────────
        let retrieved = self.retrieve(&group_id).await?;

        // ── Step 4: Cleanup ──────────────────────────────────────────────
        let cfg = self.protecting(input_dir);
        let cleanup = CleanupManager::new(&cfg, self.store.as_ref()).remove(CleanupScope::JobTempFiles)?;

        Ok(RunOutcome {
            submission,
            monitor,
            retrieved,
            cleanup,
        })
    }
}
