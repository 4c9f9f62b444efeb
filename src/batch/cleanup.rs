//! Cleanup Manager: remove temporary artifacts without touching anything
//! still needed.
//!
//! | Scope | Removes |
//! |---|---|
//! | [`CleanupScope::JobTempFiles`] | `batch_requests_*.jsonl`, `batch_info_*.json` and per-document directories in the job temp dir |
//! | [`CleanupScope::Workspace`] | the above plus `usage_stats_*.json` and `page_*.{jpg,png}` at the work dir root |
//! | [`CleanupScope::All`] | the above plus every other entry of the job temp dir, the job temp dir itself, and stray request/record files at the work dir root |
//!
//! Every candidate passes a guard first. A path is skipped when
//!
//! * any of its components contains `session`, or it contains such a path;
//! * it is, contains, or lies inside a protected path, either configured or
//!   recorded on any stored job group at submission;
//! * it is, contains, or lies inside a working directory of a job group that
//!   is still active or not retrieved yet, or it is the record of one.
//!
//! [`CleanupManager::remove_group`] only deletes working directories inside
//! the job temp directory; anything elsewhere is user input.
//!
//! Running any scope twice removes nothing the second time.

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::store::{JobStore, RECORD_PREFIX};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

static RE_REQUEST_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^batch_requests_.+\.jsonl$").unwrap());
static RE_RECORD_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^batch_info_(.+)\.json$").unwrap());
static RE_USAGE_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^usage_stats_.+\.json$").unwrap());
static RE_PAGE_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^page_.+\.(jpe?g|png)$").unwrap());

const SESSION_MARKER: &str = "session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupScope {
    #[default]
    JobTempFiles,
    Workspace,
    All,
}

/// Why a candidate was left in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SessionMarker,
    Protected,
    ActiveGroup,
    /// The group finished but its results were never retrieved.
    NotRetrieved,
    /// Directory removal was non-recursive and entries remain.
    NotEmpty,
    /// The filesystem refused the removal.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub skipped: Vec<(PathBuf, SkipReason)>,
}

impl CleanupReport {
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    fn skip(&mut self, path: &Path, reason: SkipReason) {
        debug!("Keeping {} ({:?})", path.display(), reason);
        self.skipped.push((path.to_path_buf(), reason));
    }
}

fn has_session_marker(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_string_lossy()
            .to_ascii_lowercase()
            .contains(SESSION_MARKER)
    })
}

/// Whether any entry below `dir` carries the session marker.
fn has_marked_descendant(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|e| {
        let p = e.path();
        has_session_marker(Path::new(&e.file_name())) || (p.is_dir() && has_marked_descendant(&p))
    })
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Paths that must survive this cleanup.
#[derive(Debug, Default)]
struct Guard {
    protected: Vec<PathBuf>,
    held_dirs: Vec<(PathBuf, SkipReason)>,
    held_ids: BTreeMap<String, SkipReason>,
}

impl Guard {
    fn hold(&mut self, group_id: String, dirs: Vec<PathBuf>, reason: SkipReason) {
        self.held_dirs
            .extend(dirs.iter().map(|d| (normalize(d), reason)));
        self.held_ids.insert(group_id, reason);
    }

    fn check(&self, path: &Path) -> Option<SkipReason> {
        if has_session_marker(path) || (path.is_dir() && has_marked_descendant(path)) {
            return Some(SkipReason::SessionMarker);
        }
        let p = normalize(path);
        if self.protected.iter().any(|g| overlaps(&p, g)) {
            return Some(SkipReason::Protected);
        }
        if let Some((_, reason)) = self.held_dirs.iter().find(|(g, _)| overlaps(&p, g)) {
            return Some(*reason);
        }
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        if let Some(caps) = RE_RECORD_FILE.captures(&name) {
            if let Some(reason) = caps.get(1).and_then(|id| self.held_ids.get(id.as_str())) {
                return Some(*reason);
            }
        }
        // A directory holding a kept record would take it along.
        if path.is_dir() {
            let held = self
                .held_ids
                .iter()
                .find(|(id, _)| path.join(format!("{RECORD_PREFIX}{id}.json")).exists());
            if let Some((_, reason)) = held {
                return Some(*reason);
            }
        }
        None
    }
}

/// Removes temporary files of finished job groups.
pub struct CleanupManager<'a> {
    config: &'a BatchConfig,
    store: &'a dyn JobStore,
}

impl<'a> CleanupManager<'a> {
    pub fn new(config: &'a BatchConfig, store: &'a dyn JobStore) -> Self {
        Self { config, store }
    }

    /// Build the guard from the config and every stored group. `exclude`
    /// names a group whose own retention is being overridden.
    fn guard(&self, exclude: Option<&str>) -> Result<Guard, BatchError> {
        let mut guard = Guard {
            protected: self.config.protected_paths.iter().map(|p| normalize(p)).collect(),
            ..Default::default()
        };
        for id in self.store.list()? {
            match self.store.get(&id) {
                Ok(Some(group)) => {
                    guard
                        .protected
                        .extend(group.protected_paths.iter().map(|p| normalize(p)));
                    if exclude == Some(id.as_str()) {
                        continue;
                    }
                    if group.is_active() {
                        guard.hold(id, group.working_dirs(), SkipReason::ActiveGroup);
                    } else if !group.is_retrieved() {
                        guard.hold(id, group.working_dirs(), SkipReason::NotRetrieved);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // Unknown state: keep the record.
                    warn!("Cannot read job group {}, treating it as active: {}", id, e);
                    guard.held_ids.insert(id, SkipReason::ActiveGroup);
                }
            }
        }
        Ok(guard)
    }

    fn candidates(&self, scope: CleanupScope) -> Vec<PathBuf> {
        let temp = self.config.job_temp_dir();
        let root = &self.config.work_dir;
        let mut out = Vec::new();

        for (path, name, is_dir) in list_dir(&temp) {
            let wanted = match scope {
                CleanupScope::All => true,
                _ => is_dir || RE_REQUEST_FILE.is_match(&name) || RE_RECORD_FILE.is_match(&name),
            };
            if wanted {
                out.push(path);
            }
        }

        if scope != CleanupScope::JobTempFiles {
            for (path, name, is_dir) in list_dir(root) {
                if is_dir {
                    continue;
                }
                let workspace = RE_USAGE_FILE.is_match(&name) || RE_PAGE_IMAGE.is_match(&name);
                let stray = scope == CleanupScope::All
                    && (RE_REQUEST_FILE.is_match(&name) || RE_RECORD_FILE.is_match(&name));
                if workspace || stray {
                    out.push(path);
                }
            }
        }
        out
    }

    /// Remove everything `scope` covers that passes the guard.
    pub fn remove(&self, scope: CleanupScope) -> Result<CleanupReport, BatchError> {
        let guard = self.guard(None)?;
        let mut report = CleanupReport::default();

        for path in self.candidates(scope) {
            remove_guarded(&guard, &path, &mut report);
        }

        if scope == CleanupScope::All {
            let temp = self.config.job_temp_dir();
            if temp.exists() {
                match guard.check(&temp) {
                    Some(reason) => report.skip(&temp, reason),
                    None => match std::fs::remove_dir(&temp) {
                        Ok(()) => report.removed.push(temp),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(_) => report.skip(&temp, SkipReason::NotEmpty),
                    },
                }
            }
        }

        info!(
            "Cleanup ({:?}): removed {}, kept {}",
            scope,
            report.removed_count(),
            report.skipped_count()
        );
        Ok(report)
    }

    /// Remove a finished group's working directories and its record.
    ///
    /// An active group is left untouched. Working directories outside the
    /// job temp directory are kept as user input. A group that was never
    /// retrieved is discarded all the same.
    pub fn remove_group(&self, group_id: &str) -> Result<CleanupReport, BatchError> {
        let group = self
            .store
            .get(group_id)?
            .ok_or_else(|| BatchError::GroupNotFound {
                group_id: group_id.to_string(),
            })?;
        let mut report = CleanupReport::default();
        if group.is_active() {
            for dir in group.working_dirs() {
                report.skip(&dir, SkipReason::ActiveGroup);
            }
            warn!("Job group {} is still active, nothing removed", group_id);
            return Ok(report);
        }
        if !group.is_retrieved() {
            warn!("Discarding job group {} without retrieved results", group_id);
        }

        let guard = self.guard(Some(group_id))?;
        let temp = normalize(&self.config.job_temp_dir());
        for dir in group.working_dirs() {
            let owned = normalize(&dir);
            if owned == temp || !owned.starts_with(&temp) {
                report.skip(&dir, SkipReason::Protected);
                continue;
            }
            remove_guarded(&guard, &dir, &mut report);
        }
        if self.store.delete(group_id)? {
            report
                .removed
                .push(self.config.job_temp_dir().join(format!("{RECORD_PREFIX}{group_id}.json")));
        }
        info!(
            "Removed job group {}: {} path(s), kept {}",
            group_id,
            report.removed_count(),
            report.skipped_count()
        );
        Ok(report)
    }
}

fn list_dir(dir: &Path) -> Vec<(PathBuf, String, bool)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<(PathBuf, String, bool)> = entries
        .flatten()
        .map(|e| {
            let path = e.path();
            let is_dir = path.is_dir();
            (path, e.file_name().to_string_lossy().into_owned(), is_dir)
        })
        .collect();
    out.sort();
    out
}

fn remove_guarded(guard: &Guard, path: &Path, report: &mut CleanupReport) {
    if !path.exists() {
        return;
    }
    if let Some(reason) = guard.check(path) {
        report.skip(path, reason);
        return;
    }
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => {
            debug!("Removed {}", path.display());
            report.removed.push(path.to_path_buf());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!("Could not remove {}: {}", path.display(), e);
            report.skip(path, SkipReason::Failed);
        }
    }
}
