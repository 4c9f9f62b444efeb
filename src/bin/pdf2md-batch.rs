//! CLI binary for edgequake-pdf2md-batch.
//!
//! A thin shim over the library crate that maps CLI flags to `BatchConfig`,
//! dispatches one subcommand to `BatchRunner` and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgequake_pdf2md_batch::batch::cleanup::CleanupManager;
use edgequake_pdf2md_batch::batch::monitor::GroupProgress;
use edgequake_pdf2md_batch::runner::list_groups;
use edgequake_pdf2md_batch::{
    BatchConfig, BatchProgressCallback, BatchRunner, CleanupReport, CleanupScope, FileJobStore,
    JobGroup, ProgressCallback, RetrievedGroup, SubmissionOutcome,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar, re-styled per phase: chunks while submitting, work units while
/// monitoring.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn activate_bar(&self, total: usize, prefix: &'static str, unit: &str) {
        let style = ProgressStyle::with_template(&format!(
            "{{spinner:.cyan}} {{prefix:.bold}}  [{{bar:42.green/238}}] {{pos:>4}}/{{len}} {unit}  ⏱ {{elapsed_precise}}  {{msg}}"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix(prefix);
        self.bar.set_position(0);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_submission_start(&self, total_units: usize, total_chunks: usize) {
        self.activate_bar(total_chunks, "Submitting", "chunks");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Submitting {total_units} pages in {total_chunks} chunk(s)…"))
        ));
    }

    fn on_chunk_submitted(&self, index: usize, total_chunks: usize, job_id: &str, units: usize) {
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}  {}",
            green("✓"),
            index + 1,
            total_chunks,
            job_id,
            dim(&format!("{units} pages"))
        ));
        self.bar.inc(1);
    }

    fn on_chunk_skipped(&self, index: usize, total_chunks: usize, error: &str) {
        let msg = match error.lines().next() {
            Some(line) if line.chars().count() > 80 => {
                format!("{}\u{2026}", line.chars().take(79).collect::<String>())
            }
            Some(line) => line.to_string(),
            None => String::new(),
        };
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}",
            red("✗"),
            index + 1,
            total_chunks,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_admission_wait(&self, job_id: &str, status: &str, waited_ms: u64) {
        self.bar
            .set_message(format!("{job_id} {status} ({}s)", waited_ms / 1000));
    }

    fn on_poll(&self, progress: &GroupProgress) {
        if self.bar.length() != Some(progress.total_work_units as u64) {
            self.activate_bar(progress.total_work_units, "Processing", "pages");
        }
        self.bar.set_position(progress.completed_work_units as u64);
        self.bar.set_message(format!(
            "{}/{} chunks done{}",
            progress.completed_chunks,
            progress.total_chunks,
            if progress.failed_chunks > 0 {
                format!(", {} failed", progress.failed_chunks)
            } else {
                String::new()
            }
        ));
    }

    fn on_document_written(&self, document_id: &str, pages: usize, path: &Path) {
        self.bar.println(format!(
            "  {} {:<24} {}  {}",
            green("✓"),
            document_id,
            dim(&format!("{pages:>4} pages")),
            dim(&path.display().to_string())
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Submit every document under pages/ (one sub-directory per document)
  pdf2md-batch submit pages/

  # Check progress, then fetch results
  pdf2md-batch status group_20250716T101500_1a2b3c4d
  pdf2md-batch retrieve group_20250716T101500_1a2b3c4d

  # Wait for completion before retrieving
  pdf2md-batch retrieve --wait group_20250716T101500_1a2b3c4d

  # Everything in one go
  pdf2md-batch run pages/ -o converted/

  # Remove request files, stale records and page directories
  pdf2md-batch cleanup --scope workspace

INPUT LAYOUT:
  pages/manual/page_0001.png      document "manual", page 1
  pages/manual/page_0002.jpg      document "manual", page 2
  pages/report/page_0001.png      document "report", page 1

  Page images are produced by any rasteriser; page numbers come from
  the file name.

PRICING (gpt-4o-mini, batch):
  $0.150 / 1M input tokens, $0.600 / 1M output tokens
  Batch jobs cost 50% of synchronous calls and finish within 24h.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  OPENAI_API_BASE         Base URL of an OpenAI-compatible batch API
  OPENAI_DEFAULT_MODEL    Model used for new submissions
  RUST_LOG                Overrides the log filter
"#;

/// Convert page images to Markdown through the OpenAI Batch API.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2md-batch",
    version,
    about = "Convert page images to Markdown through the OpenAI Batch API",
    long_about = "Submit page images as asynchronous batch jobs (chunked when large), monitor \
them, retrieve one Markdown file per document with a cost footer, and clean up working files.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OpenAI API key.
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// API base URL.
    #[arg(long, global = true, env = "OPENAI_API_BASE")]
    base_url: Option<String>,

    /// Vision model for new submissions.
    #[arg(long, global = true, env = "OPENAI_DEFAULT_MODEL")]
    model: Option<String>,

    /// Working directory for job records and request files.
    #[arg(long, global = true, env = "PDF2MD_BATCH_WORK_DIR", default_value = "temp")]
    work_dir: PathBuf,

    /// Directory for composed Markdown files.
    #[arg(short, long, global = true, env = "PDF2MD_BATCH_OUTPUT", default_value = "converted")]
    output: PathBuf,

    /// Work units per chunk before a submission is split.
    #[arg(long, global = true, env = "PDF2MD_BATCH_CHUNK", default_value_t = 100)]
    chunk_threshold: usize,

    /// Seconds between status polls.
    #[arg(long, global = true, env = "PDF2MD_BATCH_POLL", default_value_t = 30)]
    poll_interval: u64,

    /// Seconds to wait for a chunk's admission before submitting the next (0 = no wait).
    #[arg(long, global = true, env = "PDF2MD_BATCH_ADMISSION", default_value_t = 120)]
    admission_timeout: u64,

    /// Retries per remote call on transient failures.
    #[arg(long, global = true, env = "PDF2MD_BATCH_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call HTTP timeout in seconds.
    #[arg(long, global = true, env = "PDF2MD_BATCH_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Do not write usage_stats_{group}.json.
    #[arg(long, global = true)]
    no_usage_report: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "PDF2MD_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2MD_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit the page images under INPUT_DIR as one job group.
    Submit { input_dir: PathBuf },

    /// Poll a job group once and print per-chunk progress.
    Status { group_id: String },

    /// Download results and write one Markdown file per document.
    Retrieve {
        group_id: String,

        /// Monitor until the group is done before retrieving.
        #[arg(long)]
        wait: bool,

        /// Fail unless every page was retrieved.
        #[arg(long)]
        require_complete: bool,
    },

    /// Remove temporary files.
    Cleanup {
        #[arg(long, value_enum, default_value = "job-temp-files")]
        scope: ScopeArg,

        /// Remove only this finished group's working directories and record.
        #[arg(long)]
        group: Option<String>,
    },

    /// List stored job groups.
    List,

    /// Submit, monitor, retrieve and clean up in one go.
    Run { input_dir: PathBuf },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ScopeArg {
    JobTempFiles,
    Workspace,
    All,
}

impl From<ScopeArg> for CleanupScope {
    fn from(v: ScopeArg) -> Self {
        match v {
            ScopeArg::JobTempFiles => CleanupScope::JobTempFiles,
            ScopeArg::Workspace => CleanupScope::Workspace,
            ScopeArg::All => CleanupScope::All,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb = show_progress.then(CliProgressCallback::new);
    let config = build_config(&cli, progress_cb.clone())?;

    // Cancellation is observed between polls.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let result = dispatch(&cli, config, &cancel).await;
    if let Some(cb) = &progress_cb {
        cb.finish();
    }
    result
}

async fn dispatch(cli: &Cli, config: BatchConfig, cancel: &AtomicBool) -> Result<()> {
    let quiet = cli.quiet;
    match &cli.command {
        Command::Submit { input_dir } => {
            let runner = BatchRunner::from_config(config).context("Cannot create batch client")?;
            let outcome = runner.submit(input_dir).await.context("Submission failed")?;
            print_submission(&outcome, quiet);
            // Stdout carries only the id, for scripting.
            println!("{}", outcome.group.group_id);
        }

        Command::Status { group_id } => {
            let runner = BatchRunner::from_config(config).context("Cannot create batch client")?;
            let progress = runner.status(group_id).await.context("Status check failed")?;
            print_progress(&progress);
        }

        Command::Retrieve {
            group_id,
            wait,
            require_complete,
        } => {
            let runner = BatchRunner::from_config(config).context("Cannot create batch client")?;
            if *wait {
                runner
                    .monitor(group_id, cancel)
                    .await
                    .context("Monitoring failed")?;
            }
            let retrieved = runner.retrieve(group_id).await.context("Retrieval failed")?;
            print_retrieval(&retrieved, quiet);
            if *require_complete {
                retrieved
                    .report
                    .into_complete()
                    .context("Some pages were not retrieved")?;
            }
        }

        // Local-only commands: no API key needed.
        Command::Cleanup { scope, group } => {
            let store = FileJobStore::new(config.job_temp_dir());
            let manager = CleanupManager::new(&config, &store);
            let report = match group {
                Some(id) => manager.remove_group(id).context("Group cleanup failed")?,
                None => manager.remove((*scope).into()).context("Cleanup failed")?,
            };
            print_cleanup(&report, quiet);
        }

        Command::List => {
            let store = FileJobStore::new(config.job_temp_dir());
            let groups = list_groups(&store).context("Cannot list job groups")?;
            print_groups(&groups);
        }

        Command::Run { input_dir } => {
            let runner = BatchRunner::from_config(config).context("Cannot create batch client")?;
            let out = runner
                .run(input_dir, cancel)
                .await
                .context("Batch run failed")?;
            print_submission(&out.submission, quiet);
            print_retrieval(&out.retrieved, quiet);
            print_cleanup(&out.cleanup, quiet);
        }
    }
    Ok(())
}

/// Map CLI args to `BatchConfig`.
fn build_config(cli: &Cli, progress: Option<Arc<CliProgressCallback>>) -> Result<BatchConfig> {
    let mut builder = BatchConfig::builder()
        .work_dir(&cli.work_dir)
        .output_dir(&cli.output)
        .chunk_threshold(cli.chunk_threshold)
        .poll_interval_ms(cli.poll_interval.saturating_mul(1000))
        .admission_timeout_ms(cli.admission_timeout.saturating_mul(1000))
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .write_usage_report(!cli.no_usage_report);

    if let Some(ref key) = cli.api_key {
        builder = builder.api_key(key);
    }
    if let Some(ref url) = cli.base_url {
        builder = builder.base_url(url);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Command::Run { input_dir } | Command::Submit { input_dir } = &cli.command {
        builder = builder.protect(input_dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb as ProgressCallback);
    }

    builder.build().context("Invalid configuration")
}

// ── Printing ─────────────────────────────────────────────────────────────────

fn print_submission(outcome: &SubmissionOutcome, quiet: bool) {
    if quiet {
        return;
    }
    let g = &outcome.group;
    let mark = if outcome.is_complete() { green("✔") } else { yellow("⚠") };
    eprintln!(
        "{}  group {}  {} pages in {} chunk(s)",
        mark,
        bold(&g.group_id),
        g.total_work_units,
        g.total_chunks()
    );
    for s in &outcome.skipped_chunks {
        eprintln!(
            "   {} chunk {} skipped ({} pages): {}",
            red("✗"),
            s.index + 1,
            s.correlation_ids.len(),
            s.error.to_string().lines().next().unwrap_or_default()
        );
    }
    if let Some(err) = &outcome.aborted {
        eprintln!("   {} submission stopped: {}", red("✘"), err);
    }
}

fn print_progress(p: &GroupProgress) {
    println!(
        "{}  {}/{} chunks completed, {} failed, {} in progress",
        bold(&p.group_id),
        p.completed_chunks,
        p.total_chunks,
        p.failed_chunks,
        p.in_progress_chunks
    );
    println!(
        "   {}/{} pages ({:.1}%)",
        p.completed_work_units,
        p.total_work_units,
        p.completion_fraction() * 100.0
    );
    for c in &p.chunks {
        let mark = if c.is_completed() {
            green("✓")
        } else if c.is_failed() {
            red("✗")
        } else {
            cyan("…")
        };
        let note = c
            .poll_error
            .as_deref()
            .map(|e| red(&format!("  poll failed: {e}")))
            .unwrap_or_default();
        println!(
            "   {} chunk {:>3}  {:<28} {:<12} {:>4}/{:<4}{}",
            mark,
            c.index + 1,
            c.job_id,
            c.status.to_string(),
            c.completed,
            c.total,
            note
        );
    }
}

fn print_retrieval(r: &RetrievedGroup, quiet: bool) {
    if quiet {
        return;
    }
    let rep = &r.report;
    let mark = if rep.missing.is_empty() { green("✔") } else { yellow("⚠") };
    eprintln!(
        "{}  {}/{} pages retrieved into {} document(s)",
        mark,
        rep.retrieved,
        rep.expected,
        rep.artifacts.len()
    );
    for a in &rep.artifacts {
        eprintln!("   {} {}", dim("→"), bold(&a.path.display().to_string()));
    }
    if rep.malformed_lines > 0 || !rep.unresolved.is_empty() {
        eprintln!(
            "   {} {} malformed line(s), {} unknown id(s) skipped",
            yellow("⚠"),
            rep.malformed_lines,
            rep.unresolved.len()
        );
    }
    let t = &r.usage.total;
    eprintln!(
        "   {} tokens ({} in / {} out)  ${:.4}  {}",
        dim(&t.total_tokens.to_string()),
        t.prompt_tokens,
        t.completion_tokens,
        t.total_cost,
        dim(&format!("saved ${:.4} vs. regular pricing", t.batch_savings()))
    );
    if let Some(path) = &r.usage_path {
        eprintln!("   {} {}", dim("usage:"), path.display());
    }
}

fn print_cleanup(report: &CleanupReport, quiet: bool) {
    if quiet {
        return;
    }
    eprintln!(
        "{}  removed {} item(s), kept {}",
        green("✔"),
        report.removed_count(),
        report.skipped_count()
    );
    for (path, reason) in &report.skipped {
        eprintln!("   {} {} ({:?})", dim("kept"), path.display(), reason);
    }
}

fn print_groups(groups: &[JobGroup]) {
    if groups.is_empty() {
        println!("No job groups found.");
        return;
    }
    for g in groups {
        let state = if g.retrieved_at.is_some() {
            green("retrieved")
        } else if g.is_active() {
            cyan("active")
        } else {
            yellow("finished")
        };
        println!(
            "{}  {}  {:>5} pages  {:>3} chunk(s)  {}  {}",
            bold(&g.group_id),
            g.created_at.format("%Y-%m-%d %H:%M"),
            g.total_work_units,
            g.total_chunks(),
            g.model,
            state
        );
    }
}
