//! Integration tests for the batch orchestration against the in-process
//! mock backend.
//!
//! Run with:
//!   cargo test --test batch_flow

mod common;

use common::{write_document, Harness};
use edgequake_pdf2md_batch::backend::mock::JobPlan;
use edgequake_pdf2md_batch::{
    BackendError, BatchError, BatchRunner, CleanupScope, CostRates, FileJobStore, JobStatus,
    JobStore, ProgressDecision, RetrievalError, SubmissionError, TokenUsage,
};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

// ── Helpers ────────────────────────────────────────────────────────────────

fn not_cancelled() -> AtomicBool {
    AtomicBool::new(false)
}

/// Three documents, 250 pages.
fn three_documents(h: &Harness) {
    write_document(&h.input(), "alpha", 120);
    write_document(&h.input(), "beta", 80);
    write_document(&h.input(), "gamma", 50);
}

fn page_positions(md: &str, pages: u32) -> Vec<usize> {
    (1..=pages)
        .map(|n| {
            md.find(&format!("---\n# Page {n}\n---\n"))
                .unwrap_or_else(|| panic!("page {n} missing"))
        })
        .collect()
}

// ── End to end ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_splits_retrieves_and_orders_pages() {
    let h = Harness::new();
    three_documents(&h);
    let runner = h.default_runner();

    let out = runner.run(&h.input(), &not_cancelled()).await.unwrap();

    // Fixed-stride chunks of the threshold, last one holds the rest.
    let sizes: Vec<usize> = h.backend.created_batches().iter().map(|(_, ids)| ids.len()).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(
        h.backend.descriptions()[0],
        "PDF conversion batch - 100 pages (chunk 1/3)"
    );
    assert!(out.submission.is_complete());
    assert_eq!(out.submission.group.total_work_units, 250);

    let report = &out.retrieved.report;
    assert!(!report.partial);
    assert_eq!(report.retrieved, 250);
    assert!(report.missing.is_empty());
    assert_eq!(report.artifacts.len(), 3);
    assert_eq!(
        report.documents["alpha"].page_numbers(),
        (1..=120).collect::<Vec<u32>>()
    );

    let alpha = std::fs::read_to_string(runner.config().output_dir.join("alpha_batch.md")).unwrap();
    let positions = page_positions(&alpha, 120);
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "pages out of order");
    assert!(alpha.contains("Content of alpha_page_0120"));
    assert!(alpha.contains("- **Master Batch ID:** "));
    assert!(alpha.contains("- **Total Pages:** 120"));

    // Every line reports 100 prompt + 50 completion tokens.
    let total = &out.retrieved.usage.total;
    assert_eq!(total.units, 250);
    assert_eq!(total.prompt_tokens, 25_000);
    assert_eq!(total.completion_tokens, 12_500);
    assert_eq!(total.total_tokens, 37_500);
    assert_eq!(out.retrieved.usage.documents["gamma"].units, 50);

    let stored = h.store.get(&out.submission.group.group_id).unwrap().unwrap();
    assert!(stored.retrieved_at.is_some());
    assert!(out.retrieved.usage_path.as_ref().unwrap().exists());
}

#[tokio::test]
async fn test_single_chunk_footer_names_the_batch() {
    let h = Harness::new();
    write_document(&h.input(), "memo", 3);
    let runner = h.default_runner();

    runner.run(&h.input(), &not_cancelled()).await.unwrap();

    let md = std::fs::read_to_string(runner.config().output_dir.join("memo_batch.md")).unwrap();
    assert!(md.starts_with("---\n# Page 1\n---\n\nContent of memo_page_0001\n\n"));
    assert!(md.contains("- **Processing Method:** OpenAI Batch API\n"));
    assert!(md.contains("- **Batch ID:** batch_001\n"));
    assert!(md.contains("### 📊 Processing Statistics"));
}

// ── Submission failures ────────────────────────────────────────────────────

#[tokio::test]
async fn test_fatal_error_stops_submission_but_keeps_created_chunks() {
    let h = Harness::new();
    three_documents(&h);
    h.backend.fail_create_call(
        1,
        BackendError::Quota {
            detail: "insufficient_quota".into(),
        },
    );
    let runner = h.default_runner();

    let outcome = runner.submit(&h.input()).await.unwrap();

    assert!(matches!(
        outcome.aborted,
        Some(SubmissionError::QuotaExceeded { .. })
    ));
    assert_eq!(outcome.group.total_chunks(), 1);
    assert_eq!(outcome.group.total_work_units, 100);
    assert_eq!(outcome.group.skipped_work_units.len(), 150);
    assert_eq!(h.backend.created_batches().len(), 1);

    // The created chunk is durable and retrievable on its own.
    let id = outcome.group.group_id.clone();
    assert!(h.store.get(&id).unwrap().is_some());
    runner.monitor(&id, &not_cancelled()).await.unwrap();
    let retrieved = runner.retrieve(&id).await.unwrap();
    assert_eq!(retrieved.report.retrieved, 100);
}

#[tokio::test]
async fn test_fatal_error_on_first_chunk_is_an_error() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 5);
    h.backend.fail_create_call(
        0,
        BackendError::Auth {
            detail: "invalid key".into(),
        },
    );

    let err = h.default_runner().submit(&h.input()).await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::Submission(SubmissionError::AuthInvalid { .. })
    ));
    assert!(h.store.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_chunk_failure_is_skipped() {
    let h = Harness::new();
    three_documents(&h);
    // max_retries = 2: three attempts for chunk 2, all failing.
    for call in 1..=3 {
        h.backend.fail_create_call(
            call,
            BackendError::Server {
                status: 503,
                detail: "overloaded".into(),
            },
        );
    }
    let runner = h.default_runner();

    let outcome = runner.submit(&h.input()).await.unwrap();

    assert!(outcome.aborted.is_none());
    assert_eq!(outcome.skipped_chunks.len(), 1);
    assert_eq!(outcome.skipped_chunks[0].index, 1);
    assert!(matches!(
        outcome.skipped_chunks[0].error,
        SubmissionError::Transient { attempts: 3, .. }
    ));
    let indices: Vec<usize> = outcome.group.chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 2]);
    assert_eq!(outcome.group.total_work_units, 150);

    let id = outcome.group.group_id.clone();
    runner.monitor(&id, &not_cancelled()).await.unwrap();
    let retrieved = runner.retrieve(&id).await.unwrap();
    assert_eq!(retrieved.report.retrieved, 150);
    assert!(retrieved.report.into_complete().is_ok());
}

// ── Monitoring policy ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_chunk_with_majority_completed_is_partial_success() {
    let h = Harness::new();
    three_documents(&h);
    h.backend.plan_job(1, JobPlan::failing());
    let runner = h.default_runner();

    let out = runner.run(&h.input(), &not_cancelled()).await.unwrap();

    assert!(out.monitor.decision.is_accepted());
    let report = out.retrieved.report.clone();
    assert!(report.partial);
    assert_eq!(report.retrieved, 150);
    assert_eq!(report.missing.len(), 100);
    assert!(matches!(
        report.into_complete(),
        Err(RetrievalError::Partial {
            retrieved: 150,
            expected: 250
        })
    ));
}

#[tokio::test]
async fn test_failed_chunk_without_majority_fails_group() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 200);
    h.backend.plan_job(0, JobPlan::failing());
    h.backend.plan_job(1, JobPlan::stuck(0));
    let runner = h.default_runner();

    let err = runner.run(&h.input(), &not_cancelled()).await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::GroupFailed {
            failed_chunks: 1,
            completed: 0,
            total: 200,
            ..
        }
    ));
}

#[tokio::test]
async fn test_chunk_completed_without_results_counts_as_failed() {
    let h = Harness::new();
    three_documents(&h);
    // Chunk 2 holds alpha 101..=120 and beta 1..=80.
    h.backend.plan_job(1, JobPlan::default().completed_count(0));
    let runner = h.default_runner();

    let out = runner.run(&h.input(), &not_cancelled()).await.unwrap();

    assert_eq!(out.monitor.progress.failed_chunks, 1);
    assert_eq!(out.monitor.progress.completed_work_units, 150);
    assert!(matches!(
        out.monitor.decision,
        ProgressDecision::PartialSuccess { .. }
    ));

    let report = &out.retrieved.report;
    assert!(report.partial);
    assert_eq!(report.retrieved, 150);
    let expected_missing: Vec<String> = (101..=120)
        .map(|n| format!("alpha_page_{n:04}"))
        .chain((1..=80).map(|n| format!("beta_page_{n:04}")))
        .collect();
    assert_eq!(report.missing, expected_missing);
    assert_eq!(report.documents["alpha"].page_numbers().len(), 100);
    assert!(!report.documents.contains_key("beta"));
}

#[tokio::test]
async fn test_chunks_completed_without_results_can_fail_the_group() {
    let h = Harness::new();
    three_documents(&h);
    h.backend.plan_job(0, JobPlan::default().completed_count(0));
    h.backend.plan_job(1, JobPlan::default().completed_count(0));

    let err = h.default_runner().run(&h.input(), &not_cancelled()).await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::GroupFailed {
            failed_chunks: 2,
            completed: 50,
            total: 250,
            ..
        }
    ));
}

#[tokio::test]
async fn test_cancel_stops_monitoring() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 3);
    h.backend.plan_job(0, JobPlan::stuck(1));
    let runner = h.default_runner();

    let id = runner.submit(&h.input()).await.unwrap().group.group_id;
    let err = runner.monitor(&id, &AtomicBool::new(true)).await.unwrap_err();
    assert!(matches!(err, BatchError::Cancelled { .. }));
}

#[tokio::test]
async fn test_retrieve_before_ready_is_rejected() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 100);
    h.backend.plan_job(0, JobPlan::stuck(89));
    let runner = h.default_runner();

    let id = runner.submit(&h.input()).await.unwrap().group.group_id;
    let progress = runner.status(&id).await.unwrap();
    assert_eq!(progress.completed_work_units, 89);

    let err = runner.retrieve(&id).await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::Retrieval(RetrievalError::NotReady {
            completed: 89,
            total: 100
        })
    ));
}

#[tokio::test]
async fn test_retrieve_refreshes_status_first() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 2);
    h.backend.plan_job(0, JobPlan::with_statuses(&["completed"]));
    let runner = h.default_runner();

    let id = runner.submit(&h.input()).await.unwrap().group.group_id;
    let retrieved = runner.retrieve(&id).await.unwrap();

    assert_eq!(retrieved.report.retrieved, 2);
    assert!(!retrieved.report.partial);
    let stored = h.store.get(&id).unwrap().unwrap();
    assert_eq!(stored.chunks[0].handle.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_status_survives_a_new_runner() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 4);
    let id = h.default_runner().submit(&h.input()).await.unwrap().group.group_id;

    // Same store and backend, fresh runner: the record is all it needs.
    let runner = h.default_runner();
    runner.status(&id).await.unwrap();
    let progress = runner.status(&id).await.unwrap();
    assert!(progress.all_completed());

    assert!(matches!(
        runner.status("group_unknown").await,
        Err(BatchError::GroupNotFound { .. })
    ));
}

#[tokio::test]
async fn test_file_store_lists_submitted_groups() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 2);
    let config = h.config().build().unwrap();
    let store = Arc::new(FileJobStore::new(config.job_temp_dir()));
    let runner = BatchRunner::new(h.backend.clone(), store, config.clone());

    let id = runner.submit(&h.input()).await.unwrap().group.group_id;

    let reopened = FileJobStore::new(config.job_temp_dir());
    let groups = edgequake_pdf2md_batch::runner::list_groups(&reopened).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].group_id, id);
    assert!(reopened.record_path(&id).exists());
}

// ── Output parsing ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_output_lines_are_skipped() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 2);
    let good = |id: &str| {
        serde_json::json!({
            "custom_id": id,
            "response": { "status_code": 200, "body": {
                "choices": [{ "message": { "content": format!("text of {id}") } }],
                "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
            }}
        })
        .to_string()
    };
    let raw = format!(
        "{}\n{{not json\n{}\n",
        good("alpha_page_0002"),
        good("alpha_page_0001")
    );
    h.backend.plan_job(0, JobPlan::default().output(raw));
    let runner = h.default_runner();

    let out = runner.run(&h.input(), &not_cancelled()).await.unwrap();
    let report = &out.retrieved.report;
    assert_eq!(report.malformed_lines, 1);
    assert_eq!(report.retrieved, 2);
    assert_eq!(report.documents["alpha"].pages[&1], "text of alpha_page_0001");
}

// ── Cost ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cost_uses_configured_rates() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 10);
    h.backend
        .plan_job(0, JobPlan::default().usage(TokenUsage::new(1_000, 500)));
    let config = h
        .config()
        .rates(CostRates::per_million(2.0, 8.0))
        .build()
        .unwrap();
    let runner = h.runner(config);

    let out = runner.run(&h.input(), &not_cancelled()).await.unwrap();

    // 10 × (1000 × 2e-6 + 500 × 8e-6) = 0.06
    let total = &out.retrieved.usage.total;
    assert!((total.total_cost - 0.06).abs() < 1e-9);
    assert!((total.estimated_regular_cost - 0.12).abs() < 1e-9);
    assert!((total.avg_cost_per_unit - 0.006).abs() < 1e-9);

    let md = std::fs::read_to_string(runner.config().output_dir.join("alpha_batch.md")).unwrap();
    assert!(md.contains("- **Total Processing Cost:** $0.0600"));
    assert!(md.contains("- **Total Tokens Used:** 15,000"));
}

// ── Cleanup ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cleanup_is_idempotent_and_keeps_inputs() {
    let h = Harness::new();
    let config = h.config().build().unwrap();
    // Input inside the job temp dir: only protection keeps it alive.
    let input = config.job_temp_dir().join("input");
    write_document(&input, "alpha", 3);
    let runner = h.runner(config.clone());

    let out = runner.run(&input, &not_cancelled()).await.unwrap();
    assert!(input.join("alpha/page_0001.png").exists());
    assert!(out.cleanup.skipped_count() >= 1);

    let protected = h.runner(h.config().protect(&input).build().unwrap());
    let first = protected.cleanup(CleanupScope::Workspace).unwrap();
    assert!(first.removed_count() >= 1, "usage report should be removed");
    let second = protected.cleanup(CleanupScope::Workspace).unwrap();
    assert_eq!(second.removed_count(), 0);
    assert!(input.join("alpha/page_0003.png").exists());
}

#[tokio::test]
async fn test_cleanup_never_touches_session_directories() {
    let h = Harness::new();
    let config = h.config().build().unwrap();
    let session = config.job_temp_dir().join("session_20250716_101500");
    write_document(&session, "alpha", 1);
    std::fs::write(config.job_temp_dir().join("batch_requests_x_000.jsonl"), "{}").unwrap();

    let report = h.runner(config.clone()).cleanup(CleanupScope::All).unwrap();

    assert!(session.join("alpha/page_0001.png").exists());
    assert!(!config.job_temp_dir().join("batch_requests_x_000.jsonl").exists());
    assert_eq!(report.removed_count(), 1);
}

#[tokio::test]
async fn test_active_group_working_dirs_survive_cleanup() {
    let h = Harness::new();
    let config = h.config().build().unwrap();
    let pages = config.job_temp_dir().join("pages");
    write_document(&pages, "alpha", 2);
    h.backend.plan_job(0, JobPlan::stuck(0));
    let runner = h.runner(config.clone());

    let id = runner.submit(&pages).await.unwrap().group.group_id;
    runner.cleanup(CleanupScope::All).unwrap();
    assert!(pages.join("alpha/page_0002.png").exists());

    let kept = runner.remove_group(&id).unwrap();
    assert_eq!(kept.removed_count(), 0);
    assert!(h.store.get(&id).unwrap().is_some());
}

#[tokio::test]
async fn test_cleanup_keeps_records_until_retrieved() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 2);
    let config = h.config().build().unwrap();
    let store = Arc::new(FileJobStore::new(config.job_temp_dir()));
    let runner = BatchRunner::new(h.backend.clone(), store.clone(), config);

    let id = runner.submit(&h.input()).await.unwrap().group.group_id;
    runner.status(&id).await.unwrap();
    assert!(runner.status(&id).await.unwrap().all_completed());

    let early = runner.cleanup(CleanupScope::JobTempFiles).unwrap();
    assert_eq!(early.removed_count(), 0);
    assert!(store.record_path(&id).exists());

    let retrieved = runner.retrieve(&id).await.unwrap();
    assert_eq!(retrieved.report.retrieved, 2);

    runner.cleanup(CleanupScope::JobTempFiles).unwrap();
    assert!(!store.record_path(&id).exists());
}

#[tokio::test]
async fn test_remove_group_never_deletes_inputs() {
    let h = Harness::new();
    write_document(&h.input(), "alpha", 3);
    let runner = h.default_runner();

    let id = runner.submit(&h.input()).await.unwrap().group.group_id;
    runner.monitor(&id, &not_cancelled()).await.unwrap();
    runner.retrieve(&id).await.unwrap();

    // A later process knows nothing about the input directory.
    let later = h.default_runner();
    let report = later.remove_group(&id).unwrap();

    assert!(h.input().join("alpha/page_0001.png").exists());
    assert!(h.store.get(&id).unwrap().is_none());
    assert_eq!(report.removed_count(), 1);
}
