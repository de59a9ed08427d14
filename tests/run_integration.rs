//! Integration tests for full runs against a mock platform.

mod support;

use std::sync::Arc;
use std::time::Duration;

use caseharvest_core::storage::content_hash;
use caseharvest_core::{
    CaseStatus, Deduplicator, DocumentStore, Ledger, ManifestLedger, RunHalt, RunSummary,
};
use support::{MockPlatform, Workspace, case_id, filters, pdf_bytes, results_page};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

// ==================== Full Run Tests ====================

#[tokio::test]
async fn test_run_once_skips_ledger_hits_and_records_outcomes() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["A", "B"], Some(2)))
        .await;
    platform
        .mount_results(Some(2), results_page(&["C"], Some(3)))
        .await;
    platform
        .mount_results(Some(3), results_page(&[], Some(4)))
        .await;
    platform.mount_case("A", true, 0).await;
    platform.mount_case("B", true, 1).await;
    platform.mount_case("C", false, 1).await;
    platform.mount_document("A", 0).await;
    platform.mount_document("B", 1).await;

    let workspace = Workspace::new().await;
    workspace.ledger.commit(&case_id("A")).await.unwrap();

    let mut coordinator = workspace.coordinator(&platform, 1);
    let report = coordinator.run_once(&filters()).await.unwrap();

    assert!(report.is_complete(), "{:?}", report.halted);
    assert_eq!(
        report.summary,
        RunSummary {
            scanned: 3,
            skipped_duplicate: 1,
            downloaded: 1,
            not_found: 1,
            failed: 0,
            pages: 3,
            ..RunSummary::default()
        }
    );

    let processed = workspace.ledger.load().await.unwrap();
    let mut processed: Vec<_> = processed.into_iter().collect();
    processed.sort();
    assert_eq!(processed, vec![case_id("A"), case_id("B")]);

    let c = workspace.cases().get(&case_id("C")).await.unwrap().unwrap();
    assert_eq!(c.status, CaseStatus::NotFound);
    assert_eq!(c.attempt_count, 1);
    assert!(c.record.document_url.is_none());
}

#[tokio::test]
async fn test_run_once_second_run_downloads_nothing() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["A", "B"], None))
        .await;
    platform.mount_case("A", true, 1).await;
    platform.mount_case("B", true, 1).await;
    platform.mount_document("A", 1).await;
    platform.mount_document("B", 1).await;

    let workspace = Workspace::new().await;
    let first = workspace
        .coordinator(&platform, 1)
        .run_once(&filters())
        .await
        .unwrap();
    assert_eq!(first.summary.downloaded, 2);

    let second = workspace
        .coordinator(&platform, 1)
        .run_once(&filters())
        .await
        .unwrap();
    assert_eq!(second.summary.downloaded, 0);
    assert_eq!(second.summary.scanned, 2);
    assert_eq!(second.summary.skipped_duplicate, second.summary.scanned);
}

#[tokio::test]
async fn test_run_once_stored_document_matches_recorded_hash() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["B"], None))
        .await;
    platform.mount_case("B", true, 1).await;
    platform.mount_document("B", 1).await;

    let workspace = Workspace::new().await;
    let report = workspace
        .coordinator(&platform, 1)
        .run_once(&filters())
        .await
        .unwrap();
    assert_eq!(report.summary.downloaded, 1);

    let stored = workspace.cases().get(&case_id("B")).await.unwrap().unwrap();
    assert_eq!(stored.status, CaseStatus::Downloaded);
    let key = stored.storage_key.unwrap();
    assert_eq!(key, "complaints/CA_Superior_B/CA_Superior_B_complaint.pdf");
    assert_eq!(stored.record.document_url.as_deref(), Some(key.as_str()));

    let bytes = workspace.store.get(&key).await.unwrap().unwrap();
    assert_eq!(bytes, pdf_bytes("B"));
    assert_eq!(stored.content_hash.unwrap(), content_hash(&bytes));
}

// ==================== Stage Split Tests ====================

#[tokio::test]
async fn test_collect_then_download_pending() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["A", "B"], None))
        .await;
    platform.mount_case("A", true, 1).await;
    platform.mount_case("B", true, 1).await;
    platform.mount_document("A", 1).await;
    platform.mount_document("B", 1).await;

    let workspace = Workspace::new().await;
    let snapshots = workspace.dir.path().join("snapshots");
    let mut coordinator = workspace
        .coordinator(&platform, 1)
        .with_snapshot_dir(Some(snapshots.clone()));

    let collected = coordinator.collect(&filters()).await.unwrap();
    assert_eq!(collected.summary.scanned, 2);
    assert_eq!(collected.summary.downloaded, 0);
    assert_eq!(platform.hits("/docs/").await, 0);
    assert_eq!(platform.hits("/cases/").await, 0);
    assert!(snapshots.join("filtered_results_03_09_2026.json").exists());

    let pending = workspace.cases().pending(None, 5).await.unwrap();
    assert_eq!(pending.len(), 2);

    let downloaded = coordinator.download_pending(None).await.unwrap();
    assert!(downloaded.is_complete());
    assert_eq!(downloaded.summary.scanned, 2);
    assert_eq!(downloaded.summary.downloaded, 2);
    assert!(workspace.cases().pending(None, 5).await.unwrap().is_empty());
    assert!(workspace.ledger.contains(&case_id("B")).await.unwrap());
}

#[tokio::test]
async fn test_download_pending_respects_limit() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["A", "B", "C"], None))
        .await;
    for docket in ["A", "B", "C"] {
        platform.mount_case(docket, true, 0..=1).await;
        platform.mount_document(docket, 0..=1).await;
    }

    let workspace = Workspace::new().await;
    let mut coordinator = workspace.coordinator(&platform, 0);
    coordinator.collect(&filters()).await.unwrap();

    let report = coordinator.download_pending(Some(2)).await.unwrap();
    assert_eq!(report.summary.downloaded, 2);
    assert_eq!(workspace.cases().pending(None, 5).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_download_pending_ledger_hits_do_not_block_queue() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["A", "B", "C"], None))
        .await;
    platform.mount_case("A", true, 0).await;
    platform.mount_case("B", true, 0).await;
    platform.mount_case("C", true, 1).await;
    platform.mount_document("C", 1).await;

    let workspace = Workspace::new().await;
    let mut coordinator = workspace.coordinator(&platform, 0);
    coordinator.collect(&filters()).await.unwrap();

    // Committed by another host sharing the ledger.
    workspace.ledger.commit(&case_id("A")).await.unwrap();
    workspace.ledger.commit(&case_id("B")).await.unwrap();

    let first = coordinator.download_pending(Some(2)).await.unwrap();
    assert_eq!(first.summary.skipped_duplicate, 2);
    let second = coordinator.download_pending(Some(2)).await.unwrap();

    assert_eq!(first.summary.downloaded + second.summary.downloaded, 1);
    assert!(workspace.ledger.contains(&case_id("C")).await.unwrap());
    assert!(workspace.cases().pending(None, 5).await.unwrap().is_empty());
    let a = workspace.cases().get(&case_id("A")).await.unwrap().unwrap();
    assert_eq!(a.status, CaseStatus::Downloaded);
}

// ==================== Failure Handling Tests ====================

#[tokio::test]
async fn test_run_once_reacquires_once_when_session_expires_mid_walk() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["A", "B"], Some(2)))
        .await;
    Mock::given(method("GET"))
        .and(path(support::SEARCH_PATH))
        .and(query_param("page", "2"))
        .respond_with(support::html(support::LOGIN_HTML))
        .up_to_n_times(1)
        .mount(&platform.server)
        .await;
    platform
        .mount_results(Some(2), results_page(&["C"], None))
        .await;
    for docket in ["A", "B", "C"] {
        platform.mount_case(docket, true, 1).await;
        platform.mount_document(docket, 1).await;
    }

    let workspace = Workspace::new().await;
    let mut coordinator = workspace.coordinator(&platform, 1);
    let report = coordinator.run_once(&filters()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.summary.scanned, 3);
    assert_eq!(report.summary.downloaded, 3);
    assert_eq!(coordinator.session().reacquire_count(), 1);
}

#[tokio::test]
async fn test_run_once_walk_error_keeps_collected_rows_and_skips_downloads() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["A", "B"], Some(2)))
        .await;
    Mock::given(method("GET"))
        .and(path(support::SEARCH_PATH))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&platform.server)
        .await;

    let workspace = Workspace::new().await;
    let report = workspace
        .coordinator(&platform, 1)
        .run_once(&filters())
        .await
        .unwrap();

    assert!(matches!(report.halted, Some(RunHalt::Walk { .. })));
    assert_eq!(report.summary.scanned, 2);
    assert_eq!(report.summary.downloaded, 0);
    assert_eq!(platform.hits("/docs/").await, 0);
    assert_eq!(workspace.cases().pending(None, 5).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failing_case_is_left_alone_after_max_attempts() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["A"], None))
        .await;
    platform.mount_case("A", true, 0..).await;
    platform.mount_document_status("A", 500).await;

    let workspace = Workspace::new().await;
    for _ in 0..2 {
        let report = workspace
            .coordinator(&platform, 0)
            .with_max_attempts(2)
            .run_once(&filters())
            .await
            .unwrap();
        assert_eq!(report.summary.failed, 1);
    }

    let report = workspace
        .coordinator(&platform, 0)
        .with_max_attempts(2)
        .run_once(&filters())
        .await
        .unwrap();
    assert_eq!(report.summary.failed, 0);
    assert_eq!(report.summary.skipped_exhausted, 1);

    let stored = workspace.cases().get(&case_id("A")).await.unwrap().unwrap();
    assert_eq!(stored.status, CaseStatus::Failed);
    assert_eq!(stored.attempt_count, 2);
    assert!(stored.last_error.unwrap().contains("500"));
    assert!(!workspace.ledger.contains(&case_id("A")).await.unwrap());
}

#[tokio::test]
async fn test_run_deadline_stops_before_first_download() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["A"], None))
        .await;
    platform.mount_case("A", true, 0).await;

    let workspace = Workspace::new().await;
    let report = workspace
        .coordinator(&platform, 0)
        .with_run_timeout(Some(Duration::ZERO))
        .run_once(&filters())
        .await
        .unwrap();

    assert_eq!(report.halted, Some(RunHalt::Deadline));
    assert_eq!(report.summary.scanned, 1);
    assert_eq!(report.summary.downloaded, 0);
}

// ==================== Ledger Backend Tests ====================

#[tokio::test]
async fn test_manifest_ledger_backend_records_downloads() {
    let platform = MockPlatform::start().await;
    platform
        .mount_results(None, results_page(&["B", "A"], None))
        .await;
    platform.mount_case("A", true, 1).await;
    platform.mount_case("B", true, 1).await;
    platform.mount_document("A", 1).await;
    platform.mount_document("B", 1).await;

    let mut workspace = Workspace::new().await;
    let state = DocumentStore::in_memory();
    workspace.ledger = Arc::new(ManifestLedger::new(state.clone(), "state/processed.txt"));

    let report = workspace
        .coordinator(&platform, 0)
        .run_once(&filters())
        .await
        .unwrap();
    assert_eq!(report.summary.downloaded, 2);

    let manifest = state.get("state/processed.txt").await.unwrap().unwrap();
    let manifest = String::from_utf8(manifest).unwrap();
    assert_eq!(
        manifest.lines().collect::<Vec<_>>(),
        vec![case_id("A"), case_id("B")]
    );

    let dedup = Deduplicator::load(Arc::clone(&workspace.ledger)).await.unwrap();
    assert!(dedup.is_processed(&case_id("A")));
}
