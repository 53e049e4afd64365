//! Transfer coordinator integration tests
//!
//! Drives the real coordinator, HTTP service client and file-backed
//! session store against a mocked remote upload service.

use mizuchi_transfr::config::{RetryConfig, TransferConfig};
use mizuchi_transfr::service::HttpUploadService;
use mizuchi_transfr::session::{CompletedPart, FileMeta, UploadSession};
use mizuchi_transfr::store::SessionStore;
use mizuchi_transfr::transfer::{CancelMode, TransferCoordinator, TransferError, TransferState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transfer_config(chunk_size: u64, concurrent_parts: usize) -> TransferConfig {
    TransferConfig {
        chunk_size,
        concurrent_parts,
        max_file_size: 1024 * 1024,
        retry: RetryConfig {
            max_attempts: 2,
            backoff_ms: 10,
        },
    }
}

fn coordinator(
    server: &MockServer,
    store_dir: &Path,
    config: TransferConfig,
) -> TransferCoordinator {
    let service = HttpUploadService::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let store = SessionStore::open(store_dir).unwrap();
    TransferCoordinator::new(Arc::new(service), store, config)
}

fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

async fn mount_initiate(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/uploads/initiate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "upload_id": "u-1",
            "video_id": "v-1",
            "key": "uploads/v-1/file"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

/// Mount the URL mint and the blob PUT for one part. `expected_puts`
/// bounds how many times the part may be transmitted.
async fn mount_part(server: &MockServer, part_number: u32, expected_puts: u64) {
    mount_part_with_delay(server, part_number, expected_puts, Duration::ZERO).await;
}

async fn mount_part_with_delay(
    server: &MockServer,
    part_number: u32,
    expected_puts: impl Into<wiremock::Times>,
    delay: Duration,
) {
    Mock::given(method("POST"))
        .and(path("/uploads/presigned-url"))
        .and(body_partial_json(
            serde_json::json!({"part_number": part_number}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "url": format!("{}/blob/{}", server.uri(), part_number)
        })))
        .mount(server)
        .await;

    Mock::given(method("PUT"))
        .and(path(format!("/blob/{part_number}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", format!("\"e{part_number}\"").as_str())
                .set_delay(delay),
        )
        .expect(expected_puts)
        .mount(server)
        .await;
}

async fn mount_complete(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/uploads/complete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "success",
            "video_id": "v-1"
        })))
        .mount(server)
        .await;
}

fn persisted_session(file: &Path, chunk_size: u64, completed: &[(u32, &str)]) -> UploadSession {
    let meta = FileMeta::from_path(file).unwrap();
    UploadSession {
        fingerprint: meta.fingerprint(),
        session_id: "u-1".into(),
        asset_id: "v-1".into(),
        storage_key: "uploads/v-1/file".into(),
        file_name: meta.file_name.clone(),
        file_size: meta.file_size,
        chunk_size,
        total_parts: meta.file_size.div_ceil(chunk_size) as u32,
        completed_parts: completed
            .iter()
            .map(|(n, e)| CompletedPart {
                part_number: *n,
                etag: e.to_string(),
            })
            .collect(),
        last_updated: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_upload_completes_and_clears_session() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "a.mp4", 10);

    mount_initiate(&server, 1).await;
    for n in 1..=3 {
        mount_part(&server, n, 1).await;
    }
    mount_complete(&server).await;

    let coordinator = coordinator(&server, dir.path(), transfer_config(4, 3));
    let progress = coordinator.progress();

    let asset_id = coordinator.start(&file).await.unwrap();
    assert_eq!(asset_id, "v-1");

    let snapshot = *progress.borrow();
    assert_eq!(snapshot.state, TransferState::Completed);
    assert_eq!(snapshot.completed_parts, 3);
    assert_eq!(snapshot.percent(), 100.0);

    // Finalized sessions leave no record behind
    let store = SessionStore::open(dir.path()).unwrap();
    let fingerprint = FileMeta::from_path(&file).unwrap().fingerprint();
    assert!(store.get(&fingerprint).unwrap().is_none());
}

#[tokio::test]
async fn test_no_double_dispatch_under_concurrency() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "b.mp4", 24);

    mount_initiate(&server, 1).await;
    // expect(1) on every blob PUT: each part transmitted at most once
    for n in 1..=6 {
        mount_part(&server, n, 1).await;
    }
    mount_complete(&server).await;

    let coordinator = coordinator(&server, dir.path(), transfer_config(4, 3));
    coordinator.start(&file).await.unwrap();
}

#[tokio::test]
async fn test_resume_transmits_only_missing_parts_and_completes_sorted() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    // 25 bytes at chunk size 10: parts [0,10), [10,20), [20,25)
    let file = write_file(dir.path(), "c.mp4", 25);

    let store = SessionStore::open(dir.path().join("sessions")).unwrap();
    store
        .put(&persisted_session(&file, 10, &[(1, "e1"), (2, "e2")]))
        .unwrap();

    // Resume must not initiate a fresh session
    mount_initiate(&server, 0).await;
    mount_part(&server, 3, 1).await;
    Mock::given(method("POST"))
        .and(path("/uploads/complete"))
        .and(body_json(serde_json::json!({
            "video_id": "v-1",
            "upload_id": "u-1",
            "parts": [
                {"PartNumber": 1, "ETag": "e1"},
                {"PartNumber": 2, "ETag": "e2"},
                {"PartNumber": 3, "ETag": "e3"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "success",
            "video_id": "v-1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = coordinator(&server, &dir.path().join("sessions"), transfer_config(10, 3));
    let asset_id = coordinator.start(&file).await.unwrap();
    assert_eq!(asset_id, "v-1");
    let fingerprint = FileMeta::from_path(&file).unwrap().fingerprint();
    assert!(store.get(&fingerprint).unwrap().is_none());
}

#[tokio::test]
async fn test_part_failure_preserves_session_then_resume_finishes() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "d.mp4", 25);
    let fingerprint = FileMeta::from_path(&file).unwrap().fingerprint();

    mount_initiate(&server, 1).await;
    mount_part(&server, 1, 1).await;
    mount_part(&server, 2, 1).await;
    // Part 3's URL mint fails on every attempt for now
    let failing = Mock::given(method("POST"))
        .and(path("/uploads/presigned-url"))
        .and(body_partial_json(serde_json::json!({"part_number": 3})))
        .respond_with(ResponseTemplate::new(503))
        .mount_as_scoped(&server)
        .await;

    // Single worker so parts 1 and 2 are acknowledged before 3 fails
    let coordinator = coordinator(&server, dir.path(), transfer_config(10, 1));
    let err = coordinator.start(&file).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::PartTransferFailed {
            part_number: 3,
            attempts: 2,
            ..
        }
    ));
    assert!(err.is_retryable());

    let store = SessionStore::open(dir.path()).unwrap();
    let session = store.get(&fingerprint).unwrap().expect("session preserved");
    assert_eq!(session.completed_part_numbers(), vec![1, 2]);

    // Service recovers; the retried start only transmits part 3
    drop(failing);
    mount_part(&server, 3, 1).await;
    mount_complete(&server).await;

    let asset_id = coordinator.start(&file).await.unwrap();
    assert_eq!(asset_id, "v-1");
    assert!(store.get(&fingerprint).unwrap().is_none());
}

#[tokio::test]
async fn test_oversized_file_rejected_before_initiate() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "big.mp4", 64);

    mount_initiate(&server, 0).await;

    let mut config = transfer_config(16, 3);
    config.max_file_size = 32;
    let coordinator = coordinator(&server, dir.path(), config);

    let err = coordinator.start(&file).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::SizeLimitExceeded { size: 64, max: 32 }
    ));
    assert!(!err.is_retryable());

    let store = SessionStore::open(dir.path()).unwrap();
    assert!(store.list_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_etag_surfaces_as_missing_acknowledgment() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "e.mp4", 8);
    let fingerprint = FileMeta::from_path(&file).unwrap().fingerprint();

    mount_initiate(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/uploads/presigned-url"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "url": format!("{}/blob/1", server.uri())
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/blob/1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let coordinator = coordinator(&server, dir.path(), transfer_config(8, 1));
    let err = coordinator.start(&file).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::MissingAcknowledgment { part_number: 1 }
    ));

    // Session survives for a retry once the transport behaves
    let store = SessionStore::open(dir.path()).unwrap();
    assert!(store.get(&fingerprint).unwrap().is_some());
}

#[tokio::test]
async fn test_cancel_discard_removes_session_and_aborts_remotely() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "f.mp4", 20);
    let fingerprint = FileMeta::from_path(&file).unwrap().fingerprint();

    mount_initiate(&server, 1).await;
    for n in 1..=5 {
        mount_part_with_delay(&server, n, 0..=1u64, Duration::from_millis(500)).await;
    }
    Mock::given(method("DELETE"))
        .and(path("/uploads/v-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = Arc::new(coordinator(&server, dir.path(), transfer_config(4, 2)));
    let runner = coordinator.clone();
    let handle = tokio::spawn(async move { runner.start(&file).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    coordinator.cancel(CancelMode::Discard);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        TransferError::Cancelled(CancelMode::Discard)
    ));
    assert_eq!(
        coordinator.progress().borrow().state,
        TransferState::Cancelled
    );

    let store = SessionStore::open(dir.path()).unwrap();
    assert!(store.get(&fingerprint).unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_pause_preserves_session_for_resume() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "g.mp4", 20);
    let fingerprint = FileMeta::from_path(&file).unwrap().fingerprint();

    mount_initiate(&server, 1).await;
    for n in 1..=5 {
        mount_part_with_delay(&server, n, 0..=1u64, Duration::from_millis(500)).await;
    }

    let coordinator = Arc::new(coordinator(&server, dir.path(), transfer_config(4, 2)));
    let runner = coordinator.clone();
    let file_for_runner = file.clone();
    let handle = tokio::spawn(async move { runner.start(&file_for_runner).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    coordinator.cancel(CancelMode::Pause);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, TransferError::Cancelled(CancelMode::Pause)));

    // The session is still retrievable with whatever was acknowledged
    let store = SessionStore::open(dir.path()).unwrap();
    let session = store.get(&fingerprint).unwrap().expect("session preserved");
    assert_eq!(session.session_id, "u-1");
}

#[tokio::test]
async fn test_concurrent_start_for_same_file_is_single_flight() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "h.mp4", 12);

    mount_initiate(&server, 1).await;
    for n in 1..=3 {
        mount_part_with_delay(&server, n, 1, Duration::from_millis(200)).await;
    }
    mount_complete(&server).await;

    let coordinator = Arc::new(coordinator(&server, dir.path(), transfer_config(4, 3)));
    let first = {
        let coordinator = coordinator.clone();
        let file = file.clone();
        tokio::spawn(async move { coordinator.start(&file).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = coordinator.start(&file).await;

    assert!(matches!(second, Err(TransferError::SessionBusy)));
    assert_eq!(first.await.unwrap().unwrap(), "v-1");

    // Exactly one session was ever created (initiate expect(1) above)
    let store = SessionStore::open(dir.path()).unwrap();
    assert!(store.list_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_corrupt_session_is_dropped_and_fresh_one_initiated() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "i.mp4", 12);
    let fingerprint = FileMeta::from_path(&file).unwrap().fingerprint();

    let store = SessionStore::open(dir.path().join("sessions")).unwrap();
    let mut corrupt = persisted_session(&file, 4, &[(1, "e1")]);
    corrupt.total_parts = 99;
    store.put(&corrupt).unwrap();

    mount_initiate(&server, 1).await;
    for n in 1..=3 {
        mount_part(&server, n, 1).await;
    }
    mount_complete(&server).await;

    let coordinator = coordinator(&server, &dir.path().join("sessions"), transfer_config(4, 3));

    let err = coordinator.start(&file).await.unwrap_err();
    assert!(matches!(err, TransferError::CorruptSession(_)));
    assert!(err.is_retryable());
    assert!(store.get(&fingerprint).unwrap().is_none());

    // Retry begins a fresh session and uploads everything
    let asset_id = coordinator.start(&file).await.unwrap();
    assert_eq!(asset_id, "v-1");
}
