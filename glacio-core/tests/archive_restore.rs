use glacio_core::{
    ArchiveOptions, BundlingConfig, EntryFilter, EntryKind, EntryLookup, Glacio, GlacioError,
    GlacioOptions, IndexStore, IneligibleReason, MemoryIndexStore, MemoryTierClient,
    ObjectStoreTierClient, PolicyConfig, PollOutcome, RestoreOperationRequest, RestoreOptions,
    RestoreOutcome, RestoreStatus, RetryPolicy, SqliteIndexStore, StorageTier, compute_hash,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
}

fn options(staging: &Path, policy: PolicyConfig) -> GlacioOptions {
    GlacioOptions {
        policy,
        bundling: BundlingConfig::default(),
        archive: ArchiveOptions {
            retry: fast_retry(),
            staging_dir: staging.to_path_buf(),
            ..ArchiveOptions::default()
        },
        restore: RestoreOptions {
            days: 2,
            poll_initial_ms: 1,
            poll_max_ms: 4,
            timeout_secs: 5,
            retry: fast_retry(),
            ..RestoreOptions::default()
        },
    }
}

struct Fixture {
    _temp_dir: tempfile::TempDir,
    data: PathBuf,
    index: Arc<MemoryIndexStore>,
    tier: Arc<MemoryTierClient>,
    glacio: Glacio,
}

fn fixture(policy: PolicyConfig) -> Fixture {
    let temp_dir = tempfile::tempdir().unwrap();
    let data = temp_dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();

    let index = Arc::new(MemoryIndexStore::new());
    let tier = Arc::new(MemoryTierClient::cold());
    let glacio = Glacio::new(
        index.clone(),
        tier.clone(),
        options(&temp_dir.path().join("staging"), policy),
    )
    .unwrap();

    Fixture {
        _temp_dir: temp_dir,
        data,
        index,
        tier,
        glacio,
    }
}

fn origin(path: &Path) -> EntryLookup {
    EntryLookup::OriginPath(path.to_string_lossy().to_string())
}

#[tokio::test]
async fn test_cold_round_trip_returns_identical_bytes() {
    let fx = fixture(PolicyConfig::default());
    fx.tier.set_restore_polls(3);
    let file = fx.data.join("survey.bin");
    let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    std::fs::write(&file, &payload).unwrap();

    let report = fx
        .glacio
        .archive(&fx.data, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.archived_count(), 1);
    let entry = fx.index.get(&origin(&file)).unwrap();
    assert_eq!(entry.storage_tier, StorageTier::Cold);
    assert_eq!(entry.digest, compute_hash(&payload));

    std::fs::remove_file(&file).unwrap();
    let outcome = fx
        .glacio
        .restore(RestoreOperationRequest::new(origin(&file)))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RestoreOutcome::Restored {
            already_present: false,
            ..
        }
    ));
    assert_eq!(std::fs::read(&file).unwrap(), payload);

    let restored = fx.index.get(&origin(&file)).unwrap();
    assert_eq!(restored.storage_tier, StorageTier::RestoredTemp);
    assert!(restored.restore_expiry.is_some());
    assert_eq!(fx.tier.call_counts().restore_requests, 1);
}

#[tokio::test]
async fn test_bundle_round_trip_restores_every_member() {
    let fx = fixture(PolicyConfig::default());
    fx.tier.set_restore_polls(1);
    let dir = fx.data.join("notes");
    std::fs::create_dir_all(&dir).unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(dir.join(name), format!("contents of {}", name)).unwrap();
    }

    let report = fx
        .glacio
        .archive(&fx.data, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.archived_count(), 1);
    let bundle = report.archived().next().unwrap().clone();
    assert_eq!(bundle.kind, EntryKind::Bundle);

    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::remove_file(dir.join(name)).unwrap();
    }
    fx.glacio
        .restore(RestoreOperationRequest::new(origin(&dir.join("b.txt"))))
        .await
        .unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        assert_eq!(
            std::fs::read_to_string(dir.join(name)).unwrap(),
            format!("contents of {}", name)
        );
    }
}

#[tokio::test]
async fn test_second_archive_run_uploads_nothing() {
    let fx = fixture(PolicyConfig::default());
    std::fs::write(fx.data.join("one.bin"), vec![7u8; 2 * 1024 * 1024]).unwrap();
    std::fs::write(fx.data.join("two.bin"), vec![8u8; 2 * 1024 * 1024]).unwrap();

    let first = fx
        .glacio
        .archive(&fx.data, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.archived_count(), 2);
    let uploads = fx.tier.call_counts().uploads;

    let second = fx
        .glacio
        .archive(&fx.data, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.archived_count(), 0);
    assert_eq!(second.skipped_for(IneligibleReason::AlreadyArchived), 2);
    assert_eq!(fx.tier.call_counts().uploads, uploads);
}

#[tokio::test]
async fn test_small_files_are_skipped_as_too_small() {
    let fx = fixture(PolicyConfig {
        min_size_bytes: 1024,
        ..PolicyConfig::default()
    });
    std::fs::write(fx.data.join("tiny.txt"), b"tiny").unwrap();
    std::fs::write(fx.data.join("large.bin"), vec![1u8; 4096]).unwrap();

    let report = fx
        .glacio
        .archive(&fx.data, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.archived_count(), 1);
    assert_eq!(report.skipped_for(IneligibleReason::TooSmall), 1);
    assert!(
        !fx.index
            .is_path_archived(&fx.data.join("tiny.txt").to_string_lossy())
            .unwrap()
    );
}

#[tokio::test]
async fn test_concurrent_restore_requests_share_one_provider_call() {
    let fx = fixture(PolicyConfig::default());
    fx.tier.set_never_ready(true);
    let file = fx.data.join("shared.bin");
    std::fs::write(&file, vec![3u8; 2 * 1024 * 1024]).unwrap();
    fx.glacio
        .archive(&fx.data, CancellationToken::new())
        .await
        .unwrap();
    std::fs::remove_file(&file).unwrap();

    let mut request = RestoreOperationRequest::new(origin(&file));
    request.wait = false;
    let (a, b) = tokio::join!(
        fx.glacio.restore(request.clone()),
        fx.glacio.restore(request)
    );
    let (RestoreOutcome::Requested(a), RestoreOutcome::Requested(b)) = (a.unwrap(), b.unwrap())
    else {
        panic!("expected both restores to be pending");
    };
    assert_eq!(a.request_id, b.request_id);
    assert_eq!(fx.tier.call_counts().restore_requests, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_waiting_restores_download_once() {
    let temp_dir = tempfile::tempdir().unwrap();
    let data = temp_dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    let index = Arc::new(SqliteIndexStore::open(temp_dir.path().join("glacio.db")).unwrap());
    let tier = Arc::new(MemoryTierClient::cold());
    tier.set_restore_polls(2);
    let glacio = Glacio::new(
        index.clone(),
        tier.clone(),
        options(&temp_dir.path().join("staging"), PolicyConfig::default()),
    )
    .unwrap();

    let file = data.join("shared.bin");
    let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 241) as u8).collect();
    std::fs::write(&file, &payload).unwrap();
    glacio.archive(&data, CancellationToken::new()).await.unwrap();
    std::fs::remove_file(&file).unwrap();

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let glacio = glacio.clone();
            let request = RestoreOperationRequest::new(origin(&file));
            tokio::spawn(async move { glacio.restore(request).await })
        })
        .collect();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, RestoreOutcome::Restored { .. }));
    }

    assert_eq!(std::fs::read(&file).unwrap(), payload);
    let counts = tier.call_counts();
    assert_eq!(counts.restore_requests, 1);
    assert_eq!(counts.downloads, 1);
    assert_eq!(index.list_restores(&[RestoreStatus::Completed]).unwrap().len(), 1);
    let leftovers = std::fs::read_dir(&data)
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".glacio-partial"))
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_corrupted_download_leaves_no_file() {
    let fx = fixture(PolicyConfig::default());
    let file = fx.data.join("fragile.bin");
    std::fs::write(&file, vec![5u8; 2 * 1024 * 1024]).unwrap();
    fx.glacio
        .archive(&fx.data, CancellationToken::new())
        .await
        .unwrap();
    std::fs::remove_file(&file).unwrap();

    fx.tier.set_corrupt_downloads(true);
    let err = fx
        .glacio
        .restore(RestoreOperationRequest::new(origin(&file)))
        .await
        .unwrap_err();
    assert!(matches!(err, GlacioError::Integrity { .. }));
    assert!(!file.exists());

    let failed = fx
        .glacio
        .list_entries(EntryFilter {
            integrity_failed_only: true,
            ..EntryFilter::default()
        })
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(fx.glacio.report_status().unwrap().integrity_failures, 1);
}

#[tokio::test]
async fn test_expired_wait_resolves_on_later_poll() {
    let temp_dir = tempfile::tempdir().unwrap();
    let data = temp_dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    let index = Arc::new(MemoryIndexStore::new());
    let tier = Arc::new(MemoryTierClient::cold());
    let mut opts = options(&temp_dir.path().join("staging"), PolicyConfig::default());
    opts.restore.timeout_secs = 0;
    let glacio = Glacio::new(index.clone(), tier.clone(), opts).unwrap();

    let file = data.join("slow.bin");
    std::fs::write(&file, vec![9u8; 2 * 1024 * 1024]).unwrap();
    glacio.archive(&data, CancellationToken::new()).await.unwrap();
    std::fs::remove_file(&file).unwrap();

    tier.set_restore_polls(0);
    tier.set_never_ready(true);
    let outcome = glacio
        .restore(RestoreOperationRequest::new(origin(&file)))
        .await
        .unwrap();
    assert!(matches!(outcome, RestoreOutcome::Expired(_)));
    assert_eq!(
        index.list_restores(&[RestoreStatus::Expired]).unwrap().len(),
        1
    );

    tier.set_never_ready(false);
    let polled = glacio.poll(&origin(&file), true).await.unwrap();
    assert!(matches!(polled, PollOutcome::Restored(_)));
    assert_eq!(std::fs::read(&file).unwrap(), vec![9u8; 2 * 1024 * 1024]);
    assert!(index.list_restores(&RestoreStatus::ACTIVE).unwrap().is_empty());
}

#[tokio::test]
async fn test_free_local_then_restore_from_standard_object_store() {
    let temp_dir = tempfile::tempdir().unwrap();
    let data = temp_dir.path().join("data");
    let remote = temp_dir.path().join("remote");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::create_dir_all(&remote).unwrap();

    let index = Arc::new(SqliteIndexStore::open(temp_dir.path().join("glacio.db")).unwrap());
    let tier = Arc::new(ObjectStoreTierClient::local(&remote, "STANDARD").unwrap());
    let glacio = Glacio::new(
        index,
        tier,
        options(&temp_dir.path().join("staging"), PolicyConfig::default()),
    )
    .unwrap();

    let file = data.join("report.pdf");
    let payload = vec![42u8; 1536 * 1024];
    std::fs::write(&file, &payload).unwrap();
    let report = glacio.archive(&data, CancellationToken::new()).await.unwrap();
    assert_eq!(report.archived_count(), 1);

    let freed = glacio.free_local(vec![file.clone()], true).await.unwrap();
    assert_eq!(freed.refused_count(), 0);
    assert_eq!(freed.freed_bytes(), payload.len() as u64);
    assert!(!file.exists());

    glacio
        .restore(RestoreOperationRequest::new(origin(&file)))
        .await
        .unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), payload);

    let mut exported = Vec::new();
    assert_eq!(
        glacio.export(EntryFilter::default(), &mut exported).unwrap(),
        1
    );
    let line: serde_json::Value = serde_json::from_slice(exported.trim_ascii_end()).unwrap();
    assert_eq!(line["origin_path"], file.to_string_lossy().as_ref());
}
