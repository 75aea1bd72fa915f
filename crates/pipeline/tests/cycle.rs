//! End-to-end cycles over the in-memory endpoint and metadata service.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mydata_metadata::MemoryMetadata;
use mydata_model::{RecordStatus, StatusEvent, UploadStatus, VerificationStatus};
use mydata_pipeline::{Coordinator, FolderStructure, PipelineConfig, PipelineError, ScanOptions};
use mydata_transfer::{
    CancelFlag, ChunkPlan, MemoryEndpoint, ProgressFn, TransferFuture, TransferProtocol, UploadJob,
    UploadOutcome, Uploader, checksum_bytes,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

const MIB: u64 = 1024 * 1024;
const REMOTE_ROOT: &str = "/srv/mydata";

/// Counts protocol invocations before delegating. When `rewrite` is set,
/// the local file gets those contents first, as if it changed after the
/// scan.
struct CountingProtocol {
    inner: Uploader<MemoryEndpoint>,
    calls: AtomicUsize,
    rewrite: Mutex<Option<Vec<u8>>>,
}

impl TransferProtocol for CountingProtocol {
    fn upload<'a>(
        &'a self,
        job: &'a UploadJob,
        cancel: &'a CancelFlag,
        progress: ProgressFn<'a>,
    ) -> TransferFuture<'a, UploadOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(data) = self.rewrite.lock().unwrap().take() {
            std::fs::write(&job.local_path, data).unwrap();
        }
        self.inner.upload(job, cancel, progress)
    }
}

struct Harness {
    data: TempDir,
    endpoint: Arc<MemoryEndpoint>,
    metadata: Arc<MemoryMetadata>,
    protocol: Arc<CountingProtocol>,
    coordinator: Arc<Coordinator>,
    events: UnboundedReceiver<StatusEvent>,
}

fn harness(endpoint: MemoryEndpoint, metadata: MemoryMetadata, config: PipelineConfig) -> Harness {
    let endpoint = Arc::new(endpoint);
    let metadata = Arc::new(metadata);
    let protocol = Arc::new(CountingProtocol {
        inner: Uploader::new(Arc::clone(&endpoint)).with_scratch_dir("/srv/tmp"),
        calls: AtomicUsize::new(0),
        rewrite: Mutex::new(None),
    });
    let coordinator = Arc::new(Coordinator::new(
        metadata.clone(),
        protocol.clone(),
        PipelineConfig {
            remote_root: REMOTE_ROOT.into(),
            scan: ScanOptions {
                structure: FolderStructure::UsernameDataset,
                ..ScanOptions::default()
            },
            ..config
        },
    ));
    let events = coordinator.take_events().unwrap();
    Harness {
        data: TempDir::new().unwrap(),
        endpoint,
        metadata,
        protocol,
        coordinator,
        events,
    }
}

fn pattern(size: u64) -> Vec<u8> {
    (0..size).map(|i| (i * 7 % 253) as u8).collect()
}

fn write_file(root: &Path, rel: &str, data: &[u8]) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, data).unwrap();
    path
}

fn drain(events: &mut UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn count_status(events: &[StatusEvent], status: RecordStatus) -> usize {
    events.iter().filter(|e| e.status == status).count()
}

#[tokio::test]
async fn present_files_are_verified_without_upload() {
    let mut h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    write_file(h.data.path(), "alice/ds1/a.tif", b"aaaa");
    write_file(h.data.path(), "alice/ds1/raw/b.tif", b"bbbb");
    h.metadata.insert("alice/ds1", "", "a.tif", 4);
    h.metadata.insert("alice/ds1", "raw", "b.tif", 4);

    let summary = h.coordinator.start_cycle(h.data.path()).await.unwrap();

    assert_eq!(summary.scanned, 2);
    assert_eq!(summary.verified, 2);
    assert_eq!(summary.uploaded, 0);
    assert_eq!(h.protocol.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.endpoint.stats().commands, 0);

    let events = drain(&mut h.events);
    assert_eq!(
        count_status(
            &events,
            RecordStatus::Verification(VerificationStatus::Verified)
        ),
        2
    );
    assert!(events.iter().all(|e| e.status.kind() == mydata_model::RecordKind::Verification));
}

#[tokio::test]
async fn missing_file_is_uploaded_and_registered() {
    let mut h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    let data = pattern(200_000);
    write_file(h.data.path(), "alice/ds1/raw/new.bin", &data);

    let summary = h.coordinator.start_cycle(h.data.path()).await.unwrap();

    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.bytes_uploaded, 200_000);
    assert_eq!(
        h.endpoint.file("/srv/mydata/alice/ds1/raw/new.bin").unwrap(),
        data
    );

    let created = h.metadata.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].container, "alice/ds1");
    assert_eq!(created[0].directory, "raw");
    assert_eq!(created[0].sha256sum, checksum_bytes(&data));

    let events = drain(&mut h.events);
    let progress: Vec<_> = events.iter().filter_map(|e| e.progress.clone()).collect();
    assert!(!progress.is_empty());
    assert_eq!(progress.last().unwrap().percent, 100);
    assert_eq!(
        count_status(&events, RecordStatus::Upload(UploadStatus::Completed)),
        1
    );

    // The next cycle finds the record and sends nothing.
    let before = h.endpoint.stats();
    let again = h.coordinator.start_cycle(h.data.path()).await.unwrap();
    assert_eq!(again.verified, 1);
    assert_eq!(again.uploaded, 0);
    assert_eq!(h.endpoint.stats(), before);
}

#[tokio::test]
async fn fifty_mib_file_is_sent_in_fifty_chunks() {
    let h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    let size = 50 * MIB;
    let data = pattern(size);
    write_file(h.data.path(), "alice/big/run.raw", &data);

    let plan = ChunkPlan::for_file(size);
    assert_eq!(plan.chunk_size, MIB);
    assert_eq!(plan.chunk_count(size), 50);

    let summary = h.coordinator.start_cycle(h.data.path()).await.unwrap();
    assert_eq!(summary.uploaded, 1);

    let stats = h.endpoint.stats();
    assert_eq!(stats.copies, 50);
    assert_eq!(stats.appends, 50);
    assert_eq!(stats.bytes_received, size);
    assert_eq!(h.endpoint.file("/srv/mydata/alice/big/run.raw").unwrap(), data);
    assert_eq!(h.endpoint.paths().len(), 1);
}

#[tokio::test]
async fn partial_remote_file_is_resumed() {
    let h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    let size = 12 * MIB;
    let data = pattern(size);
    write_file(h.data.path(), "alice/ds/file.bin", &data);
    let present = 4 * ChunkPlan::for_file(size).chunk_size;
    h.endpoint.put_file(
        "/srv/mydata/alice/ds/file.bin",
        data[..present as usize].to_vec(),
    );

    let summary = h.coordinator.start_cycle(h.data.path()).await.unwrap();

    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.bytes_uploaded, size - present);
    assert_eq!(h.endpoint.stats().bytes_received, size - present);
    assert_eq!(h.endpoint.file("/srv/mydata/alice/ds/file.bin").unwrap(), data);
}

#[tokio::test]
async fn zero_byte_file_fails_without_transfer() {
    let mut h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    write_file(h.data.path(), "alice/ds/empty.dat", b"");

    let summary = h.coordinator.start_cycle(h.data.path()).await.unwrap();

    assert_eq!(summary.upload_failures, 1);
    assert_eq!(h.protocol.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.endpoint.stats().commands, 0);
    assert!(h.metadata.created().is_empty());

    let events = drain(&mut h.events);
    let failed = events
        .iter()
        .find(|e| e.status == RecordStatus::Upload(UploadStatus::Failed))
        .unwrap();
    assert!(failed.message.as_deref().unwrap().contains("empty"));
}

#[tokio::test]
async fn file_grown_after_scan_is_registered_with_sent_size() {
    let h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    write_file(h.data.path(), "alice/ds/grows.bin", &pattern(5000));
    let grown = pattern(6000);
    *h.protocol.rewrite.lock().unwrap() = Some(grown.clone());

    let summary = h.coordinator.start_cycle(h.data.path()).await.unwrap();

    assert_eq!(summary.uploaded, 1);
    assert_eq!(
        h.endpoint.file("/srv/mydata/alice/ds/grows.bin").unwrap(),
        grown
    );
    let created = h.metadata.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].size, 6000);
    assert_eq!(created[0].sha256sum, checksum_bytes(&grown));
}

#[tokio::test]
async fn file_emptied_after_scan_is_not_registered() {
    let mut h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    write_file(h.data.path(), "alice/ds/gone.bin", b"abcdef");
    *h.protocol.rewrite.lock().unwrap() = Some(Vec::new());

    let summary = h.coordinator.start_cycle(h.data.path()).await.unwrap();

    assert_eq!(summary.upload_failures, 1);
    assert_eq!(summary.uploaded, 0);
    assert_eq!(h.endpoint.stats().streams_opened, 0);
    assert!(h.endpoint.file("/srv/mydata/alice/ds/gone.bin").is_none());
    assert!(h.metadata.created().is_empty());

    let events = drain(&mut h.events);
    let failed = events
        .iter()
        .find(|e| e.status == RecordStatus::Upload(UploadStatus::Failed))
        .unwrap();
    assert!(failed.message.as_deref().unwrap().contains("empty"));
}

#[tokio::test]
async fn failed_lookup_is_reported_and_not_uploaded() {
    let h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    write_file(h.data.path(), "alice/ds/a.bin", b"abc");
    h.metadata.fail_lookups(true);

    let summary = h.coordinator.start_cycle(h.data.path()).await.unwrap();

    assert_eq!(summary.lookup_failures, 1);
    assert_eq!(summary.uploaded, 0);
    assert_eq!(h.protocol.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refused_connection_fails_only_that_record() {
    let mut h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    write_file(h.data.path(), "alice/ds/a.bin", b"abc");
    write_file(h.data.path(), "alice/ds/b.bin", b"def");
    h.endpoint.refuse_connections(true);

    let summary = h.coordinator.start_cycle(h.data.path()).await.unwrap();

    assert_eq!(summary.upload_failures, 2);
    let events = drain(&mut h.events);
    let failed: Vec<_> = events
        .iter()
        .filter(|e| e.status == RecordStatus::Upload(UploadStatus::Failed))
        .collect();
    assert_eq!(failed.len(), 2);
    assert!(failed[0].message.as_deref().unwrap().contains("firewall"));
}

#[tokio::test]
async fn missing_root_fails_before_any_work() {
    let h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    let err = h
        .coordinator
        .start_cycle(&h.data.path().join("nope"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::RootMissing(_)));
    assert_eq!(h.metadata.lookup_count(), 0);
    assert_eq!(h.coordinator.active_workers(), 0);
    assert!(!h.coordinator.is_running());
}

#[tokio::test]
async fn second_cycle_is_rejected_while_one_runs() {
    let h = harness(
        MemoryEndpoint::new().with_latency(Duration::from_millis(50)),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    write_file(h.data.path(), "alice/ds/a.bin", &pattern(4096));

    let running = {
        let coordinator = Arc::clone(&h.coordinator);
        let root = h.data.path().to_path_buf();
        tokio::spawn(async move { coordinator.start_cycle(&root).await })
    };
    while !h.coordinator.is_running() {
        tokio::task::yield_now().await;
    }

    let err = h.coordinator.start_cycle(h.data.path()).await.unwrap_err();
    assert!(matches!(err, PipelineError::CycleActive));

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.uploaded, 1);
    assert!(!h.coordinator.is_running());
}

#[tokio::test]
async fn single_upload_can_be_canceled() {
    let mut h = harness(
        MemoryEndpoint::new().with_latency(Duration::from_millis(20)),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    write_file(h.data.path(), "alice/ds/slow.bin", &pattern(MIB));

    let running = {
        let coordinator = Arc::clone(&h.coordinator);
        let root = h.data.path().to_path_buf();
        tokio::spawn(async move { coordinator.start_cycle(&root).await })
    };

    let record_id = loop {
        let event = h.events.recv().await.unwrap();
        if event.progress.is_some() {
            break event.record_id;
        }
    };
    assert!(h.coordinator.cancel_upload(record_id));

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.canceled, 1);
    assert_eq!(summary.uploaded, 0);
    assert!(h.metadata.created().is_empty());

    let remote = h.endpoint.file_size("/srv/mydata/alice/ds/slow.bin").unwrap();
    assert!(remote < MIB);
    assert_eq!(remote % ChunkPlan::for_file(MIB).chunk_size, 0);
}

#[tokio::test]
async fn cancel_all_stops_in_flight_and_discards_queued() {
    let mut h = harness(
        MemoryEndpoint::new().with_latency(Duration::from_millis(20)),
        MemoryMetadata::new(),
        PipelineConfig {
            upload_workers: 3,
            grace_period: Duration::from_secs(5),
            ..PipelineConfig::default()
        },
    );
    for i in 0..13 {
        write_file(
            h.data.path(),
            &format!("alice/ds/file{i:02}.bin"),
            &pattern(MIB),
        );
    }

    let running = {
        let coordinator = Arc::clone(&h.coordinator);
        let root = h.data.path().to_path_buf();
        tokio::spawn(async move { coordinator.start_cycle(&root).await })
    };

    // Wait until three uploads are moving bytes.
    let mut moving = HashSet::new();
    let mut seen = Vec::new();
    while moving.len() < 3 {
        let event = h.events.recv().await.unwrap();
        if event.progress.is_some() {
            moving.insert(event.record_id);
        }
        seen.push(event);
    }

    h.coordinator.cancel_all().await;
    assert_eq!(h.coordinator.active_workers(), 0);
    assert!(!h.coordinator.is_running());

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.scanned, 13);
    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.canceled, 13);

    // The ten queued uploads never reached the endpoint.
    assert_eq!(h.endpoint.stats().streams_opened, 3);
    assert_eq!(h.protocol.calls.load(Ordering::SeqCst), 3);

    // The three in flight stopped on a chunk boundary.
    let chunk = ChunkPlan::for_file(MIB).chunk_size;
    let remote = h.endpoint.paths();
    assert_eq!(remote.len(), 3);
    for path in &remote {
        let size = h.endpoint.file_size(path).unwrap();
        assert!(size < MIB);
        assert_eq!(size % chunk, 0);
    }

    seen.extend(drain(&mut h.events));
    assert_eq!(
        count_status(&seen, RecordStatus::Upload(UploadStatus::Canceled)),
        13
    );
    let never_started = seen
        .iter()
        .filter(|e| e.message.as_deref() == Some("canceled before it started"))
        .count();
    assert_eq!(never_started, 10);
    assert!(h.metadata.created().is_empty());
    assert_eq!(h.coordinator.in_flight(), 0);
}

#[tokio::test]
async fn cancel_all_aborts_workers_after_grace_period() {
    let mut h = harness(
        MemoryEndpoint::new().with_latency(Duration::from_millis(500)),
        MemoryMetadata::new(),
        PipelineConfig {
            upload_workers: 2,
            grace_period: Duration::from_millis(50),
            ..PipelineConfig::default()
        },
    );
    write_file(h.data.path(), "alice/ds/a.bin", &pattern(4 * 65536));
    write_file(h.data.path(), "alice/ds/b.bin", &pattern(4 * 65536));

    let running = {
        let coordinator = Arc::clone(&h.coordinator);
        let root = h.data.path().to_path_buf();
        tokio::spawn(async move { coordinator.start_cycle(&root).await })
    };
    while h.protocol.calls.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = std::time::Instant::now();
    h.coordinator.cancel_all().await;
    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(h.coordinator.active_workers(), 0);

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.canceled, 2);

    let events = drain(&mut h.events);
    let aborted: Vec<_> = events
        .iter()
        .filter(|e| e.status == RecordStatus::Upload(UploadStatus::Canceled))
        .collect();
    assert_eq!(aborted.len(), 2);
    assert!(
        aborted
            .iter()
            .all(|e| e.message.as_deref() == Some("aborted during shutdown"))
    );
}

#[tokio::test]
async fn verifications_left_at_shutdown_get_a_final_status() {
    let mut h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new().with_latency(Duration::from_millis(500)),
        PipelineConfig {
            verification_workers: 1,
            grace_period: Duration::from_millis(50),
            ..PipelineConfig::default()
        },
    );
    for name in ["a", "b", "c"] {
        write_file(h.data.path(), &format!("alice/ds/{name}.bin"), b"xyz");
    }

    let running = {
        let coordinator = Arc::clone(&h.coordinator);
        let root = h.data.path().to_path_buf();
        tokio::spawn(async move { coordinator.start_cycle(&root).await })
    };
    let pending = RecordStatus::Verification(VerificationStatus::Pending);
    let mut submitted = HashSet::new();
    while submitted.len() < 3 {
        let event = h.events.recv().await.unwrap();
        if event.status == pending {
            submitted.insert(event.record_id);
        }
    }

    h.coordinator.cancel_all().await;
    running.await.unwrap().unwrap();

    let events = drain(&mut h.events);
    let finished: HashSet<_> = events
        .iter()
        .filter(|e| e.status.is_terminal())
        .map(|e| e.record_id)
        .collect();
    assert_eq!(finished, submitted);
    assert_eq!(h.protocol.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.coordinator.in_flight(), 0);
}

#[tokio::test]
async fn request_shutdown_without_cycle_is_noop() {
    let h = harness(
        MemoryEndpoint::new(),
        MemoryMetadata::new(),
        PipelineConfig::default(),
    );
    assert!(!h.coordinator.request_shutdown());
    h.coordinator.cancel_all().await;
    assert!(!h.coordinator.cancel_upload(42));
}
