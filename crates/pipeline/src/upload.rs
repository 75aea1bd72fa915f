//! Upload pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mydata_metadata::{MetadataService, NewFileRecord};
use mydata_model::{
    FileCandidate, RecordId, RecordStatus, StatusEvent, TransferProgress, UploadStatus,
};
use mydata_transfer::{
    CancelFlag, TransferProtocol, TransferRate, UploadJob, UploadOutcome,
    calculate_file_checksum,
};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::{CycleStats, PipelineContext};
use crate::error::PipelineError;
use crate::inflight::Stage;
use crate::queue::WorkQueue;
use crate::records::UploadRecord;

/// Maps candidates to remote paths below a root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    root: String,
}

impl RemoteLayout {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>/<container>/<subdirectory>/<filename>`, empty parts left out.
    pub fn remote_path(&self, candidate: &FileCandidate) -> String {
        let filename = candidate.filename();
        let mut path = self.root.trim_end_matches('/').to_string();
        for part in [&candidate.container, &candidate.subdirectory, &filename] {
            if !part.is_empty() {
                path.push('/');
                path.push_str(part);
            }
        }
        path
    }
}

/// Bounded pool of upload workers draining a FIFO queue.
pub struct UploadPipeline {
    ctx: PipelineContext,
    protocol: Arc<dyn TransferProtocol>,
    metadata: Arc<dyn MetadataService>,
    layout: RemoteLayout,
    queue: WorkQueue<UploadRecord>,
}

impl UploadPipeline {
    pub(crate) fn new(
        ctx: PipelineContext,
        protocol: Arc<dyn TransferProtocol>,
        metadata: Arc<dyn MetadataService>,
        layout: RemoteLayout,
    ) -> Self {
        Self {
            ctx,
            protocol,
            metadata,
            layout,
            queue: WorkQueue::new(),
        }
    }

    /// Queues `candidate` for upload unless it already has a live record.
    pub fn submit(&self, candidate: FileCandidate) -> Option<RecordId> {
        if self.ctx.shutdown.is_cancelled() {
            return None;
        }
        let id = self.ctx.next_id();
        let cancel = CancelFlag::new();
        let stage = Stage::Uploading {
            record_id: id,
            cancel: cancel.clone(),
        };
        if !self.ctx.index.try_begin(&candidate.key(), stage) {
            debug!(file = %candidate.key(), "upload already in flight");
            CycleStats::bump(&self.ctx.stats.duplicates);
            return None;
        }
        self.enqueue(UploadRecord::new(id, candidate, cancel));
        Some(id)
    }

    /// Takes over a candidate whose verification found nothing remotely.
    /// The index entry moves from verifying to uploading in one step.
    pub(crate) fn hand_off(&self, candidate: FileCandidate) -> RecordId {
        let id = self.ctx.next_id();
        let cancel = CancelFlag::new();
        self.ctx.index.promote(
            &candidate.key(),
            Stage::Uploading {
                record_id: id,
                cancel: cancel.clone(),
            },
        );
        self.enqueue(UploadRecord::new(id, candidate, cancel));
        id
    }

    fn enqueue(&self, record: UploadRecord) {
        self.ctx.events.emit(record.event());
        self.queue.push(record);
    }

    pub(crate) fn spawn_workers(self: &Arc<Self>, count: usize, set: &mut JoinSet<()>) {
        for worker in 0..count {
            let pipeline = Arc::clone(self);
            let guard = self.ctx.worker_guard();
            set.spawn(
                async move {
                    let _guard = guard;
                    while let Some(record) = pipeline.queue.next(&pipeline.ctx.shutdown).await {
                        pipeline.process(record).await;
                    }
                    debug!("upload worker exiting");
                }
                .instrument(info_span!("upload_worker", worker)),
            );
        }
    }

    /// Tells `workers` workers to exit once the queue is empty.
    pub(crate) fn stop(&self, workers: usize) {
        self.queue.push_stops(workers);
    }

    /// Records nobody picked up.
    pub(crate) fn drain(&self) -> Vec<UploadRecord> {
        self.queue.drain()
    }

    async fn process(&self, mut record: UploadRecord) {
        let key = record.candidate.key();
        self.run(&mut record).await;

        let stats = &self.ctx.stats;
        match record.status {
            UploadStatus::Completed => CycleStats::bump(&stats.uploaded),
            UploadStatus::Canceled => CycleStats::bump(&stats.canceled),
            _ => CycleStats::bump(&stats.upload_failures),
        }
        self.ctx.events.emit(record.event());
        self.ctx.index.finish(&key);
    }

    async fn run(&self, record: &mut UploadRecord) {
        if record.cancel.is_canceled() {
            record.status = UploadStatus::Canceled;
            return;
        }
        if record.candidate.size == 0 {
            let err = PipelineError::EmptyFile(record.candidate.path.clone());
            warn!(file = %record.candidate.key(), "refusing to upload an empty file");
            record.fail(err.to_string());
            return;
        }

        record.status = UploadStatus::InProgress;
        self.ctx.events.emit(record.event());

        let job = UploadJob {
            local_path: record.candidate.path.clone(),
            remote_path: self.layout.remote_path(&record.candidate),
            size: record.candidate.size,
        };
        let key = record.candidate.key();
        let id = record.id;
        let rate = TransferRate::default();
        let reported = AtomicU64::new(0);
        let events = &self.ctx.events;
        let progress = |done: u64, total: u64| {
            reported.store(done, Ordering::Relaxed);
            rate.record(done);
            let mut p = TransferProgress::new(done, total);
            p.bytes_per_second = rate.bytes_per_second();
            p.eta_secs = rate.eta(total.saturating_sub(done)).map(|d| d.as_secs());
            events.emit(
                StatusEvent::new(id, key.clone(), RecordStatus::Upload(UploadStatus::InProgress))
                    .with_progress(p),
            );
        };

        info!(record = id, file = %key, remote = %job.remote_path, bytes = job.size, "upload started");
        let outcome = self.protocol.upload(&job, &record.cancel, &progress).await;
        record.bytes_uploaded = reported.load(Ordering::Relaxed);

        match outcome {
            Ok(UploadOutcome::Canceled { remote_size, .. }) => {
                info!(record = id, remote_size, "upload canceled");
                record.status = UploadStatus::Canceled;
            }
            Ok(UploadOutcome::Completed {
                bytes_transferred,
                file_size,
                ..
            }) => {
                self.ctx
                    .stats
                    .bytes_uploaded
                    .fetch_add(bytes_transferred, Ordering::Relaxed);
                self.complete(record, file_size).await;
            }
            Ok(UploadOutcome::AlreadyPresent { file_size }) => {
                self.complete(record, file_size).await;
            }
            Err(e) => {
                error!(record = id, file = %key, error = %e, "upload failed");
                record.fail(e.to_string());
            }
        }
    }

    /// Registers a file whose bytes are all on the remote side.
    async fn complete(&self, record: &mut UploadRecord, file_size: u64) {
        if file_size != record.total_bytes {
            info!(
                record = record.id,
                scanned = record.total_bytes,
                sent = file_size,
                "file size changed since scan"
            );
        }
        record.total_bytes = file_size;
        record.bytes_uploaded = file_size;
        match self.register(record).await {
            Ok(remote_id) => {
                info!(record = record.id, remote_id = %remote_id, "upload completed");
                record.status = UploadStatus::Completed;
            }
            Err(e) => {
                error!(record = record.id, error = %e, "file uploaded but not registered");
                record.fail(format!("file uploaded but not registered: {e}"));
            }
        }
    }

    /// Checksums the local file and creates its remote record. Fails when
    /// the file no longer has the size that was sent.
    async fn register(&self, record: &UploadRecord) -> Result<String, PipelineError> {
        let path = record.candidate.path.clone();
        let (checksum, len) = tokio::task::spawn_blocking(move || calculate_file_checksum(&path))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;
        if len != record.total_bytes {
            return Err(PipelineError::FileChanged {
                path: record.candidate.path.clone(),
                sent: record.total_bytes,
                current: len,
            });
        }

        let new_record = NewFileRecord {
            container: record.candidate.container.clone(),
            filename: record.candidate.filename(),
            directory: record.candidate.subdirectory.clone(),
            size: record.total_bytes,
            sha256sum: checksum,
        };
        Ok(self.metadata.create_file_record(&new_record).await?)
    }
}
