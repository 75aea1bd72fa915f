//! Verification pool: asks the metadata service whether each candidate is
//! already known remotely.

use std::sync::Arc;

use mydata_metadata::MetadataService;
use mydata_model::{FileCandidate, RecordId, VerificationStatus};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info_span, warn};

use crate::context::{CycleStats, PipelineContext};
use crate::inflight::Stage;
use crate::queue::WorkQueue;
use crate::records::VerificationRecord;
use crate::upload::UploadPipeline;

/// Bounded pool of verification workers draining a FIFO queue.
pub struct VerificationPipeline {
    ctx: PipelineContext,
    metadata: Arc<dyn MetadataService>,
    uploads: Arc<UploadPipeline>,
    queue: WorkQueue<VerificationRecord>,
}

impl VerificationPipeline {
    pub(crate) fn new(
        ctx: PipelineContext,
        metadata: Arc<dyn MetadataService>,
        uploads: Arc<UploadPipeline>,
    ) -> Self {
        Self {
            ctx,
            metadata,
            uploads,
            queue: WorkQueue::new(),
        }
    }

    /// Queues `candidate` for verification unless it already has a live
    /// verification or upload record. Never blocks.
    pub fn submit(&self, candidate: FileCandidate) -> Option<RecordId> {
        if self.ctx.shutdown.is_cancelled() {
            return None;
        }
        let key = candidate.key();
        let id = self.ctx.next_id();
        if !self.ctx.index.try_begin(&key, Stage::Verifying { record_id: id }) {
            debug!(file = %key, "already in flight");
            CycleStats::bump(&self.ctx.stats.duplicates);
            return None;
        }
        let record = VerificationRecord::new(id, candidate);
        self.ctx.events.emit(record.event());
        self.queue.push(record);
        Some(id)
    }

    pub(crate) fn spawn_workers(self: &Arc<Self>, count: usize, set: &mut JoinSet<()>) {
        for worker in 0..count {
            let pipeline = Arc::clone(self);
            let guard = self.ctx.worker_guard();
            set.spawn(
                async move {
                    let _guard = guard;
                    while let Some(record) = pipeline.queue.next(&pipeline.ctx.shutdown).await {
                        pipeline.verify(record).await;
                    }
                    debug!("verification worker exiting");
                }
                .instrument(info_span!("verification_worker", worker)),
            );
        }
    }

    pub(crate) fn stop(&self, workers: usize) {
        self.queue.push_stops(workers);
    }

    pub(crate) fn drain(&self) -> Vec<VerificationRecord> {
        self.queue.drain()
    }

    async fn verify(&self, mut record: VerificationRecord) {
        let stats = &self.ctx.stats;
        let candidate = &record.candidate;
        let key = candidate.key();
        let result = self
            .metadata
            .lookup(&candidate.container, &key.filename, &candidate.subdirectory)
            .await;

        match result {
            Ok(found) if found.is_empty() => {
                record.status = VerificationStatus::NotFound;
                CycleStats::bump(&stats.not_found);
                self.ctx.events.emit(record.event());
                let upload_id = self.uploads.hand_off(record.candidate);
                debug!(file = %key, upload = upload_id, "not found remotely, queued for upload");
                return;
            }
            Ok(found) => {
                if found.len() > 1 {
                    warn!(
                        file = %key,
                        matches = found.len(),
                        "several remote records match, treating the file as present"
                    );
                    CycleStats::bump(&stats.ambiguous);
                }
                record.remote_size = found[0].size;
                record.status = VerificationStatus::Verified;
                CycleStats::bump(&stats.verified);
                self.ctx.events.emit(record.event());
            }
            Err(e) => {
                warn!(file = %key, error = %e, "lookup failed");
                record.status = VerificationStatus::FailedLookup;
                CycleStats::bump(&stats.lookup_failures);
                self.ctx
                    .events
                    .emit(record.event().with_message(e.to_string()));
            }
        }
        self.ctx.index.finish(&key);
    }
}
