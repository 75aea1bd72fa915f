//! Cycle coordinator.
//!
//! Runs one scan → verify → upload cycle at a time and exposes the control
//! surface used by the scheduler and the binary: start a cycle, ask it to
//! stop, cancel single uploads or everything.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mydata_metadata::MetadataService;
use mydata_model::{RecordId, RecordStatus, StatusEvent, UploadStatus, VerificationStatus};
use mydata_transfer::TransferProtocol;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{CycleStats, CycleSummary, PipelineContext};
use crate::error::PipelineError;
use crate::events::EventSink;
use crate::inflight::{InFlightIndex, Stage};
use crate::scanner::{FolderScanner, ScanOptions};
use crate::upload::{RemoteLayout, UploadPipeline};
use crate::verification::VerificationPipeline;

/// Pool sizes and layout of a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub verification_workers: usize,
    pub upload_workers: usize,
    /// Remote directory that receives the containers.
    pub remote_root: String,
    pub scan: ScanOptions,
    /// How long [`Coordinator::cancel_all`] waits for workers to stop on
    /// their own before aborting them.
    pub grace_period: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            verification_workers: 25,
            upload_workers: 5,
            remote_root: "/var/lib/mydata/receiving".into(),
            scan: ScanOptions::default(),
            grace_period: Duration::from_secs(10),
        }
    }
}

struct ActiveCycle {
    shutdown: CancellationToken,
    abort: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Clears the active slot when a cycle ends, however it ends.
struct CycleGuard<'a> {
    slot: &'a Mutex<Option<ActiveCycle>>,
    done: watch::Sender<bool>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        lock(self.slot).take();
        self.done.send_replace(true);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the pipelines' collaborators and runs cycles.
pub struct Coordinator {
    metadata: Arc<dyn MetadataService>,
    protocol: Arc<dyn TransferProtocol>,
    config: PipelineConfig,
    index: Arc<InFlightIndex>,
    events: EventSink,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
    ids: Arc<AtomicU64>,
    workers: Arc<AtomicUsize>,
    active: Mutex<Option<ActiveCycle>>,
}

impl Coordinator {
    pub fn new(
        metadata: Arc<dyn MetadataService>,
        protocol: Arc<dyn TransferProtocol>,
        config: PipelineConfig,
    ) -> Self {
        let (events, events_rx) = EventSink::channel();
        Self {
            metadata,
            protocol,
            config,
            index: Arc::new(InFlightIndex::new()),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            ids: Arc::default(),
            workers: Arc::default(),
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Takes the status event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StatusEvent>> {
        lock(&self.events_rx).take()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Worker tasks currently alive, across both pools.
    pub fn active_workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Candidates with a non-terminal record.
    pub fn in_flight(&self) -> usize {
        self.index.len()
    }

    /// Runs a full cycle over `root` and resolves once every worker is gone.
    ///
    /// A missing root fails before any worker starts or any remote call is
    /// made.
    pub async fn start_cycle(&self, root: &Path) -> Result<CycleSummary, PipelineError> {
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let _guard = self.activate(&shutdown, &abort)?;

        let scanner = FolderScanner::new(root, self.config.scan.clone())?;
        scanner.check_root()?;

        let stale = self.index.drain();
        if !stale.is_empty() {
            debug!(count = stale.len(), "dropping records left by an interrupted cycle");
        }

        let started = Instant::now();
        let ctx = PipelineContext {
            index: Arc::clone(&self.index),
            events: self.events.clone(),
            stats: Arc::new(CycleStats::default()),
            ids: Arc::clone(&self.ids),
            shutdown: shutdown.clone(),
            workers: Arc::clone(&self.workers),
        };
        let uploads = Arc::new(UploadPipeline::new(
            ctx.clone(),
            Arc::clone(&self.protocol),
            Arc::clone(&self.metadata),
            RemoteLayout::new(self.config.remote_root.clone()),
        ));
        let verifications = Arc::new(VerificationPipeline::new(
            ctx.clone(),
            Arc::clone(&self.metadata),
            Arc::clone(&uploads),
        ));

        let verification_workers = self.config.verification_workers.max(1);
        let upload_workers = self.config.upload_workers.max(1);
        let mut verifiers = JoinSet::new();
        let mut uploaders = JoinSet::new();
        verifications.spawn_workers(verification_workers, &mut verifiers);
        uploads.spawn_workers(upload_workers, &mut uploaders);
        info!(
            root = %root.display(),
            verification_workers,
            upload_workers,
            "cycle started"
        );

        let scan = {
            let verifications = Arc::clone(&verifications);
            let ctx = ctx.clone();
            tokio::task::spawn_blocking(move || feed(&scanner, &verifications, &ctx))
        };
        let scanned = match scan.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Task(e.to_string())),
        };
        if let Err(e) = &scanned {
            error!(error = %e, "scan aborted");
            shutdown.cancel();
        }

        // Sentinels queue up behind the remaining jobs, so the pools drain
        // before exiting unless shutdown was requested.
        verifications.stop(verification_workers);
        join_workers(&mut verifiers, &abort).await;
        uploads.stop(upload_workers);
        join_workers(&mut uploaders, &abort).await;

        self.discard_leftovers(&ctx, &verifications, &uploads);
        scanned?;

        let summary = ctx.stats.summary();
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            scanned = summary.scanned,
            skipped = summary.skipped,
            verified = summary.verified,
            ambiguous = summary.ambiguous,
            lookup_failures = summary.lookup_failures,
            uploaded = summary.uploaded,
            upload_failures = summary.upload_failures,
            canceled = summary.canceled,
            bytes = summary.bytes_uploaded,
            "cycle finished"
        );
        Ok(summary)
    }

    /// Stops the running cycle from taking new work and asks in-flight
    /// uploads to stop at their next chunk boundary. Returns whether a cycle
    /// was running.
    pub fn request_shutdown(&self) -> bool {
        let active = lock(&self.active);
        let Some(cycle) = active.as_ref() else {
            return false;
        };
        cycle.shutdown.cancel();
        drop(active);
        let uploads = self.index.cancel_all();
        info!(uploads, "shutdown requested");
        true
    }

    /// Cancels one upload. Returns whether it was found in flight.
    pub fn cancel_upload(&self, record_id: RecordId) -> bool {
        let found = self.index.cancel(record_id);
        if found {
            info!(record = record_id, "upload cancel requested");
        }
        found
    }

    /// Shuts the running cycle down and waits until no worker is alive.
    ///
    /// Workers get the configured grace period to reach a chunk boundary;
    /// after that their tasks are aborted, which kills any remote command
    /// they were running.
    pub async fn cancel_all(&self) {
        let Some((abort, mut done)) = lock(&self.active)
            .as_ref()
            .map(|c| (c.abort.clone(), c.done.clone()))
        else {
            return;
        };
        self.request_shutdown();

        let stopped = tokio::time::timeout(self.config.grace_period, done.wait_for(|d| *d))
            .await
            .is_ok();
        if !stopped {
            warn!(
                grace_secs = self.config.grace_period.as_secs(),
                "workers did not stop in time, aborting them"
            );
            abort.cancel();
            let _ = done.wait_for(|d| *d).await;
        }
    }

    fn activate(
        &self,
        shutdown: &CancellationToken,
        abort: &CancellationToken,
    ) -> Result<CycleGuard<'_>, PipelineError> {
        let mut active = lock(&self.active);
        if active.is_some() {
            return Err(PipelineError::CycleActive);
        }
        let (done_tx, done_rx) = watch::channel(false);
        *active = Some(ActiveCycle {
            shutdown: shutdown.clone(),
            abort: abort.clone(),
            done: done_rx,
        });
        Ok(CycleGuard {
            slot: &self.active,
            done: done_tx,
        })
    }

    /// Gives every record still in flight once the workers are gone a
    /// terminal event.
    fn discard_leftovers(
        &self,
        ctx: &PipelineContext,
        verifications: &VerificationPipeline,
        uploads: &UploadPipeline,
    ) {
        let skipped_verifications = verifications.drain().len();
        let queued: HashSet<RecordId> = uploads.drain().iter().map(|r| r.id).collect();
        if skipped_verifications + queued.len() > 0 {
            info!(
                verifications = skipped_verifications,
                uploads = queued.len(),
                "discarding queued work"
            );
        }

        for (key, stage) in self.index.drain() {
            let event = match stage {
                Stage::Verifying { record_id } => StatusEvent::new(
                    record_id,
                    key,
                    RecordStatus::Verification(VerificationStatus::FailedLookup),
                )
                .with_message("cycle stopped before the lookup finished"),
                Stage::Uploading { record_id, .. } => {
                    CycleStats::bump(&ctx.stats.canceled);
                    let message = if queued.contains(&record_id) {
                        "canceled before it started"
                    } else {
                        "aborted during shutdown"
                    };
                    StatusEvent::new(record_id, key, RecordStatus::Upload(UploadStatus::Canceled))
                        .with_message(message)
                }
            };
            self.events.emit(event);
        }
    }
}

/// Feeds scanner output into the verification queue. Runs on a blocking
/// thread.
fn feed(
    scanner: &FolderScanner,
    verifications: &VerificationPipeline,
    ctx: &PipelineContext,
) -> Result<(), PipelineError> {
    let mut candidates = scanner.scan()?;
    for candidate in candidates.by_ref() {
        if ctx.shutdown.is_cancelled() {
            debug!("scan stopped by shutdown");
            break;
        }
        CycleStats::bump(&ctx.stats.scanned);
        verifications.submit(candidate);
    }
    ctx.stats
        .skipped
        .fetch_add(candidates.skipped(), Ordering::Relaxed);
    Ok(())
}

/// Joins every worker, aborting the rest as soon as `abort` fires.
async fn join_workers(set: &mut JoinSet<()>, abort: &CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                set.abort_all();
                while set.join_next().await.is_some() {}
                return;
            }
            joined = set.join_next() => match joined {
                None => return,
                Some(Err(e)) if e.is_panic() => error!(error = %e, "worker panicked"),
                Some(_) => {}
            },
        }
    }
}
