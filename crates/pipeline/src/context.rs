//! State shared by the pools of one cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use mydata_model::RecordId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::events::EventSink;
use crate::inflight::InFlightIndex;

#[derive(Clone)]
pub(crate) struct PipelineContext {
    pub index: Arc<InFlightIndex>,
    pub events: EventSink,
    pub stats: Arc<CycleStats>,
    pub ids: Arc<AtomicU64>,
    /// Stops workers from taking new jobs.
    pub shutdown: CancellationToken,
    pub workers: Arc<AtomicUsize>,
}

impl PipelineContext {
    pub fn next_id(&self) -> RecordId {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Counts a worker as alive until the guard is dropped, which also
    /// happens when its task is aborted.
    pub fn worker_guard(&self) -> WorkerGuard {
        self.workers.fetch_add(1, Ordering::SeqCst);
        WorkerGuard(Arc::clone(&self.workers))
    }
}

pub(crate) struct WorkerGuard(Arc<AtomicUsize>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counters accumulated while a cycle runs.
#[derive(Debug, Default)]
pub(crate) struct CycleStats {
    pub scanned: AtomicUsize,
    pub skipped: AtomicUsize,
    pub duplicates: AtomicUsize,
    pub verified: AtomicUsize,
    pub ambiguous: AtomicUsize,
    pub not_found: AtomicUsize,
    pub lookup_failures: AtomicUsize,
    pub uploaded: AtomicUsize,
    pub bytes_uploaded: AtomicU64,
    pub upload_failures: AtomicUsize,
    pub canceled: AtomicUsize,
}

impl CycleStats {
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> CycleSummary {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        CycleSummary {
            scanned: get(&self.scanned),
            skipped: get(&self.skipped),
            duplicates: get(&self.duplicates),
            verified: get(&self.verified),
            ambiguous: get(&self.ambiguous),
            not_found: get(&self.not_found),
            lookup_failures: get(&self.lookup_failures),
            uploaded: get(&self.uploaded),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            upload_failures: get(&self.upload_failures),
            canceled: get(&self.canceled),
        }
    }
}

/// Outcome counts of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    /// Candidates produced by the scanner.
    pub scanned: usize,
    /// Files the scanner passed over.
    pub skipped: usize,
    /// Candidates dropped because a record was already in flight.
    pub duplicates: usize,
    pub verified: usize,
    /// Verified files that matched more than one remote record.
    pub ambiguous: usize,
    pub not_found: usize,
    pub lookup_failures: usize,
    pub uploaded: usize,
    /// Bytes sent over the wire, resumed prefixes excluded.
    pub bytes_uploaded: u64,
    pub upload_failures: usize,
    pub canceled: usize,
}
