//! Index of candidates that currently have a non-terminal record.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use mydata_model::{CandidateKey, RecordId};
use mydata_transfer::CancelFlag;
use tokio::sync::watch;

/// Pipeline stage a candidate is in.
#[derive(Debug, Clone)]
pub enum Stage {
    Verifying { record_id: RecordId },
    Uploading { record_id: RecordId, cancel: CancelFlag },
}

/// The only structure written by several workers at once.
///
/// Every check-and-insert happens under one mutex, which is what keeps a
/// candidate from having two live records.
pub struct InFlightIndex {
    entries: Mutex<HashMap<CandidateKey, Stage>>,
    len: watch::Sender<usize>,
}

impl Default for InFlightIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightIndex {
    pub fn new() -> Self {
        let (len, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            len,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CandidateKey, Stage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, entries: &HashMap<CandidateKey, Stage>) {
        self.len.send_replace(entries.len());
    }

    /// Inserts `key` unless it is already in flight. Returns whether it was
    /// inserted.
    pub fn try_begin(&self, key: &CandidateKey, stage: Stage) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.clone(), stage);
        self.publish(&entries);
        true
    }

    /// Moves `key` to a new stage without ever leaving the index.
    pub fn promote(&self, key: &CandidateKey, stage: Stage) {
        let mut entries = self.lock();
        entries.insert(key.clone(), stage);
        self.publish(&entries);
    }

    /// Removes `key` once its record is terminal.
    pub fn finish(&self, key: &CandidateKey) {
        let mut entries = self.lock();
        if entries.remove(key).is_some() {
            self.publish(&entries);
        }
    }

    /// Requests cancellation of the upload with `record_id`.
    pub fn cancel(&self, record_id: RecordId) -> bool {
        self.lock().values().any(|stage| match stage {
            Stage::Uploading { record_id: id, cancel } if *id == record_id => {
                cancel.cancel();
                true
            }
            _ => false,
        })
    }

    /// Requests cancellation of every upload. Returns how many were flagged.
    pub fn cancel_all(&self) -> usize {
        let entries = self.lock();
        let mut count = 0;
        for stage in entries.values() {
            if let Stage::Uploading { cancel, .. } = stage {
                cancel.cancel();
                count += 1;
            }
        }
        count
    }

    /// Empties the index, returning what was left in it.
    pub fn drain(&self) -> Vec<(CandidateKey, Stage)> {
        let mut entries = self.lock();
        let drained: Vec<_> = entries.drain().collect();
        self.publish(&entries);
        drained
    }

    pub fn len(&self) -> usize {
        *self.len.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once no candidate is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.len.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
