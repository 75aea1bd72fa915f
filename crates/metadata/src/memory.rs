//! In-memory metadata service.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::types::{FileRecord, NewFileRecord};
use crate::{MetadataError, MetadataFuture, MetadataService};

#[derive(Debug, Clone)]
struct Stored {
    container: String,
    record: FileRecord,
}

/// A [`MetadataService`] holding records in a list.
///
/// Lookups can be made to fail or to take a fixed time, and every call is
/// counted.
#[derive(Default)]
pub struct MemoryMetadata {
    records: Mutex<Vec<Stored>>,
    created: Mutex<Vec<NewFileRecord>>,
    next_id: AtomicU64,
    lookups: AtomicU64,
    fail_lookups: AtomicBool,
    fail_creates: AtomicBool,
    latency: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seeds a record and returns its id. Inserting the same tuple twice
    /// produces a duplicate.
    pub fn insert(&self, container: &str, directory: &str, filename: &str, size: u64) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.records).push(Stored {
            container: container.to_string(),
            record: FileRecord {
                id,
                filename: filename.to_string(),
                directory: directory.to_string(),
                size: Some(size),
                sha256sum: None,
            },
        });
        id
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::Relaxed);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::Relaxed);
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Records registered through [`MetadataService::create_file_record`].
    pub fn created(&self) -> Vec<NewFileRecord> {
        lock(&self.created).clone()
    }
}

impl MetadataService for MemoryMetadata {
    fn lookup<'a>(
        &'a self,
        container: &'a str,
        filename: &'a str,
        directory: &'a str,
    ) -> MetadataFuture<'a, Vec<FileRecord>> {
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.lookups.fetch_add(1, Ordering::Relaxed);
            if self.fail_lookups.load(Ordering::Relaxed) {
                return Err(MetadataError::Unavailable("lookup failed".into()));
            }
            Ok(lock(&self.records)
                .iter()
                .filter(|s| {
                    s.container == container
                        && s.record.filename == filename
                        && s.record.directory == directory
                })
                .map(|s| s.record.clone())
                .collect())
        })
    }

    fn create_file_record<'a>(&'a self, record: &'a NewFileRecord) -> MetadataFuture<'a, String> {
        Box::pin(async move {
            if self.fail_creates.load(Ordering::Relaxed) {
                return Err(MetadataError::Unavailable("create failed".into()));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            lock(&self.records).push(Stored {
                container: record.container.clone(),
                record: FileRecord {
                    id,
                    filename: record.filename.clone(),
                    directory: record.directory.clone(),
                    size: Some(record.size),
                    sha256sum: Some(record.sha256sum.clone()),
                },
            });
            lock(&self.created).push(record.clone());
            Ok(id.to_string())
        })
    }
}
