//! Unbounded FIFO work queue shared by a pool of workers.

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

enum QueueItem<T> {
    Job(T),
    /// One per worker, pushed when no more work will follow.
    Stop,
}

pub(crate) struct WorkQueue<T> {
    tx: mpsc::UnboundedSender<QueueItem<T>>,
    rx: Mutex<mpsc::UnboundedReceiver<QueueItem<T>>>,
}

impl<T: Send> WorkQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Never blocks.
    pub fn push(&self, job: T) {
        let _ = self.tx.send(QueueItem::Job(job));
    }

    pub fn push_stops(&self, workers: usize) {
        for _ in 0..workers {
            let _ = self.tx.send(QueueItem::Stop);
        }
    }

    /// Next job, or `None` when the worker should exit: a stop sentinel was
    /// reached or `shutdown` fired.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<T> {
        if shutdown.is_cancelled() {
            return None;
        }
        let mut rx = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            item = rx.recv() => item,
        };
        match item {
            Some(QueueItem::Job(job)) => Some(job),
            Some(QueueItem::Stop) | None => None,
        }
    }

    /// Removes the jobs nobody picked up. Call once the workers are gone.
    pub fn drain(&self) -> Vec<T> {
        let mut jobs = Vec::new();
        if let Ok(mut rx) = self.rx.try_lock() {
            while let Ok(item) = rx.try_recv() {
                if let QueueItem::Job(job) = item {
                    jobs.push(job);
                }
            }
        }
        jobs
    }
}
