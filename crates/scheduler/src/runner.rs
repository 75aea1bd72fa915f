//! What a scheduled cycle actually runs.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use mydata_pipeline::{Coordinator, CycleSummary, PipelineError};

pub type RunFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs cycles on behalf of the scheduler.
pub trait CycleRunner: Send + Sync {
    /// Runs one cycle to completion.
    fn run_cycle(&self) -> RunFuture<'_, Result<CycleSummary, PipelineError>>;

    /// Stops the running cycle and resolves once it is gone. Resolves at
    /// once when nothing runs.
    fn shutdown(&self) -> RunFuture<'_, ()>;
}

/// Runs cycles over one data directory through a [`Coordinator`].
pub struct PipelineRunner {
    coordinator: Arc<Coordinator>,
    root: PathBuf,
}

impl PipelineRunner {
    pub fn new(coordinator: Arc<Coordinator>, root: impl Into<PathBuf>) -> Self {
        Self {
            coordinator,
            root: root.into(),
        }
    }
}

impl CycleRunner for PipelineRunner {
    fn run_cycle(&self) -> RunFuture<'_, Result<CycleSummary, PipelineError>> {
        Box::pin(self.coordinator.start_cycle(&self.root))
    }

    fn shutdown(&self) -> RunFuture<'_, ()> {
        Box::pin(self.coordinator.cancel_all())
    }
}
