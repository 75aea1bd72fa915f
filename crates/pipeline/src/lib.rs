//! Scan, verify and upload pipelines.
//!
//! One cycle walks the data directory ([`FolderScanner`]), checks every
//! candidate against the metadata service ([`VerificationPipeline`]) and
//! uploads the ones that are missing ([`UploadPipeline`]). Both pools are
//! fixed-size sets of tokio tasks fed by unbounded FIFO queues; the
//! [`Coordinator`] wires them together and owns the control surface.
//!
//! A candidate never has more than one live record: admission to either
//! queue goes through a single mutex-guarded in-flight index.

pub mod coordinator;
mod context;
pub mod error;
pub mod events;
pub mod inflight;
mod queue;
pub mod records;
pub mod scanner;
pub mod upload;
pub mod verification;

pub use context::CycleSummary;
pub use coordinator::{Coordinator, PipelineConfig};
pub use error::PipelineError;
pub use events::EventSink;
pub use inflight::{InFlightIndex, Stage};
pub use records::{UploadRecord, VerificationRecord};
pub use scanner::{Candidates, FolderScanner, FolderStructure, ScanOptions};
pub use upload::{RemoteLayout, UploadPipeline};
pub use verification::VerificationPipeline;
