//! Shared data model for the MyData transfer pipeline.
//!
//! Types in this crate cross crate boundaries: the scanner produces
//! [`FileCandidate`]s, the pipelines report [`StatusEvent`]s, and external
//! observers (GUI, logs, tests) consume them.

pub mod candidate;
pub mod events;
pub mod status;

pub use candidate::{CandidateKey, FileCandidate};
pub use events::{
    RecordId, RecordKind, RecordStatus, StatusEvent, TransferProgress, progress_percent,
};
pub use status::{UploadStatus, VerificationStatus};
