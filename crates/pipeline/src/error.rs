//! Pipeline error types.

use std::path::PathBuf;

/// Errors produced by the scan/verify/upload pipelines.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data directory {0} does not exist or is not readable")]
    RootMissing(PathBuf),

    #[error("data directory {0} is not a directory")]
    RootNotDirectory(PathBuf),

    #[error("invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("{0} is empty")]
    EmptyFile(PathBuf),

    #[error("{path} changed during upload ({sent} bytes sent, {current} bytes now)")]
    FileChanged {
        path: PathBuf,
        sent: u64,
        current: u64,
    },

    #[error("a cycle is already running")]
    CycleActive,

    #[error("pipeline task failed: {0}")]
    Task(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] mydata_transfer::TransferError),

    #[error("metadata error: {0}")]
    Metadata(#[from] mydata_metadata::MetadataError),
}
