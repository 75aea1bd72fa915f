//! Metadata service collaborator.
//!
//! The pipelines only need two calls: find the file records that match a
//! (container, filename, directory) tuple, and register a freshly uploaded
//! file. [`HttpMetadataService`] talks to the MyData REST API,
//! [`MemoryMetadata`] keeps records in memory for tests.

pub mod http;
pub mod memory;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use http::HttpMetadataService;
pub use memory::MemoryMetadata;
pub use types::{FileRecord, NewFileRecord};

/// Errors from a metadata service.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid API credentials")]
    InvalidKey,

    #[error("metadata service unavailable: {0}")]
    Unavailable(String),
}

/// Boxed future returned by [`MetadataService`] calls.
pub type MetadataFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, MetadataError>> + Send + 'a>>;

/// Lookup and registration of remote file records.
pub trait MetadataService: Send + Sync {
    /// Records matching `filename` in `directory` of `container`.
    ///
    /// An empty directory means the container's top level.
    fn lookup<'a>(
        &'a self,
        container: &'a str,
        filename: &'a str,
        directory: &'a str,
    ) -> MetadataFuture<'a, Vec<FileRecord>>;

    /// Registers a file and returns the new record id.
    fn create_file_record<'a>(&'a self, record: &'a NewFileRecord) -> MetadataFuture<'a, String>;
}
