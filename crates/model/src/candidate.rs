use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A local file discovered by the scanner.
///
/// Immutable once created: the pipelines only ever read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCandidate {
    /// Absolute local path.
    pub path: PathBuf,
    /// Remote container (dataset) the file belongs to.
    pub container: String,
    /// Directory of the file relative to its container, `/`-separated.
    /// Empty when the file sits directly in the container folder.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subdirectory: String,
    /// File size in bytes at scan time.
    pub size: u64,
}

impl FileCandidate {
    /// File name component of the local path.
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Identity used for de-duplication across the pipelines.
    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            container: self.container.clone(),
            subdirectory: self.subdirectory.clone(),
            filename: self.filename(),
        }
    }
}

/// The (container, subdirectory, filename) tuple that identifies a file
/// remotely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateKey {
    pub container: String,
    pub subdirectory: String,
    pub filename: String,
}

impl std::fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.subdirectory.is_empty() {
            write!(f, "{}:{}", self.container, self.filename)
        } else {
            write!(f, "{}:{}/{}", self.container, self.subdirectory, self.filename)
        }
    }
}
