//! Status notifications emitted by the pipelines.

use serde::{Deserialize, Serialize};

use crate::candidate::CandidateKey;
use crate::status::{UploadStatus, VerificationStatus};

/// Identifier of a verification or upload record. Unique per process.
pub type RecordId = u64;

/// Which pipeline a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Verification,
    Upload,
}

/// New status carried by a [`StatusEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Verification(VerificationStatus),
    Upload(UploadStatus),
}

impl RecordStatus {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Verification(_) => RecordKind::Verification,
            Self::Upload(_) => RecordKind::Upload,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Verification(s) => s.is_terminal(),
            Self::Upload(s) => s.is_terminal(),
        }
    }
}

/// Byte-level progress of an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub percent: u8,
    #[serde(default)]
    pub bytes_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
}

impl TransferProgress {
    pub fn new(bytes_uploaded: u64, total_bytes: u64) -> Self {
        Self {
            bytes_uploaded,
            total_bytes,
            percent: progress_percent(bytes_uploaded, total_bytes),
            bytes_per_second: 0.0,
            eta_secs: None,
        }
    }
}

/// Percentage complete, computed as `100 - ((total - current) * 100 / total)`.
///
/// Integer division rounds the remaining share down, so the last percent
/// is reported slightly before the final byte. A zero total reports 0.
pub fn progress_percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let current = current.min(total) as u128;
    let total = total as u128;
    let remaining_pct = (total - current) * 100 / total;
    (100 - remaining_pct) as u8
}

/// A single status change of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub record_id: RecordId,
    pub file: CandidateKey,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TransferProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusEvent {
    pub fn new(record_id: RecordId, file: CandidateKey, status: RecordStatus) -> Self {
        Self {
            record_id,
            file,
            status,
            progress: None,
            message: None,
        }
    }

    pub fn with_progress(mut self, progress: TransferProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
