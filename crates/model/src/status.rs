use serde::{Deserialize, Serialize};

/// State of a verification (existence check) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    /// A matching remote record exists.
    Verified,
    /// No remote record; the file is handed to the upload pipeline.
    NotFound,
    /// The metadata lookup itself failed.
    FailedLookup,
}

impl VerificationStatus {
    /// Returns `true` once the verification record will not change again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// State of an upload record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl UploadStatus {
    /// Returns `true` once the upload record will not change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_terminal_states() {
        assert!(!VerificationStatus::Pending.is_terminal());
        assert!(VerificationStatus::Verified.is_terminal());
        assert!(VerificationStatus::NotFound.is_terminal());
        assert!(VerificationStatus::FailedLookup.is_terminal());
    }

    #[test]
    fn upload_terminal_states() {
        assert!(!UploadStatus::NotStarted.is_terminal());
        assert!(!UploadStatus::InProgress.is_terminal());
        assert!(UploadStatus::Completed.is_terminal());
        assert!(UploadStatus::Failed.is_terminal());
        assert!(UploadStatus::Canceled.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&UploadStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&VerificationStatus::FailedLookup).unwrap(),
            "\"failed_lookup\""
        );
    }
}
