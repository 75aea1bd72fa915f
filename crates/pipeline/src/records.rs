//! Per-candidate records owned by the worker processing them.

use mydata_model::{
    FileCandidate, RecordId, RecordStatus, StatusEvent, TransferProgress, UploadStatus,
    VerificationStatus,
};
use mydata_transfer::CancelFlag;

/// Verification state of one candidate.
#[derive(Debug, Clone)]
pub struct VerificationRecord {
    pub id: RecordId,
    pub candidate: FileCandidate,
    pub status: VerificationStatus,
    /// Size of the remote file when the metadata service reported one.
    pub remote_size: Option<u64>,
}

impl VerificationRecord {
    pub fn new(id: RecordId, candidate: FileCandidate) -> Self {
        Self {
            id,
            candidate,
            status: VerificationStatus::Pending,
            remote_size: None,
        }
    }

    pub fn event(&self) -> StatusEvent {
        StatusEvent::new(
            self.id,
            self.candidate.key(),
            RecordStatus::Verification(self.status),
        )
    }
}

/// Upload state of one candidate.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub id: RecordId,
    pub candidate: FileCandidate,
    pub status: UploadStatus,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
    /// Shared with the in-flight index so the upload can be stopped from
    /// outside the worker.
    pub cancel: CancelFlag,
}

impl UploadRecord {
    pub fn new(id: RecordId, candidate: FileCandidate, cancel: CancelFlag) -> Self {
        let total_bytes = candidate.size;
        Self {
            id,
            candidate,
            status: UploadStatus::NotStarted,
            bytes_uploaded: 0,
            total_bytes,
            error: None,
            cancel,
        }
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress::new(self.bytes_uploaded, self.total_bytes)
    }

    pub fn progress_percent(&self) -> u8 {
        self.progress().percent
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = UploadStatus::Failed;
        self.error = Some(message.into());
    }

    pub fn event(&self) -> StatusEvent {
        let event = StatusEvent::new(
            self.id,
            self.candidate.key(),
            RecordStatus::Upload(self.status),
        );
        match &self.error {
            Some(message) => event.with_message(message.clone()),
            None => event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn candidate(size: u64) -> FileCandidate {
        FileCandidate {
            path: PathBuf::from("/data/alice/ds/a.bin"),
            container: "alice/ds".into(),
            subdirectory: String::new(),
            size,
        }
    }

    #[test]
    fn new_upload_record() {
        let record = UploadRecord::new(1, candidate(200), CancelFlag::new());
        assert_eq!(record.status, UploadStatus::NotStarted);
        assert_eq!(record.total_bytes, 200);
        assert_eq!(record.progress_percent(), 0);
    }

    #[test]
    fn failed_record_event_carries_message() {
        let mut record = UploadRecord::new(2, candidate(10), CancelFlag::new());
        record.fail("disk full");
        let event = record.event();
        assert_eq!(event.status, RecordStatus::Upload(UploadStatus::Failed));
        assert_eq!(event.message.as_deref(), Some("disk full"));
        assert!(event.status.is_terminal());
    }

    #[test]
    fn verification_event() {
        let mut record = VerificationRecord::new(3, candidate(10));
        assert!(!record.event().status.is_terminal());
        record.status = VerificationStatus::NotFound;
        assert_eq!(
            record.event().status,
            RecordStatus::Verification(VerificationStatus::NotFound)
        );
    }
}
