//! The resumable remote-append upload protocol.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::chunked::{Chunk, ChunkPlan, ChunkReader};
use crate::endpoint::{EndpointFuture, RemoteEndpoint, remote_parent};
use crate::{LARGE_FILE_THRESHOLD, TransferError};

/// Boxed future returned by [`TransferProtocol::upload`].
pub type TransferFuture<'a, T> = EndpointFuture<'a, T>;

/// Progress callback: `(bytes_so_far, total_bytes)`, invoked after every chunk.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// One file to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub local_path: PathBuf,
    /// Absolute destination path on the remote host.
    pub remote_path: String,
    /// Size reported by the scanner.
    pub size: u64,
}

/// How a file is sent, chosen by size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
    /// Chunks are written into the stdin of one remote append command.
    StreamingAppend,
    /// Each chunk is copied to a scratch file and appended remotely.
    ChunkedCopyAppend,
}

impl TransferMethod {
    pub fn for_size(size: u64) -> Self {
        if size > LARGE_FILE_THRESHOLD {
            Self::ChunkedCopyAppend
        } else {
            Self::StreamingAppend
        }
    }
}

/// How an upload ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed {
        /// Bytes sent by this call (excludes a resumed prefix).
        bytes_transferred: u64,
        resumed_from: u64,
        chunk_size: u64,
        /// Size of the file as sent, which can differ from the scanned size.
        file_size: u64,
    },
    /// The remote copy already had every byte; nothing was sent.
    AlreadyPresent { file_size: u64 },
    /// Stopped at a chunk boundary on request.
    Canceled {
        bytes_transferred: u64,
        remote_size: u64,
    },
}

/// Uploads a single file. Implementations have no concurrency of their own.
pub trait TransferProtocol: Send + Sync {
    fn upload<'a>(
        &'a self,
        job: &'a UploadJob,
        cancel: &'a CancelFlag,
        progress: ProgressFn<'a>,
    ) -> TransferFuture<'a, UploadOutcome>;
}

/// [`TransferProtocol`] over any [`RemoteEndpoint`].
pub struct Uploader<E: ?Sized> {
    endpoint: Arc<E>,
    scratch_dir: String,
}

impl<E: RemoteEndpoint + ?Sized> Uploader<E> {
    pub fn new(endpoint: Arc<E>) -> Self {
        Self {
            endpoint,
            scratch_dir: "/tmp".into(),
        }
    }

    /// Remote directory for per-chunk scratch files.
    pub fn with_scratch_dir(mut self, dir: impl Into<String>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Sends `job.local_path` to `job.remote_path`.
    pub async fn upload_file(
        &self,
        job: &UploadJob,
        cancel: &CancelFlag,
        progress: ProgressFn<'_>,
    ) -> Result<UploadOutcome, TransferError> {
        let size = tokio::fs::metadata(&job.local_path).await?.len();
        if size == 0 {
            return Err(TransferError::EmptyFile(job.local_path.clone()));
        }
        if size != job.size {
            debug!(
                path = %job.local_path.display(),
                scanned = job.size,
                current = size,
                "file size changed since scan"
            );
        }
        let plan = ChunkPlan::for_file(size);

        match TransferMethod::for_size(size) {
            TransferMethod::StreamingAppend => {
                self.stream(job, size, plan, cancel, progress).await
            }
            TransferMethod::ChunkedCopyAppend => {
                self.copy_append(job, size, plan, cancel, progress).await
            }
        }
    }

    async fn stream(
        &self,
        job: &UploadJob,
        size: u64,
        plan: ChunkPlan,
        cancel: &CancelFlag,
        progress: ProgressFn<'_>,
    ) -> Result<UploadOutcome, TransferError> {
        if cancel.is_canceled() {
            return Ok(UploadOutcome::Canceled {
                bytes_transferred: 0,
                remote_size: 0,
            });
        }
        self.prepare_dir(&job.remote_path).await?;

        let mut reader = ChunkReader::open(&job.local_path, plan.chunk_size).await?;
        let mut sink = self.endpoint.open_append(&job.remote_path, true).await?;
        let mut sent = 0u64;
        let mut canceled = false;

        loop {
            if cancel.is_canceled() {
                canceled = true;
                break;
            }
            let Some(chunk) = reader.next_chunk().await? else {
                break;
            };
            sink.write_chunk(&chunk.data).await?;
            sent += chunk.len();
            progress(sent, size);
        }
        sink.finish().await?;

        if canceled {
            info!(remote = %job.remote_path, bytes = sent, "streaming upload canceled");
            return Ok(UploadOutcome::Canceled {
                bytes_transferred: sent,
                remote_size: sent,
            });
        }
        Ok(UploadOutcome::Completed {
            bytes_transferred: sent,
            resumed_from: 0,
            chunk_size: plan.chunk_size,
            file_size: sent,
        })
    }

    async fn copy_append(
        &self,
        job: &UploadJob,
        size: u64,
        plan: ChunkPlan,
        cancel: &CancelFlag,
        progress: ProgressFn<'_>,
    ) -> Result<UploadOutcome, TransferError> {
        let remote_size = self.endpoint.remote_size(&job.remote_path).await?;
        let mut offset = 0u64;

        if remote_size == size {
            info!(remote = %job.remote_path, bytes = size, "remote copy already complete");
            progress(size, size);
            return Ok(UploadOutcome::AlreadyPresent { file_size: size });
        }
        if remote_size > size {
            warn!(
                remote = %job.remote_path,
                remote_size,
                local_size = size,
                "remote file is larger than the local file, leaving it untouched"
            );
            return Err(TransferError::RemoteLarger {
                path: job.remote_path.clone(),
                remote_size,
                local_size: size,
            });
        }
        if remote_size > 0 {
            if remote_size % plan.chunk_size != 0 {
                warn!(
                    remote = %job.remote_path,
                    remote_size,
                    chunk_size = plan.chunk_size,
                    "remote size is not on a chunk boundary"
                );
            }
            info!(remote = %job.remote_path, offset = remote_size, "resuming upload");
            offset = remote_size;
        }

        if cancel.is_canceled() {
            return Ok(UploadOutcome::Canceled {
                bytes_transferred: 0,
                remote_size: offset,
            });
        }
        if offset == 0 {
            self.prepare_dir(&job.remote_path).await?;
        }

        let mut reader = ChunkReader::open(&job.local_path, plan.chunk_size).await?;
        reader.seek_to(offset).await?;
        if offset > 0 {
            progress(offset, size);
        }

        let mut sent = 0u64;
        let mut remote_len = offset;
        loop {
            if cancel.is_canceled() {
                info!(remote = %job.remote_path, remote_len, "chunked upload canceled");
                return Ok(UploadOutcome::Canceled {
                    bytes_transferred: sent,
                    remote_size: remote_len,
                });
            }
            let Some(chunk) = reader.next_chunk().await? else {
                break;
            };
            if !self.send_chunk(&chunk, &job.remote_path, cancel).await? {
                return Ok(UploadOutcome::Canceled {
                    bytes_transferred: sent,
                    remote_size: remote_len,
                });
            }
            sent += chunk.len();
            remote_len += chunk.len();
            progress(remote_len, size);
        }

        Ok(UploadOutcome::Completed {
            bytes_transferred: sent,
            resumed_from: offset,
            chunk_size: plan.chunk_size,
            file_size: remote_len,
        })
    }

    /// Copies one chunk to a scratch file and appends it to `dest`.
    ///
    /// Returns `false` when canceled between the copy and the append; the
    /// destination is then left untouched. The scratch file is removed in
    /// every case.
    async fn send_chunk(
        &self,
        chunk: &Chunk,
        dest: &str,
        cancel: &CancelFlag,
    ) -> Result<bool, TransferError> {
        let temp = tempfile::NamedTempFile::new()?;
        tokio::fs::write(temp.path(), &chunk.data).await?;
        let scratch = format!(
            "{}/mydata-{}.chunk",
            self.scratch_dir.trim_end_matches('/'),
            uuid::Uuid::new_v4()
        );

        let result = async {
            self.endpoint.copy_file(temp.path(), &scratch).await?;
            if cancel.is_canceled() {
                return Ok(false);
            }
            self.endpoint.append_file(&scratch, dest).await?;
            Ok::<_, TransferError>(true)
        }
        .await;

        if let Err(e) = self.endpoint.remove(&scratch).await {
            warn!(scratch = %scratch, error = %e, "failed to remove remote scratch file");
        }
        drop(temp);

        if let Ok(true) = result {
            debug!(dest, offset = chunk.offset, len = chunk.len(), "chunk appended");
        }
        result
    }

    async fn prepare_dir(&self, remote_path: &str) -> Result<(), TransferError> {
        match remote_parent(remote_path) {
            Some(dir) => self.endpoint.make_dir(dir).await,
            None => Ok(()),
        }
    }
}

impl<E: RemoteEndpoint + ?Sized> TransferProtocol for Uploader<E> {
    fn upload<'a>(
        &'a self,
        job: &'a UploadJob,
        cancel: &'a CancelFlag,
        progress: ProgressFn<'a>,
    ) -> TransferFuture<'a, UploadOutcome> {
        Box::pin(self.upload_file(job, cancel, progress))
    }
}
