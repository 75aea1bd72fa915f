//! Resumable, chunked, append-based file transfer over a remote shell.
//!
//! The remote side only has to offer four primitives (byte-count query,
//! streaming append, file copy, remove) plus directory creation; they are
//! abstracted by [`RemoteEndpoint`]. [`SshEndpoint`] drives the system
//! `ssh`/`scp` binaries, [`MemoryEndpoint`] keeps everything in memory for
//! deterministic tests.
//!
//! [`Uploader`] implements the protocol on top of an endpoint:
//!
//! - files up to [`LARGE_FILE_THRESHOLD`] are streamed chunk by chunk into
//!   one long-lived remote append command;
//! - larger files first ask the remote side how many bytes it already has,
//!   then send each chunk as a scratch file that is appended to the
//!   destination in a separate command, so the destination only ever grows
//!   by whole chunks and an interrupted transfer can resume safely.

use std::path::PathBuf;

mod cancel;
mod chunked;
mod endpoint;
mod memory;
mod progress;
mod protocol;
mod ssh;

pub use cancel::CancelFlag;
pub use chunked::{Chunk, ChunkPlan, ChunkReader, calculate_file_checksum, checksum_bytes};
pub use endpoint::{AppendSink, EndpointFuture, RemoteEndpoint, shell_quote};
pub use memory::{EndpointStats, MemoryEndpoint};
pub use progress::TransferRate;
pub use protocol::{
    ProgressFn, TransferFuture, TransferMethod, TransferProtocol, UploadJob, UploadOutcome,
    Uploader,
};
pub use ssh::{SshConfig, SshEndpoint};

/// Files strictly larger than this use the resumable copy-and-append method.
pub const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote host could not be reached at all.
    #[error(
        "connection to {host} refused: {detail}. Check the network connection and \
         that no firewall blocks the SSH port"
    )]
    Refused { host: String, detail: String },

    /// The remote host rejected our credentials or key.
    #[error(
        "permission denied for {user}@{host}: {detail}. Check that the uploader's key \
         is authorized on the server"
    )]
    PermissionDenied {
        user: String,
        host: String,
        detail: String,
    },

    /// A remote command ran but exited unsuccessfully.
    #[error("remote command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("remote command `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("unexpected remote output: {0}")]
    Protocol(String),

    #[error("transfer aborted")]
    Aborted,

    #[error("{0} is empty")]
    EmptyFile(PathBuf),

    /// The remote copy holds more bytes than the local file. It is left
    /// in place for an operator to inspect.
    #[error("remote file {path} is larger than the local file ({remote_size} > {local_size} bytes)")]
    RemoteLarger {
        path: String,
        remote_size: u64,
        local_size: u64,
    },
}
