//! Remote endpoint abstraction.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::TransferError;

/// Boxed future returned by endpoint operations.
pub type EndpointFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// The remote primitives the transfer protocol relies on.
///
/// Each call maps to one remote command and must be atomic at that level:
/// a failed [`append_file`](Self::append_file) leaves the destination
/// untouched.
pub trait RemoteEndpoint: Send + Sync {
    /// Current byte count of `path`, 0 when it does not exist.
    fn remote_size<'a>(&'a self, path: &'a str) -> EndpointFuture<'a, u64>;

    /// Creates `dir` and its parents.
    fn make_dir<'a>(&'a self, dir: &'a str) -> EndpointFuture<'a, ()>;

    /// Starts a long-lived append command writing to `path`.
    ///
    /// With `truncate` the file is emptied first.
    fn open_append<'a>(
        &'a self,
        path: &'a str,
        truncate: bool,
    ) -> EndpointFuture<'a, Box<dyn AppendSink>>;

    /// Copies a local file to `remote`, replacing it.
    fn copy_file<'a>(&'a self, local: &'a Path, remote: &'a str) -> EndpointFuture<'a, ()>;

    /// Appends the content of remote file `source` to `dest`.
    fn append_file<'a>(&'a self, source: &'a str, dest: &'a str) -> EndpointFuture<'a, ()>;

    /// Removes a remote file. Missing files are not an error.
    fn remove<'a>(&'a self, path: &'a str) -> EndpointFuture<'a, ()>;
}

/// Input stream of a running remote append command.
pub trait AppendSink: Send {
    fn write_chunk<'a>(&'a mut self, data: &'a [u8]) -> EndpointFuture<'a, ()>;

    /// Closes the stream and waits for the remote command to exit.
    fn finish(self: Box<Self>) -> EndpointFuture<'static, ()>;
}

/// Quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parent directory of a `/`-separated remote path.
pub(crate) fn remote_parent(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}
