//! In-memory remote endpoint for tests and dry runs.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::TransferError;
use crate::endpoint::{AppendSink, EndpointFuture, RemoteEndpoint};

/// Counters of what an endpoint was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Every remote command, whatever its kind.
    pub commands: u64,
    pub size_queries: u64,
    pub dirs_created: u64,
    pub streams_opened: u64,
    pub copies: u64,
    pub appends: u64,
    pub removes: u64,
    /// Payload bytes that crossed the wire (streamed or copied).
    pub bytes_received: u64,
}

#[derive(Default)]
struct State {
    files: HashMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    stats: EndpointStats,
    refuse: bool,
    deny: bool,
    fail_appends: bool,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`RemoteEndpoint`] that keeps remote files in a map.
///
/// Optional latency is applied to every command and every streamed chunk,
/// which lets tests observe transfers while they are in flight.
#[derive(Default)]
pub struct MemoryEndpoint {
    state: Arc<Mutex<State>>,
    latency: Duration,
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seeds a remote file.
    pub fn put_file(&self, path: &str, data: Vec<u8>) {
        lock(&self.state).files.insert(path.to_string(), data);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state).files.get(path).cloned()
    }

    pub fn file_size(&self, path: &str) -> Option<u64> {
        lock(&self.state).files.get(path).map(|f| f.len() as u64)
    }

    /// All remote file paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.state).files.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn has_dir(&self, dir: &str) -> bool {
        lock(&self.state).dirs.contains(dir)
    }

    pub fn stats(&self) -> EndpointStats {
        lock(&self.state).stats.clone()
    }

    /// Makes every following command fail as if the host were unreachable.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    /// Makes every following command fail authentication.
    pub fn deny_permission(&self, deny: bool) {
        lock(&self.state).deny = deny;
    }

    /// Makes remote appends exit with a non-zero status.
    pub fn fail_appends(&self, fail: bool) {
        lock(&self.state).fail_appends = fail;
    }

    async fn round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

/// Counts a command and applies the connection-level failure switches.
fn begin(state: &mut State) -> Result<(), TransferError> {
    state.stats.commands += 1;
    if state.refuse {
        return Err(TransferError::Refused {
            host: "memory".into(),
            detail: "connection refused".into(),
        });
    }
    if state.deny {
        return Err(TransferError::PermissionDenied {
            user: "mydata".into(),
            host: "memory".into(),
            detail: "permission denied (publickey)".into(),
        });
    }
    Ok(())
}

impl RemoteEndpoint for MemoryEndpoint {
    fn remote_size<'a>(&'a self, path: &'a str) -> EndpointFuture<'a, u64> {
        Box::pin(async move {
            self.round_trip().await;
            let mut s = lock(&self.state);
            begin(&mut s)?;
            s.stats.size_queries += 1;
            Ok(s.files.get(path).map(|f| f.len() as u64).unwrap_or(0))
        })
    }

    fn make_dir<'a>(&'a self, dir: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            self.round_trip().await;
            let mut s = lock(&self.state);
            begin(&mut s)?;
            s.stats.dirs_created += 1;
            s.dirs.insert(dir.to_string());
            Ok(())
        })
    }

    fn open_append<'a>(
        &'a self,
        path: &'a str,
        truncate: bool,
    ) -> EndpointFuture<'a, Box<dyn AppendSink>> {
        Box::pin(async move {
            self.round_trip().await;
            {
                let mut s = lock(&self.state);
                begin(&mut s)?;
                s.stats.streams_opened += 1;
                let file = s.files.entry(path.to_string()).or_default();
                if truncate {
                    file.clear();
                }
            }
            let sink: Box<dyn AppendSink> = Box::new(MemorySink {
                state: Arc::clone(&self.state),
                path: path.to_string(),
                latency: self.latency,
            });
            Ok(sink)
        })
    }

    fn copy_file<'a>(&'a self, local: &'a Path, remote: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            let data = tokio::fs::read(local).await?;
            self.round_trip().await;
            let mut s = lock(&self.state);
            begin(&mut s)?;
            s.stats.copies += 1;
            s.stats.bytes_received += data.len() as u64;
            s.files.insert(remote.to_string(), data);
            Ok(())
        })
    }

    fn append_file<'a>(&'a self, source: &'a str, dest: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            self.round_trip().await;
            let mut s = lock(&self.state);
            begin(&mut s)?;
            s.stats.appends += 1;
            if s.fail_appends {
                return Err(TransferError::CommandFailed {
                    command: format!("cat {source} >> {dest}"),
                    status: "exit status: 1".into(),
                    stderr: "No space left on device".into(),
                });
            }
            let Some(data) = s.files.get(source).cloned() else {
                return Err(TransferError::CommandFailed {
                    command: format!("cat {source} >> {dest}"),
                    status: "exit status: 1".into(),
                    stderr: format!("cat: {source}: No such file or directory"),
                });
            };
            s.files.entry(dest.to_string()).or_default().extend(data);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, path: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            self.round_trip().await;
            let mut s = lock(&self.state);
            begin(&mut s)?;
            s.stats.removes += 1;
            s.files.remove(path);
            Ok(())
        })
    }
}

struct MemorySink {
    state: Arc<Mutex<State>>,
    path: String,
    latency: Duration,
}

impl AppendSink for MemorySink {
    fn write_chunk<'a>(&'a mut self, data: &'a [u8]) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let mut s = lock(&self.state);
            if s.refuse {
                return Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "remote append command went away",
                )));
            }
            s.stats.bytes_received += data.len() as u64;
            s.files.entry(self.path.clone()).or_default().extend_from_slice(data);
            Ok(())
        })
    }

    fn finish(self: Box<Self>) -> EndpointFuture<'static, ()> {
        Box::pin(async move { Ok(()) })
    }
}
