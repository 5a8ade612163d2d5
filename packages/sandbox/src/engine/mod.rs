// ABOUTME: Engine adapter trait and the types exchanged with container engines
// ABOUTME: The orchestrator only reaches the container runtime through EngineAdapter

use crate::archive::ArchiveEntry;
use crate::templates::RuntimeTemplate;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod docker;
pub mod memory;

pub use docker::DockerEngine;
pub use memory::MemoryEngine;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Exec error: {0}")]
    ExecError(String),

    #[error("Copy error: {0}")]
    CopyError(String),

    #[error("Copy interrupted after {entries_written} entries: {reason}")]
    CopyInterrupted { entries_written: u64, reason: String },

    #[error("Engine operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Engine not available: {0}")]
    NotAvailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Opaque engine-side reference to a provisioned container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct EngineHandle(String);

impl EngineHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-sandbox settings layered on top of the template at provision time
#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub env_vars: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub env_vars: HashMap<String, String>,
    /// Capacity of the output channel handed back in the ExecStream
    pub buffer: usize,
}

impl ExecRequest {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
            user: None,
            env_vars: HashMap::new(),
            buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            stream: StreamType::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            stream: StreamType::Stderr,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecEvent {
    Output(OutputChunk),
    Exit(i64),
}

/// Live process attached to a container.
///
/// Dropping `input` closes the process's stdin. Output ends with an
/// `ExecEvent::Exit` unless the process is cancelled first, in which case the
/// channel closes without one. Cancelling `cancel` asks the engine to stop
/// pumping and tear the process down.
pub struct ExecStream {
    pub input: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::Receiver<ExecEvent>,
    pub cancel: CancellationToken,
}

/// Stream of entries flowing in or out of a container filesystem
pub type EntryStream = BoxStream<'static, Result<ArchiveEntry>>;

/// Entries an engine has applied so far during a copy-in.
///
/// Clones share the counter, so the caller can read progress while the copy runs.
#[derive(Debug, Clone, Default)]
pub struct CopyProgress(Arc<AtomicU64>);

impl CopyProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(&self, entries: u64) {
        self.0.store(entries, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Engine adapter trait for container runtimes
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Short engine name used in logs
    fn name(&self) -> &'static str;

    /// Check if the engine is reachable and usable
    async fn is_available(&self) -> Result<bool>;

    /// Create (but do not start) a container for the template
    async fn provision(
        &self,
        template: &RuntimeTemplate,
        options: &ProvisionOptions,
    ) -> Result<EngineHandle>;

    async fn start(&self, handle: &EngineHandle) -> Result<()>;

    /// Spawn a process inside a running container with attached stdio
    async fn exec(&self, handle: &EngineHandle, request: ExecRequest) -> Result<ExecStream>;

    /// Stream the subtree rooted at `path`. Entry paths are relative to `path`;
    /// when `path` names a single file the stream holds one entry named after it.
    async fn copy_out(&self, handle: &EngineHandle, path: &str) -> Result<EntryStream>;

    /// Write entries beneath `dest`, creating it and any intermediate directories.
    /// Returns the number of entries written; `progress` tracks them as they land.
    async fn copy_in(
        &self,
        handle: &EngineHandle,
        dest: &str,
        entries: EntryStream,
        progress: CopyProgress,
    ) -> Result<u64>;

    /// Stop the container, killing it once `timeout` has elapsed
    async fn stop(&self, handle: &EngineHandle, timeout: Duration) -> Result<()>;

    /// Remove the container and anything it owns
    async fn destroy(&self, handle: &EngineHandle) -> Result<()>;
}
