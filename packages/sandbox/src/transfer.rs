// ABOUTME: Filesystem gateway moving directory trees into and out of sandboxes as archives
// ABOUTME: Every transfer is tracked as a job so stop can fail it and reclaim can refuse while it runs

use crate::archive::{normalize_entries, ArchiveCodec, ArchiveEntry, ArchiveError};
use crate::engine::{CopyProgress, EngineAdapter, EngineError, EngineHandle};
use crate::error::{Result, SandboxError};
use crate::ids::{SandboxId, TransferId};
use crate::registry::SandboxRegistry;
use crate::state::SandboxState;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CANCELLED_REASON: &str = "sandbox is stopping";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Import,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Streaming,
    Done,
    Failed,
}

impl TransferStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Streaming)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    pub id: TransferId,
    pub sandbox_id: SandboxId,
    pub direction: TransferDirection,
    pub source_path: String,
    pub dest_path: String,
    pub status: TransferStatus,
    /// Entries moved so far
    pub entries: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub transfer_id: TransferId,
    pub entries_written: u64,
}

struct TransferEntry {
    job: StdMutex<TransferJob>,
    cancel: CancellationToken,
    progress: CopyProgress,
}

impl TransferEntry {
    fn job(&self) -> MutexGuard<'_, TransferJob> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entries moved so far, counting what the engine applied before being interrupted
    fn entries(&self) -> u64 {
        self.job().entries.max(self.progress.get())
    }

    fn snapshot(&self) -> TransferJob {
        let mut job = self.job().clone();
        job.entries = job.entries.max(self.progress.get());
        job
    }

    fn cancelled(&self) -> SandboxError {
        SandboxError::TransferIncomplete {
            entries_written: self.entries(),
            reason: CANCELLED_REASON.to_string(),
        }
    }

    /// Record the outcome unless the job was already failed from outside
    fn settle<T>(&self, result: &Result<T>) {
        let mut job = self.job();
        if !job.status.is_active() {
            return;
        }
        job.finished_at = Some(Utc::now());
        match result {
            Ok(_) => job.status = TransferStatus::Done,
            Err(e) => {
                job.status = TransferStatus::Failed;
                job.error = Some(e.to_string());
            }
        }
    }
}

fn archive_error(err: ArchiveError) -> SandboxError {
    match err {
        ArchiveError::InvalidPath { path, reason } => SandboxError::InvalidPath { path, reason },
        ArchiveError::Io(e) => SandboxError::InvalidArchive(e.to_string()),
    }
}

fn copy_error(err: EngineError) -> SandboxError {
    match err {
        EngineError::CopyInterrupted {
            entries_written,
            reason,
        } => SandboxError::TransferIncomplete {
            entries_written,
            reason,
        },
        other => SandboxError::engine(SandboxState::Running, other),
    }
}

/// Resolve a path given by a caller against the sandbox's working directory
fn sandbox_path(working_dir: &str, path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(SandboxError::InvalidPath {
            path: path.replace('\0', "\\0"),
            reason: "NUL byte in path".to_string(),
        });
    }

    let path = path.trim();
    let resolved = if path.is_empty() || path == "." {
        working_dir.to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", working_dir.trim_end_matches('/'), path)
    };

    let trimmed = resolved.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}

pub struct FilesystemGateway {
    registry: Arc<SandboxRegistry>,
    engine: Arc<dyn EngineAdapter>,
    codec: Arc<dyn ArchiveCodec>,
    transfers: RwLock<HashMap<SandboxId, HashMap<TransferId, Arc<TransferEntry>>>>,
    owners: RwLock<HashMap<TransferId, SandboxId>>,
}

impl FilesystemGateway {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        engine: Arc<dyn EngineAdapter>,
        codec: Arc<dyn ArchiveCodec>,
    ) -> Self {
        Self {
            registry,
            engine,
            codec,
            transfers: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
        }
    }

    pub fn codec(&self) -> &Arc<dyn ArchiveCodec> {
        &self.codec
    }

    /// Register a job against a running sandbox and resolve its paths
    async fn begin(
        &self,
        sandbox_id: &SandboxId,
        direction: TransferDirection,
        source_path: &str,
        dest_path: &str,
    ) -> Result<(Arc<TransferEntry>, EngineHandle)> {
        let sandbox = self.registry.lookup(sandbox_id).await?;
        let not_running = |state| SandboxError::SandboxNotRunning {
            id: sandbox_id.clone(),
            state,
        };
        if sandbox.state != SandboxState::Running {
            return Err(not_running(sandbox.state));
        }
        let handle = sandbox
            .engine_handle
            .clone()
            .ok_or_else(|| not_running(sandbox.state))?;

        let working_dir = &sandbox.template.working_dir;
        let (source_path, dest_path) = match direction {
            TransferDirection::Export => (
                sandbox_path(working_dir, source_path)?,
                dest_path.to_string(),
            ),
            TransferDirection::Import => (
                source_path.to_string(),
                sandbox_path(working_dir, dest_path)?,
            ),
        };

        let id = TransferId::generate();
        let entry = Arc::new(TransferEntry {
            job: StdMutex::new(TransferJob {
                id: id.clone(),
                sandbox_id: sandbox_id.clone(),
                direction,
                source_path,
                dest_path,
                status: TransferStatus::Pending,
                entries: 0,
                error: None,
                started_at: Utc::now(),
                finished_at: None,
            }),
            cancel: CancellationToken::new(),
            progress: CopyProgress::new(),
        });

        self.transfers
            .write()
            .await
            .entry(sandbox_id.clone())
            .or_default()
            .insert(id.clone(), entry.clone());
        self.owners.write().await.insert(id, sandbox_id.clone());

        // Stop may have swept the table between the first check and registration
        let state = self.registry.state(sandbox_id).await?;
        if state != SandboxState::Running {
            let err = not_running(state);
            entry.settle::<()>(&Err(not_running(state)));
            return Err(err);
        }

        let _ = self.registry.touch(sandbox_id).await;
        Ok((entry, handle))
    }

    async fn pull_entries(
        &self,
        transfer: &TransferEntry,
        handle: &EngineHandle,
    ) -> Result<Vec<ArchiveEntry>> {
        let source = {
            let mut job = transfer.job();
            job.status = TransferStatus::Streaming;
            job.source_path.clone()
        };

        let mut stream = tokio::select! {
            biased;
            _ = transfer.cancel.cancelled() => return Err(transfer.cancelled()),
            stream = self.engine.copy_out(handle, &source) => stream.map_err(copy_error)?,
        };

        let mut entries = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = transfer.cancel.cancelled() => return Err(transfer.cancelled()),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(entry)) => {
                    entries.push(entry);
                    transfer.job().entries += 1;
                }
                Some(Err(e)) => return Err(copy_error(e)),
                None => break,
            }
        }

        normalize_entries(entries).map_err(archive_error)
    }

    async fn push_entries(
        &self,
        transfer: &TransferEntry,
        handle: &EngineHandle,
        entries: Vec<ArchiveEntry>,
    ) -> Result<u64> {
        let dest = {
            let mut job = transfer.job();
            job.status = TransferStatus::Streaming;
            job.dest_path.clone()
        };

        let stream = futures::stream::iter(entries.into_iter().map(Ok)).boxed();
        let written = tokio::select! {
            biased;
            _ = transfer.cancel.cancelled() => return Err(transfer.cancelled()),
            written = self.engine.copy_in(handle, &dest, stream, transfer.progress.clone()) => {
                written.map_err(copy_error)?
            }
        };

        transfer.job().entries = written;
        Ok(written)
    }

    /// Entries of the subtree at `path`, normalized and ordered parents first
    pub async fn export_entries(
        &self,
        sandbox_id: &SandboxId,
        path: &str,
    ) -> Result<Vec<ArchiveEntry>> {
        let (transfer, handle) = self
            .begin(sandbox_id, TransferDirection::Export, path, "")
            .await?;
        let result = self.pull_entries(&transfer, &handle).await;
        self.finish(&transfer, &result);
        result
    }

    /// Pack the subtree at `path` into an archive
    pub async fn export(&self, sandbox_id: &SandboxId, path: &str) -> Result<Vec<u8>> {
        let (transfer, handle) = self
            .begin(sandbox_id, TransferDirection::Export, path, "")
            .await?;
        let result = match self.pull_entries(&transfer, &handle).await {
            Ok(entries) => self.codec.pack(&entries).map_err(archive_error),
            Err(e) => Err(e),
        };
        self.finish(&transfer, &result);
        result
    }

    /// Unpack `archive` beneath `dest_path`, creating intermediate directories
    pub async fn import(
        &self,
        sandbox_id: &SandboxId,
        archive: &[u8],
        dest_path: &str,
    ) -> Result<ImportReport> {
        let entries = self.codec.unpack(archive).map_err(archive_error)?;
        self.import_entries(sandbox_id, entries, dest_path).await
    }

    pub async fn import_entries(
        &self,
        sandbox_id: &SandboxId,
        entries: Vec<ArchiveEntry>,
        dest_path: &str,
    ) -> Result<ImportReport> {
        let entries = normalize_entries(entries).map_err(archive_error)?;
        let source = format!("<{} entries>", entries.len());
        let (transfer, handle) = self
            .begin(sandbox_id, TransferDirection::Import, &source, dest_path)
            .await?;

        let result = self.push_entries(&transfer, &handle, entries).await;
        self.finish(&transfer, &result);
        let transfer_id = transfer.job().id.clone();
        Ok(ImportReport {
            transfer_id,
            entries_written: result?,
        })
    }

    fn finish<T>(&self, transfer: &TransferEntry, result: &Result<T>) {
        transfer.settle(result);
        let job = transfer.job();
        match &job.error {
            None => info!(
                "Transfer {} ({:?}) for sandbox {} done: {} entries",
                job.id, job.direction, job.sandbox_id, job.entries
            ),
            Some(error) => warn!(
                "Transfer {} ({:?}) for sandbox {} failed after {} entries: {}",
                job.id, job.direction, job.sandbox_id, job.entries, error
            ),
        }
    }

    async fn entries_of(&self, sandbox_id: &SandboxId) -> Vec<Arc<TransferEntry>> {
        self.transfers
            .read()
            .await
            .get(sandbox_id)
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail and cancel every active transfer of a sandbox. Returns how many were active.
    pub async fn fail_all(&self, sandbox_id: &SandboxId) -> usize {
        let mut failed = 0;
        for transfer in self.entries_of(sandbox_id).await {
            {
                let mut job = transfer.job();
                if !job.status.is_active() {
                    continue;
                }
                job.entries = job.entries.max(transfer.progress.get());
                job.status = TransferStatus::Failed;
                job.error = Some(
                    SandboxError::TransferIncomplete {
                        entries_written: job.entries,
                        reason: CANCELLED_REASON.to_string(),
                    }
                    .to_string(),
                );
                job.finished_at = Some(Utc::now());
            }
            transfer.cancel.cancel();
            failed += 1;
        }
        if failed > 0 {
            debug!("Failed {} transfer(s) of sandbox {}", failed, sandbox_id);
        }
        failed
    }

    pub async fn active_transfers(&self, sandbox_id: &SandboxId) -> usize {
        self.entries_of(sandbox_id)
            .await
            .iter()
            .filter(|transfer| transfer.job().status.is_active())
            .count()
    }

    pub async fn transfer_status(&self, transfer_id: &TransferId) -> Result<TransferJob> {
        let not_found = || SandboxError::TransferNotFound(transfer_id.clone());
        let sandbox_id = self
            .owners
            .read()
            .await
            .get(transfer_id)
            .cloned()
            .ok_or_else(not_found)?;
        let transfers = self.transfers.read().await;
        let transfer = transfers
            .get(&sandbox_id)
            .and_then(|jobs| jobs.get(transfer_id))
            .ok_or_else(not_found)?;
        Ok(transfer.snapshot())
    }

    /// Jobs of a sandbox, oldest first
    pub async fn list_transfers(&self, sandbox_id: &SandboxId) -> Vec<TransferJob> {
        let mut jobs: Vec<_> = self
            .entries_of(sandbox_id)
            .await
            .iter()
            .map(|transfer| transfer.snapshot())
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Drop all bookkeeping for a reclaimed sandbox
    pub async fn forget_sandbox(&self, sandbox_id: &SandboxId) {
        let removed = self.transfers.write().await.remove(sandbox_id);
        if let Some(jobs) = removed {
            let mut owners = self.owners.write().await;
            for id in jobs.keys() {
                owners.remove(id);
            }
        }
    }
}
