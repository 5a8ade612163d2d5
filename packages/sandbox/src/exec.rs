// ABOUTME: Exec session multiplexer running concurrent interactive commands in one sandbox
// ABOUTME: Each session pumps engine output into a single-reader stream and is cancellable on its own

use crate::engine::{EngineAdapter, ExecEvent, ExecRequest, OutputChunk, StreamType};
use crate::error::{Result, SandboxError};
use crate::ids::{SandboxId, SessionId};
use crate::registry::SandboxRegistry;
use crate::state::SandboxState;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn guard<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

/// Snapshot of an exec session
#[derive(Debug, Clone, Serialize)]
pub struct ExecSession {
    pub id: SessionId,
    pub sandbox_id: SandboxId,
    pub command: Vec<String>,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Set when the process exited on its own
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Chunk(OutputChunk),
    Exit { code: i64 },
    Cancelled,
}

/// Output of one session: chunks in production order, then exactly one
/// `Exit` or `Cancelled`, then the end of the stream.
pub struct OutputStream {
    session_id: SessionId,
    chunks: mpsc::Receiver<OutputChunk>,
    terminal: Arc<StdMutex<Option<OutputEvent>>>,
    finished: bool,
}

impl OutputStream {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn next_event(&mut self) -> Option<OutputEvent> {
        futures::StreamExt::next(self).await
    }

    /// Drain the stream to its end
    pub async fn collect_all(mut self) -> CollectedOutput {
        let mut collected = CollectedOutput::default();
        while let Some(event) = self.next_event().await {
            match event {
                OutputEvent::Chunk(chunk) => match chunk.stream {
                    StreamType::Stdout => collected.stdout.extend_from_slice(&chunk.data),
                    StreamType::Stderr => collected.stderr.extend_from_slice(&chunk.data),
                },
                OutputEvent::Exit { code } => collected.exit_code = Some(code),
                OutputEvent::Cancelled => collected.cancelled = true,
            }
        }
        collected
    }
}

impl Stream for OutputStream {
    type Item = OutputEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.chunks.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(OutputEvent::Chunk(chunk))),
            Poll::Ready(None) => {
                self.finished = true;
                let terminal = guard(&self.terminal)
                    .clone()
                    .unwrap_or(OutputEvent::Cancelled);
                Poll::Ready(Some(terminal))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CollectedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i64>,
    pub cancelled: bool,
}

impl CollectedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

struct SessionEntry {
    info: StdMutex<ExecSession>,
    input: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    output: StdMutex<Option<OutputStream>>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionEntry {
    fn snapshot(&self) -> ExecSession {
        guard(&self.info).clone()
    }

    fn state(&self) -> SessionState {
        guard(&self.info).state
    }

    fn finish(&self, exit_code: Option<i64>) {
        let mut info = guard(&self.info);
        if info.state != SessionState::Closed {
            info.state = SessionState::Closed;
            info.closed_at = Some(Utc::now());
            info.exit_code = exit_code;
        }
    }
}

/// Forward engine events to the session's reader until exit or cancellation
async fn pump(
    entry: Arc<SessionEntry>,
    mut events: mpsc::Receiver<ExecEvent>,
    chunks: mpsc::Sender<OutputChunk>,
    terminal: Arc<StdMutex<Option<OutputEvent>>>,
) {
    let cancel = entry.cancel.clone();
    let mut reader_gone = false;

    let outcome = loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break OutputEvent::Cancelled,
            event = events.recv() => event,
        };

        match event {
            Some(ExecEvent::Output(chunk)) => {
                if reader_gone {
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break OutputEvent::Cancelled,
                    sent = chunks.send(chunk) => reader_gone = sent.is_err(),
                }
            }
            Some(ExecEvent::Exit(code)) => break OutputEvent::Exit { code },
            None => break OutputEvent::Cancelled,
        }
    };

    let exit_code = match &outcome {
        OutputEvent::Exit { code } => Some(*code),
        _ => None,
    };
    *guard(&terminal) = Some(outcome);
    entry.finish(exit_code);
    entry.input.lock().await.take();
    // Tear down the engine side too when the process exited by itself
    cancel.cancel();
    drop(chunks);

    debug!("Session {} finished (exit code: {:?})", guard(&entry.info).id, exit_code);
}

pub struct SessionMultiplexer {
    registry: Arc<SandboxRegistry>,
    engine: Arc<dyn EngineAdapter>,
    buffer: usize,
    close_timeout: Duration,
    sessions: RwLock<HashMap<SandboxId, HashMap<SessionId, Arc<SessionEntry>>>>,
    owners: RwLock<HashMap<SessionId, SandboxId>>,
}

impl SessionMultiplexer {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        engine: Arc<dyn EngineAdapter>,
        buffer: usize,
        close_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            engine,
            buffer: buffer.max(1),
            close_timeout,
            sessions: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, session_id: &SessionId) -> Result<Arc<SessionEntry>> {
        let sandbox_id = self
            .owners
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.clone()))?;
        self.sessions
            .read()
            .await
            .get(&sandbox_id)
            .and_then(|sessions| sessions.get(session_id))
            .cloned()
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.clone()))
    }

    async fn entries_of(&self, sandbox_id: &SandboxId) -> Vec<Arc<SessionEntry>> {
        self.sessions
            .read()
            .await
            .get(sandbox_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Start `command` in a running sandbox
    pub async fn open_session(
        &self,
        sandbox_id: &SandboxId,
        command: Vec<String>,
    ) -> Result<ExecSession> {
        if command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(SandboxError::InvalidCommand(
                "command must name a program".to_string(),
            ));
        }

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

        let request = ExecRequest {
            command: command.clone(),
            working_dir: Some(sandbox.template.working_dir.clone()),
            user: sandbox.template.user.clone(),
            env_vars: HashMap::new(),
            buffer: self.buffer,
        };
        let stream = self
            .engine
            .exec(&handle, request)
            .await
            .map_err(|e| SandboxError::engine(SandboxState::Running, e))?;

        let session_id = SessionId::generate();
        let (chunk_tx, chunk_rx) = mpsc::channel(self.buffer);
        let terminal = Arc::new(StdMutex::new(None));
        let entry = Arc::new(SessionEntry {
            info: StdMutex::new(ExecSession {
                id: session_id.clone(),
                sandbox_id: sandbox_id.clone(),
                command,
                state: SessionState::Active,
                opened_at: Utc::now(),
                closed_at: None,
                exit_code: None,
            }),
            input: Mutex::new(Some(stream.input)),
            output: StdMutex::new(Some(OutputStream {
                session_id: session_id.clone(),
                chunks: chunk_rx,
                terminal: terminal.clone(),
                finished: false,
            })),
            cancel: stream.cancel,
            pump: Mutex::new(None),
        });

        let task = tokio::spawn(pump(entry.clone(), stream.output, chunk_tx, terminal));
        *entry.pump.lock().await = Some(task);

        self.sessions
            .write()
            .await
            .entry(sandbox_id.clone())
            .or_default()
            .insert(session_id.clone(), entry.clone());
        self.owners
            .write()
            .await
            .insert(session_id.clone(), sandbox_id.clone());

        // A stop that began after the first check has already swept the table
        let state = self.registry.state(sandbox_id).await?;
        if state != SandboxState::Running {
            self.close_entry(&entry).await;
            self.unregister(sandbox_id, &session_id).await;
            return Err(not_running(state));
        }

        let _ = self.registry.touch(sandbox_id).await;
        info!("Opened session {} in sandbox {}", session_id, sandbox_id);
        Ok(entry.snapshot())
    }

    /// Forward bytes to the process's stdin
    pub async fn write(&self, session_id: &SessionId, data: impl Into<Vec<u8>>) -> Result<()> {
        let entry = self.entry(session_id).await?;
        if entry.state() != SessionState::Active {
            return Err(SandboxError::SessionClosed(session_id.clone()));
        }

        let input = entry.input.lock().await;
        let sender = input
            .as_ref()
            .ok_or_else(|| SandboxError::SessionClosed(session_id.clone()))?;
        sender
            .send(data.into())
            .await
            .map_err(|_| SandboxError::SessionClosed(session_id.clone()))?;
        drop(input);

        let sandbox_id = guard(&entry.info).sandbox_id.clone();
        let _ = self.registry.touch(&sandbox_id).await;
        Ok(())
    }

    /// Close the process's stdin; later writes fail with `SessionClosed`
    pub async fn close_input(&self, session_id: &SessionId) -> Result<()> {
        let entry = self.entry(session_id).await?;
        entry.input.lock().await.take();
        Ok(())
    }

    /// Take the session's output stream. There is only one.
    pub async fn read_output(&self, session_id: &SessionId) -> Result<OutputStream> {
        let entry = self.entry(session_id).await?;
        let stream = guard(&entry.output).take();
        stream.ok_or_else(|| SandboxError::OutputAlreadyTaken(session_id.clone()))
    }

    /// Cancel the process and wait for the session to wind down. Idempotent.
    pub async fn close_session(&self, session_id: &SessionId) -> Result<()> {
        let entry = self.entry(session_id).await?;
        self.close_entry(&entry).await;
        Ok(())
    }

    async fn close_entry(&self, entry: &SessionEntry) {
        {
            let mut info = guard(&entry.info);
            if info.state == SessionState::Closed {
                return;
            }
            info.state = SessionState::Closing;
        }

        entry.cancel.cancel();
        entry.input.lock().await.take();

        let task = entry.pump.lock().await.take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.close_timeout, &mut task).await.is_err() {
                warn!(
                    "Session {} did not wind down within {:?}, aborting",
                    guard(&entry.info).id,
                    self.close_timeout
                );
                task.abort();
            }
        }
        entry.finish(None);
        debug!("Closed session {}", guard(&entry.info).id);
    }

    /// Force-close every session of a sandbox. Returns how many were still open.
    pub async fn cancel_all(&self, sandbox_id: &SandboxId) -> usize {
        let open: Vec<_> = self
            .entries_of(sandbox_id)
            .await
            .into_iter()
            .filter(|entry| entry.state() != SessionState::Closed)
            .collect();

        futures::future::join_all(open.iter().map(|entry| self.close_entry(entry))).await;
        if !open.is_empty() {
            info!("Cancelled {} session(s) of sandbox {}", open.len(), sandbox_id);
        }
        open.len()
    }

    pub async fn session_state(&self, session_id: &SessionId) -> Result<SessionState> {
        Ok(self.entry(session_id).await?.state())
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Result<ExecSession> {
        Ok(self.entry(session_id).await?.snapshot())
    }

    /// Sessions of a sandbox, oldest first
    pub async fn list_sessions(&self, sandbox_id: &SandboxId) -> Vec<ExecSession> {
        let mut sessions: Vec<_> = self
            .entries_of(sandbox_id)
            .await
            .iter()
            .map(|entry| entry.snapshot())
            .collect();
        sessions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Sessions that are not yet `Closed`
    pub async fn active_sessions(&self, sandbox_id: &SandboxId) -> usize {
        self.entries_of(sandbox_id)
            .await
            .iter()
            .filter(|entry| entry.state() != SessionState::Closed)
            .count()
    }

    async fn unregister(&self, sandbox_id: &SandboxId, session_id: &SessionId) {
        if let Some(sessions) = self.sessions.write().await.get_mut(sandbox_id) {
            sessions.remove(session_id);
        }
        self.owners.write().await.remove(session_id);
    }

    /// Drop all bookkeeping for a reclaimed sandbox
    pub async fn forget_sandbox(&self, sandbox_id: &SandboxId) {
        let removed = self.sessions.write().await.remove(sandbox_id);
        if let Some(sessions) = removed {
            let mut owners = self.owners.write().await;
            for session_id in sessions.keys() {
                owners.remove(session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineHandle, MemoryEngine, ProvisionOptions};
    use crate::registry::Sandbox;
    use crate::templates::RuntimeTemplate;

    fn cmd(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    async fn running_sandbox(
        engine: Arc<MemoryEngine>,
    ) -> (SessionMultiplexer, Arc<SandboxRegistry>, SandboxId, EngineHandle) {
        let registry = Arc::new(SandboxRegistry::new(64));
        let template = Arc::new(RuntimeTemplate::new("node", "node:20-alpine", "/app"));
        let handle = engine
            .provision(&template, &ProvisionOptions::default())
            .await
            .unwrap();
        engine.start(&handle).await.unwrap();

        let id = SandboxId::generate();
        registry.insert(Sandbox::new(id.clone(), template)).await;
        for (from, to) in [
            (SandboxState::Requested, SandboxState::Provisioning),
            (SandboxState::Provisioning, SandboxState::Starting),
        ] {
            registry.compare_and_swap(&id, from, to, |_| {}).await.unwrap();
        }
        let engine_handle = handle.clone();
        registry
            .compare_and_swap(&id, SandboxState::Starting, SandboxState::Running, move |s| {
                s.engine_handle = Some(engine_handle)
            })
            .await
            .unwrap();

        let mux = SessionMultiplexer::new(registry.clone(), engine, 8, Duration::from_secs(2));
        (mux, registry, id, handle)
    }

    #[tokio::test]
    async fn test_session_output_and_exit() {
        let engine = Arc::new(MemoryEngine::new().with_script("node -v", "v20.11.1\n", 0));
        let (mux, _, id, _) = running_sandbox(engine).await;

        let session = mux.open_session(&id, cmd("node -v")).await.unwrap();
        assert_eq!(session.state, SessionState::Active);

        let output = mux.read_output(&session.id).await.unwrap().collect_all().await;
        assert_eq!(output.stdout_lossy(), "v20.11.1\n");
        assert_eq!(output.exit_code, Some(0));
        assert!(!output.cancelled);

        let session = mux.get_session(&session.id).await.unwrap();
        assert_eq!(session.state, SessionState::Closed);
        assert_eq!(session.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_sessions_run_in_template_working_dir() {
        let engine = Arc::new(MemoryEngine::new());
        let (mux, _, id, _) = running_sandbox(engine).await;
        let session = mux.open_session(&id, cmd("pwd")).await.unwrap();
        let output = mux.read_output(&session.id).await.unwrap().collect_all().await;
        assert_eq!(output.stdout_lossy(), "/app\n");
    }

    #[tokio::test]
    async fn test_interactive_input() {
        let engine = Arc::new(MemoryEngine::new());
        let (mux, _, id, _) = running_sandbox(engine).await;

        let session = mux.open_session(&id, cmd("cat")).await.unwrap();
        let mut output = mux.read_output(&session.id).await.unwrap();

        mux.write(&session.id, "hello\n").await.unwrap();
        match output.next_event().await {
            Some(OutputEvent::Chunk(chunk)) => assert_eq!(chunk.data, b"hello\n"),
            other => panic!("unexpected event: {:?}", other),
        }

        mux.close_input(&session.id).await.unwrap();
        assert_eq!(output.next_event().await, Some(OutputEvent::Exit { code: 0 }));
        assert_eq!(output.next_event().await, None);

        let err = mux.write(&session.id, "late").await.unwrap_err();
        assert!(matches!(err, SandboxError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn test_output_has_single_reader() {
        let engine = Arc::new(MemoryEngine::new());
        let (mux, _, id, _) = running_sandbox(engine).await;
        let session = mux.open_session(&id, cmd("true")).await.unwrap();

        let _first = mux.read_output(&session.id).await.unwrap();
        let err = mux.read_output(&session.id).await.err().unwrap();
        assert!(matches!(err, SandboxError::OutputAlreadyTaken(_)));
    }

    #[tokio::test]
    async fn test_close_session_cancels_and_is_idempotent() {
        let engine = Arc::new(MemoryEngine::new());
        let (mux, _, id, _) = running_sandbox(engine).await;

        let session = mux.open_session(&id, cmd("sleep 3600")).await.unwrap();
        let output = mux.read_output(&session.id).await.unwrap();
        assert_eq!(mux.active_sessions(&id).await, 1);

        mux.close_session(&session.id).await.unwrap();
        mux.close_session(&session.id).await.unwrap();

        assert_eq!(mux.session_state(&session.id).await.unwrap(), SessionState::Closed);
        assert_eq!(mux.active_sessions(&id).await, 0);
        let collected = output.collect_all().await;
        assert!(collected.cancelled);
        assert_eq!(collected.exit_code, None);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let engine = Arc::new(MemoryEngine::new());
        let (mux, _, id, _) = running_sandbox(engine).await;

        let long = mux.open_session(&id, cmd("sleep 3600")).await.unwrap();
        let short = mux.open_session(&id, cmd("echo done")).await.unwrap();

        mux.close_session(&long.id).await.unwrap();
        let output = mux.read_output(&short.id).await.unwrap().collect_all().await;
        assert_eq!(output.stdout_lossy(), "done\n");
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(mux.list_sessions(&id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_all_closes_every_session() {
        let engine = Arc::new(MemoryEngine::new());
        let (mux, _, id, _) = running_sandbox(engine).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(mux.open_session(&id, cmd("sleep 3600")).await.unwrap().id);
        }
        assert_eq!(mux.cancel_all(&id).await, 3);
        for session_id in &ids {
            assert_eq!(mux.session_state(session_id).await.unwrap(), SessionState::Closed);
        }
        assert_eq!(mux.cancel_all(&id).await, 0);
    }

    #[tokio::test]
    async fn test_open_requires_running_sandbox() {
        let engine = Arc::new(MemoryEngine::new());
        let (mux, registry, id, _) = running_sandbox(engine).await;
        registry
            .compare_and_swap(&id, SandboxState::Running, SandboxState::Stopping, |_| {})
            .await
            .unwrap();

        let err = mux.open_session(&id, cmd("true")).await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::SandboxNotRunning {
                state: SandboxState::Stopping,
                ..
            }
        ));
        assert_eq!(err.last_known_state(), Some(SandboxState::Stopping));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let engine = Arc::new(MemoryEngine::new());
        let (mux, _, id, _) = running_sandbox(engine).await;
        assert!(matches!(
            mux.open_session(&id, Vec::new()).await,
            Err(SandboxError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let engine = Arc::new(MemoryEngine::new());
        let (mux, _, _, _) = running_sandbox(engine).await;
        let missing = SessionId::from("ses-missing");
        assert!(matches!(
            mux.write(&missing, "x").await,
            Err(SandboxError::SessionNotFound(_))
        ));
        assert!(matches!(
            mux.close_session(&missing).await,
            Err(SandboxError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_engine_stop_surfaces_as_cancelled() {
        let engine = Arc::new(MemoryEngine::new());
        let (mux, _, id, handle) = running_sandbox(engine.clone()).await;

        let session = mux.open_session(&id, cmd("sleep 3600")).await.unwrap();
        let output = mux.read_output(&session.id).await.unwrap();
        engine.stop(&handle, Duration::from_secs(1)).await.unwrap();

        let collected = output.collect_all().await;
        assert!(collected.cancelled);
        assert_eq!(mux.session_state(&session.id).await.unwrap(), SessionState::Closed);
    }
}
