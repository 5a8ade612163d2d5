// ABOUTME: In-process engine with a virtual filesystem and a handful of builtin commands
// ABOUTME: Supports scripted command output and fault injection for exercising failure paths

use super::{
    CopyProgress, EngineAdapter, EngineError, EngineHandle, EntryStream, ExecEvent, ExecRequest,
    ExecStream, OutputChunk, ProvisionOptions, Result,
};
use crate::archive::{normalize_path, ArchiveEntry, EntryKind};
use crate::templates::RuntimeTemplate;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
enum FsNode {
    Dir { mode: u32 },
    File { mode: u32, content: Vec<u8> },
    Symlink { target: String },
}

struct Container {
    template: String,
    working_dir: String,
    running: bool,
    fs: BTreeMap<String, FsNode>,
    /// Parent token of every process exec'd in this container
    processes: CancellationToken,
}

#[derive(Default)]
struct Containers {
    by_id: HashMap<String, Container>,
    next_id: u64,
    exec_log: Vec<Vec<String>>,
}

type Shared = Arc<Mutex<Containers>>;

fn lock(shared: &Mutex<Containers>) -> MutexGuard<'_, Containers> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Canned output for a command line, matched on the space-joined argv
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
    pub delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_provision: HashSet<String>,
    fail_start: HashSet<String>,
    hang_stop: bool,
    fail_stop: bool,
    fail_destroy: bool,
    fail_copy_in_after: Option<u64>,
    hang_copy_in_after: Option<u64>,
    provision_delay: Option<Duration>,
}

/// Engine that keeps containers in memory. Commands run as tokio tasks.
#[derive(Default)]
pub struct MemoryEngine {
    containers: Shared,
    scripts: Arc<HashMap<String, ScriptedResponse>>,
    faults: Faults,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command_line` with fixed stdout and exit code instead of running a builtin
    pub fn with_script(self, command_line: &str, stdout: impl Into<Vec<u8>>, exit_code: i64) -> Self {
        self.with_scripted_response(
            command_line,
            ScriptedResponse {
                stdout: stdout.into(),
                exit_code,
                ..Default::default()
            },
        )
    }

    pub fn with_scripted_response(mut self, command_line: &str, response: ScriptedResponse) -> Self {
        Arc::make_mut(&mut self.scripts).insert(command_line.to_string(), response);
        self
    }

    /// Make provisioning fail for sandboxes of the named template
    pub fn fail_provision_for(mut self, template: &str) -> Self {
        self.faults.fail_provision.insert(template.to_string());
        self
    }

    pub fn fail_start_for(mut self, template: &str) -> Self {
        self.faults.fail_start.insert(template.to_string());
        self
    }

    /// Make stop never return
    pub fn hang_stop(mut self) -> Self {
        self.faults.hang_stop = true;
        self
    }

    pub fn fail_stop(mut self) -> Self {
        self.faults.fail_stop = true;
        self
    }

    pub fn fail_destroy(mut self) -> Self {
        self.faults.fail_destroy = true;
        self
    }

    /// Interrupt copy-in once `entries` entries have been written
    pub fn fail_copy_in_after(mut self, entries: u64) -> Self {
        self.faults.fail_copy_in_after = Some(entries);
        self
    }

    /// Park copy-in forever once `entries` entries have been written
    pub fn hang_copy_in_after(mut self, entries: u64) -> Self {
        self.faults.hang_copy_in_after = Some(entries);
        self
    }

    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.faults.provision_delay = Some(delay);
        self
    }

    pub fn container_count(&self) -> usize {
        lock(&self.containers).by_id.len()
    }

    pub fn is_running(&self, handle: &EngineHandle) -> bool {
        lock(&self.containers)
            .by_id
            .get(handle.as_str())
            .is_some_and(|c| c.running)
    }

    /// Contents of a regular file inside a container
    pub fn read_file(&self, handle: &EngineHandle, path: &str) -> Option<Vec<u8>> {
        let state = lock(&self.containers);
        let container = state.by_id.get(handle.as_str())?;
        match container.fs.get(&resolve("/", path)) {
            Some(FsNode::File { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }

    /// Create or replace a regular file inside a container, creating parent directories
    pub fn write_file(&self, handle: &EngineHandle, path: &str, content: impl Into<Vec<u8>>) -> Result<()> {
        let mut state = lock(&self.containers);
        let container = state
            .by_id
            .get_mut(handle.as_str())
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
        let path = resolve("/", path);
        mkdir_p(&mut container.fs, parent_of(&path))?;
        container.fs.insert(
            path,
            FsNode::File {
                mode: 0o644,
                content: content.into(),
            },
        );
        Ok(())
    }

    /// Every argv passed to `exec`, in call order
    pub fn executed_commands(&self) -> Vec<Vec<String>> {
        lock(&self.containers).exec_log.clone()
    }

    fn template_of(&self, handle: &EngineHandle) -> Result<String> {
        lock(&self.containers)
            .by_id
            .get(handle.as_str())
            .map(|c| c.template.clone())
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))
    }
}

#[async_trait]
impl EngineAdapter for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn provision(
        &self,
        template: &RuntimeTemplate,
        options: &ProvisionOptions,
    ) -> Result<EngineHandle> {
        if let Some(delay) = self.faults.provision_delay {
            tokio::time::sleep(delay).await;
        }
        if self.faults.fail_provision.contains(&template.name) {
            return Err(EngineError::ImageError(format!(
                "pull access denied for {}",
                template.image_ref
            )));
        }

        let mut fs = BTreeMap::new();
        mkdir_p(&mut fs, &template.working_dir)?;

        let mut state = lock(&self.containers);
        state.next_id += 1;
        let id = format!("mem-{:04}", state.next_id);
        state.by_id.insert(
            id.clone(),
            Container {
                template: template.name.clone(),
                working_dir: template.working_dir.clone(),
                running: false,
                fs,
                processes: CancellationToken::new(),
            },
        );

        debug!("Provisioned in-memory container {} ({})", id, options.name);
        Ok(EngineHandle::new(id))
    }

    async fn start(&self, handle: &EngineHandle) -> Result<()> {
        let template = self.template_of(handle)?;
        if self.faults.fail_start.contains(&template) {
            return Err(EngineError::ContainerError(format!(
                "container {} exited during startup",
                handle
            )));
        }

        let mut state = lock(&self.containers);
        let container = state
            .by_id
            .get_mut(handle.as_str())
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
        if container.processes.is_cancelled() {
            container.processes = CancellationToken::new();
        }
        container.running = true;
        Ok(())
    }

    async fn exec(&self, handle: &EngineHandle, request: ExecRequest) -> Result<ExecStream> {
        let (cwd, processes) = {
            let mut state = lock(&self.containers);
            let container = state
                .by_id
                .get(handle.as_str())
                .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
            if !container.running {
                return Err(EngineError::ExecError(format!(
                    "container {} is not running",
                    handle
                )));
            }
            let cwd = request
                .working_dir
                .clone()
                .unwrap_or_else(|| container.working_dir.clone());
            let processes = container.processes.clone();
            state.exec_log.push(request.command.clone());
            (cwd, processes)
        };

        if request.command.is_empty() {
            return Err(EngineError::ExecError("empty command".to_string()));
        }

        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(request.buffer.max(1));
        let cancel = processes.child_token();

        let process = Process {
            containers: self.containers.clone(),
            scripts: self.scripts.clone(),
            container_id: handle.as_str().to_string(),
            cwd,
            argv: request.command,
        };
        let token = cancel.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                _ = token.cancelled() => None,
                code = process.run(&out_tx, in_rx) => Some(code),
            };
            if let Some(code) = code {
                let _ = out_tx.send(ExecEvent::Exit(code)).await;
            }
        });

        Ok(ExecStream {
            input: in_tx,
            output: out_rx,
            cancel,
        })
    }

    async fn copy_out(&self, handle: &EngineHandle, path: &str) -> Result<EntryStream> {
        let state = lock(&self.containers);
        let container = state
            .by_id
            .get(handle.as_str())
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;

        let root = resolve(&container.working_dir, path);
        let node = container
            .fs
            .get(&root)
            .ok_or_else(|| EngineError::NotFound(format!("{}:{}", handle, root)))?;

        let entries = match node {
            FsNode::Dir { .. } => {
                let prefix = if root == "/" {
                    "/".to_string()
                } else {
                    format!("{}/", root)
                };
                container
                    .fs
                    .range(prefix.clone()..)
                    .take_while(|(key, _)| key.starts_with(&prefix))
                    .map(|(key, node)| to_entry(&key[prefix.len()..], node))
                    .collect::<Vec<_>>()
            }
            leaf => vec![to_entry(base_name(&root), leaf)],
        };

        Ok(futures::stream::iter(entries.into_iter().map(Ok)).boxed())
    }

    async fn copy_in(
        &self,
        handle: &EngineHandle,
        dest: &str,
        mut entries: EntryStream,
        progress: CopyProgress,
    ) -> Result<u64> {
        let dest = {
            let mut state = lock(&self.containers);
            let container = state
                .by_id
                .get_mut(handle.as_str())
                .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
            let dest = resolve(&container.working_dir, dest);
            mkdir_p(&mut container.fs, &dest)?;
            dest
        };

        let mut written = 0u64;
        while let Some(item) = entries.next().await {
            let interrupted = |reason: String| EngineError::CopyInterrupted {
                entries_written: written,
                reason,
            };

            if self.faults.fail_copy_in_after == Some(written) {
                return Err(interrupted("injected copy failure".to_string()));
            }
            if self.faults.hang_copy_in_after == Some(written) {
                std::future::pending::<()>().await;
            }
            let entry = item.map_err(|e| interrupted(e.to_string()))?;
            let relative = normalize_path(&entry.path).map_err(|e| interrupted(e.to_string()))?;
            if relative.is_empty() {
                continue;
            }

            let mut state = lock(&self.containers);
            let container = state
                .by_id
                .get_mut(handle.as_str())
                .ok_or_else(|| interrupted("container disappeared".to_string()))?;
            let target = resolve(&dest, &relative);
            mkdir_p(&mut container.fs, parent_of(&target)).map_err(|e| interrupted(e.to_string()))?;
            let node = match entry.kind {
                EntryKind::File => FsNode::File {
                    mode: entry.mode,
                    content: entry.content,
                },
                EntryKind::Directory => FsNode::Dir { mode: entry.mode },
                EntryKind::Symlink { target } => FsNode::Symlink { target },
            };
            container.fs.insert(target, node);
            written += 1;
            progress.advance();
        }

        Ok(written)
    }

    async fn stop(&self, handle: &EngineHandle, _timeout: Duration) -> Result<()> {
        if self.faults.hang_stop {
            std::future::pending::<()>().await;
        }
        if self.faults.fail_stop {
            return Err(EngineError::ContainerError(format!(
                "daemon refused to stop {}",
                handle
            )));
        }

        let mut state = lock(&self.containers);
        let container = state
            .by_id
            .get_mut(handle.as_str())
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
        container.running = false;
        container.processes.cancel();
        Ok(())
    }

    async fn destroy(&self, handle: &EngineHandle) -> Result<()> {
        if self.faults.fail_destroy {
            return Err(EngineError::ContainerError(format!(
                "removal of {} is already in progress",
                handle
            )));
        }

        let container = lock(&self.containers)
            .by_id
            .remove(handle.as_str())
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
        container.processes.cancel();
        Ok(())
    }
}

struct Process {
    containers: Shared,
    scripts: Arc<HashMap<String, ScriptedResponse>>,
    container_id: String,
    cwd: String,
    argv: Vec<String>,
}

impl Process {
    async fn run(self, out: &mpsc::Sender<ExecEvent>, mut input: mpsc::Receiver<Vec<u8>>) -> i64 {
        if let Some(script) = self.scripts.get(&self.argv.join(" ")) {
            if let Some(delay) = script.delay {
                tokio::time::sleep(delay).await;
            }
            if !script.stdout.is_empty() {
                emit(out, OutputChunk::stdout(script.stdout.clone())).await;
            }
            if !script.stderr.is_empty() {
                emit(out, OutputChunk::stderr(script.stderr.clone())).await;
            }
            return script.exit_code;
        }

        let program = self.argv[0].as_str();
        let args = &self.argv[1..];
        match program {
            "true" => 0,
            "false" => 1,
            "pwd" => {
                emit(out, OutputChunk::stdout(format!("{}\n", self.cwd))).await;
                0
            }
            "echo" => {
                let (newline, words) = match args.first().map(String::as_str) {
                    Some("-n") => (false, &args[1..]),
                    _ => (true, args),
                };
                let mut line = words.join(" ");
                if newline {
                    line.push('\n');
                }
                emit(out, OutputChunk::stdout(line)).await;
                0
            }
            "sleep" => match args
                .first()
                .and_then(|s| s.parse::<f64>().ok())
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            {
                Some(interval) => {
                    tokio::time::sleep(interval).await;
                    0
                }
                _ => {
                    emit(out, OutputChunk::stderr("sleep: invalid time interval\n")).await;
                    1
                }
            },
            "cat" if args.is_empty() => {
                while let Some(data) = input.recv().await {
                    emit(out, OutputChunk::stdout(data)).await;
                }
                0
            }
            "cat" => {
                let mut code = 0;
                for arg in args {
                    match self.lookup(arg) {
                        Some(FsNode::File { content, .. }) => {
                            emit(out, OutputChunk::stdout(content)).await;
                        }
                        Some(FsNode::Dir { .. }) => {
                            emit(out, OutputChunk::stderr(format!("cat: {}: Is a directory\n", arg)))
                                .await;
                            code = 1;
                        }
                        _ => {
                            emit(
                                out,
                                OutputChunk::stderr(format!(
                                    "cat: {}: No such file or directory\n",
                                    arg
                                )),
                            )
                            .await;
                            code = 1;
                        }
                    }
                }
                code
            }
            "ls" => {
                let target = args.first().map(String::as_str).unwrap_or(".");
                match self.list_dir(target) {
                    Some(names) => {
                        let listing: String = names.into_iter().map(|n| n + "\n").collect();
                        if !listing.is_empty() {
                            emit(out, OutputChunk::stdout(listing)).await;
                        }
                        0
                    }
                    None => {
                        emit(
                            out,
                            OutputChunk::stderr(format!(
                                "ls: cannot access '{}': No such file or directory\n",
                                target
                            )),
                        )
                        .await;
                        2
                    }
                }
            }
            other => {
                emit(out, OutputChunk::stderr(format!("{}: command not found\n", other))).await;
                127
            }
        }
    }

    fn lookup(&self, path: &str) -> Option<FsNode> {
        let state = lock(&self.containers);
        let container = state.by_id.get(&self.container_id)?;
        container.fs.get(&resolve(&self.cwd, path)).cloned()
    }

    fn list_dir(&self, path: &str) -> Option<Vec<String>> {
        let state = lock(&self.containers);
        let container = state.by_id.get(&self.container_id)?;
        let dir = resolve(&self.cwd, path);
        if dir != "/" && !matches!(container.fs.get(&dir), Some(FsNode::Dir { .. })) {
            return None;
        }
        let prefix = if dir == "/" { dir } else { format!("{}/", dir) };
        Some(
            container
                .fs
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| &key[prefix.len()..])
                .filter(|rest| !rest.contains('/'))
                .map(str::to_string)
                .collect(),
        )
    }
}

async fn emit(out: &mpsc::Sender<ExecEvent>, chunk: OutputChunk) {
    // A dropped reader is not the process's problem
    let _ = out.send(ExecEvent::Output(chunk)).await;
}

fn to_entry(path: &str, node: &FsNode) -> ArchiveEntry {
    match node {
        FsNode::Dir { mode } => ArchiveEntry::directory(path).with_mode(*mode),
        FsNode::File { mode, content } => ArchiveEntry::file(path, content.clone()).with_mode(*mode),
        FsNode::Symlink { target } => ArchiveEntry::symlink(path, target.clone()),
    }
}

/// Resolve `path` against `cwd` into a normalized absolute path
fn resolve(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd, path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn mkdir_p(fs: &mut BTreeMap<String, FsNode>, path: &str) -> Result<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        match fs.get(&current) {
            Some(FsNode::Dir { .. }) => {}
            Some(_) => {
                return Err(EngineError::CopyError(format!(
                    "{} exists and is not a directory",
                    current
                )))
            }
            None => {
                fs.insert(current.clone(), FsNode::Dir { mode: 0o755 });
            }
        }
    }
    Ok(())
}
