// ABOUTME: `sandpit run`: one-shot sandbox that uploads a tree, runs a command and downloads results
// ABOUTME: Streams the command's output to the terminal and mirrors its exit code

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::*;
use sandpit_sandbox::archive::{collect_dir, extract_to_dir};
use sandpit_sandbox::{
    DockerEngine, EngineAdapter, Orchestrator, OrchestratorConfig, OutputEvent, SandboxId,
    SandboxState, SessionId, StreamType,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Exit status reported when the run is interrupted with Ctrl-C
const INTERRUPTED_EXIT_CODE: i32 = 130;

const STDIN_CHUNK_SIZE: usize = 8192;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Runtime template to start the sandbox from
    #[arg(short, long)]
    pub template: String,

    /// Host directory copied into the sandbox's working directory before the command runs
    #[arg(long, value_name = "HOST_DIR")]
    pub upload: Option<PathBuf>,

    /// Copy a sandbox path to a host directory after the command exits (repeatable)
    #[arg(long, value_name = "SANDBOX_PATH=HOST_DIR", value_parser = parse_download)]
    pub download: Vec<Download>,

    /// Forward this terminal's stdin to the command
    #[arg(long)]
    pub keep_stdin: bool,

    /// Load templates from a JSON catalog instead of the builtin one
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// Command to run inside the sandbox
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    pub sandbox_path: String,
    pub host_dir: PathBuf,
}

fn parse_download(raw: &str) -> std::result::Result<Download, String> {
    match raw.split_once('=') {
        Some((sandbox_path, host_dir)) if !sandbox_path.is_empty() && !host_dir.is_empty() => {
            Ok(Download {
                sandbox_path: sandbox_path.to_string(),
                host_dir: PathBuf::from(host_dir),
            })
        }
        _ => Err(format!("expected <sandbox-path>=<host-dir>, got '{}'", raw)),
    }
}

pub async fn run(args: RunArgs) -> Result<i32> {
    let templates = super::load_templates(args.catalog.as_deref())?;

    let engine = DockerEngine::new().context("Failed to connect to Docker")?;
    if !engine.is_available().await.unwrap_or(false) {
        bail!("Docker daemon is not reachable. Is Docker running?");
    }

    let config = OrchestratorConfig::from_env();
    let settle_timeout = config.provision_timeout + Duration::from_secs(5);
    let orch = Arc::new(Orchestrator::new(config, templates, Arc::new(engine)));

    let id = orch.create_sandbox(&args.template).await?;
    eprintln!(
        "{} Starting {} sandbox {}",
        "▶".cyan(),
        args.template.bold(),
        id.to_string().dimmed()
    );

    let outcome = tokio::select! {
        result = drive(&orch, &id, &args, settle_timeout) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{} Interrupted, tearing down sandbox", "■".yellow());
            Ok(INTERRUPTED_EXIT_CODE)
        }
    };

    // Also waits out a sandbox that is still provisioning
    if orch.shutdown().await == 0 {
        warn!(
            "Sandbox {} was not reclaimed; look for containers labelled with its id",
            id
        );
    }

    outcome
}

async fn drive(
    orch: &Arc<Orchestrator>,
    id: &SandboxId,
    args: &RunArgs,
    settle_timeout: Duration,
) -> Result<i32> {
    let state = orch.wait_for_settled(id, settle_timeout).await?;
    if state != SandboxState::Running {
        let reason = orch
            .get_sandbox(id)
            .await
            .ok()
            .and_then(|sandbox| sandbox.failure)
            .unwrap_or_else(|| "no reason recorded".to_string());
        bail!("Sandbox {} did not start ({}): {}", id, state, reason);
    }

    if let Some(dir) = &args.upload {
        let entries =
            collect_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
        let report = orch
            .files()
            .import_entries(id, entries, ".")
            .await
            .with_context(|| format!("Failed to upload {}", dir.display()))?;
        eprintln!(
            "{} Uploaded {} entries from {}",
            "↑".cyan(),
            report.entries_written,
            dir.display()
        );
    }

    let code = run_command(orch, id, &args.command, args.keep_stdin).await?;

    for download in &args.download {
        let entries = orch
            .files()
            .export_entries(id, &download.sandbox_path)
            .await
            .with_context(|| format!("Failed to download {}", download.sandbox_path))?;
        let written = extract_to_dir(&entries, &download.host_dir)
            .with_context(|| format!("Failed to write {}", download.host_dir.display()))?;
        eprintln!(
            "{} Downloaded {} entries from {} to {}",
            "↓".cyan(),
            written,
            download.sandbox_path,
            download.host_dir.display()
        );
    }

    Ok(code)
}

async fn run_command(
    orch: &Arc<Orchestrator>,
    id: &SandboxId,
    command: &[String],
    keep_stdin: bool,
) -> Result<i32> {
    let sessions = orch.sessions();
    let session = sessions.open_session(id, command.to_vec()).await?;
    let mut output = sessions.read_output(&session.id).await?;

    let stdin_pump = if keep_stdin {
        let orch = orch.clone();
        let session_id = session.id.clone();
        Some(tokio::spawn(async move {
            forward_stdin(&orch, &session_id).await
        }))
    } else {
        sessions.close_input(&session.id).await?;
        None
    };

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let mut exit_code = None;
    while let Some(event) = output.next_event().await {
        match event {
            OutputEvent::Chunk(chunk) => {
                let written = match chunk.stream {
                    StreamType::Stdout => stdout.write_all(&chunk.data).and_then(|_| stdout.flush()),
                    StreamType::Stderr => stderr.write_all(&chunk.data).and_then(|_| stderr.flush()),
                };
                written.context("Failed to write command output")?;
            }
            OutputEvent::Exit { code } => exit_code = Some(code),
            OutputEvent::Cancelled => {}
        }
    }

    if let Some(pump) = stdin_pump {
        pump.abort();
    }
    sessions.close_session(&session.id).await?;

    match exit_code {
        Some(code) => Ok(i32::try_from(code).unwrap_or(1)),
        None => bail!("Command was cancelled before it exited"),
    }
}

async fn forward_stdin(orch: &Orchestrator, session_id: &SessionId) {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; STDIN_CHUNK_SIZE];

    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = orch.sessions().write(session_id, buf[..n].to_vec()).await {
                    debug!("Stopped forwarding stdin: {}", e);
                    return;
                }
            }
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        }
    }

    if let Err(e) = orch.sessions().close_input(session_id).await {
        debug!("Failed to close stdin of session {}: {}", session_id, e);
    }
}
