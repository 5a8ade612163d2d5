// ABOUTME: Tests for the Docker engine against a local daemon
// ABOUTME: Skips quietly when no daemon is reachable so CI without Docker stays green

mod common;

use common::{argv, test_config, SETTLE_TIMEOUT};
use sandpit_sandbox::{
    ArchiveEntry, DockerEngine, EngineAdapter, Orchestrator, RuntimeTemplate, SandboxState,
    TemplateRegistry,
};
use std::sync::Arc;

async fn docker() -> Option<DockerEngine> {
    let engine = DockerEngine::new().ok()?;
    match engine.is_available().await {
        Ok(true) => Some(engine),
        _ => {
            println!("Docker is not available, skipping");
            None
        }
    }
}

/// The error for a missing daemon should say what is wrong
#[tokio::test]
async fn test_unavailable_daemon_error_is_informative() {
    if let Err(e) = DockerEngine::new() {
        let message = e.to_string();
        let lowered = message.to_lowercase();
        assert!(
            ["connect", "docker", "socket"]
                .iter()
                .any(|hint| lowered.contains(hint)),
            "unhelpful error: {}",
            message
        );
    }
}

#[tokio::test]
async fn test_docker_sandbox_lifecycle() {
    let Some(engine) = docker().await else { return };

    let templates = TemplateRegistry::from_templates([RuntimeTemplate::new(
        "alpine",
        "alpine:3.19",
        "/work",
    )
    .with_default_cmd(["sleep", "infinity"])])
    .unwrap();
    let mut config = test_config();
    config.provision_timeout = std::time::Duration::from_secs(120);
    config.stop_confirm_timeout = std::time::Duration::from_secs(30);
    let orch = Orchestrator::new(config, templates, Arc::new(engine));

    let id = orch.create_sandbox("alpine").await.unwrap();
    let state = orch
        .wait_for_settled(&id, std::time::Duration::from_secs(120))
        .await
        .unwrap();
    assert_eq!(state, SandboxState::Running);

    let session = orch
        .sessions()
        .open_session(&id, argv("echo from-docker"))
        .await
        .unwrap();
    let output = tokio::time::timeout(
        SETTLE_TIMEOUT,
        orch.sessions()
            .read_output(&session.id)
            .await
            .unwrap()
            .collect_all(),
    )
    .await
    .unwrap();
    assert_eq!(output.stdout_lossy().trim(), "from-docker");
    assert_eq!(output.exit_code, Some(0));

    orch.files()
        .import_entries(
            &id,
            vec![ArchiveEntry::file("notes/hello.txt", "hello docker\n")],
            ".",
        )
        .await
        .unwrap();
    let exported = orch.files().export_entries(&id, "notes").await.unwrap();
    let file = exported
        .iter()
        .find(|e| e.path == "hello.txt")
        .expect("exported file present");
    assert_eq!(file.content, b"hello docker\n");

    assert_eq!(orch.stop_sandbox(&id).await.unwrap(), SandboxState::Stopped);
    orch.reclaim_sandbox(&id).await.unwrap();
}
