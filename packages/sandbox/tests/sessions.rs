// ABOUTME: Integration tests for exec sessions multiplexed over running sandboxes
// ABOUTME: Interactive input, stream separation, ordering, isolation and teardown

mod common;

use common::{argv, memory_orchestrator, running_sandbox, SETTLE_TIMEOUT};
use futures::StreamExt;
use sandpit_sandbox::engine::memory::ScriptedResponse;
use sandpit_sandbox::{MemoryEngine, OutputEvent, SandboxError, SessionState, StreamType};
use std::time::Duration;

#[tokio::test]
async fn test_interactive_cat_echoes_input() {
    let (orch, _engine) = memory_orchestrator(MemoryEngine::new());
    let id = running_sandbox(&orch, "node").await;
    let sessions = orch.sessions();

    let session = sessions.open_session(&id, argv("cat")).await.unwrap();
    let mut output = sessions.read_output(&session.id).await.unwrap();

    for line in ["first\n", "second\n", "third\n"] {
        sessions.write(&session.id, line).await.unwrap();
        match output.next_event().await {
            Some(OutputEvent::Chunk(chunk)) => {
                assert_eq!(chunk.stream, StreamType::Stdout);
                assert_eq!(chunk.data, line.as_bytes());
            }
            other => panic!("expected echoed chunk, got {:?}", other),
        }
    }

    sessions.close_input(&session.id).await.unwrap();
    assert_eq!(output.next_event().await, Some(OutputEvent::Exit { code: 0 }));
    assert_eq!(output.next_event().await, None);

    assert!(matches!(
        sessions.write(&session.id, "late").await,
        Err(SandboxError::SessionClosed(_))
    ));
    let snapshot = sessions.get_session(&session.id).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Closed);
    assert_eq!(snapshot.exit_code, Some(0));
    assert!(snapshot.closed_at.is_some());
}

#[tokio::test]
async fn test_stdout_and_stderr_stay_separate() {
    let engine = MemoryEngine::new().with_scripted_response(
        "python -c boom",
        ScriptedResponse {
            stdout: b"partial\n".to_vec(),
            stderr: b"Traceback (most recent call last)\n".to_vec(),
            exit_code: 1,
            delay: None,
        },
    );
    let (orch, _engine) = memory_orchestrator(engine);
    let id = running_sandbox(&orch, "python").await;

    let session = orch
        .sessions()
        .open_session(&id, argv("python -c boom"))
        .await
        .unwrap();
    let output = orch
        .sessions()
        .read_output(&session.id)
        .await
        .unwrap()
        .collect_all()
        .await;

    assert_eq!(output.stdout, b"partial\n");
    assert_eq!(output.stderr, b"Traceback (most recent call last)\n");
    assert_eq!(output.exit_code, Some(1));
}

#[tokio::test]
async fn test_terminal_event_is_last_and_unique() {
    let (orch, _engine) = memory_orchestrator(MemoryEngine::new());
    let id = running_sandbox(&orch, "go").await;

    let session = orch
        .sessions()
        .open_session(&id, argv("echo hello world"))
        .await
        .unwrap();
    let events: Vec<OutputEvent> = orch
        .sessions()
        .read_output(&session.id)
        .await
        .unwrap()
        .collect()
        .await;

    let terminals = events
        .iter()
        .filter(|e| !matches!(e, OutputEvent::Chunk(_)))
        .count();
    assert_eq!(terminals, 1);
    assert_eq!(events.last(), Some(&OutputEvent::Exit { code: 0 }));
}

#[tokio::test]
async fn test_sessions_in_different_sandboxes_are_isolated() {
    let (orch, _engine) = memory_orchestrator(MemoryEngine::new());
    let first = running_sandbox(&orch, "node").await;
    let second = running_sandbox(&orch, "node").await;

    let long = orch
        .sessions()
        .open_session(&first, argv("sleep 3600"))
        .await
        .unwrap();
    let short = orch
        .sessions()
        .open_session(&second, argv("pwd"))
        .await
        .unwrap();

    orch.stop_sandbox(&first).await.unwrap();
    assert_eq!(
        orch.sessions().session_state(&long.id).await.unwrap(),
        SessionState::Closed
    );

    let output = orch
        .sessions()
        .read_output(&short.id)
        .await
        .unwrap()
        .collect_all()
        .await;
    assert_eq!(output.stdout_lossy(), "/app\n");
    assert_eq!(output.exit_code, Some(0));
    assert_eq!(orch.sessions().list_sessions(&first).await.len(), 1);
    assert_eq!(orch.sessions().list_sessions(&second).await.len(), 1);
}

#[tokio::test]
async fn test_slow_process_is_cancelled_by_close() {
    let engine = MemoryEngine::new().with_scripted_response(
        "make build",
        ScriptedResponse {
            stdout: b"never\n".to_vec(),
            delay: Some(Duration::from_secs(3600)),
            ..Default::default()
        },
    );
    let (orch, _engine) = memory_orchestrator(engine);
    let id = running_sandbox(&orch, "cpp").await;

    let session = orch
        .sessions()
        .open_session(&id, argv("make build"))
        .await
        .unwrap();
    let output = orch.sessions().read_output(&session.id).await.unwrap();

    orch.sessions().close_session(&session.id).await.unwrap();
    let collected = tokio::time::timeout(SETTLE_TIMEOUT, output.collect_all())
        .await
        .unwrap();
    assert!(collected.cancelled);
    assert!(collected.stdout.is_empty());
    assert_eq!(orch.sessions().active_sessions(&id).await, 0);
}

#[tokio::test]
async fn test_opening_sessions_counts_as_activity() {
    let (orch, _engine) = memory_orchestrator(MemoryEngine::new());
    let id = running_sandbox(&orch, "python").await;
    let before = orch.get_sandbox(&id).await.unwrap().last_activity_at;

    tokio::time::sleep(Duration::from_millis(10)).await;
    orch.sessions().open_session(&id, argv("true")).await.unwrap();

    let after = orch.get_sandbox(&id).await.unwrap().last_activity_at;
    assert!(after > before);
}
