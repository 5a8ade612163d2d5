// ABOUTME: Shared helpers for sandbox orchestration integration tests
// ABOUTME: Builds orchestrators over the in-memory engine and waits for sandboxes to settle

#![allow(dead_code)]

use sandpit_sandbox::{
    EngineAdapter, MemoryEngine, Orchestrator, OrchestratorConfig, SandboxId, SandboxState,
    TemplateRegistry,
};
use std::sync::Arc;
use std::time::Duration;

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with timeouts short enough for tests
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        provision_timeout: Duration::from_secs(2),
        stop_timeout: Duration::from_millis(100),
        stop_confirm_timeout: Duration::from_millis(500),
        session_close_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

pub fn orchestrator_with(engine: Arc<dyn EngineAdapter>) -> Orchestrator {
    Orchestrator::new(
        test_config(),
        TemplateRegistry::new().expect("builtin templates load"),
        engine,
    )
}

/// Orchestrator plus a handle on its engine for inspecting containers
pub fn memory_orchestrator(engine: MemoryEngine) -> (Orchestrator, Arc<MemoryEngine>) {
    let engine = Arc::new(engine);
    (orchestrator_with(engine.clone()), engine)
}

/// Create a sandbox and wait for it to reach `Running`
pub async fn running_sandbox(orch: &Orchestrator, template: &str) -> SandboxId {
    let id = orch
        .create_sandbox(template)
        .await
        .expect("create accepted");
    let state = orch
        .wait_for_settled(&id, SETTLE_TIMEOUT)
        .await
        .expect("sandbox settles");
    assert_eq!(state, SandboxState::Running, "sandbox {} did not start", id);
    id
}

pub fn argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(String::from).collect()
}
