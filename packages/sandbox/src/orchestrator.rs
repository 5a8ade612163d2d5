// ABOUTME: Sandbox lifecycle orchestrator driving sandboxes through the state machine
// ABOUTME: Provisions in the background, stops with session and transfer teardown, and reclaims

use crate::archive::{ArchiveCodec, TarCodec};
use crate::config::OrchestratorConfig;
use crate::engine::{EngineAdapter, EngineError, ProvisionOptions};
use crate::error::{Result, SandboxError};
use crate::exec::SessionMultiplexer;
use crate::ids::SandboxId;
use crate::registry::{Sandbox, SandboxRegistry, StateChange};
use crate::state::SandboxState;
use crate::templates::{RuntimeTemplate, TemplateRegistry};
use crate::transfer::FilesystemGateway;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub struct Orchestrator {
    config: OrchestratorConfig,
    templates: Arc<TemplateRegistry>,
    engine: Arc<dyn EngineAdapter>,
    registry: Arc<SandboxRegistry>,
    sessions: Arc<SessionMultiplexer>,
    files: Arc<FilesystemGateway>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        templates: TemplateRegistry,
        engine: Arc<dyn EngineAdapter>,
    ) -> Self {
        Self::with_codec(config, templates, engine, Arc::new(TarCodec))
    }

    pub fn with_codec(
        config: OrchestratorConfig,
        templates: TemplateRegistry,
        engine: Arc<dyn EngineAdapter>,
        codec: Arc<dyn ArchiveCodec>,
    ) -> Self {
        let registry = Arc::new(
            SandboxRegistry::new(config.event_capacity)
                .with_tombstone_capacity(config.tombstone_capacity),
        );
        let sessions = Arc::new(SessionMultiplexer::new(
            registry.clone(),
            engine.clone(),
            config.session_buffer,
            config.session_close_timeout,
        ));
        let files = Arc::new(FilesystemGateway::new(registry.clone(), engine.clone(), codec));

        Self {
            config,
            templates: Arc::new(templates),
            engine,
            registry,
            sessions,
            files,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn engine(&self) -> &Arc<dyn EngineAdapter> {
        &self.engine
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    /// Exec sessions of all sandboxes
    pub fn sessions(&self) -> &SessionMultiplexer {
        &self.sessions
    }

    /// Imports and exports of all sandboxes
    pub fn files(&self) -> &FilesystemGateway {
        &self.files
    }

    /// Accept a create request and return the new sandbox's id right away.
    ///
    /// Provisioning and start run on a background task; watch progress with
    /// `get_state`, `subscribe` or `wait_for_settled`.
    pub async fn create_sandbox(&self, template_name: &str) -> Result<SandboxId> {
        let template = self.templates.resolve(template_name)?;
        template.validate()?;

        let mut id = SandboxId::generate();
        while !self
            .registry
            .insert(Sandbox::new(id.clone(), template.clone()))
            .await
        {
            id = SandboxId::generate();
        }

        info!("Accepted sandbox {} (template: {})", id, template.name);

        tokio::spawn(drive_provisioning(
            self.registry.clone(),
            self.engine.clone(),
            id.clone(),
            template,
            self.config.provision_timeout,
        ));

        Ok(id)
    }

    /// Stop a sandbox, cancelling its sessions and failing its transfers first.
    ///
    /// Returns `Stopped`, or `Removed` for a sandbox that was already reclaimed.
    pub async fn stop_sandbox(&self, id: &SandboxId) -> Result<SandboxState> {
        let sandbox = match self.registry.lookup(id).await {
            Ok(sandbox) => sandbox,
            Err(SandboxError::SandboxNotFound(_)) if self.registry.was_removed(id).await => {
                debug!("Stop of already removed sandbox {}", id);
                return Ok(SandboxState::Removed);
            }
            Err(e) => return Err(e),
        };

        match sandbox.state {
            SandboxState::Stopped | SandboxState::Removed => return Ok(sandbox.state),
            SandboxState::Running | SandboxState::Starting => {}
            from => {
                return Err(SandboxError::InvalidTransition {
                    id: id.clone(),
                    from,
                    attempted: SandboxState::Stopping,
                })
            }
        }

        let sandbox = self
            .registry
            .compare_and_swap(id, sandbox.state, SandboxState::Stopping, |_| {})
            .await?;
        info!("Stopping sandbox {}", id);

        // Detached: the sandbox has to leave `Stopping` even if this caller goes away
        let teardown = tokio::spawn(drive_stop(
            self.registry.clone(),
            self.engine.clone(),
            self.sessions.clone(),
            self.files.clone(),
            sandbox,
            self.config.stop_timeout,
            self.config.stop_confirm_timeout,
        ));

        match teardown.await {
            Ok(result) => result,
            Err(e) => {
                error!("Stop task of sandbox {} failed: {}", id, e);
                Err(SandboxError::engine(
                    SandboxState::Stopping,
                    EngineError::ContainerError(e.to_string()),
                ))
            }
        }
    }

    /// Destroy a stopped or errored sandbox and forget it
    pub async fn reclaim_sandbox(&self, id: &SandboxId) -> Result<()> {
        let sandbox = self.registry.lookup(id).await?;

        let sessions = self.sessions.active_sessions(id).await;
        let transfers = self.files.active_transfers(id).await;
        if sessions > 0 || transfers > 0 {
            return Err(SandboxError::SandboxBusy {
                id: id.clone(),
                state: sandbox.state,
                sessions,
                transfers,
            });
        }

        if !matches!(sandbox.state, SandboxState::Stopped | SandboxState::Errored) {
            return Err(SandboxError::InvalidTransition {
                id: id.clone(),
                from: sandbox.state,
                attempted: SandboxState::Reclaiming,
            });
        }

        let sandbox = self
            .registry
            .compare_and_swap(id, sandbox.state, SandboxState::Reclaiming, |_| {})
            .await?;
        info!("Reclaiming sandbox {}", id);

        if let Some(handle) = &sandbox.engine_handle {
            match self.engine.destroy(handle).await {
                Ok(()) => {}
                Err(EngineError::NotFound(_)) => {
                    warn!("Container {} of sandbox {} was already gone", handle, id)
                }
                Err(e) => {
                    error!("Failed to destroy sandbox {}: {}", id, e);
                    let reason = e.to_string();
                    self.registry
                        .compare_and_swap(
                            id,
                            SandboxState::Reclaiming,
                            SandboxState::Errored,
                            |s| s.failure = Some(reason),
                        )
                        .await?;
                    return Err(SandboxError::engine(SandboxState::Errored, e));
                }
            }
        }

        self.registry
            .compare_and_swap(id, SandboxState::Reclaiming, SandboxState::Removed, |_| {})
            .await?;
        self.registry.remove(id).await?;
        self.sessions.forget_sandbox(id).await;
        self.files.forget_sandbox(id).await;

        info!("Sandbox {} removed", id);
        Ok(())
    }

    pub async fn get_state(&self, id: &SandboxId) -> Result<SandboxState> {
        self.registry.state(id).await
    }

    pub async fn get_sandbox(&self, id: &SandboxId) -> Result<Sandbox> {
        self.registry.lookup(id).await
    }

    pub async fn list_sandboxes(&self) -> Vec<Sandbox> {
        self.registry.list().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.registry.subscribe()
    }

    /// Wait until the sandbox is `Running`, `Stopped`, `Errored` or `Removed`
    pub async fn wait_for_settled(&self, id: &SandboxId, timeout: Duration) -> Result<SandboxState> {
        // Subscribe before reading so no change slips between the read and the wait
        let mut events = self.registry.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let state = match self.registry.state(id).await {
                Ok(state) => state,
                Err(SandboxError::SandboxNotFound(_)) if self.registry.was_removed(id).await => {
                    return Ok(SandboxState::Removed)
                }
                Err(e) => return Err(e),
            };
            if state.is_settled() {
                return Ok(state);
            }

            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return Err(SandboxError::WaitTimeout {
                        id: id.clone(),
                        state,
                        waited: timeout,
                    })
                }
            }
        }
    }

    /// Stop and reclaim every sandbox. Returns how many were removed.
    pub async fn shutdown(&self) -> usize {
        let sandboxes = self.registry.list().await;
        if sandboxes.is_empty() {
            return 0;
        }
        info!("Shutting down {} sandbox(es)", sandboxes.len());

        let results =
            futures::future::join_all(sandboxes.into_iter().map(|s| self.shutdown_one(s))).await;
        results.into_iter().filter(|removed| *removed).count()
    }

    async fn shutdown_one(&self, sandbox: Sandbox) -> bool {
        let id = sandbox.id;
        let mut state = sandbox.state;

        if matches!(state, SandboxState::Requested | SandboxState::Provisioning) {
            state = self
                .wait_for_settled(&id, self.config.provision_timeout)
                .await
                .unwrap_or(state);
        }
        if matches!(state, SandboxState::Running | SandboxState::Starting) {
            if let Err(e) = self.stop_sandbox(&id).await {
                warn!("Failed to stop sandbox {} during shutdown: {}", id, e);
            }
        }

        match self.reclaim_sandbox(&id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to reclaim sandbox {} during shutdown: {}", id, e);
                false
            }
        }
    }
}

/// Teardown half of `stop_sandbox`: sessions, transfers, then the engine under the confirm timeout
async fn drive_stop(
    registry: Arc<SandboxRegistry>,
    engine: Arc<dyn EngineAdapter>,
    sessions: Arc<SessionMultiplexer>,
    files: Arc<FilesystemGateway>,
    sandbox: Sandbox,
    stop_timeout: Duration,
    confirm_timeout: Duration,
) -> Result<SandboxState> {
    let id = &sandbox.id;
    let cancelled = sessions.cancel_all(id).await;
    let failed = files.fail_all(id).await;
    debug!(
        "Sandbox {}: cancelled {} session(s), failed {} transfer(s)",
        id, cancelled, failed
    );

    let stop = async {
        match &sandbox.engine_handle {
            Some(handle) => engine.stop(handle, stop_timeout).await,
            None => Ok(()),
        }
    };
    let result = match tokio::time::timeout(confirm_timeout, stop).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(confirm_timeout)),
    };

    match result {
        Ok(()) => {
            registry
                .compare_and_swap(id, SandboxState::Stopping, SandboxState::Stopped, |_| {})
                .await?;
            info!("Sandbox {} stopped", id);
            Ok(SandboxState::Stopped)
        }
        Err(e) => {
            error!("Failed to stop sandbox {}: {}", id, e);
            let reason = e.to_string();
            registry
                .compare_and_swap(id, SandboxState::Stopping, SandboxState::Errored, |s| {
                    s.failure = Some(reason)
                })
                .await?;
            Err(SandboxError::engine(SandboxState::Errored, e))
        }
    }
}

/// Background half of `create_sandbox`
async fn drive_provisioning(
    registry: Arc<SandboxRegistry>,
    engine: Arc<dyn EngineAdapter>,
    id: SandboxId,
    template: Arc<RuntimeTemplate>,
    timeout: Duration,
) {
    let outcome = tokio::time::timeout(
        timeout,
        provision_and_start(&registry, engine.as_ref(), &id, &template),
    )
    .await;

    let reason = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(SandboxError::ConcurrentModification { actual, .. })) => {
            // A stop overtook the start; the stop owns the sandbox now
            debug!("Sandbox {} moved to {} while provisioning", id, actual);
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => EngineError::Timeout(timeout).to_string(),
    };

    error!("Provisioning sandbox {} failed: {}", id, reason);
    mark_errored(&registry, &id, reason).await;
}

async fn provision_and_start(
    registry: &SandboxRegistry,
    engine: &dyn EngineAdapter,
    id: &SandboxId,
    template: &RuntimeTemplate,
) -> Result<()> {
    registry
        .compare_and_swap(id, SandboxState::Requested, SandboxState::Provisioning, |_| {})
        .await?;
    info!("Provisioning sandbox {} ({})", id, template.image_ref);

    let options = ProvisionOptions {
        name: format!("sandpit-{}", id),
        labels: HashMap::from([
            ("id".to_string(), id.to_string()),
            ("template".to_string(), template.name.clone()),
        ]),
        env_vars: HashMap::new(),
    };
    let handle = engine
        .provision(template, &options)
        .await
        .map_err(|e| SandboxError::engine(SandboxState::Provisioning, e))?;

    let stored = handle.clone();
    registry
        .compare_and_swap(id, SandboxState::Provisioning, SandboxState::Starting, move |s| {
            s.engine_handle = Some(stored)
        })
        .await?;

    engine
        .start(&handle)
        .await
        .map_err(|e| SandboxError::engine(SandboxState::Starting, e))?;

    registry
        .compare_and_swap(id, SandboxState::Starting, SandboxState::Running, |s| {
            s.last_activity_at = Utc::now()
        })
        .await?;
    info!("Sandbox {} is running", id);
    Ok(())
}

/// Move a sandbox that is still provisioning to `Errored`
async fn mark_errored(registry: &SandboxRegistry, id: &SandboxId, reason: String) {
    let current = match registry.state(id).await {
        Ok(state) => state,
        Err(e) => {
            warn!("Sandbox {} vanished before it could be marked errored: {}", id, e);
            return;
        }
    };
    if !matches!(
        current,
        SandboxState::Requested | SandboxState::Provisioning | SandboxState::Starting
    ) {
        debug!("Sandbox {} already moved on to {}", id, current);
        return;
    }

    if let Err(e) = registry
        .compare_and_swap(id, current, SandboxState::Errored, |s| {
            s.failure = Some(reason)
        })
        .await
    {
        debug!("Sandbox {} was not marked errored: {}", id, e);
    }
}
