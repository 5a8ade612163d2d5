// ABOUTME: Idle reaper stopping running sandboxes that have seen no activity for a while
// ABOUTME: Disabled unless an idle timeout is configured; optionally reclaims what it stops

use crate::ids::SandboxId;
use crate::orchestrator::Orchestrator;
use crate::state::SandboxState;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, info, warn};

pub struct IdleReaper {
    orchestrator: Arc<Orchestrator>,
    idle_timeout: Option<Duration>,
    interval: Duration,
    reclaim: bool,
    running: Arc<RwLock<bool>>,
}

impl IdleReaper {
    /// Build a reaper from the orchestrator's idle settings
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let config = orchestrator.config();
        Self {
            idle_timeout: config.idle_timeout,
            interval: config.reaper_interval,
            reclaim: config.reclaim_idle,
            orchestrator,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.idle_timeout.is_some()
    }

    /// Start the background sweep loop. Does nothing when disabled or already started.
    pub async fn start(&self) {
        let Some(idle_timeout) = self.idle_timeout else {
            debug!("Idle reaper disabled");
            return;
        };

        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let orchestrator = self.orchestrator.clone();
        let running_flag = self.running.clone();
        let interval = self.interval;
        let reclaim = self.reclaim;

        tokio::spawn(async move {
            info!(
                "Idle reaper started (idle timeout: {:?}, interval: {:?})",
                idle_timeout, interval
            );

            loop {
                if !*running_flag.read().await {
                    info!("Idle reaper stopped");
                    break;
                }

                let reaped = sweep(&orchestrator, idle_timeout, reclaim).await;
                if !reaped.is_empty() {
                    info!("Idle reaper stopped {} sandbox(es)", reaped.len());
                }

                time::sleep(interval).await;
            }
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Run one sweep now. Returns the ids that were stopped.
    pub async fn sweep(&self) -> Vec<SandboxId> {
        match self.idle_timeout {
            Some(idle_timeout) => sweep(&self.orchestrator, idle_timeout, self.reclaim).await,
            None => Vec::new(),
        }
    }
}

async fn sweep(orchestrator: &Orchestrator, idle_timeout: Duration, reclaim: bool) -> Vec<SandboxId> {
    let now = Utc::now();
    let mut reaped = Vec::new();

    for sandbox in orchestrator.list_sandboxes().await {
        if sandbox.state != SandboxState::Running {
            continue;
        }
        let idle_for = (now - sandbox.last_activity_at).to_std().unwrap_or_default();
        if idle_for < idle_timeout {
            continue;
        }

        let id = sandbox.id;
        let sessions = orchestrator.sessions().active_sessions(&id).await;
        let transfers = orchestrator.files().active_transfers(&id).await;
        if sessions > 0 || transfers > 0 {
            debug!(
                "Sandbox {} idle for {:?} but has {} session(s) and {} transfer(s)",
                id, idle_for, sessions, transfers
            );
            continue;
        }

        info!("Sandbox {} idle for {:?}, stopping", id, idle_for);
        if let Err(e) = orchestrator.stop_sandbox(&id).await {
            warn!("Failed to stop idle sandbox {}: {}", id, e);
            continue;
        }
        if reclaim {
            if let Err(e) = orchestrator.reclaim_sandbox(&id).await {
                warn!("Failed to reclaim idle sandbox {}: {}", id, e);
            }
        }
        reaped.push(id);
    }

    reaped
}
