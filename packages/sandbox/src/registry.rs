// ABOUTME: Concurrency-safe table of sandboxes keyed by id
// ABOUTME: State changes go through a per-entry compare-and-swap and are broadcast to subscribers

use crate::engine::EngineHandle;
use crate::error::{Result, SandboxError};
use crate::ids::SandboxId;
use crate::state::SandboxState;
use crate::templates::RuntimeTemplate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

/// One sandbox record. Snapshots handed out by the registry are copies.
#[derive(Debug, Clone, Serialize)]
pub struct Sandbox {
    pub id: SandboxId,
    pub template: Arc<RuntimeTemplate>,
    pub engine_handle: Option<EngineHandle>,
    pub state: SandboxState,
    /// Why the sandbox ended up `Errored`
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Sandbox {
    pub fn new(id: SandboxId, template: Arc<RuntimeTemplate>) -> Self {
        let now = Utc::now();
        Self {
            id,
            template,
            engine_handle: None,
            state: SandboxState::Requested,
            failure: None,
            created_at: now,
            state_changed_at: now,
            last_activity_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub sandbox_id: SandboxId,
    pub from: SandboxState,
    pub to: SandboxState,
    pub at: DateTime<Utc>,
}

/// Ids remembered after removal by default
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 4096;

/// The most recently removed ids, oldest evicted first
#[derive(Debug)]
struct Tombstones {
    order: VecDeque<SandboxId>,
    ids: HashSet<SandboxId>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: SandboxId) {
        if self.capacity == 0 || !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }

    fn contains(&self, id: &SandboxId) -> bool {
        self.ids.contains(id)
    }
}

pub struct SandboxRegistry {
    sandboxes: RwLock<HashMap<SandboxId, Arc<Mutex<Sandbox>>>>,
    removed: RwLock<Tombstones>,
    events: broadcast::Sender<StateChange>,
}

impl SandboxRegistry {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            sandboxes: RwLock::new(HashMap::new()),
            removed: RwLock::new(Tombstones::new(DEFAULT_TOMBSTONE_CAPACITY)),
            events,
        }
    }

    /// Remember at most `capacity` removed ids. Older ones read as never seen.
    pub fn with_tombstone_capacity(mut self, capacity: usize) -> Self {
        self.removed = RwLock::new(Tombstones::new(capacity));
        self
    }

    /// Register a new sandbox. Returns false if the id is already taken.
    pub async fn insert(&self, sandbox: Sandbox) -> bool {
        let mut sandboxes = self.sandboxes.write().await;
        if sandboxes.contains_key(&sandbox.id) {
            return false;
        }
        debug!("Registered sandbox {} ({})", sandbox.id, sandbox.template.name);
        sandboxes.insert(sandbox.id.clone(), Arc::new(Mutex::new(sandbox)));
        true
    }

    async fn entry(&self, id: &SandboxId) -> Result<Arc<Mutex<Sandbox>>> {
        self.sandboxes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::SandboxNotFound(id.clone()))
    }

    /// Snapshot of a sandbox
    pub async fn lookup(&self, id: &SandboxId) -> Result<Sandbox> {
        let entry = self.entry(id).await?;
        let sandbox = entry.lock().await;
        Ok(sandbox.clone())
    }

    pub async fn state(&self, id: &SandboxId) -> Result<SandboxState> {
        let entry = self.entry(id).await?;
        let state = entry.lock().await.state;
        Ok(state)
    }

    /// Move `id` from `expected` to `next`, applying `mutate` under the same lock.
    ///
    /// Fails with `ConcurrentModification` if the sandbox is no longer in
    /// `expected`, and with `InvalidTransition` if `expected -> next` is not a
    /// permitted edge. On failure nothing is changed.
    pub async fn compare_and_swap<F>(
        &self,
        id: &SandboxId,
        expected: SandboxState,
        next: SandboxState,
        mutate: F,
    ) -> Result<Sandbox>
    where
        F: FnOnce(&mut Sandbox),
    {
        let entry = self.entry(id).await?;
        let mut sandbox = entry.lock().await;

        if sandbox.state != expected {
            return Err(SandboxError::ConcurrentModification {
                id: id.clone(),
                expected,
                actual: sandbox.state,
            });
        }
        self.apply(&mut sandbox, next, mutate)
    }

    /// Move `id` from whatever state it is in to `next`, if that edge is permitted
    pub async fn transition<F>(&self, id: &SandboxId, next: SandboxState, mutate: F) -> Result<Sandbox>
    where
        F: FnOnce(&mut Sandbox),
    {
        let entry = self.entry(id).await?;
        let mut sandbox = entry.lock().await;
        self.apply(&mut sandbox, next, mutate)
    }

    fn apply<F>(&self, sandbox: &mut Sandbox, next: SandboxState, mutate: F) -> Result<Sandbox>
    where
        F: FnOnce(&mut Sandbox),
    {
        let from = sandbox.state;
        if !from.can_transition_to(next) {
            return Err(SandboxError::InvalidTransition {
                id: sandbox.id.clone(),
                from,
                attempted: next,
            });
        }

        let now = Utc::now();
        sandbox.state = next;
        sandbox.state_changed_at = now;
        mutate(sandbox);

        debug!("Sandbox {}: {} -> {}", sandbox.id, from, next);
        // Sent while the entry is locked so subscribers see one sandbox's changes in order
        let _ = self.events.send(StateChange {
            sandbox_id: sandbox.id.clone(),
            from,
            to: next,
            at: now,
        });

        Ok(sandbox.clone())
    }

    /// Refresh `last_activity_at`
    pub async fn touch(&self, id: &SandboxId) -> Result<()> {
        let entry = self.entry(id).await?;
        entry.lock().await.last_activity_at = Utc::now();
        Ok(())
    }

    /// Drop the record and remember that the id existed
    pub async fn remove(&self, id: &SandboxId) -> Result<Sandbox> {
        let entry = self
            .sandboxes
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SandboxError::SandboxNotFound(id.clone()))?;
        self.removed.write().await.insert(id.clone());

        let sandbox = entry.lock().await.clone();
        debug!("Removed sandbox {} from registry", id);
        Ok(sandbox)
    }

    pub async fn was_removed(&self, id: &SandboxId) -> bool {
        self.removed.read().await.contains(id)
    }

    /// Snapshots of every sandbox, oldest first
    pub async fn list(&self) -> Vec<Sandbox> {
        let entries: Vec<_> = self.sandboxes.read().await.values().cloned().collect();
        let mut sandboxes = Vec::with_capacity(entries.len());
        for entry in entries {
            sandboxes.push(entry.lock().await.clone());
        }
        sandboxes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sandboxes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.sandboxes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sandboxes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SandboxState::*;

    fn template() -> Arc<RuntimeTemplate> {
        Arc::new(RuntimeTemplate::new("python", "python:3.12-alpine", "/app"))
    }

    async fn registered(registry: &SandboxRegistry) -> SandboxId {
        let id = SandboxId::generate();
        assert!(registry.insert(Sandbox::new(id.clone(), template())).await);
        id
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let registry = SandboxRegistry::new(16);
        let id = registered(&registry).await;

        let sandbox = registry.lookup(&id).await.unwrap();
        assert_eq!(sandbox.state, Requested);
        assert_eq!(sandbox.template.name, "python");
        assert!(!registry.insert(Sandbox::new(id.clone(), template())).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let registry = SandboxRegistry::new(16);
        let err = registry.lookup(&SandboxId::from("sbx-nope")).await.unwrap_err();
        assert!(matches!(err, SandboxError::SandboxNotFound(_)));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let registry = SandboxRegistry::new(16);
        let id = registered(&registry).await;

        let updated = registry
            .compare_and_swap(&id, Requested, Provisioning, |_| {})
            .await
            .unwrap();
        assert_eq!(updated.state, Provisioning);

        let err = registry
            .compare_and_swap(&id, Requested, Provisioning, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ConcurrentModification {
                expected: Requested,
                actual: Provisioning,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_edge_leaves_state_unchanged() {
        let registry = SandboxRegistry::new(16);
        let id = registered(&registry).await;

        let err = registry
            .compare_and_swap(&id, Requested, Running, |s| s.failure = Some("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::InvalidTransition {
                from: Requested,
                attempted: Running,
                ..
            }
        ));
        let sandbox = registry.lookup(&id).await.unwrap();
        assert_eq!(sandbox.state, Requested);
        assert!(sandbox.failure.is_none());
    }

    #[tokio::test]
    async fn test_transition_to_errored_records_failure() {
        let registry = SandboxRegistry::new(16);
        let id = registered(&registry).await;

        registry
            .transition(&id, Errored, |s| s.failure = Some("image pull failed".into()))
            .await
            .unwrap();
        let sandbox = registry.lookup(&id).await.unwrap();
        assert_eq!(sandbox.state, Errored);
        assert_eq!(sandbox.failure.as_deref(), Some("image pull failed"));

        assert!(registry.transition(&id, Errored, |_| {}).await.is_err());
    }

    #[tokio::test]
    async fn test_events_are_broadcast_in_order() {
        let registry = SandboxRegistry::new(16);
        let mut events = registry.subscribe();
        let id = registered(&registry).await;

        for (from, to) in [(Requested, Provisioning), (Provisioning, Starting), (Starting, Running)] {
            registry.compare_and_swap(&id, from, to, |_| {}).await.unwrap();
        }

        for expected in [Provisioning, Starting, Running] {
            let event = events.recv().await.unwrap();
            assert_eq!(event.sandbox_id, id);
            assert_eq!(event.to, expected);
        }
    }

    #[tokio::test]
    async fn test_concurrent_cas_has_one_winner() {
        let registry = Arc::new(SandboxRegistry::new(16));
        let id = registered(&registry).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .compare_and_swap(&id, Requested, Provisioning, |_| {})
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_remove_leaves_tombstone() {
        let registry = SandboxRegistry::new(16);
        let id = registered(&registry).await;

        registry.remove(&id).await.unwrap();
        assert!(registry.was_removed(&id).await);
        assert!(registry.is_empty().await);
        assert!(matches!(
            registry.state(&id).await,
            Err(SandboxError::SandboxNotFound(_))
        ));
        assert!(!registry.was_removed(&SandboxId::from("sbx-never")).await);
    }

    #[tokio::test]
    async fn test_tombstones_keep_only_recent_ids() {
        let registry = SandboxRegistry::new(16).with_tombstone_capacity(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = registered(&registry).await;
            registry.remove(&id).await.unwrap();
            ids.push(id);
        }

        assert!(!registry.was_removed(&ids[0]).await);
        assert!(registry.was_removed(&ids[1]).await);
        assert!(registry.was_removed(&ids[2]).await);
    }

    #[tokio::test]
    async fn test_touch_updates_activity() {
        let registry = SandboxRegistry::new(16);
        let id = registered(&registry).await;
        let before = registry.lookup(&id).await.unwrap().last_activity_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.touch(&id).await.unwrap();
        assert!(registry.lookup(&id).await.unwrap().last_activity_at > before);
    }
}
