//! Cross-device sync sessions
//!
//! A session pairs the local device with a registered remote device and
//! drives one sync run on its behalf. Sessions to different devices may be
//! started concurrently; their runs are serialized by the coordinator.

use crate::conflict::Conflict;
use crate::coordinator::SyncCoordinator;
use crate::options::{CancelFlag, SyncOptions};
use crate::progress::{SyncEvent, SyncProgress};
use crate::result::{NetworkStats, SyncResult};
use chrono::{DateTime, Utc};
use outbox_types::{
    Cancellable, Device, DeviceCapabilities, DeviceId, EntityType, Error, Result, SyncStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a session should sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Restrict the run to these entity types
    pub entity_types: Option<BTreeSet<EntityType>>,
    /// Cap on operations processed
    pub max_operations: Option<usize>,
}

/// A sync session between the local device and a remote one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    /// Identifier
    pub id: Uuid,
    /// Local device
    pub source: DeviceId,
    /// Remote device
    pub target: DeviceId,
    /// Status
    pub status: SyncStatus,
    /// What the session syncs
    pub options: SessionOptions,
    /// Progress of the session's run
    pub progress: SyncProgress,
    /// Conflicts detected by the session's run
    pub conflicts: Vec<Conflict>,
    /// Backend traffic of the session's run
    pub network: NetworkStats,
    /// Result once the run finished
    pub result: Option<SyncResult>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When syncing started
    pub started_at: Option<DateTime<Utc>>,
    /// When the session ended
    pub ended_at: Option<DateTime<Utc>>,
}

/// Handle returned by [`SessionManager::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&[SyncSession]) + Send + Sync>;

struct SessionEntry {
    session: SyncSession,
    cancel: CancelFlag,
}

/// Owns the device registry and the sync sessions
pub struct SessionManager {
    local: Device,
    coordinator: Arc<SyncCoordinator>,
    devices: RwLock<HashMap<DeviceId, Device>>,
    sessions: RwLock<Vec<SessionEntry>>,
    listeners: StdMutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl SessionManager {
    /// Create a manager for the local device
    pub fn new(local: Device, coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            local,
            coordinator,
            devices: RwLock::new(HashMap::new()),
            sessions: RwLock::new(Vec::new()),
            listeners: StdMutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// The local device
    pub fn local_device(&self) -> &Device {
        &self.local
    }

    /// Register or replace a remote device
    pub async fn register_device(&self, device: Device) -> Result<()> {
        if device.id == self.local.id {
            return Err(Error::invalid_state(
                "The local device cannot be registered as a remote device",
            ));
        }
        info!("Registered device {} ({})", device.name, device.id);
        self.devices.write().await.insert(device.id.clone(), device);
        Ok(())
    }

    /// Forget a remote device; returns whether it was known
    pub async fn unregister_device(&self, id: &DeviceId) -> bool {
        self.devices.write().await.remove(id).is_some()
    }

    /// Registered remote devices
    pub async fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<_> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Look up a registered device
    pub async fn device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().await.get(id).cloned()
    }

    /// Record that a device was seen with the given capabilities
    pub async fn touch_device(&self, id: &DeviceId, capabilities: DeviceCapabilities) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(id).ok_or_else(|| Error::UnknownDevice {
            device_id: id.to_string(),
        })?;
        device.capabilities = capabilities;
        device.last_seen = Utc::now();
        Ok(())
    }

    /// Create a session to `target`.
    ///
    /// A session to the same target that has not finished yet is returned
    /// instead of creating a second one.
    pub async fn create_session(
        &self,
        target: &DeviceId,
        options: SessionOptions,
    ) -> Result<SyncSession> {
        if !self.devices.read().await.contains_key(target) {
            return Err(Error::UnknownDevice {
                device_id: target.to_string(),
            });
        }

        let session = {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions
                .iter()
                .find(|entry| &entry.session.target == target && !entry.session.status.is_terminal())
            {
                debug!("Reusing active session {} to {}", existing.session.id, target);
                return Ok(existing.session.clone());
            }

            let session = SyncSession {
                id: Uuid::new_v4(),
                source: self.local.id.clone(),
                target: target.clone(),
                status: SyncStatus::Idle,
                options,
                progress: SyncProgress::default(),
                conflicts: Vec::new(),
                network: NetworkStats::default(),
                result: None,
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
            };
            sessions.push(SessionEntry {
                session: session.clone(),
                cancel: CancelFlag::new(),
            });
            session
        };

        info!("Created session {} to {}", session.id, target);
        self.notify().await;
        Ok(session)
    }

    /// Drive an idle session through a sync run to completion
    pub async fn start_sync(&self, session_id: Uuid) -> Result<SyncSession> {
        if !self.coordinator.policy().is_enabled().await {
            return Err(Error::SyncDisabled);
        }

        let run_id = Uuid::new_v4();
        let (options, target) = {
            let mut sessions = self.sessions.write().await;
            let entry = find_mut(&mut sessions, session_id)?;
            if entry.session.status != SyncStatus::Idle {
                return Err(Error::invalid_state(format!(
                    "Session {} is {}",
                    session_id, entry.session.status
                )));
            }

            entry.session.status = SyncStatus::Syncing;
            entry.session.started_at = Some(Utc::now());
            entry.session.progress = SyncProgress::started(run_id, 0);

            let mut options = SyncOptions::new()
                .with_run_id(run_id)
                .with_cancel(entry.cancel.clone());
            options.only_entity_types = entry.session.options.entity_types.clone();
            options.max_operations = entry.session.options.max_operations;
            (options, entry.session.target.clone())
        };
        info!("Session {} syncing with {}", session_id, target);
        self.notify().await;

        let mut events = self.coordinator.subscribe();
        let run = self.coordinator.synchronize_queued(options);
        tokio::pin!(run);

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                event = events.recv() => match event {
                    Ok(event) if event.run_id() == run_id => self.apply_event(session_id, event).await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Session {} missed {} progress events", session_id, skipped);
                    }
                    Err(RecvError::Closed) => {}
                },
            }
        };

        let session = {
            let mut sessions = self.sessions.write().await;
            let entry = find_mut(&mut sessions, session_id)?;
            let session = &mut entry.session;
            session.ended_at = Some(Utc::now());

            match outcome {
                Ok(result) => {
                    session.status = if result.success {
                        SyncStatus::Completed
                    } else {
                        SyncStatus::Failed
                    };
                    session.progress = progress_of(&result);
                    session.conflicts = result.conflicts.clone();
                    session.network = result.network;
                    session.result = Some(result);
                }
                Err(e) => {
                    warn!("Session {} failed to run: {}", session_id, e);
                    session.status = SyncStatus::Failed;
                    session.progress.status = SyncStatus::Failed;
                    session.progress.ended_at = session.ended_at;
                }
            }
            session.clone()
        };

        if let Some(device) = self.devices.write().await.get_mut(&target) {
            device.last_seen = Utc::now();
        }
        info!("Session {} {}", session_id, session.status);
        self.notify().await;
        Ok(session)
    }

    /// Request cancellation of a syncing session; returns whether the request
    /// was accepted
    pub async fn cancel_sync(&self, session_id: Uuid) -> Result<bool> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .iter()
            .find(|entry| entry.session.id == session_id)
            .ok_or(Error::UnknownSession {
                session_id: session_id.to_string(),
            })?;

        if entry.session.status != SyncStatus::Syncing {
            return Ok(false);
        }
        info!("Cancelling session {}", session_id);
        entry.cancel.cancel();
        Ok(true)
    }

    /// Look up a session
    pub async fn session(&self, session_id: Uuid) -> Option<SyncSession> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|entry| entry.session.id == session_id)
            .map(|entry| entry.session.clone())
    }

    /// All sessions, oldest first
    pub async fn sessions(&self) -> Vec<SyncSession> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Drop finished sessions, returning how many were removed
    pub async fn clear_finished(&self) -> usize {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|entry| !entry.session.status.is_terminal());
            before - sessions.len()
        };
        if removed > 0 {
            self.notify().await;
        }
        removed
    }

    /// Register a callback receiving the full session list on every change
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[SyncSession]) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().map_or(false, |mut listeners| {
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            listeners.len() != before
        })
    }

    async fn apply_event(&self, session_id: Uuid, event: SyncEvent) {
        {
            let mut sessions = self.sessions.write().await;
            let Ok(entry) = find_mut(&mut sessions, session_id) else {
                return;
            };
            match event {
                SyncEvent::Started { total, .. } => entry.session.progress.total = total,
                SyncEvent::Progress { progress, .. } => entry.session.progress = progress,
                SyncEvent::ConflictDetected { conflict, .. } => entry.session.conflicts.push(*conflict),
                _ => return,
            }
        }
        self.notify().await;
    }

    async fn notify(&self) {
        let snapshot = self.sessions().await;
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(&snapshot);
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("local", &self.local.id)
            .finish_non_exhaustive()
    }
}

fn find_mut(sessions: &mut [SessionEntry], session_id: Uuid) -> Result<&mut SessionEntry> {
    sessions
        .iter_mut()
        .find(|entry| entry.session.id == session_id)
        .ok_or(Error::UnknownSession {
            session_id: session_id.to_string(),
        })
}

fn progress_of(result: &SyncResult) -> SyncProgress {
    SyncProgress {
        run_id: Some(result.run_id),
        status: result.status,
        total: result.total,
        completed: result.completed,
        failed: result.failed,
        conflicts: result.unresolved_conflicts().count(),
        skipped: result.skipped.len(),
        started_at: Some(result.started_at),
        ended_at: Some(result.ended_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyState, SelectiveSyncPolicy};
    use async_trait::async_trait;
    use outbox_config::SyncConfig;
    use outbox_queue::{MemoryStore, OperationQueue};
    use outbox_types::{Backend, BackendError, DeviceType, NewOperation};
    use serde_json::{json, Value};
    use std::time::Duration;

    struct SlowBackend {
        fail: bool,
    }

    #[async_trait]
    impl Backend for SlowBackend {
        async fn invoke(
            &self,
            _method: &str,
            _params: &Value,
        ) -> std::result::Result<Value, BackendError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.fail {
                Err(BackendError::validation("rejected"))
            } else {
                Ok(json!({}))
            }
        }
    }

    async fn manager(fail: bool) -> (Arc<SessionManager>, Arc<OperationQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(OperationQueue::open(store).unwrap());
        let policy = Arc::new(SelectiveSyncPolicy::new(PolicyState::default()));
        let coordinator = Arc::new(
            SyncCoordinator::new(
                queue.clone(),
                Arc::new(SlowBackend { fail }),
                policy,
                &SyncConfig::default(),
            )
            .unwrap(),
        );
        let manager = SessionManager::new(
            Device::new("laptop", "Laptop", DeviceType::Desktop),
            coordinator,
        );
        manager
            .register_device(Device::new("phone", "Phone", DeviceType::Mobile))
            .await
            .unwrap();
        (Arc::new(manager), queue)
    }

    fn phone() -> DeviceId {
        DeviceId::new("phone")
    }

    #[tokio::test]
    async fn test_unknown_device_is_rejected() {
        let (manager, _) = manager(false).await;
        let err = manager
            .create_session(&DeviceId::new("tablet"), SessionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDevice { .. }));
        assert!(manager.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_session_completes() {
        let (manager, queue) = manager(false).await;
        queue
            .enqueue(NewOperation::create("tasks.create", "task", json!({})))
            .await
            .unwrap();

        let session = manager
            .create_session(&phone(), SessionOptions::default())
            .await
            .unwrap();
        assert_eq!(session.status, SyncStatus::Idle);

        let session = manager.start_sync(session.id).await.unwrap();
        assert_eq!(session.status, SyncStatus::Completed);
        assert_eq!(session.progress.completed, 1);
        assert_eq!(session.network.requests, 1);
        assert!(session.ended_at.is_some());

        // Finished sessions cannot be restarted
        assert!(manager.start_sync(session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_run_fails_session() {
        let (manager, queue) = manager(true).await;
        queue
            .enqueue(NewOperation::create("tasks.create", "task", json!({})))
            .await
            .unwrap();

        let session = manager
            .create_session(&phone(), SessionOptions::default())
            .await
            .unwrap();
        let session = manager.start_sync(session.id).await.unwrap();
        assert_eq!(session.status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_active_session_is_reused() {
        let (manager, _) = manager(false).await;
        let first = manager
            .create_session(&phone(), SessionOptions::default())
            .await
            .unwrap();
        let second = manager
            .create_session(&phone(), SessionOptions::default())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(manager.sessions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_while_syncing() {
        let (manager, queue) = manager(false).await;
        for _ in 0..3 {
            queue
                .enqueue(NewOperation::create("tasks.create", "task", json!({})))
                .await
                .unwrap();
        }
        let session = manager
            .create_session(&phone(), SessionOptions::default())
            .await
            .unwrap();
        assert!(!manager.cancel_sync(session.id).await.unwrap());

        let runner = manager.clone();
        let id = session.id;
        let handle = tokio::spawn(async move { runner.start_sync(id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.cancel_sync(session.id).await.unwrap());
        let session = handle.await.unwrap().unwrap();
        assert!(session.result.as_ref().unwrap().cancelled);
        assert_eq!(session.progress.completed, 1);
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_listeners_receive_session_list() {
        let (manager, _) = manager(false).await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let id = manager.add_listener(move |sessions| {
            sink.lock().unwrap().push(sessions.len());
        });

        let session = manager
            .create_session(&phone(), SessionOptions::default())
            .await
            .unwrap();
        manager.start_sync(session.id).await.unwrap();
        assert!(seen.lock().unwrap().len() >= 3);
        assert!(seen.lock().unwrap().iter().all(|len| *len == 1));

        assert!(manager.remove_listener(id));
        assert!(!manager.remove_listener(id));
        let before = seen.lock().unwrap().len();
        manager.clear_finished().await;
        assert_eq!(seen.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (manager, _) = manager(false).await;
        assert!(matches!(
            manager.start_sync(Uuid::new_v4()).await.unwrap_err(),
            Error::UnknownSession { .. }
        ));
        assert!(manager.cancel_sync(Uuid::new_v4()).await.is_err());
    }
}
