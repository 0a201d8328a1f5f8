//! Sync engine facade
//!
//! [`SyncEngine`] wires the queue, coordinator, policy, capability monitor,
//! scheduler and session manager together and is the surface an embedding
//! application talks to. Build one with [`EngineBuilder`].

use crate::monitor::{StatisticsCollector, SyncStatistics};
use crate::scheduler::{
    BackgroundScheduler, IdleDetector, ScheduleStrategy, SchedulerOptions, SyncRunner,
};
use outbox_config::Config;
use outbox_device::{
    CapabilityMonitor, CapabilityProbe, CapabilitySignals, MonitorConfig, SystemProbe,
};
use outbox_queue::{FileStore, OperationQueue};
use outbox_sync::{
    Conflict, FailureClassifier, PolicyState, ResolutionOutcome, SelectiveSyncPolicy,
    SessionManager, SyncCoordinator, SyncEvent, SyncOptions, SyncProgress, SyncResult,
};
use outbox_types::{
    AdaptationStrategy, Backend, BackendError, CallOptions, CapabilityTier, Device, DeviceType,
    Error, FailureClass, KeyValueStore, NetworkQuality, NetworkType, NewOperation, Operation,
    OperationId, Result, SyncStatus,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happened to a mutating request
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The backend applied it directly
    Applied(Value),
    /// It was buffered for replay
    Queued(OperationId),
    /// The backend refused it and retrying cannot help
    Rejected(BackendError),
}

/// Builder for [`SyncEngine`]
pub struct EngineBuilder {
    config: Config,
    backend: Option<Arc<dyn Backend>>,
    store: Option<Arc<dyn KeyValueStore>>,
    probe: Option<Arc<dyn CapabilityProbe>>,
    local_device: Option<Device>,
    idle: Option<Arc<dyn IdleDetector>>,
    strategy: Option<ScheduleStrategy>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    online: bool,
}

impl EngineBuilder {
    /// Start from a configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            backend: None,
            store: None,
            probe: None,
            local_device: None,
            idle: None,
            strategy: None,
            classifier: None,
            online: false,
        }
    }

    /// Backend operations are sent to (required)
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Durable store; defaults to a [`FileStore`] in `storage.data_dir`
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Capability probe; defaults to a [`SystemProbe`] fed by the engine's
    /// signal setters
    pub fn probe(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Identity of this device
    pub fn local_device(mut self, device: Device) -> Self {
        self.local_device = Some(device);
        self
    }

    /// Idle hook for the idle strategy
    pub fn idle_detector(mut self, idle: Arc<dyn IdleDetector>) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Override the configured scheduling strategy, e.g. with a custom one
    pub fn strategy(mut self, strategy: ScheduleStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Override the failure classifier
    pub fn classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Initial connectivity; offline unless set
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Assemble the engine. Nothing runs in the background until
    /// [`SyncEngine::start`].
    pub fn build(self) -> Result<SyncEngine> {
        outbox_config::builder::validate(&self.config)?;
        let backend = self
            .backend
            .ok_or_else(|| Error::config("A backend is required to build the engine"))?;

        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileStore::open(&self.config.storage.data_dir)?),
        };

        let queue = Arc::new(OperationQueue::open(store.clone())?);
        let policy = Arc::new(SelectiveSyncPolicy::load(
            store,
            PolicyState::from(&self.config.policy),
        )?);

        let mut coordinator =
            SyncCoordinator::new(queue.clone(), backend, policy.clone(), &self.config.sync)?;
        if let Some(classifier) = self.classifier {
            coordinator = coordinator.with_classifier(classifier);
        }
        coordinator.set_online(self.online);
        let coordinator = Arc::new(coordinator);

        let signals = CapabilitySignals::new();
        let probe: Arc<dyn CapabilityProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(SystemProbe::new(signals.clone())),
        };
        let capability = Arc::new(CapabilityMonitor::new(
            probe,
            MonitorConfig {
                sample_interval: self.config.capability.sample_interval(),
                ttl: self.config.capability.cache_ttl(),
            },
        ));

        let local = self.local_device.unwrap_or_else(|| {
            Device::new(Uuid::new_v4().to_string(), "local", DeviceType::Other)
        });
        let sessions = Arc::new(SessionManager::new(local, coordinator.clone()));

        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => ScheduleStrategy::from_config(&self.config.scheduler.strategy)?,
        };
        let runner: Arc<dyn SyncRunner> = coordinator.clone();
        let scheduler = BackgroundScheduler::new(
            strategy,
            SchedulerOptions {
                trigger_on_foreground: self.config.scheduler.trigger_on_foreground,
                trigger_on_startup: self.config.scheduler.trigger_on_startup,
            },
            runner,
            queue.clone(),
            capability.clone(),
            self.idle,
        );
        scheduler.set_connectivity(self.online);

        let (shutdown_tx, _) = watch::channel(false);

        info!("Sync engine initialized for device {}", sessions.local_device().id);

        Ok(SyncEngine {
            config: Arc::new(self.config),
            queue,
            coordinator,
            policy,
            capability,
            signals,
            scheduler,
            sessions,
            statistics: StatisticsCollector::new(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("online", &self.online)
            .finish_non_exhaustive()
    }
}

/// Offline-first sync engine
pub struct SyncEngine {
    config: Arc<Config>,
    queue: Arc<OperationQueue>,
    coordinator: Arc<SyncCoordinator>,
    policy: Arc<SelectiveSyncPolicy>,
    capability: Arc<CapabilityMonitor>,
    signals: CapabilitySignals,
    scheduler: Arc<BackgroundScheduler>,
    sessions: Arc<SessionManager>,
    statistics: StatisticsCollector,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SyncEngine {
    /// Builder starting from `config`
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Start background sampling, scheduling and statistics
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state("Sync engine already started"));
        }
        self.shutdown_tx.send_replace(false);

        let state = self.capability.refresh().await;
        self.apply_batch_size(state.strategy.max_batch_size);

        let mut handles = self.handles.lock().await;
        handles.push(self.capability.clone().spawn(self.shutdown_tx.subscribe()));
        handles.push(
            self.statistics
                .spawn(self.coordinator.subscribe(), self.shutdown_tx.subscribe()),
        );
        handles.push(self.spawn_batch_adapter());
        handles.push(self.scheduler.clone().spawn(self.shutdown_tx.subscribe()));
        drop(handles);

        info!("Sync engine started (tier {})", state.tier);
        self.scheduler.notify_startup().await;
        Ok(())
    }

    /// Stop background work; an in-flight run is cancelled cooperatively
    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown_tx.send_replace(true);
        self.scheduler.cancel_scheduled();
        outbox_types::Cancellable::cancel(self.coordinator.as_ref());

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Sync engine stopped");
        Ok(())
    }

    /// Keep the coordinator's batch size in step with the capability tier
    fn spawn_batch_adapter(&self) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let fixed = self.config.sync.max_batch_size;
        let mut capability_rx = self.capability.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = capability_rx.changed() => {
                        if result.is_err() {
                            break;
                        }
                        let size = capability_rx.borrow_and_update().strategy.max_batch_size;
                        if fixed.is_none() {
                            debug!("Batch size adapted to {}", size);
                            coordinator.set_batch_limit(Some(size));
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn apply_batch_size(&self, size: usize) {
        if self.config.sync.max_batch_size.is_none() {
            self.coordinator.set_batch_limit(Some(size));
        }
    }

    /// Issue a mutating call, buffering it when it cannot reach the backend.
    ///
    /// While anything is queued the request is buffered behind it so replay
    /// order matches issue order.
    pub async fn mutate(&self, request: NewOperation) -> Result<MutationOutcome> {
        if !self.coordinator.is_online() || !self.queue.is_empty().await {
            let id = self.queue.enqueue(request).await?;
            debug!("Buffered mutation as operation {}", id);
            return Ok(MutationOutcome::Queued(id));
        }

        let payload = request.to_payload();
        let options = CallOptions {
            compress: self.policy.snapshot().await.transfer.compress,
        };
        match self
            .coordinator
            .backend()
            .invoke_with(&request.method, &payload, options)
            .await
        {
            Ok(value) => Ok(MutationOutcome::Applied(value)),
            Err(error) => match self.coordinator.classifier().classify(&error) {
                FailureClass::Transient => {
                    warn!("{} failed transiently, buffering: {}", request.method, error);
                    let id = self.queue.enqueue(request).await?;
                    Ok(MutationOutcome::Queued(id))
                }
                FailureClass::Permanent | FailureClass::Conflict => {
                    debug!("{} rejected: {}", request.method, error);
                    Ok(MutationOutcome::Rejected(error))
                }
            },
        }
    }

    /// Buffer an operation without trying the backend
    pub async fn enqueue(&self, request: NewOperation) -> Result<OperationId> {
        self.queue.enqueue(request).await
    }

    /// Discard a buffered operation
    pub async fn discard(&self, id: OperationId) -> Result<bool> {
        self.coordinator.discard(id).await
    }

    /// Run now ("sync now")
    pub async fn synchronize(&self) -> Result<SyncResult> {
        self.coordinator.synchronize().await
    }

    /// Run now with options
    pub async fn synchronize_with(&self, options: SyncOptions) -> Result<SyncResult> {
        self.coordinator.synchronize_with(options).await
    }

    /// Report connectivity. Before [`start`](Self::start) this only
    /// records the state.
    pub async fn set_online(&self, online: bool) {
        self.coordinator.set_online(online);
        if self.is_started() {
            self.scheduler.notify_connectivity(online).await;
        } else {
            self.scheduler.set_connectivity(online);
        }
    }

    /// Report the network link
    pub async fn set_network(&self, online: bool, network_type: NetworkType, quality: NetworkQuality) {
        self.signals.set_network(online, network_type, quality).await;
        self.capability.refresh().await;
        self.set_online(online).await;
    }

    /// Report the battery
    pub async fn set_battery(&self, level: Option<f32>, charging: bool) {
        self.signals.set_battery(level, charging).await;
        self.capability.refresh().await;
    }

    /// Report foreground/background transitions
    pub async fn set_foreground(&self, foreground: bool) {
        if self.is_started() {
            self.scheduler.notify_foreground(foreground).await;
        } else {
            self.scheduler.set_foreground(foreground);
        }
    }

    /// Whether background work is running
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Pending operations
    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Pending operations in enqueue order
    pub async fn operations(&self) -> Vec<Operation> {
        self.queue.list().await
    }

    /// Status of the current or last run
    pub async fn status(&self) -> SyncStatus {
        self.coordinator.status().await
    }

    /// Progress of the current or last run
    pub async fn progress(&self) -> SyncProgress {
        self.coordinator.progress().await
    }

    /// Result of the last run
    pub async fn last_result(&self) -> Option<Arc<SyncResult>> {
        self.coordinator.last_result().await
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }

    /// Subscribe to queue length changes
    pub fn subscribe_queue(&self) -> watch::Receiver<usize> {
        self.queue.subscribe()
    }

    /// Current capability tier
    pub async fn current_tier(&self) -> CapabilityTier {
        self.capability.current_tier().await
    }

    /// Adaptation strategy in force
    pub async fn current_strategy(&self) -> AdaptationStrategy {
        self.capability.current_strategy().await
    }

    /// Conflicts awaiting a decision
    pub async fn unresolved_conflicts(&self) -> Vec<Conflict> {
        self.coordinator.unresolved_conflicts().await
    }

    /// Decide a deferred conflict
    pub async fn resolve_conflict(&self, conflict_id: Uuid, outcome: ResolutionOutcome) -> Result<Conflict> {
        self.coordinator.resolve_conflict(conflict_id, outcome).await
    }

    /// Known remote devices
    pub async fn devices(&self) -> Vec<Device> {
        self.sessions.devices().await
    }

    /// Aggregate run statistics
    pub async fn statistics(&self) -> SyncStatistics {
        self.statistics.get_current_stats().await
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Operation queue
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Sync coordinator
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Selective-sync policy
    pub fn policy(&self) -> &Arc<SelectiveSyncPolicy> {
        &self.policy
    }

    /// Capability monitor
    pub fn capability(&self) -> &Arc<CapabilityMonitor> {
        &self.capability
    }

    /// Background scheduler
    pub fn scheduler(&self) -> &Arc<BackgroundScheduler> {
        &self.scheduler
    }

    /// Cross-device session manager
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("coordinator", &self.coordinator)
            .field("scheduler", &self.scheduler)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use outbox_config::StrategyConfig;
    use outbox_device::StaticProbe;
    use outbox_queue::MemoryStore;
    use outbox_types::CapabilitySnapshot;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptBackend {
        responses: StdMutex<VecDeque<std::result::Result<Value, BackendError>>>,
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptBackend {
        fn push(&self, response: std::result::Result<Value, BackendError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for ScriptBackend {
        async fn invoke(&self, method: &str, _params: &Value) -> std::result::Result<Value, BackendError> {
            self.calls.lock().unwrap().push(method.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"ok": true})))
        }
    }

    fn strong() -> CapabilitySnapshot {
        CapabilitySnapshot {
            cpu_cores: 8,
            memory_bytes: 16_000_000_000,
            network_type: NetworkType::Wifi,
            network_quality: NetworkQuality::Excellent,
            online: true,
            ..CapabilitySnapshot::default()
        }
    }

    fn engine(backend: Arc<ScriptBackend>, online: bool) -> SyncEngine {
        let mut config = Config::default();
        config.scheduler.strategy = StrategyConfig::Immediate;
        SyncEngine::builder(config)
            .backend(backend)
            .store(Arc::new(MemoryStore::new()))
            .probe(Arc::new(StaticProbe::new(strong())))
            .online(online)
            .build()
            .unwrap()
    }

    fn task(title: &str) -> NewOperation {
        NewOperation::create("createTask", "task", json!({ "title": title }))
    }

    #[tokio::test]
    async fn test_build_requires_backend() {
        let result = SyncEngine::builder(Config::default())
            .store(Arc::new(MemoryStore::new()))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mutate_online_applies_directly() {
        let backend = Arc::new(ScriptBackend::default());
        let engine = engine(backend.clone(), true);

        let outcome = engine.mutate(task("a")).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Applied(json!({"ok": true})));
        assert_eq!(engine.queue_len().await, 0);
        assert_eq!(backend.calls(), vec!["createTask"]);
    }

    #[tokio::test]
    async fn test_mutate_offline_buffers() {
        let backend = Arc::new(ScriptBackend::default());
        let engine = engine(backend.clone(), false);

        assert!(matches!(engine.mutate(task("a")).await.unwrap(), MutationOutcome::Queued(_)));
        assert!(matches!(engine.mutate(task("b")).await.unwrap(), MutationOutcome::Queued(_)));
        assert_eq!(engine.queue_len().await, 2);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mutate_timeout_buffers_and_validation_rejects() {
        let backend = Arc::new(ScriptBackend::default());
        let engine = engine(backend.clone(), true);

        backend.push(Err(BackendError::timeout("gateway timeout")));
        assert!(matches!(engine.mutate(task("a")).await.unwrap(), MutationOutcome::Queued(_)));

        // Queue is non-empty, so the next request is buffered behind it
        assert!(matches!(engine.mutate(task("b")).await.unwrap(), MutationOutcome::Queued(_)));
        assert_eq!(backend.calls().len(), 1);

        engine.queue().clear().await.unwrap();
        backend.push(Err(BackendError::validation("title required")));
        match engine.mutate(task("")).await.unwrap() {
            MutationOutcome::Rejected(error) => assert_eq!(error.message, "title required"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(engine.queue_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_going_online_drains_queue() {
        let backend = Arc::new(ScriptBackend::default());
        let engine = engine(backend.clone(), false);
        engine.start().await.unwrap();

        engine.mutate(task("a")).await.unwrap();
        engine.mutate(task("b")).await.unwrap();
        assert_eq!(engine.queue_len().await, 2);

        engine.set_online(true).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(engine.queue_len().await, 0);
        assert_eq!(backend.calls().len(), 2);
        assert_eq!(engine.status().await, SyncStatus::Completed);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = engine.statistics().await;
        assert!(stats.runs >= 1);
        assert_eq!(stats.operations_synced, 2);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_default_store_survives_restart() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = temp_dir.path().to_path_buf();

        let build = |backend: Arc<ScriptBackend>| {
            SyncEngine::builder(config.clone())
                .backend(backend)
                .probe(Arc::new(StaticProbe::new(strong())))
                .build()
                .unwrap()
        };

        {
            let engine = build(Arc::new(ScriptBackend::default()));
            engine.mutate(task("a")).await.unwrap();
            engine.policy().disable("comment").await.unwrap();
        }

        let backend = Arc::new(ScriptBackend::default());
        let engine = build(backend.clone());
        assert_eq!(engine.queue_len().await, 1);
        assert!(!engine.policy().is_syncable(&"comment".into()).await);

        engine.set_online(true).await;
        let result = engine.synchronize().await.unwrap();
        assert!(result.success);
        assert_eq!(backend.calls(), vec!["createTask"]);
    }

    #[tokio::test]
    async fn test_batch_size_follows_tier() {
        let backend = Arc::new(ScriptBackend::default());
        let engine = engine(backend, false);
        engine.start().await.unwrap();

        let strategy = engine.current_strategy().await;
        assert_eq!(engine.current_tier().await, CapabilityTier::High);
        assert_eq!(engine.coordinator().batch_limit(), Some(strategy.max_batch_size));

        assert!(engine.start().await.is_err());
        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
    }
}
