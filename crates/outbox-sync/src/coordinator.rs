//! Sync coordinator
//!
//! Drains the operation queue against the backend. At most one run executes
//! at a time: [`SyncCoordinator::synchronize`] rejects a second caller with
//! [`Error::SyncInProgress`], while [`SyncCoordinator::synchronize_queued`]
//! waits its turn.
//!
//! Each operation is attempted once per run. Failures are classified and
//! handled by class:
//!
//! - **transient**: the operation stays queued and the run stops, since later
//!   operations would very likely fail the same way
//! - **permanent**: the operation is discarded and reported
//! - **conflict**: handed to the [`ConflictResolver`]; unresolved conflicts
//!   keep the operation queued until the caller decides

use crate::classify::{FailureClassifier, PolicyClassifier};
use crate::conflict::{Conflict, ConflictResolver, ConflictStats, ResolutionOutcome};
use crate::options::{CancelFlag, SyncOptions};
use crate::policy::SelectiveSyncPolicy;
use crate::progress::{ProgressReporter, SyncEvent, SyncProgress};
use crate::result::{FailedOperation, NetworkStats, SkipReason, SkippedOperation, SyncResult};
use chrono::Utc;
use outbox_config::SyncConfig;
use outbox_queue::OperationQueue;
use outbox_types::{
    Backend, BackendError, CallOptions, Cancellable, Error, FailureClass, Operation, OperationId,
    ResolutionPolicy, Result, SyncStatus,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const UNLIMITED: usize = usize::MAX;

/// Whether the run loop goes on after an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Bookkeeping for one run
#[derive(Debug)]
struct RunState {
    run_id: Uuid,
    call: CallOptions,
    seen: HashSet<OperationId>,
    processed: usize,
    completed: usize,
    failed: usize,
    failed_operations: Vec<FailedOperation>,
    skipped: Vec<SkippedOperation>,
    conflicts: Vec<Conflict>,
    network: NetworkStats,
    cancelled: bool,
    error: Option<String>,
}

impl RunState {
    fn new(run_id: Uuid, call: CallOptions) -> Self {
        Self {
            run_id,
            call,
            seen: HashSet::new(),
            processed: 0,
            completed: 0,
            failed: 0,
            failed_operations: Vec::new(),
            skipped: Vec::new(),
            conflicts: Vec::new(),
            network: NetworkStats::default(),
            cancelled: false,
            error: None,
        }
    }
}

/// Replays queued operations against a backend
pub struct SyncCoordinator {
    queue: Arc<OperationQueue>,
    backend: Arc<dyn Backend>,
    classifier: Arc<dyn FailureClassifier>,
    resolver: Arc<ConflictResolver>,
    policy: Arc<SelectiveSyncPolicy>,
    reporter: ProgressReporter,
    run_guard: Mutex<()>,
    online: AtomicBool,
    batch_limit: AtomicUsize,
    cancel: CancelFlag,
    last_result: RwLock<Option<Arc<SyncResult>>>,
}

impl SyncCoordinator {
    /// Create a coordinator configured from the `sync` section
    pub fn new(
        queue: Arc<OperationQueue>,
        backend: Arc<dyn Backend>,
        policy: Arc<SelectiveSyncPolicy>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let classifier = PolicyClassifier::from_config(config)?;
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let resolver = ConflictResolver::new(config.conflict_policy, event_tx.clone());

        Ok(Self {
            queue,
            backend,
            classifier: Arc::new(classifier),
            resolver: Arc::new(resolver),
            policy,
            reporter: ProgressReporter::new(event_tx),
            run_guard: Mutex::new(()),
            online: AtomicBool::new(true),
            batch_limit: AtomicUsize::new(config.max_batch_size.unwrap_or(UNLIMITED)),
            cancel: CancelFlag::new(),
            last_result: RwLock::new(None),
        })
    }

    /// Replace the failure classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Operation queue being drained
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Selective-sync policy
    pub fn policy(&self) -> &Arc<SelectiveSyncPolicy> {
        &self.policy
    }

    /// Conflict registry
    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// Classifier applied to backend failures
    pub fn classifier(&self) -> &Arc<dyn FailureClassifier> {
        &self.classifier
    }

    /// Backend operations are replayed against
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Record whether the device currently has connectivity
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) != online {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    /// Whether the device currently has connectivity
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Cap operations per run; `None` removes the cap
    pub fn set_batch_limit(&self, limit: Option<usize>) {
        self.batch_limit
            .store(limit.unwrap_or(UNLIMITED), Ordering::SeqCst);
    }

    /// Current per-run cap
    pub fn batch_limit(&self) -> Option<usize> {
        match self.batch_limit.load(Ordering::SeqCst) {
            UNLIMITED => None,
            limit => Some(limit),
        }
    }

    /// Whether a run is executing
    pub fn is_running(&self) -> bool {
        self.run_guard.try_lock().is_err()
    }

    /// Status of the current or last run
    pub async fn status(&self) -> SyncStatus {
        self.reporter.status().await
    }

    /// Progress of the current or last run
    pub async fn progress(&self) -> SyncProgress {
        self.reporter.get_progress().await
    }

    /// Result of the last finished run
    pub async fn last_result(&self) -> Option<Arc<SyncResult>> {
        self.last_result.read().await.clone()
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.reporter.subscribe()
    }

    /// Conflicts awaiting a caller decision
    pub async fn unresolved_conflicts(&self) -> Vec<Conflict> {
        self.resolver.get_unresolved_conflicts().await
    }

    /// Conflict statistics
    pub async fn conflict_stats(&self) -> ConflictStats {
        self.resolver.get_stats().await
    }

    /// Apply a caller decision to a deferred conflict.
    ///
    /// `KeepRemote` drops the operation. `KeepLocal` strips the operation's
    /// version precondition so the next run forces it through.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        outcome: ResolutionOutcome,
    ) -> Result<Conflict> {
        let conflict = self
            .resolver
            .get(conflict_id)
            .await
            .ok_or_else(|| Error::invalid_state(format!("Unknown conflict {}", conflict_id)))?;
        if conflict.resolved {
            return Err(Error::invalid_state(format!(
                "Conflict {} is already resolved",
                conflict_id
            )));
        }

        let operation_id = conflict.operation.id;
        match outcome {
            ResolutionOutcome::KeepRemote => {
                self.queue.remove(operation_id).await?;
            }
            ResolutionOutcome::KeepLocal => {
                if let Some(op) = self.queue.get(operation_id).await {
                    self.queue
                        .replace_params(operation_id, op.params.without_precondition())
                        .await?;
                }
            }
            ResolutionOutcome::Deferred => return Ok(conflict),
        }

        info!("Conflict {} resolved by caller: {:?}", conflict_id, outcome);
        self.resolver
            .mark_resolved(conflict_id, None, outcome)
            .await
            .ok_or_else(|| Error::invalid_state(format!("Unknown conflict {}", conflict_id)))
    }

    /// Remove a queued operation together with any conflict recorded for it
    pub async fn discard(&self, id: OperationId) -> Result<bool> {
        let removed = self.queue.remove(id).await?;
        let forgotten = self.resolver.forget_operation(id).await;
        if forgotten > 0 {
            debug!("Dropped {} conflicts of discarded operation {}", forgotten, id);
        }
        Ok(removed)
    }

    /// Run once, rejecting if another run is active
    pub async fn synchronize(&self) -> Result<SyncResult> {
        self.synchronize_with(SyncOptions::default()).await
    }

    /// Run once with options, rejecting if another run is active
    pub async fn synchronize_with(&self, options: SyncOptions) -> Result<SyncResult> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            debug!("Sync already in progress, rejecting");
            return Err(Error::SyncInProgress);
        };
        self.run(options).await
    }

    /// Run once, waiting for any active run to finish first
    pub async fn synchronize_queued(&self, options: SyncOptions) -> Result<SyncResult> {
        let _guard = self.run_guard.lock().await;
        self.run(options).await
    }

    async fn run(&self, options: SyncOptions) -> Result<SyncResult> {
        let options = self.policy.apply_to(options).await?;
        let run_id = options.run_id.unwrap_or_else(Uuid::new_v4);
        let limit = options
            .max_operations
            .map_or(self.batch_limit.load(Ordering::SeqCst), |max| {
                max.min(self.batch_limit.load(Ordering::SeqCst))
            });
        self.cancel.reset();

        let started_at = Utc::now();
        let clock = Instant::now();
        let total = self.queue.len().await.min(limit);
        self.reporter.started(run_id, total).await;

        let mut run = RunState::new(
            run_id,
            CallOptions {
                compress: options.compress,
            },
        );
        let blocked = self.resolver.blocked_operations().await;
        let mut drained = false;

        loop {
            if self.cancel.is_cancelled() || options.cancel.is_cancelled() {
                info!("Sync run {} cancelled", run_id);
                run.cancelled = true;
                break;
            }
            if !self.is_online() {
                if run.processed == 0 && !self.queue.is_empty().await {
                    run.error = Some("device is offline".to_string());
                }
                break;
            }
            if run.processed >= limit {
                debug!("Batch limit {} reached", limit);
                break;
            }

            let Some(op) = self.queue.next_ready(&run.seen).await else {
                drained = true;
                break;
            };
            run.seen.insert(op.id);

            if blocked.contains(&op.id) {
                self.skip(&mut run, op.id, SkipReason::ConflictPending).await;
                continue;
            }
            if !options.allows(&op.entity_type) {
                self.skip(&mut run, op.id, SkipReason::PolicyDisabled).await;
                continue;
            }

            run.processed += 1;
            if let Err(e) = self.queue.record_attempt(op.id).await {
                self.abort(&mut run, &e);
                break;
            }
            if self.process(&mut run, &op).await == Flow::Stop {
                break;
            }
        }

        if drained {
            // Whatever is left unseen is waiting on a dependency that stayed queued
            for op in self.queue.list().await {
                if !run.seen.contains(&op.id) {
                    self.skip(&mut run, op.id, SkipReason::DependencyPending)
                        .await;
                }
            }
        }

        let queued: HashSet<OperationId> = self.queue.list().await.iter().map(|op| op.id).collect();
        let status = SyncResult::status_for(
            run.completed,
            run.failed,
            run.error.as_deref(),
            run.cancelled && !queued.is_empty(),
        );
        let result = SyncResult {
            run_id,
            status,
            success: run.failed == 0 && run.error.is_none(),
            total,
            completed: run.completed,
            failed: run.failed,
            failed_operations: run.failed_operations,
            skipped: run.skipped,
            conflicts: run.conflicts,
            cancelled: run.cancelled,
            remaining: queued.len(),
            error: run.error,
            network: run.network,
            started_at,
            ended_at: Utc::now(),
            duration: clock.elapsed(),
        };

        // The result keeps its own copies
        self.resolver.prune(&queued).await;

        let shared = Arc::new(result.clone());
        *self.last_result.write().await = Some(shared.clone());
        self.reporter.finished(shared).await;
        Ok(result)
    }

    async fn process(&self, run: &mut RunState, op: &Operation) -> Flow {
        let rejection = match self.invoke(run, op).await {
            Ok(()) => return self.applied(run, op).await,
            Err(rejection) => rejection,
        };

        match self.classifier.classify(&rejection) {
            FailureClass::Transient => self.transient(run, op, rejection).await,
            FailureClass::Permanent => self.permanent(run, op, rejection).await,
            FailureClass::Conflict => self.conflict(run, op, rejection).await,
        }
    }

    async fn conflict(&self, run: &mut RunState, op: &Operation, rejection: BackendError) -> Flow {
        let Some(conflict) = self.resolver.add_conflict(run.run_id, op, &rejection).await else {
            debug!(
                "Conflict rejection on {} has no conflict type, treating as permanent",
                op.description()
            );
            return self.permanent(run, op, rejection).await;
        };

        let (policy, outcome) = self.resolver.decide(&conflict).await;
        match outcome {
            ResolutionOutcome::KeepRemote => {
                let conflict = self
                    .resolver
                    .mark_resolved(conflict.id, Some(policy), outcome)
                    .await
                    .unwrap_or(conflict);
                run.conflicts.push(conflict);
                self.applied(run, op).await
            }
            ResolutionOutcome::KeepLocal => self.force_local(run, op, conflict, policy).await,
            ResolutionOutcome::Deferred => self.unresolved(run, op, conflict, rejection).await,
        }
    }

    /// Persist the decision to force the local change, then resend it once
    async fn force_local(
        &self,
        run: &mut RunState,
        op: &Operation,
        conflict: Conflict,
        policy: ResolutionPolicy,
    ) -> Flow {
        let forced = Operation {
            params: op.params.without_precondition(),
            ..op.clone()
        };
        if let Err(e) = self.queue.replace_params(op.id, forced.params.clone()).await {
            run.conflicts.push(conflict);
            return self.abort(run, &e);
        }
        let conflict = self
            .resolver
            .mark_resolved(conflict.id, Some(policy), ResolutionOutcome::KeepLocal)
            .await
            .unwrap_or(conflict);

        let rejection = match self.invoke(run, &forced).await {
            Ok(()) => {
                run.conflicts.push(conflict);
                return self.applied(run, op).await;
            }
            Err(rejection) => rejection,
        };

        match self.classifier.classify(&rejection) {
            FailureClass::Transient => {
                run.conflicts.push(conflict);
                self.transient(run, op, rejection).await
            }
            FailureClass::Permanent => {
                run.conflicts.push(conflict);
                self.permanent(run, op, rejection).await
            }
            FailureClass::Conflict => {
                warn!("Forced resend of {} conflicted again", op.description());
                let conflict = self
                    .resolver
                    .mark_resolved(conflict.id, Some(policy), ResolutionOutcome::Deferred)
                    .await
                    .unwrap_or(conflict);
                self.unresolved(run, op, conflict, rejection).await
            }
        }
    }

    async fn applied(&self, run: &mut RunState, op: &Operation) -> Flow {
        if let Err(e) = self.queue.remove(op.id).await {
            return self.abort(run, &e);
        }
        debug!("Synced {}", op.description());
        run.completed += 1;
        self.reporter.operation_synced(op.id).await;
        Flow::Continue
    }

    async fn transient(&self, run: &mut RunState, op: &Operation, rejection: BackendError) -> Flow {
        warn!(
            "Transient failure on {}: {}; stopping run",
            op.description(),
            rejection
        );
        run.failed += 1;
        run.failed_operations.push(FailedOperation {
            operation_id: op.id,
            class: FailureClass::Transient,
            error: rejection,
            discarded: false,
        });
        self.reporter.operation_failed().await;
        Flow::Stop
    }

    async fn permanent(&self, run: &mut RunState, op: &Operation, rejection: BackendError) -> Flow {
        if let Err(e) = self.queue.remove(op.id).await {
            return self.abort(run, &e);
        }
        warn!("Discarded {}: {}", op.description(), rejection);
        run.failed += 1;
        run.failed_operations.push(FailedOperation {
            operation_id: op.id,
            class: FailureClass::Permanent,
            error: rejection,
            discarded: true,
        });
        self.reporter.operation_failed().await;
        Flow::Continue
    }

    async fn unresolved(
        &self,
        run: &mut RunState,
        op: &Operation,
        conflict: Conflict,
        rejection: BackendError,
    ) -> Flow {
        info!("Unresolved {}, keeping operation queued", conflict.description());
        run.failed += 1;
        run.failed_operations.push(FailedOperation {
            operation_id: op.id,
            class: FailureClass::Conflict,
            error: rejection,
            discarded: false,
        });
        self.reporter
            .conflict_unresolved(conflict.id, op.id)
            .await;
        run.conflicts.push(conflict);
        Flow::Continue
    }

    async fn skip(&self, run: &mut RunState, operation_id: OperationId, reason: SkipReason) {
        debug!("Skipping operation {}: {:?}", operation_id, reason);
        run.skipped.push(SkippedOperation {
            operation_id,
            reason,
        });
        self.reporter.operation_skipped().await;
    }

    fn abort(&self, run: &mut RunState, e: &Error) -> Flow {
        error!("Sync run {} aborted: {}", run.run_id, e);
        run.error = Some(e.to_string());
        Flow::Stop
    }

    async fn invoke(
        &self,
        run: &mut RunState,
        op: &Operation,
    ) -> std::result::Result<(), BackendError> {
        let payload = op.to_payload();
        let sent = serde_json::to_vec(&payload).map_or(0, |bytes| bytes.len());
        let started = Instant::now();
        let response = self
            .backend
            .invoke_with(&op.method, &payload, run.call)
            .await;
        let latency = started.elapsed();

        match response {
            Ok(value) => {
                let received = serde_json::to_vec(&value).map_or(0, |bytes| bytes.len());
                run.network.record(sent, received, latency, false);
                Ok(())
            }
            Err(rejection) => {
                run.network.record(sent, 0, latency, true);
                Err(rejection)
            }
        }
    }
}

impl Cancellable for SyncCoordinator {
    fn cancel(&self) {
        if self.is_running() {
            info!("Cancelling active sync run");
            self.cancel.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("online", &self.is_online())
            .field("batch_limit", &self.batch_limit())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyState;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use outbox_queue::MemoryStore;
    use outbox_types::{ConflictCause, NewOperation, OperationParams, RemoteState};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Backend answering per method from a script, recording every call
    #[derive(Default)]
    struct FakeBackend {
        script: StdMutex<HashMap<String, Vec<std::result::Result<Value, BackendError>>>>,
        calls: StdMutex<Vec<(String, Value)>>,
        delay: Option<std::time::Duration>,
    }

    impl FakeBackend {
        fn respond(&self, method: &str, response: std::result::Result<Value, BackendError>) {
            self.script
                .lock()
                .unwrap()
                .entry(method.to_string())
                .or_default()
                .push(response);
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn invoke(
            &self,
            method: &str,
            params: &Value,
        ) -> std::result::Result<Value, BackendError> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut script = self.script.lock().unwrap();
            match script.get_mut(method) {
                Some(responses) if !responses.is_empty() => responses.remove(0),
                _ => Ok(json!({"ok": true})),
            }
        }
    }

    struct Fixture {
        queue: Arc<OperationQueue>,
        backend: Arc<FakeBackend>,
        coordinator: Arc<SyncCoordinator>,
    }

    fn fixture_with(backend: FakeBackend, config: SyncConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(OperationQueue::open(store).unwrap());
        let backend = Arc::new(backend);
        let policy = Arc::new(SelectiveSyncPolicy::new(PolicyState::default()));
        let coordinator = Arc::new(
            SyncCoordinator::new(queue.clone(), backend.clone(), policy, &config).unwrap(),
        );
        Fixture {
            queue,
            backend,
            coordinator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeBackend::default(), SyncConfig::default())
    }

    fn create(title: &str) -> NewOperation {
        NewOperation::create("tasks.create", "task", json!({ "title": title }))
    }

    #[tokio::test]
    async fn test_drains_queue_in_order() {
        let f = fixture();
        f.queue.enqueue(create("a")).await.unwrap();
        f.queue.enqueue(create("b")).await.unwrap();

        let result = f.coordinator.synchronize().await.unwrap();

        assert_eq!(result.status, SyncStatus::Completed);
        assert!(result.success);
        assert_eq!(result.completed, 2);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.network.requests, 2);
        let titles: Vec<_> = f
            .backend
            .calls()
            .iter()
            .map(|(_, params)| params["values"]["title"].clone())
            .collect();
        assert_eq!(titles, vec![json!("a"), json!("b")]);
        assert_eq!(f.coordinator.status().await, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn test_empty_queue_completes() {
        let f = fixture();
        let result = f.coordinator.synchronize().await.unwrap();
        assert_eq!(result.status, SyncStatus::Completed);
        assert_eq!(result.total, 0);
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_stops_run() {
        let f = fixture();
        f.backend
            .respond("tasks.create", Err(BackendError::unreachable("no route")));
        f.queue.enqueue(create("a")).await.unwrap();
        f.queue.enqueue(create("b")).await.unwrap();

        let result = f.coordinator.synchronize().await.unwrap();

        assert_eq!(result.status, SyncStatus::Failed);
        assert_eq!(result.failed, 1);
        assert_eq!(result.remaining, 2);
        assert_eq!(f.backend.calls().len(), 1);
        assert_eq!(f.queue.list().await[0].attempts, 1);
        assert!(!result.failed_operations[0].discarded);
    }

    #[tokio::test]
    async fn test_permanent_failure_discards_and_continues() {
        let f = fixture();
        f.backend
            .respond("tasks.create", Err(BackendError::validation("title too long")));
        let bad = f.queue.enqueue(create("a")).await.unwrap();
        f.queue.enqueue(create("b")).await.unwrap();

        let result = f.coordinator.synchronize().await.unwrap();

        assert_eq!(result.status, SyncStatus::PartiallyCompleted);
        assert!(!result.success);
        assert_eq!(result.completed, 1);
        assert_eq!(result.failed_operations[0].operation_id, bad);
        assert!(result.failed_operations[0].discarded);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_run_fails_without_calls() {
        let f = fixture();
        f.queue.enqueue(create("a")).await.unwrap();
        f.coordinator.set_online(false);

        let result = f.coordinator.synchronize().await.unwrap();

        assert_eq!(result.status, SyncStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("device is offline"));
        assert!(f.backend.calls().is_empty());
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_batch_limit() {
        let f = fixture();
        for title in ["a", "b", "c"] {
            f.queue.enqueue(create(title)).await.unwrap();
        }
        f.coordinator.set_batch_limit(Some(2));

        let result = f.coordinator.synchronize().await.unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.completed, 2);
        assert_eq!(result.remaining, 1);

        let result = f
            .coordinator
            .synchronize_with(SyncOptions::new().with_max_operations(5))
            .await
            .unwrap();
        assert_eq!(result.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_rejected() {
        let backend = FakeBackend {
            delay: Some(std::time::Duration::from_secs(1)),
            ..FakeBackend::default()
        };
        let f = fixture_with(backend, SyncConfig::default());
        f.queue.enqueue(create("a")).await.unwrap();

        let coordinator = f.coordinator.clone();
        let first = tokio::spawn(async move { coordinator.synchronize().await });
        tokio::task::yield_now().await;

        assert!(f.coordinator.is_running());
        assert_eq!(
            f.coordinator.synchronize().await.unwrap_err(),
            Error::SyncInProgress
        );

        let queued = f.coordinator.synchronize_queued(SyncOptions::new());
        let (first, queued) = tokio::join!(first, queued);
        assert_eq!(first.unwrap().unwrap().completed, 1);
        assert_eq!(queued.unwrap().total, 0);
        assert_eq!(f.backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_policy_disabled_type_is_skipped() {
        let f = fixture();
        f.coordinator.policy().disable("note").await.unwrap();
        let note = f
            .queue
            .enqueue(NewOperation::create("notes.create", "note", json!({})))
            .await
            .unwrap();
        f.queue.enqueue(create("a")).await.unwrap();

        let result = f.coordinator.synchronize().await.unwrap();

        assert_eq!(result.completed, 1);
        assert_eq!(
            result.skipped,
            vec![SkippedOperation {
                operation_id: note,
                reason: SkipReason::PolicyDisabled
            }]
        );
        assert!(f.queue.contains(note).await);
    }

    #[tokio::test]
    async fn test_globally_disabled_is_rejected() {
        let f = fixture();
        f.coordinator.policy().set_global(false).await.unwrap();
        assert_eq!(
            f.coordinator.synchronize().await.unwrap_err(),
            Error::SyncDisabled
        );
        assert_eq!(f.coordinator.status().await, SyncStatus::Idle);
    }

    fn stale_update() -> NewOperation {
        NewOperation::update("tasks.update", "task", "t-1", json!({"title": "local"}))
            .with_base_version(3)
    }

    fn remote_conflict(modified_at: chrono::DateTime<Utc>) -> BackendError {
        BackendError::conflict(ConflictCause::RemoteUpdated, "version mismatch").with_remote(
            RemoteState {
                data: json!({"title": "remote"}),
                version: Some(4),
                modified_at: Some(modified_at),
            },
        )
    }

    #[tokio::test]
    async fn test_last_write_wins_keeps_newer_local_change() {
        let f = fixture();
        f.backend.respond(
            "tasks.update",
            Err(remote_conflict(Utc::now() - ChronoDuration::hours(1))),
        );
        f.queue.enqueue(stale_update()).await.unwrap();

        let result = f.coordinator.synchronize().await.unwrap();

        assert!(result.success);
        assert_eq!(result.conflicts.len(), 1);
        assert!(result.conflicts[0].resolved);
        let calls = f.backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1["base_version"], json!(3));
        assert!(calls[1].1.get("base_version").is_none());
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_last_write_wins_drops_older_local_change() {
        let f = fixture();
        f.backend.respond(
            "tasks.update",
            Err(remote_conflict(Utc::now() + ChronoDuration::hours(1))),
        );
        f.queue.enqueue(stale_update()).await.unwrap();

        let result = f.coordinator.synchronize().await.unwrap();

        assert!(result.success);
        assert_eq!(result.completed, 1);
        assert_eq!(f.backend.calls().len(), 1);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_deferred_conflict_blocks_until_caller_decides() {
        let config = SyncConfig {
            conflict_policy: ResolutionPolicy::DeferToCaller,
            ..SyncConfig::default()
        };
        let f = fixture_with(FakeBackend::default(), config);
        f.backend
            .respond("tasks.update", Err(remote_conflict(Utc::now())));
        let id = f.queue.enqueue(stale_update()).await.unwrap();
        let mut events = f.coordinator.subscribe();

        let result = f.coordinator.synchronize().await.unwrap();
        assert_eq!(result.status, SyncStatus::Failed);
        assert_eq!(result.unresolved_conflicts().count(), 1);
        assert!(f.queue.contains(id).await);

        let mut unresolved = false;
        while let Ok(event) = events.try_recv() {
            unresolved |= matches!(event, SyncEvent::ConflictUnresolved { operation_id, .. } if operation_id == id);
        }
        assert!(unresolved);

        // Blocked on the next run
        let result = f.coordinator.synchronize().await.unwrap();
        assert_eq!(result.skipped[0].reason, SkipReason::ConflictPending);
        assert_eq!(f.backend.calls().len(), 1);

        let conflict_id = f.coordinator.unresolved_conflicts().await[0].id;
        f.coordinator
            .resolve_conflict(conflict_id, ResolutionOutcome::KeepLocal)
            .await
            .unwrap();
        assert!(matches!(
            f.queue.get(id).await.unwrap().params,
            OperationParams::Update {
                base_version: None,
                ..
            }
        ));

        let result = f.coordinator.synchronize().await.unwrap();
        assert!(result.success);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_resolved_conflicts_are_pruned_after_run() {
        let f = fixture();
        f.backend.respond(
            "tasks.update",
            Err(remote_conflict(Utc::now() + ChronoDuration::hours(1))),
        );
        f.queue.enqueue(stale_update()).await.unwrap();

        let result = f.coordinator.synchronize().await.unwrap();

        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(f.coordinator.conflict_stats().await.total_conflicts, 0);
        let last = f.coordinator.last_result().await.unwrap();
        assert!(last.conflicts[0].resolved);
    }

    #[tokio::test]
    async fn test_discard_drops_deferred_conflict() {
        let config = SyncConfig {
            conflict_policy: ResolutionPolicy::DeferToCaller,
            ..SyncConfig::default()
        };
        let f = fixture_with(FakeBackend::default(), config);
        f.backend
            .respond("tasks.update", Err(remote_conflict(Utc::now())));
        let id = f.queue.enqueue(stale_update()).await.unwrap();

        f.coordinator.synchronize().await.unwrap();
        assert_eq!(f.coordinator.unresolved_conflicts().await.len(), 1);

        assert!(f.coordinator.discard(id).await.unwrap());
        assert!(f.coordinator.unresolved_conflicts().await.is_empty());
        assert!(!f.coordinator.discard(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_run_is_partial() {
        let f = fixture();
        f.queue.enqueue(create("a")).await.unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = f
            .coordinator
            .synchronize_with(SyncOptions::new().with_cancel(cancel))
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.remaining, 1);
        assert_eq!(result.status, SyncStatus::PartiallyCompleted);
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_pending_is_reported() {
        let f = fixture();
        f.backend
            .respond("tasks.create", Err(BackendError::unreachable("flaky")));
        let parent = f.queue.enqueue(create("parent")).await.unwrap();
        f.queue
            .enqueue(
                NewOperation::create("comments.create", "comment", json!({}))
                    .depends_on(parent),
            )
            .await
            .unwrap();

        // Transient failure stops the run before the dependent is reached
        let result = f.coordinator.synchronize().await.unwrap();
        assert!(result.skipped.is_empty());
        assert_eq!(f.queue.len().await, 2);

        let result = f.coordinator.synchronize().await.unwrap();
        assert_eq!(result.completed, 2);
        let methods: Vec<_> = f.backend.calls().into_iter().map(|(m, _)| m).collect();
        assert_eq!(methods, vec!["tasks.create", "tasks.create", "comments.create"]);
    }

    #[tokio::test]
    async fn test_terminal_event_emitted_once() {
        let f = fixture();
        f.queue.enqueue(create("a")).await.unwrap();
        let mut events = f.coordinator.subscribe();

        let result = f.coordinator.synchronize().await.unwrap();

        let mut terminal = 0;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.run_id(), result.run_id);
            if event.is_terminal() {
                terminal += 1;
            }
        }
        assert_eq!(terminal, 1);
        assert_eq!(f.coordinator.last_result().await.unwrap().run_id, result.run_id);
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_run() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(OperationQueue::open(store.clone()).unwrap());
        queue.enqueue(create("a")).await.unwrap();
        let policy = Arc::new(SelectiveSyncPolicy::new(PolicyState::default()));
        let coordinator = SyncCoordinator::new(
            queue.clone(),
            Arc::new(FakeBackend::default()),
            policy,
            &SyncConfig::default(),
        )
        .unwrap();

        store.set_fail_writes(true);
        let result = coordinator.synchronize().await.unwrap();

        assert_eq!(result.status, SyncStatus::Failed);
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(queue.len().await, 1);
    }
}
