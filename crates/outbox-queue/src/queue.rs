//! Durable operation queue
//!
//! The queue is the single owner of buffered operations. All access goes
//! through its methods, which serialize on an internal mutex. Every mutation
//! writes a full snapshot to the key-value store before it returns and before
//! the in-memory state changes, so a failed write leaves the queue exactly as
//! it was and a successful return survives a crash.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use outbox_types::{
    Error, KeyValueStore, NewOperation, Operation, OperationId, OperationParams, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Default store key for the queue snapshot
pub const QUEUE_KEY: &str = "queue/operations";

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    version: u32,
    next_id: OperationId,
    operations: Vec<Operation>,
}

#[derive(Debug)]
struct QueueState {
    operations: Vec<Operation>,
    next_id: OperationId,
}

impl QueueState {
    fn position(&self, id: OperationId) -> Option<usize> {
        self.operations.iter().position(|op| op.id == id)
    }

    fn contains(&self, id: OperationId) -> bool {
        self.position(id).is_some()
    }

    fn last_created_at(&self) -> Option<DateTime<Utc>> {
        self.operations.iter().map(|op| op.created_at).max()
    }
}

/// Ordered, durable log of pending operations
pub struct OperationQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
    state: Mutex<QueueState>,
    len_tx: watch::Sender<usize>,
}

impl OperationQueue {
    /// Open the queue persisted in `store`, or an empty one
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        Self::open_with_key(store, QUEUE_KEY)
    }

    /// Open the queue persisted under a custom key
    pub fn open_with_key(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let state = match store.load(&key)? {
            Some(bytes) => {
                let snapshot: QueueSnapshot = serde_json::from_slice(&bytes)?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(Error::serialization(format!(
                        "Unsupported queue snapshot version {}",
                        snapshot.version
                    )));
                }
                info!(
                    "Loaded {} buffered operations from '{}'",
                    snapshot.operations.len(),
                    key
                );
                QueueState {
                    operations: snapshot.operations,
                    next_id: snapshot.next_id,
                }
            }
            None => QueueState {
                operations: Vec::new(),
                next_id: 1,
            },
        };

        let (len_tx, _) = watch::channel(state.operations.len());
        Ok(Self {
            store,
            key,
            state: Mutex::new(state),
            len_tx,
        })
    }

    /// Append an operation, persist, and return its identifier
    pub async fn enqueue(&self, request: NewOperation) -> Result<OperationId> {
        let mut state = self.state.lock().await;

        let id = request.id.unwrap_or(state.next_id);
        if state.contains(id) {
            return Err(Error::DuplicateOperation { id });
        }
        if request.depends_on == Some(id) {
            return Err(Error::invalid_state(format!(
                "Operation {} cannot depend on itself",
                id
            )));
        }

        // Strictly increasing even if the wall clock stalls or steps back
        let now = Utc::now();
        let created_at = match state.last_created_at() {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };

        let operation = Operation {
            id,
            method: request.method,
            params: request.params,
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            depends_on: request.depends_on,
            created_at,
            attempts: 0,
        };
        debug!("Enqueue {}", operation.description());

        let mut operations = state.operations.clone();
        operations.push(operation);
        let next_id = state.next_id.max(id.saturating_add(1));

        self.commit(&mut state, operations, next_id)?;
        Ok(id)
    }

    /// First operation in FIFO order that is not in `exclude` and whose
    /// dependency has left the queue
    pub async fn next_ready(&self, exclude: &HashSet<OperationId>) -> Option<Operation> {
        let state = self.state.lock().await;
        state
            .operations
            .iter()
            .find(|op| {
                !exclude.contains(&op.id)
                    && op.depends_on.map_or(true, |dep| !state.contains(dep))
            })
            .cloned()
    }

    /// Snapshot of all operations in replay order: FIFO, except that an
    /// operation never precedes the dependency it names
    pub async fn dequeue_in_order(&self) -> Vec<Operation> {
        let state = self.state.lock().await;
        dependency_order(&state.operations)
    }

    /// Remove an operation. Unknown identifiers are a no-op.
    pub async fn remove(&self, id: OperationId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(position) = state.position(id) else {
            return Ok(false);
        };

        let mut operations = state.operations.clone();
        let removed = operations.remove(position);
        let next_id = state.next_id;
        self.commit(&mut state, operations, next_id)?;
        debug!("Removed {}", removed.description());
        Ok(true)
    }

    /// Remove every operation, returning how many were dropped
    pub async fn clear(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let count = state.operations.len();
        if count == 0 {
            return Ok(0);
        }

        let next_id = state.next_id;
        self.commit(&mut state, Vec::new(), next_id)?;
        info!("Cleared {} buffered operations", count);
        Ok(count)
    }

    /// Count a replay attempt against an operation
    pub async fn record_attempt(&self, id: OperationId) -> Result<u32> {
        let mut state = self.state.lock().await;
        let Some(position) = state.position(id) else {
            return Err(Error::invalid_state(format!(
                "Operation {} is not queued",
                id
            )));
        };

        let mut operations = state.operations.clone();
        operations[position].attempts += 1;
        let attempts = operations[position].attempts;
        let next_id = state.next_id;
        self.commit(&mut state, operations, next_id)?;
        Ok(attempts)
    }

    /// Replace the parameters of a queued operation, keeping its position
    pub async fn replace_params(&self, id: OperationId, params: OperationParams) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(position) = state.position(id) else {
            return Err(Error::invalid_state(format!(
                "Operation {} is not queued",
                id
            )));
        };

        let mut operations = state.operations.clone();
        operations[position].params = params;
        let next_id = state.next_id;
        self.commit(&mut state, operations, next_id)
    }

    /// Number of queued operations
    pub async fn len(&self) -> usize {
        self.state.lock().await.operations.len()
    }

    /// Whether the queue is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of all operations in enqueue order
    pub async fn list(&self) -> Vec<Operation> {
        self.state.lock().await.operations.clone()
    }

    /// Look up an operation
    pub async fn get(&self, id: OperationId) -> Option<Operation> {
        let state = self.state.lock().await;
        state.position(id).map(|position| state.operations[position].clone())
    }

    /// Whether an operation is queued
    pub async fn contains(&self, id: OperationId) -> bool {
        self.state.lock().await.contains(id)
    }

    /// Receive the queue length after every mutation
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.len_tx.subscribe()
    }

    fn commit(
        &self,
        state: &mut QueueState,
        operations: Vec<Operation>,
        next_id: OperationId,
    ) -> Result<()> {
        let snapshot = QueueSnapshot {
            version: SNAPSHOT_VERSION,
            next_id,
            operations,
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        self.store.save(&self.key, &bytes)?;

        state.operations = snapshot.operations;
        state.next_id = snapshot.next_id;
        self.len_tx.send_replace(state.operations.len());
        Ok(())
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("key", &self.key)
            .field("len", &*self.len_tx.borrow())
            .finish_non_exhaustive()
    }
}

/// Stable topological order: among ready operations the earliest enqueued
/// goes first. Dependencies on operations no longer queued count as
/// satisfied; a dependency cycle is broken in enqueue order.
pub fn dependency_order(operations: &[Operation]) -> Vec<Operation> {
    let index: HashMap<OperationId, usize> = operations
        .iter()
        .enumerate()
        .map(|(i, op)| (op.id, i))
        .collect();

    let mut waiting: Vec<Option<usize>> = operations
        .iter()
        .map(|op| op.depends_on.and_then(|dep| index.get(&dep).copied()))
        .collect();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, dep) in waiting.iter().enumerate() {
        if let Some(dep) = dep {
            dependents.entry(*dep).or_default().push(i);
        }
    }

    let mut emitted = vec![false; operations.len()];
    let mut ordered = Vec::with_capacity(operations.len());
    let mut ready: VecDeque<usize> = (0..operations.len())
        .filter(|i| waiting[*i].is_none())
        .collect();

    loop {
        while let Some(i) = pop_min(&mut ready) {
            emitted[i] = true;
            ordered.push(operations[i].clone());
            for &child in dependents.get(&i).map(Vec::as_slice).unwrap_or_default() {
                // Already released when a cycle was broken
                if waiting[child].take().is_some() {
                    ready.push_back(child);
                }
            }
        }

        match emitted.iter().position(|done| !done) {
            Some(stuck) => {
                warn!(
                    "Dependency cycle at operation {}, releasing in enqueue order",
                    operations[stuck].id
                );
                waiting[stuck] = None;
                ready.push_back(stuck);
            }
            None => break,
        }
    }

    ordered
}

fn pop_min(ready: &mut VecDeque<usize>) -> Option<usize> {
    let (position, _) = ready.iter().enumerate().min_by_key(|(_, i)| **i)?;
    ready.remove(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use outbox_types::{NewOperation, OperationKind};
    use proptest::prelude::*;
    use serde_json::json;

    fn create(title: &str) -> NewOperation {
        NewOperation::create("tasks.create", "task", json!({ "title": title }))
    }

    fn open(store: &Arc<MemoryStore>) -> OperationQueue {
        OperationQueue::open(store.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_monotonic_ids() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);

        let a = queue.enqueue(create("a")).await.unwrap();
        let b = queue.enqueue(create("b")).await.unwrap();
        assert!(b > a);

        let ops = queue.list().await;
        assert!(ops[0].created_at < ops[1].created_at);
        assert_eq!(ops[0].kind(), OperationKind::Create);
    }

    #[tokio::test]
    async fn test_explicit_id_and_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);

        assert_eq!(queue.enqueue(create("a").with_id(10)).await.unwrap(), 10);
        assert_eq!(
            queue.enqueue(create("b").with_id(10)).await,
            Err(Error::DuplicateOperation { id: 10 })
        );
        // Assignment continues past explicit ids
        assert_eq!(queue.enqueue(create("c")).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_self_dependency_rejected() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);
        assert!(queue.enqueue(create("a").with_id(1).depends_on(1)).await.is_err());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_and_clear_are_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);

        assert!(!queue.remove(42).await.unwrap());
        assert_eq!(queue.clear().await.unwrap(), 0);

        let id = queue.enqueue(create("a")).await.unwrap();
        assert!(queue.remove(id).await.unwrap());
        assert!(!queue.remove(id).await.unwrap());
        assert_eq!(queue.clear().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_restart() {
        let store = Arc::new(MemoryStore::new());
        let id = {
            let queue = open(&store);
            let id = queue.enqueue(create("a")).await.unwrap();
            queue.remove(id).await.unwrap();
            id
        };

        let queue = open(&store);
        assert!(queue.enqueue(create("b")).await.unwrap() > id);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_queue_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);
        let id = queue.enqueue(create("a")).await.unwrap();

        store.set_fail_writes(true);
        assert!(queue.enqueue(create("b")).await.is_err());
        assert!(queue.remove(id).await.is_err());
        assert_eq!(queue.len().await, 1);

        store.set_fail_writes(false);
        let reopened = open(&store);
        assert_eq!(reopened.list().await, queue.list().await);
    }

    #[tokio::test]
    async fn test_next_ready_respects_dependencies() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);

        // The dependent is enqueued first but must wait for its parent
        let parent_id = 100;
        let child = queue
            .enqueue(create("child").depends_on(parent_id))
            .await
            .unwrap();
        queue.enqueue(create("parent").with_id(parent_id)).await.unwrap();

        let first = queue.next_ready(&HashSet::new()).await.unwrap();
        assert_eq!(first.id, parent_id);

        // While the parent is excluded (failed this run) the child stays blocked
        let excluded: HashSet<_> = [parent_id].into_iter().collect();
        assert!(queue.next_ready(&excluded).await.is_none());

        queue.remove(parent_id).await.unwrap();
        assert_eq!(queue.next_ready(&HashSet::new()).await.unwrap().id, child);
    }

    #[tokio::test]
    async fn test_dependency_on_unknown_operation_is_satisfied() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);
        let id = queue.enqueue(create("a").depends_on(999)).await.unwrap();
        assert_eq!(queue.next_ready(&HashSet::new()).await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_record_attempt_persists() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);
        let id = queue.enqueue(create("a")).await.unwrap();

        assert_eq!(queue.record_attempt(id).await.unwrap(), 1);
        assert_eq!(queue.record_attempt(id).await.unwrap(), 2);
        assert_eq!(open(&store).get(id).await.unwrap().attempts, 2);
        assert!(queue.record_attempt(77).await.is_err());
    }

    #[tokio::test]
    async fn test_replace_params_keeps_position() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);
        let first = queue
            .enqueue(NewOperation::update("tasks.update", "task", "t-1", json!({"a": 1})).with_base_version(2))
            .await
            .unwrap();
        queue.enqueue(create("b")).await.unwrap();

        let forced = queue.get(first).await.unwrap().params.without_precondition();
        queue.replace_params(first, forced.clone()).await.unwrap();

        let reloaded = open(&store);
        let head = reloaded.next_ready(&HashSet::new()).await.unwrap();
        assert_eq!(head.id, first);
        assert_eq!(head.params, forced);
        assert!(queue.replace_params(99, forced).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_reports_length() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);
        let mut rx = queue.subscribe();

        queue.enqueue(create("a")).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        queue.clear().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 0);
    }

    #[tokio::test]
    async fn test_dequeue_in_order_handles_cycles() {
        let store = Arc::new(MemoryStore::new());
        let queue = open(&store);
        queue.enqueue(create("a").with_id(1).depends_on(2)).await.unwrap();
        queue.enqueue(create("b").with_id(2).depends_on(1)).await.unwrap();
        queue.enqueue(create("c").with_id(3)).await.unwrap();

        let ids: Vec<_> = queue.dequeue_in_order().await.iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Enqueue(Option<usize>),
        Remove(usize),
        Clear,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            6 => proptest::option::of(0usize..8).prop_map(Step::Enqueue),
            3 => (0usize..8).prop_map(Step::Remove),
            1 => Just(Step::Clear),
        ]
    }

    proptest! {
        #[test]
        fn prop_reload_yields_identical_list(steps in proptest::collection::vec(step(), 0..40)) {
            tokio_test::block_on(async {
                let store = Arc::new(MemoryStore::new());
                let queue = open(&store);
                let mut ids: Vec<OperationId> = Vec::new();

                for step in steps {
                    match step {
                        Step::Enqueue(dep) => {
                            let mut request = create("x");
                            if let Some(dep) = dep.and_then(|i| ids.get(i).copied()) {
                                request = request.depends_on(dep);
                            }
                            ids.push(queue.enqueue(request).await.unwrap());
                        }
                        Step::Remove(i) => {
                            if let Some(id) = ids.get(i).copied() {
                                queue.remove(id).await.unwrap();
                            }
                        }
                        Step::Clear => {
                            queue.clear().await.unwrap();
                        }
                    }
                }

                let reopened = open(&store);
                assert_eq!(reopened.list().await, queue.list().await);
                assert_eq!(reopened.len().await, queue.len().await);
            });
        }

        #[test]
        fn prop_dependents_follow_dependencies(deps in proptest::collection::vec(proptest::option::of(0usize..20), 1..20)) {
            tokio_test::block_on(async {
                let store = Arc::new(MemoryStore::new());
                let queue = open(&store);

                // Operation i may depend on any id 1..=20, including later ones
                for (i, dep) in deps.iter().enumerate() {
                    let id = i as OperationId + 1;
                    let mut request = create("x").with_id(id);
                    if let Some(dep) = dep.map(|d| d as OperationId + 1).filter(|d| *d != id) {
                        request = request.depends_on(dep);
                    }
                    queue.enqueue(request).await.unwrap();
                }

                // Draining through next_ready never hands out a dependent early
                let mut drained = Vec::new();
                while let Some(op) = queue.next_ready(&HashSet::new()).await {
                    if let Some(dep) = op.depends_on {
                        assert!(!queue.contains(dep).await);
                    }
                    queue.remove(op.id).await.unwrap();
                    drained.push(op.id);
                }

                // Whatever remains is blocked by a cycle
                for op in queue.list().await {
                    let dep = op.depends_on.unwrap();
                    assert!(queue.contains(dep).await);
                }
                assert_eq!(drained.len() + queue.len().await, deps.len());
            });
        }
    }
}
