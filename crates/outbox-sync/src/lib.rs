//! Operation replay and synchronization for outbox
//!
//! This crate turns the durable operation queue into backend calls:
//!
//! - **Sync Coordinator**: at most one run at a time, FIFO replay, batch caps
//! - **Failure Classification**: transient, permanent and conflict handling
//! - **Conflict Resolution**: deterministic policies with caller deferral
//! - **Selective Sync**: per entity type switches, required types, dependencies
//! - **Sessions**: device registry and cross-device sync sessions
//! - **Progress Tracking**: incremental progress and run events
//!
//! # Examples
//!
//! ```rust
//! use outbox_config::SyncConfig;
//! use outbox_queue::{MemoryStore, OperationQueue};
//! use outbox_sync::{PolicyState, SelectiveSyncPolicy, SyncCoordinator};
//! use outbox_types::{Backend, BackendError, NewOperation, SyncStatus};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct Accepting;
//!
//! #[async_trait::async_trait]
//! impl Backend for Accepting {
//!     async fn invoke(&self, _method: &str, _params: &Value) -> Result<Value, BackendError> {
//!         Ok(json!({}))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let queue = Arc::new(OperationQueue::open(Arc::new(MemoryStore::new()))?);
//! let policy = Arc::new(SelectiveSyncPolicy::new(PolicyState::default()));
//! let coordinator =
//!     SyncCoordinator::new(queue.clone(), Arc::new(Accepting), policy, &SyncConfig::default())?;
//!
//! queue
//!     .enqueue(NewOperation::create("tasks.create", "task", json!({"title": "Ship it"})))
//!     .await?;
//! let result = coordinator.synchronize().await?;
//! assert_eq!(result.status, SyncStatus::Completed);
//! # Ok::<(), outbox_types::Error>(())
//! # });
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod classify;
pub mod conflict;
pub mod coordinator;
pub mod options;
pub mod policy;
pub mod progress;
pub mod result;
pub mod session;

pub use classify::{FailureClassifier, PolicyClassifier};
pub use conflict::{
    resolve, Conflict, ConflictResolver, ConflictStats, ConflictType, LocalState, Resolution,
    ResolutionOutcome,
};
pub use coordinator::SyncCoordinator;
pub use options::{CancelFlag, SyncOptions};
pub use policy::{EntityRule, PolicyState, SelectiveSyncPolicy, TransferOptions, POLICY_KEY};
pub use progress::{ProgressReporter, SyncEvent, SyncProgress};
pub use result::{
    FailedOperation, NetworkStats, SkipReason, SkippedOperation, SyncResult,
};
pub use session::{ListenerId, SessionManager, SessionOptions, SyncSession};
