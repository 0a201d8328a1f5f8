//! Background scheduling and the sync engine for outbox
//!
//! This crate ties the queue, coordinator, policy, capability monitor and
//! session manager into one [`SyncEngine`]:
//!
//! - **Capture**: mutating calls go straight to the backend when possible and
//!   are buffered otherwise
//! - **Scheduling**: a selectable strategy decides when the queue is replayed
//! - **Adaptation**: the capability tier caps batch size and polling rate
//! - **Statistics**: run outcomes are aggregated across the engine's lifetime
//!
//! # Examples
//!
//! ```rust
//! use async_trait::async_trait;
//! use outbox_config::Config;
//! use outbox_engine::{MutationOutcome, SyncEngine};
//! use outbox_queue::MemoryStore;
//! use outbox_types::{Backend, BackendError, NewOperation};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Backend for Echo {
//!     async fn invoke(&self, _method: &str, params: &Value) -> Result<Value, BackendError> {
//!         Ok(params.clone())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let engine = SyncEngine::builder(Config::default())
//!     .backend(Arc::new(Echo))
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()
//!     .unwrap();
//!
//! // Offline until told otherwise, so the request is buffered
//! let request = NewOperation::create("createTask", "task", json!({"title": "Write report"}));
//! assert!(matches!(engine.mutate(request).await.unwrap(), MutationOutcome::Queued(_)));
//!
//! engine.set_online(true).await;
//! let result = engine.synchronize().await.unwrap();
//! assert_eq!(result.completed, 1);
//! assert_eq!(engine.queue_len().await, 0);
//! # });
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod monitor;
pub mod scheduler;
pub mod task;

pub use engine::{EngineBuilder, MutationOutcome, SyncEngine};
pub use monitor::{StatisticsCollector, SyncStatistics};
pub use scheduler::{
    plan, BackgroundScheduler, IdleDetector, Plan, RunReport, SchedulePredicate,
    ScheduleStrategy, SchedulerOptions, SchedulingContext, SyncRunner, Trigger,
};
pub use task::ScheduledTask;
