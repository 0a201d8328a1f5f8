//! Durable operation queue for outbox
//!
//! Operations captured while offline are appended to an [`OperationQueue`],
//! which persists through a [`KeyValueStore`](outbox_types::KeyValueStore)
//! on every mutation and hands operations out in FIFO order, holding back any
//! operation whose dependency is still queued.
//!
//! # Examples
//!
//! ```rust
//! use outbox_queue::{MemoryStore, OperationQueue};
//! use outbox_types::NewOperation;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let queue = OperationQueue::open(Arc::new(MemoryStore::new()))?;
//! let create = queue
//!     .enqueue(NewOperation::create("tasks.create", "task", json!({"title": "Write docs"})))
//!     .await?;
//! queue
//!     .enqueue(NewOperation::update("tasks.update", "task", "t-1", json!({"done": true})).depends_on(create))
//!     .await?;
//! assert_eq!(queue.len().await, 2);
//! # Ok::<(), outbox_types::Error>(())
//! # });
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod queue;
pub mod store;

pub use queue::{dependency_order, OperationQueue, QUEUE_KEY};
pub use store::{FileStore, MemoryStore};
