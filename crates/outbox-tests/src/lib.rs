//! outbox testing support
//!
//! Shared utilities for the end-to-end tests in `tests/`: a scriptable
//! backend and engine fixtures.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Scriptable backend and fixtures
pub mod test_utils;

pub use test_utils::{
    config_with, create_task, engine_with_store, init_tracing, memory_engine, strong_snapshot,
    update_task, RecordedCall, Reply, ScriptedBackend,
};
