//! Shared test utilities
//!
//! [`ScriptedBackend`] stands in for the remote backend: replies can be
//! scripted per method or per call position, and every call is logged so
//! tests can assert on replay order.

use async_trait::async_trait;
use outbox_config::{Config, StrategyConfig};
use outbox_device::StaticProbe;
use outbox_engine::SyncEngine;
use outbox_queue::MemoryStore;
use outbox_types::{
    Backend, BackendError, CallOptions, CapabilitySnapshot, KeyValueStore, NetworkQuality,
    NetworkType, NewOperation,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Reply to one backend call
pub type Reply = std::result::Result<Value, BackendError>;

/// One call observed by [`ScriptedBackend`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Method invoked
    pub method: String,
    /// Wire parameters
    pub params: Value,
    /// Compression hint the caller passed
    pub compress: bool,
}

/// Backend with scripted replies and a call log.
///
/// Reply lookup order for call `n` (1-based): a reply scripted for position
/// `n`, then the next reply queued for the method, then the fallback
/// (`{"ok": true}` unless changed).
#[derive(Debug)]
pub struct ScriptedBackend {
    by_call: Mutex<BTreeMap<usize, Reply>>,
    by_method: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallback: Mutex<Reply>,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            by_call: Mutex::new(BTreeMap::new()),
            by_method: Mutex::new(HashMap::new()),
            fallback: Mutex::new(Ok(json!({"ok": true}))),
            latency: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedBackend {
    /// Backend that accepts everything
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply for the `n`th call overall (1-based)
    pub fn reply_on_call(&self, n: usize, reply: Reply) -> &Self {
        lock(&self.by_call).insert(n, reply);
        self
    }

    /// Queue a reply for the next call to `method`
    pub fn reply_to(&self, method: &str, reply: Reply) -> &Self {
        lock(&self.by_method)
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Reply used when nothing is scripted
    pub fn set_fallback(&self, reply: Reply) -> &Self {
        *lock(&self.fallback) = reply;
        self
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) -> &Self {
        *lock(&self.latency) = Some(latency);
        self
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Methods called so far, in order
    pub fn methods(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|call| call.method.clone()).collect()
    }

    /// Number of calls so far
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Highest number of calls that were in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, position: usize, method: &str) -> Reply {
        if let Some(reply) = lock(&self.by_call).remove(&position) {
            return reply;
        }
        if let Some(reply) = lock(&self.by_method)
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        lock(&self.fallback).clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn invoke(&self, method: &str, params: &Value) -> Reply {
        self.invoke_with(method, params, CallOptions::default()).await
    }

    async fn invoke_with(&self, method: &str, params: &Value, options: CallOptions) -> Reply {
        let position = {
            let mut calls = lock(&self.calls);
            calls.push(RecordedCall {
                method: method.to_string(),
                params: params.clone(),
                compress: options.compress,
            });
            calls.len()
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.next_reply(position, method)
    }
}

/// Snapshot of a well-connected desktop on mains power
pub fn strong_snapshot() -> CapabilitySnapshot {
    CapabilitySnapshot {
        cpu_cores: 8,
        memory_bytes: 16 * 1024 * 1024 * 1024,
        network_type: NetworkType::Wifi,
        network_quality: NetworkQuality::Excellent,
        online: true,
        ..CapabilitySnapshot::default()
    }
}

/// Default configuration with the given scheduling strategy
pub fn config_with(strategy: StrategyConfig) -> Config {
    let mut config = Config::default();
    config.scheduler.strategy = strategy;
    config
}

/// Engine over `store` with a fixed strong capability snapshot
pub fn engine_with_store(
    config: Config,
    backend: Arc<ScriptedBackend>,
    store: Arc<dyn KeyValueStore>,
    online: bool,
) -> SyncEngine {
    match SyncEngine::builder(config)
        .backend(backend)
        .store(store)
        .probe(Arc::new(StaticProbe::new(strong_snapshot())))
        .online(online)
        .build()
    {
        Ok(engine) => engine,
        Err(e) => panic!("failed to build test engine: {}", e),
    }
}

/// Engine over a fresh in-memory store
pub fn memory_engine(config: Config, backend: Arc<ScriptedBackend>, online: bool) -> SyncEngine {
    engine_with_store(config, backend, Arc::new(MemoryStore::new()), online)
}

/// Create a task titled `title`
pub fn create_task(title: &str) -> NewOperation {
    NewOperation::create("createTask", "task", json!({ "title": title }))
}

/// Update task `id` with `changes`
pub fn update_task(id: &str, changes: Value) -> NewOperation {
    NewOperation::update("updateTask", "task", id, changes)
}

/// Install a test-friendly tracing subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_take_precedence() {
        let backend = ScriptedBackend::new();
        backend
            .reply_to("createTask", Err(BackendError::validation("bad title")))
            .reply_on_call(1, Err(BackendError::timeout("slow")));

        let first = backend.invoke("createTask", &json!({})).await;
        assert_eq!(first.unwrap_err().message, "slow");

        let second = backend.invoke("createTask", &json!({})).await;
        assert_eq!(second.unwrap_err().message, "bad title");

        let third = backend.invoke("createTask", &json!({})).await;
        assert_eq!(third.unwrap(), json!({"ok": true}));

        assert_eq!(backend.methods(), vec!["createTask"; 3]);
    }

    #[tokio::test]
    async fn test_records_compress_hint() {
        let backend = ScriptedBackend::new();
        backend
            .invoke_with("updateTask", &json!({"id": "t-1"}), CallOptions { compress: true })
            .await
            .unwrap();

        let calls = backend.calls();
        assert!(calls[0].compress);
        assert_eq!(calls[0].params["id"], "t-1");
        assert_eq!(backend.max_in_flight(), 1);
    }
}
