//! Boundary traits
//!
//! The engine consumes a remote backend and a key-value store; both are
//! supplied by the host application.

use async_trait::async_trait;
use serde_json::Value;

use crate::{BackendError, Result};

/// Transport hints for a single backend call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// The caller prefers a compressed request body
    pub compress: bool,
}

/// Remote-procedure boundary the engine replays operations against.
///
/// No ordering is assumed across distinct calls; the sync coordinator
/// serializes replays itself.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Invoke `method` with `params`
    async fn invoke(&self, method: &str, params: &Value) -> std::result::Result<Value, BackendError>;

    /// Invoke with transport hints. Backends that cannot honor a hint ignore
    /// it.
    async fn invoke_with(
        &self,
        method: &str,
        params: &Value,
        options: CallOptions,
    ) -> std::result::Result<Value, BackendError> {
        let _ = options;
        self.invoke(method, params).await
    }
}

/// Crash-consistent key-value persistence.
///
/// Writes are synchronous: once `save` returns `Ok`, the value survives a
/// process crash.
pub trait KeyValueStore: Send + Sync {
    /// Load the value stored under `key`
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    fn save(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete `key`; deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;
}

/// Trait for cancellable operations
pub trait Cancellable {
    /// Request cancellation; observed cooperatively
    fn cancel(&self);

    /// Check if cancellation was requested
    fn is_cancelled(&self) -> bool;
}

#[async_trait]
impl<T: Backend + ?Sized> Backend for std::sync::Arc<T> {
    async fn invoke(&self, method: &str, params: &Value) -> std::result::Result<Value, BackendError> {
        (**self).invoke(method, params).await
    }

    async fn invoke_with(
        &self,
        method: &str,
        params: &Value,
        options: CallOptions,
    ) -> std::result::Result<Value, BackendError> {
        (**self).invoke_with(method, params, options).await
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).load(key)
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).save(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
}
