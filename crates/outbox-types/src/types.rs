//! Core data types for outbox
//!
//! Buffered operations, the structured failures a backend may answer with,
//! device identity and run status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::capability::{DeviceCapabilities, NetworkType};

/// Identifier of a buffered operation. Assigned monotonically by the queue.
pub type OperationId = u64;

/// Kind of mutation an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Creates a new entity
    Create,
    /// Modifies an existing entity
    Update,
    /// Removes an entity
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Entity type an operation targets (e.g. `"task"`, `"settings"`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Create a new entity type
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Parameters of a buffered operation, typed per kind.
///
/// `Opaque` is the escape hatch for backend methods whose parameters have no
/// fixed shape; everything else carries the optimistic-concurrency
/// precondition explicitly so conflict resolution can strip it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationParams {
    /// Create an entity with the given field values
    Create {
        /// Field values of the new entity
        values: Value,
        /// Key the backend uses to detect a create it has already applied
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idempotency_key: Option<String>,
    },
    /// Apply a set of field changes
    Update {
        /// Changed fields
        changes: Value,
        /// Version the changes were made against
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_version: Option<u64>,
    },
    /// Delete an entity
    Delete {
        /// Version the delete was issued against
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_version: Option<u64>,
    },
    /// Dynamic backend parameters passed through untouched
    Opaque {
        /// Declared mutation kind
        op_kind: OperationKind,
        /// Raw parameters
        payload: Value,
    },
}

impl OperationParams {
    /// Mutation kind these parameters describe
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Create { .. } => OperationKind::Create,
            Self::Update { .. } => OperationKind::Update,
            Self::Delete { .. } => OperationKind::Delete,
            Self::Opaque { op_kind, .. } => *op_kind,
        }
    }

    /// Same parameters with the version precondition removed, used to force a
    /// local change over a diverged remote state.
    pub fn without_precondition(&self) -> Self {
        match self {
            Self::Update { changes, .. } => Self::Update {
                changes: changes.clone(),
                base_version: None,
            },
            Self::Delete { .. } => Self::Delete { base_version: None },
            Self::Opaque { op_kind, payload } => {
                let mut payload = payload.clone();
                if let Value::Object(map) = &mut payload {
                    map.remove("base_version");
                }
                Self::Opaque {
                    op_kind: *op_kind,
                    payload,
                }
            }
            Self::Create { .. } => self.clone(),
        }
    }

    /// Build the wire parameters for a call on `entity_id`
    pub fn to_payload(&self, entity_id: Option<&str>) -> Value {
        let mut object = serde_json::Map::new();
        if let Some(entity_id) = entity_id {
            object.insert("id".to_string(), Value::String(entity_id.to_string()));
        }
        match self {
            Self::Create {
                values,
                idempotency_key,
            } => {
                object.insert("values".to_string(), values.clone());
                if let Some(key) = idempotency_key {
                    object.insert("idempotency_key".to_string(), Value::String(key.clone()));
                }
            }
            Self::Update {
                changes,
                base_version,
            } => {
                object.insert("changes".to_string(), changes.clone());
                if let Some(version) = base_version {
                    object.insert("base_version".to_string(), Value::from(*version));
                }
            }
            Self::Delete { base_version } => {
                if let Some(version) = base_version {
                    object.insert("base_version".to_string(), Value::from(*version));
                }
            }
            Self::Opaque { payload, .. } => return payload.clone(),
        }
        Value::Object(object)
    }
}

/// A buffered mutating request awaiting replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique, immutable identifier
    pub id: OperationId,
    /// Backend method to invoke
    pub method: String,
    /// Typed parameters
    pub params: OperationParams,
    /// Entity type the operation mutates
    pub entity_type: EntityType,
    /// Entity the operation mutates, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Operation that must leave the queue before this one is handed out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<OperationId>,
    /// When the operation was enqueued
    pub created_at: DateTime<Utc>,
    /// Number of replay attempts so far
    #[serde(default)]
    pub attempts: u32,
}

impl Operation {
    /// Mutation kind
    pub fn kind(&self) -> OperationKind {
        self.params.kind()
    }

    /// Build the wire parameters for the backend call
    pub fn to_payload(&self) -> Value {
        self.params.to_payload(self.entity_id.as_deref())
    }

    /// Short human-readable description
    pub fn description(&self) -> String {
        match &self.entity_id {
            Some(entity_id) => format!(
                "#{} {} {} {} via {}",
                self.id,
                self.kind(),
                self.entity_type,
                entity_id,
                self.method
            ),
            None => format!(
                "#{} {} {} via {}",
                self.id,
                self.kind(),
                self.entity_type,
                self.method
            ),
        }
    }
}

/// Request to buffer an operation; the queue fills in the identifier (unless
/// given), timestamp and attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    /// Caller-chosen identifier
    pub id: Option<OperationId>,
    /// Backend method to invoke
    pub method: String,
    /// Typed parameters
    pub params: OperationParams,
    /// Entity type
    pub entity_type: EntityType,
    /// Entity identifier
    pub entity_id: Option<String>,
    /// Dependency
    pub depends_on: Option<OperationId>,
}

impl NewOperation {
    /// Create request with the given parameters
    pub fn new(
        method: impl Into<String>,
        entity_type: impl Into<EntityType>,
        params: OperationParams,
    ) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
            entity_type: entity_type.into(),
            entity_id: None,
            depends_on: None,
        }
    }

    /// Buffer a create
    pub fn create(method: impl Into<String>, entity_type: impl Into<EntityType>, values: Value) -> Self {
        Self::new(
            method,
            entity_type,
            OperationParams::Create {
                values,
                idempotency_key: None,
            },
        )
    }

    /// Buffer an update of a known entity
    pub fn update(
        method: impl Into<String>,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        changes: Value,
    ) -> Self {
        Self::new(
            method,
            entity_type,
            OperationParams::Update {
                changes,
                base_version: None,
            },
        )
        .with_entity_id(entity_id)
    }

    /// Buffer a delete of a known entity
    pub fn delete(
        method: impl Into<String>,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self::new(method, entity_type, OperationParams::Delete { base_version: None })
            .with_entity_id(entity_id)
    }

    /// Wire parameters for issuing the request directly
    pub fn to_payload(&self) -> Value {
        self.params.to_payload(self.entity_id.as_deref())
    }

    /// Set an explicit identifier
    pub fn with_id(mut self, id: OperationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the entity identifier
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Declare a dependency on another queued operation
    pub fn depends_on(mut self, id: OperationId) -> Self {
        self.depends_on = Some(id);
        self
    }

    /// Set the optimistic-concurrency version for updates and deletes
    pub fn with_base_version(mut self, version: u64) -> Self {
        match &mut self.params {
            OperationParams::Update { base_version, .. }
            | OperationParams::Delete { base_version } => *base_version = Some(version),
            OperationParams::Create { .. } | OperationParams::Opaque { .. } => {}
        }
        self
    }

    /// Set the idempotency key of a create
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        if let OperationParams::Create {
            idempotency_key, ..
        } = &mut self.params
        {
            *idempotency_key = Some(key.into());
        }
        self
    }
}

/// Failure codes a backend may answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorCode {
    /// The backend could not be reached
    Unreachable,
    /// The call did not complete in time
    Timeout,
    /// The backend asked the client to slow down
    RateLimited,
    /// The backend is temporarily unavailable
    Unavailable,
    /// The request was malformed or failed validation
    Validation,
    /// The target entity does not exist
    NotFound,
    /// The caller is not allowed to perform the request
    Unauthorized,
    /// The backend refused the request for a business reason
    Rejected,
    /// Server-side state diverged from the request's assumption
    Conflict,
    /// Anything the client does not recognise
    Unknown,
}

impl fmt::Display for BackendErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Rejected => "rejected",
            Self::Conflict => "conflict",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Why the backend refused a replay as a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCause {
    /// The entity was concurrently updated remotely
    RemoteUpdated,
    /// The entity was deleted remotely
    RemoteDeleted,
    /// A create with the same idempotency key was already applied
    AlreadyExists,
}

/// Remote state reported alongside a conflict
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteState {
    /// Entity data as the backend sees it
    #[serde(default)]
    pub data: Value,
    /// Current remote version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Last remote modification time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// Structured failure returned by the backend call boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    /// Failure code
    pub code: BackendErrorCode,
    /// Human readable reason
    pub message: String,
    /// Conflict cause, when `code` is `Conflict`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<ConflictCause>,
    /// Remote state, when the backend reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteState>,
}

impl BackendError {
    /// Create a new backend error
    pub fn new(code: BackendErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            remote: None,
        }
    }

    /// Backend unreachable
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCode::Unreachable, message)
    }

    /// Call timed out
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCode::Timeout, message)
    }

    /// Validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCode::Validation, message)
    }

    /// Entity not found
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCode::NotFound, message)
    }

    /// Conflict with the given cause
    pub fn conflict(cause: ConflictCause, message: impl Into<String>) -> Self {
        Self {
            cause: Some(cause),
            ..Self::new(BackendErrorCode::Conflict, message)
        }
    }

    /// Attach the remote state
    pub fn with_remote(mut self, remote: RemoteState) -> Self {
        self.remote = Some(remote);
        self
    }
}

/// How a backend failure is treated during a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Keep the operation queued and stop the run
    Transient,
    /// Discard the operation and record the reason
    Permanent,
    /// Route the operation to the conflict resolver
    Conflict,
}

/// Conflict resolution policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Newer modification wins; the remote side wins ties and unknown timestamps
    #[default]
    LastWriteWins,
    /// The buffered local change is forced over the remote state
    LocalWins,
    /// The remote state is kept and the local change dropped
    RemoteWins,
    /// Leave the conflict unresolved for the caller to decide
    DeferToCaller,
}

impl fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LastWriteWins => "last-write-wins",
            Self::LocalWins => "local-wins",
            Self::RemoteWins => "remote-wins",
            Self::DeferToCaller => "defer-to-caller",
        };
        f.write_str(name)
    }
}

/// Unique identifier of a synchronization endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Device form factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Desktop or laptop
    Desktop,
    /// Phone
    Mobile,
    /// Tablet
    Tablet,
    /// Browser client
    Web,
    /// Anything else
    Other,
}

/// Identity of a synchronization endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Identifier
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Form factor
    pub device_type: DeviceType,
    /// Last time the device was observed
    pub last_seen: DateTime<Utc>,
    /// Capability summary
    pub capabilities: DeviceCapabilities,
}

impl Device {
    /// Create a device seen now with an unknown capability summary
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type,
            last_seen: Utc::now(),
            capabilities: DeviceCapabilities {
                storage_available: None,
                network_type: NetworkType::Unknown,
                battery_level: None,
            },
        }
    }

    /// Replace the capability summary
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// State of a sync run or session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing has run yet
    #[default]
    Idle,
    /// A run is active
    Syncing,
    /// Every operation succeeded
    Completed,
    /// The run failed before any operation completed
    Failed,
    /// Some operations succeeded and some did not
    PartiallyCompleted,
}

impl SyncStatus {
    /// Check if the status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PartiallyCompleted)
    }

    /// Check if a run is active
    pub fn is_active(self) -> bool {
        self == Self::Syncing
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartiallyCompleted => "partially completed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_kind() {
        let create = NewOperation::create("tasks.create", "task", json!({"title": "a"}));
        assert_eq!(create.params.kind(), OperationKind::Create);

        let opaque = OperationParams::Opaque {
            op_kind: OperationKind::Delete,
            payload: json!({}),
        };
        assert_eq!(opaque.kind(), OperationKind::Delete);
    }

    #[test]
    fn test_without_precondition() {
        let update = NewOperation::update("tasks.update", "task", "t1", json!({"done": true}))
            .with_base_version(4);
        assert_eq!(
            update.params.without_precondition(),
            OperationParams::Update {
                changes: json!({"done": true}),
                base_version: None
            }
        );

        let opaque = OperationParams::Opaque {
            op_kind: OperationKind::Update,
            payload: json!({"base_version": 2, "x": 1}),
        };
        let stripped = opaque.without_precondition();
        assert_eq!(
            stripped,
            OperationParams::Opaque {
                op_kind: OperationKind::Update,
                payload: json!({"x": 1})
            }
        );
    }

    #[test]
    fn test_payload_carries_precondition() {
        let op = Operation {
            id: 3,
            method: "tasks.update".to_string(),
            params: OperationParams::Update {
                changes: json!({"title": "b"}),
                base_version: Some(7),
            },
            entity_type: EntityType::new("task"),
            entity_id: Some("t1".to_string()),
            depends_on: None,
            created_at: Utc::now(),
            attempts: 0,
        };

        assert_eq!(
            op.to_payload(),
            json!({"id": "t1", "changes": {"title": "b"}, "base_version": 7})
        );
        assert!(op.description().contains("#3 update task t1"));
    }

    #[test]
    fn test_base_version_ignored_for_create() {
        let create = NewOperation::create("tasks.create", "task", json!({})).with_base_version(1);
        assert_eq!(
            create.params,
            OperationParams::Create {
                values: json!({}),
                idempotency_key: None
            }
        );
    }

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::conflict(ConflictCause::RemoteUpdated, "version mismatch");
        assert_eq!(error.to_string(), "conflict: version mismatch");
        assert_eq!(error.cause, Some(ConflictCause::RemoteUpdated));
    }

    #[test]
    fn test_sync_status_terminal() {
        assert!(!SyncStatus::Idle.is_terminal());
        assert!(!SyncStatus::Syncing.is_terminal());
        assert!(SyncStatus::Completed.is_terminal());
        assert!(SyncStatus::Failed.is_terminal());
        assert!(SyncStatus::PartiallyCompleted.is_terminal());
    }

    #[test]
    fn test_operation_json_shape_is_stable() {
        let raw = json!({
            "id": 1,
            "method": "notes.create",
            "params": {"kind": "create", "values": {"body": "hi"}},
            "entity_type": "note",
            "created_at": "2024-01-01T00:00:00Z"
        });
        let op: Operation = serde_json::from_value(raw).unwrap();
        assert_eq!(op.kind(), OperationKind::Create);
        assert_eq!(op.attempts, 0);
        assert!(op.depends_on.is_none());
    }
}
