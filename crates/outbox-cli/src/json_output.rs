//! JSON output structures for the outbox CLI

use chrono::{DateTime, Utc};
use outbox_sync::PolicyState;
use outbox_types::{
    AdaptationStrategy, CapabilitySnapshot, CapabilityTier, Operation, OperationId, OperationKind,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Envelope every `--json` response is wrapped in
#[derive(Debug, Serialize)]
pub struct JsonReport<T: Serialize> {
    /// Command metadata
    pub metadata: Metadata,
    /// Command result
    pub result: T,
}

impl<T: Serialize> JsonReport<T> {
    /// Wrap `result` for `command`
    pub fn new(command: &str, result: T) -> Self {
        Self {
            metadata: Metadata {
                version: env!("CARGO_PKG_VERSION").to_string(),
                command: command.to_string(),
                timestamp: Utc::now().to_rfc3339(),
            },
            result,
        }
    }
}

/// Command metadata
#[derive(Debug, Serialize)]
pub struct Metadata {
    /// outbox version
    pub version: String,
    /// Command that produced the report
    pub command: String,
    /// When the report was produced
    pub timestamp: String,
}

/// A buffered operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationJson {
    /// Identifier
    pub id: OperationId,
    /// Mutation kind
    pub kind: OperationKind,
    /// Backend method
    pub method: String,
    /// Entity type
    pub entity_type: String,
    /// Entity identifier
    pub entity_id: Option<String>,
    /// Dependency
    pub depends_on: Option<OperationId>,
    /// Enqueue time
    pub created_at: DateTime<Utc>,
    /// Replay attempts
    pub attempts: u32,
    /// Wire parameters
    pub payload: Value,
}

impl From<&Operation> for OperationJson {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id,
            kind: op.kind(),
            method: op.method.clone(),
            entity_type: op.entity_type.to_string(),
            entity_id: op.entity_id.clone(),
            depends_on: op.depends_on,
            created_at: op.created_at,
            attempts: op.attempts,
            payload: op.to_payload(),
        }
    }
}

/// Queue contents
#[derive(Debug, Serialize)]
pub struct QueueJson {
    /// Pending operations
    pub length: usize,
    /// Operations in enqueue order
    pub operations: Vec<OperationJson>,
}

/// One step of the replay plan
#[derive(Debug, Clone, Serialize)]
pub struct PlanStepJson {
    /// 1-based replay position
    pub position: usize,
    /// Operation
    pub operation: OperationJson,
    /// Whether the selective-sync policy lets it through
    pub syncable: bool,
}

/// Capability sample with derived tier and strategy
#[derive(Debug, Serialize)]
pub struct CapabilityJson {
    /// Sample
    pub snapshot: CapabilitySnapshot,
    /// Tier
    pub tier: CapabilityTier,
    /// Strategy for the tier
    pub strategy: AdaptationStrategy,
}

/// Policy state with the effective decision per declared type
#[derive(Debug, Serialize)]
pub struct PolicyJson {
    /// Stored policy
    pub policy: PolicyState,
    /// Whether each declared type currently syncs
    pub syncable: BTreeMap<String, bool>,
}

/// Result of a mutating maintenance command
#[derive(Debug, Serialize)]
pub struct ChangeJson {
    /// Whether anything changed
    pub changed: bool,
    /// Items affected
    pub count: usize,
    /// Human readable summary
    pub message: String,
}
