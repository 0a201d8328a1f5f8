//! Conflict detection and resolution for replayed operations
//!
//! A conflict is a rejection whose failure class is `Conflict`. It is typed
//! from the local operation's kind and the cause the backend reports, then
//! decided by a pure function of the conflict and the active
//! [`ResolutionPolicy`], so the same inputs always give the same outcome.

use crate::progress::SyncEvent;
use chrono::{DateTime, Utc};
use outbox_types::{
    BackendError, ConflictCause, Operation, OperationId, OperationKind, RemoteState,
    ResolutionPolicy,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Type of conflict detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Local update against a remotely updated entity
    UpdateUpdate,
    /// Local update against a remotely deleted entity
    UpdateDelete,
    /// Local delete against a remotely updated entity
    DeleteUpdate,
    /// Local create of an entity the backend already has
    CreateCreate,
}

impl ConflictType {
    /// Type a conflict from the local operation kind and the reported cause.
    ///
    /// Without a cause the local kind decides. Returns `None` for
    /// combinations that are not conflicts (e.g. deleting an entity that is
    /// already gone).
    pub fn classify(kind: OperationKind, cause: Option<ConflictCause>) -> Option<Self> {
        match (kind, cause) {
            (OperationKind::Update, Some(ConflictCause::RemoteUpdated) | None) => {
                Some(Self::UpdateUpdate)
            }
            (OperationKind::Update, Some(ConflictCause::RemoteDeleted)) => Some(Self::UpdateDelete),
            (OperationKind::Delete, Some(ConflictCause::RemoteUpdated) | None) => {
                Some(Self::DeleteUpdate)
            }
            (OperationKind::Create, Some(ConflictCause::AlreadyExists) | None) => {
                Some(Self::CreateCreate)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UpdateUpdate => "update/update",
            Self::UpdateDelete => "update/delete",
            Self::DeleteUpdate => "delete/update",
            Self::CreateCreate => "create/create",
        };
        f.write_str(name)
    }
}

/// Outcome of applying a policy to a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Resend the local change without its version precondition
    KeepLocal,
    /// Accept the remote state and drop the local operation
    KeepRemote,
    /// Leave the conflict for the caller
    Deferred,
}

/// How a conflict was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Policy that produced the outcome, `None` for a caller decision
    pub policy: Option<ResolutionPolicy>,
    /// Outcome applied
    pub outcome: ResolutionOutcome,
    /// When the outcome was applied
    pub resolved_at: DateTime<Utc>,
}

/// Local side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    /// Payload that was sent
    pub payload: Value,
    /// When the local change was made
    pub modified_at: DateTime<Utc>,
}

/// A detected conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Identifier
    pub id: Uuid,
    /// Operation that hit the conflict
    pub operation: Operation,
    /// Conflict type
    pub conflict_type: ConflictType,
    /// Local state
    pub local: LocalState,
    /// Remote state as reported by the backend
    pub remote: RemoteState,
    /// When the conflict was detected
    pub detected_at: DateTime<Utc>,
    /// Resolution once applied
    pub resolution: Option<Resolution>,
    /// Whether the conflict has been resolved
    pub resolved: bool,
}

impl Conflict {
    /// Build a conflict from a rejected operation, or `None` when the
    /// rejection is not a recognisable conflict
    pub fn detect(operation: &Operation, rejection: &BackendError) -> Option<Self> {
        let conflict_type = ConflictType::classify(operation.kind(), rejection.cause)?;
        Some(Self {
            id: Uuid::new_v4(),
            operation: operation.clone(),
            conflict_type,
            local: LocalState {
                payload: operation.to_payload(),
                modified_at: operation.created_at,
            },
            remote: rejection.remote.clone().unwrap_or_default(),
            detected_at: Utc::now(),
            resolution: None,
            resolved: false,
        })
    }

    /// Record a final outcome
    pub fn resolve(&mut self, policy: Option<ResolutionPolicy>, outcome: ResolutionOutcome) {
        self.resolution = Some(Resolution {
            policy,
            outcome,
            resolved_at: Utc::now(),
        });
        self.resolved = outcome != ResolutionOutcome::Deferred;
    }

    /// Get a description of the conflict
    pub fn description(&self) -> String {
        format!(
            "{} conflict on {}",
            self.conflict_type,
            self.operation.description()
        )
    }
}

/// Decide a conflict under a policy.
///
/// Last-write-wins compares the local change time with the remote
/// modification time; the remote side wins ties and wins when its time is
/// unknown. A create/create conflict means the entity already exists, so
/// every policy except deferral keeps the remote copy.
pub fn resolve(conflict: &Conflict, policy: ResolutionPolicy) -> ResolutionOutcome {
    if policy == ResolutionPolicy::DeferToCaller {
        return ResolutionOutcome::Deferred;
    }
    if conflict.conflict_type == ConflictType::CreateCreate {
        return ResolutionOutcome::KeepRemote;
    }

    match policy {
        ResolutionPolicy::LocalWins => ResolutionOutcome::KeepLocal,
        ResolutionPolicy::RemoteWins => ResolutionOutcome::KeepRemote,
        ResolutionPolicy::LastWriteWins => match conflict.remote.modified_at {
            Some(remote) if conflict.local.modified_at > remote => ResolutionOutcome::KeepLocal,
            _ => ResolutionOutcome::KeepRemote,
        },
        ResolutionPolicy::DeferToCaller => ResolutionOutcome::Deferred,
    }
}

/// Conflict resolution statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictStats {
    /// Total number of conflicts
    pub total_conflicts: usize,
    /// Number of resolved conflicts
    pub resolved_conflicts: usize,
    /// Number of unresolved conflicts
    pub unresolved_conflicts: usize,
    /// Count of each conflict type
    pub conflict_types: HashMap<ConflictType, usize>,
}

/// Registry of detected conflicts and the active policy
#[derive(Debug)]
pub struct ConflictResolver {
    policy: RwLock<ResolutionPolicy>,
    conflicts: RwLock<Vec<Conflict>>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl ConflictResolver {
    /// Create a resolver publishing on `event_tx`
    pub fn new(policy: ResolutionPolicy, event_tx: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            policy: RwLock::new(policy),
            conflicts: RwLock::new(Vec::new()),
            event_tx,
        }
    }

    /// Active policy
    pub async fn policy(&self) -> ResolutionPolicy {
        *self.policy.read().await
    }

    /// Change the active policy
    pub async fn set_policy(&self, policy: ResolutionPolicy) {
        info!("Conflict policy set to {}", policy);
        *self.policy.write().await = policy;
    }

    /// Record a conflict for a rejected operation and announce it
    pub async fn add_conflict(
        &self,
        run_id: Uuid,
        operation: &Operation,
        rejection: &BackendError,
    ) -> Option<Conflict> {
        let conflict = Conflict::detect(operation, rejection)?;
        info!("Conflict detected: {}", conflict.description());

        self.conflicts.write().await.push(conflict.clone());
        let _ = self.event_tx.send(SyncEvent::ConflictDetected {
            run_id,
            conflict: Box::new(conflict.clone()),
        });
        Some(conflict)
    }

    /// Decide a conflict under the active policy
    pub async fn decide(&self, conflict: &Conflict) -> (ResolutionPolicy, ResolutionOutcome) {
        let policy = self.policy().await;
        let outcome = resolve(conflict, policy);
        debug!("{} under {} -> {:?}", conflict.description(), policy, outcome);
        (policy, outcome)
    }

    /// Mark a conflict resolved and return the updated record
    pub async fn mark_resolved(
        &self,
        id: Uuid,
        policy: Option<ResolutionPolicy>,
        outcome: ResolutionOutcome,
    ) -> Option<Conflict> {
        let mut conflicts = self.conflicts.write().await;
        let conflict = conflicts.iter_mut().find(|c| c.id == id)?;
        conflict.resolve(policy, outcome);
        Some(conflict.clone())
    }

    /// Look up a conflict
    pub async fn get(&self, id: Uuid) -> Option<Conflict> {
        self.conflicts
            .read()
            .await
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Get all unresolved conflicts
    pub async fn get_unresolved_conflicts(&self) -> Vec<Conflict> {
        self.conflicts
            .read()
            .await
            .iter()
            .filter(|c| !c.resolved)
            .cloned()
            .collect()
    }

    /// Operations held back by an unresolved conflict
    pub async fn blocked_operations(&self) -> HashSet<OperationId> {
        self.conflicts
            .read()
            .await
            .iter()
            .filter(|c| !c.resolved)
            .map(|c| c.operation.id)
            .collect()
    }

    /// Drop resolved conflicts, and unresolved ones whose operation is no
    /// longer in `queued`. Returns how many were dropped.
    pub async fn prune(&self, queued: &HashSet<OperationId>) -> usize {
        let mut conflicts = self.conflicts.write().await;
        let before = conflicts.len();
        conflicts.retain(|c| !c.resolved && queued.contains(&c.operation.id));
        let removed = before - conflicts.len();
        if removed > 0 {
            debug!("Pruned {} conflicts", removed);
        }
        removed
    }

    /// Drop every conflict recorded for `operation_id`
    pub async fn forget_operation(&self, operation_id: OperationId) -> usize {
        let mut conflicts = self.conflicts.write().await;
        let before = conflicts.len();
        conflicts.retain(|c| c.operation.id != operation_id);
        before - conflicts.len()
    }

    /// Get conflict statistics
    pub async fn get_stats(&self) -> ConflictStats {
        let conflicts = self.conflicts.read().await;
        let total_conflicts = conflicts.len();
        let resolved_conflicts = conflicts.iter().filter(|c| c.resolved).count();

        let mut conflict_types = HashMap::new();
        for conflict in conflicts.iter() {
            *conflict_types.entry(conflict.conflict_type).or_insert(0) += 1;
        }

        ConflictStats {
            total_conflicts,
            resolved_conflicts,
            unresolved_conflicts: total_conflicts - resolved_conflicts,
            conflict_types,
        }
    }
}
