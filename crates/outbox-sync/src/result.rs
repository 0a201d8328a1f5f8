//! Outcome of a sync run

use crate::conflict::Conflict;
use chrono::{DateTime, Utc};
use outbox_types::{BackendError, FailureClass, OperationId, SyncStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Traffic counters for the backend calls of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Backend calls made
    pub requests: u64,
    /// Calls that returned an error
    pub failures: u64,
    /// Serialized request bytes
    pub bytes_sent: u64,
    /// Serialized response bytes
    pub bytes_received: u64,
    /// Sum of call latencies
    pub total_latency: Duration,
}

impl NetworkStats {
    /// Record one backend call
    pub fn record(&mut self, sent: usize, received: usize, latency: Duration, failed: bool) {
        self.requests += 1;
        self.bytes_sent += sent as u64;
        self.bytes_received += received as u64;
        self.total_latency += latency;
        if failed {
            self.failures += 1;
        }
    }

    /// Mean latency per call
    pub fn average_latency(&self) -> Duration {
        if self.requests == 0 {
            Duration::ZERO
        } else {
            self.total_latency / u32::try_from(self.requests).unwrap_or(u32::MAX)
        }
    }

    /// Add another set of counters to this one
    pub fn merge(&mut self, other: &Self) {
        self.requests += other.requests;
        self.failures += other.failures;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.total_latency += other.total_latency;
    }
}

/// An operation the run could not apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    /// Operation
    pub operation_id: OperationId,
    /// How the failure was classified
    pub class: FailureClass,
    /// Backend failure
    pub error: BackendError,
    /// Whether the operation was removed from the queue
    pub discarded: bool,
}

/// Why an operation was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Its entity type is not syncable under the current policy
    PolicyDisabled,
    /// A dependency is still queued
    DependencyPending,
    /// It is waiting on a caller decision for a conflict
    ConflictPending,
}

/// An operation left in the queue without being attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedOperation {
    /// Operation
    pub operation_id: OperationId,
    /// Reason
    pub reason: SkipReason,
}

/// Everything a finished run reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Run identifier
    pub run_id: Uuid,
    /// Terminal status
    pub status: SyncStatus,
    /// No failures and no process-level error
    pub success: bool,
    /// Operations the run set out to process
    pub total: usize,
    /// Operations applied or resolved
    pub completed: usize,
    /// Operations that failed
    pub failed: usize,
    /// Failures with reasons
    pub failed_operations: Vec<FailedOperation>,
    /// Operations deliberately left queued
    pub skipped: Vec<SkippedOperation>,
    /// Conflicts detected during the run
    pub conflicts: Vec<Conflict>,
    /// Whether the run stopped on cancellation
    pub cancelled: bool,
    /// Operations still queued when the run ended
    pub remaining: usize,
    /// Process-level failure that ended the run early
    pub error: Option<String>,
    /// Backend traffic
    pub network: NetworkStats,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub ended_at: DateTime<Utc>,
    /// Wall-clock duration
    pub duration: Duration,
}

impl SyncResult {
    /// Conflicts still awaiting a decision
    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }

    /// Terminal status for a run with the given counts.
    ///
    /// `cut_short` marks a run that was cancelled with operations still
    /// queued; it is partial even without failures. A run that stops at the
    /// batch limit is not cut short: the limit is the configured size of a
    /// run.
    pub fn status_for(
        completed: usize,
        failed: usize,
        error: Option<&str>,
        cut_short: bool,
    ) -> SyncStatus {
        let clean = failed == 0 && error.is_none();
        if clean && !cut_short {
            SyncStatus::Completed
        } else if completed == 0 && !clean {
            SyncStatus::Failed
        } else {
            SyncStatus::PartiallyCompleted
        }
    }
}
