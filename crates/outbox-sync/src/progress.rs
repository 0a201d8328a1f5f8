//! Progress tracking and run events

use crate::conflict::Conflict;
use crate::result::SyncResult;
use chrono::{DateTime, Utc};
use outbox_types::{OperationId, SyncStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Incremental progress of a sync run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Run being tracked
    pub run_id: Option<Uuid>,
    /// Run status
    pub status: SyncStatus,
    /// Operations the run set out to process
    pub total: usize,
    /// Operations applied or resolved
    pub completed: usize,
    /// Operations that failed
    pub failed: usize,
    /// Unresolved conflicts
    pub conflicts: usize,
    /// Operations skipped
    pub skipped: usize,
    /// Start time
    pub started_at: Option<DateTime<Utc>>,
    /// End time
    pub ended_at: Option<DateTime<Utc>>,
}

impl SyncProgress {
    /// Progress of a run that just started
    pub fn started(run_id: Uuid, total: usize) -> Self {
        Self {
            run_id: Some(run_id),
            status: SyncStatus::Syncing,
            total,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Operations processed so far
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }

    /// Get overall progress as percentage (0.0 to 100.0)
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return if self.status.is_terminal() { 100.0 } else { 0.0 };
        }
        (self.processed().min(self.total) as f64 / self.total as f64) * 100.0
    }

    /// Check if the run has finished
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Events published while runs execute
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A run started
    Started {
        /// Run
        run_id: Uuid,
        /// Operations the run set out to process
        total: usize,
    },
    /// Progress after an operation was processed
    Progress {
        /// Run
        run_id: Uuid,
        /// Snapshot
        progress: SyncProgress,
    },
    /// An operation was applied and left the queue
    OperationSynced {
        /// Run
        run_id: Uuid,
        /// Operation
        operation_id: OperationId,
    },
    /// A conflict was detected
    ConflictDetected {
        /// Run
        run_id: Uuid,
        /// Conflict
        conflict: Box<Conflict>,
    },
    /// A conflict could not be resolved automatically
    ConflictUnresolved {
        /// Run
        run_id: Uuid,
        /// Conflict
        conflict_id: Uuid,
        /// Operation held in the queue
        operation_id: OperationId,
    },
    /// The run finished with status completed or partially completed
    Completed {
        /// Run
        run_id: Uuid,
        /// Result
        result: Arc<SyncResult>,
    },
    /// The run finished with status failed
    Failed {
        /// Run
        run_id: Uuid,
        /// Result
        result: Arc<SyncResult>,
    },
}

impl SyncEvent {
    /// Run the event belongs to
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Started { run_id, .. }
            | Self::Progress { run_id, .. }
            | Self::OperationSynced { run_id, .. }
            | Self::ConflictDetected { run_id, .. }
            | Self::ConflictUnresolved { run_id, .. }
            | Self::Completed { run_id, .. }
            | Self::Failed { run_id, .. } => *run_id,
        }
    }

    /// Whether this is the final event of a run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Progress reporter for sync runs
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    progress: Arc<RwLock<SyncProgress>>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl ProgressReporter {
    /// Create a reporter publishing on `event_tx`
    pub fn new(event_tx: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            progress: Arc::new(RwLock::new(SyncProgress::default())),
            event_tx,
        }
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Sender shared with other publishers
    pub fn sender(&self) -> broadcast::Sender<SyncEvent> {
        self.event_tx.clone()
    }

    /// Get the current progress
    pub async fn get_progress(&self) -> SyncProgress {
        self.progress.read().await.clone()
    }

    /// Current status
    pub async fn status(&self) -> SyncStatus {
        self.progress.read().await.status
    }

    /// Report a run started
    pub async fn started(&self, run_id: Uuid, total: usize) {
        *self.progress.write().await = SyncProgress::started(run_id, total);

        info!("Sync run {} started with {} operations", run_id, total);
        let _ = self.event_tx.send(SyncEvent::Started { run_id, total });
        self.publish().await;
    }

    /// Report an operation applied
    pub async fn operation_synced(&self, operation_id: OperationId) {
        let run_id = self.update(|p| p.completed += 1).await;
        let _ = self.event_tx.send(SyncEvent::OperationSynced {
            run_id,
            operation_id,
        });
        self.publish().await;
    }

    /// Report an operation failed
    pub async fn operation_failed(&self) {
        self.update(|p| p.failed += 1).await;
        self.publish().await;
    }

    /// Report an operation left queued behind an unresolved conflict
    pub async fn conflict_unresolved(&self, conflict_id: Uuid, operation_id: OperationId) {
        let run_id = self
            .update(|p| {
                p.failed += 1;
                p.conflicts += 1;
            })
            .await;
        let _ = self.event_tx.send(SyncEvent::ConflictUnresolved {
            run_id,
            conflict_id,
            operation_id,
        });
        self.publish().await;
    }

    /// Report an operation skipped
    pub async fn operation_skipped(&self) {
        self.update(|p| p.skipped += 1).await;
        self.publish().await;
    }

    /// Report the run finished; publishes exactly one terminal event
    pub async fn finished(&self, result: Arc<SyncResult>) {
        {
            let mut progress = self.progress.write().await;
            progress.status = result.status;
            progress.completed = result.completed;
            progress.failed = result.failed;
            progress.ended_at = Some(result.ended_at);
        }

        let run_id = result.run_id;
        let event = if result.status == SyncStatus::Failed {
            warn!(
                "Sync run {} failed: {}",
                run_id,
                result.error.as_deref().unwrap_or("no operation succeeded")
            );
            SyncEvent::Failed { run_id, result }
        } else {
            info!(
                "Sync run {} {}: {} completed, {} failed",
                run_id, result.status, result.completed, result.failed
            );
            SyncEvent::Completed { run_id, result }
        };
        let _ = self.event_tx.send(event);
    }

    async fn update(&self, apply: impl FnOnce(&mut SyncProgress)) -> Uuid {
        let mut progress = self.progress.write().await;
        apply(&mut progress);
        progress.run_id.unwrap_or_default()
    }

    async fn publish(&self) {
        let progress = self.get_progress().await;
        if let Some(run_id) = progress.run_id {
            let _ = self.event_tx.send(SyncEvent::Progress { run_id, progress });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        let mut progress = SyncProgress::started(Uuid::new_v4(), 4);
        assert_eq!(progress.percentage(), 0.0);

        progress.completed = 2;
        progress.failed = 1;
        assert_eq!(progress.percentage(), 75.0);
        assert!(!progress.is_complete());

        let empty = SyncProgress {
            status: SyncStatus::Completed,
            ..SyncProgress::default()
        };
        assert_eq!(empty.percentage(), 100.0);
    }

    #[tokio::test]
    async fn test_reporter_publishes_progress() {
        let (event_tx, mut event_rx) = broadcast::channel(32);
        let reporter = ProgressReporter::new(event_tx);
        let run_id = Uuid::new_v4();

        reporter.started(run_id, 3).await;
        reporter.operation_synced(7).await;
        reporter.conflict_unresolved(Uuid::new_v4(), 8).await;
        reporter.operation_skipped().await;

        let progress = reporter.get_progress().await;
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.conflicts, 1);
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.status, SyncStatus::Syncing);

        assert!(matches!(
            event_rx.recv().await.unwrap(),
            SyncEvent::Started { total: 3, .. }
        ));
        let mut synced = false;
        while let Ok(event) = event_rx.try_recv() {
            assert_eq!(event.run_id(), run_id);
            if let SyncEvent::OperationSynced { operation_id, .. } = event {
                synced = operation_id == 7;
            }
        }
        assert!(synced);
    }
}
