//! Run statistics collection

use chrono::{DateTime, Utc};
use outbox_sync::{NetworkStats, SyncEvent, SyncResult};
use outbox_types::SyncStatus;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Aggregate statistics across sync runs
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatistics {
    /// Runs observed
    pub runs: u64,
    /// Runs that ended Completed
    pub completed_runs: u64,
    /// Runs that ended PartiallyCompleted
    pub partial_runs: u64,
    /// Runs that ended Failed
    pub failed_runs: u64,
    /// Runs stopped by cancellation
    pub cancelled_runs: u64,
    /// Operations applied
    pub operations_synced: u64,
    /// Operations that failed
    pub operations_failed: u64,
    /// Conflicts detected
    pub conflicts_detected: u64,
    /// Backend traffic across all runs
    pub network: NetworkStats,
    /// Total time spent in runs
    pub total_run_time: Duration,
    /// When the last run finished
    pub last_run: Option<DateTime<Utc>>,
    /// Status of the last run
    pub last_status: Option<SyncStatus>,
    /// Collector uptime
    pub uptime: Duration,
}

impl SyncStatistics {
    /// Percentage of runs that completed without failures
    pub fn success_rate(&self) -> f64 {
        if self.runs > 0 {
            (self.completed_runs as f64 / self.runs as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Operations applied per second of run time
    pub fn operations_per_second(&self) -> f64 {
        if self.total_run_time.as_secs_f64() > 0.0 {
            self.operations_synced as f64 / self.total_run_time.as_secs_f64()
        } else {
            0.0
        }
    }

    fn record(&mut self, result: &SyncResult) {
        self.runs += 1;
        match result.status {
            SyncStatus::Completed => self.completed_runs += 1,
            SyncStatus::PartiallyCompleted => self.partial_runs += 1,
            SyncStatus::Failed => self.failed_runs += 1,
            SyncStatus::Idle | SyncStatus::Syncing => {}
        }
        if result.cancelled {
            self.cancelled_runs += 1;
        }
        self.operations_synced += result.completed as u64;
        self.operations_failed += result.failed as u64;
        self.conflicts_detected += result.conflicts.len() as u64;
        self.network.merge(&result.network);
        self.total_run_time += result.duration;
        self.last_run = Some(result.ended_at);
        self.last_status = Some(result.status);
    }
}

/// Collects [`SyncStatistics`] from the coordinator's event stream
#[derive(Debug, Clone)]
pub struct StatisticsCollector {
    statistics: Arc<RwLock<SyncStatistics>>,
    start_time: Instant,
}

impl StatisticsCollector {
    /// Create a new statistics collector
    pub fn new() -> Self {
        Self {
            statistics: Arc::new(RwLock::new(SyncStatistics::default())),
            start_time: Instant::now(),
        }
    }

    /// Fold a finished run into the totals
    pub async fn record_result(&self, result: &SyncResult) {
        self.statistics.write().await.record(result);
    }

    /// Get current statistics
    pub async fn get_current_stats(&self) -> SyncStatistics {
        let mut stats = self.statistics.read().await.clone();
        stats.uptime = self.start_time.elapsed();
        stats
    }

    /// Consume terminal events until the channel closes or `shutdown` flips
    pub fn spawn(
        &self,
        mut events: broadcast::Receiver<SyncEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let collector = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Ok(SyncEvent::Completed { result, .. } | SyncEvent::Failed { result, .. }) => {
                                collector.record_result(&result).await;
                                debug!("Recorded run {} ({:?})", result.run_id, result.status);
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Statistics collector lagged, {} events dropped", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Statistics collector event channel closed");
                                break;
                            }
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            info!("Statistics collector shutdown requested");
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}
