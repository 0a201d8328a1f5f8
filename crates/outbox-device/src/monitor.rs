//! Periodic capability sampling with a freshness window

use crate::analyzer::CapabilityAnalyzer;
use crate::detector::CapabilityProbe;
use crate::optimization::StrategyOptimizer;
use outbox_types::{AdaptationStrategy, CapabilitySnapshot, CapabilityTier};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Configuration for the capability monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Interval between background samples
    pub sample_interval: Duration,
    /// How long a sample is served from cache
    pub ttl: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(60),
            ttl: Duration::from_secs(30),
        }
    }
}

/// Latest sample with its derived tier and strategy
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityState {
    /// Sample
    pub snapshot: CapabilitySnapshot,
    /// Tier derived from the sample
    pub tier: CapabilityTier,
    /// Strategy the engine must honor
    pub strategy: AdaptationStrategy,
}

/// Samples a probe, caches the result and publishes changes
pub struct CapabilityMonitor {
    probe: Arc<dyn CapabilityProbe>,
    analyzer: CapabilityAnalyzer,
    optimizer: StrategyOptimizer,
    config: MonitorConfig,
    sampled_at: RwLock<Option<Instant>>,
    state_tx: watch::Sender<CapabilityState>,
}

impl CapabilityMonitor {
    /// Create a monitor; nothing is sampled until first use
    pub fn new(probe: Arc<dyn CapabilityProbe>, config: MonitorConfig) -> Self {
        let analyzer = CapabilityAnalyzer::new();
        let optimizer = StrategyOptimizer::new();
        let snapshot = CapabilitySnapshot::default();
        let tier = analyzer.classify(&snapshot);
        let strategy = optimizer.strategy_for_snapshot(tier, &snapshot);
        let (state_tx, _) = watch::channel(CapabilityState {
            snapshot,
            tier,
            strategy,
        });

        Self {
            probe,
            analyzer,
            optimizer,
            config,
            sampled_at: RwLock::new(None),
            state_tx,
        }
    }

    /// Replace the tier analyzer
    pub fn with_analyzer(mut self, analyzer: CapabilityAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Current state, sampling again if the cached one is stale
    pub async fn current(&self) -> CapabilityState {
        let fresh = self
            .sampled_at
            .read()
            .await
            .is_some_and(|at| at.elapsed() < self.config.ttl);

        if fresh {
            self.state_tx.borrow().clone()
        } else {
            self.refresh().await
        }
    }

    /// Current capability tier
    pub async fn current_tier(&self) -> CapabilityTier {
        self.current().await.tier
    }

    /// Strategy for the current tier and conditions
    pub async fn current_strategy(&self) -> AdaptationStrategy {
        self.current().await.strategy
    }

    /// Sample now and publish the result
    pub async fn refresh(&self) -> CapabilityState {
        let snapshot = self.probe.sample().await;
        let tier = self.analyzer.classify(&snapshot);
        let strategy = self.optimizer.strategy_for_snapshot(tier, &snapshot);
        let state = CapabilityState {
            snapshot,
            tier,
            strategy,
        };

        *self.sampled_at.write().await = Some(Instant::now());

        self.state_tx.send_if_modified(|current| {
            if current.tier != state.tier {
                info!("Capability tier changed: {} -> {}", current.tier, state.tier);
            }
            // Sample timestamps always differ; only publish meaningful changes
            let changed = current.tier != state.tier
                || current.strategy != state.strategy
                || current.snapshot.online != state.snapshot.online;
            *current = state.clone();
            changed
        });

        debug!("Capability sample: tier={}", state.tier);
        state
    }

    /// Subscribe to published changes
    pub fn subscribe(&self) -> watch::Receiver<CapabilityState> {
        self.state_tx.subscribe()
    }

    /// Sample on the configured interval until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sample_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.refresh().await;
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            debug!("Capability monitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for CapabilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
