//! Capability probes
//!
//! CPU and memory are read from the host; battery and network state cannot be
//! sensed portably, so the embedding application pushes them through
//! [`CapabilitySignals`].

use async_trait::async_trait;
use chrono::Utc;
use outbox_types::{CapabilitySnapshot, NetworkQuality, NetworkType};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Source of capability snapshots
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    /// Take a point-in-time sample
    async fn sample(&self) -> CapabilitySnapshot;
}

/// Host-reported sensor values
#[derive(Debug, Clone, PartialEq)]
pub struct SignalState {
    /// Battery charge in `0.0..=1.0`
    pub battery_level: Option<f32>,
    /// Whether the battery is charging
    pub charging: bool,
    /// Network link type
    pub network_type: NetworkType,
    /// Network quality
    pub network_quality: NetworkQuality,
    /// Connectivity
    pub online: bool,
    /// Free storage in bytes
    pub storage_available: Option<u64>,
}

impl Default for SignalState {
    fn default() -> Self {
        Self {
            battery_level: None,
            charging: false,
            network_type: NetworkType::Unknown,
            network_quality: NetworkQuality::Offline,
            online: false,
            storage_available: None,
        }
    }
}

/// Shared, push-updated sensor values
#[derive(Debug, Clone, Default)]
pub struct CapabilitySignals {
    state: Arc<RwLock<SignalState>>,
}

impl CapabilitySignals {
    /// Create signals with nothing reported yet (offline, no battery)
    pub fn new() -> Self {
        Self::default()
    }

    /// Report battery state
    pub async fn set_battery(&self, level: Option<f32>, charging: bool) {
        let mut state = self.state.write().await;
        state.battery_level = level.map(|level| level.clamp(0.0, 1.0));
        state.charging = charging;
    }

    /// Report network state. Going offline forces quality to `Offline`.
    pub async fn set_network(&self, online: bool, network_type: NetworkType, quality: NetworkQuality) {
        let mut state = self.state.write().await;
        state.online = online;
        state.network_type = if online { network_type } else { NetworkType::None };
        state.network_quality = if online { quality } else { NetworkQuality::Offline };
        debug!(
            "Network signal: online={} type={:?} quality={:?}",
            online, state.network_type, state.network_quality
        );
    }

    /// Report free storage
    pub async fn set_storage_available(&self, bytes: Option<u64>) {
        self.state.write().await.storage_available = bytes;
    }

    /// Current values
    pub async fn current(&self) -> SignalState {
        self.state.read().await.clone()
    }
}

/// Probe combining host hardware with pushed signals
#[derive(Debug, Clone, Default)]
pub struct SystemProbe {
    signals: CapabilitySignals,
}

impl SystemProbe {
    /// Create a probe reading the given signals
    pub fn new(signals: CapabilitySignals) -> Self {
        Self { signals }
    }

    /// Signals this probe reads
    pub fn signals(&self) -> &CapabilitySignals {
        &self.signals
    }
}

#[async_trait]
impl CapabilityProbe for SystemProbe {
    async fn sample(&self) -> CapabilitySnapshot {
        let signals = self.signals.current().await;

        #[cfg(unix)]
        let memory_bytes = crate::unix::total_memory_bytes().await.unwrap_or(0);
        #[cfg(not(unix))]
        let memory_bytes = 0;

        CapabilitySnapshot {
            cpu_cores: num_cpus::get(),
            memory_bytes,
            network_type: signals.network_type,
            network_quality: signals.network_quality,
            online: signals.online,
            battery_level: signals.battery_level,
            charging: signals.charging,
            storage_available: signals.storage_available,
            sampled_at: Utc::now(),
        }
    }
}

/// Probe returning a fixed snapshot
#[derive(Debug, Clone)]
pub struct StaticProbe {
    snapshot: Arc<RwLock<CapabilitySnapshot>>,
}

impl StaticProbe {
    /// Create a probe that always reports `snapshot`
    pub fn new(snapshot: CapabilitySnapshot) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Replace the reported snapshot
    pub async fn set(&self, snapshot: CapabilitySnapshot) {
        *self.snapshot.write().await = snapshot;
    }
}

#[async_trait]
impl CapabilityProbe for StaticProbe {
    async fn sample(&self) -> CapabilitySnapshot {
        let mut snapshot = self.snapshot.read().await.clone();
        snapshot.sampled_at = Utc::now();
        snapshot
    }
}
