//! Device capability snapshots, tiers and adaptation strategies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::CompressionLevel;

/// Kind of network link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// Wired connection
    Ethernet,
    /// Wireless LAN
    Wifi,
    /// Mobile data
    Cellular,
    /// No link
    None,
    /// Host did not report a link type
    #[default]
    Unknown,
}

/// Coarse network quality, ordered worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    /// No connectivity
    Offline,
    /// High latency or heavy loss
    Poor,
    /// Usable
    Fair,
    /// Comfortable
    Good,
    /// Fast and stable
    Excellent,
}

/// Point-in-time sample of device, network and battery signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    /// Logical CPU cores
    pub cpu_cores: usize,
    /// Physical memory in bytes
    pub memory_bytes: u64,
    /// Network link type
    pub network_type: NetworkType,
    /// Network quality
    pub network_quality: NetworkQuality,
    /// Whether the host reports connectivity
    pub online: bool,
    /// Battery charge in `0.0..=1.0`, `None` on mains-only devices
    pub battery_level: Option<f32>,
    /// Whether the battery is charging
    pub charging: bool,
    /// Free local storage in bytes
    pub storage_available: Option<u64>,
    /// When the sample was taken
    pub sampled_at: DateTime<Utc>,
}

impl CapabilitySnapshot {
    /// Battery is at or above `threshold` or charging. Mains-only devices
    /// always qualify.
    pub fn has_power(&self, threshold: f32) -> bool {
        self.charging || self.battery_level.map_or(true, |level| level >= threshold)
    }

    /// Summary stored on a [`Device`](crate::Device) record
    pub fn summary(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            storage_available: self.storage_available,
            network_type: self.network_type,
            battery_level: self.battery_level,
        }
    }
}

impl Default for CapabilitySnapshot {
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            memory_bytes: 0,
            network_type: NetworkType::Unknown,
            network_quality: NetworkQuality::Offline,
            online: false,
            battery_level: None,
            charging: false,
            storage_available: None,
            sampled_at: Utc::now(),
        }
    }
}

/// Capability summary attached to a device record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceCapabilities {
    /// Free storage in bytes
    pub storage_available: Option<u64>,
    /// Network link type
    pub network_type: NetworkType,
    /// Battery charge in `0.0..=1.0`
    pub battery_level: Option<f32>,
}

/// Coarse device power classification, ordered weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTier {
    /// Below every threshold
    Minimal,
    /// At least 2 cores and 2 GB
    Low,
    /// At least 4 cores and 4 GB
    Medium,
    /// At least 8 cores, 8 GB and a good network
    High,
}

impl fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(name)
    }
}

/// Optional behaviours switched per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureToggles {
    /// Scheduler may run syncs while the app is in the background
    pub background_sync: bool,
    /// Prefetch remote data after a sync
    pub prefetch: bool,
    /// Compress outgoing payloads
    pub compression: bool,
    /// Keep a live update channel open
    pub realtime_updates: bool,
}

/// Tunables selected by the device's current tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationStrategy {
    /// Tier this strategy was derived for
    pub tier: CapabilityTier,
    /// Maximum operations a single sync pass processes before yielding
    pub max_batch_size: usize,
    /// Local cache budget in bytes
    pub cache_budget: u64,
    /// Background worker count
    pub worker_count: usize,
    /// Minimum interval between scheduled syncs
    pub polling_interval: Duration,
    /// Payload compression level
    pub compression_level: CompressionLevel,
    /// Feature toggles
    pub features: FeatureToggles,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_ordering() {
        assert!(NetworkQuality::Offline < NetworkQuality::Poor);
        assert!(NetworkQuality::Fair < NetworkQuality::Good);
        assert!(NetworkQuality::Good < NetworkQuality::Excellent);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(CapabilityTier::Minimal < CapabilityTier::Low);
        assert!(CapabilityTier::Medium < CapabilityTier::High);
    }

    #[test]
    fn test_has_power() {
        let mut snapshot = CapabilitySnapshot {
            battery_level: Some(0.2),
            ..CapabilitySnapshot::default()
        };
        assert!(!snapshot.has_power(0.5));

        snapshot.charging = true;
        assert!(snapshot.has_power(0.5));

        snapshot.charging = false;
        snapshot.battery_level = None;
        assert!(snapshot.has_power(0.9));
    }
}
