//! Capability tier classification
//!
//! Cutoffs (memory in decimal gigabytes, so an "8 GB" machine whose kernel
//! reserves a little memory still qualifies):
//!
//! | Tier    | Cores | Memory | Network quality |
//! |---------|-------|--------|-----------------|
//! | High    | ≥ 8   | ≥ 8 GB | Good or better  |
//! | Medium  | ≥ 4   | ≥ 4 GB | any             |
//! | Low     | ≥ 2   | ≥ 2 GB | any             |
//! | Minimal | below | below  | any             |

use outbox_types::{CapabilitySnapshot, CapabilityTier, NetworkQuality};
use serde::{Deserialize, Serialize};
use tracing::trace;

const GB: u64 = 1_000_000_000;

/// Minimum cores for the high tier
pub const HIGH_MIN_CORES: usize = 8;
/// Minimum memory for the high tier
pub const HIGH_MIN_MEMORY: u64 = 8 * GB;
/// Minimum network quality for the high tier
pub const HIGH_MIN_QUALITY: NetworkQuality = NetworkQuality::Good;
/// Minimum cores for the medium tier
pub const MEDIUM_MIN_CORES: usize = 4;
/// Minimum memory for the medium tier
pub const MEDIUM_MIN_MEMORY: u64 = 4 * GB;
/// Minimum cores for the low tier
pub const LOW_MIN_CORES: usize = 2;
/// Minimum memory for the low tier
pub const LOW_MIN_MEMORY: u64 = 2 * GB;

/// Thresholds used to classify a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierThresholds {
    /// High tier cores
    pub high_cores: usize,
    /// High tier memory
    pub high_memory: u64,
    /// High tier network quality
    pub high_quality: NetworkQuality,
    /// Medium tier cores
    pub medium_cores: usize,
    /// Medium tier memory
    pub medium_memory: u64,
    /// Low tier cores
    pub low_cores: usize,
    /// Low tier memory
    pub low_memory: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            high_cores: HIGH_MIN_CORES,
            high_memory: HIGH_MIN_MEMORY,
            high_quality: HIGH_MIN_QUALITY,
            medium_cores: MEDIUM_MIN_CORES,
            medium_memory: MEDIUM_MIN_MEMORY,
            low_cores: LOW_MIN_CORES,
            low_memory: LOW_MIN_MEMORY,
        }
    }
}

/// Derives a [`CapabilityTier`] from a snapshot
#[derive(Debug, Clone, Default)]
pub struct CapabilityAnalyzer {
    thresholds: TierThresholds,
}

impl CapabilityAnalyzer {
    /// Create an analyzer with the documented cutoffs
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an analyzer with custom cutoffs
    pub fn with_thresholds(thresholds: TierThresholds) -> Self {
        Self { thresholds }
    }

    /// Thresholds in use
    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    /// Classify a snapshot
    pub fn classify(&self, snapshot: &CapabilitySnapshot) -> CapabilityTier {
        let t = &self.thresholds;
        let cores = snapshot.cpu_cores;
        let memory = snapshot.memory_bytes;

        let tier = if cores >= t.high_cores
            && memory >= t.high_memory
            && snapshot.network_quality >= t.high_quality
        {
            CapabilityTier::High
        } else if cores >= t.medium_cores && memory >= t.medium_memory {
            CapabilityTier::Medium
        } else if cores >= t.low_cores && memory >= t.low_memory {
            CapabilityTier::Low
        } else {
            CapabilityTier::Minimal
        };

        trace!(
            "Classified {} cores / {} bytes / {:?} as {}",
            cores,
            memory,
            snapshot.network_quality,
            tier
        );
        tier
    }
}
