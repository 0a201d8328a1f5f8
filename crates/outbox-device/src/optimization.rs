//! Tier-specific adaptation strategies
//!
//! The coordinator caps each sync pass at `max_batch_size`; the scheduler
//! never polls faster than `polling_interval` and only schedules background
//! runs when `features.background_sync` is set.

use outbox_types::{
    AdaptationStrategy, CapabilitySnapshot, CapabilityTier, CompressionLevel, FeatureToggles,
    NetworkType,
};
use std::time::Duration;
use tracing::debug;

const MB: u64 = 1024 * 1024;

/// Battery level below which optional work is shed when not charging
pub const LOW_BATTERY: f32 = 0.2;

/// Produces adaptation strategies
#[derive(Debug, Clone, Default)]
pub struct StrategyOptimizer;

impl StrategyOptimizer {
    /// Create a new optimizer
    pub fn new() -> Self {
        Self
    }

    /// Strategy for a tier
    pub fn strategy_for(&self, tier: CapabilityTier) -> AdaptationStrategy {
        match tier {
            CapabilityTier::High => AdaptationStrategy {
                tier,
                max_batch_size: 500,
                cache_budget: 256 * MB,
                worker_count: 8,
                polling_interval: Duration::from_secs(15),
                compression_level: level(CompressionLevel::FASTEST),
                features: FeatureToggles {
                    background_sync: true,
                    prefetch: true,
                    compression: false,
                    realtime_updates: true,
                },
            },
            CapabilityTier::Medium => AdaptationStrategy {
                tier,
                max_batch_size: 100,
                cache_budget: 64 * MB,
                worker_count: 4,
                polling_interval: Duration::from_secs(30),
                compression_level: level(CompressionLevel::DEFAULT),
                features: FeatureToggles {
                    background_sync: true,
                    prefetch: true,
                    compression: true,
                    realtime_updates: true,
                },
            },
            CapabilityTier::Low => AdaptationStrategy {
                tier,
                max_batch_size: 25,
                cache_budget: 16 * MB,
                worker_count: 2,
                polling_interval: Duration::from_secs(120),
                compression_level: level(CompressionLevel::DEFAULT),
                features: FeatureToggles {
                    background_sync: true,
                    prefetch: false,
                    compression: true,
                    realtime_updates: false,
                },
            },
            CapabilityTier::Minimal => AdaptationStrategy {
                tier,
                max_batch_size: 5,
                cache_budget: 4 * MB,
                worker_count: 1,
                polling_interval: Duration::from_secs(600),
                compression_level: level(CompressionLevel::BEST),
                features: FeatureToggles {
                    background_sync: false,
                    prefetch: false,
                    compression: true,
                    realtime_updates: false,
                },
            },
        }
    }

    /// Tier strategy narrowed by the current battery and network conditions
    pub fn strategy_for_snapshot(
        &self,
        tier: CapabilityTier,
        snapshot: &CapabilitySnapshot,
    ) -> AdaptationStrategy {
        let mut strategy = self.strategy_for(tier);

        if !snapshot.has_power(LOW_BATTERY) {
            debug!("Low battery, shedding background work");
            strategy.features.background_sync = false;
            strategy.features.prefetch = false;
            strategy.polling_interval = strategy.polling_interval.saturating_mul(2);
        }

        if snapshot.network_type == NetworkType::Cellular {
            strategy.features.prefetch = false;
            strategy.features.compression = true;
        }

        strategy
    }
}

fn level(value: u8) -> CompressionLevel {
    CompressionLevel::new(value).unwrap_or_default()
}
