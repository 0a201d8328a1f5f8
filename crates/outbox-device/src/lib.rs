//! Device capability sampling and adaptation for outbox
//!
//! This crate implements the capability side of the engine:
//!
//! - **Probes**: host hardware plus pushed battery and network signals
//! - **Classification**: documented cutoffs mapping a snapshot to a tier
//! - **Strategies**: tunables per tier, narrowed by current conditions
//! - **Monitoring**: periodic sampling with a freshness window
//!
//! # Examples
//!
//! ```rust
//! use outbox_device::{CapabilityAnalyzer, StrategyOptimizer};
//! use outbox_types::{CapabilitySnapshot, CapabilityTier};
//!
//! let snapshot = CapabilitySnapshot { cpu_cores: 4, memory_bytes: 6_000_000_000, ..Default::default() };
//! let tier = CapabilityAnalyzer::new().classify(&snapshot);
//! assert_eq!(tier, CapabilityTier::Medium);
//!
//! let strategy = StrategyOptimizer::new().strategy_for(tier);
//! assert_eq!(strategy.max_batch_size, 100);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod analyzer;
pub mod detector;
pub mod monitor;
pub mod optimization;

#[cfg(unix)]
pub mod unix;

pub use analyzer::{CapabilityAnalyzer, TierThresholds};
pub use detector::{CapabilityProbe, CapabilitySignals, SignalState, StaticProbe, SystemProbe};
pub use monitor::{CapabilityMonitor, CapabilityState, MonitorConfig};
pub use optimization::StrategyOptimizer;
