//! Validated configuration values shared across crates

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Compression level with validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    /// No compression
    pub const NONE: u8 = 0;
    /// Fastest compression
    pub const FASTEST: u8 = 1;
    /// Default compression
    pub const DEFAULT: u8 = 6;
    /// Best compression
    pub const BEST: u8 = 9;

    /// Create a new compression level with validation
    pub fn new(level: u8) -> Result<Self, String> {
        if level > Self::BEST {
            Err(format!("Compression level {} exceeds maximum {}", level, Self::BEST))
        } else {
            Ok(Self(level))
        }
    }

    /// Get the compression level value
    pub fn get(self) -> u8 {
        self.0
    }

    /// Check if compression is enabled
    pub fn is_enabled(self) -> bool {
        self.0 > Self::NONE
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<u8> for CompressionLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level)
    }
}

impl From<CompressionLevel> for u8 {
    fn from(level: CompressionLevel) -> Self {
        level.0
    }
}

/// Exponential backoff: `delay = min(base * 2^attempt, cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound on any delay
    pub cap: Duration,
}

impl BackoffConfig {
    /// Create a new backoff configuration
    pub fn new(base: Duration, cap: Duration) -> Result<Self, String> {
        if base.is_zero() {
            return Err("Backoff base must be greater than zero".to_string());
        }
        if base > cap {
            return Err("Backoff base cannot be greater than cap".to_string());
        }
        Ok(Self { base, cap })
    }

    /// Calculate the delay for a given attempt count
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^31 already exceeds any sensible cap
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_compression_level_validation() {
        assert!(CompressionLevel::new(0).is_ok());
        assert!(CompressionLevel::new(9).is_ok());
        assert!(CompressionLevel::new(10).is_err());
        assert!(!CompressionLevel::new(0).unwrap().is_enabled());
        assert!(serde_json::from_str::<CompressionLevel>("42").is_err());
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(3, 8)]
    #[case(8, 256)]
    #[case(9, 300)]
    #[case(40, 300)]
    fn test_backoff_delay(#[case] attempt: u32, #[case] expected_secs: u64) {
        let backoff = BackoffConfig::default();
        assert_eq!(
            backoff.delay_for_attempt(attempt),
            Duration::from_secs(expected_secs)
        );
    }

    #[test]
    fn test_backoff_validation() {
        assert!(BackoffConfig::new(Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(BackoffConfig::new(Duration::from_secs(10), Duration::from_secs(1)).is_err());
        assert!(BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(1)).is_ok());
    }
}
