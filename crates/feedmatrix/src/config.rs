// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Collector configuration - single place for tunables.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: protocol constants that never change at runtime
//! - **Level 2 (Dynamic)**: [`CollectorConfig`], passed to the collector
//!   builder, optionally loaded from YAML (`config-loaders` feature)
//!
//! # Example YAML
//!
//! ```yaml
//! subscription_bucket: 10000
//! distribution_bucket: 100000
//! agent_buffer_size: 1000000
//! state_keep_time_ms: 60000
//! sticky_period_ms: 0
//! store_everything: false
//! unconflated_records: [TimeAndSale]
//! fatal_policy: abort
//! ```

use crate::error::{Error, FatalPolicy, Result};
use std::time::Duration;

// =======================================================================
// Static constants
// =======================================================================

/// Agent number reserved for the aggregated (total) subscription.
pub const TOTAL_AGENT_NUMBER: usize = 1;

/// Minimal number of a regular agent.
pub const MIN_AGENT_NUMBER: usize = 2;

/// Number of buckets in the sticky expiration wheel.
pub const STICKY_BUCKETS: usize = 100;

/// Minimal sticky period; smaller non-zero periods are rounded up.
pub const MIN_STICKY_PERIOD: Duration = Duration::from_millis(100);

// =======================================================================
// Runtime configuration
// =======================================================================

/// Tunables of a collector.
///
/// All sizes are counted in records (or subscription entries), all times
/// are in milliseconds.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config-loaders", derive(serde::Deserialize))]
#[cfg_attr(feature = "config-loaders", serde(default))]
pub struct CollectorConfig {
    /// Subscription entries processed per acquisition of the structural lock.
    pub subscription_bucket: usize,
    /// Distribution list entries collected per phase-1 pass.
    pub distribution_bucket: usize,
    /// Passes during which busy agents may be skipped in phase 2.
    pub max_distribution_spins: usize,
    /// Default maximal agent buffer size.
    pub agent_buffer_size: usize,
    /// Minimal interval between two overflow reports of one agent.
    pub buffer_overflow_log_interval_ms: u64,
    /// Structural lock waits above this threshold are logged.
    pub lock_wait_log_threshold_ms: u64,
    /// Spins before a priority lock acquisition falls back to parking.
    pub priority_lock_spins: u32,
    /// Records retrieved from a local history buffer per credit round.
    pub retrieve_batch_size: usize,
    /// Records retrieved from shared history storage per credit round.
    pub snapshot_batch_size: usize,
    /// Records examined between two sink flushes.
    pub examine_batch_size: usize,
    /// How long snapshot state of an unsubscribed history entry is kept.
    pub state_keep_time_ms: u64,
    /// Store history for every incoming record regardless of subscription.
    pub store_everything: bool,
    /// Record names covered by `store_everything`; empty means all.
    pub store_everything_records: Vec<String>,
    /// Record names that must not be conflated in agent buffers.
    pub unconflated_records: Vec<String>,
    /// Delay before removal of a total subscription entry; zero disables.
    pub sticky_period_ms: u64,
    /// Agent buffer positions above this value trigger a rebase.
    pub rebase_threshold: i64,
    /// Behavior on broken internal invariants.
    pub fatal_policy: FatalPolicy,
    /// Seed for hash multipliers; zero picks a time-derived seed.
    pub hash_seed: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            subscription_bucket: 10_000,
            distribution_bucket: 100_000,
            max_distribution_spins: 8,
            agent_buffer_size: 1_000_000,
            buffer_overflow_log_interval_ms: 10_000,
            lock_wait_log_threshold_ms: 10_000,
            priority_lock_spins: 64,
            retrieve_batch_size: 100,
            snapshot_batch_size: 10_000,
            examine_batch_size: 10_000,
            state_keep_time_ms: 60_000,
            store_everything: false,
            store_everything_records: Vec::new(),
            unconflated_records: Vec::new(),
            sticky_period_ms: 0,
            rebase_threshold: i64::from(i32::MAX / 2),
            fatal_policy: FatalPolicy::Abort,
            hash_seed: 0,
        }
    }
}

impl CollectorConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("subscription_bucket", self.subscription_bucket),
            ("distribution_bucket", self.distribution_bucket),
            ("max_distribution_spins", self.max_distribution_spins),
            ("agent_buffer_size", self.agent_buffer_size),
            ("retrieve_batch_size", self.retrieve_batch_size),
            ("snapshot_batch_size", self.snapshot_batch_size),
            ("examine_batch_size", self.examine_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.rebase_threshold < 16 {
            return Err(Error::InvalidConfig(format!(
                "rebase_threshold is too small: {}",
                self.rebase_threshold
            )));
        }
        Ok(())
    }

    pub fn buffer_overflow_log_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_overflow_log_interval_ms)
    }

    pub fn lock_wait_log_threshold(&self) -> Duration {
        Duration::from_millis(self.lock_wait_log_threshold_ms)
    }

    pub fn state_keep_time(&self) -> Duration {
        Duration::from_millis(self.state_keep_time_ms)
    }

    /// Sticky period, rounded up to [`MIN_STICKY_PERIOD`] when enabled.
    pub fn sticky_period(&self) -> Duration {
        match self.sticky_period_ms {
            0 => Duration::ZERO,
            ms => Duration::from_millis(ms).max(MIN_STICKY_PERIOD),
        }
    }
}

#[cfg(feature = "config-loaders")]
impl CollectorConfig {
    /// Parses configuration from a YAML document; missing keys keep defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CollectorConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ConfigFileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CollectorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_bucket_rejected() {
        let config = CollectorConfig {
            subscription_bucket: 0,
            ..CollectorConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_sticky_period_rounding() {
        let mut config = CollectorConfig::default();
        assert_eq!(config.sticky_period(), Duration::ZERO);
        config.sticky_period_ms = 5;
        assert_eq!(config.sticky_period(), MIN_STICKY_PERIOD);
        config.sticky_period_ms = 2500;
        assert_eq!(config.sticky_period(), Duration::from_millis(2500));
    }

    #[cfg(feature = "config-loaders")]
    #[test]
    fn test_yaml_partial_document() -> std::result::Result<(), String> {
        let yaml = "subscription_bucket: 7\nunconflated_records: [TimeAndSale]\nfatal_policy: panic\n";
        let config = CollectorConfig::from_yaml_str(yaml).map_err(|e| e.to_string())?;
        assert_eq!(config.subscription_bucket, 7);
        assert_eq!(config.unconflated_records, vec!["TimeAndSale".to_string()]);
        assert_eq!(config.fatal_policy, FatalPolicy::Panic);
        assert_eq!(config.distribution_bucket, 100_000);
        Ok(())
    }

    #[cfg(feature = "config-loaders")]
    #[test]
    fn test_yaml_invalid_value() {
        let result = CollectorConfig::from_yaml_str("retrieve_batch_size: 0\n");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
