// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables, plus the runtime
//! enabled-subsystem switches.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default lock key prefix.
pub const DEFAULT_LOCK_PREFIX: &str = "scheduler";

/// Default capacity of every stage channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

/// Conveyor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Subsystems enabled at startup
    pub enabled_subsystems: Vec<String>,
    /// Redis URL for the distributed lock (in-memory lock when unset)
    pub redis_url: Option<String>,
    /// Prefix of every subsystem lock key
    pub lock_prefix: String,
    /// Lock TTL; `None` means the lock never expires and is never renewed
    pub lock_ttl: Option<Duration>,
    /// Retry queue policy
    pub retry: RetryPolicy,
    /// Capacity of stage channels
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled_subsystems: Vec::new(),
            redis_url: None,
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            lock_ttl: Some(Duration::from_secs(60)),
            retry: RetryPolicy::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `CONVEYOR_SUBSYSTEMS`: comma-separated subsystems enabled at startup (default: none)
    /// - `CONVEYOR_REDIS_URL`: Redis URL for the distributed lock (default: in-memory lock)
    /// - `CONVEYOR_LOCK_PREFIX`: lock key prefix (default: `scheduler`)
    /// - `CONVEYOR_LOCK_TTL_SECS`: lock TTL, `0` disables expiry (default: 60)
    /// - `CONVEYOR_RETRY_DELAY_SECS`: base retry delay (default: 60)
    /// - `CONVEYOR_RETRY_MULTIPLIER`: backoff growth factor (default: 1)
    /// - `CONVEYOR_RETRY_MAX_DELAY_SECS`: backoff ceiling (default: 3600)
    /// - `CONVEYOR_RETRY_MAX_ATTEMPTS`: attempts per key, `0` is unbounded (default: 10)
    /// - `CONVEYOR_RETRY_MAX_PENDING`: cap on scheduled retries (default: 10000)
    /// - `CONVEYOR_CHANNEL_CAPACITY`: stage channel capacity (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let enabled_subsystems = std::env::var("CONVEYOR_SUBSYSTEMS")
            .map(|v| parse_list(&v))
            .unwrap_or_default();

        let redis_url = std::env::var("CONVEYOR_REDIS_URL")
            .ok()
            .filter(|v| !v.is_empty());

        let lock_prefix = std::env::var("CONVEYOR_LOCK_PREFIX")
            .unwrap_or_else(|_| DEFAULT_LOCK_PREFIX.to_string());
        if lock_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "CONVEYOR_LOCK_PREFIX",
                "must not be empty",
            ));
        }

        let lock_ttl_secs: u64 = parse_var("CONVEYOR_LOCK_TTL_SECS", 60, "must be a number of seconds")?;
        let lock_ttl = (lock_ttl_secs > 0).then(|| Duration::from_secs(lock_ttl_secs));

        let delay_secs: u64 =
            parse_var("CONVEYOR_RETRY_DELAY_SECS", 60, "must be a number of seconds")?;
        let multiplier: u32 =
            parse_var("CONVEYOR_RETRY_MULTIPLIER", 1, "must be a positive integer")?;
        if multiplier == 0 {
            return Err(ConfigError::Invalid(
                "CONVEYOR_RETRY_MULTIPLIER",
                "must be a positive integer",
            ));
        }
        let max_delay_secs: u64 = parse_var(
            "CONVEYOR_RETRY_MAX_DELAY_SECS",
            3600,
            "must be a number of seconds",
        )?;
        let max_attempts: u32 = parse_var(
            "CONVEYOR_RETRY_MAX_ATTEMPTS",
            10,
            "must be a non-negative integer",
        )?;
        let max_pending: usize = parse_var(
            "CONVEYOR_RETRY_MAX_PENDING",
            10_000,
            "must be a positive integer",
        )?;

        let channel_capacity: usize = parse_var(
            "CONVEYOR_CHANNEL_CAPACITY",
            DEFAULT_CHANNEL_CAPACITY,
            "must be a positive integer",
        )?;
        if channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "CONVEYOR_CHANNEL_CAPACITY",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            enabled_subsystems,
            redis_url,
            lock_prefix,
            lock_ttl,
            retry: RetryPolicy {
                delay: Duration::from_secs(delay_secs),
                multiplier,
                max_delay: Duration::from_secs(max_delay_secs),
                max_attempts: (max_attempts > 0).then_some(max_attempts),
                max_pending,
            },
            channel_capacity,
        })
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

/// Runtime set of enabled subsystems.
///
/// Cloning shares the underlying set. Handlers consult it before taking their
/// lock, the registry flips it on enable/disable.
#[derive(Debug, Clone, Default)]
pub struct SubsystemSwitches {
    enabled: Arc<RwLock<BTreeSet<String>>>,
}

impl SubsystemSwitches {
    /// Create switches with the given subsystems enabled.
    pub fn new<I, S>(enabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: Arc::new(RwLock::new(enabled.into_iter().map(Into::into).collect())),
        }
    }

    /// Whether `subsystem` is currently enabled.
    pub fn is_enabled(&self, subsystem: &str) -> bool {
        self.enabled
            .read()
            .map(|set| set.contains(subsystem))
            .unwrap_or(false)
    }

    /// Enable `subsystem`. Returns false if it was already enabled.
    pub fn enable(&self, subsystem: &str) -> bool {
        match self.enabled.write() {
            Ok(mut set) => set.insert(subsystem.to_string()),
            Err(_) => false,
        }
    }

    /// Disable `subsystem`. Returns false if it was not enabled.
    pub fn disable(&self, subsystem: &str) -> bool {
        match self.enabled.write() {
            Ok(mut set) => set.remove(subsystem),
            Err(_) => false,
        }
    }

    /// Enabled subsystem names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.enabled
            .read()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
