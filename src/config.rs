//! Tracker and routing configuration.
//!
//! Both configs deserialize from JSON with every field optional; durations are
//! written as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Public OSRM demo server. Fine for development, rate limited in production.
pub const DEFAULT_PRIMARY_URL: &str = "https://router.project-osrm.org";
pub const DEFAULT_SECONDARY_URL: &str = "https://graphhopper.com/api/1";
/// Shared low-quota credential sent to the secondary provider when no key is
/// configured. Deployments should set their own.
pub const DEFAULT_SECONDARY_DEMO_KEY: &str = "demo";

const ENV_PRIMARY_URL: &str = "ROUTE_TRACKER_PRIMARY_URL";
const ENV_SECONDARY_URL: &str = "ROUTE_TRACKER_SECONDARY_URL";
const ENV_SECONDARY_KEY: &str = "ROUTE_TRACKER_SECONDARY_KEY";
const ENV_PROVIDER_TIMEOUT_MS: &str = "ROUTE_TRACKER_PROVIDER_TIMEOUT_MS";

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Options forwarded to the position source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Oldest cached fix the source may return
    #[serde(with = "duration_ms")]
    pub maximum_age: Duration,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(15),
            maximum_age: Duration::ZERO,
        }
    }
}

/// Configuration for the tracking session manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum time between accepted samples
    #[serde(with = "duration_ms")]
    pub min_sample_interval: Duration,
    /// Consecutive counted push failures that force the session to complete
    pub max_push_failures: u32,
    /// Delay before the single retry of a transient push failure
    #[serde(with = "duration_ms")]
    pub push_retry_delay: Duration,
    /// How long `start()` waits for the seeding fix
    #[serde(with = "duration_ms")]
    pub start_fix_timeout: Duration,
    /// Period of the elapsed-time ticker
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    pub drop_out_of_order: bool,
    pub position: PositionOptions,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_sample_interval: Duration::from_secs(10),
            max_push_failures: 3,
            push_retry_delay: Duration::from_secs(2),
            start_fix_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_secs(1),
            drop_out_of_order: true,
            position: PositionOptions::default(),
        }
    }
}

impl TrackerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TrackerError::config(format!("invalid tracker config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_push_failures == 0 {
            return Err(TrackerError::config("max_push_failures must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(TrackerError::config("tick_interval must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration for the routing resolver and its providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub primary_url: String,
    pub secondary_url: String,
    /// Credential for the secondary provider. `secondary_demo_key` is sent when absent.
    pub secondary_api_key: Option<String>,
    pub secondary_demo_key: String,
    /// Upper bound on each individual provider attempt
    #[serde(with = "duration_ms")]
    pub provider_timeout: Duration,
    pub cache_capacity: usize,
    #[serde(with = "duration_ms")]
    pub cache_ttl: Duration,
    /// Assumed average speed for straight-line duration estimates
    pub fallback_speed_kmh: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            primary_url: DEFAULT_PRIMARY_URL.to_string(),
            secondary_url: DEFAULT_SECONDARY_URL.to_string(),
            secondary_api_key: None,
            secondary_demo_key: DEFAULT_SECONDARY_DEMO_KEY.to_string(),
            provider_timeout: Duration::from_secs(8),
            cache_capacity: 100,
            cache_ttl: Duration::from_secs(30 * 60),
            fallback_speed_kmh: 50.0,
        }
    }
}

impl RoutingConfig {
    /// Defaults overridden by `ROUTE_TRACKER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var(ENV_PRIMARY_URL) {
            config.primary_url = url;
        }
        if let Ok(url) = std::env::var(ENV_SECONDARY_URL) {
            config.secondary_url = url;
        }
        if let Ok(key) = std::env::var(ENV_SECONDARY_KEY) {
            if !key.trim().is_empty() {
                config.secondary_api_key = Some(key);
            }
        }
        if let Ok(ms) = std::env::var(ENV_PROVIDER_TIMEOUT_MS) {
            let ms: u64 = ms.parse().map_err(|_| {
                TrackerError::config(format!("{} must be an integer, got '{}'", ENV_PROVIDER_TIMEOUT_MS, ms))
            })?;
            config.provider_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TrackerError::config(format!("invalid routing config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(TrackerError::config("cache_capacity must be at least 1"));
        }
        if !(self.fallback_speed_kmh.is_finite() && self.fallback_speed_kmh > 0.0) {
            return Err(TrackerError::config("fallback_speed_kmh must be positive"));
        }
        if self.provider_timeout.is_zero() {
            return Err(TrackerError::config("provider_timeout must be non-zero"));
        }
        Ok(())
    }
}
