//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::endpoint::Role;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Named external HTTP backends.
    pub endpoints: Vec<EndpointConfig>,

    /// Backend preference flags.
    pub routing: RoutingConfig,

    /// Circuit breaker thresholds shared by every endpoint.
    pub breaker: BreakerConfig,

    /// Capability cache and detection settings.
    pub capability: CapabilityConfig,

    /// Connection pools, one per traffic class.
    pub pools: PoolsConfig,

    /// Hybrid storage tiers.
    pub storage: StorageConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// A single external endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Unique endpoint identifier (e.g. "ai.primary").
    pub id: String,

    /// What the endpoint is used for.
    pub role: Role,

    /// Base URL, e.g. "https://api.example.com".
    pub base_url: String,

    /// Per-call timeout in milliseconds.
    #[serde(default = "default_endpoint_timeout_ms")]
    pub timeout_ms: u64,

    /// Side-effect-free path used for capability probes and health pings.
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Path that receives invocation payloads.
    #[serde(default)]
    pub invoke_path: String,
}

fn default_endpoint_timeout_ms() -> u64 {
    10_000
}

fn default_probe_path() -> String {
    "/".to_string()
}

/// Routing preferences.
///
/// `force_secondary` is an absolute override: when set, `prefer_primary` is ignored.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RoutingConfig {
    /// `Some(true)` prefers primary, `Some(false)` prefers secondary, `None` is auto.
    pub prefer_primary: Option<bool>,

    /// Always route to the secondary endpoint.
    pub force_secondary: bool,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures (within `window_ms`) that open the circuit.
    pub open_threshold: u32,

    /// Rolling window for counting failures, in milliseconds.
    pub window_ms: u64,

    /// Initial cool-down before a half-open trial, in milliseconds.
    pub cool_down_ms: u64,

    /// Cap for the doubled cool-down, in milliseconds.
    pub max_cool_down_ms: u64,

    /// Successful trials needed to close from half-open.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            open_threshold: 3,
            window_ms: 60_000,
            cool_down_ms: 30_000,
            max_cool_down_ms: 300_000,
            success_threshold: 1,
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    pub fn max_cool_down(&self) -> Duration {
        Duration::from_millis(self.max_cool_down_ms)
    }
}

/// Capability cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// How long a capability record stays fresh, in seconds.
    pub ttl_secs: u64,

    /// Optional JSON file used to persist capability records across restarts.
    pub persist_path: Option<PathBuf>,

    /// Budget for one full detection pass, in milliseconds.
    pub detection_timeout_ms: u64,

    /// Attempts made to persist a snapshot before giving up.
    pub persist_retries: u32,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            persist_path: None,
            detection_timeout_ms: 500,
            persist_retries: 3,
        }
    }
}

impl CapabilityConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }
}

/// The two traffic-class pools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// Short, frequent API calls.
    pub api: PoolConfig,

    /// Larger, less frequent content transfers.
    pub bulk: PoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            api: PoolConfig::default(),
            bulk: PoolConfig::bulk_profile(),
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum connections checked out at once.
    pub max_size: usize,

    /// Idle connections older than this are destroyed, in milliseconds.
    pub idle_timeout_ms: u64,

    /// Connections older than this are destroyed, in milliseconds.
    pub max_lifetime_ms: u64,

    /// Longest time `acquire` waits for a slot, in milliseconds.
    pub acquire_timeout_ms: u64,

    /// Checkouts held longer than this are reclaimed as leaks, in milliseconds.
    pub leak_threshold_ms: u64,

    /// Interval between idle-connection health checks, in milliseconds.
    pub health_check_interval_ms: u64,

    /// Interval between leak scans, in milliseconds.
    pub reaper_interval_ms: u64,

    /// Optional URL pinged to decide whether an idle connection is still usable.
    pub health_check_url: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 32,
            idle_timeout_ms: 90_000,
            max_lifetime_ms: 600_000,
            acquire_timeout_ms: 2_000,
            leak_threshold_ms: 120_000,
            health_check_interval_ms: 30_000,
            reaper_interval_ms: 5_000,
            health_check_url: None,
        }
    }
}

impl PoolConfig {
    /// Profile for bulk transfers: few long-lived connections, patient acquire.
    pub fn bulk_profile() -> Self {
        Self {
            max_size: 4,
            idle_timeout_ms: 300_000,
            max_lifetime_ms: 3_600_000,
            acquire_timeout_ms: 10_000,
            leak_threshold_ms: 600_000,
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn leak_threshold(&self) -> Duration {
        Duration::from_millis(self.leak_threshold_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

/// Storage tier driver selection.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreDriverConfig {
    /// REST key-value store behind a configured endpoint.
    Http { endpoint: String },
    /// In-process map, lost on restart.
    Memory,
}

/// Hybrid storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Preferred tier. Both tiers default to in-process memory until a
    /// store endpoint is configured.
    pub primary: StoreDriverConfig,

    /// Tier used while the primary is unavailable.
    pub fallback: StoreDriverConfig,

    /// Interval between background health probes, in milliseconds.
    pub probe_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary: StoreDriverConfig::Memory,
            fallback: StoreDriverConfig::Memory,
            probe_interval_ms: 10_000,
        }
    }
}

impl StorageConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable or JSON log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
