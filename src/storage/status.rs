//! Per-tier health bookkeeping.

use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::capability::cache::unix_millis;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Primary,
    Fallback,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one storage tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageBackendStatus {
    pub tier: Tier,
    pub driver: String,
    pub healthy: bool,
    /// Unix millis of the last probe.
    pub last_checked_at: Option<u64>,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct TierStatus {
    inner: Mutex<StorageBackendStatus>,
}

impl TierStatus {
    pub fn new(tier: Tier, driver: String) -> Self {
        metrics::record_storage_health(tier.as_str(), true);
        Self {
            inner: Mutex::new(StorageBackendStatus {
                tier,
                driver,
                healthy: true,
                last_checked_at: None,
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StorageBackendStatus> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_healthy(&self) -> bool {
        self.lock().healthy
    }

    pub fn snapshot(&self) -> StorageBackendStatus {
        self.lock().clone()
    }

    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut status = self.lock();
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
    }

    pub fn mark_checked(&self) {
        self.lock().last_checked_at = Some(unix_millis());
    }

    /// Set the health flag. Returns true when it changed; the change is
    /// logged once.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        let mut status = self.lock();
        if status.healthy == healthy {
            return false;
        }
        status.healthy = healthy;
        metrics::record_storage_health(status.tier.as_str(), healthy);
        if healthy {
            tracing::info!(tier = %status.tier, driver = %status.driver, "Storage tier recovered");
        } else {
            tracing::warn!(
                tier = %status.tier,
                driver = %status.driver,
                consecutive_failures = status.consecutive_failures,
                "Storage tier marked unhealthy"
            );
        }
        true
    }
}
