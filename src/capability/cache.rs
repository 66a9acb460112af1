//! Capability cache.
//!
//! # Responsibilities
//! - Remember whether each endpoint is usable, with a TTL
//! - Serve lock-free reads to the router on every request
//! - Persist the latest snapshot to a JSON file in the background
//!
//! # Design Decisions
//! - Copy-on-write map behind `ArcSwap`; writers serialize on a mutex
//! - Last write wins by `checked_at`; an older record never replaces a newer one
//! - Stale records read as unknown, never as `true` or `false`
//! - Persistence failures are logged, never surfaced to callers

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::endpoint::EndpointId;
use crate::observability::metrics;
use crate::resilience::calculate_backoff;

/// Whether an endpoint was usable when last checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub endpoint: EndpointId,
    pub available: bool,
    /// Unix time in milliseconds.
    pub checked_at: u64,
    pub ttl_secs: u64,
}

impl CapabilityRecord {
    pub fn new(endpoint: EndpointId, available: bool, ttl: Duration) -> Self {
        Self {
            endpoint,
            available,
            checked_at: unix_millis(),
            ttl_secs: ttl.as_secs(),
        }
    }

    pub fn is_fresh_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.checked_at) < self.ttl_secs.saturating_mul(1_000)
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(unix_millis())
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCapabilities {
    records: Vec<CapabilityRecord>,
}

#[derive(Debug, Clone)]
struct PersistTarget {
    path: PathBuf,
    retries: u32,
}

/// TTL cache of endpoint capability.
#[derive(Debug)]
pub struct CapabilityCache {
    records: ArcSwap<HashMap<EndpointId, CapabilityRecord>>,
    writer: Mutex<()>,
    ttl: Duration,
    persist: Option<PersistTarget>,
    dirty: Notify,
}

impl CapabilityCache {
    /// In-memory cache with no persistence.
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
            ttl,
            persist: None,
            dirty: Notify::new(),
        }
    }

    /// Cache persisted at `path`, seeded from the file when it exists.
    ///
    /// Records older than `ttl` are discarded. A missing or unreadable file
    /// yields an empty cache.
    pub fn load(path: impl Into<PathBuf>, ttl: Duration, retries: u32) -> Self {
        let path = path.into();
        let mut cache = Self::new(ttl);
        cache.persist = Some(PersistTarget {
            path: path.clone(),
            retries: retries.max(1),
        });

        let loaded = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedCapabilities>(&bytes) {
                Ok(persisted) => persisted.records,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable capability file");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read capability file");
                Vec::new()
            }
        };

        let now = unix_millis();
        let total = loaded.len();
        let fresh: HashMap<EndpointId, CapabilityRecord> = loaded
            .into_iter()
            .filter(|r| r.is_fresh_at(now))
            .map(|r| (r.endpoint.clone(), r))
            .collect();
        tracing::info!(
            path = %path.display(),
            loaded = fresh.len(),
            discarded = total - fresh.len(),
            "Capability cache loaded"
        );
        cache.records = ArcSwap::from_pointee(fresh);
        cache
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist.as_ref().map(|p| p.path.as_path())
    }

    /// Fresh record for `endpoint`; stale or missing records return `None`.
    pub fn get(&self, endpoint: &EndpointId) -> Option<CapabilityRecord> {
        self.records
            .load()
            .get(endpoint)
            .filter(|r| r.is_fresh())
            .cloned()
    }

    pub fn put(&self, endpoint: &EndpointId, available: bool) {
        self.put_record(CapabilityRecord::new(endpoint.clone(), available, self.ttl));
    }

    /// Insert a record unless a newer one is already cached.
    pub fn put_record(&self, record: CapabilityRecord) -> bool {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.records.load();
        let previous = current.get(&record.endpoint);
        if previous.is_some_and(|p| p.checked_at > record.checked_at) {
            return false;
        }
        if previous.map(|p| p.available) != Some(record.available) {
            tracing::info!(
                endpoint = %record.endpoint,
                available = record.available,
                "Capability changed"
            );
        }
        metrics::record_capability(record.endpoint.as_str(), record.available);

        let mut next = HashMap::clone(&current);
        next.insert(record.endpoint.clone(), record);
        self.records.store(Arc::new(next));
        self.dirty.notify_one();
        true
    }

    pub fn invalidate(&self, endpoint: &EndpointId) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.records.load();
        if !current.contains_key(endpoint) {
            return;
        }
        let mut next = HashMap::clone(&current);
        next.remove(endpoint);
        self.records.store(Arc::new(next));
        self.dirty.notify_one();
    }

    /// All cached records, stale ones included, ordered by endpoint.
    pub fn snapshot(&self) -> Vec<CapabilityRecord> {
        let mut records: Vec<CapabilityRecord> = self.records.load().values().cloned().collect();
        records.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        records
    }

    /// Write the current snapshot to disk (temp file + rename), retrying
    /// with backoff. Returns false when every attempt failed.
    pub async fn persist(&self) -> bool {
        let Some(target) = &self.persist else {
            return true;
        };
        let body = match serde_json::to_vec_pretty(&PersistedCapabilities {
            records: self.snapshot(),
        }) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize capability cache");
                return false;
            }
        };

        for attempt in 1..=target.retries {
            match write_atomic(&target.path, &body).await {
                Ok(()) => {
                    tracing::debug!(path = %target.path.display(), "Capability cache persisted");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %target.path.display(),
                        attempt,
                        error = %e,
                        "Failed to persist capability cache"
                    );
                    if attempt < target.retries {
                        tokio::time::sleep(calculate_backoff(attempt, 100, 2_000)).await;
                    }
                }
            }
        }
        tracing::error!(path = %target.path.display(), "Giving up persisting capability cache");
        false
    }

    /// Spawn the background persister. Writes are coalesced: a burst of
    /// updates produces one write of the latest snapshot.
    pub fn spawn_persister(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        self.persist.as_ref()?;
        let cache = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cache.dirty.notified() => {
                        cache.persist().await;
                    }
                    _ = shutdown.recv() => {
                        cache.persist().await;
                        tracing::info!("Capability persister received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        }))
    }
}

async fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await
}
