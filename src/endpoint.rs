//! Endpoint identity and registry.
//!
//! # Responsibilities
//! - Represent a configured external backend (AI variant or storage tier)
//! - Provide the join key shared by breakers, capability records and pools
//! - Resolve endpoints by id or role
//!
//! # Design Decisions
//! - Endpoints are created once from configuration and never change identity
//! - `EndpointId` is an `Arc<str>` so cloning on the hot path is a refcount bump

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::schema::EndpointConfig;

/// Opaque endpoint key, e.g. `"ai.primary"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(Arc<str>);

impl EndpointId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What an endpoint is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "ai.primary")]
    AiPrimary,
    #[serde(rename = "ai.secondary")]
    AiSecondary,
    #[serde(rename = "store.primary")]
    StorePrimary,
    #[serde(rename = "store.fallback")]
    StoreFallback,
}

impl Role {
    /// AI roles are candidates for routing and capability detection.
    pub fn is_ai(&self) -> bool {
        matches!(self, Role::AiPrimary | Role::AiSecondary)
    }
}

/// A configured external endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: EndpointId,
    pub role: Role,
    pub base_url: Url,
    pub timeout: Duration,
    pub probe_path: String,
    pub invoke_path: String,
}

impl Endpoint {
    /// Build an endpoint from its configuration entry.
    pub fn from_config(config: &EndpointConfig) -> Result<Self, url::ParseError> {
        Ok(Self {
            id: EndpointId::new(&config.id),
            role: config.role,
            base_url: Url::parse(&config.base_url)?,
            timeout: Duration::from_millis(config.timeout_ms),
            probe_path: config.probe_path.clone(),
            invoke_path: config.invoke_path.clone(),
        })
    }

    /// Join a path onto the base URL, keeping any path prefix of the base.
    pub fn url_for(&self, path: &str) -> Result<Url, url::ParseError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{}/{}", base, path))
    }
}

/// Immutable set of endpoints built at startup.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    by_id: HashMap<EndpointId, Arc<Endpoint>>,
    ordered: Vec<Arc<Endpoint>>,
}

impl EndpointRegistry {
    /// Build the registry; configuration has already been validated.
    pub fn from_configs(configs: &[EndpointConfig]) -> Result<Self, url::ParseError> {
        let mut registry = Self::default();
        for config in configs {
            let endpoint = Arc::new(Endpoint::from_config(config)?);
            registry.by_id.insert(endpoint.id.clone(), endpoint.clone());
            registry.ordered.push(endpoint);
        }
        Ok(registry)
    }

    pub fn get(&self, id: &EndpointId) -> Option<Arc<Endpoint>> {
        self.by_id.get(id).cloned()
    }

    /// First endpoint configured with the given role.
    pub fn by_role(&self, role: Role) -> Option<Arc<Endpoint>> {
        self.ordered.iter().find(|e| e.role == role).cloned()
    }

    /// All endpoints in configuration order.
    pub fn all(&self) -> &[Arc<Endpoint>] {
        &self.ordered
    }

    /// AI endpoints in configuration order.
    pub fn ai_endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.ordered.iter().filter(|e| e.role.is_ai())
    }
}
