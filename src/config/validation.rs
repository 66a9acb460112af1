//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (storage tiers reference existing endpoints)
//! - Validate value ranges (timeouts > 0, thresholds >= 1)
//! - Detect conflicting roles
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{GatewayConfig, PoolConfig, StoreDriverConfig};
use crate::endpoint::Role;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_endpoints(config, &mut errors);
    validate_routing(config, &mut errors);
    validate_breaker(config, &mut errors);
    validate_pool("pools.api", &config.pools.api, &mut errors);
    validate_pool("pools.bulk", &config.pools.bulk, &mut errors);
    validate_storage(config, &mut errors);

    if config.capability.detection_timeout_ms == 0 {
        errors.push(ValidationError::new("capability.detection_timeout_ms", "must be > 0"));
    }
    if config.capability.persist_retries == 0 {
        errors.push(ValidationError::new("capability.persist_retries", "must be >= 1"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_endpoints(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    let mut ids = HashSet::new();
    let mut roles = HashSet::new();

    for (i, endpoint) in config.endpoints.iter().enumerate() {
        let field = format!("endpoints[{}]", i);
        if endpoint.id.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.id", field), "must not be empty"));
        } else if !ids.insert(endpoint.id.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.id", field),
                format!("duplicate endpoint id '{}'", endpoint.id),
            ));
        }
        if !roles.insert(endpoint.role) {
            errors.push(ValidationError::new(
                format!("{}.role", field),
                format!("role {:?} is already assigned to another endpoint", endpoint.role),
            ));
        }
        match url::Url::parse(&endpoint.base_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => errors.push(ValidationError::new(
                format!("{}.base_url", field),
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => errors.push(ValidationError::new(
                format!("{}.base_url", field),
                format!("invalid URL '{}': {}", endpoint.base_url, e),
            )),
        }
        if endpoint.timeout_ms == 0 {
            errors.push(ValidationError::new(format!("{}.timeout_ms", field), "must be > 0"));
        }
    }
}

fn validate_routing(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    let has_secondary = config.endpoints.iter().any(|e| e.role == Role::AiSecondary);
    let wants_secondary =
        config.routing.force_secondary || config.routing.prefer_primary == Some(false);

    if wants_secondary && !has_secondary {
        errors.push(ValidationError::new(
            "routing",
            "secondary routing requested but no endpoint has role ai.secondary",
        ));
    }

    if config.routing.force_secondary && config.routing.prefer_primary == Some(true) {
        tracing::warn!("routing.force_secondary overrides routing.prefer_primary = true");
    }
}

fn validate_breaker(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    let breaker = &config.breaker;
    if breaker.open_threshold == 0 {
        errors.push(ValidationError::new("breaker.open_threshold", "must be >= 1"));
    }
    if breaker.success_threshold == 0 {
        errors.push(ValidationError::new("breaker.success_threshold", "must be >= 1"));
    }
    if breaker.cool_down_ms == 0 {
        errors.push(ValidationError::new("breaker.cool_down_ms", "must be > 0"));
    }
    if breaker.max_cool_down_ms < breaker.cool_down_ms {
        errors.push(ValidationError::new(
            "breaker.max_cool_down_ms",
            "must be >= breaker.cool_down_ms",
        ));
    }
    if breaker.window_ms == 0 {
        errors.push(ValidationError::new("breaker.window_ms", "must be > 0"));
    }
}

fn validate_pool(name: &str, pool: &PoolConfig, errors: &mut Vec<ValidationError>) {
    let checks = [
        ("max_size", pool.max_size as u64),
        ("acquire_timeout_ms", pool.acquire_timeout_ms),
        ("leak_threshold_ms", pool.leak_threshold_ms),
        ("health_check_interval_ms", pool.health_check_interval_ms),
        ("reaper_interval_ms", pool.reaper_interval_ms),
        ("idle_timeout_ms", pool.idle_timeout_ms),
        ("max_lifetime_ms", pool.max_lifetime_ms),
    ];
    for (field, value) in checks {
        if value == 0 {
            errors.push(ValidationError::new(format!("{}.{}", name, field), "must be > 0"));
        }
    }
    if let Some(url) = &pool.health_check_url {
        if url::Url::parse(url).is_err() {
            errors.push(ValidationError::new(
                format!("{}.health_check_url", name),
                format!("invalid URL '{}'", url),
            ));
        }
    }
}

fn validate_storage(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    let tiers = [
        ("storage.primary", &config.storage.primary),
        ("storage.fallback", &config.storage.fallback),
    ];
    for (field, driver) in tiers {
        if let StoreDriverConfig::Http { endpoint } = driver {
            match config.endpoints.iter().find(|e| &e.id == endpoint) {
                None => errors.push(ValidationError::new(
                    field,
                    format!("references unknown endpoint '{}'", endpoint),
                )),
                Some(e) if e.role.is_ai() => errors.push(ValidationError::new(
                    field,
                    format!("endpoint '{}' has an AI role, expected a store role", endpoint),
                )),
                Some(_) => {}
            }
        }
    }
    if config.storage.probe_interval_ms == 0 {
        errors.push(ValidationError::new("storage.probe_interval_ms", "must be > 0"));
    }
}
