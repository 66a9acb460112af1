//! Caller-visible errors.

use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;
use crate::endpoint::EndpointId;

/// Why one routing candidate was not used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub endpoint: EndpointId,
    pub reason: String,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Every candidate was filtered out or failed. The reasons are for logs.
    #[error("no available backend{}", format_reasons(.reasons))]
    NoAvailableBackend { reasons: Vec<CandidateFailure> },

    #[error("connection pool '{pool}' exhausted")]
    PoolExhausted { pool: String },

    #[error("storage unavailable (primary: {primary}; fallback: {fallback})")]
    StorageUnavailable { primary: String, fallback: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn format_reasons(reasons: &[CandidateFailure]) -> String {
    if reasons.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = reasons.iter().map(ToString::to_string).collect();
    format!(" ({})", joined.join("; "))
}
