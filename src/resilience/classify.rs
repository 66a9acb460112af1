//! Failure classification.
//!
//! One pure function shared by the router, the capability detector and the
//! storage gateway, so the same upstream behavior always lands in the same
//! breaker transition.

use serde::Serialize;

use crate::transport::TransportError;

/// How a failed call should affect an endpoint's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Might succeed later: timeouts, 5xx, 408, 429, connection errors,
    /// pool backpressure.
    Transient,
    /// The endpoint does not offer the feature at all: 404, 501, or a 4xx
    /// whose body says the feature is not enabled/supported.
    PermanentlyUnsupported,
}

const UNSUPPORTED_MARKERS: [&str; 2] = ["not enabled", "not supported"];

/// Classify an HTTP status and body.
///
/// Returns `None` for statuses that are delivered to the caller as-is
/// (2xx, 3xx and the remaining 4xx).
pub fn status_failure(status: u16, body: &str) -> Option<FailureClass> {
    match status {
        404 | 501 => Some(FailureClass::PermanentlyUnsupported),
        408 | 429 => Some(FailureClass::Transient),
        500..=599 => Some(FailureClass::Transient),
        400..=499 if mentions_unsupported(body) => Some(FailureClass::PermanentlyUnsupported),
        _ => None,
    }
}

fn mentions_unsupported(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    UNSUPPORTED_MARKERS.iter().any(|m| lower.contains(m))
}

/// Classify a transport failure.
///
/// `Cancelled` classifies as `Transient`, but callers never record a
/// cancelled call against a breaker.
pub fn classify(err: &TransportError) -> FailureClass {
    match err {
        TransportError::Status { status, body } => {
            status_failure(*status, body).unwrap_or(FailureClass::Transient)
        }
        TransportError::InvalidRequest(_) => FailureClass::PermanentlyUnsupported,
        TransportError::Timeout(_)
        | TransportError::Connect(_)
        | TransportError::Request(_)
        | TransportError::PoolExhausted(_)
        | TransportError::Cancelled => FailureClass::Transient,
    }
}
