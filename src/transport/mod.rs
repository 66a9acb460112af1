//! Transport subsystem.
//!
//! # Data Flow
//! ```text
//! Router / Detector / HttpStore
//!     → UpstreamRequest (method, url, body, timeout)
//!     → pooled dyn Connection (http.rs: reqwest-backed)
//!     → UpstreamResponse (status, body) or TransportError
//!     → resilience::classify decides Transient vs PermanentlyUnsupported
//! ```
//!
//! # Design Decisions
//! - Connections are trait objects so pools and tests can swap implementations
//! - Status codes are returned as data; callers decide what counts as failure
//! - Transport errors carry no endpoint identity; callers attach it

pub mod http;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub use http::{HttpConnection, HttpConnector};

/// Failure of a single transport call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("upstream returned status {status}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("connection pool '{0}' exhausted")]
    PoolExhausted(String),

    #[error("call cancelled by caller")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// An outbound HTTP request.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<Bytes>,
    pub content_type: Option<&'static str>,
    pub timeout: Duration,
    pub request_id: Option<String>,
}

impl UpstreamRequest {
    pub fn new(method: Method, url: Url, timeout: Duration) -> Self {
        Self {
            method,
            url,
            body: None,
            content_type: None,
            timeout,
            request_id: None,
        }
    }

    pub fn get(url: Url, timeout: Duration) -> Self {
        Self::new(Method::GET, url, timeout)
    }

    pub fn delete(url: Url, timeout: Duration) -> Self {
        Self::new(Method::DELETE, url, timeout)
    }

    /// A PUT carrying raw bytes.
    pub fn put(url: Url, body: Bytes, timeout: Duration) -> Self {
        let mut request = Self::new(Method::PUT, url, timeout);
        request.body = Some(body);
        request.content_type = Some("application/octet-stream");
        request
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Response from an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as (lossy) text, truncated for logs and error messages.
    pub fn body_snippet(&self) -> String {
        const MAX: usize = 256;
        let text = String::from_utf8_lossy(&self.body);
        if text.len() > MAX {
            let mut end = MAX;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &text[..end])
        } else {
            text.into_owned()
        }
    }

    /// Turn a non-2xx response into a `TransportError::Status`.
    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Status {
                status: self.status,
                body: self.body_snippet(),
            })
        }
    }
}

/// A reusable transport connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Send one request and read the full response.
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, TransportError>;

    /// Cheap liveness check used by the pool's health checker.
    async fn is_healthy(&self) -> bool;
}

/// Creates connections for a pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_for_status_keeps_snippet() {
        let long = "x".repeat(1000);
        let err = UpstreamResponse::new(503, long).error_for_status().unwrap_err();
        match err {
            TransportError::Status { status, body } => {
                assert_eq!(status, 503);
                assert!(body.len() < 300);
                assert!(body.ends_with("..."));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
