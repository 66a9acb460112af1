//! HTTP connections backed by reqwest.
//!
//! # Responsibilities
//! - Execute `UpstreamRequest`s with per-request timeouts
//! - Map reqwest failures onto `TransportError`
//! - Answer the pool's health checks
//!
//! # Design Decisions
//! - One reqwest client per connector; `connect` hands out cheap clones that
//!   share its socket pool, so opening a pooled connection never blocks
//! - The gateway pool's semaphore bounds concurrency; reqwest keeps at most
//!   `max_size` idle sockets per host
//! - Sockets are opened lazily on first use and reused afterwards

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use std::time::Duration;
use url::Url;

use crate::transport::{
    Connection, ConnectionFactory, TransportError, UpstreamRequest, UpstreamResponse,
};

const GATEWAY_USER_AGENT: &str = concat!("resilient-gateway/", env!("CARGO_PKG_VERSION"));

/// A single reusable HTTP connection handle.
#[derive(Debug, Clone)]
pub struct HttpConnection {
    client: reqwest::Client,
    health_url: Option<Url>,
    health_timeout: Duration,
}

impl HttpConnection {
    fn map_error(err: reqwest::Error, timeout: Duration) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .timeout(request.timeout)
            .header(USER_AGENT, GATEWAY_USER_AGENT);

        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(id) = &request.request_id {
            builder = builder.header("x-request-id", id.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(e, request.timeout))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::map_error(e, request.timeout))?;

        Ok(UpstreamResponse { status, body })
    }

    async fn is_healthy(&self) -> bool {
        let Some(url) = &self.health_url else {
            return true;
        };
        match self
            .client
            .get(url.clone())
            .timeout(self.health_timeout)
            .header(USER_AGENT, GATEWAY_USER_AGENT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Pooled connection health check failed");
                false
            }
        }
    }
}

/// Factory producing `HttpConnection`s for a pool.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    health_url: Option<Url>,
    health_timeout: Duration,
}

impl HttpConnector {
    pub fn new(
        connect_timeout: Duration,
        idle_timeout: Duration,
        max_idle: usize,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(max_idle)
            .pool_idle_timeout(idle_timeout)
            .connect_timeout(connect_timeout)
            .no_proxy()
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Self {
            client,
            health_url: None,
            health_timeout: Duration::from_secs(2),
        })
    }

    /// Ping `url` when the pool health-checks idle connections.
    pub fn with_health_url(mut self, url: Option<Url>) -> Self {
        self.health_url = url;
        self
    }
}

#[async_trait]
impl ConnectionFactory for HttpConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            health_url: self.health_url.clone(),
            health_timeout: self.health_timeout,
        }))
    }
}
