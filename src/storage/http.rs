//! REST key-value storage driver.
//!
//! ```text
//! GET    {base}/{key}            200 → value, 404 → missing
//! PUT    {base}/{key}?ttl={secs} 2xx → stored
//! DELETE {base}/{key}            2xx or 404 → gone
//! GET    {base}/{probe_path}     2xx → healthy
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::context::CallContext;
use crate::endpoint::Endpoint;
use crate::pool::{PoolManager, TrafficClass};
use crate::storage::driver::StorageDriver;
use crate::transport::{TransportError, UpstreamRequest};

pub struct HttpStore {
    endpoint: Arc<Endpoint>,
    pools: PoolManager,
}

impl HttpStore {
    pub fn new(endpoint: Arc<Endpoint>, pools: PoolManager) -> Self {
        Self { endpoint, pools }
    }

    /// `{base}/{key}` with the key percent-encoded as a single segment.
    fn key_url(&self, key: &str) -> Result<Url, TransportError> {
        if key.is_empty() {
            return Err(TransportError::InvalidRequest("empty storage key".into()));
        }
        let mut url = self.endpoint.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                TransportError::InvalidRequest(format!(
                    "store base URL {} cannot carry a path",
                    self.endpoint.base_url
                ))
            })?
            .pop_if_empty()
            .push(key);
        Ok(url)
    }

    fn timeout(&self, ctx: &CallContext) -> Duration {
        ctx.clamp(self.endpoint.timeout)
    }
}

#[async_trait]
impl StorageDriver for HttpStore {
    fn describe(&self) -> String {
        format!("http:{}", self.endpoint.id)
    }

    async fn get(&self, ctx: &CallContext, key: &str) -> Result<Option<Bytes>, TransportError> {
        let request = UpstreamRequest::get(self.key_url(key)?, self.timeout(ctx));
        let response = self.pools.send(TrafficClass::Api, ctx, &request).await?;
        if response.status == 404 {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.body))
    }

    async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), TransportError> {
        let mut url = self.key_url(key)?;
        if let Some(ttl) = ttl {
            url.query_pairs_mut()
                .append_pair("ttl", &ttl.as_secs().max(1).to_string());
        }
        let request = UpstreamRequest::put(url, value, self.timeout(ctx));
        self.pools
            .send(TrafficClass::Api, ctx, &request)
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete(&self, ctx: &CallContext, key: &str) -> Result<(), TransportError> {
        let request = UpstreamRequest::delete(self.key_url(key)?, self.timeout(ctx));
        let response = self.pools.send(TrafficClass::Api, ctx, &request).await?;
        if response.status == 404 {
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn ping(&self, ctx: &CallContext) -> Result<(), TransportError> {
        let url = self
            .endpoint
            .url_for(&self.endpoint.probe_path)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let request = UpstreamRequest::get(url, self.timeout(ctx));
        self.pools
            .send(TrafficClass::Api, ctx, &request)
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, PoolsConfig};
    use crate::endpoint::Role;
    use crate::pool::manager::tests::TestFactory;

    fn store(base_url: &str) -> HttpStore {
        let endpoint = Endpoint::from_config(&EndpointConfig {
            id: "store.primary".into(),
            role: Role::StorePrimary,
            base_url: base_url.into(),
            timeout_ms: 1_000,
            probe_path: "/".into(),
            invoke_path: String::new(),
        })
        .unwrap();
        let pools = PoolManager::new(
            &PoolsConfig::default(),
            Arc::new(TestFactory::new()),
            Arc::new(TestFactory::new()),
        );
        HttpStore::new(Arc::new(endpoint), pools)
    }

    #[test]
    fn key_is_encoded_as_one_segment() {
        let store = store("http://kv.local/v1/kv/");
        let url = store.key_url("user/42 session").unwrap();
        assert_eq!(url.as_str(), "http://kv.local/v1/kv/user%2F42%20session");

        let store = self::store("http://kv.local");
        assert_eq!(store.key_url("k").unwrap().as_str(), "http://kv.local/k");
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            store("http://kv.local").key_url(""),
            Err(TransportError::InvalidRequest(_))
        ));
    }
}
