//! Key-value driver abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::context::CallContext;
use crate::transport::TransportError;

/// One storage tier's backend.
///
/// Drivers report failures as `TransportError` so the hybrid gateway can
/// classify them with the same rules as AI traffic. A missing key is
/// `Ok(None)`, never an error.
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Short description for logs and health output, e.g. `memory`.
    fn describe(&self) -> String;

    async fn get(&self, ctx: &CallContext, key: &str) -> Result<Option<Bytes>, TransportError>;

    async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), TransportError>;

    async fn delete(&self, ctx: &CallContext, key: &str) -> Result<(), TransportError>;

    /// Cheap liveness check used by the background prober.
    async fn ping(&self, ctx: &CallContext) -> Result<(), TransportError>;
}
