//! Resilient gateway to external AI and storage services.

pub mod capability;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod observability;
pub mod pool;
pub mod resilience;
pub mod routing;
pub mod storage;
pub mod transport;

pub use config::GatewayConfig;
pub use context::CallContext;
pub use endpoint::{EndpointId, Role};
pub use error::GatewayError;
pub use gateway::{Gateway, HealthSnapshot, Invocation};
pub use lifecycle::Shutdown;
pub use routing::{InvokeRequest, RoutingPreference};
