//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → handed to Gateway::new, which builds every subsystem
//!
//! On reload:
//!     watcher.rs detects change (or SIGHUP)
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Gateway::reload swaps routing preference, clears permanent breakers
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BreakerConfig, CapabilityConfig, EndpointConfig, GatewayConfig, LogFormat,
    ObservabilityConfig, PoolConfig, PoolsConfig, RoutingConfig, StorageConfig,
    StoreDriverConfig,
};
