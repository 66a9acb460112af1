//! Hybrid storage subsystem.
//!
//! # Data Flow
//! ```text
//! get / set / delete (key)
//!     → hybrid.rs: primary healthy and breaker admits?
//!         yes → primary driver → ok: done
//!                              → failure: classify → breaker → fallback driver
//!         no  → fallback driver
//!     → both failed: StorageUnavailable
//!
//! prober.rs (fixed interval):
//!     → ping primary when its breaker admits a call (trial after cool-down)
//!         → success closes breaker → primary healthy again
//!     → ping fallback to keep its status current
//! ```
//!
//! # Design Decisions
//! - Availability over consistency: fallback-written data is not reconciled
//! - Drivers speak `TransportError` so one classifier covers storage and AI
//! - Health flips are driven by breaker transitions, not by single failures

pub mod driver;
pub mod http;
pub mod hybrid;
pub mod memory;
pub mod prober;
pub mod status;

pub use driver::StorageDriver;
pub use http::HttpStore;
pub use hybrid::{HybridStorage, StorageTier};
pub use memory::MemoryStore;
pub use prober::StorageProber;
pub use status::{StorageBackendStatus, Tier};
