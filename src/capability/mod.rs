//! Capability subsystem.
//!
//! # Data Flow
//! ```text
//! Startup / `gateway detect`:
//!     detector.rs: detect_all → concurrent GET probe_path per AI endpoint
//!     → classify outcome → cache.rs put + breaker record
//!
//! Router sees no fresh record:
//!     → detector.request_refresh(endpoint) (deduplicated queue)
//!     → background refresh task probes it once
//!
//! cache.rs writes:
//!     → ArcSwap map swap → Notify persister → JSON file (temp + rename)
//! ```
//!
//! # Design Decisions
//! - Transient probe failures touch only the breaker; the cache keeps its
//!   last known answer
//! - Probes share the live-traffic classifier and breaker, so detection and
//!   routing never disagree about an endpoint
//! - No polling loop: refreshes are demand-driven

pub mod cache;
pub mod detector;

pub use cache::{CapabilityCache, CapabilityRecord};
pub use detector::{CapabilityDetector, ProbeOutcome};
