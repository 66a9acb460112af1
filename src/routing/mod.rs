//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! InvokeRequest (payload, traffic class, optional preference override)
//!     → decision.rs: order [primary, secondary] by preference
//!         → demote fresh-unavailable, flag unverified (lazy refresh)
//!         → drop endpoints whose breaker would not admit a call
//!     → router.rs: for each candidate
//!         → breaker admission → pooled POST invoke_path
//!         → success: breaker success + capability true → Dispatched
//!         → failure: classify → breaker (+ capability false) → next
//!     → all failed: PoolExhausted (pure backpressure) or NoAvailableBackend
//! ```
//!
//! # Design Decisions
//! - Candidate planning is pure and tested without I/O
//! - Failover is bounded by the candidate list; no retry of the same endpoint
//! - Deterministic: same cache and breaker state always yields the same order

pub mod decision;
pub mod router;

pub use decision::{CapabilityHint, Candidate, Excluded, RoutingDecision, RoutingPreference};
pub use router::{ApiRouter, Dispatched, InvokeRequest};
