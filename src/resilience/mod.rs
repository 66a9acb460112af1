//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to endpoint:
//!     → circuit_breaker.rs (is_call_allowed: fail fast when open)
//!     → transport call, bounded by CallContext
//!     → On failure: classify.rs (Transient vs PermanentlyUnsupported)
//!     → circuit_breaker.rs (record outcome, maybe transition)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - No blind retries: failover to the next candidate replaces retrying
//!   the same endpoint
//! - One breaker type for AI endpoints and storage tiers alike
//! - backoff.rs paces persistence retries and breaker cool-downs

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;

pub use backoff::{calculate_backoff, next_cool_down};
pub use circuit_breaker::{BreakerRegistry, BreakerStatus, CircuitBreaker, CircuitState};
pub use classify::{classify, status_failure, FailureClass};
