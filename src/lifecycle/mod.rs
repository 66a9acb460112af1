//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (gateway.rs):
//!     Load config → Validate → Build components → Gateway::start spawns tasks
//!
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast to tasks + cancel in-flight contexts
//!     → persister flushes → tasks exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Trigger config reload
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then breakers, pools, caches, storage
//! - Shutdown has timeout: forced exit after deadline

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{SignalAction, Signals};
