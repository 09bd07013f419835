//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (server.rs):
//!     Validate config → Load TLS → Bind polyglot listener
//!     → Compute origins → ServerListening hooks → Accept loop
//!
//! Shutdown (server.rs):
//!     stop(reason) → Stop accepting → Answer pending requests (503/500)
//!     → Force-close pending connections → ServerStopped hooks → stopped
//!
//! Signals (signals.rs):
//!     SIGHUP/SIGTERM/SIGINT (each toggleable) → stop(Signal)
//! ```
//!
//! # Design Decisions
//! - States are monotonic: Starting → Opened → Stopping → Stopped
//! - Pending connections and requests self-remove from their own end
//!   callbacks; only the drain step touches them otherwise
//! - Requests are answered before connections are closed: a 503 needs a
//!   live socket to travel over

pub mod server;
pub mod signals;

pub use server::{Server, ServerBuilder, State, StopReason};
