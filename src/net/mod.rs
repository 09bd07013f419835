//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (hostname resolution, bind/probe, accept loop,
//!       connection limits)
//!     → sniff.rs (peek first byte: TLS record / printable HTTP / reject)
//!     → tls.rs (rustls handshake with ALPN for the TLS branch)
//!     → Hand off to HTTP layer (h1 or h2)
//!
//! Connection States:
//!     Accepting → Sniffing → {Tls | Http | Rejected}
//! ```
//!
//! # Design Decisions
//! - One listening socket serves TLS and plaintext; the first byte decides
//! - Bounded accept queue prevents resource exhaustion
//! - Port-hint probing trusts only real bind attempts, never availability
//!   checks

pub mod listener;
pub mod sniff;
pub mod tls;

pub use listener::{find_free_port, resolve_host, ConnectionPermit, Listener, ListenerError};
pub use sniff::{classify, sniff, write_reject, Protocol, Sniffed};
pub use tls::{load_tls_config, TlsError};
