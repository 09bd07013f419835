//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Canonical Request (method, pathname, headers)
//!     → router.rs (ordered route walk, first committed response wins)
//!     → negotiation.rs (Accept* quality scoring per matched route)
//!     → Return: ResponseProperties, or auto-generated
//!       404 / 405 / 415 / OPTIONS summary
//! ```
//!
//! # Design Decisions
//! - Routes are matched in registration order; a producer returning `None`
//!   declines and the walk continues
//! - Method mismatch on a path match is remembered for the 405 `allow` list
//! - Pattern compilation happens at registration and fails fast; matching
//!   is allocation-light and regex-free

pub mod negotiation;
pub mod router;

pub use negotiation::{negotiate, parse_accept, Negotiated, NegotiationKind};
pub use router::{Route, RouteBuilder, RouteError, RouteMatch, Router};
