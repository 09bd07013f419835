//! Embeddable polyglot HTTP server runtime.
//!
//! One listening socket serves TLS and plaintext HTTP/1 and HTTP/2; the
//! first byte of each connection decides where it goes. Requests are
//! normalized into one canonical form, routed with content negotiation,
//! and extended through ordered service hooks. Every piece of in-flight
//! work hangs off a composable cancellation scope, so shutdown can drain
//! requests, then connections, deterministically.
//!
//! ```no_run
//! use std::sync::Arc;
//! use polyserve::config::ServerConfig;
//! use polyserve::http::response::ResponseProperties;
//! use polyserve::lifecycle::{Server, StopReason};
//! use polyserve::routing::{Route, Router};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ServerConfig::local();
//! config.http2.enabled = false;
//!
//! let router = Router::new().with(
//!     Route::builder("GET", "/hello/:name")?.produce(|_req, matched| async move {
//!         let name = matched.params.get("name").cloned().unwrap_or_default();
//!         Ok(Some(ResponseProperties::text(
//!             http::StatusCode::OK,
//!             format!("hello, {}", name),
//!         )))
//!     }),
//! );
//!
//! let server = Server::builder(config).router(router).build()?;
//! let addr = server.start().await?;
//! println!("listening on {}", addr);
//! server.stopped().await;
//! # Ok(())
//! # }
//! ```

pub mod body;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod operation;
pub mod routing;
pub mod services;

pub use config::ServerConfig;
pub use error::ServerError;
pub use http::response::ResponseProperties;
pub use lifecycle::{Server, StopReason};
pub use operation::Operation;
pub use routing::{Route, Router};
pub use services::{Hook, Service};
