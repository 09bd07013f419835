//! HTTP layer subsystem.
//!
//! # Data Flow
//! ```text
//! Sniffed connection (plain or TLS)
//!     → h1.rs / h2.rs (protocol serving, body plumbing, write races)
//!     → request.rs (canonical Request snapshot)
//!     → pipeline.rs (hooks, router, response race)
//!     → response.rs (ResponseProperties composition)
//!     → errors.rs (negotiated 4xx/5xx bodies)
//! ```
//!
//! # Design Decisions
//! - Both protocol front-ends normalize into the same canonical Request
//!   and accept the same ResponseProperties, so routing and services never
//!   see the transport
//! - Per-request cancellation is a fork of the connection scope, which is
//!   itself a fork of the server stop scope

pub mod errors;
pub mod h1;
pub mod h2;
pub mod pipeline;
pub mod request;
pub mod response;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http::StatusCode;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::body::{BodySource, BodyStream};
use crate::operation::Operation;
use crate::services::HookController;
use pipeline::Pipeline;

/// Requests currently in flight, keyed by request id. Shutdown force-
/// answers each through its oneshot.
pub type PendingRequests = Arc<DashMap<Uuid, oneshot::Sender<StatusCode>>>;

/// Everything a protocol front-end needs to serve one accepted socket.
pub struct ConnectionContext {
    pub pipeline: Arc<Pipeline>,
    /// Fork of the server stop scope, aborted when the socket dies.
    pub connection_op: Operation,
    pub pending_requests: PendingRequests,
    pub client_ip: IpAddr,
    /// Connection arrived over TLS.
    pub tls: bool,
    /// Serving plaintext on a TLS-enabled server: 301 every request to the
    /// https origin instead of handling it.
    pub redirect_https: bool,
    /// Honor response push targets (HTTP/2 only).
    pub push_enabled: bool,
    /// Unconsumed request bodies are reclaimed after this long.
    pub body_abandon: Duration,
    /// Reports handler failures to the lifecycle layer when the
    /// internal-error shutdown policy is enabled.
    pub fatal: Option<tokio::sync::mpsc::UnboundedSender<String>>,
}

impl ConnectionContext {
    pub fn hooks(&self) -> &Arc<HookController> {
        self.pipeline.hooks()
    }

    /// Forward a handler failure to the shutdown policy, when one listens.
    pub fn report_failure(&self, error: &crate::error::ServerError) {
        if let (Some(fatal), crate::error::ServerError::Handler(_)) = (&self.fatal, error) {
            let _ = fatal.send(error.to_string());
        }
    }

    /// Wrap a request body source with the abandonment watchdog.
    pub fn request_body(&self, source: BodySource) -> BodyStream {
        BodyStream::with_timeout(source, self.body_abandon)
    }

    /// Register a request for shutdown draining; the returned receiver
    /// feeds the pipeline's forced-answer race lane. Deregisters itself
    /// when the request's scope settles.
    pub fn track_request(
        &self,
        id: Uuid,
        operation: &Operation,
    ) -> oneshot::Receiver<StatusCode> {
        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(id, tx);
        let pending = Arc::clone(&self.pending_requests);
        operation.on_end(move || {
            pending.remove(&id);
        });
        rx
    }
}
