//! Service hooks: named extension points independent features plug into.
//!
//! # Data Flow
//! ```text
//! Request lifecycle:
//!     RedirectRequest → HandleRequest → InjectHeaders → ResponseReady
//! Failure path:
//!     HandleError (first non-None response wins)
//! Server lifecycle:
//!     ServerListening / ServerStopped
//! HTTP/2 push:
//!     VetoPush (any true prevents the push)
//! ```
//!
//! # Design Decisions
//! - Extension points are a closed enum; each service declares the subset
//!   it implements and the declaration is validated at registration, not
//!   discovered per call
//! - Dispatch preserves registration order; "until" dispatches stop at the
//!   first non-None result, "collect" dispatches never short-circuit
//! - The currently-executing `service.hook` pair is exposed for
//!   diagnostics, valid only synchronously during a hook invocation

pub mod cors;
pub mod push;
pub mod sse;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::Method;
use thiserror::Error;

use crate::error::ServerError;
use crate::http::request::Request;
use crate::http::response::ResponseProperties;

/// The closed set of extension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    RedirectRequest,
    HandleRequest,
    HandleError,
    InjectHeaders,
    ResponseReady,
    VetoPush,
    ServerListening,
    ServerStopped,
}

impl Hook {
    fn as_str(self) -> &'static str {
        match self {
            Hook::RedirectRequest => "redirect_request",
            Hook::HandleRequest => "handle_request",
            Hook::HandleError => "handle_error",
            Hook::InjectHeaders => "inject_headers",
            Hook::ResponseReady => "response_ready",
            Hook::VetoPush => "veto_push",
            Hook::ServerListening => "server_listening",
            Hook::ServerStopped => "server_stopped",
        }
    }
}

/// What the server tells `ServerListening` hooks.
#[derive(Debug, Clone)]
pub struct ListenInfo {
    pub local_addr: SocketAddr,
    /// Externally-reportable origins (loopback, internal-ip, ...).
    pub origins: Vec<String>,
}

/// A named bundle of hook implementations. Implement only the methods for
/// the hooks you declare in [`hooks`](Service::hooks).
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    /// The extension points this service participates in. Only declared
    /// hooks are dispatched to the service.
    fn hooks(&self) -> &'static [Hook];

    /// Restrict `HandleRequest` dispatch to specific methods (the
    /// per-method-map form of a request handler).
    fn handled_methods(&self) -> Option<Vec<Method>> {
        None
    }

    /// Rewrite the resource; returning `Some(resource)` layers a new
    /// canonical request over the old one.
    async fn redirect_request(&self, _req: &Arc<Request>) -> Option<String> {
        None
    }

    /// Produce a response, or decline with `Ok(None)`.
    async fn handle_request(
        &self,
        _req: &Arc<Request>,
    ) -> Result<Option<ResponseProperties>, ServerError> {
        Ok(None)
    }

    /// Translate a handler failure into a response, or decline.
    async fn handle_error(
        &self,
        _req: &Arc<Request>,
        _error: &ServerError,
    ) -> Option<ResponseProperties> {
        None
    }

    /// Contribute headers to the outgoing response; contributions compose
    /// with the header merge table.
    fn inject_headers(
        &self,
        _req: &Arc<Request>,
        _response: &ResponseProperties,
    ) -> Option<ResponseProperties> {
        None
    }

    /// Observe the final response just before it is written.
    async fn response_ready(&self, _req: &Arc<Request>, _response: &ResponseProperties) {}

    /// Return `true` to prevent a server push of `path`.
    fn veto_push(&self, _parent: &Arc<Request>, _path: &str) -> bool {
        false
    }

    async fn server_listening(&self, _info: &ListenInfo) {}

    async fn server_stopped(&self) {}
}

/// Registration-time failure; programmer error, fails fast.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("service name must not be empty")]
    EmptyName,
    #[error("service {0:?} is already registered")]
    DuplicateName(String),
    #[error("service {0:?} declares no hooks")]
    NoHooks(String),
}

/// Ordered hook dispatcher over the registered services.
pub struct HookController {
    services: Vec<Arc<dyn Service>>,
    timing: bool,
    current: Mutex<Option<(&'static str, Hook)>>,
}

impl HookController {
    pub fn new(timing: bool) -> Self {
        Self {
            services: Vec::new(),
            timing,
            current: Mutex::new(None),
        }
    }

    /// Add a service to the end of the dispatch order.
    pub fn register(&mut self, service: Arc<dyn Service>) -> Result<(), RegistrationError> {
        let name = service.name();
        if name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if self.services.iter().any(|s| s.name() == name) {
            return Err(RegistrationError::DuplicateName(name.to_string()));
        }
        if service.hooks().is_empty() {
            return Err(RegistrationError::NoHooks(name.to_string()));
        }
        self.services.push(service);
        Ok(())
    }

    pub fn timing_enabled(&self) -> bool {
        self.timing
    }

    /// The `service.hook` pair currently executing, if any. Scratch state:
    /// only meaningful synchronously during a hook invocation.
    pub fn current(&self) -> Option<(&'static str, Hook)> {
        *self.current.lock().expect("hook state lock poisoned")
    }

    fn enter(&self, service: &'static str, hook: Hook) {
        *self.current.lock().expect("hook state lock poisoned") = Some((service, hook));
    }

    fn leave(&self) {
        *self.current.lock().expect("hook state lock poisoned") = None;
    }

    fn declared(&self, service: &Arc<dyn Service>, hook: Hook) -> bool {
        service.hooks().contains(&hook)
    }

    fn record(
        &self,
        timings: &mut Vec<(String, Duration)>,
        service: &'static str,
        hook: Hook,
        started: Instant,
    ) {
        if self.timing {
            timings.push((
                format!("{}.{}", service, hook.as_str()),
                started.elapsed(),
            ));
        }
    }

    /// First service to return a rewrite wins.
    pub async fn redirect_request(&self, req: &Arc<Request>) -> Option<String> {
        for service in &self.services {
            if !self.declared(service, Hook::RedirectRequest) {
                continue;
            }
            self.enter(service.name(), Hook::RedirectRequest);
            let result = service.redirect_request(req).await;
            self.leave();
            if result.is_some() {
                return result;
            }
        }
        None
    }

    /// Dispatch request handling until the first non-None response.
    pub async fn handle_request(
        &self,
        req: &Arc<Request>,
        timings: &mut Vec<(String, Duration)>,
    ) -> Result<Option<ResponseProperties>, ServerError> {
        for service in &self.services {
            if !self.declared(service, Hook::HandleRequest) {
                continue;
            }
            if let Some(methods) = service.handled_methods() {
                if !methods.contains(req.method()) {
                    continue;
                }
            }
            let started = Instant::now();
            self.enter(service.name(), Hook::HandleRequest);
            let result = service.handle_request(req).await;
            self.leave();
            self.record(timings, service.name(), Hook::HandleRequest, started);
            match result {
                Ok(Some(response)) => return Ok(Some(response)),
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Dispatch error handling until the first non-None response.
    pub async fn handle_error(
        &self,
        req: &Arc<Request>,
        error: &ServerError,
        timings: &mut Vec<(String, Duration)>,
    ) -> Option<ResponseProperties> {
        for service in &self.services {
            if !self.declared(service, Hook::HandleError) {
                continue;
            }
            let started = Instant::now();
            self.enter(service.name(), Hook::HandleError);
            let result = service.handle_error(req, error).await;
            self.leave();
            self.record(timings, service.name(), Hook::HandleError, started);
            if result.is_some() {
                return result;
            }
        }
        None
    }

    /// Collect header contributions from every service; no short-circuit.
    pub fn inject_headers(
        &self,
        req: &Arc<Request>,
        mut response: ResponseProperties,
    ) -> ResponseProperties {
        for service in &self.services {
            if !self.declared(service, Hook::InjectHeaders) {
                continue;
            }
            self.enter(service.name(), Hook::InjectHeaders);
            if let Some(contribution) = service.inject_headers(req, &response) {
                response = response.compose(contribution);
            }
            self.leave();
        }
        response
    }

    /// Notify every service of the final response; no short-circuit.
    pub async fn response_ready(&self, req: &Arc<Request>, response: &ResponseProperties) {
        for service in &self.services {
            if !self.declared(service, Hook::ResponseReady) {
                continue;
            }
            self.enter(service.name(), Hook::ResponseReady);
            service.response_ready(req, response).await;
            self.leave();
        }
    }

    /// Ask for objections to pushing `path`; returns the vetoing service's
    /// name, for diagnostics.
    pub fn veto_push(&self, parent: &Arc<Request>, path: &str) -> Option<&'static str> {
        for service in &self.services {
            if !self.declared(service, Hook::VetoPush) {
                continue;
            }
            self.enter(service.name(), Hook::VetoPush);
            let vetoed = service.veto_push(parent, path);
            self.leave();
            if vetoed {
                return Some(service.name());
            }
        }
        None
    }

    pub async fn server_listening(&self, info: &ListenInfo) {
        for service in &self.services {
            if !self.declared(service, Hook::ServerListening) {
                continue;
            }
            self.enter(service.name(), Hook::ServerListening);
            service.server_listening(info).await;
            self.leave();
        }
    }

    pub async fn server_stopped(&self) {
        for service in &self.services {
            if !self.declared(service, Hook::ServerStopped) {
                continue;
            }
            self.enter(service.name(), Hook::ServerStopped);
            service.server_stopped().await;
            self.leave();
        }
    }
}

impl std::fmt::Debug for HookController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookController")
            .field(
                "services",
                &self.services.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("timing", &self.timing)
            .finish()
    }
}
