//! Route registration and request matching.
//!
//! # Responsibilities
//! - Hold routes in registration order with their capability lists
//! - Walk them per request: pattern, method, headers, request body type,
//!   then content negotiation
//! - Synthesize `OPTIONS` capability summaries and 404/405/415 fallbacks
//!
//! # Design Decisions
//! - Resource patterns are literal segments, `:name` captures and a
//!   trailing `*rest`; invalid patterns fail at registration, never at
//!   request time
//! - Routes are not mutually exclusive until a producer commits by
//!   returning a response

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Future;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::error::ServerError;
use crate::http::errors::negotiated_error;
use crate::http::request::Request;
use crate::http::response::ResponseProperties;
use crate::routing::negotiation::{negotiate, Negotiated, NegotiationKind};

/// Registration-time failure. These are programmer errors and fail fast.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid method {0:?}")]
    InvalidMethod(String),
    #[error("resource pattern must start with '/': {0:?}")]
    PatternNotRooted(String),
    #[error("duplicate capture name {0:?} in pattern")]
    DuplicateCapture(String),
    #[error("wildcard segment must be last: {0:?}")]
    WildcardNotLast(String),
    #[error("empty header name in header pattern")]
    EmptyHeaderName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Rest(String),
}

/// Compiled resource pattern.
#[derive(Debug, Clone)]
struct ResourcePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl ResourcePattern {
    fn parse(pattern: &str) -> Result<Self, RouteError> {
        if !pattern.starts_with('/') {
            return Err(RouteError::PatternNotRooted(pattern.to_string()));
        }
        let mut segments = Vec::new();
        let mut names: Vec<&str> = Vec::new();
        let parts: Vec<&str> = pattern[1..]
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();
        for (i, part) in parts.iter().enumerate() {
            if let Some(name) = part.strip_prefix(':') {
                if names.contains(&name) {
                    return Err(RouteError::DuplicateCapture(name.to_string()));
                }
                names.push(name);
                segments.push(Segment::Param(name.to_string()));
            } else if let Some(name) = part.strip_prefix('*') {
                if i != parts.len() - 1 {
                    return Err(RouteError::WildcardNotLast(pattern.to_string()));
                }
                if names.contains(&name) {
                    return Err(RouteError::DuplicateCapture(name.to_string()));
                }
                segments.push(Segment::Rest(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut captures = HashMap::new();
        let parts: Vec<&str> = path
            .strip_prefix('/')
            .unwrap_or(path)
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();

        let mut i = 0;
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    if parts.get(i) != Some(&lit.as_str()) {
                        return None;
                    }
                    i += 1;
                }
                Segment::Param(name) => {
                    let value = parts.get(i)?;
                    captures.insert(name.clone(), (*value).to_string());
                    i += 1;
                }
                Segment::Rest(name) => {
                    captures.insert(name.clone(), parts[i..].join("/"));
                    return Some(captures);
                }
            }
        }
        if i == parts.len() {
            Some(captures)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
enum HeaderPattern {
    /// `*`: the header must be present; its value is captured.
    Present,
    Exact(String),
}

/// Everything the matcher learned, handed to the response producer.
#[derive(Debug, Default)]
pub struct RouteMatch {
    /// Named captures from the resource pattern.
    pub params: HashMap<String, String>,
    /// Values of pattern-matched headers.
    pub header_params: HashMap<String, String>,
    /// Negotiated representation, when the route declared availability.
    pub content_type: Option<Negotiated>,
    pub language: Option<Negotiated>,
    pub encoding: Option<Negotiated>,
}

type ProducerFuture =
    Pin<Box<dyn Future<Output = Result<Option<ResponseProperties>, ServerError>> + Send>>;
type Producer = Arc<dyn Fn(Arc<Request>, RouteMatch) -> ProducerFuture + Send + Sync>;

/// A registered route: match conditions, capability lists and a producer.
#[derive(Clone)]
pub struct Route {
    method: Option<Method>,
    pattern: ResourcePattern,
    header_patterns: Vec<(String, HeaderPattern)>,
    accepted_types: Vec<String>,
    available_types: Vec<String>,
    available_languages: Vec<String>,
    available_encodings: Vec<String>,
    websocket_only: bool,
    producer: Producer,
}

impl Route {
    /// Start building a route. `method` is an HTTP method name or `"*"`.
    pub fn builder(method: &str, pattern: &str) -> Result<RouteBuilder, RouteError> {
        let method = if method == "*" {
            None
        } else {
            Some(
                method
                    .parse::<Method>()
                    .map_err(|_| RouteError::InvalidMethod(method.to_string()))?,
            )
        };
        let pattern = ResourcePattern::parse(pattern)?;
        Ok(RouteBuilder {
            method,
            pattern,
            header_patterns: Vec::new(),
            accepted_types: Vec::new(),
            available_types: Vec::new(),
            available_languages: Vec::new(),
            available_encodings: Vec::new(),
            websocket_only: false,
        })
    }

    fn method_matches(&self, method: &Method) -> bool {
        match &self.method {
            None => true,
            // HEAD rides on GET routes; the write path drops the body.
            Some(m) => m == method || (*m == Method::GET && *method == Method::HEAD),
        }
    }

    fn match_headers(&self, headers: &HeaderMap) -> Option<HashMap<String, String>> {
        let mut captured = HashMap::new();
        for (name, pattern) in &self.header_patterns {
            let value = headers.get(name)?.to_str().ok()?;
            match pattern {
                HeaderPattern::Present => {
                    captured.insert(name.clone(), value.to_string());
                }
                HeaderPattern::Exact(expected) => {
                    if !value.eq_ignore_ascii_case(expected) {
                        return None;
                    }
                    captured.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(captured)
    }

    fn accepts_body_type(&self, content_type: Option<&str>) -> bool {
        if self.accepted_types.is_empty() {
            return true;
        }
        let Some(declared) = content_type else {
            return false;
        };
        self.accepted_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(declared))
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern.raw)
            .field("websocket_only", &self.websocket_only)
            .finish()
    }
}

/// Builder for [`Route`]; validation happens in [`Route::builder`] and
/// [`RouteBuilder::header`], so a finished builder cannot produce a bad
/// route.
pub struct RouteBuilder {
    method: Option<Method>,
    pattern: ResourcePattern,
    header_patterns: Vec<(String, HeaderPattern)>,
    accepted_types: Vec<String>,
    available_types: Vec<String>,
    available_languages: Vec<String>,
    available_encodings: Vec<String>,
    websocket_only: bool,
}

impl RouteBuilder {
    /// Require a header: `"*"` means present-with-any-value (captured),
    /// anything else is an exact, case-insensitive match.
    pub fn header(mut self, name: &str, pattern: &str) -> Result<Self, RouteError> {
        if name.trim().is_empty() {
            return Err(RouteError::EmptyHeaderName);
        }
        let parsed = if pattern == "*" {
            HeaderPattern::Present
        } else {
            HeaderPattern::Exact(pattern.to_string())
        };
        self.header_patterns
            .push((name.to_ascii_lowercase(), parsed));
        Ok(self)
    }

    /// Request body content types this route accepts (POST/PATCH/PUT).
    pub fn accepts<I: IntoIterator<Item = S>, S: Into<String>>(mut self, types: I) -> Self {
        self.accepted_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Response content types this route can produce.
    pub fn types<I: IntoIterator<Item = S>, S: Into<String>>(mut self, types: I) -> Self {
        self.available_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn languages<I: IntoIterator<Item = S>, S: Into<String>>(mut self, languages: I) -> Self {
        self.available_languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn encodings<I: IntoIterator<Item = S>, S: Into<String>>(mut self, encodings: I) -> Self {
        self.available_encodings = encodings.into_iter().map(Into::into).collect();
        self
    }

    /// Only match protocol upgrade requests.
    pub fn websocket_only(mut self, yes: bool) -> Self {
        self.websocket_only = yes;
        self
    }

    /// Attach the response producer and finish the route. Returning
    /// `Ok(None)` from the producer declines the request and lets later
    /// routes try.
    pub fn produce<F, Fut>(self, f: F) -> Route
    where
        F: Fn(Arc<Request>, RouteMatch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<ResponseProperties>, ServerError>> + Send + 'static,
    {
        Route {
            method: self.method,
            pattern: self.pattern,
            header_patterns: self.header_patterns,
            accepted_types: self.accepted_types,
            available_types: self.available_types,
            available_languages: self.available_languages,
            available_encodings: self.available_encodings,
            websocket_only: self.websocket_only,
            producer: Arc::new(move |req, m| Box::pin(f(req, m))),
        }
    }
}

/// Ordered route table.
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn add(&mut self, route: Route) -> &mut Self {
        self.routes.push(route);
        self
    }

    pub fn with(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Walk the table for `req`. Always returns a response: a committed
    /// route's, or a synthesized OPTIONS summary / 404 / 405 / 415.
    pub async fn dispatch(
        &self,
        req: &Arc<Request>,
    ) -> Result<ResponseProperties, ServerError> {
        let mut allowed_methods: Vec<Method> = Vec::new();
        let mut path_matched = false;
        let is_upgrade = req.is_upgrade();

        for route in &self.routes {
            if route.websocket_only != is_upgrade {
                continue;
            }
            let Some(params) = route.pattern.matches(req.pathname()) else {
                continue;
            };
            path_matched = true;
            if !route.method_matches(req.method()) {
                if let Some(m) = &route.method {
                    if !allowed_methods.contains(m) {
                        allowed_methods.push(m.clone());
                    }
                }
                continue;
            }
            let Some(header_params) = route.match_headers(req.headers()) else {
                continue;
            };

            if matches!(
                *req.method(),
                Method::POST | Method::PATCH | Method::PUT
            ) && !route.accepts_body_type(req.content_type())
            {
                return Ok(self.unsupported_media_type(req, route));
            }

            let content_type = negotiate(
                NegotiationKind::Type,
                req.header("accept"),
                &route.available_types,
            );
            let language = negotiate(
                NegotiationKind::Language,
                req.header("accept-language"),
                &route.available_languages,
            );
            let encoding = negotiate(
                NegotiationKind::Encoding,
                req.header("accept-encoding"),
                &route.available_encodings,
            );

            let vary = negotiation_vary(&content_type, &language, &encoding);
            let matched = RouteMatch {
                params,
                header_params,
                content_type,
                language,
                encoding,
            };
            if let Some(response) = (route.producer)(Arc::clone(req), matched).await? {
                return Ok(match vary {
                    Some(value) => response.compose(
                        ResponseProperties::default().with_header("vary", value),
                    ),
                    None => response,
                });
            }
            // Producer declined; keep walking.
        }

        if *req.method() == Method::OPTIONS {
            if req.resource() == "*" {
                return Ok(self.server_capabilities(req));
            }
            if path_matched {
                return Ok(self.resource_capabilities(req));
            }
        }

        if path_matched && !allowed_methods.is_empty() {
            let allow = allowed_methods
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(
                negotiated_error(req, StatusCode::METHOD_NOT_ALLOWED, None)
                    .with_header("allow", allow),
            );
        }

        Ok(negotiated_error(req, StatusCode::NOT_FOUND, None))
    }

    fn unsupported_media_type(&self, req: &Arc<Request>, route: &Route) -> ResponseProperties {
        let accepted = route.accepted_types.join(", ");
        let mut response =
            negotiated_error(req, StatusCode::UNSUPPORTED_MEDIA_TYPE, None);
        match *req.method() {
            Method::POST => response = response.with_header("accept-post", &accepted),
            Method::PATCH => response = response.with_header("accept-patch", &accepted),
            _ => {
                response = response
                    .with_header("accept-post", &accepted)
                    .with_header("accept-patch", &accepted);
            }
        }
        response
    }

    /// `OPTIONS *`: a server-wide capability summary.
    fn server_capabilities(&self, req: &Arc<Request>) -> ResponseProperties {
        let mut resources: Vec<serde_json::Value> = Vec::new();
        for route in &self.routes {
            resources.push(serde_json::json!({
                "resource": route.pattern.raw,
                "method": route
                    .method
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "*".to_string()),
                "types": route.available_types,
            }));
        }
        self.capability_response(
            req,
            serde_json::json!({ "resources": resources }),
        )
    }

    /// `OPTIONS /resource`: methods available on one resource.
    fn resource_capabilities(&self, req: &Arc<Request>) -> ResponseProperties {
        let mut methods: Vec<String> = Vec::new();
        for route in &self.routes {
            if route.pattern.matches(req.pathname()).is_some() {
                let name = route
                    .method
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "*".to_string());
                if !methods.contains(&name) {
                    methods.push(name);
                }
            }
        }
        let allow = methods.join(", ");
        self.capability_response(
            req,
            serde_json::json!({ "resource": req.pathname(), "methods": methods }),
        )
        .with_header("allow", allow)
    }

    fn capability_response(
        &self,
        req: &Arc<Request>,
        summary: serde_json::Value,
    ) -> ResponseProperties {
        let available = vec!["application/json".to_string(), "text/plain".to_string()];
        let picked = negotiate(NegotiationKind::Type, req.header("accept"), &available)
            .map(|n| n.value)
            .unwrap_or_else(|| "application/json".to_string());
        let response = if picked == "text/plain" {
            ResponseProperties::text(StatusCode::OK, summary.to_string())
        } else {
            ResponseProperties::json(StatusCode::OK, &summary)
        };
        response.with_header("vary", "accept")
    }
}

/// Which `Accept*` inputs influenced the response, for the `vary` header.
fn negotiation_vary(
    content_type: &Option<Negotiated>,
    language: &Option<Negotiated>,
    encoding: &Option<Negotiated>,
) -> Option<String> {
    let mut parts = Vec::new();
    if content_type.is_some() {
        parts.push("accept");
    }
    if language.is_some() {
        parts.push("accept-language");
    }
    if encoding.is_some() {
        parts.push("accept-encoding");
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}
