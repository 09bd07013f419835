//! Canonical request snapshot.
//!
//! # Responsibilities
//! - Normalize transport-level requests (HTTP/1 or HTTP/2, plain or TLS)
//!   into one immutable value all routing and negotiation operates on
//! - Derive origin/host/proto and their forwarded counterparts
//! - Expose the body lazily, with validating materialization accessors
//!
//! # Design Decisions
//! - Header names are lower-cased (`http::HeaderMap` guarantees this)
//! - `Forwarded` (RFC 7239) wins over legacy `X-Forwarded-*`; the first
//!   entry of either wins over later proxies
//! - Content-type mismatch on a body accessor logs a warning, it never
//!   fails the read
//! - A push sub-request inherits the parent's headers except validators
//!   that target the parent resource

use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::body::{self, BodySource, BodyStream};
use crate::operation::Operation;

/// Conditional-request headers that validate the parent resource; a push
/// sub-request must not inherit them.
const VALIDATOR_HEADERS: &[&str] = &[
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
    "if-range",
    "range",
];

/// Values derived from `Forwarded` / `X-Forwarded-*` headers.
#[derive(Debug, Clone, Default)]
pub struct ForwardedInfo {
    pub host: Option<String>,
    pub proto: Option<String>,
    pub client: Option<String>,
}

/// The normalized, immutable request value. Built once per transport
/// request, and once more per HTTP/2 push sub-request.
pub struct Request {
    method: Method,
    /// Raw path + query, unparsed.
    resource: String,
    pathname: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    host: String,
    proto: String,
    origin: String,
    forwarded: ForwardedInfo,
    client_ip: IpAddr,
    id: Uuid,
    operation: Operation,
    body: Arc<Mutex<Option<BodyStream>>>,
    parent: Option<Arc<Request>>,
}

impl Request {
    /// Build the canonical snapshot from transport input.
    pub fn build(
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        client_ip: IpAddr,
        tls: bool,
        operation: Operation,
        body: BodyStream,
    ) -> Self {
        let resource = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let (pathname, query) = split_resource(&resource);
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| "localhost".to_string());
        let proto = if tls { "https" } else { "http" }.to_string();
        let origin = format!("{}://{}", proto, host);
        let forwarded = parse_forwarded(&headers);

        Self {
            method,
            resource,
            pathname,
            query,
            headers,
            host,
            proto,
            origin,
            forwarded,
            client_ip,
            id: Uuid::new_v4(),
            operation,
            body: Arc::new(Mutex::new(Some(body))),
            parent: None,
        }
    }

    /// Layer a rewritten resource over this request (service redirection).
    /// The body, cancellation scope and request id carry over.
    pub fn redirected(&self, resource: &str) -> Self {
        let resource = resource.to_string();
        let (pathname, query) = split_resource(&resource);
        Self {
            method: self.method.clone(),
            resource,
            pathname,
            query,
            headers: self.headers.clone(),
            host: self.host.clone(),
            proto: self.proto.clone(),
            origin: self.origin.clone(),
            forwarded: self.forwarded.clone(),
            client_ip: self.client_ip,
            id: self.id,
            operation: self.operation.clone(),
            body: Arc::clone(&self.body),
            parent: self.parent.clone(),
        }
    }

    /// Build the sub-request for an HTTP/2 server push of `path`.
    pub fn push_request(parent: &Arc<Request>, path: &str) -> Self {
        let mut headers = parent.headers.clone();
        for name in VALIDATOR_HEADERS {
            headers.remove(*name);
        }
        let resource = path.to_string();
        let (pathname, query) = split_resource(&resource);
        Self {
            method: Method::GET,
            resource,
            pathname,
            query,
            headers,
            host: parent.host.clone(),
            proto: parent.proto.clone(),
            origin: parent.origin.clone(),
            forwarded: parent.forwarded.clone(),
            client_ip: parent.client_ip,
            id: Uuid::new_v4(),
            operation: parent.operation.fork(),
            body: Arc::new(Mutex::new(Some(BodyStream::new(BodySource::Bytes(
                Bytes::new(),
            ))))),
            parent: Some(Arc::clone(parent)),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    /// Parsed query parameters, in order of appearance.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn proto(&self) -> &str {
        &self.proto
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn forwarded(&self) -> &ForwardedInfo {
        &self.forwarded
    }

    /// Host as seen by the first proxy, falling back to the direct host.
    pub fn forwarded_host(&self) -> &str {
        self.forwarded.host.as_deref().unwrap_or(&self.host)
    }

    pub fn forwarded_proto(&self) -> &str {
        self.forwarded.proto.as_deref().unwrap_or(&self.proto)
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The request's cancellation scope (a fork of the connection scope).
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Parent request, for push sub-requests.
    pub fn parent(&self) -> Option<&Arc<Request>> {
        self.parent.as_ref()
    }

    /// Whether this is a protocol upgrade request.
    pub fn is_upgrade(&self) -> bool {
        self.header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false)
            && self.headers.contains_key("upgrade")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type").map(|v| {
            v.split(';').next().unwrap_or(v).trim()
        })
    }

    /// Take the lazy body out. Subsequent calls return `None`.
    pub fn take_body(&self) -> Option<BodyStream> {
        self.body.lock().expect("body lock poisoned").take()
    }

    fn warn_on_type_mismatch(&self, expected: &str) {
        let Some(declared) = self.content_type() else {
            return;
        };
        let matches = if let Some(prefix) = expected.strip_suffix("/*") {
            declared.starts_with(prefix)
        } else {
            declared.eq_ignore_ascii_case(expected)
        };
        if !matches {
            tracing::warn!(
                request_id = %self.id,
                declared = declared,
                expected = expected,
                "body read with mismatched content-type"
            );
        }
    }

    /// Materialize the whole body into memory.
    pub async fn buffer(&self) -> io::Result<Bytes> {
        let Some(body) = self.take_body() else {
            return Err(io::Error::other("request body already consumed"));
        };
        body::collect(&body).await
    }

    /// Materialize the body as UTF-8 text.
    pub async fn text(&self) -> io::Result<String> {
        self.warn_on_type_mismatch("text/*");
        let bytes = self.buffer().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Materialize and deserialize a JSON body.
    pub async fn json<T: DeserializeOwned>(&self) -> io::Result<T> {
        self.warn_on_type_mismatch("application/json");
        let bytes = self.buffer().await?;
        serde_json::from_slice(&bytes).map_err(io::Error::other)
    }

    /// Materialize an url-encoded form body into pairs.
    pub async fn form(&self) -> io::Result<Vec<(String, String)>> {
        self.warn_on_type_mismatch("application/x-www-form-urlencoded");
        let bytes = self.buffer().await?;
        Ok(url::form_urlencoded::parse(&bytes)
            .into_owned()
            .collect())
    }

    /// Materialize an url-encoded body as the raw query string, percent
    /// escapes intact.
    pub async fn query_string(&self) -> io::Result<String> {
        self.warn_on_type_mismatch("application/x-www-form-urlencoded");
        let bytes = self.buffer().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("resource", &self.resource)
            .field("host", &self.host)
            .field("client_ip", &self.client_ip)
            .field("id", &self.id)
            .finish()
    }
}

fn split_resource(resource: &str) -> (String, Vec<(String, String)>) {
    match resource.split_once('?') {
        Some((path, query)) => (
            path.to_string(),
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
        ),
        None => (resource.to_string(), Vec::new()),
    }
}

/// Parse `Forwarded` (first element wins), falling back to the legacy
/// `X-Forwarded-*` trio (first comma-separated entry wins).
fn parse_forwarded(headers: &HeaderMap) -> ForwardedInfo {
    if let Some(value) = headers.get("forwarded").and_then(|v| v.to_str().ok()) {
        let first = value.split(',').next().unwrap_or("");
        let mut info = ForwardedInfo::default();
        for pair in first.split(';') {
            let Some((key, val)) = pair.split_once('=') else {
                continue;
            };
            let val = val.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "host" => info.host = Some(val),
                "proto" => info.proto = Some(val),
                "for" => info.client = Some(val),
                _ => {}
            }
        }
        return info;
    }

    let first_entry = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
    };
    ForwardedInfo {
        host: first_entry("x-forwarded-host"),
        proto: first_entry("x-forwarded-proto"),
        client: first_entry("x-forwarded-for"),
    }
}
