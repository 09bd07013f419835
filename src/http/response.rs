//! Response value object and composition rules.
//!
//! # Responsibilities
//! - Carry status, headers, body and timing data between hooks
//! - Compose two property sets left-then-right with auditable per-field
//!   merge semantics
//!
//! # Design Decisions
//! - Headers live in an insertion-ordered list keyed by lower-cased name,
//!   so merge output order is deterministic and testable
//! - Composition uses an explicit per-field merge table, not a generic
//!   deep merge: `vary`, `allow`, `accept*`, `access-control-allow-*` and
//!   `server-timing` concatenate as de-duplicated comma lists; everything
//!   else is last-writer-wins

use std::time::Duration;

use http::StatusCode;

use crate::body::BodySource;

/// Insertion-ordered header map with lower-cased names.
#[derive(Debug, Clone, Default)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Replace (or add) a header.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.0
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.0.retain(|(n, _)| *n != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut list = HeaderList::new();
        for (n, v) in iter {
            list.insert(n, v);
        }
        list
    }
}

/// Header names that merge as de-duplicated comma lists when two property
/// sets compose.
fn merges_as_list(name: &str) -> bool {
    matches!(
        name,
        "vary" | "allow" | "accept" | "accept-post" | "accept-patch" | "server-timing"
    ) || name.starts_with("access-control-allow-")
}

/// Concatenate two comma-list header values, preserving first-seen order
/// and dropping duplicate entries (token comparison is case-insensitive).
fn merge_list_value(existing: &str, incoming: &str) -> String {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<&str> = Vec::new();
    for part in existing.split(',').chain(incoming.split(',')) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let key = part.to_ascii_lowercase();
        if !seen.contains(&key) {
            seen.push(key);
            out.push(part);
        }
    }
    out.join(", ")
}

/// A plain value object describing a response. Hooks produce and compose
/// these; the write path turns the final one into wire bytes.
#[derive(Debug, Default)]
pub struct ResponseProperties {
    /// Status code; `None` means "unset", letting a later layer decide
    /// (composition only overrides when the right side sets one).
    pub status: Option<StatusCode>,
    /// Custom reason phrase (HTTP/1 only; HTTP/2 has none).
    pub status_text: Option<String>,
    pub headers: HeaderList,
    pub body: Option<BodySource>,
    /// Declared encoding of `body`, when pre-encoded.
    pub body_encoding: Option<String>,
    /// Named durations merged into `server-timing` when timing is enabled.
    pub timings: Vec<(String, Duration)>,
    /// Resource paths to offer as HTTP/2 server pushes. Ignored on HTTP/1.
    pub push: Vec<String>,
}

impl ResponseProperties {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Properties carrying only headers, for injection hooks.
    pub fn headers_only(headers: HeaderList) -> Self {
        Self {
            headers,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<BodySource>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_push(mut self, path: impl Into<String>) -> Self {
        self.push.push(path.into());
        self
    }

    /// Response with a text body.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(body.into())
    }

    /// Response with an HTML body.
    pub fn html(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body(body.into())
    }

    /// Response with a serialized JSON body.
    pub fn json(status: StatusCode, value: &impl serde::Serialize) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    pub fn status_or_default(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// Compose `self` (left) with `over` (right): right wins scalar fields
    /// it sets; headers merge via the per-field table; timings and push
    /// lists append.
    pub fn compose(mut self, over: ResponseProperties) -> ResponseProperties {
        if over.status.is_some() {
            self.status = over.status;
        }
        if over.status_text.is_some() {
            self.status_text = over.status_text;
        }
        if over.body.is_some() {
            self.body = over.body;
        }
        if over.body_encoding.is_some() {
            self.body_encoding = over.body_encoding;
        }
        for (name, value) in over.headers.0 {
            if merges_as_list(&name) {
                match self.headers.get(&name) {
                    Some(existing) => {
                        let merged = merge_list_value(existing, &value);
                        self.headers.insert(&name, merged);
                    }
                    None => self.headers.insert(&name, value),
                }
            } else {
                self.headers.insert(&name, value);
            }
        }
        self.timings.extend(over.timings);
        self.push.extend(over.push);
        self
    }

    /// Render accumulated timings as a `server-timing` header value.
    pub fn server_timing_value(&self) -> Option<String> {
        if self.timings.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .timings
            .iter()
            .map(|(name, dur)| format!("{};dur={:.1}", name, dur.as_secs_f64() * 1000.0))
            .collect();
        Some(parts.join(", "))
    }
}
