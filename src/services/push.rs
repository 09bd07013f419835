//! Push policy service: decides which declared push targets survive.
//!
//! The push mechanics live in the HTTP/2 front-end; this service is the
//! built-in `VetoPush` participant. Any registered service can veto a
//! push, this one enforces the baseline rules.

use std::sync::Arc;

use async_trait::async_trait;

use crate::http::request::Request;
use crate::services::{Hook, Service};

#[derive(Debug, Clone)]
pub struct PushPolicyConfig {
    /// Path prefixes that must never be pushed.
    pub deny_prefixes: Vec<String>,
    /// Refuse to push the resource the client just asked for.
    pub deny_self_push: bool,
}

impl Default for PushPolicyConfig {
    fn default() -> Self {
        Self {
            deny_prefixes: Vec::new(),
            deny_self_push: true,
        }
    }
}

pub struct PushPolicy {
    config: PushPolicyConfig,
}

impl PushPolicy {
    pub fn new(config: PushPolicyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Service for PushPolicy {
    fn name(&self) -> &'static str {
        "push-policy"
    }

    fn hooks(&self) -> &'static [Hook] {
        &[Hook::VetoPush]
    }

    fn veto_push(&self, parent: &Arc<Request>, path: &str) -> bool {
        if !path.starts_with('/') {
            return true;
        }
        if self.config.deny_self_push && path == parent.resource() {
            return true;
        }
        self.config
            .deny_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};

    use crate::body::{BodySource, BodyStream};
    use crate::operation::Operation;

    fn parent(resource: &str) -> Arc<Request> {
        let mut headers = HeaderMap::new();
        headers.insert("host", "example.com".parse().unwrap());
        Arc::new(Request::build(
            Method::GET,
            &resource.parse().unwrap(),
            headers,
            "127.0.0.1".parse().unwrap(),
            true,
            Operation::start(),
            BodyStream::new(BodySource::from("")),
        ))
    }

    #[test]
    fn relative_targets_are_vetoed() {
        let policy = PushPolicy::new(PushPolicyConfig::default());
        assert!(policy.veto_push(&parent("/index.html"), "style.css"));
        assert!(!policy.veto_push(&parent("/index.html"), "/style.css"));
    }

    #[test]
    fn pushing_the_requested_resource_is_vetoed() {
        let policy = PushPolicy::new(PushPolicyConfig::default());
        assert!(policy.veto_push(&parent("/index.html"), "/index.html"));
    }

    #[test]
    fn deny_prefixes_apply() {
        let policy = PushPolicy::new(PushPolicyConfig {
            deny_prefixes: vec!["/private/".into()],
            deny_self_push: true,
        });
        assert!(policy.veto_push(&parent("/"), "/private/keys.js"));
        assert!(!policy.veto_push(&parent("/"), "/public/app.js"));
    }
}
