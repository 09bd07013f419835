//! Cross-origin resource sharing service.
//!
//! # Responsibilities
//! - Answer `OPTIONS` preflight requests without touching the router
//! - Inject `access-control-allow-*` headers on actual responses
//!
//! # Design Decisions
//! - Origin allowance is exact match or `*`; injected headers always ride
//!   with `vary: origin` so caches keep variants apart
//! - The `access-control-*` headers go through the composing merge table,
//!   so other services can extend the allow lists

use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode};

use crate::http::request::Request;
use crate::http::response::ResponseProperties;
use crate::services::{Hook, Service};

#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Allowed origins; `"*"` allows any.
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    /// Preflight cache lifetime.
    pub max_age_secs: u64,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: vec!["*".to_string()],
            allow_methods: vec![
                "GET".into(),
                "HEAD".into(),
                "POST".into(),
                "PUT".into(),
                "PATCH".into(),
                "DELETE".into(),
                "OPTIONS".into(),
            ],
            allow_headers: vec!["content-type".into(), "authorization".into()],
            max_age_secs: 86_400,
            allow_credentials: false,
        }
    }
}

pub struct Cors {
    config: CorsConfig,
}

impl Cors {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    fn allowed_origin(&self, origin: &str) -> Option<String> {
        if self.config.allow_origins.iter().any(|o| o == "*") {
            // Credentials forbid the wildcard form; echo the origin.
            return Some(if self.config.allow_credentials {
                origin.to_string()
            } else {
                "*".to_string()
            });
        }
        self.config
            .allow_origins
            .iter()
            .find(|o| o.eq_ignore_ascii_case(origin))
            .cloned()
    }

    fn allow_headers(&self, origin_value: String) -> ResponseProperties {
        let mut props = ResponseProperties::default()
            .with_header("access-control-allow-origin", origin_value)
            .with_header("vary", "origin");
        if self.config.allow_credentials {
            props = props.with_header("access-control-allow-credentials", "true");
        }
        props
    }
}

#[async_trait]
impl Service for Cors {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn hooks(&self) -> &'static [Hook] {
        &[Hook::HandleRequest, Hook::InjectHeaders]
    }

    fn handled_methods(&self) -> Option<Vec<Method>> {
        Some(vec![Method::OPTIONS])
    }

    /// Preflight: `OPTIONS` with `access-control-request-method`.
    async fn handle_request(
        &self,
        req: &Arc<Request>,
    ) -> Result<Option<ResponseProperties>, crate::error::ServerError> {
        if req.header("access-control-request-method").is_none() {
            return Ok(None);
        }
        let Some(origin) = req.header("origin") else {
            return Ok(None);
        };
        let Some(origin_value) = self.allowed_origin(origin) else {
            tracing::debug!(origin, "Preflight from disallowed origin");
            return Ok(Some(ResponseProperties::new(StatusCode::FORBIDDEN)));
        };

        let mut response = self
            .allow_headers(origin_value)
            .with_header(
                "access-control-allow-methods",
                self.config.allow_methods.join(", "),
            )
            .with_header(
                "access-control-allow-headers",
                self.config.allow_headers.join(", "),
            )
            .with_header("access-control-max-age", self.config.max_age_secs.to_string());
        response.status = Some(StatusCode::NO_CONTENT);
        Ok(Some(response))
    }

    fn inject_headers(
        &self,
        req: &Arc<Request>,
        _response: &ResponseProperties,
    ) -> Option<ResponseProperties> {
        let origin = req.header("origin")?;
        let origin_value = self.allowed_origin(origin)?;
        Some(self.allow_headers(origin_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    use crate::body::{BodySource, BodyStream};
    use crate::operation::Operation;

    fn request(method: Method, pairs: &[(&str, &str)]) -> Arc<Request> {
        let mut headers = HeaderMap::new();
        headers.insert("host", "api.example".parse().unwrap());
        for (n, v) in pairs {
            headers.insert(
                http::header::HeaderName::from_bytes(n.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        Arc::new(Request::build(
            method,
            &"/data".parse().unwrap(),
            headers,
            "127.0.0.1".parse().unwrap(),
            false,
            Operation::start(),
            BodyStream::new(BodySource::from("")),
        ))
    }

    #[tokio::test]
    async fn preflight_gets_204_with_allow_lists() {
        let cors = Cors::new(CorsConfig::default());
        let req = request(
            Method::OPTIONS,
            &[
                ("origin", "https://app.example"),
                ("access-control-request-method", "POST"),
            ],
        );
        let response = cors.handle_request(&req).await.unwrap().unwrap();
        assert_eq!(response.status_or_default(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers.get("access-control-allow-origin"),
            Some("*")
        );
        assert!(response
            .headers
            .get("access-control-allow-methods")
            .unwrap()
            .contains("POST"));
    }

    #[tokio::test]
    async fn plain_options_is_declined() {
        let cors = Cors::new(CorsConfig::default());
        let req = request(Method::OPTIONS, &[("origin", "https://app.example")]);
        assert!(cors.handle_request(&req).await.unwrap().is_none());
    }

    #[test]
    fn actual_response_gets_origin_and_vary() {
        let cors = Cors::new(CorsConfig {
            allow_origins: vec!["https://app.example".into()],
            ..CorsConfig::default()
        });
        let req = request(Method::GET, &[("origin", "https://app.example")]);
        let injected = cors
            .inject_headers(&req, &ResponseProperties::new(StatusCode::OK))
            .unwrap();
        assert_eq!(
            injected.headers.get("access-control-allow-origin"),
            Some("https://app.example")
        );
        assert_eq!(injected.headers.get("vary"), Some("origin"));
    }

    #[test]
    fn disallowed_origin_gets_nothing() {
        let cors = Cors::new(CorsConfig {
            allow_origins: vec!["https://app.example".into()],
            ..CorsConfig::default()
        });
        let req = request(Method::GET, &[("origin", "https://evil.example")]);
        assert!(cors
            .inject_headers(&req, &ResponseProperties::new(StatusCode::OK))
            .is_none());
    }

    #[test]
    fn credentials_echo_the_origin_instead_of_wildcard() {
        let cors = Cors::new(CorsConfig {
            allow_credentials: true,
            ..CorsConfig::default()
        });
        let req = request(Method::GET, &[("origin", "https://app.example")]);
        let injected = cors
            .inject_headers(&req, &ResponseProperties::new(StatusCode::OK))
            .unwrap();
        assert_eq!(
            injected.headers.get("access-control-allow-origin"),
            Some("https://app.example")
        );
        assert_eq!(
            injected.headers.get("access-control-allow-credentials"),
            Some("true")
        );
    }
}
