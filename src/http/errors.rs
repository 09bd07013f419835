//! Auto-generated, content-negotiated error responses.
//!
//! # Design Decisions
//! - Every generated error body is negotiated the same way route bodies
//!   are: HTML for browsers, JSON for API clients, plain text fallback
//! - 500 detail is redacted unless the server runs with verbose errors

use http::StatusCode;

use crate::http::request::Request;
use crate::http::response::ResponseProperties;
use crate::routing::negotiation::{negotiate, NegotiationKind};

const ERROR_TYPES: &[&str] = &["text/html", "application/json", "text/plain"];

/// Build a negotiated error response. `detail` is included verbatim when
/// present, so callers decide what is safe to expose.
pub fn negotiated_error(
    req: &Request,
    status: StatusCode,
    detail: Option<&str>,
) -> ResponseProperties {
    let available: Vec<String> = ERROR_TYPES.iter().map(|s| s.to_string()).collect();
    let picked = negotiate(NegotiationKind::Type, req.header("accept"), &available)
        .map(|n| n.value)
        .unwrap_or_else(|| "text/plain".to_string());

    let title = status
        .canonical_reason()
        .unwrap_or("Error");

    let response = match picked.as_str() {
        "text/html" => ResponseProperties::html(
            status,
            format!(
                "<!doctype html><html><head><title>{code} {title}</title></head>\
                 <body><h1>{code} {title}</h1>{detail}</body></html>",
                code = status.as_u16(),
                title = title,
                detail = detail
                    .map(|d| format!("<p>{}</p>", d))
                    .unwrap_or_default(),
            ),
        ),
        "application/json" => ResponseProperties::json(
            status,
            &serde_json::json!({
                "status": status.as_u16(),
                "error": title,
                "detail": detail,
            }),
        ),
        _ => ResponseProperties::text(
            status,
            match detail {
                Some(d) => format!("{} {}\n{}\n", status.as_u16(), title, d),
                None => format!("{} {}\n", status.as_u16(), title),
            },
        ),
    };
    response.with_header("vary", "accept")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{BodySource, BodyStream};
    use crate::operation::Operation;
    use http::{HeaderMap, Method};

    fn request_accepting(accept: Option<&str>) -> Request {
        let mut headers = HeaderMap::new();
        headers.insert("host", "example.com".parse().unwrap());
        if let Some(a) = accept {
            headers.insert("accept", a.parse().unwrap());
        }
        Request::build(
            Method::GET,
            &"/missing".parse().unwrap(),
            headers,
            "127.0.0.1".parse().unwrap(),
            false,
            Operation::start(),
            BodyStream::new(BodySource::from("")),
        )
    }

    #[test]
    fn browser_gets_html() {
        let req = request_accepting(Some("text/html,application/xhtml+xml"));
        let res = negotiated_error(&req, StatusCode::NOT_FOUND, None);
        assert_eq!(res.headers.get("content-type"), Some("text/html; charset=utf-8"));
        assert_eq!(res.status_or_default(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn api_client_gets_json() {
        let req = request_accepting(Some("application/json"));
        let res = negotiated_error(&req, StatusCode::NOT_FOUND, Some("no such route"));
        assert_eq!(res.headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn no_accept_header_gets_first_available() {
        let req = request_accepting(None);
        let res = negotiated_error(&req, StatusCode::INTERNAL_SERVER_ERROR, None);
        assert!(res.headers.get("content-type").is_some());
        assert_eq!(res.headers.get("vary"), Some("accept"));
    }
}
