//! HTTP/1.x serving over a sniffed plain or TLS stream.
//!
//! # Responsibilities
//! - Drive hyper's http1 connection for one socket
//! - Normalize each transport request into the canonical form and feed it
//!   through the pipeline
//! - Stream response bodies, racing client abort against completion
//! - Answer plaintext requests on a TLS-enabled server with a 301 when
//!   configured
//!
//! # Design Decisions
//! - The response body stream is cut off by the request scope's
//!   cancellation, so an aborted request stops writing mid-body instead of
//!   draining the source
//! - Connection shutdown is hyper's graceful variant raced against the
//!   connection scope; force-close comes from aborting that scope
//! - Push targets carried by a response are ignored here with a debug log;
//!   only HTTP/2 can deliver them

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http::{HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::body::BodySource;
use crate::error::ServerError;
use crate::http::request::Request;
use crate::http::response::ResponseProperties;
use crate::http::ConnectionContext;
use crate::operation::Operation;

type OutBody = UnsyncBoxBody<Bytes, io::Error>;

/// Serve HTTP/1.x on `stream` until the peer hangs up or the connection
/// scope aborts.
pub async fn serve<I>(stream: I, ctx: Arc<ConnectionContext>) -> Result<(), ServerError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service_ctx = Arc::clone(&ctx);
    let service = service_fn(move |raw: hyper::Request<Incoming>| {
        let ctx = Arc::clone(&service_ctx);
        async move { handle_one(raw, ctx).await }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                // Peer resets mid-exchange are routine, not failures.
                tracing::debug!(error = %e, "HTTP/1 connection ended with error");
            }
        }
        _ = ctx.connection_op.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "HTTP/1 connection error during shutdown");
            }
        }
    }
    Ok(())
}

async fn handle_one(
    raw: hyper::Request<Incoming>,
    ctx: Arc<ConnectionContext>,
) -> Result<hyper::Response<OutBody>, io::Error> {
    let (parts, incoming) = raw.into_parts();

    if ctx.redirect_https {
        let host = parts
            .headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        return Ok(redirect_response(host, &parts.uri));
    }

    let operation = ctx.connection_op.fork();
    // Hyper drops this future when the peer disconnects mid-request; the
    // guard settles the scope either way so tracking entries self-remove.
    let guard = operation.guard();
    let body_stream = http_body_util::BodyStream::new(incoming).filter_map(|frame| async move {
        match frame {
            Ok(frame) => frame.into_data().ok().map(Ok),
            Err(e) => Some(Err(io::Error::other(e))),
        }
    });
    let body = ctx.request_body(BodySource::stream(body_stream));

    let method = parts.method.clone();
    let req = Arc::new(Request::build(
        parts.method,
        &parts.uri,
        parts.headers,
        ctx.client_ip,
        ctx.tls,
        operation.clone(),
        body,
    ));

    let forced = ctx.track_request(req.id(), &operation);
    tracing::debug!(request_id = %req.id(), method = %method, resource = %req.resource(), "Request");

    let outcome = ctx.pipeline.handle(Arc::clone(&req), forced).await;
    guard.complete();
    if let Some(failure) = &outcome.failure {
        ctx.report_failure(failure);
    }

    let Some(props) = outcome.response else {
        return Err(io::Error::other("request aborted"));
    };
    if !props.push.is_empty() {
        tracing::debug!(
            request_id = %req.id(),
            targets = props.push.len(),
            "Push targets ignored on HTTP/1"
        );
    }
    Ok(into_wire(props, &method, &operation))
}

/// Convert pipeline output into a hyper response, wiring the body stream
/// to the request's cancellation scope.
pub fn into_wire(
    props: ResponseProperties,
    method: &Method,
    operation: &Operation,
) -> hyper::Response<OutBody> {
    let mut builder = hyper::Response::builder().status(props.status_or_default());
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in props.headers.iter() {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                tracing::warn!(header = name, "Dropping invalid response header name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                tracing::warn!(header = %name, "Dropping invalid response header value");
                continue;
            };
            headers.append(name, value);
        }
    }

    let skip_body = *method == Method::HEAD || props.body.is_none();
    let body: OutBody = if skip_body {
        empty_body()
    } else {
        match props.body {
            Some(BodySource::Bytes(bytes)) => Full::new(bytes)
                .map_err(|never: std::convert::Infallible| match never {})
                .boxed_unsync(),
            Some(source) => {
                let op = operation.clone();
                let stream = source
                    .into_byte_stream()
                    .take_until(async move { op.cancelled().await })
                    .map_ok(Frame::data);
                // boxed_unsync: only BodyExt offers it, and the inner
                // stream is Send but not Sync.
                StreamBody::new(stream).boxed_unsync()
            }
            None => empty_body(),
        }
    };

    builder.body(body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to assemble response, substituting 500");
        hyper::Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(empty_body())
            .expect("empty 500 response is always valid")
    })
}

fn empty_body() -> OutBody {
    Empty::new()
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed_unsync()
}

/// 301 to the https origin for plaintext requests on a TLS-enabled server.
/// Both protocols share one port, so the host header's port carries over.
fn redirect_response(host: &str, uri: &http::Uri) -> hyper::Response<OutBody> {
    let target = format!(
        "https://{}{}",
        host,
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );
    let props = ResponseProperties::new(StatusCode::MOVED_PERMANENTLY)
        .with_header("location", target)
        .with_header("content-length", "0");
    into_wire(props, &Method::GET, &Operation::start())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_conversion_keeps_status_and_headers() {
        let props = ResponseProperties::text(StatusCode::CREATED, "made")
            .with_header("x-request-id", "abc");
        let response = into_wire(props, &Method::GET, &Operation::start());
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.headers().get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn head_requests_skip_the_body() {
        use http_body::Body as _;
        let props = ResponseProperties::text(StatusCode::OK, "never sent");
        let response = into_wire(props, &Method::HEAD, &Operation::start());
        assert_eq!(response.body().size_hint().exact(), Some(0));
    }

    #[test]
    fn invalid_header_is_dropped_not_fatal() {
        let props =
            ResponseProperties::new(StatusCode::OK).with_header("x-bad", "line\nbreak");
        let response = into_wire(props, &Method::GET, &Operation::start());
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-bad").is_none());
    }

    #[test]
    fn redirect_preserves_host_port_path_and_query() {
        let response = redirect_response("example.com:8443", &"/docs?page=2".parse().unwrap());
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "https://example.com:8443/docs?page=2"
        );
    }
}
