//! HTTP/2 serving over a sniffed TLS stream (ALPN `h2`) or a plaintext
//! prior-knowledge connection.
//!
//! # Responsibilities
//! - Drive the h2 connection: accept streams, spawn one task per stream
//! - Normalize each stream into the canonical form and feed the pipeline
//! - Write response bodies under h2 flow control, racing abort, write
//!   error, stream close and normal finish
//! - Execute server pushes declared by responses, after the veto hooks
//!
//! # Design Decisions
//! - Pushes are best-effort: a refused or failed push is logged and the
//!   main response proceeds untouched
//! - An aborted request resets its stream with CANCEL instead of quietly
//!   truncating the body, so the peer can tell the difference
//! - Graceful shutdown keeps polling `accept` to drive in-flight streams
//!   after the GOAWAY

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use h2::server::{SendPushedResponse, SendResponse};
use h2::{Reason, SendStream};
use http::{HeaderName, HeaderValue, Method, Uri};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::body::BodySource;
use crate::error::ServerError;
use crate::http::request::Request;
use crate::http::response::ResponseProperties;
use crate::http::ConnectionContext;
use crate::operation::Operation;

/// Serve HTTP/2 on `stream` until the peer goes away or the connection
/// scope aborts.
pub async fn serve<I>(stream: I, ctx: Arc<ConnectionContext>) -> Result<(), ServerError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut connection = h2::server::handshake(stream)
        .await
        .map_err(|e| ServerError::Protocol(e.to_string()))?;

    let mut closing = false;
    loop {
        tokio::select! {
            _ = ctx.connection_op.cancelled(), if !closing => {
                connection.graceful_shutdown();
                closing = true;
            }
            accepted = connection.accept() => {
                match accepted {
                    Some(Ok((request, respond))) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            handle_stream(request, respond, ctx).await;
                        });
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "HTTP/2 connection ended with error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

async fn handle_stream(
    raw: http::Request<h2::RecvStream>,
    mut respond: SendResponse<Bytes>,
    ctx: Arc<ConnectionContext>,
) {
    let (parts, recv) = raw.into_parts();
    let operation = ctx.connection_op.fork();
    let guard = operation.guard();
    let body = ctx.request_body(recv_body(recv));

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
        respond.send_reset(Reason::CANCEL);
        return;
    };

    if ctx.push_enabled && !props.push.is_empty() {
        start_pushes(&req, &props.push, &mut respond, &ctx);
    }

    if let Err(e) = write_response(props, &method, respond, &operation).await {
        tracing::debug!(request_id = %req.id(), error = %e, "HTTP/2 response write failed");
    }
}

/// Adapt an h2 receive stream into a byte stream, releasing connection
/// flow-control capacity as chunks are consumed.
fn recv_body(mut recv: h2::RecvStream) -> BodySource {
    let flow = recv.flow_control().clone();
    let stream = futures_util::stream::unfold((recv, flow), |(mut recv, mut flow)| async move {
        match recv.data().await {
            Some(Ok(chunk)) => {
                if let Err(e) = flow.release_capacity(chunk.len()) {
                    return Some((Err(io::Error::other(e)), (recv, flow)));
                }
                Some((Ok(chunk), (recv, flow)))
            }
            Some(Err(e)) => Some((Err(io::Error::other(e)), (recv, flow))),
            None => None,
        }
    });
    BodySource::stream(stream)
}

/// Offer every declared push target, skipping vetoed ones. Each accepted
/// push runs the full pipeline as a sub-request of `parent`.
fn start_pushes(
    parent: &Arc<Request>,
    targets: &[String],
    respond: &mut SendResponse<Bytes>,
    ctx: &Arc<ConnectionContext>,
) {
    for target in targets {
        if let Some(vetoer) = ctx.hooks().veto_push(parent, target) {
            tracing::debug!(parent_id = %parent.id(), target, vetoer, "Push vetoed");
            continue;
        }
        let uri: Uri = match format!("{}{}", parent.origin(), target).parse() {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!(target, error = %e, "Invalid push target");
                continue;
            }
        };
        let promise = match http::Request::get(uri).body(()) {
            Ok(promise) => promise,
            Err(e) => {
                tracing::warn!(target, error = %e, "Could not build push promise");
                continue;
            }
        };
        match respond.push_request(promise) {
            Ok(pushed) => {
                let push_req = Arc::new(Request::push_request(parent, target));
                let ctx = Arc::clone(ctx);
                tokio::spawn(async move {
                    fulfill_push(push_req, pushed, ctx).await;
                });
            }
            Err(e) => {
                // Peer disabled push or the stream is going away.
                tracing::debug!(target, error = %e, "Push refused by peer");
            }
        }
    }
}

async fn fulfill_push(
    req: Arc<Request>,
    mut pushed: SendPushedResponse<Bytes>,
    ctx: Arc<ConnectionContext>,
) {
    // Pushes are never drained by shutdown individually; their scope is a
    // fork of the parent request's.
    let (_tx, forced) = oneshot::channel();
    let operation = req.operation().clone();
    let outcome = ctx.pipeline.handle(Arc::clone(&req), forced).await;
    operation.end(false);

    let Some(props) = outcome.response else {
        return;
    };
    let response = into_parts_response(&props);
    let end_of_stream = props.body.is_none();
    let send = match pushed.send_response(response, end_of_stream) {
        Ok(send) => send,
        Err(e) => {
            tracing::debug!(request_id = %req.id(), error = %e, "Pushed response refused");
            return;
        }
    };
    if let Some(body) = props.body {
        if let Err(e) = write_body(send, body, &operation).await {
            tracing::debug!(request_id = %req.id(), error = %e, "Pushed body write failed");
        }
    }
}

async fn write_response(
    props: ResponseProperties,
    method: &Method,
    mut respond: SendResponse<Bytes>,
    operation: &Operation,
) -> io::Result<()> {
    let response = into_parts_response(&props);
    match props.body {
        Some(body) if *method != Method::HEAD => {
            let send = respond
                .send_response(response, false)
                .map_err(io::Error::other)?;
            write_body(send, body, operation).await
        }
        _ => {
            respond
                .send_response(response, true)
                .map_err(io::Error::other)?;
            Ok(())
        }
    }
}

/// Stream a body under h2 flow control. Terminal states: abort (reset
/// CANCEL), write error, peer closing the stream, or all bytes flushed.
async fn write_body(
    mut send: SendStream<Bytes>,
    source: BodySource,
    operation: &Operation,
) -> io::Result<()> {
    let mut stream = source.into_byte_stream();
    loop {
        let chunk = tokio::select! {
            _ = operation.cancelled() => {
                send.send_reset(Reason::CANCEL);
                return Ok(());
            }
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let mut remaining = chunk?;
        while !remaining.is_empty() {
            send.reserve_capacity(remaining.len());
            match std::future::poll_fn(|cx| send.poll_capacity(cx)).await {
                Some(Ok(granted)) => {
                    let frame = remaining.split_to(granted.min(remaining.len()));
                    send.send_data(frame, false).map_err(io::Error::other)?;
                }
                Some(Err(e)) => return Err(io::Error::other(e)),
                // Peer closed the stream; treat like abort, nothing more
                // to write.
                None => return Ok(()),
            }
        }
    }
    send.send_data(Bytes::new(), true).map_err(io::Error::other)
}

/// Status and headers only; HTTP/2 has no reason phrase and the body goes
/// over the send stream.
fn into_parts_response(props: &ResponseProperties) -> http::Response<()> {
    let mut builder = http::Response::builder().status(props.status_or_default());
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
    builder.body(()).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to assemble response parts, substituting 500");
        http::Response::builder()
            .status(http::StatusCode::INTERNAL_SERVER_ERROR)
            .body(())
            .expect("empty 500 response is always valid")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn parts_response_carries_headers_without_body() {
        let props = ResponseProperties::json(StatusCode::OK, &serde_json::json!({"ok": true}))
            .with_header("vary", "accept");
        let response = into_parts_response(&props);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("vary").unwrap(), "accept");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn invalid_header_value_is_dropped() {
        let props = ResponseProperties::new(StatusCode::OK).with_header("x-bad", "a\r\nb");
        let response = into_parts_response(&props);
        assert!(response.headers().get("x-bad").is_none());
    }
}
