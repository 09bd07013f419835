//! Request handling pipeline.
//!
//! # Data Flow
//! ```text
//! canonical Request
//!     → redirect hooks (optional resource rewrite)
//!     → race: handler | response timeout (504) | forced answer | cancel
//!     → failure → error hooks → redacted 500 / 503 / 403
//!     → server-timing merge → header-injection hooks → response-ready
//!     → Outcome handed to the transport write path
//! ```
//!
//! # Design Decisions
//! - The handler runs as its own task; a timeout or forced answer wins the
//!   race without cancelling it. A slow handler finishing late does wasted
//!   work but cannot corrupt the sent response, because the write path only
//!   accepts the race winner
//! - A forced answer (graceful shutdown draining pending requests) arrives
//!   over a per-request oneshot and outranks whatever the handler produces
//! - Handler failures become responses here; whether a failure also stops
//!   the server is the lifecycle layer's policy, so the failure rides along
//!   in the outcome

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::sync::oneshot;

use crate::error::ServerError;
use crate::http::errors::negotiated_error;
use crate::http::request::Request;
use crate::http::response::ResponseProperties;
use crate::operation::{race, Contender};
use crate::routing::Router;
use crate::services::HookController;

/// What the race produced.
enum RaceOutcome {
    Produced(Result<(ResponseProperties, Vec<(String, Duration)>), ServerError>),
    Timeout,
    Forced(StatusCode),
    Cancelled,
}

/// The pipeline's verdict for one request.
pub struct Outcome {
    /// `None` when the request was cancelled before anything won; the
    /// transport destroys the output without writing.
    pub response: Option<ResponseProperties>,
    /// The handler failure behind a 500, for the shutdown policy.
    pub failure: Option<ServerError>,
}

pub struct Pipeline {
    router: Arc<Router>,
    hooks: Arc<HookController>,
    response_timeout: Duration,
    verbose_errors: bool,
    timing: bool,
}

impl Pipeline {
    pub fn new(
        router: Arc<Router>,
        hooks: Arc<HookController>,
        response_timeout: Duration,
        verbose_errors: bool,
        timing: bool,
    ) -> Self {
        Self {
            router,
            hooks,
            response_timeout,
            verbose_errors,
            timing,
        }
    }

    pub fn hooks(&self) -> &Arc<HookController> {
        &self.hooks
    }

    /// Run one request through the pipeline. `forced` lets the lifecycle
    /// layer answer this request with a fixed status during shutdown.
    pub async fn handle(
        &self,
        req: Arc<Request>,
        forced: oneshot::Receiver<StatusCode>,
    ) -> Outcome {
        let req = match self.hooks.redirect_request(&req).await {
            Some(resource) => {
                tracing::debug!(request_id = %req.id(), to = %resource, "Request redirected");
                Arc::new(req.redirected(&resource))
            }
            None => req,
        };

        let outcome = self.race_response(&req, forced).await;

        let (mut response, failure) = match outcome {
            RaceOutcome::Produced(Ok((mut response, timings))) => {
                response.timings.extend(timings);
                (response, None)
            }
            RaceOutcome::Produced(Err(error)) => {
                let mut timings = Vec::new();
                let mut response = self.answer_failure(&req, &error, &mut timings).await;
                response.timings.extend(timings);
                (response, Some(error))
            }
            RaceOutcome::Timeout => {
                tracing::warn!(
                    request_id = %req.id(),
                    timeout_secs = self.response_timeout.as_secs(),
                    "No handler answered within the response timeout"
                );
                (
                    negotiated_error(
                        &req,
                        StatusCode::GATEWAY_TIMEOUT,
                        Some("response generation timed out"),
                    ),
                    Some(ServerError::Timeout),
                )
            }
            RaceOutcome::Forced(status) => (
                negotiated_error(&req, status, Some("server is stopping"))
                    .with_header("retry-after", "1"),
                None,
            ),
            RaceOutcome::Cancelled => {
                return Outcome {
                    response: None,
                    failure: None,
                }
            }
        };

        if self.timing {
            if let Some(value) = response.server_timing_value() {
                response = response.compose(
                    ResponseProperties::default().with_header("server-timing", value),
                );
            }
        }

        let response = self.hooks.inject_headers(&req, response);
        self.hooks.response_ready(&req, &response).await;

        Outcome {
            response: Some(response),
            failure,
        }
    }

    /// Whichever comes first: a produced response, the response timeout,
    /// a forced shutdown answer, or client cancellation.
    async fn race_response(
        &self,
        req: &Arc<Request>,
        forced: oneshot::Receiver<StatusCode>,
    ) -> RaceOutcome {
        let handler = {
            let hooks = Arc::clone(&self.hooks);
            let router = Arc::clone(&self.router);
            let req = Arc::clone(req);
            tokio::spawn(async move {
                let mut timings = Vec::new();
                let result = match hooks.handle_request(&req, &mut timings).await {
                    Ok(Some(response)) => Ok(response),
                    Ok(None) => router.dispatch(&req).await,
                    Err(e) => Err(e),
                };
                result.map(|response| (response, timings))
            })
        };

        let timeout = self.response_timeout;
        let cancel_op = req.operation().clone();

        let winner = race(vec![
            Contender::new("handler", async move {
                match handler.await {
                    Ok(result) => RaceOutcome::Produced(result),
                    Err(join_error) => RaceOutcome::Produced(Err(ServerError::Handler(
                        join_error.to_string(),
                    ))),
                }
            }),
            Contender::new("timeout", async move {
                tokio::time::sleep(timeout).await;
                RaceOutcome::Timeout
            }),
            Contender::new("override", async move {
                match forced.await {
                    Ok(status) => RaceOutcome::Forced(status),
                    // Sender dropped without forcing; stay pending so the
                    // other contenders decide.
                    Err(_) => std::future::pending().await,
                }
            }),
            Contender::new("cancel", async move {
                cancel_op.cancelled().await;
                RaceOutcome::Cancelled
            }),
        ])
        .await;

        match winner {
            Some((name, outcome)) => {
                tracing::trace!(winner = name, "Response race settled");
                outcome
            }
            None => RaceOutcome::Cancelled,
        }
    }

    /// Translate a handler failure into a response: error hooks first, then
    /// resource-exhaustion mapping, then a redacted 500.
    async fn answer_failure(
        &self,
        req: &Arc<Request>,
        error: &ServerError,
        timings: &mut Vec<(String, Duration)>,
    ) -> ResponseProperties {
        if let Some(response) = self.hooks.handle_error(req, error, timings).await {
            return response;
        }

        if error.is_resource_exhaustion() {
            tracing::warn!(request_id = %req.id(), error = %error, "Resource exhaustion");
            return negotiated_error(
                req,
                StatusCode::SERVICE_UNAVAILABLE,
                Some("temporarily out of resources"),
            )
            .with_header("retry-after", "1");
        }
        if error.is_permission_denied() {
            tracing::warn!(request_id = %req.id(), error = %error, "Permission denied");
            return negotiated_error(req, StatusCode::FORBIDDEN, None)
                .with_header("retry-after", "1");
        }

        tracing::error!(request_id = %req.id(), error = %error, "Handler failed");
        let detail = if self.verbose_errors {
            Some(error.to_string())
        } else {
            None
        };
        negotiated_error(req, StatusCode::INTERNAL_SERVER_ERROR, detail.as_deref())
            .with_header("cache-control", "no-store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::{HeaderMap, Method};

    use crate::body::{BodySource, BodyStream};
    use crate::operation::Operation;
    use crate::routing::Route;
    use crate::services::{Hook, Service};

    fn make_request(path: &str) -> Arc<Request> {
        let mut headers = HeaderMap::new();
        headers.insert("host", "example.com".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());
        Arc::new(Request::build(
            Method::GET,
            &path.parse().unwrap(),
            headers,
            "127.0.0.1".parse().unwrap(),
            false,
            Operation::start(),
            BodyStream::new(BodySource::from("")),
        ))
    }

    fn pipeline_with(router: Router, hooks: HookController, timeout: Duration) -> Pipeline {
        Pipeline::new(Arc::new(router), Arc::new(hooks), timeout, false, false)
    }

    fn unforced() -> oneshot::Receiver<StatusCode> {
        oneshot::channel().1
    }

    #[tokio::test]
    async fn routed_response_flows_through() {
        let router = Router::new().with(
            Route::builder("GET", "/hello")
                .unwrap()
                .produce(|_req, _m| async {
                    Ok(Some(ResponseProperties::text(StatusCode::OK, "hi")))
                }),
        );
        let pipeline = pipeline_with(router, HookController::new(false), Duration::from_secs(5));
        let outcome = pipeline.handle(make_request("/hello"), unforced()).await;
        let response = outcome.response.unwrap();
        assert_eq!(response.status_or_default(), StatusCode::OK);
        assert!(outcome.failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_loses_to_timeout() {
        let router = Router::new().with(
            Route::builder("GET", "/slow")
                .unwrap()
                .produce(|_req, _m| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Some(ResponseProperties::new(StatusCode::OK)))
                }),
        );
        let pipeline = pipeline_with(router, HookController::new(false), Duration::from_secs(1));
        let outcome = pipeline.handle(make_request("/slow"), unforced()).await;
        let response = outcome.response.unwrap();
        assert_eq!(response.status_or_default(), StatusCode::GATEWAY_TIMEOUT);
        assert!(matches!(outcome.failure, Some(ServerError::Timeout)));
    }

    #[tokio::test]
    async fn forced_answer_outranks_handler() {
        let router = Router::new().with(
            Route::builder("GET", "/pending")
                .unwrap()
                .produce(|_req, _m| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Some(ResponseProperties::new(StatusCode::OK)))
                }),
        );
        let pipeline = pipeline_with(router, HookController::new(false), Duration::from_secs(60));
        let (tx, rx) = oneshot::channel();
        tx.send(StatusCode::SERVICE_UNAVAILABLE).unwrap();
        let outcome = pipeline.handle(make_request("/pending"), rx).await;
        let response = outcome.response.unwrap();
        assert_eq!(
            response.status_or_default(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(response.headers.get("retry-after"), Some("1"));
    }

    #[tokio::test]
    async fn cancelled_request_produces_no_response() {
        let req = make_request("/never");
        req.operation().abort();
        let pipeline = pipeline_with(
            Router::new(),
            HookController::new(false),
            Duration::from_secs(60),
        );
        let outcome = pipeline.handle(req, unforced()).await;
        assert!(outcome.response.is_none());
    }

    #[tokio::test]
    async fn handler_failure_becomes_redacted_500() {
        let router = Router::new().with(
            Route::builder("GET", "/boom")
                .unwrap()
                .produce(|_req, _m| async {
                    Err(ServerError::Handler("secret detail".into()))
                }),
        );
        let pipeline = pipeline_with(router, HookController::new(false), Duration::from_secs(5));
        let outcome = pipeline.handle(make_request("/boom"), unforced()).await;
        let response = outcome.response.unwrap();
        assert_eq!(
            response.status_or_default(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(response.headers.get("cache-control"), Some("no-store"));
        assert!(outcome.failure.is_some());
    }

    struct ErrorTranslator;

    #[async_trait]
    impl Service for ErrorTranslator {
        fn name(&self) -> &'static str {
            "error-translator"
        }
        fn hooks(&self) -> &'static [Hook] {
            &[Hook::HandleError]
        }
        async fn handle_error(
            &self,
            _req: &Arc<Request>,
            _error: &ServerError,
        ) -> Option<ResponseProperties> {
            Some(ResponseProperties::text(StatusCode::CONFLICT, "translated"))
        }
    }

    #[tokio::test]
    async fn error_hook_translates_failures() {
        let router = Router::new().with(
            Route::builder("GET", "/boom")
                .unwrap()
                .produce(|_req, _m| async { Err(ServerError::Handler("domain".into())) }),
        );
        let mut hooks = HookController::new(false);
        hooks.register(Arc::new(ErrorTranslator)).unwrap();
        let pipeline = pipeline_with(router, hooks, Duration::from_secs(5));
        let outcome = pipeline.handle(make_request("/boom"), unforced()).await;
        let response = outcome.response.unwrap();
        assert_eq!(response.status_or_default(), StatusCode::CONFLICT);
    }

    struct Redirector;

    #[async_trait]
    impl Service for Redirector {
        fn name(&self) -> &'static str {
            "redirector"
        }
        fn hooks(&self) -> &'static [Hook] {
            &[Hook::RedirectRequest]
        }
        async fn redirect_request(&self, req: &Arc<Request>) -> Option<String> {
            (req.pathname() == "/old").then(|| "/new".to_string())
        }
    }

    #[tokio::test]
    async fn redirect_hook_rewrites_resource() {
        let router = Router::new().with(
            Route::builder("GET", "/new")
                .unwrap()
                .produce(|_req, _m| async {
                    Ok(Some(ResponseProperties::text(StatusCode::OK, "moved")))
                }),
        );
        let mut hooks = HookController::new(false);
        hooks.register(Arc::new(Redirector)).unwrap();
        let pipeline = pipeline_with(router, hooks, Duration::from_secs(5));
        let outcome = pipeline.handle(make_request("/old"), unforced()).await;
        assert_eq!(
            outcome.response.unwrap().status_or_default(),
            StatusCode::OK
        );
    }
}
