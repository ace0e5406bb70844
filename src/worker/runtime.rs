//! HTTP runtime of a single worker.
//!
//! Serves the injected [`Handler`] on a listener, one request per
//! connection. Every request is bracketed by `busy`/`idle` heartbeats and the
//! handler runs on a blocking thread, so a handler that never returns leaves
//! the worker hung until the supervisor kills it.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CONNECTION, CONTENT_LENGTH};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::heartbeat::Heartbeat;
use crate::app::{Handler, Request, Response};
use crate::{AppError, Result};

/// Sender half used by the runtime to publish heartbeats.
pub type HeartbeatSender = mpsc::UnboundedSender<Heartbeat>;

/// Shared state of the worker's router.
#[derive(Clone)]
struct WorkerContext {
    handler: Arc<dyn Handler>,
    max_body_bytes: usize,
}

/// Serve `handler` on `listener` until `shutdown` fires.
///
/// On shutdown the listener stops accepting and the in-flight request, if
/// any, is allowed to finish before this future resolves.
///
/// # Errors
///
/// Returns `AppError::Io` if the HTTP server fails.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    beats: HeartbeatSender,
    max_body_bytes: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let context = WorkerContext {
        handler,
        max_body_bytes,
    };

    let router = Router::new()
        .fallback(dispatch)
        .with_state(context)
        .layer(middleware::from_fn(
            move |request: axum::extract::Request, next: Next| {
                let beats = beats.clone();
                async move {
                    // A closed channel means the heartbeat writer is gone;
                    // the supervisor notices through stdout EOF.
                    let _ = beats.send(Heartbeat::Busy);
                    let response = next.run(request).await;
                    let _ = beats.send(Heartbeat::Idle);
                    response
                }
            },
        ));

    let addr = listener
        .local_addr()
        .map_err(|err| AppError::Io(format!("worker listener has no address: {err}")))?;
    info!(%addr, "worker accepting requests");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("worker server error: {err}")))?;

    info!("worker drained");
    Ok(())
}

/// Run the handler for one request and translate the outcome.
async fn dispatch(
    State(context): State<WorkerContext>,
    request: axum::extract::Request,
) -> axum::response::Response {
    let (parts, body) = request.into_parts();

    let declared_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared_length.is_some_and(|len| len > context.max_body_bytes) {
        return into_http(Response::new(413));
    }

    let body = match axum::body::to_bytes(body, context.max_body_bytes).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            debug!(%err, "request body rejected");
            return into_http(Response::new(400));
        }
    };

    let method = parts.method.as_str().to_owned();
    let path = parts.uri.path().to_owned();
    let request = Request {
        method: method.clone(),
        path: path.clone(),
        query: parts.uri.query().map(str::to_owned),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body,
    };

    let handler = Arc::clone(&context.handler);
    let response = match tokio::task::spawn_blocking(move || handler.call(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            error!(%err, %method, %path, "handler failed");
            Response::internal_error()
        }
        Err(err) => {
            error!(%err, %method, %path, "handler panicked");
            Response::internal_error()
        }
    };

    into_http(response)
}

/// Convert a handler response into an HTTP response that closes the
/// connection once written.
fn into_http(response: Response) -> axum::response::Response {
    let status = StatusCode::from_u16(response.status).unwrap_or_else(|_| {
        warn!(status = response.status, "handler returned invalid status");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let mut http = axum::response::Response::new(Body::from(response.body));
    *http.status_mut() = status;

    let headers = http.headers_mut();
    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "dropping invalid response header"),
        }
    }
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    http
}
