//! Built-in apps selectable with `--app`.
//!
//! The server does not ship application logic; these apps exist to smoke-test
//! a deployment and to exercise the worker lifecycle (slow and failing
//! handlers).

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use super::{Handler, HandlerError, Request, Response};

/// App served when none is configured.
pub const DEFAULT_APP: &str = "hello";

/// Names accepted by [`resolve`].
pub const NAMES: &[&str] = &["hello", "echo", "sleep", "fail"];

/// Default delay of the `sleep` app when `ms` is absent.
pub const DEFAULT_SLEEP_MS: u64 = 1000;

/// Look up a built-in app by name.
#[must_use]
pub fn resolve(name: &str) -> Option<Arc<dyn Handler>> {
    match name {
        "hello" => Some(Arc::new(hello)),
        "echo" => Some(Arc::new(echo)),
        "sleep" => Some(Arc::new(sleep)),
        "fail" => Some(Arc::new(fail)),
        _ => None,
    }
}

#[allow(clippy::unnecessary_wraps)]
fn hello(_request: Request) -> Result<Response, HandlerError> {
    Ok(Response::json(
        200,
        &json!({"status": "success", "message": "ok"}),
    ))
}

#[allow(clippy::unnecessary_wraps, clippy::needless_pass_by_value)]
fn echo(request: Request) -> Result<Response, HandlerError> {
    let headers: serde_json::Map<String, serde_json::Value> = request
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), json!(value)))
        .collect();
    Ok(Response::json(
        200,
        &json!({
            "method": request.method,
            "path": request.path,
            "query": request.query,
            "headers": headers,
            "body": String::from_utf8_lossy(&request.body),
        }),
    ))
}

#[allow(clippy::needless_pass_by_value)]
fn sleep(request: Request) -> Result<Response, HandlerError> {
    let millis = match request.query_param("ms") {
        None => DEFAULT_SLEEP_MS,
        Some(raw) => match raw.parse::<u64>() {
            Ok(ms) => ms,
            Err(_) => {
                return Ok(Response::json(
                    400,
                    &json!({"status": "error", "message": "ms must be an integer"}),
                ))
            }
        },
    };
    thread::sleep(Duration::from_millis(millis));
    Ok(Response::json(
        200,
        &json!({"status": "success", "slept_ms": millis}),
    ))
}

#[allow(clippy::needless_pass_by_value)]
fn fail(request: Request) -> Result<Response, HandlerError> {
    Err(HandlerError::new(format!(
        "fail app refused {} {}",
        request.method, request.path
    )))
}
