//! Handler capability served by worker processes.
//!
//! A [`Handler`] turns one [`Request`] into one [`Response`]. It is a plain
//! synchronous call: the worker runs it on a blocking thread and never
//! interrupts it. Handlers are injected into the worker runtime at startup,
//! never looked up through global state.

pub mod builtin;

use std::fmt::{Display, Formatter};

use serde::Serialize;

/// Request descriptor handed to a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// HTTP method, upper case.
    pub method: String,
    /// Request path without the query string.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// Header name/value pairs in arrival order. Names are lower case.
    pub headers: Vec<(String, String)>,
    /// Full request body.
    pub body: Vec<u8>,
}

impl Request {
    /// First value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// First value of a query parameter. Values are not URL-decoded.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref().and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value)
        })
    }
}

/// Response descriptor returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl Response {
    /// Response with the given status and an empty body.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Response with a JSON body.
    ///
    /// Serialization of the types used in this crate cannot fail; should it
    /// ever fail the body is left empty.
    #[must_use]
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// The generic server-error response sent whenever a handler fails.
    ///
    /// Carries no detail about the failure.
    #[must_use]
    pub fn internal_error() -> Self {
        Self::json(
            500,
            &serde_json::json!({"status": "error", "message": "Internal Server Error"}),
        )
    }
}

/// Failure reported by a handler.
///
/// The message is logged by the worker and never sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(String);

impl HandlerError {
    /// Wrap a failure description.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The failure description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler: {}", self.0)
    }
}

impl std::error::Error for HandlerError {}

/// Synchronous request handler capability.
pub trait Handler: Send + Sync + 'static {
    /// Produce the response for `request`.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError` when the request cannot be served; the worker
    /// answers with [`Response::internal_error`].
    fn call(&self, request: Request) -> Result<Response, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    fn call(&self, request: Request) -> Result<Response, HandlerError> {
        self(request)
    }
}
