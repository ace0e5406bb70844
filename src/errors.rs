//! Error types shared across the server.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering startup and supervision failures.
///
/// Only errors raised during startup reach the process exit code. Worker
/// crashes and request timeouts are recovered inside the supervisor and are
/// reported through [`crate::supervisor::ExitCause`] instead.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The listening socket could not be bound. Fatal, never retried.
    Bind(String),
    /// A worker process exited or stayed silent before reporting `ready`.
    WorkerBoot(String),
    /// A worker sent a heartbeat line that could not be decoded.
    Protocol(String),
    /// File-system, socket or process I/O failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Bind(msg) => write!(f, "bind: {msg}"),
            Self::WorkerBoot(msg) => write!(f, "worker boot: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
