#![forbid(unsafe_code)]

//! Prefork HTTP server: a supervisor process keeps a fixed pool of worker
//! processes alive, relays each client connection to an idle worker and
//! replaces workers that crash or exceed the request timeout.

pub mod app;
pub mod config;
pub mod errors;
pub mod signals;
pub mod supervisor;
pub mod worker;

pub use config::ServerConfig;
pub use errors::{AppError, Result};
pub use supervisor::Supervisor;
