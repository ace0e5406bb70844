//! Worker process: serves one request at a time and reports heartbeats.
//!
//! The supervisor starts workers by re-executing the server binary with the
//! hidden `worker` subcommand ([`process::run`]). The HTTP side lives in
//! [`runtime`] and can be driven in-process with any [`crate::app::Handler`].

pub mod heartbeat;
pub mod process;
pub mod runtime;
