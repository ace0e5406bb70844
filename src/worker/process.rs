//! Entry point of a worker process.
//!
//! Binds a private loopback listener, announces it with a `ready` heartbeat
//! on stdout, then serves the selected app until SIGTERM/SIGINT arrives or
//! stdin reaches EOF (the supervisor is gone).

use std::net::{Ipv4Addr, SocketAddr};

use clap::Args;
use futures_util::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::heartbeat::{Heartbeat, HeartbeatCodec};
use super::runtime;
use crate::app::builtin;
use crate::signals::shutdown_signal;
use crate::{AppError, Result};

/// Arguments of the hidden `worker` subcommand.
#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// Built-in app to serve.
    #[arg(long)]
    pub app: String,

    /// Pool slot this worker occupies (for logging).
    #[arg(long, default_value_t = 0)]
    pub slot: usize,

    /// Largest accepted request body.
    #[arg(long)]
    pub max_body_bytes: usize,
}

/// Run a worker until it is told to stop.
///
/// # Errors
///
/// Returns `AppError::Config` for an unknown app and `AppError::Io` if the
/// loopback listener cannot be bound or the server fails.
pub async fn run(args: WorkerArgs) -> Result<()> {
    let span = info_span!("worker", slot = args.slot, pid = std::process::id());
    async move {
        let handler = builtin::resolve(&args.app)
            .ok_or_else(|| AppError::Config(format!("unknown app {:?}", args.app)))?;

        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .map_err(|err| AppError::Io(format!("worker cannot bind loopback: {err}")))?;
        let port = listener.local_addr()?.port();

        let (beat_tx, beat_rx) = mpsc::unbounded_channel();
        beat_tx
            .send(Heartbeat::Ready {
                port,
                pid: std::process::id(),
            })
            .map_err(|_| AppError::Io("heartbeat channel closed".into()))?;
        let writer = tokio::spawn(write_heartbeats(beat_rx));

        let shutdown = CancellationToken::new();
        tokio::spawn(watch_lifeline(shutdown.clone()));

        info!(app = %args.app, port, "worker booted");
        let served = runtime::serve(
            listener,
            handler,
            beat_tx,
            args.max_body_bytes,
            shutdown,
        )
        .await;

        // The runtime owned the last sender; the writer drains and exits.
        if let Err(err) = writer.await {
            warn!(%err, "heartbeat writer task failed");
        }
        served
    }
    .instrument(span)
    .await
}

/// Forward heartbeats to stdout until every sender is dropped.
async fn write_heartbeats(mut beats: mpsc::UnboundedReceiver<Heartbeat>) {
    let mut sink = FramedWrite::new(tokio::io::stdout(), HeartbeatCodec::new());
    while let Some(beat) = beats.recv().await {
        if let Err(err) = sink.send(beat).await {
            warn!(%err, "cannot write heartbeat; supervisor gone?");
            break;
        }
    }
}

/// Cancel `shutdown` on a termination signal or when stdin closes.
async fn watch_lifeline(shutdown: CancellationToken) {
    tokio::select! {
        signal = shutdown_signal() => info!(signal = signal.name(), "termination signal received, draining"),
        () = stdin_closed() => warn!("supervisor pipe closed, draining"),
    }
    shutdown.cancel();
}

/// Resolve once stdin reaches EOF or fails.
async fn stdin_closed() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0_u8; 256];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
