//! Worker process spawner.
//!
//! Re-executes the server binary in worker mode with `kill_on_drop(true)`,
//! waits for the `ready` heartbeat within the boot timeout, then hands the
//! process over to two background tasks: one forwarding heartbeats, one
//! waiting for the exit. Both report to the monitor through [`PoolEvent`]s.

use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::record::WorkerRecord;
use crate::config::ServerConfig;
use crate::worker::heartbeat::{Frame, Heartbeat, HeartbeatCodec};
use crate::{AppError, Result};

/// Events delivered to the monitor loop.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    /// A worker reported activity.
    Heartbeat {
        slot: usize,
        generation: u64,
        beat: Heartbeat,
        at: Instant,
    },
    /// A worker's heartbeat stream broke.
    ProtocolViolation {
        slot: usize,
        generation: u64,
        reason: String,
    },
    /// A worker process exited and was reaped.
    Exited {
        slot: usize,
        generation: u64,
        status: Option<ExitStatus>,
    },
    /// A replacement worker reported `ready`.
    Booted(WorkerRecord),
    /// A replacement worker failed to boot.
    BootFailed {
        slot: usize,
        generation: u64,
        error: AppError,
    },
}

/// Sender half used by per-worker tasks.
pub(crate) type EventSender = mpsc::UnboundedSender<PoolEvent>;

/// How to launch a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Executable started for every worker (normally the server binary).
    pub program: PathBuf,
    /// Arguments placed before the `worker` subcommand.
    pub leading_args: Vec<OsString>,
    /// Built-in app the worker serves.
    pub app: String,
    /// Request body limit passed to the worker.
    pub max_body_bytes: usize,
    /// Time the worker has to report `ready`.
    pub boot_timeout: Duration,
}

impl WorkerCommand {
    /// Launch workers from `program` with the settings of `config`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, config: &ServerConfig) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            app: config.app.clone(),
            max_body_bytes: config.max_body_bytes,
            boot_timeout: config.boot_timeout(),
        }
    }

    /// Launch workers by re-executing the running binary.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the current executable cannot be located.
    pub fn current_exe(config: &ServerConfig) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|err| AppError::Config(format!("cannot locate server binary: {err}")))?;
        Ok(Self::new(program, config))
    }

    /// Add arguments placed before the `worker` subcommand.
    #[must_use]
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn build(&self, slot: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg("worker")
            .arg("--app")
            .arg(&self.app)
            .arg("--slot")
            .arg(slot.to_string())
            .arg("--max-body-bytes")
            .arg(self.max_body_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// Spawn a worker for `slot` and wait for its `ready` heartbeat.
///
/// # Errors
///
/// - `AppError::WorkerBoot("failed to spawn …")`: OS spawn failure.
/// - `AppError::WorkerBoot("… before ready signal …")`: early exit or a
///   first heartbeat other than `ready`.
/// - `AppError::WorkerBoot("boot timeout …")`: silent past the boot timeout;
///   the process is killed.
pub(crate) async fn spawn_worker(
    command: &WorkerCommand,
    slot: usize,
    generation: u64,
    events: EventSender,
) -> Result<WorkerRecord> {
    let span = info_span!("spawn_worker", slot, generation);
    async move {
        let mut child = command
            .build(slot)
            .spawn()
            .map_err(|err| AppError::WorkerBoot(format!("failed to spawn worker: {err}")))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::WorkerBoot("failed to capture worker stdout".into()))?;
        let mut frames = FramedRead::new(stdout, HeartbeatCodec::new());

        let ready = tokio::time::timeout(command.boot_timeout, next_heartbeat(&mut frames)).await;
        let (port, pid) = match ready {
            Ok(Ok(Some(Heartbeat::Ready { port, pid }))) => (port, pid),
            Ok(Ok(Some(other))) => {
                child.kill().await.ok();
                return Err(AppError::WorkerBoot(format!(
                    "worker sent {other:?} before ready signal"
                )));
            }
            Ok(Ok(None)) => {
                let status = child.wait().await.ok();
                return Err(AppError::WorkerBoot(format!(
                    "worker exited before ready signal ({})",
                    super::record::status_text(status)
                )));
            }
            Ok(Err(err)) => {
                child.kill().await.ok();
                return Err(AppError::WorkerBoot(format!("unreadable ready signal: {err}")));
            }
            Err(_elapsed) => {
                child.kill().await.ok();
                return Err(AppError::WorkerBoot(format!(
                    "boot timeout: worker did not report ready within {:?}",
                    command.boot_timeout
                )));
            }
        };

        let pid = child.id().unwrap_or(pid);
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let kill_switch = CancellationToken::new();

        tokio::spawn(
            forward_heartbeats(frames, slot, generation, events.clone())
                .instrument(info_span!("heartbeats", slot, pid)),
        );
        tokio::spawn(
            await_exit(child, stdin, kill_switch.clone(), slot, generation, events)
                .instrument(info_span!("reaper", slot, pid)),
        );

        info!(pid, %addr, "worker ready");
        Ok(WorkerRecord::new(slot, generation, pid, addr, kill_switch))
    }
    .instrument(span)
    .await
}

/// First heartbeat of a fresh worker, or `None` at EOF.
///
/// Output other than a heartbeat before `ready` is an error.
async fn next_heartbeat<R>(frames: &mut FramedRead<R, HeartbeatCodec>) -> Result<Option<Heartbeat>>
where
    R: AsyncRead + Unpin,
{
    match frames.next().await.transpose()? {
        Some(Frame::Beat(beat)) => Ok(Some(beat)),
        Some(Frame::Stray(line)) => Err(AppError::Protocol(format!(
            "unexpected output {line:?}"
        ))),
        None => Ok(None),
    }
}

/// Forward decoded heartbeats until the worker's stdout closes.
///
/// Stray lines are skipped. A broken stream (over-long line or read error)
/// is reported so the monitor replaces the worker.
async fn forward_heartbeats<R>(
    mut frames: FramedRead<R, HeartbeatCodec>,
    slot: usize,
    generation: u64,
    events: EventSender,
) where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "worker heartbeat stream broken");
                let _ = events.send(PoolEvent::ProtocolViolation {
                    slot,
                    generation,
                    reason: err.to_string(),
                });
                return;
            }
        };
        match frame {
            Frame::Beat(beat) => {
                let event = PoolEvent::Heartbeat {
                    slot,
                    generation,
                    beat,
                    at: Instant::now(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Frame::Stray(line) => debug!(%line, "ignoring stray worker output"),
        }
    }
    debug!("worker stdout closed");
}

/// Own the child until it exits, hard-killing it when `kill_switch` fires.
///
/// Holding `stdin` keeps the worker's lifeline pipe open.
async fn await_exit(
    mut child: Child,
    stdin: Option<ChildStdin>,
    kill_switch: CancellationToken,
    slot: usize,
    generation: u64,
    events: EventSender,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill_switch.cancelled() => {
            if let Err(err) = child.start_kill() {
                warn!(%err, "failed to kill worker");
            }
            child.wait().await
        }
    };
    drop(stdin);

    let status = match status {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(%err, "error waiting for worker process");
            None
        }
    };
    let _ = events.send(PoolEvent::Exited {
        slot,
        generation,
        status,
    });
}
