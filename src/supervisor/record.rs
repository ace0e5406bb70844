//! Worker records kept by the supervisor.

use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::worker::heartbeat::Heartbeat;

/// Lifecycle state of a worker as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for a request.
    Idle,
    /// A request is in flight.
    Handling,
    /// Asked to finish its in-flight request and exit.
    Draining,
    /// Hard kill sent; waiting to be reaped.
    Killed,
}

/// Why the supervisor hard-killed a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The in-flight request outlived the request timeout.
    Timeout,
    /// The worker's heartbeat stream became unreadable.
    Protocol,
    /// The shutdown grace period elapsed.
    GraceExpired,
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    /// Killed because a request exceeded the timeout.
    TimedOut,
    /// Killed because its heartbeats could not be decoded.
    ProtocolViolation,
    /// Exited on its own while it was expected to keep serving.
    Crashed(String),
    /// Exited during shutdown, gracefully or after the grace period.
    Stopped,
}

impl ExitCause {
    /// Whether the slot should be refilled after this exit.
    #[must_use]
    pub fn needs_replacement(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// Supervisor-owned bookkeeping for one live worker process.
#[derive(Debug)]
pub struct WorkerRecord {
    /// Pool slot the worker occupies.
    pub slot: usize,
    /// Monotonic spawn counter; distinguishes successive workers of a slot.
    pub generation: u64,
    /// OS process id.
    pub pid: u32,
    /// Loopback address the worker accepts on.
    pub addr: SocketAddr,
    /// Current state.
    pub state: WorkerState,
    /// Wall-clock spawn time.
    pub started_at: DateTime<Utc>,
    /// Time of the last heartbeat, lease or spawn.
    pub last_activity: Instant,
    /// Completed requests.
    pub requests_served: u64,
    /// Set while a client connection is relayed to this worker.
    pub leased: bool,
    /// Reason of the hard kill, once one was sent.
    pub kill_reason: Option<KillReason>,
    /// Fired to hard-kill the process.
    pub kill_switch: CancellationToken,
}

impl WorkerRecord {
    /// Record for a worker that just reported `ready`.
    #[must_use]
    pub fn new(
        slot: usize,
        generation: u64,
        pid: u32,
        addr: SocketAddr,
        kill_switch: CancellationToken,
    ) -> Self {
        Self {
            slot,
            generation,
            pid,
            addr,
            state: WorkerState::Idle,
            started_at: Utc::now(),
            last_activity: Instant::now(),
            requests_served: 0,
            leased: false,
            kill_reason: None,
            kill_switch,
        }
    }

    /// Apply a heartbeat received at `at`.
    ///
    /// Heartbeats never revive a draining or killed worker.
    pub fn on_heartbeat(&mut self, beat: Heartbeat, at: Instant) {
        self.last_activity = at;
        match (self.state, beat) {
            (WorkerState::Idle, Heartbeat::Busy) => self.state = WorkerState::Handling,
            (WorkerState::Handling, Heartbeat::Idle) => {
                self.state = WorkerState::Idle;
                self.requests_served += 1;
            }
            (WorkerState::Draining, Heartbeat::Idle) => self.requests_served += 1,
            _ => {}
        }
    }

    /// Whether the in-flight request has run longer than `timeout`.
    ///
    /// A leased worker that has not reported `busy` yet is in flight too: its
    /// client may still be sending headers, or nothing at all.
    #[must_use]
    pub fn is_hung(&self, now: Instant, timeout: Duration) -> bool {
        let in_flight = match self.state {
            WorkerState::Handling => true,
            WorkerState::Idle => self.leased,
            WorkerState::Draining | WorkerState::Killed => false,
        };
        in_flight && now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Hand the worker to a client connection at `at`.
    pub fn lease(&mut self, at: Instant) {
        self.leased = true;
        self.last_activity = at;
    }

    /// Whether a new connection may be handed to this worker.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state == WorkerState::Idle && !self.leased
    }

    /// Send the hard kill and remember why.
    pub fn kill(&mut self, reason: KillReason) {
        self.state = WorkerState::Killed;
        self.kill_reason = Some(reason);
        self.kill_switch.cancel();
    }

    /// Ask the worker to finish its in-flight request and exit.
    ///
    /// Sends SIGTERM on Unix. Elsewhere there is no graceful signal and the
    /// worker is killed outright.
    pub fn terminate(&mut self) {
        if self.state == WorkerState::Killed {
            return;
        }
        self.state = WorkerState::Draining;

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match i32::try_from(self.pid) {
                Ok(raw) => {
                    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                        tracing::warn!(pid = self.pid, %err, "failed to send SIGTERM to worker");
                    }
                }
                Err(_) => self.kill_switch.cancel(),
            }
        }

        #[cfg(not(unix))]
        self.kill_switch.cancel();
    }

    /// Classify the exit of this worker.
    #[must_use]
    pub fn exit_cause(&self, status: Option<ExitStatus>) -> ExitCause {
        match (self.state, self.kill_reason) {
            (WorkerState::Killed, Some(KillReason::Timeout)) => ExitCause::TimedOut,
            (WorkerState::Killed, Some(KillReason::Protocol)) => ExitCause::ProtocolViolation,
            (WorkerState::Draining, _)
            | (WorkerState::Killed, Some(KillReason::GraceExpired) | None) => ExitCause::Stopped,
            (WorkerState::Idle | WorkerState::Handling, _) => {
                ExitCause::Crashed(status_text(status))
            }
        }
    }

    /// Point-in-time copy for reporting.
    #[must_use]
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            slot: self.slot,
            generation: self.generation,
            pid: self.pid,
            state: self.state,
            started_at: self.started_at,
            requests_served: self.requests_served,
        }
    }
}

/// Reportable snapshot of a [`WorkerRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    /// Pool slot.
    pub slot: usize,
    /// Spawn counter.
    pub generation: u64,
    /// OS process id.
    pub pid: u32,
    /// Current state.
    pub state: WorkerState,
    /// Wall-clock spawn time.
    pub started_at: DateTime<Utc>,
    /// Completed requests.
    pub requests_served: u64,
}

/// Human-readable exit status.
#[must_use]
pub fn status_text(status: Option<ExitStatus>) -> String {
    status.map_or_else(
        || "status unknown".to_owned(),
        |s| {
            if s.success() {
                "exited normally (code 0)".to_owned()
            } else {
                s.code().map_or_else(
                    || "terminated by signal".to_owned(),
                    |c| format!("exited with code {c}"),
                )
            }
        },
    )
}
