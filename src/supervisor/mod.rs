//! Worker pool supervision.
//!
//! The [`Supervisor`] binds the public socket, keeps exactly `workers`
//! worker processes alive, hands each client connection to an idle worker,
//! kills workers whose request outlives the timeout and drains the pool on
//! shutdown.

mod dispatch;
mod monitor;
mod pool;
pub mod record;
pub mod spawner;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::{AppError, Result};

use self::monitor::Monitor;
use self::pool::{Pool, Slot};

pub use self::record::{ExitCause, KillReason, WorkerInfo, WorkerState};
pub use self::spawner::WorkerCommand;

/// Poll period while waiting for workers to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time allowed for killed workers to be reaped after the grace period.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Owner of the listening socket and the worker pool.
pub struct Supervisor {
    local_addr: SocketAddr,
    pool: Arc<Pool>,
    draining: Arc<AtomicBool>,
    accept_cancel: CancellationToken,
    monitor_cancel: CancellationToken,
    shutdown_started: AtomicBool,
    stopped: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Bind the public socket and boot the worker pool.
    ///
    /// The socket is bound before any worker is spawned, so a bind failure
    /// leaves no process behind.
    ///
    /// # Errors
    ///
    /// - `AppError::Bind` if the address is in use or not permitted.
    /// - `AppError::WorkerBoot` if any initial worker fails to report ready;
    ///   the workers that did boot are killed.
    pub async fn start(config: &ServerConfig, command: WorkerCommand) -> Result<Self> {
        let bind = config.bind_addr();
        let span = info_span!("supervisor_start", %bind, workers = config.workers);
        async move {
            let listener = TcpListener::bind(bind)
                .await
                .map_err(|err| AppError::Bind(format!("cannot bind {bind}: {err}")))?;
            let local_addr = listener
                .local_addr()
                .map_err(|err| AppError::Bind(format!("bound socket has no address: {err}")))?;
            info!(%local_addr, "listening");

            let count = config.worker_count();
            let pool = Arc::new(Pool::new(count));
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let generations = Arc::new(AtomicU64::new(0));
            let command = Arc::new(command);

            let boots = (0..count).map(|slot| {
                let generation = generations.fetch_add(1, Ordering::SeqCst) + 1;
                spawner::spawn_worker(&command, slot, generation, events_tx.clone())
            });
            let mut booted = Vec::with_capacity(count);
            let mut failure = None;
            for result in join_all(boots).await {
                match result {
                    Ok(record) => booted.push(record),
                    Err(err) => {
                        failure.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = failure {
                for record in &booted {
                    record.kill_switch.cancel();
                }
                return Err(err);
            }

            {
                let mut slots = pool.slots();
                for record in booted {
                    let index = record.slot;
                    slots[index] = Slot::Live(record);
                }
            }
            info!(workers = count, "worker pool ready");

            let draining = Arc::new(AtomicBool::new(false));
            let accept_cancel = CancellationToken::new();
            let monitor_cancel = CancellationToken::new();

            let monitor = Monitor {
                pool: Arc::clone(&pool),
                command,
                timeout: config.timeout(),
                interval: config.monitor_interval(),
                draining: Arc::clone(&draining),
                generations,
                events_tx,
            };
            let monitor_task = tokio::spawn(
                monitor
                    .run(events_rx, monitor_cancel.clone())
                    .instrument(info_span!("monitor")),
            );
            let accept_task = tokio::spawn(
                dispatch::accept_loop(listener, Arc::clone(&pool), accept_cancel.clone())
                    .instrument(info_span!("acceptor", %local_addr)),
            );

            Ok(Self {
                local_addr,
                pool,
                draining,
                accept_cancel,
                monitor_cancel,
                shutdown_started: AtomicBool::new(false),
                stopped: CancellationToken::new(),
                tasks: Mutex::new(vec![accept_task, monitor_task]),
            })
        }
        .instrument(span)
        .await
    }

    /// Address of the public socket.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the live workers, ordered by slot.
    #[must_use]
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.pool.workers()
    }

    /// Whether [`shutdown`](Self::shutdown) has completed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Stop accepting, drain in-flight requests for up to `grace`, then kill
    /// whatever is still running.
    ///
    /// Idempotent: later calls wait for the first one to finish and do
    /// nothing else.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            self.stopped.cancelled().await;
            return;
        }

        let span = info_span!("supervisor_shutdown", grace_ms = grace.as_millis());
        async {
            self.accept_cancel.cancel();
            self.draining.store(true, Ordering::SeqCst);
            info!("draining workers");
            self.pool.terminate_all();

            if !self.wait_for_exit(grace).await {
                warn!(
                    remaining = self.pool.occupied(),
                    "grace period elapsed; killing workers"
                );
                self.pool.kill_all();
                if !self.wait_for_exit(REAP_TIMEOUT).await {
                    warn!(remaining = self.pool.occupied(), "workers not reaped");
                }
            }

            self.monitor_cancel.cancel();
            let tasks = std::mem::take(
                &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
            );
            for task in tasks {
                if let Err(err) = task.await {
                    warn!(%err, "supervisor task failed");
                }
            }
            info!("supervisor stopped");
        }
        .instrument(span)
        .await;

        self.stopped.cancel();
    }

    /// Wait until every slot is empty, for at most `limit`.
    async fn wait_for_exit(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            while self.pool.occupied() > 0 {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok()
    }
}

impl Drop for Supervisor {
    /// Stop background tasks and kill workers if `shutdown` never ran.
    fn drop(&mut self) {
        self.accept_cancel.cancel();
        self.monitor_cancel.cancel();
        if !self.stopped.is_cancelled() {
            self.pool.kill_all();
        }
    }
}
