//! Supervisor monitor loop.
//!
//! Runs every monitor interval and on every worker event. Each cycle kills
//! workers whose in-flight request outlived the timeout and refills empty
//! slots. Exits are reaped as they arrive and the slot is refilled at once
//! unless the pool is draining.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::{Pool, Slot};
use super::record::{ExitCause, KillReason};
use super::spawner::{spawn_worker, EventSender, PoolEvent, WorkerCommand};
use crate::worker::heartbeat::Heartbeat;

/// Everything the monitor needs to keep the pool full.
pub(crate) struct Monitor {
    pub(crate) pool: Arc<Pool>,
    pub(crate) command: Arc<WorkerCommand>,
    pub(crate) timeout: Duration,
    pub(crate) interval: Duration,
    pub(crate) draining: Arc<AtomicBool>,
    pub(crate) generations: Arc<AtomicU64>,
    pub(crate) events_tx: EventSender,
}

impl Monitor {
    /// Run until `cancel` fires.
    pub(crate) async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<PoolEvent>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("worker monitor shutting down");
                    break;
                }
                Some(event) = events.recv() => self.handle(event),
                _ = ticker.tick() => self.cycle(Instant::now()),
            }
        }
    }

    fn draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Periodic health check: kill hung workers, refill empty slots.
    fn cycle(&self, now: Instant) {
        let draining = self.draining();
        let mut refill = Vec::new();
        {
            let mut slots = self.pool.slots();
            for (index, slot) in slots.iter_mut().enumerate() {
                match slot {
                    Slot::Live(record) if !draining && record.is_hung(now, self.timeout) => {
                        warn!(
                            slot = index,
                            pid = record.pid,
                            timeout_secs = self.timeout.as_secs(),
                            "request timeout; killing worker"
                        );
                        record.kill(KillReason::Timeout);
                    }
                    Slot::Empty if !draining => {
                        *slot = Slot::Booting;
                        refill.push(index);
                    }
                    _ => {}
                }
            }
        }
        for index in refill {
            self.respawn(index);
        }
    }

    fn handle(&self, event: PoolEvent) {
        match event {
            PoolEvent::Heartbeat {
                slot,
                generation,
                beat,
                at,
            } => {
                {
                    let mut slots = self.pool.slots();
                    match slots.get_mut(slot) {
                        Some(Slot::Live(record)) if record.generation == generation => {
                            record.on_heartbeat(beat, at);
                        }
                        _ => return,
                    }
                }
                if beat == Heartbeat::Idle {
                    self.pool.notify_available();
                }
            }
            PoolEvent::ProtocolViolation {
                slot,
                generation,
                reason,
            } => {
                let mut slots = self.pool.slots();
                if let Some(Slot::Live(record)) = slots.get_mut(slot) {
                    if record.generation == generation {
                        warn!(slot, pid = record.pid, %reason, "killing worker with broken heartbeats");
                        record.kill(KillReason::Protocol);
                    }
                }
            }
            PoolEvent::Exited {
                slot,
                generation,
                status,
            } => self.reap(slot, generation, status),
            PoolEvent::Booted(mut record) => {
                let slot = record.slot;
                {
                    let mut slots = self.pool.slots();
                    match slots.get_mut(slot) {
                        Some(entry) if matches!(entry, Slot::Booting) => {
                            if self.draining() {
                                record.terminate();
                            }
                            info!(slot, pid = record.pid, generation = record.generation, "replacement worker ready");
                            *entry = Slot::Live(record);
                        }
                        _ => {
                            warn!(slot, pid = record.pid, "no booting slot for worker; discarding");
                            record.kill_switch.cancel();
                        }
                    }
                }
                self.pool.notify_available();
            }
            PoolEvent::BootFailed {
                slot,
                generation,
                error,
            } => {
                let mut slots = self.pool.slots();
                if let Some(entry) = slots.get_mut(slot) {
                    if matches!(entry, Slot::Booting) {
                        *entry = Slot::Empty;
                    }
                }
                warn!(slot, generation, %error, "replacement worker failed to boot; retrying next cycle");
            }
        }
    }

    /// Remove an exited worker and refill its slot when appropriate.
    fn reap(&self, slot: usize, generation: u64, status: Option<std::process::ExitStatus>) {
        let (pid, cause) = {
            let mut slots = self.pool.slots();
            let Some(entry) = slots.get_mut(slot) else {
                return;
            };
            let Slot::Live(record) = entry else {
                debug!(slot, generation, "exit for a slot without a live worker");
                return;
            };
            if record.generation != generation {
                debug!(slot, generation, "exit of a superseded worker");
                return;
            }
            let reaped = (record.pid, record.exit_cause(status));
            *entry = Slot::Empty;
            reaped
        };

        match &cause {
            ExitCause::TimedOut => warn!(slot, pid, "worker killed after request timeout"),
            ExitCause::ProtocolViolation => warn!(slot, pid, "worker killed after protocol violation"),
            ExitCause::Crashed(status) => warn!(slot, pid, status = %status, "worker crashed"),
            ExitCause::Stopped => info!(slot, pid, "worker stopped"),
        }

        if cause.needs_replacement() && !self.draining() {
            {
                let mut slots = self.pool.slots();
                match slots.get_mut(slot) {
                    Some(entry) if matches!(entry, Slot::Empty) => *entry = Slot::Booting,
                    _ => return,
                }
            }
            self.respawn(slot);
        }
    }

    /// Boot a worker for a slot already marked [`Slot::Booting`].
    fn respawn(&self, slot: usize) {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let command = Arc::clone(&self.command);
        let events = self.events_tx.clone();
        debug!(slot, generation, "spawning worker");
        tokio::spawn(async move {
            let event = match spawn_worker(&command, slot, generation, events.clone()).await {
                Ok(record) => PoolEvent::Booted(record),
                Err(error) => PoolEvent::BootFailed {
                    slot,
                    generation,
                    error,
                },
            };
            let _ = events.send(event);
        });
    }
}
