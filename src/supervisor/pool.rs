//! Fixed-size slot table shared by the monitor and the dispatcher.
//!
//! The monitor owns every lifecycle transition of the records. The
//! dispatcher only takes and releases leases through [`Lease`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::record::{KillReason, WorkerInfo, WorkerRecord, WorkerState};

/// One position of the pool.
#[derive(Debug)]
pub(crate) enum Slot {
    /// No worker; the monitor will spawn one.
    Empty,
    /// A worker is being spawned for this slot.
    Booting,
    /// A worker is alive.
    Live(WorkerRecord),
}

/// Slot table plus a wake-up signal for connections waiting on a worker.
#[derive(Debug)]
pub(crate) struct Pool {
    slots: Mutex<Vec<Slot>>,
    available: Notify,
}

impl Pool {
    /// Pool of `size` empty slots.
    pub(crate) fn new(size: usize) -> Self {
        Self {
            slots: Mutex::new((0..size).map(|_| Slot::Empty).collect()),
            available: Notify::new(),
        }
    }

    /// Lock the slot table.
    pub(crate) fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake connections waiting for an idle worker.
    pub(crate) fn notify_available(&self) {
        self.available.notify_waiters();
    }

    /// Snapshot of every live worker, ordered by slot.
    pub(crate) fn workers(&self) -> Vec<WorkerInfo> {
        self.slots()
            .iter()
            .filter_map(|slot| match slot {
                Slot::Live(record) => Some(record.info()),
                Slot::Empty | Slot::Booting => None,
            })
            .collect()
    }

    /// Number of slots that hold or are about to hold a process.
    pub(crate) fn occupied(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| !matches!(slot, Slot::Empty))
            .count()
    }

    /// Ask every live worker to drain and exit.
    pub(crate) fn terminate_all(&self) {
        for slot in self.slots().iter_mut() {
            if let Slot::Live(record) = slot {
                record.terminate();
            }
        }
    }

    /// Hard-kill every live worker not already killed.
    pub(crate) fn kill_all(&self) {
        for slot in self.slots().iter_mut() {
            if let Slot::Live(record) = slot {
                if record.state != WorkerState::Killed {
                    record.kill(KillReason::GraceExpired);
                }
            }
        }
    }

    /// Lease the first available worker, if any.
    fn try_lease(self: &Arc<Self>) -> Option<Lease> {
        let now = Instant::now();
        let mut slots = self.slots();
        let lease = slots.iter_mut().find_map(|slot| match slot {
            Slot::Live(record) if record.is_available() => {
                record.lease(now);
                Some(Lease {
                    pool: Arc::clone(self),
                    slot: record.slot,
                    generation: record.generation,
                    addr: record.addr,
                })
            }
            _ => None,
        });
        lease
    }

    /// Wait for an available worker and lease it.
    ///
    /// Returns `None` once `cancel` fires.
    pub(crate) async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Option<Lease> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_lease() {
                return Some(lease);
            }

            tokio::select! {
                () = cancel.cancelled() => return None,
                () = notified => {}
            }
        }
    }

    fn release(&self, slot: usize, generation: u64) {
        {
            let mut slots = self.slots();
            if let Some(Slot::Live(record)) = slots.get_mut(slot) {
                if record.generation == generation {
                    record.leased = false;
                }
            }
        }
        self.notify_available();
    }
}

/// Exclusive assignment of one worker to one client connection.
///
/// Dropping the lease makes the worker available again.
#[derive(Debug)]
pub(crate) struct Lease {
    pool: Arc<Pool>,
    /// Leased slot.
    pub(crate) slot: usize,
    /// Generation of the leased worker.
    pub(crate) generation: u64,
    /// Loopback address of the leased worker.
    pub(crate) addr: SocketAddr,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(self.slot, self.generation);
    }
}
