//! In-process backend: a counter and four FIFO wait lists behind one mutex.

use super::{Backend, BackendState, SlotLease};
use crate::resilience::admission::AdmissionError;
use crate::resilience::priority::{PriorityDepths, PriorityLevel};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Waiter {
    id: u64,
    priority: PriorityLevel,
    tx: oneshot::Sender<SlotLease>,
}

struct State {
    capacity: usize,
    active: usize,
    next_id: u64,
    closed: bool,
    outstanding: HashSet<String>,
    /// Indexed by `PriorityLevel::index()`.
    waiters: [VecDeque<Waiter>; PriorityLevel::COUNT],
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn grant(&mut self, priority: PriorityLevel) -> SlotLease {
        let id = format!("local-{}", self.next_id());
        self.active += 1;
        self.outstanding.insert(id.clone());
        SlotLease::new(id, priority)
    }

    fn release(&mut self, lease_id: &str) -> bool {
        if !self.outstanding.remove(lease_id) {
            return false;
        }
        self.active = self.active.saturating_sub(1);
        self.wake_waiters();
        true
    }

    /// Hand free capacity to waiters, highest priority first.
    fn wake_waiters(&mut self) {
        while self.active < self.capacity {
            let Some(waiter) = self.pop_highest() else {
                break;
            };
            let lease = self.grant(waiter.priority);
            if let Err(lease) = waiter.tx.send(lease) {
                // receiver gone without cleaning up; undo and try the next one
                self.outstanding.remove(lease.id());
                self.active = self.active.saturating_sub(1);
            }
        }
    }

    fn pop_highest(&mut self) -> Option<Waiter> {
        self.waiters
            .iter_mut()
            .rev()
            .find_map(|queue| queue.pop_front())
    }

    fn remove_waiter(&mut self, priority: PriorityLevel, id: u64) -> bool {
        let queue = &mut self.waiters[priority.index()];
        match queue.iter().position(|w| w.id == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    fn depths(&self) -> PriorityDepths {
        let mut counts = [0usize; PriorityLevel::COUNT];
        for (i, queue) in self.waiters.iter().enumerate() {
            counts[i] = queue.len();
        }
        PriorityDepths::from_array(counts)
    }
}

/// Single-instance backend.
///
/// Capacity is handed from releaser to waiter directly, so whenever anyone is
/// queued `active == capacity`.
pub struct LocalBackend {
    state: Mutex<State>,
    capacity: usize,
}

impl LocalBackend {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                capacity,
                active: 0,
                next_id: 0,
                closed: false,
                outstanding: HashSet::new(),
                waiters: Default::default(),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding this lock cannot leave the counters half-updated,
        // so a poisoned guard is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release_id(&self, lease: SlotLease) -> Result<(), AdmissionError> {
        let released = self.lock().release(lease.id());
        if !released {
            debug_assert!(released, "slot {} released twice", lease.id());
            warn!(slot = lease.id(), "release of unknown slot ignored");
            return Err(AdmissionError::UnknownSlot(lease.id().to_string()));
        }
        Ok(())
    }
}

/// A queued acquire. Dropping it before it resolves leaves the queue
/// consistent and returns any slot that was already handed over.
struct PendingWait<'a> {
    backend: &'a LocalBackend,
    id: u64,
    priority: PriorityLevel,
    rx: oneshot::Receiver<SlotLease>,
    done: bool,
}

impl PendingWait<'_> {
    fn abandon(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let mut st = self.backend.lock();
        if st.remove_waiter(self.priority, self.id) {
            return;
        }
        // Already granted under the lock but not yet received.
        if let Ok(lease) = self.rx.try_recv() {
            debug!(slot = lease.id(), "returning slot granted to an abandoned waiter");
            st.release(lease.id());
        }
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        self.abandon();
    }
}

enum Wake {
    Granted(Result<SlotLease, oneshot::error::RecvError>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl Backend for LocalBackend {
    async fn acquire(
        &self,
        priority: PriorityLevel,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<SlotLease, AdmissionError> {
        let started = Instant::now();
        let mut wait = {
            let mut st = self.lock();
            if st.closed {
                return Err(AdmissionError::Closed);
            }
            if st.active < st.capacity {
                return Ok(st.grant(priority));
            }
            let id = st.next_id();
            let (tx, rx) = oneshot::channel();
            st.waiters[priority.index()].push_back(Waiter { id, priority, tx });
            PendingWait {
                backend: self,
                id,
                priority,
                rx,
                done: false,
            }
        };

        let wake = tokio::select! {
            biased;
            res = &mut wait.rx => Wake::Granted(res),
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = tokio::time::sleep_until(deadline) => Wake::TimedOut,
        };

        match wake {
            Wake::Granted(Ok(lease)) => {
                wait.done = true;
                Ok(lease)
            }
            Wake::Granted(Err(_)) => {
                // sender dropped: the backend was closed
                wait.done = true;
                Err(AdmissionError::Closed)
            }
            Wake::TimedOut => {
                wait.abandon();
                Err(AdmissionError::TimedOut {
                    priority,
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
            Wake::Cancelled => {
                wait.abandon();
                Err(AdmissionError::Cancelled)
            }
        }
    }

    async fn release(&self, lease: SlotLease) -> Result<(), AdmissionError> {
        self.release_id(lease)
    }

    fn try_release_now(&self, lease: SlotLease) -> Result<Result<(), AdmissionError>, SlotLease> {
        Ok(self.release_id(lease))
    }

    async fn state(&self) -> Result<BackendState, AdmissionError> {
        let st = self.lock();
        Ok(BackendState {
            capacity: st.capacity,
            active: st.active,
            waiting: st.depths(),
        })
    }

    async fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        // Dropping the senders wakes every waiter with `Closed`.
        for queue in st.waiters.iter_mut() {
            queue.clear();
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
