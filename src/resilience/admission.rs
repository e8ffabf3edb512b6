//! Admission controller, slot tokens and the scoped slot guard.

use super::backend::{Backend, BackendState, LocalBackend, SlotLease};
use super::priority::{PriorityDepths, PriorityLevel};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Roughly 30 years; stands in for "no deadline".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + wait`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("timed out after {waited_ms}ms waiting for a {priority} slot")]
    TimedOut {
        priority: PriorityLevel,
        waited_ms: u64,
    },

    #[error("slot wait cancelled")]
    Cancelled,

    #[error("admission controller closed")]
    Closed,

    #[error("unknown slot '{0}'")]
    UnknownSlot(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Permission to have one outstanding upstream call.
///
/// Produced by [`AdmissionController::acquire`] and consumed exactly once by
/// [`AdmissionController::release`]. Not `Clone`, so it cannot be released twice.
#[derive(Debug)]
pub struct SlotToken {
    lease: SlotLease,
    acquired_at: Instant,
    waited: Duration,
}

impl SlotToken {
    pub fn id(&self) -> &str {
        self.lease.id()
    }

    pub fn priority(&self) -> PriorityLevel {
        self.lease.priority()
    }

    /// Time spent queued before the slot was granted.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Read-only view of the controller and its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub backend: String,
    pub capacity: usize,
    pub active: usize,
    pub available: usize,
    pub waiting: PriorityDepths,
    pub granted_total: u64,
    pub timed_out_total: u64,
    pub cancelled_total: u64,
    pub closed: bool,
    /// Set when the backend could not be read; counters then come from this process only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    granted: AtomicU64,
    released: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

/// Priority admission controller.
///
/// The single throttle on upstream concurrency: never more than `capacity`
/// tokens are outstanding, waiters are served by priority (strict preemption)
/// and FIFO within a priority.
pub struct AdmissionController {
    backend: Arc<dyn Backend>,
    closed: AtomicBool,
    counters: Counters,
}

impl AdmissionController {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Controller over an in-process backend.
    pub fn local(capacity: usize) -> Self {
        Self::new(Arc::new(LocalBackend::new(capacity)))
    }

    pub fn capacity(&self) -> usize {
        self.backend.capacity()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for a slot.
    pub async fn acquire(
        &self,
        priority: PriorityLevel,
        timeout: Duration,
    ) -> Result<SlotToken, AdmissionError> {
        let never = CancellationToken::new();
        self.acquire_with_cancel(priority, timeout, &never).await
    }

    /// Like [`acquire`](Self::acquire), but also gives up as soon as `cancel` fires.
    pub async fn acquire_with_cancel(
        &self,
        priority: PriorityLevel,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SlotToken, AdmissionError> {
        if self.is_closed() {
            return Err(AdmissionError::Closed);
        }
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);

        match self.backend.acquire(priority, deadline, cancel).await {
            Ok(lease) => {
                self.counters.granted.fetch_add(1, Ordering::Relaxed);
                let waited = started.elapsed();
                debug!(
                    slot = lease.id(),
                    priority = %priority,
                    waited_ms = waited.as_millis() as u64,
                    "slot granted"
                );
                Ok(SlotToken {
                    lease,
                    acquired_at: Instant::now(),
                    waited,
                })
            }
            Err(e) => {
                match &e {
                    AdmissionError::TimedOut { .. } => {
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    }
                    AdmissionError::Cancelled => {
                        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                debug!(priority = %priority, error = %e, "slot not granted");
                Err(e)
            }
        }
    }

    /// Return a slot.
    pub async fn release(&self, token: SlotToken) -> Result<(), AdmissionError> {
        let id = token.id().to_string();
        let res = self.backend.release(token.lease).await;
        self.after_release(&id, &res);
        res
    }

    /// Release without awaiting if the backend allows it; hands the token back otherwise.
    pub fn release_now(&self, token: SlotToken) -> Result<(), SlotToken> {
        let SlotToken {
            lease,
            acquired_at,
            waited,
        } = token;
        let id = lease.id().to_string();
        match self.backend.try_release_now(lease) {
            Ok(res) => {
                self.after_release(&id, &res);
                Ok(())
            }
            Err(lease) => Err(SlotToken {
                lease,
                acquired_at,
                waited,
            }),
        }
    }

    fn after_release(&self, id: &str, res: &Result<(), AdmissionError>) {
        match res {
            Ok(()) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(slot = id, error = %e, "slot release failed"),
        }
    }

    /// Acquire and wrap the token in a [`SlotGuard`].
    pub async fn scoped(
        self: &Arc<Self>,
        priority: PriorityLevel,
        timeout: Duration,
    ) -> Result<SlotGuard, AdmissionError> {
        let token = self.acquire(priority, timeout).await?;
        Ok(SlotGuard::new(self.clone(), token))
    }

    pub async fn state(&self) -> Result<BackendState, AdmissionError> {
        self.backend.state().await
    }

    /// Non-blocking snapshot; falls back to local counters if the backend is unreachable.
    pub async fn stats(&self) -> AdmissionSnapshot {
        let granted_total = self.counters.granted.load(Ordering::Relaxed);
        let released = self.counters.released.load(Ordering::Relaxed);
        let (state, backend_error) = match self.backend.state().await {
            Ok(st) => (st, None),
            Err(e) => {
                let capacity = self.backend.capacity();
                let active = (granted_total.saturating_sub(released) as usize).min(capacity);
                let st = BackendState {
                    capacity,
                    active,
                    waiting: PriorityDepths::default(),
                };
                (st, Some(e.to_string()))
            }
        };
        AdmissionSnapshot {
            backend: self.backend.name().to_string(),
            capacity: state.capacity,
            active: state.active,
            available: state.available(),
            waiting: state.waiting,
            granted_total,
            timed_out_total: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled_total: self.counters.cancelled.load(Ordering::Relaxed),
            closed: self.is_closed(),
            backend_error,
        }
    }

    /// Reject pending and future acquires. Outstanding tokens can still be released.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.backend.close().await;
        }
    }
}

/// Scoped ownership of a [`SlotToken`].
///
/// Call [`release`](SlotGuard::release) on every normal exit path. If the
/// guard is dropped instead (the owning future was cancelled) the slot is
/// still returned: synchronously when the backend allows, otherwise on a
/// spawned task.
pub struct SlotGuard {
    admission: Arc<AdmissionController>,
    token: Option<SlotToken>,
}

impl SlotGuard {
    pub fn new(admission: Arc<AdmissionController>, token: SlotToken) -> Self {
        Self {
            admission,
            token: Some(token),
        }
    }

    pub fn token(&self) -> Option<&SlotToken> {
        self.token.as_ref()
    }

    pub async fn release(mut self) {
        if let Some(token) = self.token.take() {
            // failures are already logged by the controller
            let _ = self.admission.release(token).await;
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let token = match self.admission.release_now(token) {
            Ok(()) => return,
            Err(token) => token,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let admission = self.admission.clone();
                handle.spawn(async move {
                    let _ = admission.release(token).await;
                });
            }
            Err(_) => warn!(
                slot = token.id(),
                "slot guard dropped outside a runtime; slot reclaimed only by lease expiry"
            ),
        }
    }
}
