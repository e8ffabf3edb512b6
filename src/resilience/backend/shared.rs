//! Backend over a [`SharedStore`], for several gateway instances sharing one ceiling.
//!
//! A waiter registers a ticket, then repeatedly asks the store to claim it.
//! The store only converts a ticket into a lease when its rank (priority
//! first, then arrival) falls inside the free capacity, so ordering holds
//! across processes. Leases carry a TTL renewed by a heartbeat task while
//! held; a process that dies simply stops renewing.

use super::store::{ClaimOutcome, SharedStore};
use super::{Backend, BackendState, SlotLease};
use crate::resilience::admission::{deadline_after, AdmissionError};
use crate::resilience::priority::PriorityLevel;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SharedBackendConfig {
    pub namespace: String,
    pub capacity: usize,
    /// Lifetime of a lease or wait ticket that is not renewed.
    pub lease_ttl: Duration,
    /// How often a waiter re-checks the store when not woken locally.
    pub poll_interval: Duration,
}

impl Default for SharedBackendConfig {
    fn default() -> Self {
        Self {
            namespace: "synthgate".to_string(),
            capacity: 10,
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

pub struct SharedBackend {
    store: Arc<dyn SharedStore>,
    cfg: SharedBackendConfig,
    /// Wakes local waiters after a local release.
    released: Arc<Notify>,
    heartbeats: Mutex<HashMap<String, CancellationToken>>,
    closed: AtomicBool,
}

impl SharedBackend {
    pub fn new(store: Arc<dyn SharedStore>, mut cfg: SharedBackendConfig) -> Self {
        cfg.capacity = cfg.capacity.max(1);
        Self {
            store,
            cfg,
            released: Arc::new(Notify::new()),
            heartbeats: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SharedBackendConfig {
        &self.cfg
    }

    fn start_heartbeat(&self, lease_id: &str) {
        let stop = CancellationToken::new();
        self.heartbeats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(lease_id.to_string(), stop.clone());

        let store = self.store.clone();
        let namespace = self.cfg.namespace.clone();
        let lease = lease_id.to_string();
        let ttl = self.cfg.lease_ttl;
        let every = (ttl / 3).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(deadline_after(Instant::now(), every), every);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => {
                        match store.renew(&namespace, &lease, ttl).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(slot = lease.as_str(), "lease expired before renewal; slot lost");
                                break;
                            }
                            Err(e) => warn!(slot = lease.as_str(), error = %e, "lease renewal failed"),
                        }
                    }
                }
            }
        });
    }

    fn stop_heartbeat(&self, lease_id: &str) {
        if let Some(stop) = self
            .heartbeats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(lease_id)
        {
            stop.cancel();
        }
    }

    async fn enqueue(&self, ticket: &str, priority: PriorityLevel) -> Result<(), AdmissionError> {
        let seq = self
            .store
            .enqueue(&self.cfg.namespace, ticket, priority, self.cfg.lease_ttl)
            .await?;
        debug!(ticket, seq, priority = %priority, "wait ticket registered");
        Ok(())
    }
}

/// A registered ticket; dequeued on drop unless claimed or already removed.
struct PendingTicket {
    store: Arc<dyn SharedStore>,
    namespace: String,
    id: String,
    done: bool,
}

impl PendingTicket {
    async fn abandon(&mut self) -> Result<(), AdmissionError> {
        self.done = true;
        self.store.dequeue(&self.namespace, &self.id).await?;
        Ok(())
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let store = self.store.clone();
        let namespace = std::mem::take(&mut self.namespace);
        let id = std::mem::take(&mut self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.dequeue(&namespace, &id).await;
            });
        }
    }
}

enum Wake {
    Poll,
    TimedOut,
    Cancelled,
}

#[async_trait]
impl Backend for SharedBackend {
    async fn acquire(
        &self,
        priority: PriorityLevel,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<SlotLease, AdmissionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::Closed);
        }
        let started = Instant::now();
        let id = Uuid::new_v4().to_string();
        self.enqueue(&id, priority).await?;
        let mut ticket = PendingTicket {
            store: self.store.clone(),
            namespace: self.cfg.namespace.clone(),
            id: id.clone(),
            done: false,
        };

        loop {
            // Register interest before checking, so a release between the
            // claim attempt and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                ticket.abandon().await?;
                return Err(AdmissionError::Closed);
            }

            match self
                .store
                .try_claim(&self.cfg.namespace, &id, self.cfg.capacity, self.cfg.lease_ttl)
                .await?
            {
                ClaimOutcome::Claimed => {
                    ticket.done = true;
                    self.start_heartbeat(&id);
                    return Ok(SlotLease::new(id, priority));
                }
                ClaimOutcome::Waiting { rank } => {
                    debug!(ticket = id.as_str(), rank, "waiting for shared slot");
                }
                ClaimOutcome::Missing => {
                    warn!(ticket = id.as_str(), "wait ticket expired; re-registering");
                    self.enqueue(&id, priority).await?;
                    continue;
                }
            }

            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Wake::TimedOut,
                _ = &mut notified => Wake::Poll,
                _ = tokio::time::sleep(self.cfg.poll_interval) => Wake::Poll,
            };

            match wake {
                Wake::Poll => continue,
                Wake::TimedOut => {
                    ticket.abandon().await?;
                    return Err(AdmissionError::TimedOut {
                        priority,
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Wake::Cancelled => {
                    ticket.abandon().await?;
                    return Err(AdmissionError::Cancelled);
                }
            }
        }
    }

    async fn release(&self, lease: SlotLease) -> Result<(), AdmissionError> {
        self.stop_heartbeat(lease.id());
        let released = self.store.release(&self.cfg.namespace, lease.id()).await;
        self.released.notify_waiters();
        if !released? {
            warn!(slot = lease.id(), "lease already expired at release");
            return Err(AdmissionError::UnknownSlot(lease.id().to_string()));
        }
        Ok(())
    }

    async fn state(&self) -> Result<BackendState, AdmissionError> {
        let st = self.store.snapshot(&self.cfg.namespace).await?;
        Ok(BackendState {
            capacity: self.cfg.capacity,
            active: st.active,
            waiting: st.waiting,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.released.notify_waiters();
    }

    fn capacity(&self) -> usize {
        self.cfg.capacity
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}
