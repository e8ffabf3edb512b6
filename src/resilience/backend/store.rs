//! Shared store primitives.
//!
//! Each method is one atomic read-modify-write against the external store
//! (on a key-value server this is one script invocation). Every call first
//! reaps expired leases and expired wait tickets, so a crashed holder only
//! costs capacity until its lease TTL runs out.

use crate::resilience::admission::{deadline_after, AdmissionError};
use crate::resilience::priority::{PriorityDepths, PriorityLevel};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The ticket became a lease with the same id.
    Claimed,
    /// `rank` tickets are ahead of this one.
    Waiting { rank: usize },
    /// The ticket is unknown, usually because it expired.
    Missing,
}

/// Counters of one namespace after reaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreState {
    pub active: usize,
    pub waiting: PriorityDepths,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Register a wait ticket. Returns its store-wide sequence number.
    async fn enqueue(
        &self,
        namespace: &str,
        ticket: &str,
        priority: PriorityLevel,
        ttl: Duration,
    ) -> Result<u64, AdmissionError>;

    /// Turn `ticket` into a lease if fewer than `capacity` leases are live and
    /// the ticket ranks within the free slots. Refreshes the ticket's expiry
    /// otherwise.
    async fn try_claim(
        &self,
        namespace: &str,
        ticket: &str,
        capacity: usize,
        ttl: Duration,
    ) -> Result<ClaimOutcome, AdmissionError>;

    /// Remove a wait ticket. Returns whether it was still queued.
    async fn dequeue(&self, namespace: &str, ticket: &str) -> Result<bool, AdmissionError>;

    /// Extend a live lease. Returns `false` if it already expired.
    async fn renew(&self, namespace: &str, lease: &str, ttl: Duration)
        -> Result<bool, AdmissionError>;

    /// Delete a lease. Returns `false` if it was not live.
    async fn release(&self, namespace: &str, lease: &str) -> Result<bool, AdmissionError>;

    async fn snapshot(&self, namespace: &str) -> Result<StoreState, AdmissionError>;

    fn name(&self) -> &'static str;
}

/// Ticket ordering key: higher priority first, then lower sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RankKey(Reverse<PriorityLevel>, u64);

#[derive(Debug)]
struct Ticket {
    id: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Namespace {
    leases: HashMap<String, Instant>,
    queue: BTreeMap<RankKey, Ticket>,
    index: HashMap<String, RankKey>,
}

impl Namespace {
    fn reap(&mut self, now: Instant) {
        self.leases.retain(|_, expires_at| *expires_at > now);
        let expired: Vec<RankKey> = self
            .queue
            .iter()
            .filter(|(_, t)| t.expires_at <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(t) = self.queue.remove(&key) {
                self.index.remove(&t.id);
            }
        }
    }

    fn depths(&self) -> PriorityDepths {
        let mut counts = [0usize; PriorityLevel::COUNT];
        for RankKey(Reverse(priority), _) in self.queue.keys() {
            counts[priority.index()] += 1;
        }
        PriorityDepths::from_array(counts)
    }
}

#[derive(Debug, Default)]
struct Inner {
    sequence: u64,
    namespaces: HashMap<String, Namespace>,
}

/// In-process [`SharedStore`].
///
/// Every gateway holding the same `Arc<MemorySharedStore>` observes one
/// ceiling, which makes it a faithful single-process stand-in for an
/// external store.
#[derive(Debug, Default)]
pub struct MemorySharedStore {
    inner: Mutex<Inner>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_namespace<T>(&self, namespace: &str, f: impl FnOnce(&mut Namespace, &mut u64) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Inner {
            sequence,
            namespaces,
        } = &mut *inner;
        let ns = namespaces.entry(namespace.to_string()).or_default();
        ns.reap(Instant::now());
        f(ns, sequence)
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn enqueue(
        &self,
        namespace: &str,
        ticket: &str,
        priority: PriorityLevel,
        ttl: Duration,
    ) -> Result<u64, AdmissionError> {
        Ok(self.with_namespace(namespace, |ns, sequence| {
            *sequence += 1;
            let key = RankKey(Reverse(priority), *sequence);
            if let Some(old) = ns.index.insert(ticket.to_string(), key) {
                ns.queue.remove(&old);
            }
            ns.queue.insert(
                key,
                Ticket {
                    id: ticket.to_string(),
                    expires_at: deadline_after(Instant::now(), ttl),
                },
            );
            *sequence
        }))
    }

    async fn try_claim(
        &self,
        namespace: &str,
        ticket: &str,
        capacity: usize,
        ttl: Duration,
    ) -> Result<ClaimOutcome, AdmissionError> {
        Ok(self.with_namespace(namespace, |ns, _| {
            let Some(key) = ns.index.get(ticket).copied() else {
                return ClaimOutcome::Missing;
            };
            let now = Instant::now();
            let rank = ns.queue.range(..key).count();
            let free = capacity.saturating_sub(ns.leases.len());
            if rank < free {
                ns.queue.remove(&key);
                ns.index.remove(ticket);
                ns.leases.insert(ticket.to_string(), deadline_after(now, ttl));
                ClaimOutcome::Claimed
            } else {
                if let Some(t) = ns.queue.get_mut(&key) {
                    t.expires_at = deadline_after(now, ttl);
                }
                ClaimOutcome::Waiting { rank }
            }
        }))
    }

    async fn dequeue(&self, namespace: &str, ticket: &str) -> Result<bool, AdmissionError> {
        Ok(self.with_namespace(namespace, |ns, _| match ns.index.remove(ticket) {
            Some(key) => ns.queue.remove(&key).is_some(),
            None => false,
        }))
    }

    async fn renew(
        &self,
        namespace: &str,
        lease: &str,
        ttl: Duration,
    ) -> Result<bool, AdmissionError> {
        Ok(self.with_namespace(namespace, |ns, _| match ns.leases.get_mut(lease) {
            Some(expires_at) => {
                *expires_at = deadline_after(Instant::now(), ttl);
                true
            }
            None => false,
        }))
    }

    async fn release(&self, namespace: &str, lease: &str) -> Result<bool, AdmissionError> {
        Ok(self.with_namespace(namespace, |ns, _| ns.leases.remove(lease).is_some()))
    }

    async fn snapshot(&self, namespace: &str) -> Result<StoreState, AdmissionError> {
        Ok(self.with_namespace(namespace, |ns, _| StoreState {
            active: ns.leases.len(),
            waiting: ns.depths(),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
