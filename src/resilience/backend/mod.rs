//! Slot backends.
//!
//! A [`Backend`] owns the authoritative concurrency counter and the wait
//! queue. Two implementations satisfy the same contract:
//!
//! | Backend | State lives in | Used for |
//! |---------|----------------|----------|
//! | [`LocalBackend`] | an in-process mutex | a single gateway instance |
//! | [`SharedBackend`] | a [`SharedStore`] with leases | several instances sharing one ceiling |
//!
//! The [`AdmissionController`](super::admission::AdmissionController) only
//! sees the trait.

mod local;
mod shared;
mod store;

pub use local::LocalBackend;
pub use shared::{SharedBackend, SharedBackendConfig};
pub use store::{ClaimOutcome, MemorySharedStore, SharedStore, StoreState};

use super::admission::AdmissionError;
use super::priority::{PriorityDepths, PriorityLevel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which backend implementation a gateway uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Shared,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Shared => "shared",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "shared" => Ok(Self::Shared),
            other => Err(format!("unknown backend kind '{}'", other)),
        }
    }
}

/// One unit of outstanding concurrency as seen by a backend.
///
/// Neither `Clone` nor `Copy`: releasing consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotLease {
    id: String,
    priority: PriorityLevel,
}

impl SlotLease {
    pub(crate) fn new(id: impl Into<String>, priority: PriorityLevel) -> Self {
        Self {
            id: id.into(),
            priority,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> PriorityLevel {
        self.priority
    }
}

/// Point-in-time view of a backend's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendState {
    pub capacity: usize,
    pub active: usize,
    pub waiting: PriorityDepths,
}

impl BackendState {
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.active)
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Wait for a slot until `deadline`, or until `cancel` fires.
    ///
    /// Higher priorities are granted first, FIFO within a priority. A waiter
    /// that times out or is cancelled has left the queue by the time this
    /// returns, and never receives a slot afterwards.
    async fn acquire(
        &self,
        priority: PriorityLevel,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<SlotLease, AdmissionError>;

    /// Return a slot and wake the next eligible waiter.
    async fn release(&self, lease: SlotLease) -> Result<(), AdmissionError>;

    /// Release without awaiting, when the backend can do so.
    ///
    /// Used from `Drop`. Backends that need I/O hand the lease back.
    fn try_release_now(&self, lease: SlotLease) -> Result<Result<(), AdmissionError>, SlotLease> {
        Err(lease)
    }

    async fn state(&self) -> Result<BackendState, AdmissionError>;

    /// Reject all current and future waiters with [`AdmissionError::Closed`].
    async fn close(&self);

    fn capacity(&self) -> usize;

    fn name(&self) -> &'static str;
}
