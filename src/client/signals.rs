use crate::resilience::AdmissionSnapshot;
use crate::transport::{PoolSnapshot, RetrySnapshot};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the gateway for health and metrics endpoints.
///
/// Facts only; reading it has no effect on admission or the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub admission: AdmissionSnapshot,
    pub transport: PoolSnapshot,
    pub retry: RetrySnapshot,
}

impl StatsSnapshot {
    pub fn active(&self) -> usize {
        self.admission.active
    }

    pub fn available(&self) -> usize {
        self.admission.available
    }

    pub fn waiting(&self) -> usize {
        self.admission.waiting.total()
    }
}
