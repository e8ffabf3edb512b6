//! Retry policy
//!
//! Retries are an explicit loop around single attempts. Only transient
//! classes (server errors, timeouts) are ever retried, whatever the policy
//! lists; client errors and rate-limit rejections return after one attempt.

use super::{ClassifiedError, Transport, TransportRequest, TransportResponse};
use crate::error_code::ErrorClass;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    /// Spread each delay by ±20%, still capped at the ceiling.
    pub jitter: bool,
    pub retry_on: Vec<ErrorClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_floor: Duration::from_secs(2),
            backoff_ceiling: Duration::from_secs(10),
            jitter: true,
            retry_on: vec![ErrorClass::ServerError, ErrorClass::TransportTimeout],
        }
    }
}

/// Serializable summary for stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySnapshot {
    pub max_retries: u32,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub jitter: bool,
    pub retry_on: Vec<ErrorClass>,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_backoff(mut self, floor: Duration, ceiling: Duration) -> Self {
        self.backoff_floor = floor;
        self.backoff_ceiling = ceiling.max(floor);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, classes: Vec<ErrorClass>) -> Self {
        self.retry_on = classes;
        self
    }

    pub fn is_retryable(&self, err: &ClassifiedError) -> bool {
        err.class.is_transient() && self.retry_on.contains(&err.class)
    }

    /// Delay before retry number `attempt + 1` (0-based): `floor * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let floor = self.backoff_floor.as_millis() as u64;
        let cap = self.backoff_ceiling.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let base = floor.saturating_mul(factor).min(cap);
        if !self.jitter || base == 0 {
            return Duration::from_millis(base);
        }
        let spread = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis(((base as f64 * spread) as u64).min(cap))
    }

    /// Next delay if `err` after `attempt` (0-based) should be retried.
    pub fn should_retry(&self, attempt: u32, err: &ClassifiedError) -> Option<Duration> {
        if attempt >= self.max_retries || !self.is_retryable(err) {
            return None;
        }
        Some(self.backoff(attempt))
    }

    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            max_retries: self.max_retries,
            backoff_floor_ms: self.backoff_floor.as_millis() as u64,
            backoff_ceiling_ms: self.backoff_ceiling.as_millis() as u64,
            jitter: self.jitter,
            retry_on: self.retry_on.clone(),
        }
    }
}

/// Run `request` through `transport`, retrying under `policy`.
///
/// The returned response or error records the total number of attempts.
pub async fn execute(
    transport: &dyn Transport,
    policy: &RetryPolicy,
    request: &TransportRequest,
) -> Result<TransportResponse, ClassifiedError> {
    let mut attempt: u32 = 0;
    loop {
        match transport.send(request).await {
            Ok(mut resp) => {
                resp.attempts = attempt + 1;
                if attempt > 0 {
                    debug!(
                        request_id = request.request_id.as_str(),
                        attempts = resp.attempts,
                        "upstream call succeeded after retry"
                    );
                }
                return Ok(resp);
            }
            Err(err) => {
                let Some(delay) = policy.should_retry(attempt, &err) else {
                    return Err(err.with_attempts(attempt + 1));
                };
                warn!(
                    request_id = request.request_id.as_str(),
                    path = request.path.as_str(),
                    error_class = err.class.name(),
                    http_status = err.status.unwrap_or(0),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient upstream failure, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PoolSnapshot, TimeoutPhase};
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails with the scripted errors, then succeeds.
    struct Scripted {
        failures: Mutex<Vec<ClassifiedError>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(mut failures: Vec<ClassifiedError>) -> Self {
            failures.reverse();
            Self {
                failures: Mutex::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, _: &TransportRequest) -> Result<TransportResponse, ClassifiedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failures.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(TransportResponse {
                    status: 200,
                    headers: HeaderMap::new(),
                    body: bytes::Bytes::from_static(b"{}"),
                    attempts: 1,
                    upstream_request_id: None,
                }),
            }
        }
        fn pool(&self) -> PoolSnapshot {
            PoolSnapshot::default()
        }
        async fn close(&self) {}
        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(false)
    }

    fn status(code: u16) -> ClassifiedError {
        ClassifiedError::from_response(code, &HeaderMap::new(), b"")
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy::new().with_jitter(false);
        assert_eq!(p.backoff(0), Duration::from_secs(2));
        assert_eq!(p.backoff(1), Duration::from_secs(4));
        assert_eq!(p.backoff(2), Duration::from_secs(8));
        assert_eq!(p.backoff(3), Duration::from_secs(10));
        assert_eq!(p.backoff(200), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_spread_and_cap() {
        let p = RetryPolicy::new();
        for _ in 0..100 {
            let d = p.backoff(0).as_millis();
            assert!((1600..=2400).contains(&d), "{}", d);
            assert!(p.backoff(5) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_policy_cannot_enable_non_transient_retries() {
        let p = RetryPolicy::new().with_retry_on(ErrorClass::ALL.to_vec());
        assert!(p.should_retry(0, &status(429)).is_none());
        assert!(p.should_retry(0, &status(400)).is_none());
        assert!(p.should_retry(0, &status(500)).is_some());
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let t = Scripted::new(vec![status(503); 10]);
        let err = execute(&t, &fast(), &TransportRequest::get("/jobs/1"))
            .await
            .unwrap_err();
        assert_eq!(t.calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.class, ErrorClass::ServerError);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let t = Scripted::new(vec![
            status(502),
            ClassifiedError::timeout(TimeoutPhase::Read, Duration::from_millis(1)),
        ]);
        let resp = execute(&t, &fast(), &TransportRequest::get("/jobs/1")).await.unwrap();
        assert_eq!(resp.attempts, 3);
    }

    #[tokio::test]
    async fn test_no_retry_for_client_errors() {
        for code in [400u16, 404, 429] {
            let t = Scripted::new(vec![status(code); 4]);
            let err = execute(&t, &fast(), &TransportRequest::get("/x")).await.unwrap_err();
            assert_eq!(t.calls.load(Ordering::SeqCst), 1, "status {}", code);
            assert_eq!(err.attempts, 1);
        }
    }

    #[tokio::test]
    async fn test_unknown_is_not_retried() {
        let t = Scripted::new(vec![ClassifiedError::new(ErrorClass::Unknown, "refused"); 2]);
        let err = execute(&t, &fast(), &TransportRequest::get("/x")).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Unknown);
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }
}
