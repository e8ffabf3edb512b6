//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use mockito::{Server, ServerGuard};
use reqwest::header::HeaderMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use synthgate::resilience::backend::{MemorySharedStore, SharedBackend, SharedBackendConfig};
use synthgate::resilience::AdmissionSnapshot;
use synthgate::transport::{
    ClassifiedError, PoolSnapshot, Transport, TransportRequest, TransportResponse,
};
use synthgate::{AdmissionController, Gateway, GatewayConfig};

/// One scripted upstream reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Json(serde_json::Value),
    Fail(ClassifiedError),
    Panic,
}

/// In-process upstream: replies from a script, then a default, after a fixed delay.
pub struct MockUpstream {
    delay: Duration,
    script: Mutex<VecDeque<Reply>>,
    default: Reply,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicU32,
    closed: AtomicBool,
}

impl MockUpstream {
    pub fn new(default: Reply) -> Arc<Self> {
        Self::scripted(default, Vec::new(), Duration::ZERO)
    }

    pub fn scripted(default: Reply, script: Vec<Reply>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            script: Mutex::new(script.into()),
            default,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn ok(body: serde_json::Value) -> Arc<Self> {
        Self::new(Reply::Json(body))
    }

    pub fn slow(body: serde_json::Value, delay: Duration) -> Arc<Self> {
        Self::scripted(Reply::Json(body), Vec::new(), delay)
    }

    pub fn failing(status: u16) -> Arc<Self> {
        Self::new(Reply::Fail(status_error(status)))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockUpstream {
    async fn send(&self, _request: &TransportRequest) -> Result<TransportResponse, ClassifiedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        match reply {
            Reply::Json(v) => Ok(TransportResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: Bytes::from(serde_json::to_vec(&v).unwrap()),
                attempts: 1,
                upstream_request_id: None,
            }),
            Reply::Fail(e) => Err(e),
            Reply::Panic => panic!("upstream exploded"),
        }
    }

    fn pool(&self) -> PoolSnapshot {
        PoolSnapshot {
            transport: "mock".to_string(),
            in_use: self.in_flight.load(Ordering::SeqCst),
            closed: self.is_closed(),
            ..PoolSnapshot::default()
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

pub fn status_error(status: u16) -> ClassifiedError {
    ClassifiedError::from_response(status, &HeaderMap::new(), b"scripted")
}

/// Config with millisecond backoff so retry tests stay fast.
pub fn fast_config(capacity: usize) -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    cfg.admission.capacity = capacity;
    cfg.admission.admission_timeout_ms = 5_000;
    cfg.retry.backoff_floor_ms = 1;
    cfg.retry.backoff_ceiling_ms = 5;
    cfg.retry.jitter = false;
    cfg.polling.interval_ms = 100;
    cfg.polling.max_interval_ms = 400;
    cfg
}

pub fn shared_config(capacity: usize) -> GatewayConfig {
    let mut cfg = fast_config(capacity);
    cfg.admission.backend = synthgate::BackendKind::Shared;
    cfg.admission.shared_backend_endpoint = Some("memory://tests".to_string());
    cfg.admission.lease_ttl_ms = 1_000;
    cfg.admission.shared_poll_interval_ms = 5;
    cfg
}

pub fn gateway(cfg: GatewayConfig, upstream: Arc<MockUpstream>) -> Gateway {
    Gateway::builder()
        .config(cfg)
        .transport(upstream)
        .build()
        .expect("gateway")
}

/// Both backend kinds, for running one property against each.
pub fn controllers(capacity: usize) -> Vec<(&'static str, Arc<AdmissionController>)> {
    let shared = SharedBackend::new(
        Arc::new(MemorySharedStore::new()),
        SharedBackendConfig {
            namespace: "props".to_string(),
            capacity,
            lease_ttl: Duration::from_secs(1),
            poll_interval: Duration::from_millis(5),
        },
    );
    vec![
        ("local", Arc::new(AdmissionController::local(capacity))),
        ("shared", Arc::new(AdmissionController::new(Arc::new(shared)))),
    ]
}

/// Poll the controller's snapshot until `pred` holds or two seconds pass.
pub async fn wait_for(ctl: &AdmissionController, pred: impl Fn(&AdmissionSnapshot) -> bool) -> bool {
    for _ in 0..400 {
        if pred(&ctl.stats().await) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Test fixture that manages a mock HTTP server.
pub struct MockServerFixture {
    pub server: ServerGuard,
    pub base_url: String,
}

impl MockServerFixture {
    pub async fn new() -> Self {
        let server = Server::new_async().await;
        let base_url = server.url();
        Self { server, base_url }
    }

    pub fn config(&self) -> GatewayConfig {
        let mut cfg = fast_config(4);
        cfg.base_url = self.base_url.clone();
        cfg.transport.api_key = Some("test-key".to_string());
        cfg
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(self.config()).expect("gateway")
    }
}
