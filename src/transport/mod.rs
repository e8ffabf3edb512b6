//! 传输层：连接池化的 HTTP 客户端、错误分类与重试策略。
//!
//! # Transport Module
//!
//! A [`Transport`] performs exactly one attempt of an upstream call and maps
//! every failure to an [`ErrorClass`]. Retries are layered on top by
//! [`retry::execute`] under an explicit [`RetryPolicy`], so the policy is a
//! plain value that can be inspected and tested on its own.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`HttpTransport`] | reqwest client with a bounded connection pool and phased timeouts |
//! | [`RetryPolicy`] | max retries, backoff floor/ceiling, jitter, retryable classes |
//! | [`ClassifiedError`] | a failed attempt (or attempts) with its class |

pub mod http;
pub mod retry;

pub use http::HttpTransport;
pub use retry::{RetryPolicy, RetrySnapshot};

use crate::error_code::ErrorClass;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Header carrying our per-call correlation id, stable across retries.
pub const REQUEST_ID_HEADER: &str = "x-synthgate-request-id";

/// Response headers that may carry the upstream's own request id.
pub(crate) const UPSTREAM_REQUEST_ID_HEADERS: &[&str] = &["x-request-id", "request-id", "cf-ray"];

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    /// Single-file multipart upload. Rebuilt for every attempt.
    Multipart {
        field: String,
        file_name: String,
        content_type: String,
        data: Bytes,
    },
}

/// One logical upstream call. Cheap to clone; retries reuse it as is.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
    pub request_id: String,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Attempts spent, including this successful one.
    pub attempts: u32,
    pub upstream_request_id: Option<String>,
}

impl TransportResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Where a transport timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    /// Waiting for a free connection in the pool.
    PoolWait,
    Connect,
    /// Sending the request and waiting for response headers.
    Write,
    /// Reading the response body.
    Read,
    /// Overall per-attempt budget.
    Total,
}

impl TimeoutPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PoolWait => "pool_wait",
            Self::Connect => "connect",
            Self::Write => "write",
            Self::Read => "read",
            Self::Total => "total",
        }
    }
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed upstream call, classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class} after {attempts} attempt(s){}: {message}", status_suffix(.status))]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub status: Option<u16>,
    pub message: String,
    /// From a `Retry-After` header, if the upstream sent one.
    pub retry_after: Option<Duration>,
    pub phase: Option<TimeoutPhase>,
    pub attempts: u32,
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {})", s),
        None => String::new(),
    }
}

impl ClassifiedError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            message: message.into(),
            retry_after: None,
            phase: None,
            attempts: 1,
        }
    }

    pub fn timeout(phase: TimeoutPhase, budget: Duration) -> Self {
        let mut e = Self::new(
            ErrorClass::TransportTimeout,
            format!("{} phase exceeded {}ms", phase, budget.as_millis()),
        );
        e.phase = Some(phase);
        e
    }

    /// Classify a non-2xx response.
    pub fn from_response(status: u16, headers: &HeaderMap, body: &[u8]) -> Self {
        let class = ErrorClass::from_http_status(status).unwrap_or(ErrorClass::Unknown);
        let mut e = Self::new(class, body_excerpt(body));
        e.status = Some(status);
        if class == ErrorClass::RateLimited {
            e.retry_after = retry_after(headers);
        }
        e
    }

    /// Classify a reqwest failure.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            let mut e = Self::new(ErrorClass::TransportTimeout, err.to_string());
            e.phase = Some(if err.is_connect() {
                TimeoutPhase::Connect
            } else {
                TimeoutPhase::Total
            });
            return e;
        }
        if let Some(status) = err.status() {
            let mut e = Self::from_response(status.as_u16(), &HeaderMap::new(), &[]);
            e.message = err.to_string();
            return e;
        }
        Self::new(ErrorClass::Unknown, err.to_string())
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

const BODY_EXCERPT_LIMIT: usize = 512;

fn body_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.len() <= BODY_EXCERPT_LIMIT {
        return text.to_string();
    }
    let mut end = BODY_EXCERPT_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

pub(crate) fn header_first(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(v) = headers.get(*name) {
            if let Ok(s) = v.to_str() {
                let s = s.trim();
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

/// `Retry-After: <seconds>`. The HTTP-date form is ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = header_first(headers, &["retry-after"])?;
    let secs: u64 = raw.parse().ok()?;
    Some(Duration::from_secs(secs))
}

/// Connection pool configuration and live counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub transport: String,
    pub max_connections: usize,
    pub in_use: usize,
    pub available: usize,
    pub max_idle_per_host: usize,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub pool_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub attempts_total: u64,
    /// Failed attempts keyed by class name.
    pub failures: std::collections::BTreeMap<String, u64>,
    pub closed: bool,
}

/// Errors constructing or shutting down a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Transport error: {0}")]
    Other(String),
}

/// One attempt of an upstream call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, ClassifiedError>;

    fn pool(&self) -> PoolSnapshot;

    /// Drop pooled connections and reject further sends.
    async fn close(&self);

    fn name(&self) -> &'static str;
}
