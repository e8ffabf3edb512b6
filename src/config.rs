//! 网关配置：YAML 文件、环境变量覆盖与校验。
//!
//! # Gateway Configuration
//!
//! Every field has a default, so a YAML file only needs the keys it changes:
//!
//! ```yaml
//! base_url: https://api.example.com/v1
//! admission:
//!   capacity: 4
//!   backend: shared
//!   shared_backend_endpoint: memory://render-farm
//! retry:
//!   max_retries: 2
//! ```
//!
//! Environment variables (`SYNTHGATE_*`) override file values; see
//! [`GatewayConfig::apply_env_overrides`].

use crate::error::{Error, ErrorContext};
use crate::error_code::ErrorClass;
use crate::resilience::backend::{BackendKind, SharedBackendConfig};
use crate::transport::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const ENV_PREFIX: &str = "SYNTHGATE_";

/// Scheme of a shared backend endpoint served by the in-process store.
pub const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub admission: AdmissionConfig,
    pub retry: RetryConfig,
    pub transport: TransportConfig,
    pub polling: PollingConfig,
    pub endpoints: EndpointsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            admission: AdmissionConfig::default(),
            retry: RetryConfig::default(),
            transport: TransportConfig::default(),
            polling: PollingConfig::default(),
            endpoints: EndpointsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum concurrent outstanding upstream calls.
    pub capacity: usize,
    pub admission_timeout_ms: u64,
    pub backend: BackendKind,
    /// Required for the shared backend.
    pub shared_backend_endpoint: Option<String>,
    /// Key prefix separating independent ceilings in one shared store.
    pub namespace: String,
    pub lease_ttl_ms: u64,
    pub shared_poll_interval_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            admission_timeout_ms: 30_000,
            backend: BackendKind::Local,
            shared_backend_endpoint: None,
            namespace: "synthgate".to_string(),
            lease_ttl_ms: 30_000,
            shared_poll_interval_ms: 100,
        }
    }
}

impl AdmissionConfig {
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn shared_backend(&self) -> SharedBackendConfig {
        SharedBackendConfig {
            namespace: self.namespace.clone(),
            capacity: self.capacity,
            lease_ttl: Duration::from_millis(self.lease_ttl_ms),
            poll_interval: Duration::from_millis(self.shared_poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_floor_ms: 2_000,
            backoff_ceiling_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(self.max_retries)
            .with_backoff(
                Duration::from_millis(self.backoff_floor_ms),
                Duration::from_millis(self.backoff_ceiling_ms),
            )
            .with_jitter(self.jitter)
            .with_retry_on(vec![ErrorClass::ServerError, ErrorClass::TransportTimeout])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// Sending the request until response headers arrive.
    pub write_timeout_ms: u64,
    /// Reading the response body.
    pub read_timeout_ms: u64,
    /// Waiting for a free pooled connection.
    pub pool_timeout_ms: u64,
    /// Whole-attempt budget.
    pub total_timeout_ms: u64,
    pub max_connections: usize,
    pub max_idle_per_host: usize,
    pub idle_timeout_ms: u64,
    pub proxy_url: Option<String>,
    /// Bearer token. Prefer `api_key_env` outside tests.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            write_timeout_ms: 30_000,
            read_timeout_ms: 60_000,
            pool_timeout_ms: 10_000,
            total_timeout_ms: 120_000,
            max_connections: 20,
            max_idle_per_host: 10,
            idle_timeout_ms: 90_000,
            proxy_url: None,
            api_key: None,
            api_key_env: "SYNTHGATE_API_KEY".to_string(),
            user_agent: format!("synthgate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    /// Multiplier applied to the interval after each poll.
    pub backoff_factor: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            max_interval_ms: 10_000,
            backoff_factor: 1.25,
        }
    }
}

impl PollingConfig {
    /// Interval after `current`, grown by the factor and capped.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let next = current.as_millis() as f64 * self.backoff_factor;
        Duration::from_millis((next as u64).min(self.max_interval_ms.max(self.interval_ms)))
    }
}

/// Upstream path templates. `{job_id}` is substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub upload_asset: String,
    pub create_job: String,
    pub job_status: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            upload_asset: "/assets".to_string(),
            create_job: "/jobs".to_string(),
            job_status: "/jobs/{job_id}".to_string(),
        }
    }
}

impl EndpointsConfig {
    pub fn job_status_path(&self, job_id: &str) -> String {
        self.job_status.replace("{job_id}", job_id)
    }
}

fn config_error(field: &str, message: impl Into<String>) -> Error {
    Error::configuration_with_context(
        message,
        ErrorContext::new()
            .with_field_path(field)
            .with_source("gateway_config"),
    )
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        Error::configuration_with_context(
            format!("invalid value '{}'", raw),
            ErrorContext::new()
                .with_field_path(format!("{}{}", ENV_PREFIX, key))
                .with_details(e.to_string())
                .with_source("env_override"),
        )
    })
}

impl GatewayConfig {
    pub fn from_yaml_str(yaml: &str) -> crate::Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            Error::configuration_with_context(
                "failed to parse gateway config",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("yaml"),
            )
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text).map_err(|e| match e {
            Error::Configuration { message, context } => Error::Configuration {
                message: format!("{} ({})", message, path.display()),
                context,
            },
            other => other,
        })
    }

    pub fn to_yaml(&self) -> crate::Result<String> {
        serde_yaml::to_string(self).map_err(|e| {
            Error::runtime_with_context(
                "failed to render gateway config",
                ErrorContext::new().with_details(e.to_string()),
            )
        })
    }

    /// Apply `SYNTHGATE_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> crate::Result<()> {
        self.apply_overrides_from(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Apply overrides from `lookup`, which receives keys without the prefix
    /// (`CAPACITY`, `BACKEND`, ...).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> crate::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("CAPACITY") {
            self.admission.capacity = parse_env("CAPACITY", &v)?;
        }
        if let Some(v) = lookup("ADMISSION_TIMEOUT_MS") {
            self.admission.admission_timeout_ms = parse_env("ADMISSION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("BACKEND") {
            self.admission.backend = parse_env("BACKEND", &v)?;
        }
        if let Some(v) = lookup("SHARED_BACKEND_ENDPOINT") {
            self.admission.shared_backend_endpoint = Some(v);
        }
        if let Some(v) = lookup("NAMESPACE") {
            self.admission.namespace = v;
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            self.retry.max_retries = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("BACKOFF_FLOOR_MS") {
            self.retry.backoff_floor_ms = parse_env("BACKOFF_FLOOR_MS", &v)?;
        }
        if let Some(v) = lookup("BACKOFF_CEILING_MS") {
            self.retry.backoff_ceiling_ms = parse_env("BACKOFF_CEILING_MS", &v)?;
        }
        if let Some(v) = lookup("CONNECT_TIMEOUT_MS") {
            self.transport.connect_timeout_ms = parse_env("CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("READ_TIMEOUT_MS") {
            self.transport.read_timeout_ms = parse_env("READ_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("PROXY_URL") {
            self.transport.proxy_url = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> crate::Result<()> {
        let a = &self.admission;
        if a.capacity == 0 {
            return Err(config_error("admission.capacity", "capacity must be at least 1"));
        }
        match a.backend {
            BackendKind::Shared => {
                let endpoint = a.shared_backend_endpoint.as_deref().unwrap_or("").trim();
                if endpoint.is_empty() {
                    return Err(config_error(
                        "admission.shared_backend_endpoint",
                        "shared backend requires an endpoint",
                    ));
                }
                if a.lease_ttl_ms <= a.shared_poll_interval_ms.saturating_mul(2) {
                    return Err(config_error(
                        "admission.lease_ttl_ms",
                        "lease TTL must exceed twice the shared poll interval",
                    ));
                }
            }
            BackendKind::Local => {
                if a.shared_backend_endpoint.is_some() {
                    warn!("shared_backend_endpoint is ignored with the local backend");
                }
            }
        }

        let r = &self.retry;
        if r.backoff_floor_ms > r.backoff_ceiling_ms {
            return Err(config_error(
                "retry.backoff_floor_ms",
                format!(
                    "backoff floor {}ms exceeds ceiling {}ms",
                    r.backoff_floor_ms, r.backoff_ceiling_ms
                ),
            ));
        }

        let t = &self.transport;
        if t.max_connections == 0 {
            return Err(config_error(
                "transport.max_connections",
                "max_connections must be at least 1",
            ));
        }
        for (field, value) in [
            ("transport.connect_timeout_ms", t.connect_timeout_ms),
            ("transport.write_timeout_ms", t.write_timeout_ms),
            ("transport.read_timeout_ms", t.read_timeout_ms),
            ("transport.pool_timeout_ms", t.pool_timeout_ms),
            ("transport.total_timeout_ms", t.total_timeout_ms),
        ] {
            if value == 0 {
                return Err(config_error(field, "timeout must be greater than zero"));
            }
        }

        let p = &self.polling;
        if p.interval_ms == 0 {
            return Err(config_error("polling.interval_ms", "poll interval must be greater than zero"));
        }
        if !(p.backoff_factor >= 1.0) {
            return Err(config_error(
                "polling.backoff_factor",
                "poll backoff factor must be at least 1.0",
            ));
        }
        if !self.endpoints.job_status.contains("{job_id}") {
            return Err(config_error(
                "endpoints.job_status",
                "job status path must contain {job_id}",
            ));
        }
        Ok(())
    }

    /// Checks specific to the built-in HTTP transport.
    pub fn validate_base_url(&self) -> crate::Result<url::Url> {
        let parsed = url::Url::parse(&self.base_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid base_url '{}'", self.base_url),
                ErrorContext::new()
                    .with_field_path("base_url")
                    .with_details(e.to_string()),
            )
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(config_error("base_url", "base_url must use http or https"));
        }
        Ok(parsed)
    }
}
