use super::{
    header_first, ClassifiedError, PoolSnapshot, RequestBody, TimeoutPhase, Transport,
    TransportError, TransportRequest, TransportResponse, REQUEST_ID_HEADER,
    UPSTREAM_REQUEST_ID_HEADERS,
};
use crate::config::GatewayConfig;
use crate::error_code::ErrorClass;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Proxy;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Timeouts {
    connect: Duration,
    write: Duration,
    read: Duration,
    pool: Duration,
    total: Duration,
}

/// Pooled HTTP transport.
///
/// The reqwest client keeps idle keep-alive connections per host; a
/// semaphore of `max_connections` bounds the number of requests on the wire
/// at once, and waiting for it counts as the pool-wait phase.
pub struct HttpTransport {
    client: ArcSwapOption<reqwest::Client>,
    base_url: String,
    api_key: Option<String>,
    permits: Arc<Semaphore>,
    max_connections: usize,
    max_idle_per_host: usize,
    idle_timeout: Duration,
    timeouts: Timeouts,
    attempts: AtomicU64,
    failures: [AtomicU64; ErrorClass::ALL.len()],
}

impl HttpTransport {
    pub fn new(config: &GatewayConfig) -> Result<Self, TransportError> {
        let base = url::Url::parse(&config.base_url).map_err(|e| TransportError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TransportError::InvalidBaseUrl {
                url: config.base_url.clone(),
                reason: "scheme must be http or https".to_string(),
            });
        }

        let t = &config.transport;
        let timeouts = Timeouts {
            connect: Duration::from_millis(t.connect_timeout_ms),
            write: Duration::from_millis(t.write_timeout_ms),
            read: Duration::from_millis(t.read_timeout_ms),
            pool: Duration::from_millis(t.pool_timeout_ms),
            total: Duration::from_millis(t.total_timeout_ms),
        };
        let idle_timeout = Duration::from_millis(t.idle_timeout_ms);
        let max_connections = t.max_connections.max(1);

        let mut builder = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.total)
            .pool_max_idle_per_host(t.max_idle_per_host)
            .pool_idle_timeout(Some(idle_timeout))
            .user_agent(t.user_agent.clone())
            .tcp_keepalive(Some(Duration::from_secs(30)));

        if let Some(proxy_url) = t.proxy_url.as_deref().filter(|s| !s.is_empty()) {
            match Proxy::all(proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => warn!(proxy = proxy_url, error = %e, "ignoring invalid proxy url"),
            }
        }

        let client = builder.build()?;

        let api_key = t
            .api_key
            .clone()
            .or_else(|| env::var(&t.api_key_env).ok())
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            debug!(env = t.api_key_env.as_str(), "no upstream API key configured");
        }

        Ok(Self {
            client: ArcSwapOption::from_pointee(client),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            max_idle_per_host: t.max_idle_per_host,
            idle_timeout,
            timeouts,
            attempts: AtomicU64::new(0),
            failures: Default::default(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn build(&self, client: &reqwest::Client, request: &TransportRequest) -> Result<reqwest::RequestBuilder, ClassifiedError> {
        let mut req = client
            .request(request.method.clone(), self.url(&request.path))
            .header(REQUEST_ID_HEADER, request.request_id.as_str());
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req = match &request.body {
            RequestBody::Empty => req,
            RequestBody::Json(v) => req.json(v),
            RequestBody::Multipart {
                field,
                file_name,
                content_type,
                data,
            } => {
                let part = Part::bytes(data.to_vec())
                    .file_name(file_name.clone())
                    .mime_str(content_type)
                    .map_err(|e| {
                        ClassifiedError::new(
                            ErrorClass::ClientError,
                            format!("invalid content type '{}': {}", content_type, e),
                        )
                    })?;
                req.multipart(Form::new().part(field.clone(), part))
            }
        };
        Ok(req)
    }

    async fn attempt(&self, request: &TransportRequest) -> Result<TransportResponse, ClassifiedError> {
        let client = self
            .client
            .load_full()
            .ok_or_else(|| ClassifiedError::new(ErrorClass::Unknown, "transport closed"))?;

        let _permit = match tokio::time::timeout(self.timeouts.pool, self.permits.clone().acquire_owned()).await {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => return Err(ClassifiedError::new(ErrorClass::Unknown, "transport closed")),
            Err(_) => return Err(ClassifiedError::timeout(TimeoutPhase::PoolWait, self.timeouts.pool)),
        };

        let req = self.build(&client, request)?;
        let resp = match tokio::time::timeout(self.timeouts.write, req.send()).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(ClassifiedError::from_reqwest(&e)),
            Err(_) => return Err(ClassifiedError::timeout(TimeoutPhase::Write, self.timeouts.write)),
        };

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = match tokio::time::timeout(self.timeouts.read, resp.bytes()).await {
            Ok(Ok(b)) => b,
            Ok(Err(e)) => {
                let mut err = ClassifiedError::from_reqwest(&e);
                if err.class == ErrorClass::TransportTimeout {
                    err.phase = Some(TimeoutPhase::Read);
                }
                return Err(err);
            }
            Err(_) => return Err(ClassifiedError::timeout(TimeoutPhase::Read, self.timeouts.read)),
        };

        if !(200..300).contains(&status) {
            return Err(ClassifiedError::from_response(status, &headers, &body));
        }
        let upstream_request_id = header_first(&headers, UPSTREAM_REQUEST_ID_HEADERS);
        Ok(TransportResponse {
            status,
            headers,
            body,
            attempts: 1,
            upstream_request_id,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, ClassifiedError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let res = self.attempt(request).await;
        match &res {
            Ok(resp) => debug!(
                request_id = request.request_id.as_str(),
                method = %request.method,
                path = request.path.as_str(),
                http_status = resp.status,
                upstream_request_id = resp.upstream_request_id.as_deref().unwrap_or(""),
                "upstream attempt succeeded"
            ),
            Err(e) => {
                self.failures[e.class.index()].fetch_add(1, Ordering::Relaxed);
                debug!(
                    request_id = request.request_id.as_str(),
                    method = %request.method,
                    path = request.path.as_str(),
                    error_class = e.class.name(),
                    phase = e.phase.map(|p| p.name()).unwrap_or(""),
                    "upstream attempt failed"
                );
            }
        }
        res
    }

    fn pool(&self) -> PoolSnapshot {
        let available = self.permits.available_permits().min(self.max_connections);
        PoolSnapshot {
            transport: self.name().to_string(),
            max_connections: self.max_connections,
            in_use: self.max_connections - available,
            available,
            max_idle_per_host: self.max_idle_per_host,
            idle_timeout_ms: self.idle_timeout.as_millis() as u64,
            connect_timeout_ms: self.timeouts.connect.as_millis() as u64,
            write_timeout_ms: self.timeouts.write.as_millis() as u64,
            read_timeout_ms: self.timeouts.read.as_millis() as u64,
            pool_timeout_ms: self.timeouts.pool.as_millis() as u64,
            total_timeout_ms: self.timeouts.total.as_millis() as u64,
            attempts_total: self.attempts.load(Ordering::Relaxed),
            failures: ErrorClass::ALL
                .iter()
                .map(|c| (c.name().to_string(), self.failures[c.index()].load(Ordering::Relaxed)))
                .filter(|(_, n)| *n > 0)
                .collect(),
            closed: self.client.load().is_none(),
        }
    }

    async fn close(&self) {
        // dropping the last client handle drops its idle connections
        self.client.store(None);
        self.permits.close();
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
