use crate::client::signals::StatsSnapshot;
use crate::client::types::{
    AssetRef, AssetUpload, CreateJobResponse, JobId, JobParams, JobState, JobStatus,
    JobStatusResponse, ResultRef,
};
use crate::config::GatewayConfig;
use crate::resilience::admission::deadline_after;
use crate::resilience::{AdmissionController, PriorityLevel, SlotGuard};
use crate::telemetry::{CallEvent, EventSink, Operation};
use crate::transport::{retry, RequestBody, RetryPolicy, Transport, TransportRequest, TransportResponse};
use crate::{Error, ErrorContext, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Client gateway to the metered generation API.
///
/// Every upstream call goes acquire -> transport (with retry) -> release, and
/// the release happens on every exit path. Cloning is cheap and clones share
/// one admission controller and one connection pool.
#[derive(Clone)]
pub struct Gateway {
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) admission: Arc<AdmissionController>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) retry: RetryPolicy,
    pub(crate) events: Arc<dyn EventSink>,
}

impl Gateway {
    /// Gateway with the built-in HTTP transport and the configured backend.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        crate::client::GatewayBuilder::new().config(config).build()
    }

    pub fn builder() -> crate::client::GatewayBuilder {
        crate::client::GatewayBuilder::new()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn admission_timeout(&self) -> Duration {
        self.config.admission.admission_timeout()
    }

    pub async fn upload_asset(&self, asset: AssetUpload, priority: PriorityLevel) -> Result<AssetRef> {
        let request = TransportRequest::post(self.config.endpoints.upload_asset.as_str()).with_body(
            RequestBody::Multipart {
                field: "file".to_string(),
                file_name: asset.file_name,
                content_type: asset.content_type,
                data: asset.data,
            },
        );
        let resp = self
            .call(Operation::UploadAsset, priority, request, self.admission_timeout())
            .await?;
        let asset: AssetRef = resp.json()?;
        if asset.url.is_empty() {
            return Err(malformed("upload response has an empty asset_url"));
        }
        Ok(asset)
    }

    pub async fn create_job(&self, params: &JobParams, priority: PriorityLevel) -> Result<JobId> {
        let request = TransportRequest::post(self.config.endpoints.create_job.as_str())
            .with_json(serde_json::to_value(params)?);
        let resp = self
            .call(Operation::CreateJob, priority, request, self.admission_timeout())
            .await?;
        let body: CreateJobResponse = resp.json()?;
        if body.job_id.is_empty() {
            return Err(malformed("create job response has an empty job_id"));
        }
        debug!(
            job_id = body.job_id.as_str(),
            status = body.status.as_deref().unwrap_or(""),
            "job created"
        );
        Ok(JobId::new(body.job_id))
    }

    pub async fn get_status(&self, job_id: &JobId, priority: PriorityLevel) -> Result<JobStatus> {
        self.fetch_status(job_id, priority, Operation::GetStatus, self.admission_timeout())
            .await
    }

    async fn fetch_status(
        &self,
        job_id: &JobId,
        priority: PriorityLevel,
        operation: Operation,
        admission_timeout: Duration,
    ) -> Result<JobStatus> {
        let request = TransportRequest::get(self.config.endpoints.job_status_path(job_id.as_str()));
        let resp = self.call(operation, priority, request, admission_timeout).await?;
        let body: JobStatusResponse = resp.json()?;
        let state = match JobState::parse(&body.status) {
            Some(s) => s,
            None => {
                warn!(
                    job_id = job_id.as_str(),
                    status = body.status.as_str(),
                    "unrecognized job status, treating as processing"
                );
                JobState::Processing
            }
        };
        Ok(JobStatus {
            job_id: body.job_id.map(JobId::new).unwrap_or_else(|| job_id.clone()),
            state,
            raw_status: body.status,
            result_url: body.result_url,
            error: body.error,
        })
    }

    /// Poll until the job reaches a terminal state or `max_wait` elapses.
    ///
    /// Each poll takes a slot like any other call. `Failed` and `Rejected`
    /// return at once. Running out of time returns [`Error::PollTimeout`],
    /// whether the caller is waiting for a slot or a poll is still in flight.
    pub async fn wait_until_done(
        &self,
        job_id: &JobId,
        max_wait: Duration,
        priority: PriorityLevel,
    ) -> Result<ResultRef> {
        let polling = &self.config.polling;
        let started = Instant::now();
        let deadline = deadline_after(started, max_wait);
        let mut interval = Duration::from_millis(polling.interval_ms);
        let mut last_status = JobState::Created.name().to_string();
        let mut polls: u32 = 0;

        let poll_timeout = |last_status: String| Error::PollTimeout {
            job_id: job_id.to_string(),
            last_status,
            waited_ms: started.elapsed().as_millis() as u64,
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(poll_timeout(last_status));
            }
            let admission_timeout = self.admission_timeout().min(remaining);
            polls += 1;
            // A slow poll is dropped at the deadline; its slot guard releases the slot.
            let poll = self.fetch_status(job_id, priority, Operation::PollStatus, admission_timeout);
            let status = match tokio::time::timeout_at(deadline, poll).await {
                Ok(Ok(s)) => s,
                Ok(Err(Error::Overloaded { .. })) if Instant::now() >= deadline => {
                    return Err(poll_timeout(last_status));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        job_id = job_id.as_str(),
                        polls,
                        "status poll still in flight at max_wait, abandoning"
                    );
                    return Err(poll_timeout(last_status));
                }
            };

            match status.state {
                JobState::Done => {
                    let url = status.result_url.filter(|u| !u.is_empty()).ok_or_else(|| {
                        malformed(format!("job {} is done but has no result_url", job_id))
                    })?;
                    info!(
                        job_id = job_id.as_str(),
                        polls,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "job done"
                    );
                    return Ok(ResultRef {
                        job_id: job_id.clone(),
                        url,
                    });
                }
                JobState::Failed => {
                    return Err(Error::JobFailed {
                        job_id: job_id.to_string(),
                        message: status.error.unwrap_or_else(|| status.raw_status.clone()),
                    });
                }
                JobState::Rejected => {
                    return Err(Error::JobRejected {
                        job_id: job_id.to_string(),
                        message: status.error.unwrap_or_else(|| status.raw_status.clone()),
                    });
                }
                JobState::Created | JobState::Processing => {
                    last_status = status.raw_status;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(poll_timeout(last_status));
            }
            debug!(
                job_id = job_id.as_str(),
                status = last_status.as_str(),
                next_poll_ms = interval.min(remaining).as_millis() as u64,
                "job still running"
            );
            tokio::time::sleep(interval.min(remaining)).await;
            interval = polling.next_interval(interval);
        }
    }

    pub async fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            admission: self.admission.stats().await,
            transport: self.transport.pool(),
            retry: self.retry.snapshot(),
        }
    }

    /// Reject new and pending acquires and drop the connection pool.
    ///
    /// Calls already holding a slot finish their current attempt or fail with
    /// a transport error; their slots are still released.
    pub async fn close(&self) {
        self.admission.close().await;
        self.transport.close().await;
        if let Err(e) = self.events.close().await {
            debug!(error = %e, "event sink close failed");
        }
        info!("gateway closed");
    }

    /// One admitted upstream call.
    async fn call(
        &self,
        operation: Operation,
        priority: PriorityLevel,
        request: TransportRequest,
        admission_timeout: Duration,
    ) -> Result<TransportResponse> {
        let started = Instant::now();
        let token = match self.admission.acquire(priority, admission_timeout).await {
            Ok(t) => t,
            Err(e) => {
                let err = Error::from(e);
                self.record(CallEvent {
                    request_id: request.request_id.clone(),
                    operation,
                    priority,
                    waited_ms: started.elapsed().as_millis() as u64,
                    duration_ms: started.elapsed().as_millis() as u64,
                    attempts: 0,
                    outcome: err.code().to_string(),
                    http_status: None,
                    upstream_request_id: None,
                })
                .await;
                return Err(err);
            }
        };
        let waited = token.waited();
        let guard = SlotGuard::new(self.admission.clone(), token);

        let outcome = AssertUnwindSafe(retry::execute(self.transport.as_ref(), &self.retry, &request))
            .catch_unwind()
            .await;
        guard.release().await;
        let result = match outcome {
            Ok(r) => r,
            Err(panic) => {
                warn!(
                    operation = operation.name(),
                    request_id = request.request_id.as_str(),
                    "upstream call panicked; slot released"
                );
                std::panic::resume_unwind(panic);
            }
        };

        let (attempts, http_status, upstream_request_id) = match &result {
            Ok(resp) => (resp.attempts, Some(resp.status), resp.upstream_request_id.clone()),
            Err(e) => (e.attempts, e.status, None),
        };
        let result = result.map_err(Error::from);
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        self.record(CallEvent {
            request_id: request.request_id.clone(),
            operation,
            priority,
            waited_ms: waited.as_millis() as u64,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            outcome: outcome.to_string(),
            http_status,
            upstream_request_id,
        })
        .await;
        result
    }

    async fn record(&self, event: CallEvent) {
        if event.is_ok() {
            info!(
                operation = event.operation.name(),
                priority = event.priority.name(),
                request_id = event.request_id.as_str(),
                duration_ms = event.duration_ms,
                waited_ms = event.waited_ms,
                attempts = event.attempts,
                outcome = event.outcome.as_str(),
                "upstream call completed"
            );
        } else {
            warn!(
                operation = event.operation.name(),
                priority = event.priority.name(),
                request_id = event.request_id.as_str(),
                duration_ms = event.duration_ms,
                waited_ms = event.waited_ms,
                attempts = event.attempts,
                outcome = event.outcome.as_str(),
                http_status = event.http_status.unwrap_or(0),
                "upstream call failed"
            );
        }
        if let Err(e) = self.events.record(event).await {
            debug!(error = %e, "event sink rejected call event");
        }
    }
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::unknown_with_context(
        msg,
        ErrorContext::new().with_source("upstream_response"),
    )
}
