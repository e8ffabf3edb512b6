use crate::error_code::ErrorClass;
use crate::resilience::admission::AdmissionError;
use crate::resilience::priority::PriorityLevel;
use crate::transport::{ClassifiedError, TimeoutPhase};
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "admission.capacity")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "gateway_config", "env_override")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the gateway.
///
/// The first group of variants is what callers match on; the rest are
/// infrastructure failures (configuration, I/O, serialization).
#[derive(Debug, Error)]
pub enum Error {
    /// Admission timed out waiting for a slot. The upstream was never called.
    #[error("Overloaded: no {priority} slot within {waited_ms}ms")]
    Overloaded {
        priority: PriorityLevel,
        waited_ms: u64,
    },

    /// The upstream answered 429. Never retried internally.
    #[error("Quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Upstream unavailable after {attempts} attempt(s): HTTP {status:?}: {message}")]
    UpstreamUnavailable {
        status: Option<u16>,
        attempts: u32,
        message: String,
    },

    #[error("Transport timeout in {phase} phase after {attempts} attempt(s): {message}")]
    TransportTimeout {
        phase: TimeoutPhase,
        attempts: u32,
        message: String,
    },

    #[error("Invalid request (HTTP {status}): {message}")]
    InvalidRequest { status: u16, message: String },

    /// `wait_until_done` ran out of time while the job was still running.
    #[error("Poll timeout: job {job_id} still {last_status} after {waited_ms}ms")]
    PollTimeout {
        job_id: String,
        last_status: String,
        waited_ms: u64,
    },

    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Job {job_id} rejected: {message}")]
    JobRejected { job_id: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Gateway closed")]
    Closed,

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Admission error: {0}")]
    Admission(AdmissionError),

    #[error("Network transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {message}{}", format_context(.context))]
    Unknown {
        message: String,
        context: ErrorContext,
    },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new unknown error with structured context
    pub fn unknown_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Unknown {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Runtime { context, .. }
            | Error::Unknown { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Stable short code for logs and telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Overloaded { .. } => "overloaded",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::UpstreamUnavailable { .. } => "upstream_unavailable",
            Error::TransportTimeout { .. } => "transport_timeout",
            Error::InvalidRequest { .. } => "invalid_request",
            Error::PollTimeout { .. } => "poll_timeout",
            Error::JobFailed { .. } => "job_failed",
            Error::JobRejected { .. } => "job_rejected",
            Error::Cancelled => "cancelled",
            Error::Closed => "closed",
            Error::Configuration { .. } => "configuration",
            Error::Runtime { .. } => "runtime",
            Error::Admission(_) => "admission",
            Error::Transport(_) => "transport",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Unknown { .. } => "unknown",
        }
    }

    /// Whether the caller may reasonably try again later.
    ///
    /// The gateway has already spent its own retries by the time these surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Overloaded { .. }
                | Error::QuotaExceeded { .. }
                | Error::UpstreamUnavailable { .. }
                | Error::TransportTimeout { .. }
                | Error::PollTimeout { .. }
        )
    }

    /// Upstream class this error came from, if any.
    pub fn upstream_class(&self) -> Option<ErrorClass> {
        match self {
            Error::QuotaExceeded { .. } => Some(ErrorClass::RateLimited),
            Error::UpstreamUnavailable { .. } => Some(ErrorClass::ServerError),
            Error::TransportTimeout { .. } => Some(ErrorClass::TransportTimeout),
            Error::InvalidRequest { .. } => Some(ErrorClass::ClientError),
            _ => None,
        }
    }
}

impl From<ClassifiedError> for Error {
    fn from(e: ClassifiedError) -> Self {
        match e.class {
            ErrorClass::ClientError => Error::InvalidRequest {
                status: e.status.unwrap_or(400),
                message: e.message,
            },
            ErrorClass::RateLimited => Error::QuotaExceeded {
                message: e.message,
                retry_after_ms: e.retry_after.map(|d| d.as_millis() as u64),
            },
            ErrorClass::ServerError => Error::UpstreamUnavailable {
                status: e.status,
                attempts: e.attempts,
                message: e.message,
            },
            ErrorClass::TransportTimeout => Error::TransportTimeout {
                phase: e.phase.unwrap_or(TimeoutPhase::Total),
                attempts: e.attempts,
                message: e.message,
            },
            ErrorClass::Unknown => Error::unknown_with_context(
                e.message,
                ErrorContext::new()
                    .with_details(format!("attempts: {}", e.attempts))
                    .with_source("transport"),
            ),
        }
    }
}

impl From<AdmissionError> for Error {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::TimedOut {
                priority,
                waited_ms,
            } => Error::Overloaded {
                priority,
                waited_ms,
            },
            AdmissionError::Cancelled => Error::Cancelled,
            AdmissionError::Closed => Error::Closed,
            other => Error::Admission(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};
    use std::time::Duration;

    #[test]
    fn test_classified_errors_keep_their_kind() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("3"));
        let quota: Error = ClassifiedError::from_response(429, &headers, b"slow").into();
        assert!(matches!(
            quota,
            Error::QuotaExceeded {
                retry_after_ms: Some(3000),
                ..
            }
        ));

        let bad: Error = ClassifiedError::from_response(422, &HeaderMap::new(), b"no").into();
        assert!(matches!(bad, Error::InvalidRequest { status: 422, .. }));
        assert!(!bad.is_transient());

        let down: Error = ClassifiedError::from_response(503, &HeaderMap::new(), b"")
            .with_attempts(4)
            .into();
        assert!(matches!(
            down,
            Error::UpstreamUnavailable {
                attempts: 4,
                status: Some(503),
                ..
            }
        ));
        assert_eq!(down.code(), "upstream_unavailable");

        let slow: Error = ClassifiedError::timeout(TimeoutPhase::Connect, Duration::from_secs(1)).into();
        assert!(matches!(
            slow,
            Error::TransportTimeout {
                phase: TimeoutPhase::Connect,
                ..
            }
        ));
        assert!(slow.is_transient());
    }

    #[test]
    fn test_admission_timeout_is_overloaded() {
        let e: Error = AdmissionError::TimedOut {
            priority: PriorityLevel::High,
            waited_ms: 5,
        }
        .into();
        assert_eq!(e.code(), "overloaded");
        assert_eq!(e.to_string(), "Overloaded: no high slot within 5ms");
        assert!(matches!(Error::from(AdmissionError::Closed), Error::Closed));
    }

    #[test]
    fn test_context_display() {
        let e = Error::configuration_with_context(
            "bad",
            ErrorContext::new().with_field_path("admission.capacity"),
        );
        assert_eq!(e.to_string(), "Configuration error: bad (field: admission.capacity)");
    }
}
