//! 错误分类：将每个上游响应和传输异常映射到唯一的错误类别。
//!
//! Upstream failure classes.
//!
//! Every non-2xx response and every transport exception is mapped to exactly
//! one [`ErrorClass`]. The class decides whether the transport may retry the
//! call and which caller-facing [`crate::Error`] it eventually becomes.
//!
//! | Code  | Class            | Transient | Surfaces as                    |
//! |-------|------------------|-----------|--------------------------------|
//! | E1001 | client_error     | no        | `Error::InvalidRequest`        |
//! | E2001 | rate_limited     | no        | `Error::QuotaExceeded`         |
//! | E3001 | server_error     | yes       | `Error::UpstreamUnavailable`   |
//! | E3003 | transport_timeout| yes       | `Error::TransportTimeout`      |
//! | E9999 | unknown          | no        | `Error::Unknown`               |
//!
//! ```rust
//! use synthgate::error_code::ErrorClass;
//!
//! let class = ErrorClass::from_http_status(503).unwrap();
//! assert_eq!(class, ErrorClass::ServerError);
//! assert!(class.is_transient());
//! assert!(ErrorClass::from_http_status(204).is_none());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failed upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// E1001: any 4xx other than 429
    ClientError,
    /// E2001: explicit rate-limit rejection (429)
    RateLimited,
    /// E3001: upstream server error (5xx)
    ServerError,
    /// E3003: network-level timeout in any phase
    TransportTimeout,
    /// E9999: anything else (connection refused, malformed response, 1xx/3xx)
    Unknown,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 5] = [
        ErrorClass::ClientError,
        ErrorClass::RateLimited,
        ErrorClass::ServerError,
        ErrorClass::TransportTimeout,
        ErrorClass::Unknown,
    ];

    /// Returns the canonical code string (e.g., `"E3001"`).
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ClientError => "E1001",
            Self::RateLimited => "E2001",
            Self::ServerError => "E3001",
            Self::TransportTimeout => "E3003",
            Self::Unknown => "E9999",
        }
    }

    /// Returns the standard name (e.g., `"server_error"`).
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientError => "client_error",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::TransportTimeout => "transport_timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the failure may resolve itself on retry.
    ///
    /// Only timeouts and 5xx qualify. A 429 is never transient here; it goes
    /// straight back to the caller.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServerError | Self::TransportTimeout)
    }

    /// Returns the category: `"client"`, `"rate"`, `"server"`, or `"unknown"`.
    #[inline]
    pub fn category(&self) -> &'static str {
        match self {
            Self::ClientError => "client",
            Self::RateLimited => "rate",
            Self::ServerError | Self::TransportTimeout => "server",
            Self::Unknown => "unknown",
        }
    }

    /// Maps an HTTP status to its class. Returns `None` for 2xx.
    pub fn from_http_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(Self::RateLimited),
            400..=499 => Some(Self::ClientError),
            500..=599 => Some(Self::ServerError),
            _ => Some(Self::Unknown),
        }
    }

    /// Parses a class name as produced by [`ErrorClass::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::ClientError => 0,
            Self::RateLimited => 1,
            Self::ServerError => 2,
            Self::TransportTimeout => 3,
            Self::Unknown => 4,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
