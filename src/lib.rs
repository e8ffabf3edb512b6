//! # synthgate
//!
//! 面向计费型生成 API（视频/素材合成）的优先级准入控制与弹性客户端网关。
//!
//! Priority admission control and a resilient client gateway for metered,
//! rate-limited generation APIs (upload an asset, create a job, poll until done).
//!
//! ## Overview
//!
//! The upstream charges per call, enforces a request-rate ceiling and can take
//! tens of seconds per job. This crate bounds how many calls are in flight,
//! orders waiting callers by priority, retries only what is worth retrying,
//! and never leaks a reserved slot, whether a call succeeds, fails, times out,
//! panics or is cancelled.
//!
//! ## Key Features
//!
//! - **Gateway**: [`Gateway`] exposes `upload_asset`, `create_job`, `get_status`,
//!   `wait_until_done`, `stats` and `close`
//! - **Admission control**: strict priority, FIFO within a priority, via [`resilience`]
//! - **Backends**: in-process or shared across instances with lease expiry
//! - **Transport**: pooled HTTP with phased timeouts and an explicit [`transport::RetryPolicy`]
//! - **Telemetry**: one [`telemetry::CallEvent`] per call to an injectable sink
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use synthgate::{AssetUpload, Gateway, GatewayConfig, JobParams, PriorityLevel};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> synthgate::Result<()> {
//!     let mut config = GatewayConfig::default();
//!     config.base_url = "https://api.example.com/v1".into();
//!     config.apply_env_overrides()?;
//!     let gateway = Gateway::new(config)?;
//!
//!     let image = gateway
//!         .upload_asset(AssetUpload::new("face.png", "image/png", vec![0u8; 16]), PriorityLevel::Normal)
//!         .await?;
//!     let job = gateway
//!         .create_job(&JobParams::new().with_asset("image", &image), PriorityLevel::Normal)
//!         .await?;
//!     let result = gateway
//!         .wait_until_done(&job, Duration::from_secs(300), PriorityLevel::Normal)
//!         .await?;
//!     println!("{}", result.url);
//!
//!     gateway.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Gateway, builder, domain types, stats snapshot |
//! | [`config`] | YAML/env configuration and validation |
//! | [`resilience`] | Admission controller, priorities, backends |
//! | [`transport`] | HTTP transport, error classification, retry policy |
//! | [`error_code`] | Upstream failure classes |
//! | [`telemetry`] | Call events and sinks |

pub mod client;
pub mod config;
pub mod error_code;
pub mod resilience;
pub mod telemetry;
pub mod transport;

// Re-export main types for convenience
pub use client::{
    AssetRef, AssetUpload, Gateway, GatewayBuilder, JobId, JobParams, JobState, JobStatus,
    ResultRef, StatsSnapshot,
};
pub use config::GatewayConfig;
pub use error_code::ErrorClass;
pub use resilience::{AdmissionController, BackendKind, PriorityLevel, SlotGuard, SlotToken};
pub use telemetry::{CallEvent, EventSink};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
