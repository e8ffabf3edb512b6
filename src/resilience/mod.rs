//! 准入控制模块：按优先级限制对外部 API 的并发调用数量。
//!
//! # Admission Control Module
//!
//! Bounds the number of concurrent calls to the metered upstream and decides
//! who goes next when callers are waiting.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`AdmissionController`] | `acquire` / `release` over a pluggable backend |
//! | [`PriorityLevel`] | `Low < Normal < High < Critical` |
//! | [`SlotToken`] / [`SlotGuard`] | one unit of outstanding concurrency, and its scoped owner |
//! | [`backend`] | [`LocalBackend`](backend::LocalBackend) and [`SharedBackend`](backend::SharedBackend) |
//!
//! ## Ordering
//!
//! - Never more than `capacity` tokens are outstanding.
//! - A waiting `Critical` caller is admitted before a `Low` caller that has
//!   been waiting longer (strict priority, not FIFO).
//! - Within one priority, callers are admitted in arrival order.
//! - A caller whose wait timed out or was cancelled is out of the queue and
//!   never receives a slot afterwards.
//!
//! ```rust
//! use synthgate::resilience::{AdmissionController, PriorityLevel};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let admission = AdmissionController::local(4);
//! let token = admission
//!     .acquire(PriorityLevel::High, Duration::from_secs(5))
//!     .await
//!     .expect("slot");
//! // ... call the upstream ...
//! admission.release(token).await.expect("release");
//! # }
//! ```

pub mod admission;
pub mod backend;
pub mod priority;

pub use admission::{AdmissionController, AdmissionError, AdmissionSnapshot, SlotGuard, SlotToken};
pub use backend::{Backend, BackendKind, BackendState};
pub use priority::{PriorityDepths, PriorityLevel};
