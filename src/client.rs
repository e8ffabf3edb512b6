//! Client gateway for the generation API.
//!
//! Keep the public surface small: four domain operations, a stats snapshot
//! and an explicit `close`. Implementation details are split into
//! submodules under `src/client/`.

pub mod builder;
pub mod core;
pub mod signals;
pub mod types;

pub use builder::GatewayBuilder;
pub use core::Gateway;
pub use signals::StatsSnapshot;
pub use types::{AssetRef, AssetUpload, JobId, JobParams, JobState, JobStatus, ResultRef};
