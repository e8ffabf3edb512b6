//! 遥测模块：每次网关调用产生一个结构化事件，投递到可注入的事件接收器。
//!
//! Telemetry Module.
//!
//! Every gateway call produces one [`CallEvent`]. The gateway always logs it
//! through `tracing`; applications that want the events as data (metrics
//! exporters, tests) inject an [`EventSink`]. Nothing is collected unless a
//! sink is installed.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CallEvent`] | operation, priority, timings, attempts and outcome of one call |
//! | [`EventSink`] | trait for event destinations |
//! | [`NoopEventSink`] | default sink (drops everything) |
//! | [`InMemoryEventSink`] | bounded in-memory sink for testing |
//! | [`CompositeEventSink`] | fan-out to several sinks |

use crate::resilience::priority::PriorityLevel;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Gateway operation a call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    UploadAsset,
    CreateJob,
    GetStatus,
    /// One status poll issued by `wait_until_done`.
    PollStatus,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadAsset => "upload_asset",
            Self::CreateJob => "create_job",
            Self::GetStatus => "get_status",
            Self::PollStatus => "poll_status",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One upstream call as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub request_id: String,
    pub operation: Operation,
    pub priority: PriorityLevel,
    /// Time spent waiting for admission.
    pub waited_ms: u64,
    /// Acquire through release.
    pub duration_ms: u64,
    /// Transport attempts; 0 if the call was never admitted.
    pub attempts: u32,
    /// `"ok"` or an [`Error::code`](crate::Error::code).
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_request_id: Option<String>,
}

impl CallEvent {
    pub fn is_ok(&self) -> bool {
        self.outcome == "ok"
    }
}

/// Destination for call events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: CallEvent) -> Result<()>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// No-op sink (always available).
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn record(&self, _: CallEvent) -> Result<()> {
        Ok(())
    }
}

/// Returns a no-op event sink.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopEventSink)
}

/// In-memory sink for testing. Keeps the most recent `max_events`.
pub struct InMemoryEventSink {
    events: RwLock<VecDeque<CallEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            max_events: max.max(1),
        }
    }
    pub fn events(&self) -> Vec<CallEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
    pub fn events_for(&self, operation: Operation) -> Vec<CallEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.operation == operation)
            .cloned()
            .collect()
    }
    pub fn clear(&self) {
        self.events.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn record(&self, event: CallEvent) -> Result<()> {
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        events.push_back(event);
        while events.len() > self.max_events {
            events.pop_front();
        }
        Ok(())
    }
}

/// Composite sink for multiple destinations.
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for CompositeEventSink {
    async fn record(&self, event: CallEvent) -> Result<()> {
        for s in &self.sinks {
            let _ = s.record(event.clone()).await;
        }
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        for s in &self.sinks {
            let _ = s.close().await;
        }
        Ok(())
    }
}
