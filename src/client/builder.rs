use crate::client::core::Gateway;
use crate::config::{GatewayConfig, MEMORY_SCHEME};
use crate::resilience::backend::{Backend, LocalBackend, MemorySharedStore, SharedBackend, SharedStore};
use crate::resilience::{AdmissionController, BackendKind};
use crate::telemetry::EventSink;
use crate::transport::{HttpTransport, Transport};
use crate::{Error, ErrorContext, Result};
use std::sync::Arc;
use tracing::info;

/// Builder for [`Gateway`].
///
/// Everything is optional: by default the gateway uses the configured
/// backend, the built-in HTTP transport and a no-op event sink.
pub struct GatewayBuilder {
    config: GatewayConfig,
    transport: Option<Arc<dyn Transport>>,
    backend: Option<Arc<dyn Backend>>,
    shared_store: Option<Arc<dyn SharedStore>>,
    events: Arc<dyn EventSink>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            transport: None,
            backend: None,
            shared_store: None,
            events: crate::telemetry::noop_sink(),
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the HTTP transport (tests, custom clients).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use this backend instead of building one from the configuration.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Store used when the configured backend is `shared`.
    ///
    /// Gateways given the same store share one ceiling. Without an injected
    /// store only `memory://` endpoints are accepted.
    pub fn shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.shared_store = Some(store);
        self
    }

    /// Inject an event sink. Default is a no-op sink.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn build(self) -> Result<Gateway> {
        self.config.validate()?;

        let backend = match self.backend {
            Some(b) => b,
            None => build_backend(&self.config, self.shared_store)?,
        };

        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => {
                self.config.validate_base_url()?;
                Arc::new(HttpTransport::new(&self.config)?)
            }
        };

        info!(
            backend = backend.name(),
            capacity = backend.capacity(),
            transport = transport.name(),
            max_retries = self.config.retry.max_retries,
            "gateway ready"
        );

        Ok(Gateway {
            retry: self.config.retry.policy(),
            admission: Arc::new(AdmissionController::new(backend)),
            config: Arc::new(self.config),
            transport,
            events: self.events,
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn build_backend(
    config: &GatewayConfig,
    injected: Option<Arc<dyn SharedStore>>,
) -> Result<Arc<dyn Backend>> {
    let admission = &config.admission;
    match admission.backend {
        BackendKind::Local => Ok(Arc::new(LocalBackend::new(admission.capacity))),
        BackendKind::Shared => {
            let store = match injected {
                Some(store) => store,
                None => {
                    let endpoint = admission.shared_backend_endpoint.as_deref().unwrap_or("");
                    if !endpoint.starts_with(MEMORY_SCHEME) {
                        return Err(Error::configuration_with_context(
                            format!("no store available for shared backend endpoint '{}'", endpoint),
                            ErrorContext::new()
                                .with_field_path("admission.shared_backend_endpoint")
                                .with_details("inject a SharedStore or use a memory:// endpoint"),
                        ));
                    }
                    Arc::new(MemorySharedStore::new()) as Arc<dyn SharedStore>
                }
            };
            Ok(Arc::new(SharedBackend::new(store, admission.shared_backend())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_build_uses_local_backend() {
        let gw = GatewayBuilder::new().build().unwrap();
        assert_eq!(gw.admission().backend_name(), "local");
        assert_eq!(gw.admission().capacity(), 10);
    }

    #[test]
    fn test_shared_memory_endpoint() {
        let mut cfg = GatewayConfig::default();
        cfg.admission.backend = BackendKind::Shared;
        cfg.admission.shared_backend_endpoint = Some("memory://farm".into());
        let gw = GatewayBuilder::new().config(cfg).build().unwrap();
        assert_eq!(gw.admission().backend_name(), "shared");
    }

    #[test]
    fn test_unknown_shared_scheme_needs_a_store() {
        let mut cfg = GatewayConfig::default();
        cfg.admission.backend = BackendKind::Shared;
        cfg.admission.shared_backend_endpoint = Some("redis://cache:6379".into());
        let err = GatewayBuilder::new().config(cfg.clone()).build().err().unwrap();
        assert!(matches!(err, Error::Configuration { .. }));

        let gw = GatewayBuilder::new()
            .config(cfg)
            .shared_store(Arc::new(MemorySharedStore::new()))
            .build()
            .unwrap();
        assert_eq!(gw.admission().backend_name(), "shared");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut cfg = GatewayConfig::default();
        cfg.admission.capacity = 0;
        assert!(GatewayBuilder::new().config(cfg).build().is_err());
    }
}
