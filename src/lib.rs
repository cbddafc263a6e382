pub mod access_log;
pub mod body;
pub mod config;
pub mod error;
pub mod fly_replay;
pub mod idle;
pub mod metrics;
pub mod pipeline;
pub mod proxy;
pub mod server;
pub mod startup;
pub mod static_files;
pub mod sticky;
pub mod tenant;
pub mod util;
pub mod websocket;

use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::access_log::{AccessLogSink, JsonLinesSink};
use crate::config::Config;
use crate::idle::IdleTracker;
use crate::pipeline::auth::{CredentialStore, EmptyCredentialStore};
use crate::pipeline::{PipelineState, RuntimeSnapshot};
use crate::tenant::TenantAppManager;
use crate::tenant::ports::PortAllocator;
use crate::util::PlatformIdentity;

/// Everything a running Navigator instance needs, wired up once at startup
/// and handed to the server harness (spec section 5).
pub struct Navigator {
    pub pipeline: Arc<PipelineState>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl Navigator {
    /// Builds the pipeline state from a loaded config: compiles routes and
    /// tenant descriptors, allocates the port pool, and wires a stdout
    /// JSON-lines access log sink (spec 10.2 / 10.3).
    pub fn new(config: Config, local_port: u16) -> anyhow::Result<Self> {
        Self::with_credential_store(config, local_port, Arc::new(EmptyCredentialStore))
    }

    pub fn with_credential_store(
        config: Config,
        local_port: u16,
        credential_store: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Self> {
        let ports = Arc::new(PortAllocator::new(config.ports.min, config.ports.max));
        let idle_cfg = config.idle.clone();
        let snapshot = RuntimeSnapshot::build(config)?;
        let tenants = TenantAppManager::new(snapshot.tenant_descriptors.clone(), ports, idle_cfg);

        let access_log: Arc<dyn AccessLogSink> = Arc::new(JsonLinesSink::new(std::io::stdout()));

        let pipeline = Arc::new(PipelineState {
            snapshot: ArcSwap::new(Arc::new(snapshot)),
            tenants,
            idle: IdleTracker::new(),
            identity: PlatformIdentity::from_env(),
            credential_store,
            access_log,
            local_port,
        });

        Ok(Self { pipeline, metrics_handle: None })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Reloads config into a fresh snapshot without dropping in-flight
    /// requests (spec 5 / design notes: reload barrier resolved via
    /// `ArcSwap`). The tenant set itself is not re-derived: Navigator
    /// treats tenants as fixed at process startup (see DESIGN.md).
    pub fn reload(&self, config: Config) -> anyhow::Result<()> {
        let snapshot = RuntimeSnapshot::build(config)?;
        self.pipeline.snapshot.store(Arc::new(snapshot));
        Ok(())
    }
}
