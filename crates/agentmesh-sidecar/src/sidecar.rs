//! Sidecar assembly: configuration, TLS material, directory and listeners.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::SidecarConfig;
use crate::director::{MeshService, Sessions};
use crate::directory::{Directory, GrpcDirectory};
use crate::error::SidecarError;
use crate::listener::{self, ListenerSource};
use crate::mtls::TlsMaterial;

pub struct Sidecar {
    config: Arc<SidecarConfig>,
    tls: Arc<TlsMaterial>,
    directory: Arc<dyn Directory>,
    sessions: TaskTracker,
}

impl Sidecar {
    /// Validate the config, load TLS material and prepare the registry
    /// client. Must be called inside a tokio runtime.
    pub fn new(config: SidecarConfig) -> Result<Self, SidecarError> {
        let directory = GrpcDirectory::connect_lazy(&config.registry_url, config.dial_timeout())?;
        Self::with_directory(config, Arc::new(directory))
    }

    /// Like [`Sidecar::new`] with a caller-supplied directory.
    pub fn with_directory(
        config: SidecarConfig,
        directory: Arc<dyn Directory>,
    ) -> Result<Self, SidecarError> {
        config.validate()?;
        let tls = TlsMaterial::load(&config.ca_file, &config.cert_file, &config.key_file)?;
        Ok(Self {
            config: Arc::new(config),
            tls: Arc::new(tls),
            directory,
            sessions: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    /// Sessions currently relaying.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Bind both listeners from the configured ports and serve until
    /// `shutdown` is cancelled or a listener fails.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SidecarError> {
        self.run_on(
            ListenerSource::loopback(self.config.local_port),
            ListenerSource::any(self.config.external_port),
            shutdown,
        )
        .await
    }

    /// Serve on the given listener sources. Returns once both listeners
    /// have stopped and the sessions have drained (bounded by the
    /// configured grace period).
    pub async fn run_on(
        &self,
        local: ListenerSource,
        external: ListenerSource,
        shutdown: CancellationToken,
    ) -> Result<(), SidecarError> {
        let group = shutdown.child_token();
        self.sessions.reopen();
        let sessions = Sessions::new(group.clone(), self.sessions.clone());
        let service = MeshService::new(
            &self.config,
            &self.tls,
            Arc::clone(&self.directory),
            sessions.clone(),
        );

        info!(
            agent_id = %self.config.agent_id,
            identity = self.tls.common_name().unwrap_or("<no CN>"),
            registry = %self.config.registry_url,
            app_port = self.config.app_port,
            "sidecar starting"
        );

        let grace = self.config.shutdown_grace();
        let result = listener::run_listeners(
            local,
            external,
            service,
            self.tls.server_tls_config(),
            &group,
            grace,
        )
        .await;

        let remaining = sessions.active();
        if !sessions.drain(grace).await {
            warn!(
                sessions = sessions.active(),
                grace_secs = grace.as_secs(),
                "sessions still running after the grace period"
            );
        } else {
            info!(drained = remaining, "sidecar stopped");
        }
        result
    }
}
