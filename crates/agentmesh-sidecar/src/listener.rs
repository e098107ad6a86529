//! Dual listener manager.
//!
//! The local listener (loopback, plaintext) serves the co-located agent;
//! the external listener (all interfaces, mutual TLS) serves remote
//! sidecars. Both register the same [`MeshService`] and run under one
//! cancellation token: when either fails, the token is cancelled and the
//! other stops gracefully.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Server, ServerTlsConfig};
use tracing::{error, info, warn};

use crate::director::MeshService;
use crate::error::SidecarError;
use crate::identity::PeerIdentityLogger;
use crate::mesh::agent_mesh_service_server::AgentMeshServiceServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Local,
    External,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Local => f.write_str("local"),
            ListenerKind::External => f.write_str("external"),
        }
    }
}

/// Where an endpoint gets its socket: bind an address, or take one
/// already bound (ephemeral ports, inherited sockets).
#[derive(Debug)]
pub enum ListenerSource {
    Bind(SocketAddr),
    Bound(TcpListener),
}

impl ListenerSource {
    /// `127.0.0.1:port`, for the local listener.
    pub fn loopback(port: u16) -> Self {
        ListenerSource::Bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    /// `0.0.0.0:port`, for the external listener.
    pub fn any(port: u16) -> Self {
        ListenerSource::Bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    async fn open(self, kind: ListenerKind) -> Result<TcpListener, SidecarError> {
        match self {
            ListenerSource::Bound(listener) => Ok(listener),
            ListenerSource::Bind(addr) => {
                TcpListener::bind(addr)
                    .await
                    .map_err(|source| SidecarError::Bind {
                        listener: kind,
                        addr,
                        source,
                    })
            }
        }
    }
}

/// Run both endpoints until `group` is cancelled or one of them fails.
/// Returns the error that stopped the pair, if any. Once `group` is
/// cancelled the endpoints get `grace` to finish their in-flight calls.
pub async fn run_listeners(
    local: ListenerSource,
    external: ListenerSource,
    service: MeshService,
    tls: ServerTlsConfig,
    group: &CancellationToken,
    grace: Duration,
) -> Result<(), SidecarError> {
    let first_error = OnceLock::new();

    let local_endpoint = supervise(
        ListenerKind::Local,
        serve_local(local, service.clone(), group.clone()),
        group,
        &first_error,
    );
    let external_endpoint = supervise(
        ListenerKind::External,
        serve_external(external, service, tls, group.clone()),
        group,
        &first_error,
    );

    let both = async {
        tokio::join!(local_endpoint, external_endpoint);
    };
    let deadline = async {
        group.cancelled().await;
        tokio::time::sleep(grace).await;
    };
    tokio::select! {
        _ = both => {}
        _ = deadline => warn!(grace_secs = grace.as_secs(), "listeners did not stop within the grace period"),
    }

    match first_error.into_inner() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn supervise<F>(
    kind: ListenerKind,
    endpoint: F,
    group: &CancellationToken,
    first_error: &OnceLock<SidecarError>,
) where
    F: std::future::Future<Output = Result<(), SidecarError>>,
{
    match endpoint.await {
        Ok(()) => info!(listener = %kind, "listener stopped"),
        Err(err) => {
            error!(listener = %kind, error = %err, "listener failed; stopping the sidecar");
            let _ = first_error.set(err);
            group.cancel();
        }
    }
}

async fn serve_local(
    source: ListenerSource,
    service: MeshService,
    shutdown: CancellationToken,
) -> Result<(), SidecarError> {
    let listener = source.open(ListenerKind::Local).await?;
    log_listening(ListenerKind::Local, &listener);

    Server::builder()
        .add_service(AgentMeshServiceServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.cancelled().await
        })
        .await
        .map_err(|source| SidecarError::Serve {
            listener: ListenerKind::Local,
            source,
        })
}

async fn serve_external(
    source: ListenerSource,
    service: MeshService,
    tls: ServerTlsConfig,
    shutdown: CancellationToken,
) -> Result<(), SidecarError> {
    let listener = source.open(ListenerKind::External).await?;
    log_listening(ListenerKind::External, &listener);

    Server::builder()
        .tls_config(tls)
        .map_err(|source| SidecarError::Serve {
            listener: ListenerKind::External,
            source,
        })?
        .add_service(AgentMeshServiceServer::with_interceptor(
            service,
            PeerIdentityLogger,
        ))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.cancelled().await
        })
        .await
        .map_err(|source| SidecarError::Serve {
            listener: ListenerKind::External,
            source,
        })
}

fn log_listening(kind: ListenerKind, listener: &TcpListener) {
    match listener.local_addr() {
        Ok(addr) => info!(listener = %kind, addr = %addr, "listening"),
        Err(e) => warn!(listener = %kind, error = %e, "listening on unknown address"),
    }
}
