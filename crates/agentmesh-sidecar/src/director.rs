//! Session director: the `AgentMeshService` both listeners serve.
//!
//! Every accepted `StreamTask` is classified once, by transport alone:
//! a stream carrying TLS connection info arrived on the external listener
//! and is inbound (remote sidecar → local agent); a plaintext stream came
//! from the local agent and is outbound. The matching [`Route`] opens the
//! far leg and a [`Bridge`] relays between the two.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::metadata::MetadataMap;
use tonic::transport::server::{TcpConnectInfo, TlsConnectInfo};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::bridge::{Bridge, Duplex, ForwardError, Outlet};
use crate::config::SidecarConfig;
use crate::directory::{select_candidate, Directory, DirectoryQuery};
use crate::error::SessionError;
use crate::mesh::{
    agent_mesh_service_client::AgentMeshServiceClient, agent_mesh_service_server::AgentMeshService,
    CancelTaskRequest, GetTaskRequest, StreamEvent, Task, TaskSendRequest,
};
use crate::mtls::TlsMaterial;
use crate::resolver;

/// Metadata key naming the skill an outbound stream wants.
pub const TARGET_SKILL_METADATA: &str = "x-target-skill";

/// Per-direction buffer between a session's lanes and its streams.
const EVENT_BUFFER: usize = 64;

type MeshClient = AgentMeshServiceClient<Channel>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote sidecar → local agent, accepted on the external listener.
    Inbound,
    /// Local agent → remote agent, accepted on the local listener.
    Outbound,
}

impl Direction {
    pub fn of<T>(request: &Request<T>) -> Self {
        if request
            .extensions()
            .get::<TlsConnectInfo<TcpConnectInfo>>()
            .is_some()
        {
            Direction::Inbound
        } else {
            Direction::Outbound
        }
    }
}

/// Routing hint of an outbound stream.
pub fn routing_hint(metadata: &MetadataMap) -> Result<String, SessionError> {
    metadata
        .get(TARGET_SKILL_METADATA)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or(SessionError::MissingRoutingHint(TARGET_SKILL_METADATA))
}

/// Far leg ready to be opened.
pub struct FarLeg {
    client: MeshClient,
    peer: String,
}

/// Opens the far leg for one direction.
#[async_trait]
pub trait Route: Send + Sync {
    async fn open(&self, metadata: &MetadataMap) -> Result<FarLeg, SessionError>;
}

/// Local agent → directory lookup → remote sidecar over mutual TLS.
pub struct OutboundRoute {
    directory: Arc<dyn Directory>,
    tls: ClientTlsConfig,
    dial_timeout: Duration,
}

impl OutboundRoute {
    pub fn new(directory: Arc<dyn Directory>, tls: ClientTlsConfig, dial_timeout: Duration) -> Self {
        Self {
            directory,
            tls,
            dial_timeout,
        }
    }
}

#[async_trait]
impl Route for OutboundRoute {
    #[instrument(skip_all)]
    async fn open(&self, metadata: &MetadataMap) -> Result<FarLeg, SessionError> {
        let skill = routing_hint(metadata)?;
        let candidates = self
            .directory
            .list_agents(&DirectoryQuery::for_skill(&skill))
            .await?;
        let candidate = select_candidate(&candidates, &skill)?;
        let target = resolver::resolve(candidate)?;
        debug!(skill = %skill, target = %target, candidates = candidates.len(), "target resolved");

        let channel = dial(&target.uri, Some(&self.tls), self.dial_timeout).await?;
        Ok(FarLeg {
            client: MeshClient::new(channel),
            peer: target.to_string(),
        })
    }
}

/// Remote sidecar → local agent application over loopback plaintext.
pub struct InboundRoute {
    app_uri: String,
    dial_timeout: Duration,
}

impl InboundRoute {
    pub fn new(app_port: u16, dial_timeout: Duration) -> Self {
        Self {
            app_uri: format!("http://127.0.0.1:{app_port}"),
            dial_timeout,
        }
    }
}

#[async_trait]
impl Route for InboundRoute {
    #[instrument(skip_all)]
    async fn open(&self, _metadata: &MetadataMap) -> Result<FarLeg, SessionError> {
        let channel = dial(&self.app_uri, None, self.dial_timeout).await?;
        Ok(FarLeg {
            client: MeshClient::new(channel),
            peer: self.app_uri.clone(),
        })
    }
}

async fn dial(
    uri: &str,
    tls: Option<&ClientTlsConfig>,
    timeout: Duration,
) -> Result<Channel, SessionError> {
    let mut endpoint = Endpoint::from_shared(uri.to_string())
        .map_err(|e| SessionError::from_dial(uri, &e))?
        .connect_timeout(timeout);
    if let Some(tls) = tls {
        endpoint = endpoint
            .tls_config(tls.clone())
            .map_err(|e| SessionError::from_dial(uri, &e))?;
    }
    match tokio::time::timeout(timeout, endpoint.connect()).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(SessionError::from_dial(uri, &e)),
        Err(_) => Err(SessionError::Dial {
            addr: uri.to_string(),
            reason: format!("no connection within {}s", timeout.as_secs()),
        }),
    }
}

/// Session tasks of one sidecar run, governed by one cancellation token.
#[derive(Clone)]
pub struct Sessions {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Sessions {
    pub fn new(token: CancellationToken, tracker: TaskTracker) -> Self {
        Self { token, tracker }
    }

    fn spawn<F>(&self, session: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(session);
    }

    /// Sessions still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting sessions and wait for the running ones. Returns false
    /// when the grace period ran out first.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.token.cancel();
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }
}

struct Routes {
    inbound: InboundRoute,
    outbound: OutboundRoute,
}

/// The streaming service registered on both listeners.
#[derive(Clone)]
pub struct MeshService {
    routes: Arc<Routes>,
    sessions: Sessions,
}

impl MeshService {
    pub fn new(
        config: &SidecarConfig,
        tls: &TlsMaterial,
        directory: Arc<dyn Directory>,
        sessions: Sessions,
    ) -> Self {
        let routes = Routes {
            inbound: InboundRoute::new(config.app_port, config.dial_timeout()),
            outbound: OutboundRoute::new(directory, tls.client_tls_config(), config.dial_timeout()),
        };
        Self {
            routes: Arc::new(routes),
            sessions,
        }
    }

    fn route(&self, direction: Direction) -> &dyn Route {
        match direction {
            Direction::Inbound => &self.routes.inbound,
            Direction::Outbound => &self.routes.outbound,
        }
    }
}

#[tonic::async_trait]
impl AgentMeshService for MeshService {
    type StreamTaskStream = ReceiverStream<Result<StreamEvent, Status>>;

    async fn stream_task(
        &self,
        request: Request<Streaming<StreamEvent>>,
    ) -> Result<Response<Self::StreamTaskStream>, Status> {
        let direction = Direction::of(&request);
        let session_id = Uuid::new_v4();
        let span = info_span!("session", %session_id, ?direction);

        let opening = self
            .route(direction)
            .open(request.metadata())
            .instrument(span.clone());
        let far = tokio::select! {
            opened = opening => match opened {
                Ok(far) => far,
                Err(e) => {
                    warn!(parent: &span, error = %e, kind = ?e.kind(), "session rejected");
                    return Err(e.to_status());
                }
            },
            _ = self.sessions.token.cancelled() => {
                info!(parent: &span, "sidecar shutting down; session not opened");
                return Err(Status::cancelled("sidecar is shutting down"));
            }
        };
        info!(parent: &span, peer = %far.peer, "session opened");

        let metadata = request.metadata().clone();
        let near_source = request.into_inner().boxed();
        let (reply_tx, reply_rx) = mpsc::channel(EVENT_BUFFER);
        let (far_tx, far_rx) = mpsc::channel(EVENT_BUFFER);

        let mut far_request = Request::new(ReceiverStream::new(far_rx));
        *far_request.metadata_mut() = metadata;
        let FarLeg { mut client, .. } = far;
        // The far response is awaited inside the downstream lane, so the
        // caller's first events flow upstream while the peer sets up.
        let far_source = stream::once(async move {
            client
                .stream_task(far_request)
                .await
                .map(Response::into_inner)
        })
        .try_flatten()
        .boxed();

        let bridge = Bridge::new(
            Duplex::new("near", near_source, Outlet::Reply(reply_tx)),
            Duplex::new("far", far_source, Outlet::Request(far_tx)),
        );
        let token = self.sessions.token.child_token();
        self.sessions.spawn(
            async move {
                match bridge.run(&token).await {
                    Ok(summary) => info!(
                        upstream = summary.upstream,
                        downstream = summary.downstream,
                        "session completed"
                    ),
                    Err(ForwardError::Cancelled) => info!("session cancelled"),
                    Err(e) => warn!(error = %e, "session failed"),
                }
            }
            .instrument(span),
        );

        Ok(Response::new(ReceiverStream::new(reply_rx)))
    }

    async fn send_task(
        &self,
        _request: Request<TaskSendRequest>,
    ) -> Result<Response<Task>, Status> {
        Err(Status::unimplemented("SendTask is not implemented; use StreamTask"))
    }

    async fn get_task(&self, _request: Request<GetTaskRequest>) -> Result<Response<Task>, Status> {
        Err(Status::unimplemented("GetTask is not implemented; use StreamTask"))
    }

    async fn cancel_task(
        &self,
        _request: Request<CancelTaskRequest>,
    ) -> Result<Response<()>, Status> {
        Err(Status::unimplemented("CancelTask is not implemented; use StreamTask"))
    }
}
