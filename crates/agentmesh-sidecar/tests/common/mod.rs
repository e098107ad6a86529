//! Shared fixtures: a throwaway PKI, a mock agent application, a mock
//! registry and helpers to run sidecars on ephemeral ports.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentmesh_sidecar::mesh::{
    message, part, task, CancelTaskRequest, GetTaskRequest, Message, Part,
};
use agentmesh_sidecar::registry::{
    registry_service_server::{RegistryService, RegistryServiceServer},
    AgentCard, AgentInterface, AgentSkill, ListAgentsRequest, ListAgentsResponse, RegistryEntry,
};
use agentmesh_sidecar::{
    AgentMeshService, AgentMeshServiceClient, AgentMeshServiceServer, Event, ListenerSource,
    Sidecar, SidecarConfig, SidecarError, StreamEvent, Task, TaskSendRequest, TaskStart,
    TaskStatusUpdate, TARGET_SKILL_METADATA,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::transport::{Certificate as TonicCertificate, Channel, ClientTlsConfig, Identity, Server};
use tonic::{Request, Response, Status, Streaming};

pub const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// PKI
// ---------------------------------------------------------------------------

pub struct IssuedIdentity {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub cert_pem: String,
    pub key_pem: String,
}

/// A CA and the identities it issues, written under a temp directory.
pub struct TestPki {
    dir: TempDir,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl TestPki {
    pub fn new(ca_name: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ca_name);
        params.distinguished_name = dn;
        let ca_cert = params.self_signed(&ca_key).unwrap();
        std::fs::write(dir.path().join("ca-cert.pem"), ca_cert.pem()).unwrap();
        Self {
            dir,
            ca_cert,
            ca_key,
        }
    }

    pub fn ca_file(&self) -> PathBuf {
        self.dir.path().join("ca-cert.pem")
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Leaf valid for `localhost` and `127.0.0.1`, usable as server and client.
    pub fn issue(&self, name: &str) -> IssuedIdentity {
        let key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        let cert_file = self.dir.path().join(format!("{name}-cert.pem"));
        let key_file = self.dir.path().join(format!("{name}-key.pem"));
        std::fs::write(&cert_file, cert.pem()).unwrap();
        std::fs::write(&key_file, key.serialize_pem()).unwrap();
        IssuedIdentity {
            cert_file,
            key_file,
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub fn task_start(text: &str) -> StreamEvent {
    StreamEvent {
        event: Some(Event::TaskStart(TaskStart {
            request: Some(TaskSendRequest {
                target_agent_id: "agent-b".into(),
                context_id: "ctx-1".into(),
                message: Some(Message {
                    message_id: format!("msg-{text}"),
                    role: message::Role::User as i32,
                    parts: vec![Part {
                        part: Some(part::Part::TextPart(text.into())),
                    }],
                    metadata: None,
                }),
                ..Default::default()
            }),
        })),
    }
}

pub fn status_update(state: task::State, text: &str) -> StreamEvent {
    StreamEvent {
        event: Some(Event::StatusUpdate(TaskStatusUpdate {
            task_id: "task-1".into(),
            status: state as i32,
            message: text.into(),
            timestamp: None,
            terminal: matches!(state, task::State::Completed | task::State::Failed),
        })),
    }
}

// ---------------------------------------------------------------------------
// Mock agent application
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    /// Answer every event with `COMPLETED "done"`; finish when the caller does.
    Complete,
    /// Answer every event with `WORKING`; keep the stream open while the caller does.
    Hold,
}

pub struct Seen {
    pub metadata: MetadataMap,
    pub event: StreamEvent,
}

#[derive(Clone)]
struct MockAgent {
    behaviour: Behaviour,
    seen: mpsc::UnboundedSender<Seen>,
}

#[tonic::async_trait]
impl AgentMeshService for MockAgent {
    type StreamTaskStream = ReceiverStream<Result<StreamEvent, Status>>;

    async fn stream_task(
        &self,
        request: Request<Streaming<StreamEvent>>,
    ) -> Result<Response<Self::StreamTaskStream>, Status> {
        let metadata = request.metadata().clone();
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let seen = self.seen.clone();
        let behaviour = self.behaviour;
        tokio::spawn(async move {
            while let Ok(Some(event)) = inbound.message().await {
                let _ = seen.send(Seen {
                    metadata: metadata.clone(),
                    event,
                });
                let reply = match behaviour {
                    Behaviour::Complete => status_update(task::State::Completed, "done"),
                    Behaviour::Hold => status_update(task::State::Working, "working"),
                };
                if tx.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn send_task(&self, _: Request<TaskSendRequest>) -> Result<Response<Task>, Status> {
        Err(Status::unimplemented("mock"))
    }

    async fn get_task(&self, _: Request<GetTaskRequest>) -> Result<Response<Task>, Status> {
        Err(Status::unimplemented("mock"))
    }

    async fn cancel_task(&self, _: Request<CancelTaskRequest>) -> Result<Response<()>, Status> {
        Err(Status::unimplemented("mock"))
    }
}

pub struct AgentApp {
    pub addr: SocketAddr,
    pub seen: mpsc::UnboundedReceiver<Seen>,
}

impl AgentApp {
    pub async fn next_seen(&mut self) -> Seen {
        tokio::time::timeout(WAIT, self.seen.recv())
            .await
            .expect("agent app saw nothing")
            .expect("agent app stopped")
    }

    /// True when nothing reaches the app within `window`.
    pub async fn stays_idle(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.seen.recv()).await.is_err()
    }
}

pub async fn start_agent_app(behaviour: Behaviour) -> AgentApp {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let agent = MockAgent {
        behaviour,
        seen: seen_tx,
    };
    tokio::spawn(async move {
        Server::builder()
            .add_service(AgentMeshServiceServer::new(agent))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    AgentApp { addr, seen }
}

// ---------------------------------------------------------------------------
// Mock registry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct MockRegistry {
    entries: Vec<RegistryEntry>,
    queries: Arc<Mutex<Vec<ListAgentsRequest>>>,
}

#[tonic::async_trait]
impl RegistryService for MockRegistry {
    async fn list_agents(
        &self,
        request: Request<ListAgentsRequest>,
    ) -> Result<Response<ListAgentsResponse>, Status> {
        let req = request.into_inner();
        self.queries.lock().unwrap().push(req.clone());
        Ok(Response::new(ListAgentsResponse {
            agents: self.entries.clone(),
            total: self.entries.len() as i32,
            limit: req.limit,
            offset: req.offset,
        }))
    }
}

pub struct RegistryHandle {
    pub addr: SocketAddr,
    queries: Arc<Mutex<Vec<ListAgentsRequest>>>,
}

impl RegistryHandle {
    pub fn queries(&self) -> Vec<ListAgentsRequest> {
        self.queries.lock().unwrap().clone()
    }
}

pub async fn start_registry(entries: Vec<RegistryEntry>) -> RegistryHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = MockRegistry {
        entries,
        ..Default::default()
    };
    let queries = Arc::clone(&registry.queries);
    tokio::spawn(async move {
        Server::builder()
            .add_service(RegistryServiceServer::new(registry))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    RegistryHandle { addr, queries }
}

pub fn registry_entry(agent_id: &str, skill: &str, interfaces: &[(&str, String)]) -> RegistryEntry {
    RegistryEntry {
        id: format!("entry-{agent_id}"),
        agent_id: agent_id.to_string(),
        verified: true,
        agent_card: Some(AgentCard {
            name: agent_id.to_string(),
            supported_interfaces: interfaces
                .iter()
                .map(|(binding, url)| AgentInterface {
                    protocol_binding: binding.to_string(),
                    url: url.clone(),
                })
                .collect(),
            skills: vec![AgentSkill {
                id: skill.to_string(),
                name: skill.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Sidecars
// ---------------------------------------------------------------------------

/// A port nothing listens on.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Address that accepts TCP connections and never answers on them.
pub async fn start_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

pub struct RunningSidecar {
    pub local: SocketAddr,
    pub external: SocketAddr,
    pub sidecar: Arc<Sidecar>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<(), SidecarError>>,
}

impl RunningSidecar {
    /// Cancel and wait for `run` to return.
    pub async fn stop(self) -> Result<(), SidecarError> {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("sidecar did not stop in time")
            .unwrap()
    }
}

pub fn sidecar_config(
    pki: &TestPki,
    name: &str,
    registry: SocketAddr,
    app_port: u16,
    local_port: u16,
    external_port: u16,
) -> SidecarConfig {
    let identity = pki.issue(name);
    SidecarConfig {
        agent_id: name.to_string(),
        registry_url: registry.to_string(),
        local_port,
        external_port,
        app_port,
        ca_file: pki.ca_file(),
        cert_file: identity.cert_file,
        key_file: identity.key_file,
        dial_timeout_secs: 5,
        shutdown_grace_secs: 5,
    }
}

pub async fn start_sidecar(
    pki: &TestPki,
    name: &str,
    registry: SocketAddr,
    app_port: Option<u16>,
) -> RunningSidecar {
    install_crypto_provider();
    let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let external_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = local_listener.local_addr().unwrap();
    let external = external_listener.local_addr().unwrap();
    let app_port = match app_port {
        Some(port) => port,
        None => unused_port().await,
    };

    let config = sidecar_config(pki, name, registry, app_port, local.port(), external.port());
    let sidecar = Arc::new(Sidecar::new(config).unwrap());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let sidecar = Arc::clone(&sidecar);
        let shutdown = shutdown.clone();
        async move {
            sidecar
                .run_on(
                    ListenerSource::Bound(local_listener),
                    ListenerSource::Bound(external_listener),
                    shutdown,
                )
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    RunningSidecar {
        local,
        external,
        sidecar,
        shutdown,
        handle,
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// Plaintext client, as the co-located agent connects to its sidecar.
pub async fn local_client(addr: SocketAddr) -> AgentMeshServiceClient<Channel> {
    AgentMeshServiceClient::connect(format!("http://{addr}"))
        .await
        .unwrap()
}

/// mTLS client, as a remote sidecar connects to an external listener.
pub async fn mesh_client(
    addr: SocketAddr,
    ca_pem: &str,
    identity: Option<&IssuedIdentity>,
) -> Result<AgentMeshServiceClient<Channel>, tonic::transport::Error> {
    install_crypto_provider();
    let mut tls = ClientTlsConfig::new().ca_certificate(TonicCertificate::from_pem(ca_pem));
    if let Some(id) = identity {
        tls = tls.identity(Identity::from_pem(&id.cert_pem, &id.key_pem));
    }
    let channel = Channel::from_shared(format!("https://{addr}"))
        .unwrap()
        .tls_config(tls)?
        .connect()
        .await?;
    Ok(AgentMeshServiceClient::new(channel))
}

/// Request whose stream yields `events` and then half-closes.
pub fn request_with(
    skill: Option<&str>,
    events: Vec<StreamEvent>,
) -> Request<tokio_stream::Iter<std::vec::IntoIter<StreamEvent>>> {
    let mut request = Request::new(tokio_stream::iter(events));
    if let Some(skill) = skill {
        request
            .metadata_mut()
            .insert(TARGET_SKILL_METADATA, skill.parse().unwrap());
    }
    request
}

/// Drain a response stream until it ends or faults.
pub async fn collect(mut stream: Streaming<StreamEvent>) -> (Vec<StreamEvent>, Option<Status>) {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(WAIT, stream.message()).await {
            Ok(Ok(Some(event))) => events.push(event),
            Ok(Ok(None)) => return (events, None),
            Ok(Err(status)) => return (events, Some(status)),
            Err(_) => panic!("response stream did not finish"),
        }
    }
}
