//! AgentMesh sidecar.
//!
//! Data-plane companion of every agent host. Terminates plaintext streams
//! from the co-located agent and mutual-TLS streams from remote sidecars,
//! decides per stream which way it travels, resolves remote agents through
//! the registry and relays `StreamTask` events between the two ends.

pub mod bridge;
pub mod config;
pub mod director;
pub mod directory;
pub mod error;
pub mod identity;
pub mod listener;
pub mod mtls;
pub mod resolver;
pub mod sidecar;

// Generated gRPC types (package agentmesh.mesh.v1).
#[allow(clippy::all, unreachable_pub)]
pub mod mesh {
    include!(concat!(env!("OUT_DIR"), "/agentmesh.mesh.v1.rs"));
}

impl mesh::StreamEvent {
    pub fn task_start(&self) -> Option<&mesh::TaskStart> {
        match &self.event {
            Some(mesh::stream_event::Event::TaskStart(start)) => Some(start),
            _ => None,
        }
    }

    pub fn status_update(&self) -> Option<&mesh::TaskStatusUpdate> {
        match &self.event {
            Some(mesh::stream_event::Event::StatusUpdate(update)) => Some(update),
            _ => None,
        }
    }

    pub fn artifact_update(&self) -> Option<&mesh::TaskArtifactUpdate> {
        match &self.event {
            Some(mesh::stream_event::Event::ArtifactUpdate(update)) => Some(update),
            _ => None,
        }
    }
}

// Generated registry client types (package agentmesh.registry.v1).
#[allow(clippy::all, unreachable_pub)]
pub mod registry {
    include!(concat!(env!("OUT_DIR"), "/agentmesh.registry.v1.rs"));
}

pub use bridge::{Bridge, BridgeSummary, Duplex, ForwardError, Outlet};
pub use config::SidecarConfig;
pub use director::{Direction, MeshService, TARGET_SKILL_METADATA};
pub use directory::{AgentDirectoryEntry, Directory, DirectoryQuery, GrpcDirectory};
pub use error::{ConfigError, ErrorKind, SessionError, SidecarError};
pub use listener::{ListenerKind, ListenerSource};
pub use mesh::{
    agent_mesh_service_client::AgentMeshServiceClient,
    agent_mesh_service_server::{AgentMeshService, AgentMeshServiceServer},
    stream_event::Event, StreamEvent, Task, TaskArtifactUpdate, TaskSendRequest, TaskStart,
    TaskStatusUpdate,
};
pub use mtls::TlsMaterial;
pub use sidecar::Sidecar;
