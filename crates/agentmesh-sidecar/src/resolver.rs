//! Directory record → dialable mesh address.

use std::fmt;

use tonic::transport::Uri;

use crate::directory::AgentDirectoryEntry;
use crate::error::SessionError;

/// Protocol binding every sidecar serves on its external listener.
pub const MESH_PROTOCOL_BINDING: &str = "grpc";

/// Where to reach a remote agent's sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshTarget {
    pub agent_id: String,
    /// `https://host:port`; sidecar-to-sidecar links are always mutual TLS.
    pub uri: String,
}

impl fmt::Display for MeshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.agent_id, self.uri)
    }
}

/// Address of the first interface bound to the mesh protocol.
pub fn resolve(entry: &AgentDirectoryEntry) -> Result<MeshTarget, SessionError> {
    let interface = entry
        .interfaces
        .iter()
        .find(|i| i.protocol_binding.eq_ignore_ascii_case(MESH_PROTOCOL_BINDING))
        .ok_or_else(|| SessionError::NoMeshInterface {
            agent_id: entry.agent_id.clone(),
            binding: MESH_PROTOCOL_BINDING.to_string(),
        })?;

    let uri = mesh_uri(&interface.url).ok_or_else(|| SessionError::InvalidAddress {
        agent_id: entry.agent_id.clone(),
        url: interface.url.clone(),
    })?;
    Ok(MeshTarget {
        agent_id: entry.agent_id.clone(),
        uri,
    })
}

/// Accepts `host:port` or a URL with any scheme; keeps only the authority.
fn mesh_uri(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return None;
    }
    let uri = format!("https://{authority}");
    let parsed: Uri = uri.parse().ok()?;
    parsed.port_u16()?;
    parsed.host().filter(|h| !h.is_empty())?;
    Some(uri)
}
