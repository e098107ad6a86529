//! Read-only client of the agent registry.
//!
//! The sidecar asks the registry once per outbound stream which agents
//! offer the requested skill. The channel is opened lazily, so a registry
//! that is down fails individual requests rather than startup.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, instrument};

use crate::error::{ConfigError, SessionError};
use crate::registry::{
    registry_service_client::RegistryServiceClient, AgentCard, ListAgentsRequest, RegistryEntry,
};

/// Page size requested from the registry.
pub const DEFAULT_PAGE_SIZE: i32 = 50;

/// One advertised endpoint of an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInterface {
    pub protocol_binding: String,
    pub url: String,
}

/// Read-only copy of a registry record.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDirectoryEntry {
    pub agent_id: String,
    pub name: String,
    pub interfaces: Vec<AgentInterface>,
    pub skills: Vec<String>,
    pub verified: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AgentDirectoryEntry {
    /// Case-insensitive match against the skill names and ids the agent advertises.
    pub fn offers_skill(&self, skill: &str) -> bool {
        self.skills.iter().any(|s| s.eq_ignore_ascii_case(skill))
    }
}

impl From<RegistryEntry> for AgentDirectoryEntry {
    fn from(entry: RegistryEntry) -> Self {
        let card = entry.agent_card.unwrap_or_default();
        let AgentCard {
            name,
            supported_interfaces,
            skills,
            ..
        } = card;
        Self {
            agent_id: entry.agent_id,
            name,
            interfaces: supported_interfaces
                .into_iter()
                .map(|i| AgentInterface {
                    protocol_binding: i.protocol_binding,
                    url: i.url,
                })
                .collect(),
            skills: skills
                .into_iter()
                .flat_map(|s| [s.name, s.id])
                .filter(|s| !s.is_empty())
                .collect(),
            verified: entry.verified,
            last_heartbeat: entry
                .last_heartbeat
                .and_then(|ts| DateTime::from_timestamp(ts.seconds, u32::try_from(ts.nanos).ok()?)),
            metadata: entry.metadata.map(struct_to_json).unwrap_or_default(),
        }
    }
}

/// Filter sent with each query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryQuery {
    pub skill: String,
    pub tags: Vec<String>,
    pub verified_only: bool,
    pub limit: i32,
}

impl DirectoryQuery {
    pub fn for_skill(skill: impl Into<String>) -> Self {
        Self {
            skill: skill.into(),
            limit: DEFAULT_PAGE_SIZE,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Candidate agents for a query, in registry order.
    async fn list_agents(&self, query: &DirectoryQuery)
        -> Result<Vec<AgentDirectoryEntry>, SessionError>;
}

/// First candidate that advertises `skill`.
pub fn select_candidate<'a>(
    entries: &'a [AgentDirectoryEntry],
    skill: &str,
) -> Result<&'a AgentDirectoryEntry, SessionError> {
    entries
        .iter()
        .find(|e| e.offers_skill(skill))
        .ok_or_else(|| SessionError::NoCandidate(skill.to_string()))
}

/// Registry reached over gRPC.
#[derive(Debug, Clone)]
pub struct GrpcDirectory {
    client: RegistryServiceClient<Channel>,
    addr: String,
}

impl GrpcDirectory {
    /// Prepare a lazily connected client. Connecting and every query are
    /// bounded by `timeout`. Must be called inside a tokio runtime.
    pub fn connect_lazy(addr: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let endpoint = Endpoint::from_shared(uri.clone()).map_err(|e| {
            ConfigError::InvalidDirectory {
                addr: addr.to_string(),
                reason: e.to_string(),
            }
        })?
        .connect_timeout(timeout)
        .timeout(timeout);
        Ok(Self {
            client: RegistryServiceClient::new(endpoint.connect_lazy()),
            addr: uri,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Directory for GrpcDirectory {
    #[instrument(skip(self), fields(registry = %self.addr))]
    async fn list_agents(
        &self,
        query: &DirectoryQuery,
    ) -> Result<Vec<AgentDirectoryEntry>, SessionError> {
        let request = ListAgentsRequest {
            limit: query.limit,
            offset: 0,
            tags: query.tags.clone(),
            skill: query.skill.clone(),
            verified: query.verified_only,
        };
        let response = self
            .client
            .clone()
            .list_agents(request)
            .await
            .map_err(SessionError::DirectoryUnavailable)?
            .into_inner();
        debug!(
            returned = response.agents.len(),
            total = response.total,
            "registry listing received"
        );
        Ok(response.agents.into_iter().map(Into::into).collect())
    }
}

fn struct_to_json(value: prost_types::Struct) -> serde_json::Map<String, serde_json::Value> {
    value
        .fields
        .into_iter()
        .map(|(k, v)| (k, value_to_json(v)))
        .collect()
}

fn value_to_json(value: prost_types::Value) -> serde_json::Value {
    use prost_types::value::Kind;
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::StructValue(s)) => serde_json::Value::Object(struct_to_json(s)),
        Some(Kind::ListValue(l)) => {
            serde_json::Value::Array(l.values.into_iter().map(value_to_json).collect())
        }
    }
}
