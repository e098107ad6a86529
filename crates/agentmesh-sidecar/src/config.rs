//! Sidecar configuration: defaults, optional TOML file, then environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | AGENTMESH_CONFIG | config/sidecar.toml | Path of the TOML file (skipped when absent). |
//! | AGENTMESH__AGENT_ID | agent-1 | Identifier of the co-located agent. |
//! | AGENTMESH__REGISTRY_URL | localhost:50051 | Directory service address. |
//! | AGENTMESH__LOCAL_PORT | 50052 | Loopback listener for the local agent (plaintext). |
//! | AGENTMESH__EXTERNAL_PORT | 50053 | Mesh-facing listener (mutual TLS). |
//! | AGENTMESH__APP_PORT | 50054 | Port of the local agent application. |
//! | AGENTMESH__CA_FILE | certs/ca-cert.pem | CA bundle trusted for peer certificates. |
//! | AGENTMESH__CERT_FILE | certs/server-cert.pem | Identity certificate chain. |
//! | AGENTMESH__KEY_FILE | certs/server-key.pem | Identity private key. |
//! | AGENTMESH__DIAL_TIMEOUT_SECS | 10 | Bound on opening any outbound connection. |
//! | AGENTMESH__SHUTDOWN_GRACE_SECS | 10 | Bound on draining sessions at shutdown. |

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const CONFIG_PATH_ENV: &str = "AGENTMESH_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/sidecar.toml";
const ENV_PREFIX: &str = "AGENTMESH";

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

/// Immutable settings of one sidecar process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarConfig {
    pub agent_id: String,
    pub registry_url: String,
    pub local_port: u16,
    pub external_port: u16,
    pub app_port: u16,
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent-1".to_string(),
            registry_url: "localhost:50051".to_string(),
            local_port: 50052,
            external_port: 50053,
            app_port: 50054,
            ca_file: PathBuf::from("certs/ca-cert.pem"),
            cert_file: PathBuf::from("certs/server-cert.pem"),
            key_file: PathBuf::from("certs/server-key.pem"),
            dial_timeout_secs: default_dial_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl SidecarConfig {
    /// Load from `AGENTMESH_CONFIG` (or `config/sidecar.toml`) and `AGENTMESH__*`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path), environment())
    }

    /// Load from an explicit file and environment source.
    pub fn load_from(path: &Path, env: config::Environment) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("agent_id", defaults.agent_id)?
            .set_default("registry_url", defaults.registry_url)?
            .set_default("local_port", i64::from(defaults.local_port))?
            .set_default("external_port", i64::from(defaults.external_port))?
            .set_default("app_port", i64::from(defaults.app_port))?
            .set_default("ca_file", path_default(&defaults.ca_file))?
            .set_default("cert_file", path_default(&defaults.cert_file))?
            .set_default("key_file", path_default(&defaults.key_file))?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let loaded: Self = builder.add_source(env).build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the sidecar cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.trim().is_empty() {
            return Err(ConfigError::Invalid("agent_id must not be empty".into()));
        }
        if self.registry_url.trim().is_empty() {
            return Err(ConfigError::Invalid("registry_url must not be empty".into()));
        }
        let ports = [
            ("local_port", self.local_port),
            ("external_port", self.external_port),
            ("app_port", self.app_port),
        ];
        if let Some((name, _)) = ports.iter().find(|(_, port)| *port == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        let distinct: HashSet<u16> = ports.iter().map(|(_, port)| *port).collect();
        if distinct.len() != ports.len() {
            return Err(ConfigError::Invalid(format!(
                "local_port ({}), external_port ({}) and app_port ({}) must differ",
                self.local_port, self.external_port, self.app_port
            )));
        }
        if self.dial_timeout_secs == 0 {
            return Err(ConfigError::Invalid("dial_timeout_secs must be non-zero".into()));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// `AGENTMESH__*` variables from the process environment.
pub fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

fn path_default(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
