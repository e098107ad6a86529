//! Error taxonomy for the sidecar.
//!
//! Process-level failures ([`SidecarError`]) stop the sidecar. Per-stream
//! failures ([`SessionError`]) end one session and are reported to the
//! caller as a gRPC status; they never touch the listeners or other sessions.

use std::net::SocketAddr;
use std::path::PathBuf;

use tonic::Status;

use crate::bridge::ForwardError;
use crate::listener::ListenerKind;

/// Failure category, independent of the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Bind,
    Serve,
    Handshake,
    Discovery,
    Routing,
    Forward,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no PEM certificate found in {0}")]
    NoCertificate(PathBuf),
    #[error("no PEM private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("CA certificate in {path} is not a usable trust anchor: {reason}")]
    InvalidCa { path: PathBuf, reason: String },
    #[error("identity certificate and key are not usable: {0}")]
    InvalidIdentity(String),
    #[error("invalid directory address {addr}: {reason}")]
    InvalidDirectory { addr: String, reason: String },
    #[error("invalid setting: {0}")]
    Invalid(String),
    #[error("load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{listener} listener cannot bind {addr}: {source}")]
    Bind {
        listener: ListenerKind,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("{listener} listener failed: {source}")]
    Serve {
        listener: ListenerKind,
        #[source]
        source: tonic::transport::Error,
    },
}

impl SidecarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SidecarError::Config(_) => ErrorKind::Config,
            SidecarError::Bind { .. } => ErrorKind::Bind,
            SidecarError::Serve { .. } => ErrorKind::Serve,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("missing routing metadata '{0}'")]
    MissingRoutingHint(&'static str),
    #[error("agent {agent_id} advertises no '{binding}' interface")]
    NoMeshInterface { agent_id: String, binding: String },
    #[error("agent {agent_id} advertises an unusable address '{url}'")]
    InvalidAddress { agent_id: String, url: String },
    #[error("directory query failed: {0}")]
    DirectoryUnavailable(Status),
    #[error("no registered agent offers skill '{0}'")]
    NoCandidate(String),
    #[error("mutual TLS handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },
    #[error("dial {addr} failed: {reason}")]
    Dial { addr: String, reason: String },
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::MissingRoutingHint(_)
            | SessionError::NoMeshInterface { .. }
            | SessionError::InvalidAddress { .. } => ErrorKind::Routing,
            SessionError::DirectoryUnavailable(_) | SessionError::NoCandidate(_) => {
                ErrorKind::Discovery
            }
            SessionError::Handshake { .. } => ErrorKind::Handshake,
            SessionError::Dial { .. } | SessionError::Forward(_) => ErrorKind::Forward,
        }
    }

    /// Status reported to the near caller.
    pub fn to_status(&self) -> Status {
        match self {
            SessionError::MissingRoutingHint(_) => Status::invalid_argument(self.to_string()),
            SessionError::NoMeshInterface { .. } | SessionError::InvalidAddress { .. } => {
                Status::failed_precondition(self.to_string())
            }
            SessionError::DirectoryUnavailable(_) => Status::unavailable(self.to_string()),
            SessionError::NoCandidate(_) => Status::not_found(self.to_string()),
            SessionError::Handshake { .. } | SessionError::Dial { .. } => {
                Status::unavailable(self.to_string())
            }
            SessionError::Forward(err) => err.to_status(),
        }
    }

    /// Classify a failed dial: anything carrying a rustls error in its source
    /// chain is a handshake failure, everything else a plain dial failure.
    pub fn from_dial(addr: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        let reason = error_chain(err);
        let mut cause = Some(err);
        while let Some(e) = cause {
            if e.downcast_ref::<rustls::Error>().is_some() {
                return SessionError::Handshake {
                    addr: addr.to_string(),
                    reason,
                };
            }
            if let Some(io) = e.downcast_ref::<std::io::Error>() {
                if io
                    .get_ref()
                    .is_some_and(|inner| inner.downcast_ref::<rustls::Error>().is_some())
                {
                    return SessionError::Handshake {
                        addr: addr.to_string(),
                        reason,
                    };
                }
            }
            cause = e.source();
        }
        SessionError::Dial {
            addr: addr.to_string(),
            reason,
        }
    }
}

impl From<SessionError> for Status {
    fn from(err: SessionError) -> Self {
        err.to_status()
    }
}

/// Flatten an error and its sources into one line for logs and statuses.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cause = err.source();
    while let Some(e) = cause {
        let text = e.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        cause = e.source();
    }
    out
}
