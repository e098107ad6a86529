//! Peer identity on the external listener.

use rustls::pki_types::CertificateDer;
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::info;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Common name from a DER certificate's subject.
#[allow(clippy::let_and_return)]
pub fn common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    // The attribute iterator borrows `parsed` and must drop before it.
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned);
    cn
}

/// Logs the verified certificate identity of every call on the external
/// listener. Requests pass through untouched.
#[derive(Debug, Clone, Default)]
pub struct PeerIdentityLogger;

impl Interceptor for PeerIdentityLogger {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let peer = request
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match request.peer_certs() {
            Some(certs) => {
                for cert in certs.iter() {
                    let cn = common_name(cert);
                    info!(
                        peer = %peer,
                        identity = cn.as_deref().unwrap_or("<no CN>"),
                        "Request from verified peer"
                    );
                }
            }
            None => info!(peer = %peer, "Request without peer certificate"),
        }
        Ok(request)
    }
}
