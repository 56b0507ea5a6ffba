//! TCP+TLS dial primitive.
//!
//! The session pins the server certificate when PEM material is configured,
//! and falls back to the webpki root set otherwise. The TLS server name is
//! chosen by the caller: the endpoint-provided domain for remotely resolved
//! hosts, the bare host name for fallback-list hosts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Error type for connection attempts.
#[derive(Debug)]
pub enum ConnectError {
    /// Connection timed out.
    Timeout,
    /// The TLS server name did not parse.
    InvalidServerName(String),
    /// Connection failed with an error message.
    Failed(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Timeout => write!(f, "connection timed out"),
            ConnectError::InvalidServerName(name) => {
                write!(f, "invalid server name {:?}", name)
            }
            ConnectError::Failed(msg) => write!(f, "connection failed: {}", msg),
        }
    }
}

impl std::error::Error for ConnectError {}

pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Build the TLS client configuration for the session.
///
/// With PEM material the peer is pinned to exactly those certificates;
/// without it the webpki root set is trusted. A PEM blob that yields no
/// certificates is an error.
pub fn tls_client_config(pem: Option<&[u8]>) -> Result<Arc<rustls::ClientConfig>, String> {
    install_crypto_provider();
    let root_store = match pem {
        Some(pem) => {
            let mut store = RootCertStore::empty();
            let certs = rustls_pemfile::certs(&mut &pem[..])
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("could not parse PEM material: {}", e))?;
            if certs.is_empty() {
                return Err("no certificates found in PEM material".to_string());
            }
            for cert in certs {
                store
                    .add(cert)
                    .map_err(|e| format!("could not use certificate from PEM material: {}", e))?;
            }
            store
        }
        None => RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    };
    Ok(Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    ))
}

/// Dial `host` (a `host:port` string) and complete the TLS handshake,
/// verifying the peer as `server_name`, all within `limit`.
pub async fn dial_host(
    host: &str,
    server_name: &str,
    tls: Arc<rustls::ClientConfig>,
    limit: Duration,
) -> Result<TlsStream<TcpStream>, ConnectError> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| ConnectError::InvalidServerName(server_name.to_string()))?;
    let attempt = async {
        let tcp = TcpStream::connect(host)
            .await
            .map_err(|e| ConnectError::Failed(e.to_string()))?;
        debug!(host = %host, "TCP connected, starting TLS handshake");
        let connector = TlsConnector::from(tls);
        connector
            .connect(name, tcp)
            .await
            .map_err(|e| ConnectError::Failed(format!("tls handshake: {}", e)))
    };
    tokio::time::timeout(limit, attempt)
        .await
        .map_err(|_| ConnectError::Timeout)?
}
