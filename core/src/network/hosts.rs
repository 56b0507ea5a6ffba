//! Delivery-host resolution.
//!
//! The server address spec is a single string: either an HTTP(S) URL of a
//! host endpoint that returns `{"domain": …, "hosts": […]}`, or a
//! `|`-delimited fallback list of `host:port` entries. The two forms are
//! mutually exclusive.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Parsed form of the server address spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrSpec {
    /// URL of a host endpoint to query for delivery hosts.
    Endpoint(String),
    /// Static fallback list of `host:port` entries.
    Fallback(Vec<String>),
}

/// Parse the server address spec into exactly one of its two forms.
pub fn parse_addr_spec(spec: &str) -> AddrSpec {
    if spec.starts_with("http://") || spec.starts_with("https://") {
        AddrSpec::Endpoint(spec.to_string())
    } else {
        AddrSpec::Fallback(spec.split('|').map(str::to_string).collect())
    }
}

/// Host list returned by the host endpoint.
///
/// The domain doubles as the TLS server name for the returned hosts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteHosts {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Errors from host resolution.
#[derive(Debug, Clone)]
pub enum HostsError {
    /// The HTTP client could not be built.
    ClientBuild(String),
    /// The request itself failed (connect, timeout, etc.).
    Request(String),
    /// The endpoint answered with a non-success status.
    Status(u16),
    /// The response body did not decode.
    Decode(String),
    /// The endpoint answered with an empty host list.
    NoHosts,
}

impl fmt::Display for HostsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostsError::ClientBuild(e) => write!(f, "could not build host endpoint client: {}", e),
            HostsError::Request(e) => write!(f, "host endpoint request failed: {}", e),
            HostsError::Status(code) => write!(f, "host endpoint returned status {}", code),
            HostsError::Decode(e) => write!(f, "host endpoint response did not decode: {}", e),
            HostsError::NoHosts => write!(f, "host endpoint returned no hosts"),
        }
    }
}

impl std::error::Error for HostsError {}

/// Something that can produce the current delivery host list.
#[async_trait]
pub trait HostGetter: Send + Sync {
    async fn get(&self) -> Result<RemoteHosts, HostsError>;
}

/// [`HostGetter`] backed by the HTTP host endpoint.
pub struct HostEndpoint {
    url: String,
    client: reqwest::Client,
}

impl HostEndpoint {
    pub fn new(url: impl Into<String>, limit: Duration) -> Result<Self, HostsError> {
        let client = reqwest::Client::builder()
            .timeout(limit)
            .build()
            .map_err(|e| HostsError::ClientBuild(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl HostGetter for HostEndpoint {
    async fn get(&self) -> Result<RemoteHosts, HostsError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| HostsError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(HostsError::Status(resp.status().as_u16()));
        }
        let remote: RemoteHosts = resp
            .json()
            .await
            .map_err(|e| HostsError::Decode(e.to_string()))?;
        if remote.hosts.is_empty() {
            return Err(HostsError::NoHosts);
        }
        debug!(domain = %remote.domain, hosts = remote.hosts.len(), "host endpoint answered");
        Ok(remote)
    }
}
