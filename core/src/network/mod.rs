//! Low-level networking: TCP+TLS dial and delivery-host resolution.

pub mod connect;
pub mod hosts;

pub use connect::{dial_host, tls_client_config, ConnectError};
pub use hosts::{parse_addr_spec, AddrSpec, HostEndpoint, HostGetter, HostsError, RemoteHosts};
