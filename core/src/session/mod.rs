//! The push notification session.
//!
//! A [`Session`] owns at most one delivery connection at a time and moves
//! through a small state machine while the supervisor keeps it alive:
//!
//! ```text
//! Pristine -> Disconnected -> Connected -> Started -> Running
//!                  ^                                    |
//!                  +----------- Error <-----------------+
//!                  |
//!               Shutdown (terminal)
//! ```
//!
//! `core` implements the session side (host resolution, connect, handshake,
//! message pump), `keepalive` the supervisor side (connectivity signals,
//! redial campaigns, teardown).

pub mod config;
pub mod core;
pub mod error;
pub mod keepalive;

pub use config::SessionConfig;
pub use error::SessionError;

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::rustls;
use tracing::debug;

use crate::data::SeenState;
use crate::network::connect::tls_client_config;
use crate::network::hosts::{parse_addr_spec, AddrSpec, HostEndpoint, HostGetter};
use crate::protocol::{FramedProtocol, NetStream, Notification, Protocol};
use crate::resilience::{RedialerHandle, TIMEOUTS};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Error,
    Pristine,
    Disconnected,
    Connected,
    Started,
    Running,
    Shutdown,
    Unknown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Error => "Error",
            SessionState::Pristine => "Pristine",
            SessionState::Disconnected => "Disconnected",
            SessionState::Connected => "Connected",
            SessionState::Started => "Started",
            SessionState::Running => "Running",
            SessionState::Shutdown => "Shutdown",
            SessionState::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// A decoded broadcast, ready for the surrounding client.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastNotification {
    pub top_level: i64,
    /// The object payloads of the broadcast; non-object payloads are dropped.
    pub decoded: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// A unicast notification paired with the app it addresses.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressedNotification {
    pub to: String,
    pub notification: Notification,
}

/// External hook deciding whether a notification's app is installed.
///
/// `check_for_addressee` returns the resolved app id, or `None` to drop the
/// notification (the checker owns any unregister signalling for those).
pub trait AddresseeChecker: Send + Sync {
    fn start_addressee_batch(&self);
    fn check_for_addressee(&self, notification: &Notification) -> Option<String>;
}

/// Constructor for the protocol codec layered over a fresh connection.
pub type Protocolator = Box<dyn Fn(Box<dyn NetStream>) -> Box<dyn Protocol + Send> + Send + Sync>;

/// Mutable session state, guarded by one lock. Only the task currently
/// driving the session (or the supervisor) touches it.
pub(crate) struct Shared {
    pub(crate) state: SessionState,
    pub(crate) cookie: String,
    pub(crate) should_delay: bool,
    pub(crate) last_conn: bool,
    pub(crate) delivery_hosts: Option<Vec<String>>,
    pub(crate) domain: Option<String>,
    pub(crate) hosts_fetched_at: Option<Instant>,
    pub(crate) try_host: usize,
    pub(crate) left_to_try: usize,
    pub(crate) last_attempt: Option<Instant>,
    pub(crate) last_auto_redial: Option<Instant>,
    pub(crate) ping_interval: Duration,
    pub(crate) redial_delays: Vec<Duration>,
    pub(crate) redial_delay_index: usize,
    pub(crate) retrier: Option<RedialerHandle>,
}

/// The client-side push notification session.
pub struct Session {
    pub(crate) device_id: String,
    pub(crate) config: SessionConfig,
    pub(crate) tls: Arc<rustls::ClientConfig>,
    pub(crate) fallback_hosts: Option<Vec<String>>,
    pub(crate) host_getter: StdMutex<Option<Arc<dyn HostGetter>>>,
    pub(crate) seen: StdMutex<Box<dyn SeenState + Send>>,
    pub(crate) protocolator: StdMutex<Option<Protocolator>>,
    pub(crate) conn: StdMutex<Option<Box<dyn NetStream>>>,
    pub(crate) proto: StdMutex<Option<Box<dyn Protocol + Send>>>,
    pub(crate) pump: StdMutex<Option<JoinHandle<()>>>,
    pub(crate) shared: StdMutex<Shared>,

    // supervisor plumbing
    pub(crate) err_tx: mpsc::Sender<SessionError>,
    pub(crate) err_rx: StdMutex<Option<mpsc::Receiver<SessionError>>>,
    pub(crate) done_tx: mpsc::Sender<u32>,
    pub(crate) done_rx: StdMutex<Option<mpsc::Receiver<u32>>>,
    pub(crate) conn_tx: mpsc::Sender<bool>,
    pub(crate) conn_rx: StdMutex<Option<mpsc::Receiver<bool>>>,
    pub(crate) stop_tx: mpsc::Sender<()>,
    pub(crate) stop_rx: StdMutex<Option<mpsc::Receiver<()>>>,
    pub(crate) supervisor: StdMutex<Option<JoinHandle<()>>>,
    pub(crate) supervisor_started: AtomicBool,

    // redial behaviour, swappable in tests
    pub(crate) redial_jitter: StdMutex<Box<dyn Fn(Duration) -> i64 + Send + Sync>>,
    #[allow(clippy::type_complexity)]
    pub(crate) redial_delay_hook: StdMutex<Option<Box<dyn Fn(&Session) -> Duration + Send + Sync>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session against the given server address spec.
    ///
    /// The spec is either a host endpoint URL or a `|`-separated fallback
    /// list; `seen` is the seen-state store the session will own.
    pub fn new(
        addr_spec: &str,
        config: SessionConfig,
        device_id: impl Into<String>,
        seen: Box<dyn SeenState + Send>,
    ) -> Result<Arc<Session>, SessionError> {
        let tls = tls_client_config(config.pem.as_deref()).map_err(SessionError::Config)?;
        let (host_getter, fallback_hosts): (Option<Arc<dyn HostGetter>>, Option<Vec<String>>) =
            match parse_addr_spec(addr_spec) {
                AddrSpec::Endpoint(url) => {
                    let endpoint = HostEndpoint::new(url, config.exchange_timeout)
                        .map_err(|e| SessionError::Config(e.to_string()))?;
                    (Some(Arc::new(endpoint)), None)
                }
                AddrSpec::Fallback(hosts) => (None, Some(hosts)),
            };

        let (err_tx, err_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        let (conn_tx, conn_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let protocolator: Protocolator = Box::new(|conn| Box::new(FramedProtocol::new(conn)));

        Ok(Arc::new(Session {
            device_id: device_id.into(),
            config,
            tls,
            fallback_hosts,
            host_getter: StdMutex::new(host_getter),
            seen: StdMutex::new(seen),
            protocolator: StdMutex::new(Some(protocolator)),
            conn: StdMutex::new(None),
            proto: StdMutex::new(None),
            pump: StdMutex::new(None),
            shared: StdMutex::new(Shared {
                state: SessionState::Pristine,
                cookie: String::new(),
                should_delay: false,
                last_conn: false,
                delivery_hosts: None,
                domain: None,
                hosts_fetched_at: None,
                try_host: 0,
                left_to_try: 0,
                last_attempt: None,
                last_auto_redial: None,
                ping_interval: Duration::ZERO,
                redial_delays: TIMEOUTS.to_vec(),
                redial_delay_index: 0,
                retrier: None,
            }),
            err_tx,
            err_rx: StdMutex::new(Some(err_rx)),
            done_tx,
            done_rx: StdMutex::new(Some(done_rx)),
            conn_tx,
            conn_rx: StdMutex::new(Some(conn_rx)),
            stop_tx,
            stop_rx: StdMutex::new(Some(stop_rx)),
            supervisor: StdMutex::new(None),
            supervisor_started: AtomicBool::new(false),
            redial_jitter: StdMutex::new(Box::new(crate::resilience::jitter)),
            redial_delay_hook: StdMutex::new(None),
        }))
    }

    // ===== observable attributes =====

    pub fn state(&self) -> SessionState {
        self.shared.lock().unwrap().state
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The ping interval declared by the server in the last handshake.
    pub fn ping_interval(&self) -> Duration {
        self.shared.lock().unwrap().ping_interval
    }

    /// Whether the next redial must pay a backoff cost.
    pub fn should_delay(&self) -> bool {
        self.shared.lock().unwrap().should_delay
    }

    /// The last connectivity signal the supervisor observed.
    pub fn last_connectivity(&self) -> bool {
        self.shared.lock().unwrap().last_conn
    }

    /// The opaque session token delivered via `setparams`.
    pub fn cookie(&self) -> String {
        self.shared.lock().unwrap().cookie.clone()
    }

    /// Forget the session cookie (e.g. on account changes).
    pub fn reset_cookie(&self) {
        self.set_cookie("");
    }

    // ===== internal state mutation =====

    pub(crate) fn set_state(&self, state: SessionState) {
        let old = {
            let mut shared = self.shared.lock().unwrap();
            std::mem::replace(&mut shared.state, state)
        };
        if old != state {
            debug!(from = %old, to = %state, "session state");
        }
    }

    pub(crate) fn set_should_delay(&self) {
        self.shared.lock().unwrap().should_delay = true;
    }

    pub(crate) fn clear_should_delay(&self) {
        self.shared.lock().unwrap().should_delay = false;
    }

    pub(crate) fn set_cookie(&self, cookie: &str) {
        self.shared.lock().unwrap().cookie = cookie.to_string();
    }

    pub(crate) fn set_last_conn(&self, online: bool) {
        self.shared.lock().unwrap().last_conn = online;
    }

    /// Drop the current connection and protocol, if any. When not called
    /// from the pump itself, a still-running pump is aborted first so the
    /// connection it owns actually closes.
    pub(crate) fn close_connection(&self, after_pump: bool) {
        if !after_pump {
            if let Some(pump) = self.pump.lock().unwrap().take() {
                pump.abort();
            }
        }
        let had_conn = self.conn.lock().unwrap().take().is_some();
        let had_proto = self.proto.lock().unwrap().take().is_some();
        if had_conn || had_proto {
            debug!(after_pump, "connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySeenState;
    use crate::testing::TEST_CERT_PEM;

    fn new_session(addr: &str) -> Arc<Session> {
        let (config, _b, _n) = SessionConfig::for_testing();
        Session::new(addr, config, "wah", Box::new(MemorySeenState::new())).unwrap()
    }

    #[test]
    fn test_state_display() {
        for (state, name) in [
            (SessionState::Error, "Error"),
            (SessionState::Pristine, "Pristine"),
            (SessionState::Disconnected, "Disconnected"),
            (SessionState::Connected, "Connected"),
            (SessionState::Started, "Started"),
            (SessionState::Running, "Running"),
            (SessionState::Shutdown, "Shutdown"),
            (SessionState::Unknown, "Unknown"),
        ] {
            assert_eq!(state.to_string(), name);
        }
    }

    #[test]
    fn test_new_session_plain_works() {
        let sess = new_session("foo:443");
        assert_eq!(
            sess.fallback_hosts,
            Some(vec!["foo:443".to_string()])
        );
        assert!(sess.host_getter.lock().unwrap().is_none());
        // the session starts happy, with the stock backoff schedule
        assert!(!sess.should_delay());
        assert_eq!(sess.shared.lock().unwrap().redial_delays, TIMEOUTS.to_vec());
        assert_eq!(sess.state(), SessionState::Pristine);
        assert_eq!(sess.device_id(), "wah");
    }

    #[test]
    fn test_new_session_host_endpoint_works() {
        let sess = new_session("http://foo/hosts");
        assert!(sess.host_getter.lock().unwrap().is_some());
        assert!(sess.fallback_hosts.is_none());
    }

    #[test]
    fn test_new_session_pem_works() {
        let (config, _b, _n) = SessionConfig::for_testing();
        let config = config.with_pem(TEST_CERT_PEM.as_bytes().to_vec());
        let sess = Session::new("", config, "wah", Box::new(MemorySeenState::new()));
        assert!(sess.is_ok());
    }

    #[test]
    fn test_new_session_bad_pem_fails() {
        let (config, _b, _n) = SessionConfig::for_testing();
        let config = config.with_pem(b"This is not the PEM you're looking for.".to_vec());
        let err = Session::new("", config, "wah", Box::new(MemorySeenState::new())).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_should_delay_accessors() {
        let sess = new_session("foo:443");
        assert!(!sess.should_delay());
        sess.set_should_delay();
        assert!(sess.should_delay());
        sess.clear_should_delay();
        assert!(!sess.should_delay());
    }

    #[test]
    fn test_cookie_accessors() {
        let sess = new_session("foo:443");
        assert_eq!(sess.cookie(), "");
        sess.set_cookie("COOKIE");
        assert_eq!(sess.cookie(), "COOKIE");
        sess.reset_cookie();
        assert_eq!(sess.cookie(), "");
    }

    #[test]
    fn test_set_state_transitions() {
        let sess = new_session("foo:443");
        sess.set_state(SessionState::Disconnected);
        assert_eq!(sess.state(), SessionState::Disconnected);
        sess.set_state(SessionState::Connected);
        assert_eq!(sess.state(), SessionState::Connected);
    }
}
