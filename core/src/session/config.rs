//! Session configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{AddressedNotification, AddresseeChecker, BroadcastNotification};

/// Configuration for a push notification session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Per-message read/write budget during an exchange.
    pub exchange_timeout: Duration,

    /// TCP+TLS dial budget per host.
    pub connect_timeout: Duration,

    /// How long a host list fetched from the endpoint stays fresh.
    pub hosts_caching_expiry: Duration,

    /// After this long without an attempt, the host rotation starts over
    /// from the head of the list.
    pub expect_all_repaired: Duration,

    /// PEM-encoded certificate material pinning the TLS peer.
    /// When `None`, the webpki root set is trusted instead.
    pub pem: Option<Vec<u8>>,

    /// Opaque key/value map sent in the connect handshake.
    pub info: serde_json::Map<String, serde_json::Value>,

    /// Hook deciding which installed app a unicast notification addresses.
    /// When absent, notifications are addressed by their raw app id.
    pub addressee_checker: Option<Arc<dyn AddresseeChecker>>,

    /// Output channel for decoded broadcasts.
    pub broadcast_tx: mpsc::Sender<BroadcastNotification>,

    /// Output channel for addressed unicast notifications.
    pub notifications_tx: mpsc::Sender<AddressedNotification>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("exchange_timeout", &self.exchange_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("hosts_caching_expiry", &self.hosts_caching_expiry)
            .field("expect_all_repaired", &self.expect_all_repaired)
            .field("pem", &self.pem.as_ref().map(|_| "[PEM]"))
            .field("info", &self.info)
            .field(
                "addressee_checker",
                &self.addressee_checker.as_ref().map(|_| "[checker]"),
            )
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    /// Create a config with default timeouts and the given output channels.
    pub fn new(
        broadcast_tx: mpsc::Sender<BroadcastNotification>,
        notifications_tx: mpsc::Sender<AddressedNotification>,
    ) -> Self {
        Self {
            exchange_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            hosts_caching_expiry: Duration::from_secs(24 * 60 * 60),
            expect_all_repaired: Duration::from_secs(30 * 60),
            pem: None,
            info: serde_json::Map::new(),
            addressee_checker: None,
            broadcast_tx,
            notifications_tx,
        }
    }

    /// Set the per-message exchange timeout.
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Set the dial timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the host cache TTL.
    pub fn with_hosts_caching_expiry(mut self, expiry: Duration) -> Self {
        self.hosts_caching_expiry = expiry;
        self
    }

    /// Set the window after which the host rotation fully resets.
    pub fn with_expect_all_repaired(mut self, window: Duration) -> Self {
        self.expect_all_repaired = window;
        self
    }

    /// Pin the TLS peer to the given PEM certificate material.
    pub fn with_pem(mut self, pem: Vec<u8>) -> Self {
        self.pem = Some(pem);
        self
    }

    /// Set the opaque info map sent in the connect handshake.
    pub fn with_info(mut self, info: serde_json::Map<String, serde_json::Value>) -> Self {
        self.info = info;
        self
    }

    /// Set the addressee checker hook.
    pub fn with_addressee_checker(mut self, checker: Arc<dyn AddresseeChecker>) -> Self {
        self.addressee_checker = Some(checker);
        self
    }

    /// Configuration for tests: millisecond-scale timeouts, fresh bounded
    /// output channels. Returns the receivers alongside.
    pub fn for_testing() -> (
        Self,
        mpsc::Receiver<BroadcastNotification>,
        mpsc::Receiver<AddressedNotification>,
    ) {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(5);
        let (notifications_tx, notifications_rx) = mpsc::channel(5);
        let config = Self::new(broadcast_tx, notifications_tx)
            .with_exchange_timeout(Duration::from_millis(500))
            .with_connect_timeout(Duration::from_secs(2));
        (config, broadcast_rx, notifications_rx)
    }
}
