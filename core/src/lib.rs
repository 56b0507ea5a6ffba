//! Herald Core
//!
//! Client-side push notification session: a long-lived, resilient TLS client
//! that discovers delivery hosts, keeps a connection to one of them alive,
//! multiplexes server-initiated traffic (broadcasts, unicasts, pings, cookie
//! updates, connection diagnostics), deduplicates against persisted
//! seen-state, and redials with jittered backoff whenever the connection or
//! the network goes away.
//!
//! # Module Structure
//!
//! - `session/`: session core (state machine, message pump) and the
//!   connection supervisor
//! - `protocol/`: wire messages and the framing codec
//! - `network/`: TCP+TLS dial and delivery-host resolution
//! - `data/`: seen-state store (in-memory and SQLite)
//! - `resilience/`: backoff schedule, jitter, single-use redialer
//! - `testing/`: in-process fakes (scripted protocol, TLS fixtures)
//!
//! # Quick Start
//!
//! ```ignore
//! use herald_core::{Session, SessionConfig, seen_state_for_path};
//! use tokio::sync::mpsc;
//!
//! let (broadcast_tx, mut broadcasts) = mpsc::channel(5);
//! let (unicast_tx, mut unicasts) = mpsc::channel(5);
//!
//! let config = SessionConfig::new(broadcast_tx, unicast_tx);
//! let seen = seen_state_for_path(None)?;
//! let session = Session::new("https://push.example.com/hosts", config, device_id, seen)?;
//!
//! session.keep_connection()?;
//! session.has_connectivity(true).await;
//!
//! while let Some(broadcast) = broadcasts.recv().await {
//!     println!("top level {}: {} payloads", broadcast.top_level, broadcast.decoded.len());
//! }
//! ```

pub mod data;
pub mod network;
pub mod protocol;
pub mod resilience;
pub mod session;
pub mod testing;

// Re-export the main API types for convenience
pub use data::{seen_state_for_path, MemorySeenState, SeenState, SeenStateError, SqliteSeenState};
pub use protocol::{
    ClientMessage, Notification, Protocol, ServerMessage, WireError, PROTOCOL_WIRE_VERSION,
};
pub use session::{
    AddressedNotification, AddresseeChecker, BroadcastNotification, Session, SessionConfig,
    SessionError, SessionState,
};
