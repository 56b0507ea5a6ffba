//! Seen-state persistence.
//!
//! The session deduplicates what the server sends: broadcasts by the highest
//! top-level number seen per channel, unicasts by message id. Both facts live
//! behind the [`SeenState`] trait so the session can run against the
//! in-memory store or the durable SQLite one with identical semantics.

mod sqlite;

pub use sqlite::SqliteSeenState;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use crate::protocol::Notification;

/// Errors from the seen-state store.
#[derive(Debug, Clone)]
pub enum SeenStateError {
    Database(String),
    Closed,
}

impl fmt::Display for SeenStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeenStateError::Database(e) => write!(f, "database error: {}", e),
            SeenStateError::Closed => write!(f, "seen-state store is closed"),
        }
    }
}

impl std::error::Error for SeenStateError {}

/// Tracks what the session has already seen.
///
/// `filter_by_seen` records the ids of the notifications it returns, so an
/// identical second call returns nothing. `get_all_levels` reflects every
/// successful `set_level`.
pub trait SeenState: Send {
    /// Record the top-level number for a broadcast channel.
    fn set_level(&mut self, chan_id: &str, top_level: i64) -> Result<(), SeenStateError>;

    /// All recorded channel levels, for the connect handshake.
    fn get_all_levels(&self) -> Result<HashMap<String, i64>, SeenStateError>;

    /// Drop already-seen notifications, record the rest as seen, and return
    /// them in their original order.
    fn filter_by_seen(
        &mut self,
        notifications: Vec<Notification>,
    ) -> Result<Vec<Notification>, SeenStateError>;

    /// Release any underlying resources; later calls fail.
    fn close(&mut self);
}

/// Pick the store variant: durable when a path is configured, in-memory
/// otherwise.
pub fn seen_state_for_path(
    path: Option<&Path>,
) -> Result<Box<dyn SeenState + Send>, SeenStateError> {
    match path {
        Some(path) => Ok(Box::new(SqliteSeenState::open(path)?)),
        None => Ok(Box::new(MemorySeenState::new())),
    }
}

/// In-memory [`SeenState`] implementation.
#[derive(Debug, Default)]
pub struct MemorySeenState {
    levels: HashMap<String, i64>,
    seen_msgs: HashSet<String>,
    closed: bool,
}

impl MemorySeenState {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), SeenStateError> {
        if self.closed {
            Err(SeenStateError::Closed)
        } else {
            Ok(())
        }
    }
}

impl SeenState for MemorySeenState {
    fn set_level(&mut self, chan_id: &str, top_level: i64) -> Result<(), SeenStateError> {
        self.check_open()?;
        self.levels.insert(chan_id.to_string(), top_level);
        Ok(())
    }

    fn get_all_levels(&self) -> Result<HashMap<String, i64>, SeenStateError> {
        self.check_open()?;
        Ok(self.levels.clone())
    }

    fn filter_by_seen(
        &mut self,
        notifications: Vec<Notification>,
    ) -> Result<Vec<Notification>, SeenStateError> {
        self.check_open()?;
        Ok(notifications
            .into_iter()
            .filter(|n| self.seen_msgs.insert(n.msg_id.clone()))
            .collect())
    }

    fn close(&mut self) {
        self.levels.clear();
        self.seen_msgs.clear();
        self.closed = true;
    }
}
