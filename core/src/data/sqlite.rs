//! Durable seen-state store backed by SQLite.
//!
//! Two tables: `levels` holds the per-channel top-level numbers, `seen_msgs`
//! the unicast message ids. Dedup relies on `INSERT OR IGNORE` so a message
//! id can only ever be recorded once, which also makes `filter_by_seen`
//! idempotent across restarts.

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use tracing::trace;

use super::{SeenState, SeenStateError};
use crate::protocol::Notification;

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn create_seen_tables(conn: &Connection) -> Result<(), SeenStateError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS levels (
             chan_id   TEXT PRIMARY KEY,
             top_level INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS seen_msgs (
             msg_id  TEXT PRIMARY KEY,
             seen_at INTEGER NOT NULL
         );",
    )
    .map_err(|e| SeenStateError::Database(e.to_string()))
}

/// [`SeenState`] over a SQLite database file.
pub struct SqliteSeenState {
    conn: Option<Connection>,
}

impl SqliteSeenState {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SeenStateError> {
        let conn = Connection::open(path).map_err(|e| SeenStateError::Database(e.to_string()))?;
        create_seen_tables(&conn)?;
        Ok(Self { conn: Some(conn) })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, SeenStateError> {
        let conn =
            Connection::open_in_memory().map_err(|e| SeenStateError::Database(e.to_string()))?;
        create_seen_tables(&conn)?;
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&self) -> Result<&Connection, SeenStateError> {
        self.conn.as_ref().ok_or(SeenStateError::Closed)
    }
}

impl SeenState for SqliteSeenState {
    fn set_level(&mut self, chan_id: &str, top_level: i64) -> Result<(), SeenStateError> {
        self.conn()?
            .execute(
                "INSERT INTO levels (chan_id, top_level) VALUES (?1, ?2)
                 ON CONFLICT(chan_id) DO UPDATE SET top_level = excluded.top_level",
                params![chan_id, top_level],
            )
            .map_err(|e| SeenStateError::Database(e.to_string()))?;
        Ok(())
    }

    fn get_all_levels(&self) -> Result<HashMap<String, i64>, SeenStateError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT chan_id, top_level FROM levels")
            .map_err(|e| SeenStateError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| SeenStateError::Database(e.to_string()))?;
        let mut levels = HashMap::new();
        for row in rows {
            let (chan_id, top_level) = row.map_err(|e| SeenStateError::Database(e.to_string()))?;
            levels.insert(chan_id, top_level);
        }
        Ok(levels)
    }

    fn filter_by_seen(
        &mut self,
        notifications: Vec<Notification>,
    ) -> Result<Vec<Notification>, SeenStateError> {
        let conn = self.conn.as_mut().ok_or(SeenStateError::Closed)?;
        let tx = conn
            .transaction()
            .map_err(|e| SeenStateError::Database(e.to_string()))?;
        let now = current_timestamp();
        let mut unseen = Vec::with_capacity(notifications.len());
        for notification in notifications {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO seen_msgs (msg_id, seen_at) VALUES (?1, ?2)",
                    params![notification.msg_id, now],
                )
                .map_err(|e| SeenStateError::Database(e.to_string()))?;
            if inserted > 0 {
                unseen.push(notification);
            } else {
                trace!(msg_id = %notification.msg_id, "dropping already-seen notification");
            }
        }
        tx.commit()
            .map_err(|e| SeenStateError::Database(e.to_string()))?;
        Ok(unseen)
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close();
        }
    }
}
