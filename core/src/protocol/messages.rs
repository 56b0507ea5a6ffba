//! Typed wire messages.
//!
//! Server-to-client traffic decodes into a single permissive [`ServerMessage`]
//! envelope: every field is defaulted, so one decode exposes the payload for
//! whatever the `"T"` discriminator says, and unknown discriminators can be
//! skipped without a decode error. Client-to-server traffic is the tagged
//! [`ClientMessage`] enum.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Channel id of the system broadcast channel.
pub const SYSTEM_CHANNEL_ID: &str = "0";

/// ConnBroken reason sent when the server decides we dialed the wrong host.
pub const BROKEN_HOST_MISMATCH: &str = "host-mismatch";

/// A single unicast notification addressed to one device+app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub app_id: String,
    pub msg_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Parameters delivered inside a `connack`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnAckParams {
    /// Interval between server pings, as a duration string (e.g. `"10ms"`).
    #[serde(default)]
    pub ping_interval: String,
}

/// Envelope for any server-initiated message.
///
/// Dispatch on [`msg_type`](Self::msg_type); the remaining fields are the
/// union of all server message payloads and default to empty when absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    #[serde(rename = "T")]
    pub msg_type: String,
    // broadcast
    pub app_id: String,
    pub chan_id: String,
    pub top_level: i64,
    pub payloads: Vec<serde_json::Value>,
    // notifications
    pub notifications: Vec<Notification>,
    // warn / connwarn / connbroken
    pub reason: String,
    // setparams
    pub set_cookie: String,
    // connack
    pub params: Option<ConnAckParams>,
}

/// A client-to-server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "T")]
pub enum ClientMessage {
    #[serde(rename = "connect", rename_all = "camelCase")]
    Connect {
        device_id: String,
        levels: HashMap<String, i64>,
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        info: serde_json::Map<String, serde_json::Value>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        cookie: String,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "ack")]
    Ack,
    #[serde(rename = "nak")]
    Nak,
}

/// Parse a duration string of the form the server uses for its ping
/// interval: one or more `<decimal><unit>` groups, units `ns`, `us`/`µs`,
/// `ms`, `s`, `m`, `h`. `"0"` (no unit) is accepted as zero.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let invalid = || format!("invalid duration {:?}", s);
    if s.is_empty() {
        return Err(invalid());
    }
    let mut total_nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_end].parse().map_err(|_| invalid())?;
        rest = &rest[num_end..];
        let (scale, unit_len) = if rest.starts_with("ns") {
            (1f64, 2)
        } else if rest.starts_with("us") {
            (1e3, 2)
        } else if rest.starts_with("µs") {
            (1e3, "µs".len())
        } else if rest.starts_with("ms") {
            (1e6, 2)
        } else if rest.starts_with('s') {
            (1e9, 1)
        } else if rest.starts_with('m') {
            (60e9, 1)
        } else if rest.starts_with('h') {
            (3600e9, 1)
        } else {
            return Err(invalid());
        };
        total_nanos += value * scale;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_nanos(total_nanos as u64))
}
