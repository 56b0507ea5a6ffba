//! Session errors.

use std::fmt;

use crate::data::SeenStateError;

/// Errors surfaced by the session to its supervisor and callers.
///
/// None of these are recovered locally: every fault propagates out of the
/// run and the supervisor decides whether to redial.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Bad configuration (PEM material, endpoint client); fatal at init.
    Config(String),
    /// The host endpoint could not produce a delivery host list.
    HostResolution(String),
    /// Every host in the rotation failed to dial.
    Dial(String),
    /// The connect/connack exchange failed.
    Handshake(String),
    /// A read, write, or codec failure inside the running exchange.
    Protocol(String),
    /// The seen-state store failed; the triggering message was nak'd.
    SeenState(String),
    /// The server broke the connection, with its stated reason.
    ConnBroken(String),
    /// A keep-connection supervisor is already running for this session.
    SupervisorRunning,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Config(e) => write!(f, "config error: {}", e),
            SessionError::HostResolution(e) => write!(f, "cannot get hosts: {}", e),
            SessionError::Dial(e) => write!(f, "connect: {}", e),
            SessionError::Handshake(e) => write!(f, "handshake: {}", e),
            SessionError::Protocol(e) => write!(f, "protocol: {}", e),
            SessionError::SeenState(e) => write!(f, "seen state: {}", e),
            SessionError::ConnBroken(reason) => {
                write!(f, "server broke connection: {}", reason)
            }
            SessionError::SupervisorRunning => {
                write!(f, "keep-connection is already running for this session")
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SeenStateError> for SessionError {
    fn from(e: SeenStateError) -> Self {
        SessionError::SeenState(e.to_string())
    }
}
