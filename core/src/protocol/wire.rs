//! Framing codec for the delivery connection.
//!
//! Messages travel as a 2-byte big-endian length prefix followed by a JSON
//! body. The very first byte a client sends after connecting is the wire
//! format version; both sides must agree on [`PROTOCOL_WIRE_VERSION`] before
//! any framed message is exchanged.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Duration, Instant};

use super::messages::{ClientMessage, ServerMessage};

/// Version byte exchanged before the framed message stream starts.
pub const PROTOCOL_WIRE_VERSION: u8 = 13;

/// Frame length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest message body a frame can carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// A stream connection the codec can run over.
pub trait NetStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> NetStream for T {}

/// Errors surfaced by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Transport failure while reading or writing.
    Io(String),
    /// The frame body did not decode as a message.
    Decode(String),
    /// The outgoing message did not encode.
    Encode(String),
    /// The message body exceeds what a frame can carry.
    FrameTooLarge(usize),
    /// The deadline passed before the operation completed.
    DeadlineExceeded,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Io(e) => write!(f, "io error: {}", e),
            WireError::Decode(e) => write!(f, "decode error: {}", e),
            WireError::Encode(e) => write!(f, "encode error: {}", e),
            WireError::FrameTooLarge(n) => write!(f, "message too large for frame: {} bytes", n),
            WireError::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e.to_string())
    }
}

/// One framed, deadline-bounded message exchange endpoint.
///
/// The deadline is absolute and applies to both reads and writes until it is
/// replaced by the next [`set_deadline`](Protocol::set_deadline) call.
#[async_trait]
pub trait Protocol: Send {
    fn set_deadline(&mut self, deadline: Instant);
    async fn read_message(&mut self) -> Result<ServerMessage, WireError>;
    async fn write_message(&mut self, msg: &ClientMessage) -> Result<(), WireError>;
}

/// [`Protocol`] implementation over any stream connection.
pub struct FramedProtocol<S> {
    stream: S,
    deadline: Option<Instant>,
}

impl<S: NetStream> FramedProtocol<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            deadline: None,
        }
    }
}

#[async_trait]
impl<S: NetStream> Protocol for FramedProtocol<S> {
    fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    async fn read_message(&mut self) -> Result<ServerMessage, WireError> {
        let deadline = self.deadline;
        let stream = &mut self.stream;
        let read = async {
            let mut header = [0u8; FRAME_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let len = u16::from_be_bytes(header) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            Ok::<_, std::io::Error>(body)
        };
        let body = match deadline {
            Some(d) => timeout_at(d, read)
                .await
                .map_err(|_| WireError::DeadlineExceeded)??,
            None => read.await?,
        };
        serde_json::from_slice(&body).map_err(|e| WireError::Decode(e.to_string()))
    }

    async fn write_message(&mut self, msg: &ClientMessage) -> Result<(), WireError> {
        let body = serde_json::to_vec(msg).map_err(|e| WireError::Encode(e.to_string()))?;
        if body.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(body.len()));
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);

        let deadline = self.deadline;
        let stream = &mut self.stream;
        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        };
        match deadline {
            Some(d) => timeout_at(d, write)
                .await
                .map_err(|_| WireError::DeadlineExceeded)??,
            None => write.await?,
        }
        Ok(())
    }
}

/// Read the wire format version byte from a fresh connection.
///
/// This is the server side of the version exchange; the session writes its
/// byte as the first thing after the TLS handshake.
pub async fn read_wire_format_version<R>(conn: &mut R, limit: Duration) -> Result<u8, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    timeout(limit, conn.read_exact(&mut buf))
        .await
        .map_err(|_| WireError::DeadlineExceeded)??;
    Ok(buf[0])
}
