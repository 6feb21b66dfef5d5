//! Wire codec
//!
//! A connection starts with a single unframed byte carrying the wire format
//! version. After that every message is a big endian `u16` length followed
//! by that many bytes of JSON.
//!
//! All I/O through [`Protocol`] is bounded by the deadline last given to
//! [`Protocol::set_deadline`]; expiry surfaces as [`ProtocolError::Timeout`].

use std::future::Future;
use std::io;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};

/// Version of the wire format spoken after the version byte.
pub const PROTOCOL_WIRE_VERSION: u8 = 0;

/// Largest JSON body a 16 bit length prefix can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("i/o timeout")]
    Timeout,
    #[error("malformed message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("cannot encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),
}

impl ProtocolError {
    /// Whether the peer closed the connection.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

async fn bounded<T, F>(deadline: Option<Instant>, fut: F) -> Result<T, ProtocolError>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => match timeout_at(deadline, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(ProtocolError::Timeout),
        },
        None => Ok(fut.await?),
    }
}

/// Reads the wire format version byte, waiting at most `exchange_timeout`.
pub async fn read_wire_format_version<S>(
    conn: &mut S,
    exchange_timeout: Duration,
) -> Result<u8, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    bounded(
        Some(Instant::now() + exchange_timeout),
        conn.read_exact(&mut buf),
    )
    .await?;
    Ok(buf[0])
}

/// Writes the wire format version byte.
pub async fn write_wire_format_version<S>(
    conn: &mut S,
    version: u8,
    exchange_timeout: Duration,
) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    bounded(
        Some(Instant::now() + exchange_timeout),
        conn.write_all(&[version]),
    )
    .await
}

/// A connection able to read and write version 0 framed messages.
#[derive(Debug)]
pub struct Protocol<S> {
    conn: S,
    buffer: Vec<u8>,
    deadline: Option<Instant>,
}

impl<S> Protocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(conn: S) -> Self {
        Self {
            conn,
            buffer: Vec::with_capacity(5000),
            deadline: None,
        }
    }

    /// Sets the deadline for the subsequent write/read exchange.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Reads one frame and returns its JSON body.
    pub async fn read_frame(&mut self) -> Result<&[u8], ProtocolError> {
        let deadline = self.deadline;
        let mut len = [0u8; 2];
        bounded(deadline, self.conn.read_exact(&mut len)).await?;
        let length = u16::from_be_bytes(len) as usize;
        self.buffer.clear();
        self.buffer.resize(length, 0);
        bounded(deadline, self.conn.read_exact(&mut self.buffer)).await?;
        Ok(&self.buffer)
    }

    /// Reads one message and decodes it into `T`.
    pub async fn read_message<T>(&mut self) -> Result<T, ProtocolError>
    where
        T: DeserializeOwned,
    {
        let body = self.read_frame().await?;
        serde_json::from_slice(body).map_err(ProtocolError::Decode)
    }

    /// Encodes `msg` and writes it as a single frame.
    pub async fn write_message<T>(&mut self, msg: &T) -> Result<(), ProtocolError>
    where
        T: Serialize + ?Sized,
    {
        self.buffer.clear();
        self.buffer.extend_from_slice(&[0, 0]); // length placeholder
        serde_json::to_writer(&mut self.buffer, msg).map_err(ProtocolError::Encode)?;
        let msg_len = self.buffer.len() - 2;
        if msg_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(msg_len));
        }
        self.buffer[..2].copy_from_slice(&(msg_len as u16).to_be_bytes());
        let deadline = self.deadline;
        bounded(deadline, async {
            self.conn.write_all(&self.buffer).await?;
            self.conn.flush().await
        })
        .await
    }
}
