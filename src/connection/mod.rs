//! Connection layer for reaching the instrument
//!
//! The protocol engine only ever talks to a [`Connection`] (blocking) or an
//! [`AsyncConnection`] (cooperative). Both contracts are line oriented:
//! `write` sends raw command bytes, `write_readline` sends them and reads one
//! reply line, `flush_input` discards anything buffered on the receive side.
//!
//! Opening and configuring the underlying transport (port, baud rate,
//! address, timeouts) is entirely the implementation's responsibility.
//!
//! Shipped implementations:
//! - TCP (e.g. a serial-to-ethernet adapter in front of the instrument)
//! - Serial (RS-232, directly attached)

mod serial;
mod tcp;

pub use serial::{
    AsyncSerialConnection, SerialConfig, SerialConnection, SerialFlowControl, SerialParity,
};
pub use tcp::{AsyncTcpConnection, TcpConfig, TcpConnection};

use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[cfg(test)]
use mockall::automock;

/// Connection error types
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No reply arrived within the configured read timeout
    #[error("Read timed out")]
    Timeout,

    /// Serial port does not exist
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Insufficient permissions to open the port
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    Closed,

    /// Reply bytes are not valid UTF-8
    #[error("Reply is not valid text: {0:?}")]
    InvalidReply(Vec<u8>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blocking line-oriented connection to the instrument.
#[cfg_attr(test, automock)]
pub trait Connection: Send {
    /// Write raw command bytes.
    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Write raw command bytes, then read one reply line (terminator
    /// included).
    fn write_readline(&mut self, data: &[u8]) -> Result<String, ConnectionError>;

    /// Discard any bytes buffered on the receive side.
    fn flush_input(&mut self) -> Result<(), ConnectionError>;
}

/// Awaitable line-oriented connection to the instrument.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AsyncConnection: Send {
    /// Write raw command bytes.
    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Write raw command bytes, then read one reply line (terminator
    /// included).
    async fn write_readline(&mut self, data: &[u8]) -> Result<String, ConnectionError>;

    /// Discard any bytes buffered on the receive side.
    async fn flush_input(&mut self) -> Result<(), ConnectionError>;
}

/// Read one `\n`-terminated line from `stream`, buffering partial reads in
/// `buf`. Each read is bounded by `timeout`.
pub(crate) async fn read_line_buffered<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<String, ConnectionError>
where
    S: AsyncRead + Unpin + Send,
{
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            return String::from_utf8(line.to_vec())
                .map_err(|e| ConnectionError::InvalidReply(e.into_bytes()));
        }

        let n = tokio::time::timeout(timeout, stream.read_buf(buf))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }
    }
}

/// Best-effort drain of everything currently readable from `stream`, plus
/// whatever `buf` already holds. Returns as soon as a read would block.
pub(crate) async fn drain_input<S>(stream: &mut S, buf: &mut BytesMut) -> Result<(), ConnectionError>
where
    S: AsyncRead + Unpin + Send,
{
    buf.clear();
    let mut scratch = [0u8; 256];
    loop {
        match tokio::time::timeout(Duration::ZERO, stream.read(&mut scratch)).await {
            Ok(Ok(0)) => return Err(ConnectionError::Closed),
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(e.into()),
            // Nothing pending.
            Err(_) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_line_buffered_splits_lines() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut server, b"0234 mbar\r\nsecond\r\n")
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let timeout = Duration::from_millis(100);
        let line = read_line_buffered(&mut client, &mut buf, timeout).await.unwrap();
        assert_eq!(line, "0234 mbar\r\n");
        let line = read_line_buffered(&mut client, &mut buf, timeout).await.unwrap();
        assert_eq!(line, "second\r\n");
    }

    #[tokio::test]
    async fn test_read_line_buffered_times_out() {
        let (mut client, _server) = tokio::io::duplex(64);
        let mut buf = BytesMut::new();
        let result =
            read_line_buffered(&mut client, &mut buf, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));
    }

    #[tokio::test]
    async fn test_drain_input_discards_pending_bytes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut server, b"stale bytes\r\n")
            .await
            .unwrap();
        // Let the write land in the duplex buffer.
        tokio::task::yield_now().await;

        let mut buf = BytesMut::from(&b"partial"[..]);
        drain_input(&mut client, &mut buf).await.unwrap();
        assert!(buf.is_empty());

        tokio::io::AsyncWriteExt::write_all(&mut server, b"fresh\r\n")
            .await
            .unwrap();
        let line = read_line_buffered(&mut client, &mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(line, "fresh\r\n");
    }
}
