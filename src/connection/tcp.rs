//! TCP connection implementations
//!
//! Covers instruments reached through a serial-to-ethernet adapter or the
//! simulator server. Both flavors share one configuration.

use super::{drain_input, read_line_buffered, ConnectionError};
use crate::connection::{AsyncConnection, Connection};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// TCP connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Per-read timeout in milliseconds
    pub read_timeout_ms: u64,
}

impl TcpConfig {
    /// Create a new TCP configuration
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout_secs: 10,
            read_timeout_ms: 3000,
        }
    }

    /// Set connect timeout
    #[must_use]
    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Set per-read timeout
    #[must_use]
    pub fn read_timeout(mut self, ms: u64) -> Self {
        self.read_timeout_ms = ms;
        self
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        // 10001 is the factory default of common serial device servers.
        Self::new("localhost", 10001)
    }
}

/// Blocking TCP connection
pub struct TcpConnection {
    reader: BufReader<TcpStream>,
}

impl TcpConnection {
    /// Connect to the configured endpoint.
    pub fn connect(config: &TcpConfig) -> Result<Self, ConnectionError> {
        let addr = config
            .addr()
            .to_socket_addrs()
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?
            .next()
            .ok_or_else(|| {
                ConnectionError::ConnectionFailed(format!("cannot resolve {}", config.addr()))
            })?;

        let stream =
            TcpStream::connect_timeout(&addr, Duration::from_secs(config.connect_timeout_secs))
                .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(config.read_timeout_ms)))?;

        Ok(Self {
            reader: BufReader::new(stream),
        })
    }
}

impl Connection for TcpConnection {
    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let stream = self.reader.get_mut();
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

    fn write_readline(&mut self, data: &[u8]) -> Result<String, ConnectionError> {
        self.write(data)?;

        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(ConnectionError::Closed),
            Ok(_) => Ok(line),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(ConnectionError::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn flush_input(&mut self) -> Result<(), ConnectionError> {
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);

        let stream = self.reader.get_mut();
        stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 256];
        let drained = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Err(ConnectionError::Closed),
                Ok(_) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        stream.set_nonblocking(false)?;
        drained
    }
}

/// Awaitable TCP connection
pub struct AsyncTcpConnection {
    stream: tokio::net::TcpStream,
    buf: BytesMut,
    read_timeout: Duration,
}

impl AsyncTcpConnection {
    /// Connect to the configured endpoint.
    pub async fn connect(config: &TcpConfig) -> Result<Self, ConnectionError> {
        let stream = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            tokio::net::TcpStream::connect(config.addr()),
        )
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(256),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        })
    }
}

#[async_trait]
impl AsyncConnection for AsyncTcpConnection {
    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_readline(&mut self, data: &[u8]) -> Result<String, ConnectionError> {
        self.write(data).await?;
        read_line_buffered(&mut self.stream, &mut self.buf, self.read_timeout).await
    }

    async fn flush_input(&mut self) -> Result<(), ConnectionError> {
        drain_input(&mut self.stream, &mut self.buf).await
    }
}
