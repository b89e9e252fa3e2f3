//! Serial port connection implementations
//!
//! The instrument's RS-232 interface runs at 19200 baud, 8 data bits, no
//! parity, one stop bit; those are the configuration defaults.

use super::{read_line_buffered, ConnectionError};
use crate::connection::{AsyncConnection, Connection};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;
use tokio_serial::SerialStream;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
    /// Per-read timeout in milliseconds
    pub read_timeout_ms: u64,
}

impl SerialConfig {
    /// Create a new serial configuration with the instrument's defaults.
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            baud_rate: 19200,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
            read_timeout_ms: 3000,
        }
    }

    /// Set baud rate
    #[must_use]
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Set per-read timeout
    #[must_use]
    pub fn read_timeout(mut self, ms: u64) -> Self {
        self.read_timeout_ms = ms;
        self
    }

    fn builder(&self) -> serialport::SerialPortBuilder {
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match self.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match self.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        serialport::new(&self.port, self.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(Duration::from_millis(self.read_timeout_ms))
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyS0")
    }
}

fn map_open_error(config: &SerialConfig, e: serialport::Error) -> ConnectionError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound(config.port.clone()),
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            ConnectionError::PermissionDenied(config.port.clone())
        }
        _ => ConnectionError::ConnectionFailed(e.to_string()),
    }
}

/// Blocking serial connection
pub struct SerialConnection {
    reader: BufReader<Box<dyn SerialPort>>,
}

impl SerialConnection {
    /// Open the configured port.
    pub fn connect(config: &SerialConfig) -> Result<Self, ConnectionError> {
        let port = config.builder().open().map_err(|e| map_open_error(config, e))?;
        Ok(Self {
            reader: BufReader::new(port),
        })
    }
}

impl Connection for SerialConnection {
    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let port = self.reader.get_mut();
        port.write_all(data)?;
        port.flush()?;
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
        self.reader
            .get_ref()
            .clear(ClearBuffer::Input)
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))
    }
}

/// Awaitable serial connection
pub struct AsyncSerialConnection {
    stream: SerialStream,
    buf: BytesMut,
    read_timeout: Duration,
}

impl AsyncSerialConnection {
    /// Open the configured port.
    pub fn connect(config: &SerialConfig) -> Result<Self, ConnectionError> {
        let stream =
            SerialStream::open(&config.builder()).map_err(|e| map_open_error(config, e))?;
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(256),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        })
    }
}

#[async_trait]
impl AsyncConnection for AsyncSerialConnection {
    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        tokio::io::AsyncWriteExt::write_all(&mut self.stream, data).await?;
        tokio::io::AsyncWriteExt::flush(&mut self.stream).await?;
        Ok(())
    }

    async fn write_readline(&mut self, data: &[u8]) -> Result<String, ConnectionError> {
        self.write(data).await?;
        read_line_buffered(&mut self.stream, &mut self.buf, self.read_timeout).await
    }

    async fn flush_input(&mut self) -> Result<(), ConnectionError> {
        self.buf.clear();
        self.stream
            .clear(ClearBuffer::Input)
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }
}
