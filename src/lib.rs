//! # DCP 3000 driver library
//!
//! Drives a laboratory vacuum-gauge controller over its line-oriented ASCII
//! command/response protocol, carried on a serial line or a socket.
//!
//! The crate is built around a transaction engine that turns a raw
//! byte-stream connection into a safe channel:
//! - rate-limited (the instrument accepts at most 20 commands per second)
//! - serialized (one request/response exchange in flight per connection)
//! - typed (replies decoded into configuration, pressures in mbar, fault
//!   sets, intervals)
//!
//! Blocking and async flavors share the same contract; pick one by the
//! connection type you construct. A device simulator mirroring the
//! controller's wire behavior is included for testing, along with a TCP
//! server to run it behind a socket.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dcp3000::{AsyncDcp3000, AsyncTcpConnection, TcpConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TcpConfig::new("192.168.1.50", 10001);
//!     let conn = AsyncTcpConnection::connect(&config).await?;
//!     let gauge = AsyncDcp3000::new(conn);
//!
//!     println!("version: {}", gauge.version().await?);
//!     println!("pressure: {} mbar", gauge.pressure().await?);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod connection;
pub mod device;
pub mod protocol;
pub mod simulator;

// Re-exports for convenience
pub use crate::codec::{CodecError, Config, Fault, PressureUnit, TORR_TO_MBAR};
pub use crate::connection::{
    AsyncConnection, AsyncSerialConnection, AsyncTcpConnection, Connection, ConnectionError,
    SerialConfig, SerialConnection, SerialFlowControl, SerialParity, TcpConfig, TcpConnection,
};
pub use crate::device::{AsyncDcp3000, Dcp3000, DeviceError};
pub use crate::protocol::{AsyncProtocol, Protocol, ProtocolConfig, ProtocolError};
pub use crate::simulator::{Simulator, SimulatorConfig, SimulatorServer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
