//! Typed instrument façade
//!
//! One method per instrument operation, built on the transaction engine and
//! the reply codec. [`Dcp3000`] wraps a blocking connection, [`AsyncDcp3000`]
//! an awaitable one; both expose the same surface.
//!
//! Setpoint and transducer channels are validated client-side: an
//! out-of-range channel fails before any I/O is attempted.

use crate::codec::{self, CodecError, Config, Fault};
use crate::connection::{AsyncConnection, Connection};
use crate::protocol::{AsyncProtocol, Protocol, ProtocolConfig, ProtocolError};
use std::fmt;
use thiserror::Error;

/// Device errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Channel outside the instrument's 1-4 range; nothing was sent
    #[error("Invalid channel {0}: must be 1-4")]
    InvalidChannel(u8),

    /// Transaction failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Reply did not match the expected format
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Setpoint actuation mode. Mode 1 switches on at the threshold, mode 2
/// switches off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetpointMode {
    On = 1,
    Off = 2,
}

impl fmt::Display for SetpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

fn validate_channel(channel: u8) -> Result<(), DeviceError> {
    if (1..=4).contains(&channel) {
        Ok(())
    } else {
        Err(DeviceError::InvalidChannel(channel))
    }
}

/// Blocking driver for a DCP 3000 vacuum gauge controller.
pub struct Dcp3000<C: Connection> {
    protocol: Protocol<C>,
}

impl<C: Connection> Dcp3000<C> {
    /// Create a driver with the default engine configuration.
    pub fn new(conn: C) -> Self {
        Self {
            protocol: Protocol::new(conn),
        }
    }

    /// Create a driver with an explicit engine configuration.
    pub fn with_config(conn: C, config: ProtocolConfig) -> Self {
        Self {
            protocol: Protocol::with_config(conn, config),
        }
    }

    /// Send a raw query and return the reply line.
    pub fn query(&self, command: &str) -> Result<String, DeviceError> {
        Ok(self.protocol.query(command)?)
    }

    /// Send a raw settings command.
    pub fn post(&self, command: &str) -> Result<(), DeviceError> {
        Ok(self.protocol.post(command)?)
    }

    /// Read the instrument configuration.
    pub fn config(&self) -> Result<Config, DeviceError> {
        Ok(codec::decode_config(&self.protocol.query("IN_CFG")?)?)
    }

    /// Read the current pressure, in mbar.
    pub fn pressure(&self) -> Result<f64, DeviceError> {
        Ok(codec::decode_pressure(&self.protocol.query("IN_PV_1")?)?)
    }

    /// Read one transducer's pressure, in mbar.
    pub fn transducer_pressure(&self, channel: u8) -> Result<f64, DeviceError> {
        validate_channel(channel)?;
        let reply = self.protocol.query(&format!("IN_PV_S{channel}"))?;
        Ok(codec::decode_pressure(&reply)?)
    }

    /// Read all transducer pressures, in mbar.
    pub fn transducer_pressures(&self) -> Result<Vec<f64>, DeviceError> {
        Ok(codec::decode_pressures(&self.protocol.query("IN_PV_X")?)?)
    }

    /// Read the event broadcast interval, in seconds.
    pub fn event_interval(&self) -> Result<u32, DeviceError> {
        Ok(codec::decode_interval(&self.protocol.query("IN_SP_1")?)?)
    }

    /// Set the event broadcast interval, in seconds.
    pub fn set_event_interval(&self, seconds: u32) -> Result<(), DeviceError> {
        Ok(self.protocol.post(&format!("OUT_SP_1 {seconds}"))?)
    }

    /// Read the recording interval, in seconds.
    pub fn record_interval(&self) -> Result<u32, DeviceError> {
        Ok(codec::decode_interval(&self.protocol.query("IN_SP_2")?)?)
    }

    /// Set the recording interval, in seconds.
    pub fn set_record_interval(&self, seconds: u32) -> Result<(), DeviceError> {
        Ok(self.protocol.post(&format!("OUT_SP_2 {seconds}"))?)
    }

    /// Read a channel's on-setpoint, in mbar.
    pub fn on_setpoint(&self, channel: u8) -> Result<f64, DeviceError> {
        self.setpoint(SetpointMode::On, channel)
    }

    /// Write a channel's on-setpoint, in mbar.
    pub fn set_on_setpoint(&self, channel: u8, mbar: f64) -> Result<(), DeviceError> {
        self.set_setpoint(SetpointMode::On, channel, mbar)
    }

    /// Read a channel's off-setpoint, in mbar.
    pub fn off_setpoint(&self, channel: u8) -> Result<f64, DeviceError> {
        self.setpoint(SetpointMode::Off, channel)
    }

    /// Write a channel's off-setpoint, in mbar.
    pub fn set_off_setpoint(&self, channel: u8, mbar: f64) -> Result<(), DeviceError> {
        self.set_setpoint(SetpointMode::Off, channel, mbar)
    }

    fn setpoint(&self, mode: SetpointMode, channel: u8) -> Result<f64, DeviceError> {
        validate_channel(channel)?;
        let reply = self.protocol.query(&format!("IN_SP_{mode}{channel}"))?;
        Ok(codec::decode_pressure(&reply)?)
    }

    fn set_setpoint(
        &self,
        mode: SetpointMode,
        channel: u8,
        mbar: f64,
    ) -> Result<(), DeviceError> {
        validate_channel(channel)?;
        Ok(self
            .protocol
            .post(&format!("OUT_SP_{mode}{channel} {mbar} mbar"))?)
    }

    /// Read the active fault conditions.
    pub fn errors(&self) -> Result<Vec<Fault>, DeviceError> {
        Ok(codec::decode_errors(&self.protocol.query("IN_ERR")?)?)
    }

    /// Read the firmware version string.
    pub fn version(&self) -> Result<String, DeviceError> {
        Ok(self.protocol.query("IN_VER")?)
    }

    /// Enable remote operation.
    pub fn switch_on(&self) -> Result<(), DeviceError> {
        Ok(self.protocol.post("REMOTE 1")?)
    }

    /// Disable remote operation.
    pub fn switch_off(&self) -> Result<(), DeviceError> {
        Ok(self.protocol.post("REMOTE -")?)
    }

    /// Close the venting valve.
    pub fn close_venting_valve(&self) -> Result<(), DeviceError> {
        Ok(self.protocol.post("OUT_VENT 0")?)
    }

    /// Open the venting valve.
    pub fn open_venting_valve(&self) -> Result<(), DeviceError> {
        Ok(self.protocol.post("OUT_VENT 1")?)
    }

    /// Vent until atmospheric pressure.
    pub fn vent(&self) -> Result<(), DeviceError> {
        Ok(self.protocol.post("OUT_VENT 2")?)
    }
}

/// Awaitable driver for a DCP 3000 vacuum gauge controller.
pub struct AsyncDcp3000<C: AsyncConnection> {
    protocol: AsyncProtocol<C>,
}

impl<C: AsyncConnection> AsyncDcp3000<C> {
    /// Create a driver with the default engine configuration.
    pub fn new(conn: C) -> Self {
        Self {
            protocol: AsyncProtocol::new(conn),
        }
    }

    /// Create a driver with an explicit engine configuration.
    pub fn with_config(conn: C, config: ProtocolConfig) -> Self {
        Self {
            protocol: AsyncProtocol::with_config(conn, config),
        }
    }

    /// Send a raw query and return the reply line.
    pub async fn query(&self, command: &str) -> Result<String, DeviceError> {
        Ok(self.protocol.query(command).await?)
    }

    /// Send a raw settings command.
    pub async fn post(&self, command: &str) -> Result<(), DeviceError> {
        Ok(self.protocol.post(command).await?)
    }

    /// Read the instrument configuration.
    pub async fn config(&self) -> Result<Config, DeviceError> {
        Ok(codec::decode_config(&self.protocol.query("IN_CFG").await?)?)
    }

    /// Read the current pressure, in mbar.
    pub async fn pressure(&self) -> Result<f64, DeviceError> {
        Ok(codec::decode_pressure(
            &self.protocol.query("IN_PV_1").await?,
        )?)
    }

    /// Read one transducer's pressure, in mbar.
    pub async fn transducer_pressure(&self, channel: u8) -> Result<f64, DeviceError> {
        validate_channel(channel)?;
        let reply = self.protocol.query(&format!("IN_PV_S{channel}")).await?;
        Ok(codec::decode_pressure(&reply)?)
    }

    /// Read all transducer pressures, in mbar.
    pub async fn transducer_pressures(&self) -> Result<Vec<f64>, DeviceError> {
        Ok(codec::decode_pressures(
            &self.protocol.query("IN_PV_X").await?,
        )?)
    }

    /// Read the event broadcast interval, in seconds.
    pub async fn event_interval(&self) -> Result<u32, DeviceError> {
        Ok(codec::decode_interval(
            &self.protocol.query("IN_SP_1").await?,
        )?)
    }

    /// Set the event broadcast interval, in seconds.
    pub async fn set_event_interval(&self, seconds: u32) -> Result<(), DeviceError> {
        Ok(self.protocol.post(&format!("OUT_SP_1 {seconds}")).await?)
    }

    /// Read the recording interval, in seconds.
    pub async fn record_interval(&self) -> Result<u32, DeviceError> {
        Ok(codec::decode_interval(
            &self.protocol.query("IN_SP_2").await?,
        )?)
    }

    /// Set the recording interval, in seconds.
    pub async fn set_record_interval(&self, seconds: u32) -> Result<(), DeviceError> {
        Ok(self.protocol.post(&format!("OUT_SP_2 {seconds}")).await?)
    }

    /// Read a channel's on-setpoint, in mbar.
    pub async fn on_setpoint(&self, channel: u8) -> Result<f64, DeviceError> {
        self.setpoint(SetpointMode::On, channel).await
    }

    /// Write a channel's on-setpoint, in mbar.
    pub async fn set_on_setpoint(&self, channel: u8, mbar: f64) -> Result<(), DeviceError> {
        self.set_setpoint(SetpointMode::On, channel, mbar).await
    }

    /// Read a channel's off-setpoint, in mbar.
    pub async fn off_setpoint(&self, channel: u8) -> Result<f64, DeviceError> {
        self.setpoint(SetpointMode::Off, channel).await
    }

    /// Write a channel's off-setpoint, in mbar.
    pub async fn set_off_setpoint(&self, channel: u8, mbar: f64) -> Result<(), DeviceError> {
        self.set_setpoint(SetpointMode::Off, channel, mbar).await
    }

    async fn setpoint(&self, mode: SetpointMode, channel: u8) -> Result<f64, DeviceError> {
        validate_channel(channel)?;
        let reply = self
            .protocol
            .query(&format!("IN_SP_{mode}{channel}"))
            .await?;
        Ok(codec::decode_pressure(&reply)?)
    }

    async fn set_setpoint(
        &self,
        mode: SetpointMode,
        channel: u8,
        mbar: f64,
    ) -> Result<(), DeviceError> {
        validate_channel(channel)?;
        Ok(self
            .protocol
            .post(&format!("OUT_SP_{mode}{channel} {mbar} mbar"))
            .await?)
    }

    /// Read the active fault conditions.
    pub async fn errors(&self) -> Result<Vec<Fault>, DeviceError> {
        Ok(codec::decode_errors(&self.protocol.query("IN_ERR").await?)?)
    }

    /// Read the firmware version string.
    pub async fn version(&self) -> Result<String, DeviceError> {
        Ok(self.protocol.query("IN_VER").await?)
    }

    /// Enable remote operation.
    pub async fn switch_on(&self) -> Result<(), DeviceError> {
        Ok(self.protocol.post("REMOTE 1").await?)
    }

    /// Disable remote operation.
    pub async fn switch_off(&self) -> Result<(), DeviceError> {
        Ok(self.protocol.post("REMOTE -").await?)
    }

    /// Close the venting valve.
    pub async fn close_venting_valve(&self) -> Result<(), DeviceError> {
        Ok(self.protocol.post("OUT_VENT 0").await?)
    }

    /// Open the venting valve.
    pub async fn open_venting_valve(&self) -> Result<(), DeviceError> {
        Ok(self.protocol.post("OUT_VENT 1").await?)
    }

    /// Vent until atmospheric pressure.
    pub async fn vent(&self) -> Result<(), DeviceError> {
        Ok(self.protocol.post("OUT_VENT 2").await?)
    }
}
