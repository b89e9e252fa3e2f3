//! Reply decoding and command encoding for the DCP 3000 wire protocol
//!
//! The instrument answers every query with a single ASCII line. This module
//! turns those lines into typed values:
//! - 7-character configuration codes
//! - pressure readings (`"0234 mbar"`) and pressure series
//! - 5-character error bitfields
//! - `MM:SS` time intervals
//!
//! All pressure values are normalized to millibar before being returned.
//! Decoding is pure: no state, no I/O, and malformed input always fails with
//! a [`CodecError`] rather than producing a value in the wrong unit.

use std::fmt;
use thiserror::Error;

/// Fixed conversion factor from Torr to millibar.
pub const TORR_TO_MBAR: f64 = 1.3332236842105263;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Reply has the wrong length for its format
    #[error("Invalid length: expected {expected} characters, got {actual} in {text:?}")]
    InvalidLength {
        /// Expected character count
        expected: usize,
        /// Actual character count
        actual: usize,
        /// The offending reply text
        text: String,
    },

    /// A token could not be parsed as a number
    #[error("Invalid number {token:?} in {text:?}")]
    InvalidNumber {
        /// The unparsable token
        token: String,
        /// The full reply text
        text: String,
    },

    /// Unit token is not one of mbar / Torr / hPa
    #[error("Unknown pressure unit {unit:?} in {text:?}")]
    UnknownUnit {
        /// The unrecognized unit token
        unit: String,
        /// The full reply text
        text: String,
    },

    /// Reply does not match the expected shape
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Pressure unit reported by the instrument's configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PressureUnit {
    /// Millibar
    #[default]
    Mbar,
    /// Torr
    Torr,
    /// Hectopascal (numerically identical to millibar)
    HPa,
}

impl PressureUnit {
    fn from_code(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Mbar),
            '1' => Some(Self::Torr),
            '2' => Some(Self::HPa),
            _ => None,
        }
    }
}

impl fmt::Display for PressureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mbar => write!(f, "mbar"),
            Self::Torr => write!(f, "Torr"),
            Self::HPa => write!(f, "hPa"),
        }
    }
}

/// Instrument configuration decoded from the 7-character `IN_CFG` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Display/reporting pressure unit
    pub unit: PressureUnit,
    /// Acoustic signal enabled
    pub acoustic_signal: bool,
    /// Venting valve connected
    pub venting_valve_connected: bool,
    /// Fault indicator connected
    pub fault_indicator_connected: bool,
    /// Number of active pressure transducers
    pub active_transducers: u8,
    /// Total number of pressure transducers
    pub total_transducers: u8,
}

/// Fault condition reported in the `IN_ERR` bitfield
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Venting valve fault
    VentingValveFault,
    /// Overpressure
    Overpressure,
    /// Pressure transducer fault
    TransducerFault,
    /// External fault
    ExternalFault,
}

impl Fault {
    /// Bitfield positions, in wire order. The fifth character of the reply
    /// ("last serial command incorrect") is reported permanently set by the
    /// instrument and is deliberately not represented here.
    pub const ALL: [Fault; 4] = [
        Fault::VentingValveFault,
        Fault::Overpressure,
        Fault::TransducerFault,
        Fault::ExternalFault,
    ];

    /// Human-readable fault description
    pub fn description(&self) -> &'static str {
        match self {
            Self::VentingValveFault => "venting valve fault",
            Self::Overpressure => "overpressure",
            Self::TransducerFault => "pressure transducer fault",
            Self::ExternalFault => "external fault",
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Encode a command for transmission: ASCII verb plus arguments, terminated
/// by a line feed.
pub fn encode(command: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(command.len() + 1);
    data.extend_from_slice(command.as_bytes());
    data.push(b'\n');
    data
}

/// Strip the line terminator from a raw reply.
pub fn decode(reply: &str) -> String {
    reply.trim_end_matches(['\r', '\n']).trim().to_string()
}

/// Decode the 7-character configuration code returned by `IN_CFG`.
pub fn decode_config(text: &str) -> Result<Config, CodecError> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() != 7 {
        return Err(CodecError::InvalidLength {
            expected: 7,
            actual: chars.len(),
            text: text.to_string(),
        });
    }

    let unit = PressureUnit::from_code(chars[1]).ok_or_else(|| {
        CodecError::InvalidFormat(format!("unknown unit code {:?} in {:?}", chars[1], text))
    })?;

    let digit = |c: char| {
        c.to_digit(10)
            .map(|d| d as u8)
            .ok_or_else(|| CodecError::InvalidNumber {
                token: c.to_string(),
                text: text.to_string(),
            })
    };

    Ok(Config {
        unit,
        acoustic_signal: chars[2] == '1',
        venting_valve_connected: chars[3] == '1',
        fault_indicator_connected: chars[4] == '1',
        active_transducers: digit(chars[5])?,
        total_transducers: digit(chars[6])?,
    })
}

fn parse_value(token: &str, text: &str) -> Result<f64, CodecError> {
    token.parse::<f64>().map_err(|_| CodecError::InvalidNumber {
        token: token.to_string(),
        text: text.to_string(),
    })
}

fn unit_factor(unit: &str, text: &str) -> Result<f64, CodecError> {
    match unit {
        "mbar" | "hpa" => Ok(1.0),
        "torr" => Ok(TORR_TO_MBAR),
        other => Err(CodecError::UnknownUnit {
            unit: other.to_string(),
            text: text.to_string(),
        }),
    }
}

/// Decode a single pressure reply (`"<value> <unit>"`), normalized to mbar.
pub fn decode_pressure(text: &str) -> Result<f64, CodecError> {
    let lower = text.to_lowercase();
    let mut tokens = lower.split_whitespace();
    let (value, unit) = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(value), Some(unit), None) => (value, unit),
        _ => {
            return Err(CodecError::InvalidFormat(format!(
                "expected \"<value> <unit>\", got {text:?}"
            )))
        }
    };
    Ok(parse_value(value, text)? * unit_factor(unit, text)?)
}

/// Decode a pressure series reply (`"<v1> <v2> ... <unit>"`), each value
/// independently normalized to mbar.
pub fn decode_pressures(text: &str) -> Result<Vec<f64>, CodecError> {
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower.split_whitespace().collect();
    let (unit, values) = match tokens.split_last() {
        Some((unit, values)) if !values.is_empty() => (unit, values),
        _ => {
            return Err(CodecError::InvalidFormat(format!(
                "expected \"<values...> <unit>\", got {text:?}"
            )))
        }
    };
    let factor = unit_factor(unit, text)?;
    values
        .iter()
        .map(|token| Ok(parse_value(token, text)? * factor))
        .collect()
}

/// Decode the 5-character error bitfield returned by `IN_ERR`.
///
/// The fifth character flags "last serial command incorrect", which the
/// instrument reports permanently set; it is discarded. The remaining four
/// characters map positionally onto [`Fault::ALL`].
pub fn decode_errors(text: &str) -> Result<Vec<Fault>, CodecError> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() != 5 {
        return Err(CodecError::InvalidLength {
            expected: 5,
            actual: chars.len(),
            text: text.to_string(),
        });
    }
    Ok(chars[..4]
        .iter()
        .zip(Fault::ALL)
        .filter(|(c, _)| **c == '1')
        .map(|(_, fault)| fault)
        .collect())
}

/// Decode an `MM:SS` interval reply into total seconds.
pub fn decode_interval(text: &str) -> Result<u32, CodecError> {
    let trimmed = text.trim();
    let (minutes, seconds) = trimmed.split_once(':').ok_or_else(|| {
        CodecError::InvalidFormat(format!("expected \"MM:SS\", got {text:?}"))
    })?;
    let minutes: u32 = minutes.parse().map_err(|_| CodecError::InvalidNumber {
        token: minutes.to_string(),
        text: text.to_string(),
    })?;
    let seconds: u32 = seconds.parse().map_err(|_| CodecError::InvalidNumber {
        token: seconds.to_string(),
        text: text.to_string(),
    })?;
    Ok(minutes * 60 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_appends_linefeed() {
        assert_eq!(encode("IN_PV_1"), b"IN_PV_1\n");
        assert_eq!(encode("OUT_SP_11 500 mbar"), b"OUT_SP_11 500 mbar\n");
    }

    #[test]
    fn test_decode_strips_terminator() {
        assert_eq!(decode("0234 mbar\r\n"), "0234 mbar");
        assert_eq!(decode("DCP 3000  V2.30\r\n"), "DCP 3000  V2.30");
    }

    #[test]
    fn test_decode_config() {
        let config = decode_config("1001144").unwrap();
        assert_eq!(config.unit, PressureUnit::Mbar);
        assert!(!config.acoustic_signal);
        assert!(config.venting_valve_connected);
        assert!(config.fault_indicator_connected);
        assert_eq!(config.active_transducers, 4);
        assert_eq!(config.total_transducers, 4);

        let config = decode_config("1110023").unwrap();
        assert_eq!(config.unit, PressureUnit::Torr);
        assert!(config.acoustic_signal);
        assert!(!config.venting_valve_connected);
        assert_eq!(config.active_transducers, 2);
        assert_eq!(config.total_transducers, 3);
    }

    #[test]
    fn test_decode_config_length() {
        assert!(decode_config("").is_err());
        assert!(decode_config("100114").is_err());
        assert!(decode_config("10011440").is_err());
        assert!(matches!(
            decode_config("100114"),
            Err(CodecError::InvalidLength { expected: 7, actual: 6, .. })
        ));
    }

    #[test]
    fn test_decode_config_bad_unit_code() {
        assert!(decode_config("1901144").is_err());
    }

    #[test]
    fn test_decode_pressure_mbar() {
        assert_eq!(decode_pressure("0234 mbar").unwrap(), 234.0);
        assert_eq!(decode_pressure("1004.1 mbar").unwrap(), 1004.1);
    }

    #[test]
    fn test_decode_pressure_torr() {
        let value = decode_pressure("10.0 Torr").unwrap();
        assert!((value - 13.332236842105263).abs() < 1e-12);
    }

    #[test]
    fn test_decode_pressure_hpa() {
        assert_eq!(decode_pressure("500 hPa").unwrap(), 500.0);
    }

    #[test]
    fn test_decode_pressure_malformed() {
        assert!(decode_pressure("").is_err());
        assert!(decode_pressure("mbar").is_err());
        assert!(decode_pressure("12.3").is_err());
        assert!(decode_pressure("abc mbar").is_err());
        assert!(matches!(
            decode_pressure("10.0 psi"),
            Err(CodecError::UnknownUnit { .. })
        ));
    }

    #[test]
    fn test_decode_pressures() {
        assert_eq!(
            decode_pressures("0362 0234 0278 0213 mbar").unwrap(),
            vec![362.0, 234.0, 278.0, 213.0]
        );
    }

    #[test]
    fn test_decode_pressures_torr() {
        let values = decode_pressures("1.0 2.0 torr").unwrap();
        assert_eq!(values.len(), 2);
        assert!((values[0] - TORR_TO_MBAR).abs() < 1e-12);
        assert!((values[1] - 2.0 * TORR_TO_MBAR).abs() < 1e-12);
    }

    #[test]
    fn test_decode_pressures_malformed() {
        assert!(decode_pressures("").is_err());
        assert!(decode_pressures("mbar").is_err());
        assert!(decode_pressures("1.0 2.0 psi").is_err());
    }

    #[test]
    fn test_decode_errors() {
        let faults = decode_errors("10010").unwrap();
        assert_eq!(faults, vec![Fault::VentingValveFault, Fault::ExternalFault]);

        assert!(decode_errors("00000").unwrap().is_empty());
        // The fifth character carries no information.
        assert!(decode_errors("00001").unwrap().is_empty());
        assert_eq!(decode_errors("11110").unwrap().len(), 4);
    }

    #[test]
    fn test_decode_errors_length() {
        assert!(decode_errors("0000").is_err());
        assert!(decode_errors("000000").is_err());
    }

    #[test]
    fn test_decode_interval() {
        assert_eq!(decode_interval("05:30").unwrap(), 330);
        assert_eq!(decode_interval("00:00").unwrap(), 0);
        assert_eq!(decode_interval("99:00").unwrap(), 5940);
    }

    #[test]
    fn test_decode_interval_malformed() {
        assert!(decode_interval("0530").is_err());
        assert!(decode_interval("aa:bb").is_err());
        assert!(decode_interval("").is_err());
    }

    #[test]
    fn test_fault_descriptions() {
        assert_eq!(Fault::VentingValveFault.to_string(), "venting valve fault");
        assert_eq!(Fault::Overpressure.to_string(), "overpressure");
    }
}
