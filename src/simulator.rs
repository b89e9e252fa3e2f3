//! Device simulator
//!
//! Emulates the controller side of the wire protocol for testing: a reply
//! table seeded with realistic values, a remote-enable flag, and a setpoint
//! table mutated by incoming settings commands. Unknown queries produce **no
//! reply at all** — real hardware stays silent on unrecognized commands, and
//! drivers must cope with that, so the simulator reproduces it exactly.
//!
//! [`SimulatorServer`] serves the state machine over TCP so it can stand in
//! for an instrument behind a serial device server.

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info, warn};

/// Canned replies of a freshly powered-on controller: firmware version,
/// per-transducer pressures, the 4-value series, configuration code, clear
/// error field, both intervals and all eight setpoints.
fn default_replies() -> HashMap<String, String> {
    [
        ("IN_VER", "DCP 3000  V2.30"),
        ("IN_PV_S1", "0234 mbar"),
        ("IN_PV_S2", "0278 mbar"),
        ("IN_PV_S3", "0213 mbar"),
        ("IN_PV_S4", "0223 mbar"),
        ("IN_PV_X", "0362 0234 0278 0213 mbar"),
        ("IN_CFG", "1001144"),
        ("IN_ERR", "00000"),
        ("IN_SP_1", "00:00"),
        ("IN_SP_2", "99:00"),
        ("IN_SP_11", "111.0 mbar"),
        ("IN_SP_21", "011.5 mbar"),
        ("IN_SP_12", "222.0 mbar"),
        ("IN_SP_22", "022.5 mbar"),
        ("IN_SP_13", "333.0 mbar"),
        ("IN_SP_23", "033.5 mbar"),
        ("IN_SP_14", "444.0 mbar"),
        ("IN_SP_24", "044.5 mbar"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Reply-table entries overriding the defaults, keyed by query verb
    #[serde(default)]
    pub replies: HashMap<String, String>,
    /// Initial remote-enable state
    #[serde(default = "default_remote")]
    pub remote: bool,
}

fn default_remote() -> bool {
    true
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            replies: HashMap::new(),
            remote: true,
        }
    }
}

/// Controller-side state machine. One incoming line in, at most one reply
/// line out.
#[derive(Debug)]
pub struct Simulator {
    replies: HashMap<String, String>,
    remote: bool,
}

impl Simulator {
    /// Create a simulator with the default reply table.
    pub fn new() -> Self {
        Self::with_config(SimulatorConfig::default())
    }

    /// Create a simulator with overridden replies and initial state.
    pub fn with_config(config: SimulatorConfig) -> Self {
        let mut replies = default_replies();
        replies.extend(config.replies);
        Self {
            replies,
            remote: config.remote,
        }
    }

    /// Whether remote operation is currently enabled.
    pub fn remote_enabled(&self) -> bool {
        self.remote
    }

    /// Handle one incoming line; the returned reply carries no terminator.
    /// `None` means the controller stays silent.
    pub fn handle_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        debug!(request = line, "handle");

        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, Some(arg.trim())),
            None => (line, None),
        };

        let reply = match verb {
            "OUT_SP_1" => {
                if let Some(interval) = arg.and_then(to_mm_ss) {
                    self.replies.insert("IN_SP_1".to_string(), interval);
                }
                None
            }
            "OUT_SP_2" => {
                if let Some(interval) = arg.and_then(to_mm_ss) {
                    self.replies.insert("IN_SP_2".to_string(), interval);
                }
                None
            }
            // Accepted without reply or state change, like the hardware.
            "OUT_VENT" | "OUT_SENSOR" => None,
            "REMOTE" => {
                self.remote = arg == Some("1");
                None
            }
            _ if verb.starts_with("OUT_SP_") && verb.len() == 9 => {
                if let Some(value) = arg {
                    self.replies
                        .insert(format!("IN_SP_{}", &verb[7..9]), value.to_string());
                }
                None
            }
            "IN_PV_1" => {
                let value = if self.remote { "1004.1" } else { "0000.0" };
                Some(format!("{value} mbar"))
            }
            _ => self.replies.get(line).cloned(),
        };

        match &reply {
            Some(text) => debug!(reply = %text, "reply"),
            None => debug!("silent"),
        }
        reply
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Store a seconds count as the instrument's `MM:SS` representation. Values
/// already containing a colon pass through untouched; anything unparsable is
/// dropped (the hardware ignores malformed settings).
fn to_mm_ss(text: &str) -> Option<String> {
    if text.contains(':') {
        return Some(text.to_string());
    }
    let seconds: u32 = text.parse().ok()?;
    Some(format!("{:02}:{:02}", seconds / 60, seconds % 60))
}

/// Frames the wire protocol: `\n`-terminated commands in (a stray `\r` is
/// tolerated), CRLF-terminated replies out.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(pos) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(pos + 1);
        let text = std::str::from_utf8(&line).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF-8 command")
        })?;
        Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 2);
        dst.put_slice(item.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// TCP server exposing one shared [`Simulator`] to any number of clients.
pub struct SimulatorServer {
    listener: TcpListener,
    simulator: Arc<Mutex<Simulator>>,
}

impl SimulatorServer {
    /// Bind the listener. Use port 0 to let the OS pick one.
    pub async fn bind(addr: &str, simulator: Simulator) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            simulator: Arc::new(Mutex::new(simulator)),
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle on the shared simulator state.
    pub fn simulator(&self) -> Arc<Mutex<Simulator>> {
        self.simulator.clone()
    }

    /// Accept clients until the task is cancelled.
    pub async fn run(self) -> std::io::Result<()> {
        info!(addr = %self.local_addr()?, "simulator listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            info!(%peer, "client connected");
            let simulator = self.simulator.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, simulator).await {
                    warn!(%peer, error = %e, "client error");
                }
                info!(%peer, "client disconnected");
            });
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    simulator: Arc<Mutex<Simulator>>,
) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, LineCodec);
    while let Some(line) = framed.next().await {
        let line = line?;
        let reply = simulator.lock().await.handle_line(&line);
        if let Some(reply) = reply {
            framed.send(reply).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_pressure_follows_remote_flag() {
        let mut sim = Simulator::new();
        assert_eq!(sim.handle_line("IN_PV_1").unwrap(), "1004.1 mbar");

        assert!(sim.handle_line("REMOTE -").is_none());
        assert_eq!(sim.handle_line("IN_PV_1").unwrap(), "0000.0 mbar");

        assert!(sim.handle_line("REMOTE 1").is_none());
        assert_eq!(sim.handle_line("IN_PV_1").unwrap(), "1004.1 mbar");
    }

    #[test]
    fn test_unknown_query_stays_silent() {
        let mut sim = Simulator::new();
        assert!(sim.handle_line("IN_NOPE").is_none());
        assert!(sim.handle_line("").is_none());
    }

    #[test]
    fn test_version_is_idempotent() {
        let mut sim = Simulator::new();
        let first = sim.handle_line("IN_VER").unwrap();
        for _ in 0..5 {
            assert_eq!(sim.handle_line("IN_VER").unwrap(), first);
        }
    }

    #[test]
    fn test_interval_write_reads_back_as_mm_ss() {
        let mut sim = Simulator::new();
        assert!(sim.handle_line("OUT_SP_1 330").is_none());
        assert_eq!(sim.handle_line("IN_SP_1").unwrap(), "05:30");

        assert!(sim.handle_line("OUT_SP_2 90").is_none());
        assert_eq!(sim.handle_line("IN_SP_2").unwrap(), "01:30");
    }

    #[test]
    fn test_setpoint_write_reads_back() {
        let mut sim = Simulator::new();
        assert!(sim.handle_line("OUT_SP_13 500 mbar").is_none());
        assert_eq!(sim.handle_line("IN_SP_13").unwrap(), "500 mbar");
        // The recording interval is untouched by the setpoint write.
        assert_eq!(sim.handle_line("IN_SP_2").unwrap(), "99:00");
    }

    #[test]
    fn test_settings_commands_are_silent() {
        let mut sim = Simulator::new();
        assert!(sim.handle_line("OUT_VENT 2").is_none());
        assert!(sim.handle_line("OUT_SENSOR 1").is_none());
        assert!(sim.handle_line("REMOTE 1").is_none());
    }

    #[test]
    fn test_malformed_interval_ignored() {
        let mut sim = Simulator::new();
        assert!(sim.handle_line("OUT_SP_1 banana").is_none());
        assert_eq!(sim.handle_line("IN_SP_1").unwrap(), "00:00");
    }

    #[test]
    fn test_config_overrides() {
        let mut config = SimulatorConfig::default();
        config
            .replies
            .insert("IN_VER".to_string(), "DCP 3000  V9.99".to_string());
        config.remote = false;

        let mut sim = Simulator::with_config(config);
        assert_eq!(sim.handle_line("IN_VER").unwrap(), "DCP 3000  V9.99");
        assert_eq!(sim.handle_line("IN_PV_1").unwrap(), "0000.0 mbar");
        // Untouched defaults remain.
        assert_eq!(sim.handle_line("IN_CFG").unwrap(), "1001144");
    }

    #[test]
    fn test_line_codec_round_trip() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(&b"IN_PV_1\r\nIN_VER\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "IN_PV_1");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "IN_VER");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let mut out = BytesMut::new();
        codec.encode("1004.1 mbar".to_string(), &mut out).unwrap();
        assert_eq!(&out[..], b"1004.1 mbar\r\n");
    }

    #[tokio::test]
    async fn test_server_replies_over_tcp() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server = SimulatorServer::bind("127.0.0.1:0", Simulator::new())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"IN_PV_1\n").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"1004.1 mbar\r\n");
    }
}
