//! Rate-limited, serialized transaction engine
//!
//! The instrument accepts at most 20 commands per second and answers one
//! request at a time, so every exchange on a connection has to be paced and
//! serialized. The engine owns both concerns:
//! - a rate gate holding the timestamp of the last completed transaction,
//!   delaying the next one until the minimum interval has passed
//! - a mutex around the connection so only one exchange is ever in flight
//!
//! Two flavors implement the identical contract, chosen at construction time
//! by the connection trait the caller supplies:
//! - [`Protocol`] for callers on dedicated threads (sleeps, lock)
//! - [`AsyncProtocol`] for callers under a task scheduler (yields, async
//!   mutex)
//!
//! The engine never retries: connection failures and malformed replies
//! surface to the caller unchanged, and the rate-gate timestamp is recorded
//! on failure too, so a faulted transaction does not let the next one skip
//! ahead of the device's recovery time.

use crate::codec;
use crate::connection::{AsyncConnection, Connection, ConnectionError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Minimum spacing between transactions. The datasheet allows 20 commands
/// per second; 60 ms leaves a safety margin over the strict 50 ms.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(60);

/// Protocol engine errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The connection failed to write or read
    #[error("Communication failed: {0}")]
    Communication(#[from] ConnectionError),

    /// The deadline passed before the transaction could complete
    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Minimum spacing between transactions, in milliseconds
    pub min_interval_ms: u64,
    /// Discard buffered input before each transaction. Off by default; turn
    /// on for instruments observed to emit unsolicited bytes after settings
    /// commands.
    pub flush_input: bool,
}

impl ProtocolConfig {
    /// Set the minimum transaction spacing
    #[must_use]
    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enable or disable the pre-transaction input flush
    #[must_use]
    pub fn flush_input(mut self, flush: bool) -> Self {
        self.flush_input = flush;
        self
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: DEFAULT_MIN_INTERVAL.as_millis() as u64,
            flush_input: false,
        }
    }
}

/// Connection plus rate-gate state, guarded together so the timestamp can
/// only change while the transaction lock is held.
struct Shared<C> {
    conn: C,
    last_end: Option<Instant>,
}

impl<C> Shared<C> {
    /// Time at which the next transaction may start.
    fn ready_at(&self, interval: Duration) -> Option<Instant> {
        self.last_end.map(|end| end + interval)
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Blocking transaction engine. One instance per connection.
pub struct Protocol<C: Connection> {
    shared: parking_lot::Mutex<Shared<C>>,
    config: ProtocolConfig,
}

impl<C: Connection> Protocol<C> {
    /// Create an engine with the default configuration.
    pub fn new(conn: C) -> Self {
        Self::with_config(conn, ProtocolConfig::default())
    }

    /// Create an engine with an explicit configuration.
    pub fn with_config(conn: C, config: ProtocolConfig) -> Self {
        Self {
            shared: parking_lot::Mutex::new(Shared {
                conn,
                last_end: None,
            }),
            config,
        }
    }

    /// Consume the engine and return the connection.
    pub fn into_inner(self) -> C {
        self.shared.into_inner().conn
    }

    /// Write a command and read one reply line, returned with the
    /// terminator stripped.
    pub fn query(&self, command: &str) -> Result<String, ProtocolError> {
        self.query_with_deadline(command, None)
    }

    /// [`query`](Self::query) bounded by a deadline. Fails with
    /// [`ProtocolError::DeadlineExceeded`] without touching the wire when
    /// the rate-gate wait cannot finish in time.
    pub fn query_with_deadline(
        &self,
        command: &str,
        deadline: Option<Instant>,
    ) -> Result<String, ProtocolError> {
        let mut shared = self.shared.lock();
        self.pace(&shared, deadline)?;
        self.pre_flush(&mut shared)?;

        debug!(command, "write");
        let result = shared.conn.write_readline(&codec::encode(command));
        shared.last_end = Some(Instant::now());

        let raw = result?;
        let reply = codec::decode(&raw);
        debug!(reply = %reply, "read");
        Ok(reply)
    }

    /// Write a command without expecting a reply.
    pub fn post(&self, command: &str) -> Result<(), ProtocolError> {
        self.post_with_deadline(command, None)
    }

    /// [`post`](Self::post) bounded by a deadline.
    pub fn post_with_deadline(
        &self,
        command: &str,
        deadline: Option<Instant>,
    ) -> Result<(), ProtocolError> {
        let mut shared = self.shared.lock();
        self.pace(&shared, deadline)?;
        self.pre_flush(&mut shared)?;

        debug!(command, "write");
        let result = shared.conn.write(&codec::encode(command));
        shared.last_end = Some(Instant::now());
        result?;
        Ok(())
    }

    /// Sleep out the rate gate, honoring the deadline.
    fn pace(&self, shared: &Shared<C>, deadline: Option<Instant>) -> Result<(), ProtocolError> {
        if let Some(ready) = shared.ready_at(self.config.interval()) {
            let now = Instant::now();
            if ready > now {
                if deadline.is_some_and(|d| ready >= d) {
                    return Err(ProtocolError::DeadlineExceeded);
                }
                std::thread::sleep(ready - now);
            }
        }
        if deadline_passed(deadline) {
            return Err(ProtocolError::DeadlineExceeded);
        }
        Ok(())
    }

    fn pre_flush(&self, shared: &mut Shared<C>) -> Result<(), ProtocolError> {
        if self.config.flush_input {
            shared.conn.flush_input()?;
        }
        Ok(())
    }
}

/// Cooperative transaction engine. One instance per connection.
pub struct AsyncProtocol<C: AsyncConnection> {
    shared: tokio::sync::Mutex<Shared<C>>,
    config: ProtocolConfig,
}

impl<C: AsyncConnection> AsyncProtocol<C> {
    /// Create an engine with the default configuration.
    pub fn new(conn: C) -> Self {
        Self::with_config(conn, ProtocolConfig::default())
    }

    /// Create an engine with an explicit configuration.
    pub fn with_config(conn: C, config: ProtocolConfig) -> Self {
        Self {
            shared: tokio::sync::Mutex::new(Shared {
                conn,
                last_end: None,
            }),
            config,
        }
    }

    /// Consume the engine and return the connection.
    pub fn into_inner(self) -> C {
        self.shared.into_inner().conn
    }

    /// Write a command and read one reply line, returned with the
    /// terminator stripped.
    pub async fn query(&self, command: &str) -> Result<String, ProtocolError> {
        self.query_with_deadline(command, None).await
    }

    /// [`query`](Self::query) bounded by a deadline. A wait or an in-flight
    /// read past the deadline is abandoned; an abandoned read still records
    /// the rate-gate timestamp.
    pub async fn query_with_deadline(
        &self,
        command: &str,
        deadline: Option<Instant>,
    ) -> Result<String, ProtocolError> {
        let mut shared = self.acquire(deadline).await?;
        self.pace(&shared, deadline).await?;
        self.pre_flush(&mut shared).await?;

        debug!(command, "write");
        let data = codec::encode(command);
        let outcome = match deadline {
            Some(d) => {
                tokio::time::timeout_at(
                    tokio::time::Instant::from_std(d),
                    shared.conn.write_readline(&data),
                )
                .await
            }
            None => Ok(shared.conn.write_readline(&data).await),
        };
        shared.last_end = Some(Instant::now());

        let raw = match outcome {
            Ok(result) => result?,
            Err(_) => return Err(ProtocolError::DeadlineExceeded),
        };
        let reply = codec::decode(&raw);
        debug!(reply = %reply, "read");
        Ok(reply)
    }

    /// Write a command without expecting a reply.
    pub async fn post(&self, command: &str) -> Result<(), ProtocolError> {
        self.post_with_deadline(command, None).await
    }

    /// [`post`](Self::post) bounded by a deadline.
    pub async fn post_with_deadline(
        &self,
        command: &str,
        deadline: Option<Instant>,
    ) -> Result<(), ProtocolError> {
        let mut shared = self.acquire(deadline).await?;
        self.pace(&shared, deadline).await?;
        self.pre_flush(&mut shared).await?;

        debug!(command, "write");
        let data = codec::encode(command);
        let outcome = match deadline {
            Some(d) => {
                tokio::time::timeout_at(
                    tokio::time::Instant::from_std(d),
                    shared.conn.write(&data),
                )
                .await
            }
            None => Ok(shared.conn.write(&data).await),
        };
        shared.last_end = Some(Instant::now());

        match outcome {
            Ok(result) => result?,
            Err(_) => return Err(ProtocolError::DeadlineExceeded),
        }
        Ok(())
    }

    async fn acquire(
        &self,
        deadline: Option<Instant>,
    ) -> Result<tokio::sync::MutexGuard<'_, Shared<C>>, ProtocolError> {
        match deadline {
            Some(d) => {
                tokio::time::timeout_at(tokio::time::Instant::from_std(d), self.shared.lock())
                    .await
                    .map_err(|_| ProtocolError::DeadlineExceeded)
            }
            None => Ok(self.shared.lock().await),
        }
    }

    /// Yield until the rate gate opens, honoring the deadline.
    async fn pace(
        &self,
        shared: &Shared<C>,
        deadline: Option<Instant>,
    ) -> Result<(), ProtocolError> {
        if let Some(ready) = shared.ready_at(self.config.interval()) {
            if ready > Instant::now() {
                if deadline.is_some_and(|d| ready >= d) {
                    return Err(ProtocolError::DeadlineExceeded);
                }
                tokio::time::sleep_until(tokio::time::Instant::from_std(ready)).await;
            }
        }
        if deadline_passed(deadline) {
            return Err(ProtocolError::DeadlineExceeded);
        }
        Ok(())
    }

    async fn pre_flush(&self, shared: &mut Shared<C>) -> Result<(), ProtocolError> {
        if self.config.flush_input {
            shared.conn.flush_input().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Blocking fake that records the instant of every exchange.
    struct FakeConn {
        calls: Vec<Instant>,
        flushes: usize,
        reply: String,
        fail: bool,
    }

    impl FakeConn {
        fn new(reply: &str) -> Self {
            Self {
                calls: Vec::new(),
                flushes: 0,
                reply: reply.to_string(),
                fail: false,
            }
        }
    }

    impl Connection for FakeConn {
        fn write(&mut self, _data: &[u8]) -> Result<(), ConnectionError> {
            self.calls.push(Instant::now());
            if self.fail {
                return Err(ConnectionError::Closed);
            }
            Ok(())
        }

        fn write_readline(&mut self, data: &[u8]) -> Result<String, ConnectionError> {
            self.write(data)?;
            Ok(format!("{}\r\n", self.reply))
        }

        fn flush_input(&mut self) -> Result<(), ConnectionError> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn test_config() -> ProtocolConfig {
        ProtocolConfig::default().min_interval(Duration::from_millis(30))
    }

    #[test]
    fn test_query_strips_terminator() {
        let protocol = Protocol::with_config(FakeConn::new("0234 mbar"), test_config());
        assert_eq!(protocol.query("IN_PV_1").unwrap(), "0234 mbar");
    }

    #[test]
    fn test_rate_gate_spacing() {
        let interval = Duration::from_millis(30);
        let protocol = Protocol::with_config(FakeConn::new("ok"), test_config());

        let start = Instant::now();
        for _ in 0..3 {
            protocol.query("IN_VER").unwrap();
        }
        assert!(start.elapsed() >= 2 * interval);

        let conn = protocol.into_inner();
        for pair in conn.calls.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }

    #[test]
    fn test_rate_gate_holds_after_failure() {
        let interval = Duration::from_millis(30);
        let mut conn = FakeConn::new("ok");
        conn.fail = true;
        let protocol = Protocol::with_config(conn, test_config());

        assert!(protocol.query("IN_VER").is_err());
        let start = Instant::now();
        assert!(protocol.query("IN_VER").is_err());
        assert!(start.elapsed() >= interval);
    }

    #[test]
    fn test_deadline_expires_before_io() {
        let protocol = Protocol::with_config(FakeConn::new("ok"), test_config());
        protocol.query("IN_VER").unwrap();

        // The gate needs 30 ms; give it 5.
        let deadline = Some(Instant::now() + Duration::from_millis(5));
        let result = protocol.query_with_deadline("IN_VER", deadline);
        assert!(matches!(result, Err(ProtocolError::DeadlineExceeded)));

        // Only the first query reached the wire.
        assert_eq!(protocol.into_inner().calls.len(), 1);
    }

    #[test]
    fn test_flush_input_runs_per_transaction() {
        let config = test_config().flush_input(true);
        let protocol = Protocol::with_config(FakeConn::new("ok"), config);
        protocol.query("IN_VER").unwrap();
        protocol.post("REMOTE 1").unwrap();
        assert_eq!(protocol.into_inner().flushes, 2);
    }

    #[test]
    fn test_no_flush_by_default() {
        let protocol = Protocol::with_config(FakeConn::new("ok"), test_config());
        protocol.query("IN_VER").unwrap();
        assert_eq!(protocol.into_inner().flushes, 0);
    }

    /// Async fake that trips a flag if two exchanges ever overlap.
    struct OverlapConn {
        in_flight: Arc<AtomicBool>,
        overlapped: Arc<AtomicBool>,
        exchanges: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AsyncConnection for OverlapConn {
        async fn write(&mut self, _data: &[u8]) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn write_readline(&mut self, _data: &[u8]) -> Result<String, ConnectionError> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.store(false, Ordering::SeqCst);
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            Ok("ok\r\n".to_string())
        }

        async fn flush_input(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_async_rate_gate_spacing() {
        let conn = OverlapConn {
            in_flight: Arc::new(AtomicBool::new(false)),
            overlapped: Arc::new(AtomicBool::new(false)),
            exchanges: Arc::new(AtomicUsize::new(0)),
        };
        let protocol = AsyncProtocol::with_config(conn, test_config());

        let start = Instant::now();
        for _ in 0..3 {
            protocol.query("IN_VER").await.unwrap();
        }
        assert!(start.elapsed() >= 2 * Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_async_concurrent_queries_never_overlap() {
        let overlapped = Arc::new(AtomicBool::new(false));
        let exchanges = Arc::new(AtomicUsize::new(0));
        let conn = OverlapConn {
            in_flight: Arc::new(AtomicBool::new(false)),
            overlapped: overlapped.clone(),
            exchanges: exchanges.clone(),
        };
        let config = ProtocolConfig::default().min_interval(Duration::from_millis(1));
        let protocol = Arc::new(AsyncProtocol::with_config(conn, config));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let protocol = protocol.clone();
            handles.push(tokio::spawn(async move {
                protocol.query("IN_PV_1").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(exchanges.load(Ordering::SeqCst), 4);
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_async_deadline_expires_during_gate_wait() {
        let conn = OverlapConn {
            in_flight: Arc::new(AtomicBool::new(false)),
            overlapped: Arc::new(AtomicBool::new(false)),
            exchanges: Arc::new(AtomicUsize::new(0)),
        };
        let protocol = AsyncProtocol::with_config(conn, test_config());
        protocol.query("IN_VER").await.unwrap();

        let deadline = Some(Instant::now() + Duration::from_millis(5));
        let result = protocol.query_with_deadline("IN_VER", deadline).await;
        assert!(matches!(result, Err(ProtocolError::DeadlineExceeded)));
    }
}
