//! TCP connection management with line-delimited I/O.
//!
//! Stratum v1 uses newline-delimited JSON over TCP. This module provides a
//! wrapper around tokio's TCP stream that handles buffered reading and writing
//! of complete JSON-RPC messages. The [`Transport`] trait abstracts message
//! I/O and the [`Connector`] trait abstracts dialing, allowing channel-based
//! mocks for deterministic testing of the reconnect loop.

use std::time::Duration;

use async_trait::async_trait;

use super::backoff::BackoffConfig;
use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace};

/// Connection timing and retry policy.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on DNS resolution plus TCP connect
    pub connect_timeout: Duration,

    /// Bound on waiting for a subscribe or authorize response
    pub request_timeout: Duration,

    /// Silence after which we ping the pool. Three intervals without any
    /// inbound line and the socket is considered dead.
    pub keepalive_interval: Duration,

    /// Pause before reconnecting after the pool forces a new session
    pub forced_reconnect_pause: Duration,

    pub backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            forced_reconnect_pause: Duration::from_secs(2),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Message-level I/O for Stratum protocol.
///
/// Abstracts reading and writing JSON-RPC messages so the client can
/// run over TCP (production) or channels (tests).
#[async_trait]
pub trait Transport: Send {
    /// Read one complete JSON-RPC message.
    ///
    /// Returns `None` on clean connection close (EOF). A line that is not a
    /// valid message yields [`StratumError::InvalidMessage`]; the transport
    /// stays usable.
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>>;

    /// Write a JSON-RPC message.
    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()>;
}

/// Opens a fresh transport for each session.
#[async_trait]
pub trait Connector: Send {
    type Transport: Transport;

    async fn connect(&mut self) -> StratumResult<Self::Transport>;
}

/// Dials the pool over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    url: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Transport = Connection;

    async fn connect(&mut self) -> StratumResult<Connection> {
        Connection::connect(&self.url, self.connect_timeout).await
    }
}

/// Buffered TCP connection for Stratum protocol.
///
/// Wraps a TCP stream with buffered readers/writers optimized for
/// line-delimited JSON messages. Messages are automatically serialized
/// and deserialized, with newlines added/stripped.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    line_buf: String,
}

impl Connection {
    /// Create a new connection from a TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();

        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            line_buf: String::with_capacity(4096),
        }
    }

    /// Connect to a Stratum pool.
    ///
    /// Supports `stratum+tcp://`, plain `tcp://`, and bare `host:port`.
    /// Resolution and connect together must finish within `connect_timeout`.
    /// The socket has `SO_KEEPALIVE` enabled so the kernel probes idle
    /// connections as well.
    pub async fn connect(url: &str, connect_timeout: Duration) -> StratumResult<Self> {
        let addr = parse_pool_url(url)?;

        debug!(addr = %addr, "Connecting to pool");

        let stream = tokio::time::timeout(connect_timeout, open_stream(&addr))
            .await
            .map_err(|_| StratumError::Timeout("connect"))??;

        stream.set_nodelay(true)?;

        debug!(addr = %addr, "Connected to pool");

        Ok(Self::new(stream))
    }
}

/// Strip the scheme and validate `host:port`.
pub fn parse_pool_url(url: &str) -> StratumResult<String> {
    let addr = url
        .strip_prefix("stratum+tcp://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
        .trim_end_matches('/');

    if addr.contains("://") {
        return Err(StratumError::InvalidUrl(format!(
            "unsupported scheme: {}",
            url
        )));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| StratumError::InvalidUrl(format!("missing port: {}", url)))?;

    if host.is_empty() {
        return Err(StratumError::InvalidUrl(format!("missing host: {}", url)));
    }
    port.parse::<u16>()
        .map_err(|_| StratumError::InvalidUrl(format!("invalid port: {}", url)))?;

    Ok(addr.to_string())
}

/// Try each resolved address in turn.
async fn open_stream(addr: &str) -> StratumResult<TcpStream> {
    let addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| StratumError::ConnectionFailed(format!("resolve {}: {}", addr, e)))?;

    let mut last_err = None;
    for sock_addr in addrs {
        let socket = if sock_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;

        match socket.connect(sock_addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                trace!(addr = %sock_addr, error = %e, "Connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(StratumError::ConnectionFailed(match last_err {
        Some(e) => format!("{}: {}", addr, e),
        None => format!("{}: no addresses resolved", addr),
    }))
}

#[async_trait]
impl Transport for Connection {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        loop {
            self.line_buf.clear();

            // read_line accumulates across partial reads until '\n' or EOF
            let n = self
                .reader
                .read_line(&mut self.line_buf)
                .await
                .map_err(StratumError::Io)?;

            if n == 0 {
                return Ok(None);
            }

            let line = self.line_buf.trim();
            if line.is_empty() {
                continue;
            }

            trace!(rx = %line, "Received message");

            let msg = serde_json::from_str(line).map_err(|e| {
                StratumError::InvalidMessage(format!("Failed to parse JSON: {}, line: {}", e, line))
            })?;

            return Ok(Some(msg));
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        let json = serde_json::to_string(msg)?;
        trace!(tx = %json, "Sending message");

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// client's side, the handle is the test's side.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<Result<JsonRpcMessage, String>>,
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

/// Test-side handle for a [`MockTransport`].
///
/// Use `send()` to feed messages to the client and `recv()` to read
/// messages the client wrote.
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<Result<JsonRpcMessage, String>>,
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (client_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: client_rx,
            tx: client_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        match self.rx.recv().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(line)) => Err(StratumError::InvalidMessage(line)),
            None => Ok(None),
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Send a message to the client.
    pub fn send(&self, msg: JsonRpcMessage) {
        self.tx.send(Ok(msg)).expect("transport dropped");
    }

    /// Deliver a line the client cannot parse.
    pub fn send_malformed(&self, line: &str) {
        self.tx
            .send(Err(line.to_string()))
            .expect("transport dropped");
    }

    /// Receive a message the client wrote.
    pub async fn recv(&mut self) -> JsonRpcMessage {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Receive a message, or `None` once the client dropped the transport.
    pub async fn try_recv(&mut self) -> Option<JsonRpcMessage> {
        self.rx.recv().await
    }
}

/// Hands out queued [`MockTransport`]s, one per connect.
///
/// Connecting with nothing queued fails like a refused connection. Every
/// attempt is timestamped so tests can check the backoff schedule.
#[cfg(test)]
pub(crate) struct MockConnector {
    queue: tokio::sync::mpsc::UnboundedReceiver<MockTransport>,
    attempts: std::sync::Arc<std::sync::Mutex<Vec<tokio::time::Instant>>>,
}

#[cfg(test)]
impl MockConnector {
    pub fn new() -> (
        Self,
        tokio::sync::mpsc::UnboundedSender<MockTransport>,
        std::sync::Arc<std::sync::Mutex<Vec<tokio::time::Instant>>>,
    ) {
        let (tx, queue) = tokio::sync::mpsc::unbounded_channel();
        let attempts = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        (
            Self {
                queue,
                attempts: attempts.clone(),
            },
            tx,
            attempts,
        )
    }
}

#[cfg(test)]
#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&mut self) -> StratumResult<MockTransport> {
        self.attempts
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        self.queue
            .try_recv()
            .map_err(|_| StratumError::ConnectionFailed("connection refused".to_string()))
    }
}
