//! Connection management
//!
//! Handles the panel link lifecycle: port discovery, the version handshake,
//! the background read loop, request/response correlation and teardown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    framer::{LineReader, FRAME_DELIMITER},
    listener::{EventStream, Listener, OneShotListener},
    message::Message,
    registry::ListenerRegistry,
    serial::{list_ports, open_port, PortInfo},
    transport::{split, ByteWriter},
    ProtocolError, Result, DEFAULT_BAUD_RATE,
};

/// Handshake request; the panel answers with `protocol_version_return`
pub const PROTOCOL_VERSION_EVENT: &str = "protocol_version";

/// Local event broadcast to every listener when the link goes down.
/// Never sent over the wire.
pub const CLOSED_EVENT: &str = "closed";

/// Replies to a request carry the request's event name plus this suffix.
///
/// There are no sequence numbers on the wire, so only one request per event
/// name can be waiting for its reply at a time.
pub const RETURN_SUFFIX: &str = "_return";

/// Terminator appended to every outgoing frame
const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport attached
    Disconnected,
    /// Transport attached, read loop starting
    Connecting,
    /// Waiting for the protocol version reply
    Handshaking,
    /// Handshake done, ready for requests
    Connected,
    /// Read loop ended, tearing down
    Closing,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port to use; `None` probes every port
    pub port_name: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// How long the panel gets to answer the version handshake
    pub handshake_timeout_ms: u64,
    /// Largest single write to the transport
    pub write_chunk_size: usize,
    /// Read poll interval of the read loop
    pub read_poll_ms: u64,
    /// Upper bound for probing all ports; `None` means no bound
    pub discovery_timeout_ms: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: DEFAULT_BAUD_RATE,
            handshake_timeout_ms: super::DEFAULT_HANDSHAKE_TIMEOUT_MS,
            write_chunk_size: super::DEFAULT_WRITE_CHUNK_SIZE,
            read_poll_ms: 10,
            discovery_timeout_ms: None,
        }
    }
}

impl ConnectionConfig {
    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }

    fn discovery_timeout(&self) -> Option<Duration> {
        self.discovery_timeout_ms.map(Duration::from_millis)
    }
}

/// Running read loop
struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// State shared between the connection handle and its read loop
struct Inner {
    config: ConnectionConfig,
    registry: Arc<ListenerRegistry>,
    /// Write half of the transport; the lock serializes frames
    writer: tokio::sync::Mutex<Option<ByteWriter>>,
    version: AtomicU32,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    /// Return events with a `request_with_result` currently waiting
    in_flight: Mutex<HashSet<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        tracing::trace!(?from, ?to, "connection state change");
    }

    /// Move from `from` to `to`; false if the connection is elsewhere
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        });
        if moved {
            tracing::trace!(?from, ?to, "connection state change");
        }
        moved
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        writer.write_all(data).await
    }

    /// Runs exactly once per read loop, whatever ended it
    async fn clean_up(&self) {
        self.set_state(ConnectionState::Closing);

        let closed = Message::new(CLOSED_EVENT);
        self.registry.trigger_listener(CLOSED_EVENT, &closed).await;
        self.registry.cancel_all_listener().await;

        if let Some(writer) = self.writer.lock().await.take() {
            writer.close().await;
        }
        lock(&self.session).take();
        self.version.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("panel connection closed");
    }
}

/// Deregisters a `request_with_result` listener however the request ends,
/// including when the caller drops the future.
struct PendingReply<'a> {
    inner: &'a Inner,
    event: String,
    listener: Arc<dyn Listener>,
}

impl<'a> PendingReply<'a> {
    fn register(inner: &'a Inner, event: String, listener: Arc<dyn Listener>) -> Result<Self> {
        if !lock(&inner.in_flight).insert(event.clone()) {
            let request = event.trim_end_matches(RETURN_SUFFIX).to_string();
            return Err(ProtocolError::RequestInFlight(request));
        }
        inner.registry.add_listener(&event, listener.clone());
        Ok(Self {
            inner,
            event,
            listener,
        })
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.inner
            .registry
            .remove_listener(&self.event, &self.listener);
        lock(&self.inner.in_flight).remove(&self.event);
    }
}

/// Panel connection over a line-delimited JSON link.
///
/// All methods take `&self`; share the connection between tasks with an
/// `Arc`. Dropping the connection stops its read loop.
pub struct Connection {
    inner: Arc<Inner>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl Connection {
    /// Create a new connection (not yet connected)
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Arc::new(ListenerRegistry::new()),
                writer: tokio::sync::Mutex::new(None),
                version: AtomicU32::new(0),
                state: watch::Sender::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// List available serial ports
    pub fn list_ports() -> Vec<PortInfo> {
        list_ports()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Protocol version reported by the panel; 0 when not connected
    pub fn version(&self) -> u32 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch state transitions, e.g. to notice a dropped link
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Listener registry backing this connection
    pub fn registry(&self) -> &ListenerRegistry {
        &self.inner.registry
    }

    pub fn add_listener(&self, event: &str, listener: Arc<dyn Listener>) {
        self.inner.registry.add_listener(event, listener);
    }

    pub fn remove_listener(&self, event: &str, listener: &Arc<dyn Listener>) -> bool {
        self.inner.registry.remove_listener(event, listener)
    }

    /// Connect using the port and baud rate from the configuration
    pub async fn open(&self) -> Result<u32> {
        let port = self.inner.config.port_name.clone();
        self.connect(port.as_deref(), self.inner.config.baud_rate)
            .await
    }

    /// Connect and report success as a bool, logging the failure reason.
    ///
    /// Meant for supervisor loops that simply retry after a delay.
    pub async fn init(&self, port: Option<&str>, baud_rate: u32) -> bool {
        match self.connect(port, baud_rate).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "panel init failed");
                false
            }
        }
    }

    /// Connect to the panel on `port`, or probe every serial port when `port`
    /// is `None` or empty. Returns the negotiated protocol version.
    pub async fn connect(&self, port: Option<&str>, baud_rate: u32) -> Result<u32> {
        if let Some(port) = port.filter(|p| !p.is_empty()) {
            return self.connect_port(port, baud_rate).await;
        }

        let Some(limit) = self.inner.config.discovery_timeout() else {
            return self.discover(baud_rate).await;
        };
        match tokio::time::timeout(limit, self.discover(baud_rate)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(limit_ms = limit.as_millis() as u64, "port discovery timed out");
                // The attempt in progress may have left a read loop running
                self.close().await;
                Err(ProtocolError::NoDeviceFound)
            }
        }
    }

    async fn discover(&self, baud_rate: u32) -> Result<u32> {
        let ports = list_ports();
        tracing::debug!(count = ports.len(), "probing serial ports for a panel");
        for port in ports {
            match self.connect_port(&port.name, baud_rate).await {
                Ok(version) => return Ok(version),
                Err(e) => tracing::debug!(port = %port.name, error = %e, "no panel on port"),
            }
        }
        Err(ProtocolError::NoDeviceFound)
    }

    async fn connect_port(&self, port: &str, baud_rate: u32) -> Result<u32> {
        let stream = open_port(port, baud_rate)?;
        let version = self.connect_transport(stream).await?;
        tracing::info!(port, baud_rate, version, "panel connected");
        Ok(version)
    }

    /// Attach an already-open byte stream, start the read loop and run the
    /// version handshake.
    ///
    /// On handshake failure the connection is closed again. If this future is
    /// dropped mid-handshake the read loop keeps running until [`close`] is
    /// called.
    ///
    /// [`close`]: Connection::close
    pub async fn connect_transport<T>(&self, transport: T) -> Result<u32>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        if !self
            .inner
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(ProtocolError::AlreadyConnected);
        }

        let config = &self.inner.config;
        let (reader, writer) = split(transport, config.write_chunk_size);
        let lines = LineReader::new(reader, config.read_poll());
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            // Held across spawn so a loop that dies instantly cannot clear the
            // session before it is stored
            let mut session = lock(&self.inner.session);
            let task = tokio::spawn(read_loop(
                self.inner.clone(),
                lines,
                writer,
                cancel.clone(),
                ready_tx,
            ));
            *session = Some(Session { cancel, task });
        }

        match self.handshake(ready_rx).await {
            Ok(version) => {
                self.inner.version.store(version, Ordering::SeqCst);
                if !self
                    .inner
                    .transition(ConnectionState::Handshaking, ConnectionState::Connected)
                {
                    self.inner.version.store(0, Ordering::SeqCst);
                    return Err(ProtocolError::Handshake(
                        "link dropped during handshake".to_string(),
                    ));
                }
                Ok(version)
            }
            Err(e) => {
                tracing::debug!(error = %e, "handshake failed, closing");
                self.close().await;
                Err(match e {
                    ProtocolError::Handshake(_) => e,
                    other => ProtocolError::Handshake(other.to_string()),
                })
            }
        }
    }

    async fn handshake(&self, ready: oneshot::Receiver<()>) -> Result<u32> {
        let limit = self.inner.config.handshake_timeout();
        match tokio::time::timeout(limit, ready).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(ProtocolError::Handshake(
                    "link closed before handshake".to_string(),
                ))
            }
            Err(_) => {
                return Err(ProtocolError::Handshake(
                    "input never went quiet".to_string(),
                ))
            }
        }

        if !self
            .inner
            .transition(ConnectionState::Connecting, ConnectionState::Handshaking)
        {
            return Err(ProtocolError::Handshake(
                "link dropped during handshake".to_string(),
            ));
        }

        let reply = self
            .request_with_result(PROTOCOL_VERSION_EVENT, Map::new(), Some(limit))
            .await?;
        match reply.version() {
            Some(version) if version > 0 => Ok(version),
            _ => Err(ProtocolError::InvalidResponse(format!(
                "bad protocol version in {:?}",
                reply.get("version")
            ))),
        }
    }

    /// Stop the read loop and wait for teardown to finish. Idempotent.
    ///
    /// Must not be awaited from inside a listener's `deliver`, which runs on
    /// the read loop itself.
    pub async fn close(&self) {
        let session = lock(&self.inner.session).take();
        match session {
            Some(session) => {
                session.cancel.cancel();
                if let Err(e) = session.task.await {
                    tracing::error!(error = %e, "read loop task failed");
                }
            }
            None => {
                // The read loop may already be tearing itself down
                let mut state = self.inner.state.subscribe();
                let _ = state
                    .wait_for(|s| *s != ConnectionState::Closing)
                    .await;
            }
        }
    }

    /// Write raw bytes to the panel. Frames from concurrent callers never
    /// interleave.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.inner.write(data).await
    }

    /// Send `{event, ...payload}` without waiting for a reply
    pub async fn request(&self, event: &str, payload: Map<String, Value>) -> Result<()> {
        let mut frame = Message::with_payload(event, payload).encode()?;
        frame.extend_from_slice(LINE_TERMINATOR);
        tracing::debug!(event, len = frame.len(), "sending request");
        self.inner.write(&frame).await?;
        Ok(())
    }

    /// Send a request and wait for its `<event>_return` reply.
    ///
    /// `timeout` covers both sending and waiting. The reply listener is
    /// removed before this returns, on every path. A second concurrent
    /// request for the same event fails with
    /// [`ProtocolError::RequestInFlight`].
    pub async fn request_with_result(
        &self,
        event: &str,
        payload: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let listener = Arc::new(OneShotListener::new());
        let _pending = PendingReply::register(
            &self.inner,
            format!("{event}{RETURN_SUFFIX}"),
            listener.clone(),
        )?;

        let exchange = async {
            self.request(event, payload).await?;
            listener.wait(None).await
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.map_err(|_| {
                tracing::debug!(event, "request timed out");
                ProtocolError::Timeout
            })?,
            None => exchange.await,
        }
    }

    /// Stream every message the panel sends for `event`.
    ///
    /// Each call gets its own queue. The stream ends once the connection
    /// closes, after yielding the `closed` notification if it subscribed to
    /// [`CLOSED_EVENT`].
    pub fn event_iter(&self, event: &str) -> EventStream {
        EventStream::subscribe(self.inner.registry.clone(), event)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.inner.session).as_ref() {
            session.cancel.cancel();
        }
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    mut lines: LineReader,
    writer: ByteWriter,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) {
    tokio::select! {
        _ = cancel.cancelled() => tracing::debug!("read loop cancelled"),
        result = listen(&inner, &mut lines, writer, ready) => match result {
            Err(e) if e.is_link_broken() => {
                tracing::warn!(error = %e, "read failed, panel disconnected");
            }
            Err(e) => tracing::error!(error = %e, "read loop stopped"),
            Ok(()) => {}
        },
    }
    drop(lines);
    inner.clean_up().await;
}

async fn listen(
    inner: &Inner,
    lines: &mut LineReader,
    writer: ByteWriter,
    ready: oneshot::Sender<()>,
) -> Result<()> {
    *inner.writer.lock().await = Some(writer);
    // Terminate anything the panel half-received from an earlier session
    inner.write(LINE_TERMINATOR).await?;
    lines.flush_input().await?;
    let _ = ready.send(());

    loop {
        let frame = lines.read_until(FRAME_DELIMITER, None).await?;
        if frame.trim_ascii().is_empty() {
            continue;
        }
        match Message::decode(&frame) {
            Ok(message) => {
                let reached = inner
                    .registry
                    .trigger_listener(message.event(), &message)
                    .await;
                tracing::trace!(event = message.event(), reached, "dispatched");
            }
            Err(e) => tracing::warn!(
                error = %e,
                frame = %String::from_utf8_lossy(&frame).trim_end(),
                "dropping malformed frame"
            ),
        }
        tokio::task::yield_now().await;
    }
}
