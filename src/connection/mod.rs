//! Console connection: handshake, busy token and command/response primitives.
//!
//! # Lifecycle
//!
//! ```text
//! Connection::connect(config) ── TCP ──► wire worker spawned
//!                                        │
//!                              "201- connected"?  no ──► Handshake error, closed
//!                                        │ yes
//!                                        ▼
//!                     busy().await ──► BusyToken ──► send_command / read_bytes / ...
//!                                        │
//!          close() / fatal error ────────┴──► closed for good (reconnect to retry)
//! ```
//!
//! Every wire operation is a method on [`BusyToken`], so holding the token
//! is the only way to talk to the console. The convenience methods on
//! [`Connection`] wait for the token, run one operation and release it.

pub mod console;
pub mod features;
pub mod pointer;
mod reader;
pub mod transfer;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::address::AddressRange;
use crate::busy::{BusyGuard, BusyLock};
use crate::config::ConsoleConfig;
use crate::error::{ConnectionError, Result};
use crate::events::listener::EventHub;
use crate::protocol::{Response, ResponseType, WireDialect, XbdmDialect};

use features::{CapabilitySet, ProbeRegistry};
use reader::{WireRequest, WireShared, WireTiming};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A live connection to a console's debug monitor.
///
/// Cheap to clone; clones share the socket, busy slot and event listener.
/// The socket closes when [`Connection::close`] is called, when a fatal
/// error occurs, or when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConsoleConfig,
    peer: SocketAddr,
    wire: Arc<WireShared>,
    requests: mpsc::Sender<WireRequest>,
    busy: BusyLock,
    dialect: Arc<dyn WireDialect>,
    probes: Arc<ProbeRegistry>,
    capabilities: Mutex<CapabilitySet>,
    events: Arc<EventHub>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.events.shutdown();
        self.wire.close("connection dropped", true);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .field("busy", &self.inner.busy.is_held())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect and verify the greeting, using the process-wide probe
    /// registry and the standard dialect.
    pub async fn connect(config: ConsoleConfig) -> Result<Self> {
        Self::connect_with(config, ProbeRegistry::global(), Arc::new(XbdmDialect)).await
    }

    /// Connect with an explicit probe registry and wire dialect.
    pub async fn connect_with(
        config: ConsoleConfig,
        probes: Arc<ProbeRegistry>,
        dialect: Arc<dyn WireDialect>,
    ) -> Result<Self> {
        let endpoint = config.endpoint();
        let stream = match tokio::time::timeout(
            config.connect_timeout(),
            tokio::net::TcpStream::connect(&endpoint),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_elapsed) => {
                return Err(ConnectionError::Timeout {
                    waited: config.connect_timeout(),
                })
            }
        };
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let wire = Arc::new(WireShared::new(id.to_string(), stream.try_clone()?));
        let timing = WireTiming {
            read_timeout: config.read_timeout(),
            poll_interval: config.poll_interval(),
        };
        let requests = reader::spawn(stream, Arc::clone(&wire), timing)?;

        let conn = Self {
            inner: Arc::new(Inner {
                events: Arc::new(EventHub::new()),
                config,
                peer,
                wire,
                requests,
                busy: BusyLock::new(),
                dialect,
                probes,
                capabilities: Mutex::new(CapabilitySet::baseline()),
            }),
        };

        let greeting = {
            let token = conn.try_busy()?;
            token.read_line().await?
        };
        if !conn.inner.dialect.accepts_greeting(&greeting) {
            conn.close_for(&format!("unexpected greeting {greeting:?}"));
            return Err(ConnectionError::Handshake(format!(
                "console at {endpoint} greeted with {greeting:?}"
            )));
        }
        log::info!("[xbdm] connected to {peer}");
        Ok(conn)
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.wire.is_closed()
    }

    /// Say goodbye and close the socket. Idempotent.
    ///
    /// Stops the event listener as well.
    pub fn close(&self) {
        self.inner.events.shutdown();
        self.inner.wire.close("closed by caller", true);
    }

    pub(crate) fn close_for(&self, reason: &str) {
        self.inner.events.shutdown();
        self.inner.wire.close(reason, false);
    }

    /// Settings this connection was opened with.
    pub fn config(&self) -> &ConsoleConfig {
        &self.inner.config
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Whether multi-byte values are little-endian on the console.
    pub fn is_little_endian(&self) -> bool {
        self.inner.config.little_endian
    }

    /// The span of addresses this connection can read and write.
    pub fn addressable_range(&self) -> AddressRange {
        AddressRange::full()
    }

    /// Capabilities known so far. Updated by feature detection.
    pub fn capabilities(&self) -> CapabilitySet {
        *self
            .inner
            .capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_capabilities(&self, capabilities: CapabilitySet) {
        *self
            .inner
            .capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = capabilities;
    }

    pub(crate) fn probes(&self) -> &ProbeRegistry {
        &self.inner.probes
    }

    pub(crate) fn dialect(&self) -> &dyn WireDialect {
        self.inner.dialect.as_ref()
    }

    pub(crate) fn shared_dialect(&self) -> Arc<dyn WireDialect> {
        Arc::clone(&self.inner.dialect)
    }

    pub(crate) fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    // ── Busy token ──────────────────────────────────────────────────────────

    /// Whether an operation currently holds the busy token.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.is_held()
    }

    /// Take the busy token without waiting.
    ///
    /// Fails with [`ConnectionError::Busy`] if another operation holds it.
    pub fn try_busy(&self) -> Result<BusyToken<'_>> {
        self.ensure_open()?;
        let guard = self.inner.busy.try_enter()?;
        Ok(BusyToken { conn: self, _guard: guard })
    }

    /// Wait for the busy token.
    ///
    /// Returns `None` on timeout or cancellation, or if the connection is
    /// already closed.
    pub async fn acquire_busy(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Option<BusyToken<'_>> {
        if self.is_closed() {
            return None;
        }
        let guard = self.inner.busy.acquire(timeout, cancel).await?;
        Some(BusyToken { conn: self, _guard: guard })
    }

    /// Wait for the busy token with no deadline.
    pub async fn busy(&self) -> Result<BusyToken<'_>> {
        self.ensure_open()?;
        let guard = self
            .inner
            .busy
            .acquire(None, &CancellationToken::new())
            .await
            .ok_or(ConnectionError::Busy)?;
        let token = BusyToken { conn: self, _guard: guard };
        self.ensure_open()?;
        Ok(token)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    // ── Convenience ─────────────────────────────────────────────────────────

    /// Send a command and classify its status line.
    pub async fn send_command(&self, command: &str) -> Result<Response> {
        self.busy().await?.send_command(command).await
    }

    /// Send a command that answers with a multi-line reply.
    pub async fn send_command_lines(&self, command: &str) -> Result<Vec<String>> {
        self.busy().await?.send_command_lines(command).await
    }
}

/// Exclusive lease on a connection's wire.
///
/// At most one exists per connection at a time. Dropping it lets the next
/// waiting operation proceed.
pub struct BusyToken<'a> {
    conn: &'a Connection,
    _guard: BusyGuard<'a>,
}

impl std::fmt::Debug for BusyToken<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyToken")
            .field("peer", &self.conn.inner.peer)
            .finish_non_exhaustive()
    }
}

impl<'a> BusyToken<'a> {
    /// The connection this token belongs to.
    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    /// Hand a request to the wire worker and wait for its reply.
    ///
    /// If this future is dropped before the reply arrives the worker may
    /// already have consumed part of a frame, so the connection is closed.
    async fn exchange<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> WireRequest,
    ) -> Result<T> {
        self.conn.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        let wire = Arc::clone(&self.conn.inner.wire);
        let abandoned = scopeguard::guard((), move |()| {
            wire.close("operation abandoned mid-exchange", false);
        });

        let outcome = match self.conn.inner.requests.send(build(reply)).await {
            Ok(()) => rx.await.unwrap_or(Err(ConnectionError::Closed)),
            Err(_) => Err(ConnectionError::Closed),
        };
        scopeguard::ScopeGuard::into_inner(abandoned);
        outcome
    }

    /// Write raw bytes.
    pub async fn write_raw(&self, bytes: Vec<u8>) -> Result<()> {
        self.exchange(|reply| WireRequest::Write { bytes, reply }).await
    }

    /// Write a command, appending CRLF if missing.
    pub async fn write_command(&self, command: &str) -> Result<()> {
        log::debug!("[xbdm] > {command}");
        let bytes = self.conn.dialect().encode_command(command);
        self.write_raw(bytes).await
    }

    /// Read one line.
    pub async fn read_line(&self) -> Result<String> {
        self.read_line_cancellable(&CancellationToken::new()).await
    }

    /// Read one line; `cancel` aborts the read and closes the connection.
    pub async fn read_line_cancellable(&self, cancel: &CancellationToken) -> Result<String> {
        let cancel = cancel.clone();
        self.exchange(|reply| WireRequest::ReadLine { cancel, reply }).await
    }

    /// Read exactly `len` bytes, starting with any already buffered.
    pub async fn read_exact(&self, len: usize) -> Result<Vec<u8>> {
        let cancel = CancellationToken::new();
        self.exchange(|reply| WireRequest::ReadExact {
            buf: vec![0; len],
            cancel,
            reply,
        })
        .await
    }

    /// Read and classify a status line.
    pub async fn read_response(&self) -> Result<Response> {
        let line = self.read_line().await?;
        let response = self.conn.dialect().classify(&line)?;
        log::debug!("[xbdm] < {}", response.kind);
        Ok(response)
    }

    /// Read lines until the multi-line terminator, which is consumed but
    /// not returned.
    pub async fn read_multiline(&self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if self.conn.dialect().is_terminator(&line) {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    /// Send a command and read its status line.
    pub async fn send_command(&self, command: &str) -> Result<Response> {
        self.write_command(command).await?;
        self.read_response().await
    }

    /// Send a command and require a particular response type.
    pub async fn send_command_expect(
        &self,
        command: &str,
        expected: ResponseType,
    ) -> Result<Response> {
        let response = self.send_command(command).await?;
        if response.kind == expected {
            Ok(response)
        } else {
            Err(ConnectionError::unexpected(command, response.kind, expected))
        }
    }

    /// Send a command that answers with a multi-line reply and collect the
    /// lines.
    pub async fn send_command_lines(&self, command: &str) -> Result<Vec<String>> {
        self.send_command_expect(command, ResponseType::MultiResponse).await?;
        self.read_multiline().await
    }
}
