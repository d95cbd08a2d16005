//! The notification channel.
//!
//! The command wire cannot carry unsolicited lines, so events arrive on a
//! second TCP connection to the same console, owned by its own thread:
//!
//! ```text
//!  subscribe_events ──► EventHub ── first subscriber ──► [xbdm-events-N thread]
//!                          ▲                               │ greeting
//!                          │                               │ debugger connect ... → 200
//!                          │                               │ notify ... reverse   → 205
//!                          │                               ▼
//!                   handler snapshot ◄──── ConsoleEvent ◄── poll / read line
//! ```
//!
//! Subscriptions are counted: the thread starts with the first and stops
//! after the last is dropped. Each event is handed to every handler in
//! turn. A handler that errors or panics is logged and skipped.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use super::ConsoleEvent;
use crate::connection::Connection;
use crate::constants::{EVENT_POLL_INTERVAL, NOTIFY_RECONNECT_PORT, READ_BUFFER_SIZE};
use crate::error::{ConnectionError, Result};
use crate::protocol::{LineBuffer, Response, ResponseType, WireDialect};

/// Callback invoked for every event.
pub type EventHandler = Arc<dyn Fn(&ConsoleEvent) -> anyhow::Result<()> + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a listener thread.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ListenerStatus {
    Starting,
    Running,
    Failed(String),
    Stopped,
}

/// What the listener thread needs to reach the console.
struct ListenerSpec {
    peer: SocketAddr,
    dialect: Arc<dyn WireDialect>,
    debugger_name: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

/// A running listener thread.
struct ListenerHandle {
    stop: Arc<AtomicBool>,
    socket: Arc<Mutex<Option<TcpStream>>>,
    status: watch::Receiver<ListenerStatus>,
}

impl ListenerHandle {
    fn is_finished(&self) -> bool {
        matches!(
            *self.status.borrow(),
            ListenerStatus::Failed(_) | ListenerStatus::Stopped
        )
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if let Some(socket) = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    listener: Option<ListenerHandle>,
}

/// Subscribers of one connection and the listener serving them.
#[derive(Default)]
pub(crate) struct EventHub {
    handlers: Arc<Mutex<Vec<(u64, EventHandler)>>>,
    state: Mutex<HubState>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl EventHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn subscriber_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Add a handler, starting the listener if none is running.
    fn register(
        &self,
        handler: EventHandler,
        spec: impl FnOnce() -> ListenerSpec,
    ) -> Result<(u64, watch::Receiver<ListenerStatus>)> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let running = state
            .listener
            .as_ref()
            .filter(|listener| !listener.is_finished())
            .map(|listener| listener.status.clone());
        let status = match running {
            Some(status) => status,
            None => {
                if let Some(stale) = state.listener.take() {
                    stale.stop();
                }
                let listener = spawn_listener(spec(), Arc::clone(&self.handlers))?;
                let status = listener.status.clone();
                state.listener = Some(listener);
                status
            }
        };

        state.next_id += 1;
        let id = state.next_id;
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        Ok((id, status))
    }

    /// Remove a handler, stopping the listener after the last one.
    fn unregister(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = {
            let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            handlers.retain(|(handler_id, _)| *handler_id != id);
            handlers.len()
        };
        if remaining == 0 {
            if let Some(listener) = state.listener.take() {
                log::debug!("[xbdm-events] last subscriber left; stopping listener");
                listener.stop();
            }
        }
    }

    /// Stop the listener regardless of subscribers. Called when the owning
    /// connection closes.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = state.listener.take() {
            listener.stop();
        }
    }
}

/// A registered event handler. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct EventSubscription {
    hub: Arc<EventHub>,
    id: u64,
}

impl EventSubscription {
    /// Remove the handler now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Register `handler` for console notifications.
    ///
    /// The first subscription opens the notification connection and waits
    /// for its handshake; a failed handshake is returned here and leaves no
    /// subscription behind. Handlers run on the listener thread and should
    /// return quickly.
    pub async fn subscribe_events<F>(&self, handler: F) -> Result<EventSubscription>
    where
        F: Fn(&ConsoleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let hub = Arc::clone(self.events());
        let (id, mut status) = hub.register(Arc::new(handler), || ListenerSpec {
            peer: self.peer_addr(),
            dialect: self.shared_dialect(),
            debugger_name: self.config().debugger_name.clone(),
            connect_timeout: self.config().connect_timeout(),
            read_timeout: self.config().read_timeout(),
        })?;
        let subscription = EventSubscription { hub, id };

        let outcome = status
            .wait_for(|s| *s != ListenerStatus::Starting)
            .await
            .map(|s| s.clone());
        match outcome {
            Ok(ListenerStatus::Running) => Ok(subscription),
            Ok(ListenerStatus::Failed(reason)) => Err(ConnectionError::Listener(reason)),
            Ok(_) | Err(_) => Err(ConnectionError::Listener(
                "listener stopped before it was ready".to_owned(),
            )),
        }
    }
}

// ── Listener thread ─────────────────────────────────────────────────────────

fn spawn_listener(
    spec: ListenerSpec,
    handlers: Arc<Mutex<Vec<(u64, EventHandler)>>>,
) -> Result<ListenerHandle> {
    let (status_tx, status_rx) = watch::channel(ListenerStatus::Starting);
    let stop = Arc::new(AtomicBool::new(false));
    let socket = Arc::new(Mutex::new(None));
    let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);

    let thread_stop = Arc::clone(&stop);
    let thread_socket = Arc::clone(&socket);
    std::thread::Builder::new()
        .name(format!("xbdm-events-{id}"))
        .spawn(move || {
            let listener = Listener {
                spec,
                handlers,
                stop: thread_stop,
                lines: LineBuffer::new(),
                scratch: vec![0; READ_BUFFER_SIZE],
            };
            listener.run(&thread_socket, &status_tx);
        })?;

    Ok(ListenerHandle {
        stop,
        socket,
        status: status_rx,
    })
}

struct Listener {
    spec: ListenerSpec,
    handlers: Arc<Mutex<Vec<(u64, EventHandler)>>>,
    stop: Arc<AtomicBool>,
    lines: LineBuffer,
    scratch: Vec<u8>,
}

impl Listener {
    fn run(
        mut self,
        socket: &Mutex<Option<TcpStream>>,
        status: &watch::Sender<ListenerStatus>,
    ) {
        let mut stream = match self.open(socket) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("[xbdm-events] listener failed to start: {e}");
                status.send_replace(ListenerStatus::Failed(e.to_string()));
                return;
            }
        };

        let initial = match self.handshake(&mut stream) {
            Ok(initial) => initial,
            Err(e) => {
                log::warn!("[xbdm-events] notification handshake failed: {e}");
                status.send_replace(ListenerStatus::Failed(e.to_string()));
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        };

        log::info!("[xbdm-events] listening for notifications from {}", self.spec.peer);
        status.send_replace(ListenerStatus::Running);
        for line in initial {
            self.dispatch(&line);
        }

        if let Err(e) = self.poll_events(&mut stream) {
            if !self.stop.load(Ordering::Acquire) {
                log::warn!("[xbdm-events] notification connection lost: {e}");
            }
        }
        let _ = stream.shutdown(Shutdown::Both);
        status.send_replace(ListenerStatus::Stopped);
        log::debug!("[xbdm-events] listener stopped");
    }

    /// Connect and publish a clone of the socket so `stop()` can unblock us.
    fn open(&self, socket: &Mutex<Option<TcpStream>>) -> io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.spec.peer, self.spec.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.spec.read_timeout))?;
        *socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream.try_clone()?);
        if self.stop.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "stopped while connecting"));
        }
        Ok(stream)
    }

    /// Greeting, debugger registration and the switch to notification mode.
    /// Returns event lines the console sent before confirming the switch.
    fn handshake(&mut self, stream: &mut TcpStream) -> Result<Vec<String>> {
        let greeting = self.read_line(stream)?;
        if !self.spec.dialect.accepts_greeting(&greeting) {
            return Err(ConnectionError::Handshake(format!(
                "notification connection greeted with {greeting:?}"
            )));
        }

        let user = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_owned());
        let connect = format!(
            "debugger connect override name=\"{}\" user=\"{user}\"",
            self.spec.debugger_name
        );
        self.write_command(stream, &connect)?;
        let line = self.read_line(stream)?;
        let reply = self.spec.dialect.classify(&line)?;
        if reply.kind != ResponseType::SingleResponse {
            return Err(ConnectionError::unexpected(
                &connect,
                reply.kind,
                ResponseType::SingleResponse,
            ));
        }

        let notify = format!("notify reconnectport={NOTIFY_RECONNECT_PORT} reverse");
        self.write_command(stream, &notify)?;
        let mut initial = Vec::new();
        loop {
            let line = self.read_line(stream)?;
            match Response::try_parse(&line) {
                Some(reply) if reply.kind == ResponseType::DedicatedConnection => return Ok(initial),
                Some(reply) => {
                    return Err(ConnectionError::unexpected(
                        &notify,
                        reply.kind,
                        ResponseType::DedicatedConnection,
                    ))
                }
                None => initial.push(line),
            }
        }
    }

    fn poll_events(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        stream.set_read_timeout(Some(EVENT_POLL_INTERVAL))?;
        while !self.stop.load(Ordering::Acquire) {
            while let Some(line) = self.lines.next_line() {
                self.dispatch(&line);
            }
            match stream.read(&mut self.scratch) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "console closed the notification connection",
                    ))
                }
                Ok(n) => self.lines.feed(&self.scratch[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn dispatch(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        let event = ConsoleEvent::parse(line);
        log::trace!("[xbdm-events] {event:?}");

        let snapshot: Vec<EventHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("[xbdm-events] handler failed: {e:#}"),
                Err(_) => log::error!("[xbdm-events] handler panicked on {line:?}"),
            }
        }
    }

    fn write_command(&self, stream: &mut TcpStream, command: &str) -> Result<()> {
        log::debug!("[xbdm-events] > {command}");
        stream.write_all(&self.spec.dialect.encode_command(command))?;
        Ok(())
    }

    /// Blocking line read bounded by the socket's read timeout.
    fn read_line(&mut self, stream: &mut TcpStream) -> Result<String> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(line);
            }
            match stream.read(&mut self.scratch) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "console closed the notification connection",
                    )
                    .into())
                }
                Ok(n) => self.lines.feed(&self.scratch[..n]),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Err(ConnectionError::Timeout {
                        waited: self.spec.read_timeout,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
