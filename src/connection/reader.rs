//! The wire worker: the only thread that touches a connection's socket.
//!
//! ```text
//!  async caller ──WireRequest──► mpsc(1) ──► [xbdm-wire-N thread]
//!       ▲                                        │ blocking read/write
//!       └──────────── oneshot reply ◄────────────┘
//! ```
//!
//! Async code never blocks on the socket; it sends a request and awaits the
//! reply. The worker owns the stream and its [`LineBuffer`], so leftover
//! bytes from a status line are seen by the binary read that follows it.
//!
//! Every read loop polls the socket in short slices. Between slices it
//! checks the caller's cancellation token and the read ceiling. Any error
//! raised here closes the connection: once a read was abandoned mid-frame
//! there is no way to resynchronise.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::constants::READ_BUFFER_SIZE;
use crate::error::{ConnectionError, Result};
use crate::protocol::LineBuffer;

/// A unit of work for the wire worker.
#[derive(Debug)]
pub(crate) enum WireRequest {
    /// Write all bytes.
    Write {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Read one CRLF-terminated line.
    ReadLine {
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<String>>,
    },
    /// Fill `buf` completely. The buffer travels back with the reply.
    ReadExact {
        buf: Vec<u8>,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
}

impl WireRequest {
    fn reject(self, err: ConnectionError) {
        // The caller may have gone away; nothing to do then.
        match self {
            Self::Write { reply, .. } => drop(reply.send(Err(err))),
            Self::ReadLine { reply, .. } => drop(reply.send(Err(err))),
            Self::ReadExact { reply, .. } => drop(reply.send(Err(err))),
        }
    }
}

/// State shared between the worker, the connection handle and `close()`.
pub(crate) struct WireShared {
    label: String,
    closed: AtomicBool,
    control: Mutex<Option<TcpStream>>,
}

impl WireShared {
    pub(crate) fn new(label: String, control: TcpStream) -> Self {
        Self {
            label,
            closed: AtomicBool::new(false),
            control: Mutex::new(Some(control)),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the socket once. With `say_bye` the console is told first.
    ///
    /// Shutting the socket down also unblocks a worker stuck in `read`.
    pub(crate) fn close(&self, reason: &str, say_bye: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("[xbdm-wire] {} closing: {reason}", self.label);
        let stream = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut stream) = stream {
            if say_bye {
                let _ = stream.set_write_timeout(Some(Duration::from_millis(500)));
                let _ = stream.write_all(b"bye\r\n");
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl std::fmt::Debug for WireShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireShared")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Read ceiling and poll slice for one connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WireTiming {
    pub read_timeout: Duration,
    pub poll_interval: Duration,
}

/// Start the worker thread for `stream`.
pub(crate) fn spawn(
    stream: TcpStream,
    shared: Arc<WireShared>,
    timing: WireTiming,
) -> Result<mpsc::Sender<WireRequest>> {
    stream.set_read_timeout(Some(timing.poll_interval))?;
    stream.set_write_timeout(Some(timing.read_timeout))?;

    let (tx, rx) = mpsc::channel(1);
    let worker = Worker {
        stream,
        lines: LineBuffer::new(),
        shared,
        timing,
        scratch: vec![0u8; READ_BUFFER_SIZE],
    };
    std::thread::Builder::new()
        .name(format!("xbdm-wire-{}", worker.shared.label()))
        .spawn(move || worker.run(rx))?;
    Ok(tx)
}

struct Worker {
    stream: TcpStream,
    lines: LineBuffer,
    shared: Arc<WireShared>,
    timing: WireTiming,
    scratch: Vec<u8>,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::Receiver<WireRequest>) {
        let shared = Arc::clone(&self.shared);
        scopeguard::defer! {
            shared.close("wire worker exited", false);
            log::debug!("[xbdm-wire] {} thread exiting", shared.label());
        }

        while let Some(request) = rx.blocking_recv() {
            if self.shared.is_closed() {
                request.reject(ConnectionError::Closed);
                continue;
            }
            match request {
                WireRequest::Write { bytes, reply } => {
                    let result = self.write(&bytes);
                    let result = self.settle(result);
                    drop(reply.send(result));
                }
                WireRequest::ReadLine { cancel, reply } => {
                    let result = self.read_line(&cancel);
                    let result = self.settle(result);
                    drop(reply.send(result));
                }
                WireRequest::ReadExact { buf, cancel, reply } => {
                    let result = self.read_exact(buf, &cancel);
                    let result = self.settle(result);
                    drop(reply.send(result));
                }
            }
        }
    }

    /// Every failure on the wire is fatal to the connection.
    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if !self.shared.is_closed() {
                log::warn!("[xbdm-wire] {}: {e}", self.shared.label());
            }
            self.shared.close(&e.to_string(), false);
        }
        result
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_line(&mut self, cancel: &CancellationToken) -> Result<String> {
        let mut last_progress = Instant::now();
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(line);
            }
            self.fill(cancel, &mut last_progress)?;
        }
    }

    fn read_exact(&mut self, mut buf: Vec<u8>, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut filled = self.lines.drain_into(&mut buf);
        let mut last_progress = Instant::now();
        while filled < buf.len() {
            self.fill(cancel, &mut last_progress)?;
            filled += self.lines.drain_into(&mut buf[filled..]);
        }
        Ok(buf)
    }

    /// Block until at least one byte arrives and append it to the buffer.
    fn fill(&mut self, cancel: &CancellationToken, last_progress: &mut Instant) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }
            if self.shared.is_closed() {
                return Err(ConnectionError::Closed);
            }
            match self.stream.read(&mut self.scratch) {
                Ok(0) => {
                    if self.shared.is_closed() {
                        return Err(ConnectionError::Closed);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "console closed the connection",
                    )
                    .into());
                }
                Ok(n) => {
                    self.lines.feed(&self.scratch[..n]);
                    *last_progress = Instant::now();
                    return Ok(());
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    let waited = last_progress.elapsed();
                    if waited >= self.timing.read_timeout {
                        return Err(ConnectionError::Timeout { waited });
                    }
                }
                Err(_) if self.shared.is_closed() => return Err(ConnectionError::Closed),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair(timing: WireTiming) -> (mpsc::Sender<WireRequest>, Arc<WireShared>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let shared = Arc::new(WireShared::new("test".to_string(), client.try_clone().unwrap()));
        let tx = spawn(client, Arc::clone(&shared), timing).unwrap();
        (tx, shared, server)
    }

    fn timing(read_timeout_ms: u64) -> WireTiming {
        WireTiming {
            read_timeout: Duration::from_millis(read_timeout_ms),
            poll_interval: Duration::from_millis(5),
        }
    }

    async fn read_line(tx: &mpsc::Sender<WireRequest>, cancel: CancellationToken) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        tx.send(WireRequest::ReadLine { cancel, reply }).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_line_then_binary_share_buffer() {
        let (tx, _shared, mut server) = pair(timing(2000));
        server.write_all(b"203- binary response follows\r\n\x02\x80\xAB\xCD").unwrap();

        let line = read_line(&tx, CancellationToken::new()).await.unwrap();
        assert_eq!(line, "203- binary response follows");

        let (reply, rx) = oneshot::channel();
        tx.send(WireRequest::ReadExact {
            buf: vec![0; 4],
            cancel: CancellationToken::new(),
            reply,
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), vec![0x02, 0x80, 0xAB, 0xCD]);
    }

    #[tokio::test]
    async fn test_silence_past_ceiling_times_out_and_closes() {
        let (tx, shared, mut server) = pair(timing(100));
        server.write_all(b"202- multiline").unwrap();

        let err = read_line(&tx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { .. }), "got {err:?}");
        assert!(shared.is_closed());

        let err = read_line(&tx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed), "got {err:?}");
    }

    #[tokio::test]
    async fn test_cancel_is_distinct_from_timeout() {
        let (tx, shared, _server) = pair(timing(5000));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = read_line(&tx, cancel).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled), "got {err:?}");
        assert!(shared.is_closed(), "a cancelled read leaves the stream ambiguous");
    }

    #[tokio::test]
    async fn test_peer_close_is_io_error() {
        let (tx, shared, server) = pair(timing(2000));
        drop(server);
        let err = read_line(&tx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Io(_)), "got {err:?}");
        assert!(shared.is_closed());
    }
}
