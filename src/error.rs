//! Error taxonomy for the connection layer.
//!
//! Transport failures (timeouts, socket errors, cancellations raised while
//! the wire worker was mid-read) leave the connection closed. Unexpected
//! but well-framed responses do not. Negative acknowledgements from the
//! console are never errors; they surface as typed outcomes elsewhere.

use std::time::Duration;

use thiserror::Error;

use crate::connection::features::Capability;
use crate::protocol::ResponseType;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Errors raised by a console connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// No byte arrived within the read ceiling. The connection is closed.
    #[error("console did not respond within {waited:?}; the connection has been closed")]
    Timeout {
        /// How long the reader waited without progress.
        waited: Duration,
    },

    /// The caller cancelled the operation.
    #[error("operation was cancelled")]
    Cancelled,

    /// Socket failure during a read or write. The connection is closed.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The console answered with a status the command does not produce.
    #[error("unexpected response to `{command}`: got {actual}, expected {expected}")]
    UnexpectedResponse {
        /// Command word that was sent.
        command: String,
        /// Response type that arrived.
        actual: ResponseType,
        /// Response type the command guarantees.
        expected: ResponseType,
    },

    /// A status line could not be parsed.
    #[error("malformed response line: {0:?}")]
    MalformedResponse(String),

    /// Payload framing was violated.
    #[error("framing error: {0}")]
    Framing(String),

    /// Fewer bytes arrived than were requested.
    #[error("incomplete transfer: expected {expected} bytes, received {received}")]
    IncompleteTransfer {
        /// Bytes requested.
        expected: usize,
        /// Bytes actually delivered.
        received: usize,
    },

    /// The greeting or event-channel handshake was rejected.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The connection was closed before or during the operation.
    #[error("connection is closed")]
    Closed,

    /// The busy slot is already held.
    #[error("connection is already busy performing another operation")]
    Busy,

    /// An address range would wrap past the 32-bit address space.
    #[error("address range 0x{base:08X} + 0x{length:X} overflows the 32-bit address space")]
    AddressOverflow {
        /// Range start.
        base: u64,
        /// Range length.
        length: u64,
    },

    /// The capability probe returned a non-numeric status and corrupted the
    /// connection. Probing is disabled for the rest of the process.
    #[error("JRPC2 detection is now disabled as it has corrupted the connection. Please re-connect")]
    ProbeCorrupted,

    /// Probing was disabled by an earlier corrupted probe.
    #[error("JRPC2 detection was disabled after an earlier probe corrupted a connection; restart the tool to probe again")]
    ProbeDisabled,

    /// The console does not offer the requested capability.
    #[error("console does not support {0:?}")]
    Unsupported(Capability),

    /// The event channel could not be started.
    #[error("event listener failed: {0}")]
    Listener(String),
}

impl ConnectionError {
    /// Whether this error always leaves the connection closed.
    ///
    /// Cancellation and framing errors close it only when raised mid-read;
    /// check [`crate::Connection::is_closed`] for those.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Io(_)
                | Self::Handshake(_)
                | Self::Closed
                | Self::ProbeCorrupted
        )
    }

    pub(crate) fn unexpected(
        command: &str,
        actual: ResponseType,
        expected: ResponseType,
    ) -> Self {
        let command = command.split_whitespace().next().unwrap_or(command);
        Self::UnexpectedResponse {
            command: command.to_owned(),
            actual,
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_keeps_only_command_word() {
        let err = ConnectionError::unexpected(
            "getmem addr=0x82000000 length=0x00000010",
            ResponseType::SingleResponse,
            ResponseType::MultiResponse,
        );
        match &err {
            ConnectionError::UnexpectedResponse { command, .. } => assert_eq!(command, "getmem"),
            other => panic!("wrong variant: {other:?}"),
        }
        assert!(!err.is_fatal());
        let text = err.to_string();
        assert!(text.contains("SingleResponse"), "message should name actual type: {text}");
        assert!(text.contains("MultiResponse"), "message should name expected type: {text}");
    }

    #[test]
    fn test_transport_errors_are_fatal() {
        assert!(ConnectionError::Timeout { waited: Duration::from_secs(5) }.is_fatal());
        assert!(ConnectionError::Io(std::io::ErrorKind::BrokenPipe.into()).is_fatal());
        assert!(!ConnectionError::Busy.is_fatal());
        assert!(!ConnectionError::IncompleteTransfer { expected: 4, received: 2 }.is_fatal());
    }
}
