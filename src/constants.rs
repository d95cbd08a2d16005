//! Protocol-wide constants for the XBDM connection layer.
//!
//! Grouped by concern:
//!
//! - **Endpoint**: port and handshake text
//! - **Timeouts**: read ceiling and poll slices
//! - **Transfers**: thresholds that pick the text or binary memory path
//! - **Memory protection**: masks used when filtering `walkmem` regions

use std::time::Duration;

// ============================================================================
// Endpoint
// ============================================================================

/// Default TCP port the debug monitor listens on.
pub const DEFAULT_PORT: u16 = 730;

/// The only greeting line accepted from a freshly opened connection.
///
/// Compared case-insensitively.
pub const GREETING: &str = "201- connected";

/// Line that terminates a multi-line response.
pub const MULTILINE_TERMINATOR: &str = ".";

/// Line ending appended to every command.
pub const LINE_ENDING: &str = "\r\n";

/// Port advertised in the `notify` command that turns a connection into an
/// event channel. The console never dials it because of `reverse`.
pub const NOTIFY_RECONNECT_PORT: u16 = 12345;

// ============================================================================
// Timeouts
// ============================================================================

/// Longest a wire read may go without receiving a single byte.
///
/// Exceeding it closes the connection. Overridable through
/// [`crate::config::ConsoleConfig::read_timeout_ms`].
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket read slice used by blocking loops so cancellation and the read
/// ceiling are re-checked between syscalls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Back-off between event-channel polls when no bytes are pending.
pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Transfers
// ============================================================================

/// Reads shorter than this use the `getmem` hex path.
pub const SMALL_READ_THRESHOLD: usize = 128;

/// Largest chunk the console is asked for in one chunked-read round trip.
pub const MAX_RECOMMENDED_CHUNK: usize = 0xC000;

/// Bytes carried by a single `setmem` command.
pub const SETMEM_CHUNK: usize = 64;

/// Mask for the 15-bit payload length inside a binary chunk header.
pub const CHUNK_LENGTH_MASK: u16 = 0x7FFF;

/// Terminal-chunk flag inside a binary chunk header.
pub const CHUNK_TERMINAL_FLAG: u16 = 0x8000;

/// Socket read buffer size used by the wire worker and event listener.
pub const READ_BUFFER_SIZE: usize = 4096;

// ============================================================================
// Memory protection
// ============================================================================

/// Regions with any of these protection bits cannot be written safely
/// (user read-only, no-cache, read-only, execute-read).
pub const PROTECT_DENY_WRITE: u32 = 0x1222;

/// Regions with any of these protection bits cannot be read safely
/// (no-cache, execute-write-copy).
pub const PROTECT_DENY_READ: u32 = 0x280;
