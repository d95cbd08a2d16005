//! xbdm-link - connection and protocol layer for the Xbox 360 debug monitor.
//!
//! This crate talks XBDM, the line-based debug protocol a development
//! console serves on TCP port 730: command/response exchanges, bulk memory
//! transfers, pointer chains, feature probing and asynchronous
//! notifications.
//!
//! # Architecture
//!
//! - **Connection** - handle shared by async callers; owns the busy token
//! - **Wire worker** - one OS thread per connection doing all blocking socket I/O
//! - **Protocol** - pure framing, status codes, chunk codec and parameter parsing
//! - **Event listener** - second connection and thread, started on first subscribe
//!
//! # Modules
//!
//! - [`connection`] - connect, busy token, transfers, pointers, console commands
//! - [`protocol`] - wire formats, no I/O
//! - [`events`] - notification model and listener
//! - [`config`] - configuration loading/saving
//!
//! ```no_run
//! # async fn demo() -> xbdm_link::Result<()> {
//! use xbdm_link::{Connection, ConsoleConfig};
//!
//! let conn = Connection::connect(ConsoleConfig::for_host("192.168.1.50")).await?;
//! let health: u32 = conn.read_value(0x8200_1000).await?;
//! println!("health = {health}");
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod busy;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod events;
pub mod protocol;

// Re-export commonly used types
pub use address::{AddressRange, MemoryRegion};
pub use config::ConsoleConfig;
pub use connection::console::{
    DataBreakKind, ExecutionState, FreezeOutcome, ThreadInfo, UnfreezeOutcome,
};
pub use connection::features::{Capability, CapabilitySet, ProbeRegistry, TemperatureSensor};
pub use connection::pointer::DynamicAddress;
pub use connection::transfer::{ConsoleValue, WriteReport};
pub use connection::{BusyToken, Connection};
pub use error::{ConnectionError, Result};
pub use events::{ConsoleEvent, EventSubscription};
pub use protocol::{Response, ResponseType};
