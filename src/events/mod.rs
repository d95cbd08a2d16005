//! Asynchronous console notifications.
//!
//! Once a connection has announced itself as the debugger, the console
//! pushes one line per event:
//!
//! ```text
//! break addr=0x82001234 thread=0x0000000C
//! modload name="xam.xex" base=0x81A40000 size=0x00160000 xbe
//! execution stopped
//! ```
//!
//! [`ConsoleEvent::parse`] turns each line into a typed event. Lines it
//! does not recognise, or recognised lines missing a required parameter,
//! come back as [`ConsoleEvent::Raw`] so nothing is lost.

pub mod listener;

use serde::Serialize;

use crate::connection::console::{DataBreakKind, ExecutionState};
use crate::protocol::params::value_to_end;
use crate::protocol::ParamList;

pub use listener::{EventHandler, EventSubscription};

/// Memory access that raised an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExceptionAccess {
    /// Faulting read of the address.
    Read(u32),
    /// Faulting write of the address.
    Write(u32),
}

/// One notification from the console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
#[allow(missing_docs, reason = "fields mirror the notification's parameter names")]
pub enum ConsoleEvent {
    /// Execution breakpoint hit.
    Break { address: u32, thread: u32 },
    /// Single step completed.
    SingleStep { address: u32, thread: u32 },
    /// Data breakpoint hit.
    DataBreak {
        kind: Option<DataBreakKind>,
        data_address: u32,
        address: u32,
        thread: u32,
    },
    /// Exception raised by a thread.
    Exception {
        code: u32,
        thread: u32,
        address: u32,
        first_chance: bool,
        non_continuable: bool,
        access: Option<ExceptionAccess>,
    },
    /// Thread ripped.
    Rip { thread: u32 },
    /// Assertion failure. `message` is `None` for a prompt.
    Assert {
        thread: u32,
        message: Option<String>,
        prompt: bool,
    },
    /// Title execution state changed.
    Execution(ExecutionState),
    /// Debug output from a thread.
    DebugString {
        thread: u32,
        text: String,
        stopped: bool,
    },
    /// Thread created.
    ThreadCreated { thread: u32, start: Option<u32> },
    /// Thread exited.
    ThreadTerminated { thread: u32 },
    /// Module loaded.
    ModuleLoad {
        name: String,
        base: u32,
        size: u32,
        timestamp: u32,
        checksum: u32,
        tls: bool,
        xbe: bool,
    },
    /// Section loaded.
    SectionLoad {
        name: String,
        base: u32,
        size: u32,
        index: Option<u32>,
        flags: Option<u32>,
    },
    /// Section unloaded.
    SectionUnload {
        name: String,
        base: u32,
        size: u32,
        index: Option<u32>,
        flags: Option<u32>,
    },
    /// Fiber created (`start` set) or deleted.
    Fiber {
        id: u32,
        start: Option<u32>,
        deleted: bool,
    },
    /// Notification from a plugin (`plugin!command ...`).
    External(String),
    /// Anything else, verbatim.
    Raw(String),
}

impl ConsoleEvent {
    /// Parse one notification line. Never fails.
    pub fn parse(line: &str) -> Self {
        parse_structured(line).unwrap_or_else(|| Self::Raw(line.to_owned()))
    }

    /// Whether this event left a thread or the title stopped.
    pub fn is_stop(&self) -> bool {
        match self {
            Self::Break { .. }
            | Self::SingleStep { .. }
            | Self::DataBreak { .. }
            | Self::Exception { .. }
            | Self::Assert { .. } => true,
            Self::Execution(state) => *state == ExecutionState::Stop,
            Self::DebugString { stopped, .. } => *stopped,
            _ => false,
        }
    }
}

fn parse_structured(line: &str) -> Option<ConsoleEvent> {
    let (command, _) = line.split_once(' ')?;
    let command = command.to_ascii_lowercase();
    if command.contains('!') {
        return Some(ConsoleEvent::External(line.to_owned()));
    }

    let params = ParamList::parse(line, true);
    let dword = |key: &str| params.get_u32(key);
    let dword_or_zero = |key: &str| params.get_u32(key).unwrap_or(0);

    let event = match command.as_str() {
        "break" => ConsoleEvent::Break {
            address: dword_or_zero("addr"),
            thread: dword_or_zero("thread"),
        },
        "singlestep" => ConsoleEvent::SingleStep {
            address: dword_or_zero("addr"),
            thread: dword_or_zero("thread"),
        },
        "data" => {
            let (kind, data_address) = [
                (DataBreakKind::Write, "write"),
                (DataBreakKind::Read, "read"),
                (DataBreakKind::Execute, "execute"),
            ]
            .into_iter()
            .find_map(|(kind, key)| dword(key).map(|addr| (Some(kind), addr)))
            .unwrap_or((None, 0));
            ConsoleEvent::DataBreak {
                kind,
                data_address,
                address: dword_or_zero("addr"),
                thread: dword_or_zero("thread"),
            }
        }
        "exception" => {
            let first_chance = params.has_flag("first");
            let access = dword("read")
                .map(ExceptionAccess::Read)
                .or_else(|| dword("write").map(ExceptionAccess::Write));
            ConsoleEvent::Exception {
                code: dword("code")?,
                thread: dword_or_zero("thread"),
                address: dword_or_zero("address"),
                first_chance,
                non_continuable: !first_chance && params.has_flag("noncont"),
                access,
            }
        }
        "rip" => ConsoleEvent::Rip {
            thread: dword_or_zero("thread"),
        },
        "assert" => {
            let thread = dword("thread")?;
            let message = value_to_end(line, "string").map(str::to_owned);
            let prompt = message.is_none() && params.has_flag("prompt");
            ConsoleEvent::Assert {
                thread,
                message,
                prompt,
            }
        }
        "execution" => {
            let state = [
                ("started", ExecutionState::Start),
                ("stopped", ExecutionState::Stop),
                ("pending", ExecutionState::Pending),
                ("rebooting", ExecutionState::Reboot),
            ]
            .into_iter()
            .find_map(|(flag, state)| params.has_flag(flag).then_some(state))
            .unwrap_or(ExecutionState::Unknown);
            ConsoleEvent::Execution(state)
        }
        "debugstr" => ConsoleEvent::DebugString {
            thread: dword_or_zero("thread"),
            text: value_to_end(line, "string").unwrap_or_default().to_owned(),
            stopped: params.has_flag("stop"),
        },
        "create" => ConsoleEvent::ThreadCreated {
            thread: dword("thread")?,
            start: dword("start"),
        },
        "terminate" => ConsoleEvent::ThreadTerminated {
            thread: dword("thread")?,
        },
        "modload" => ConsoleEvent::ModuleLoad {
            name: params.get("name")?.to_owned(),
            base: dword("base")?,
            size: dword("size")?,
            timestamp: dword_or_zero("timestamp"),
            checksum: dword_or_zero("checksum"),
            tls: params.has_flag("tls"),
            xbe: params.has_flag("xbe"),
        },
        "sectload" | "sectunload" => {
            let name = params.get("name")?.to_owned();
            let base = dword("base")?;
            let size = dword("size")?;
            let index = dword("index");
            let flags = dword("flags");
            if command == "sectload" {
                ConsoleEvent::SectionLoad {
                    name,
                    base,
                    size,
                    index,
                    flags,
                }
            } else {
                ConsoleEvent::SectionUnload {
                    name,
                    base,
                    size,
                    index,
                    flags,
                }
            }
        }
        "fiber" => {
            let id = dword("id")?;
            let start = dword("start");
            let deleted = start.is_none() && params.has_flag("delete");
            if start.is_none() && !deleted {
                return None;
            }
            ConsoleEvent::Fiber { id, start, deleted }
        }
        _ => return None,
    };
    Some(event)
}
