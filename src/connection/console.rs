//! Console-level commands: execution control, threads, memory map and
//! identification.
//!
//! Negative acknowledgements that are part of a command's normal contract
//! ("already stopped", "no such thread") come back as typed outcomes.

use std::net::Ipv4Addr;

use serde::Serialize;

use super::{BusyToken, Connection};
use crate::address::MemoryRegion;
use crate::error::{ConnectionError, Result};
use crate::protocol::{ParamList, ResponseType};

/// Title execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionState {
    /// Waiting to start.
    Pending,
    /// Rebooting.
    Reboot,
    /// Running.
    Start,
    /// Stopped in the debugger.
    Stop,
    /// Waiting to start a title.
    TitlePending,
    /// Rebooting into a title.
    TitleReboot,
    /// Anything else.
    Unknown,
}

impl ExecutionState {
    /// Parse a `getexecstate` reply message.
    pub fn from_reply(text: &str) -> Self {
        match text.trim() {
            "pending" => Self::Pending,
            "reboot" => Self::Reboot,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "pending_title" => Self::TitlePending,
            "reboot_title" => Self::TitleReboot,
            _ => Self::Unknown,
        }
    }
}

/// Result of `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeOutcome {
    /// Execution was stopped.
    Stopped,
    /// Execution was already stopped.
    AlreadyStopped,
}

/// Result of `go`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnfreezeOutcome {
    /// Execution resumed.
    Resumed,
    /// Execution was not stopped.
    NotStopped,
}

/// Kind of data breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataBreakKind {
    /// Break on read.
    Read,
    /// Break on write.
    Write,
    /// Break on execute.
    Execute,
}

impl DataBreakKind {
    fn keyword(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        }
    }
}

/// Details of one console thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    /// Thread id.
    pub id: u32,
    /// Suspend count.
    pub suspend_count: u32,
    /// Scheduling priority.
    pub priority: u32,
    /// Thread-local storage base.
    pub tls_base: u32,
    /// Stack base.
    pub stack_base: u32,
    /// Stack limit.
    pub stack_limit: u32,
    /// Stack slack space.
    pub stack_slack: u32,
    /// Address of the thread name.
    pub name_address: u32,
    /// Length of the thread name.
    pub name_length: u32,
    /// Processor the thread last ran on.
    pub processor: u32,
    /// Last Win32 error.
    pub last_error: u32,
    /// Thread name, when the console reports one.
    pub name: Option<String>,
}

impl ThreadInfo {
    fn parse(id: u32, line: &str) -> Self {
        let params = ParamList::parse(line, false);
        let field = |key: &str| params.get_u32(key).unwrap_or(0);
        Self {
            id,
            suspend_count: field("suspend"),
            priority: field("priority"),
            tls_base: field("tlsbase"),
            stack_base: field("base"),
            stack_limit: field("limit"),
            stack_slack: field("slack"),
            name_address: field("nameaddr"),
            name_length: field("namelen"),
            processor: field("proc"),
            last_error: field("lasterr"),
            name: None,
        }
    }
}

/// Longest thread name read back from console memory.
const MAX_THREAD_NAME: u32 = 256;

impl BusyToken<'_> {
    /// Regions of the console's virtual memory map.
    ///
    /// `will_read` drops regions that cannot be read safely, `will_write`
    /// those that cannot be written safely.
    pub async fn memory_regions(&self, will_read: bool, will_write: bool) -> Result<Vec<MemoryRegion>> {
        let lines = self.send_command_lines("walkmem").await?;
        Ok(lines
            .iter()
            .map(|line| MemoryRegion::parse(line))
            .filter(|region| !will_write || region.is_writable())
            .filter(|region| !will_read || region.is_readable())
            .collect())
    }

    /// Current title execution state.
    pub async fn execution_state(&self) -> Result<ExecutionState> {
        let response = self
            .send_command_expect("getexecstate", ResponseType::SingleResponse)
            .await?;
        Ok(ExecutionState::from_reply(&response.message))
    }

    /// Stop title execution.
    pub async fn debug_freeze(&self) -> Result<FreezeOutcome> {
        let response = self.send_command("stop").await?;
        match response.kind {
            ResponseType::SingleResponse => Ok(FreezeOutcome::Stopped),
            ResponseType::AlreadyStopped => Ok(FreezeOutcome::AlreadyStopped),
            other => Err(ConnectionError::unexpected("stop", other, ResponseType::SingleResponse)),
        }
    }

    /// Resume title execution.
    pub async fn debug_unfreeze(&self) -> Result<UnfreezeOutcome> {
        let response = self.send_command("go").await?;
        match response.kind {
            ResponseType::SingleResponse => Ok(UnfreezeOutcome::Resumed),
            ResponseType::NotStopped => Ok(UnfreezeOutcome::NotStopped),
            other => Err(ConnectionError::unexpected("go", other, ResponseType::SingleResponse)),
        }
    }

    /// Ids of all running threads.
    pub async fn thread_ids(&self) -> Result<Vec<u32>> {
        let lines = self.send_command_lines("threads").await?;
        lines
            .iter()
            .map(|line| {
                crate::protocol::params::parse_number(line.trim())
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| ConnectionError::MalformedResponse(line.clone()))
            })
            .collect()
    }

    /// Details of thread `id`, or `None` if the console has no such thread.
    pub async fn thread_info(&self, id: u32) -> Result<Option<ThreadInfo>> {
        let command = format!("threadinfo thread=0x{id:08X}");
        let response = self.send_command(&command).await?;
        match response.kind {
            ResponseType::MultiResponse => {}
            ResponseType::NoSuchThread => return Ok(None),
            other => {
                return Err(ConnectionError::unexpected(
                    &command,
                    other,
                    ResponseType::MultiResponse,
                ))
            }
        }

        let lines = self.read_multiline().await?;
        let mut info = ThreadInfo::parse(id, lines.first().map_or("", String::as_str));
        if info.name_address != 0 && info.name_length != 0 {
            let len = info.name_length.min(MAX_THREAD_NAME) as usize;
            info.name = Some(self.read_string_ascii(info.name_address, len).await?);
        }
        Ok(Some(info))
    }

    /// The console's debug name.
    pub async fn debug_name(&self) -> Result<String> {
        let response = self
            .send_command_expect("dbgname", ResponseType::SingleResponse)
            .await?;
        Ok(response.message)
    }

    /// Rename the console.
    pub async fn set_debug_name(&self, name: &str) -> Result<()> {
        self.send_command_expect(&format!("dbgname name={name}"), ResponseType::SingleResponse)
            .await?;
        Ok(())
    }

    /// The console id.
    pub async fn console_id(&self) -> Result<String> {
        let response = self
            .send_command_expect("getconsoleid", ResponseType::SingleResponse)
            .await?;
        let params = ParamList::parse(&response.message, false);
        Ok(params
            .get("consoleid")
            .map_or_else(|| response.message.clone(), str::to_owned))
    }

    /// Id of the running title's process.
    pub async fn process_id(&self) -> Result<u32> {
        let response = self
            .send_command_expect("getpid", ResponseType::SingleResponse)
            .await?;
        ParamList::parse(&response.message, false)
            .get_u32("pid")
            .ok_or(ConnectionError::MalformedResponse(response.raw))
    }

    /// The title's own IP address.
    pub async fn title_address(&self) -> Result<Ipv4Addr> {
        let response = self
            .send_command_expect("altaddr", ResponseType::SingleResponse)
            .await?;
        ParamList::parse(&response.message, false)
            .get_u32("addr")
            .map(Ipv4Addr::from)
            .ok_or(ConnectionError::MalformedResponse(response.raw))
    }

    /// Path of the running executable, or of `executable` when given.
    pub async fn xbe_name(&self, executable: Option<&str>) -> Result<Option<String>> {
        let command = match executable {
            Some(path) => format!("xbeinfo name=\"{path}\""),
            None => "xbeinfo running".to_owned(),
        };
        let lines = self.send_command_lines(&command).await?;
        Ok(lines
            .iter()
            .find_map(|line| ParamList::parse(line, false).get("name").map(str::to_owned)))
    }

    /// Set or clear an execution breakpoint.
    pub async fn set_breakpoint(&self, address: u32, clear: bool) -> Result<()> {
        let suffix = if clear { " clear" } else { "" };
        self.send_command_expect(
            &format!("break addr=0x{address:08X}{suffix}"),
            ResponseType::SingleResponse,
        )
        .await?;
        Ok(())
    }

    /// Set or clear a data breakpoint.
    pub async fn set_data_breakpoint(
        &self,
        kind: DataBreakKind,
        address: u32,
        size: u32,
        clear: bool,
    ) -> Result<()> {
        let suffix = if clear { " clear" } else { "" };
        let command = format!(
            "break {}=0x{address:08X} size=0x{size:08X}{suffix}",
            kind.keyword()
        );
        self.send_command_expect(&command, ResponseType::SingleResponse)
            .await?;
        Ok(())
    }

    /// Reboot the console and close the connection.
    pub async fn reboot(&self, cold: bool) -> Result<()> {
        let command = if cold { "magicboot cold" } else { "magicboot" };
        let result = self.send_command(command).await;
        self.conn.close();
        result.map(drop)
    }

    /// Power the console off and close the connection. No reply is read.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.write_command("shutdown").await;
        self.conn.close_for("console shut down");
        result
    }
}

impl Connection {
    /// Memory map under one busy-token hold.
    pub async fn memory_regions(&self, will_read: bool, will_write: bool) -> Result<Vec<MemoryRegion>> {
        self.busy().await?.memory_regions(will_read, will_write).await
    }

    /// Execution state under one busy-token hold.
    pub async fn execution_state(&self) -> Result<ExecutionState> {
        self.busy().await?.execution_state().await
    }

    /// Stop execution under one busy-token hold.
    pub async fn debug_freeze(&self) -> Result<FreezeOutcome> {
        self.busy().await?.debug_freeze().await
    }

    /// Resume execution under one busy-token hold.
    pub async fn debug_unfreeze(&self) -> Result<UnfreezeOutcome> {
        self.busy().await?.debug_unfreeze().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_state_from_reply() {
        assert_eq!(ExecutionState::from_reply("start"), ExecutionState::Start);
        assert_eq!(ExecutionState::from_reply("pending_title"), ExecutionState::TitlePending);
        assert_eq!(ExecutionState::from_reply("bogus"), ExecutionState::Unknown);
    }

    #[test]
    fn test_thread_info_parse() {
        let info = ThreadInfo::parse(
            0x10,
            "suspend=0 priority=9 tlsbase=0x7FFBF000 base=0x70000000 limit=0x6FFF0000 slack=0x0 nameaddr=0x80001000 namelen=0x6 proc=0x2 lasterr=0x0",
        );
        assert_eq!(info.id, 0x10);
        assert_eq!(info.priority, 9);
        assert_eq!(info.tls_base, 0x7FFB_F000);
        assert_eq!(info.name_length, 6);
        assert_eq!(info.processor, 2);
        assert_eq!(info.name, None);
    }

    #[test]
    fn test_data_break_keywords() {
        assert_eq!(DataBreakKind::Read.keyword(), "read");
        assert_eq!(DataBreakKind::Execute.keyword(), "execute");
    }
}
