//! Scripted in-process console for integration tests.
//!
//! `FakeConsole` listens on a loopback port and answers the subset of XBDM
//! the library uses, backed by a sparse big-endian memory map. Every
//! accepted connection gets its own thread, like the real debug monitor.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use xbdm_link::protocol::ParamList;
use xbdm_link::ConsoleConfig;

/// Bytes per binary chunk sent for `getmemex`.
pub const BINARY_CHUNK: usize = 1024;

/// Bytes per hex line sent for `getmem`.
const HEX_LINE: usize = 32;

/// How the console answers the JRPC2 feature probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeReply {
    /// Plugin present: `200- <hex temperature>`.
    #[default]
    Jrpc2,
    /// Plugin absent and confused: a multi-line reply.
    Corrupt,
}

/// Scripted deviations from normal behaviour.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Greeting line; `None` sends the standard one.
    pub greeting: Option<String>,
    /// Command word that gets a partial multi-line reply and then silence.
    pub stall_on: Option<String>,
    /// Answer to `consolefeatures`.
    pub probe: ProbeReply,
    /// Send one byte more than `getmemex` asked for in its first chunk.
    pub oversized_chunk: bool,
}

#[derive(Debug, Default)]
struct ConsoleState {
    memory: HashMap<u32, u8>,
    commands: Vec<String>,
    stopped: bool,
    name: String,
    threads: Vec<u32>,
    pending_events: Vec<String>,
    notifiers: Vec<(SocketAddr, TcpStream)>,
    behavior: Behavior,
}

/// A fake console listening on `127.0.0.1`.
#[derive(Debug, Clone)]
pub struct FakeConsole {
    addr: SocketAddr,
    state: Arc<Mutex<ConsoleState>>,
}

impl FakeConsole {
    /// Start with default behaviour.
    pub fn start() -> Self {
        Self::with_behavior(Behavior::default())
    }

    /// Start with scripted behaviour.
    pub fn with_behavior(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ConsoleState {
            name: "devkit".to_owned(),
            threads: vec![0xF900_0010, 0xF900_0020],
            behavior,
            ..ConsoleState::default()
        }));

        let accept_state = Arc::clone(&state);
        thread::Builder::new()
            .name("fake-console".to_owned())
            .spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let state = Arc::clone(&accept_state);
                    thread::spawn(move || serve(stream, &state));
                }
            })
            .unwrap();

        Self { addr, state }
    }

    /// Connection settings pointing at this console.
    pub fn config(&self) -> ConsoleConfig {
        ConsoleConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            ..ConsoleConfig::default()
        }
    }

    /// Map `bytes` at `base`.
    pub fn map(&self, base: u32, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        for (i, &b) in bytes.iter().enumerate() {
            state.memory.insert(base + i as u32, b);
        }
    }

    /// Store a big-endian `u32`.
    pub fn write_u32(&self, address: u32, value: u32) {
        self.map(address, &value.to_be_bytes());
    }

    /// Current memory contents; unmapped bytes read as zero.
    pub fn memory(&self, base: u32, len: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        (0..len)
            .map(|i| state.memory.get(&(base + i as u32)).copied().unwrap_or(0))
            .collect()
    }

    /// Every command received so far, across connections.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Number of received commands starting with `prefix`.
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Queue an event sent before the notification channel confirms.
    pub fn queue_initial_event(&self, line: &str) {
        self.state.lock().unwrap().pending_events.push(line.to_owned());
    }

    /// Send an event to every notification channel.
    pub fn push_event(&self, line: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .notifiers
            .retain_mut(|(_, stream)| stream.write_all(format!("{line}\r\n").as_bytes()).is_ok());
    }

    /// Number of open notification channels.
    pub fn notifier_count(&self) -> usize {
        self.state.lock().unwrap().notifiers.len()
    }

    /// Block until `condition` holds or two seconds pass.
    pub fn wait_until(&self, mut condition: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..200 {
            if condition(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

fn serve(mut stream: TcpStream, state: &Mutex<ConsoleState>) {
    let greeting = state
        .lock()
        .unwrap()
        .behavior
        .greeting
        .clone()
        .unwrap_or_else(|| "201- connected".to_owned());
    if send(&mut stream, &[&greeting]).is_err() {
        return;
    }

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut stalled = false;
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end_matches(['\r', '\n']).to_owned();
        state.lock().unwrap().commands.push(command.clone());
        if stalled {
            continue;
        }

        let word = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if state.lock().unwrap().behavior.stall_on.as_deref() == Some(word.as_str()) {
            let _ = send(&mut stream, &["202- multiline response follows", "partial"]);
            stalled = true;
            continue;
        }

        let params = ParamList::parse(&command, true);
        let outcome = match word.as_str() {
            "getmem" => getmem(&mut stream, state, &params),
            "getmemex" => getmemex(&mut stream, state, &params),
            "setmem" => setmem(&mut stream, state, &params),
            "walkmem" => send(
                &mut stream,
                &[
                    "202- memory map follows",
                    "base=0x00001000 size=0x00001000 protect=0x00000004 phys=0x00001000",
                    "base=0x80000000 size=0x00010000 protect=0x00000002 phys=0x00000000",
                    "base=0x90000000 size=0x00010000 protect=0x00000200 phys=0x00000000",
                    ".",
                ],
            ),
            "consolefeatures" => match state.lock().unwrap().behavior.probe {
                ProbeReply::Jrpc2 => send(&mut stream, &["200- 2A"]),
                ProbeReply::Corrupt => send(&mut stream, &["202- multiline response follows", "junk"]),
            },
            "stop" => {
                let was_stopped = std::mem::replace(&mut state.lock().unwrap().stopped, true);
                send(&mut stream, &[if was_stopped { "426- already stopped" } else { "200- OK" }])
            }
            "go" => {
                let was_stopped = std::mem::replace(&mut state.lock().unwrap().stopped, false);
                send(&mut stream, &[if was_stopped { "200- OK" } else { "408- not stopped" }])
            }
            "getexecstate" => {
                let stopped = state.lock().unwrap().stopped;
                send(&mut stream, &[if stopped { "200- stop" } else { "200- start" }])
            }
            "threads" => {
                let ids = state.lock().unwrap().threads.clone();
                let mut lines = vec!["202- thread list follows".to_owned()];
                lines.extend(ids.iter().map(u32::to_string));
                lines.push(".".to_owned());
                send_owned(&mut stream, &lines)
            }
            "threadinfo" => threadinfo(&mut stream, state, &params),
            "dbgname" => match params.get("name") {
                Some(name) => {
                    state.lock().unwrap().name = name.to_owned();
                    send(&mut stream, &["200- name changed"])
                }
                None => {
                    let name = state.lock().unwrap().name.clone();
                    send_owned(&mut stream, &[format!("200- {name}")])
                }
            },
            "getconsoleid" => send(&mut stream, &["200- consoleid=F00D0000C0FFEE"]),
            "getpid" => send(&mut stream, &["200- pid=0x00000123"]),
            "altaddr" => send(&mut stream, &["200- addr=0xC0A80132"]),
            "xbeinfo" => send(
                &mut stream,
                &[
                    "202- xbe info follows",
                    "timestamp=0x00000000 checksum=0x00000000",
                    r#"name="\Device\Harddisk0\Partition1\DEVKIT\default.xex""#,
                    ".",
                ],
            ),
            "break" => send(&mut stream, &["200- OK"]),
            "debugger" => send(&mut stream, &["200- OK"]),
            "notify" => {
                become_notifier(stream, state);
                return;
            }
            "bye" => {
                let _ = send(&mut stream, &["200- bye"]);
                return;
            }
            _ => send(&mut stream, &["407- unknown command"]),
        };
        if outcome.is_err() {
            return;
        }
    }
}

fn send(stream: &mut TcpStream, lines: &[&str]) -> std::io::Result<()> {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    stream.write_all(out.as_bytes())
}

fn send_owned(stream: &mut TcpStream, lines: &[String]) -> std::io::Result<()> {
    let borrowed: Vec<&str> = lines.iter().map(String::as_str).collect();
    send(stream, &borrowed)
}

fn span(params: &ParamList) -> (u32, usize) {
    let address = params.get_u32("addr").unwrap_or(0);
    let length = params.get_u32("length").unwrap_or(0) as usize;
    (address, length)
}

fn getmem(stream: &mut TcpStream, state: &Mutex<ConsoleState>, params: &ParamList) -> std::io::Result<()> {
    let (address, length) = span(params);
    let mut lines = vec!["202- memory data follows".to_owned()];
    {
        let state = state.lock().unwrap();
        let hex: Vec<String> = (0..length)
            .map(|i| match state.memory.get(&(address + i as u32)) {
                Some(b) => format!("{b:02X}"),
                None => "??".to_owned(),
            })
            .collect();
        lines.extend(hex.chunks(HEX_LINE).map(|chunk| chunk.concat()));
    }
    lines.push(".".to_owned());
    send_owned(stream, &lines)
}

fn getmemex(stream: &mut TcpStream, state: &Mutex<ConsoleState>, params: &ParamList) -> std::io::Result<()> {
    let (address, length) = span(params);
    let data: Vec<u8> = {
        let state = state.lock().unwrap();
        (0..length)
            .map(|i| state.memory.get(&(address + i as u32)).copied().unwrap_or(0))
            .collect()
    };

    let mut out = b"203- binary response follows\r\n".to_vec();
    if state.lock().unwrap().behavior.oversized_chunk {
        out.extend_from_slice(&(length as u16 + 1).to_le_bytes());
        out.extend_from_slice(&data);
        out.push(0xEE);
    } else {
        // Data chunks, then the zero-length terminal header.
        for chunk in data.chunks(BINARY_CHUNK) {
            out.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
            out.extend_from_slice(chunk);
        }
    }
    out.extend_from_slice(&0x8000u16.to_le_bytes());
    stream.write_all(&out)
}

fn setmem(stream: &mut TcpStream, state: &Mutex<ConsoleState>, params: &ParamList) -> std::io::Result<()> {
    let address = params.get_u32("addr").unwrap_or(0);
    let hex = params.get("data").unwrap_or_default();
    let bytes: Vec<u8> = (0..hex.len() / 2)
        .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap())
        .collect();

    let mut state = state.lock().unwrap();
    let mapped = (0..bytes.len()).all(|i| state.memory.contains_key(&(address + i as u32)));
    if !mapped {
        drop(state);
        return send(stream, &["404- memory address not mapped"]);
    }
    for (i, b) in bytes.iter().enumerate() {
        state.memory.insert(address + i as u32, *b);
    }
    drop(state);
    send_owned(stream, &[format!("200- set {} bytes", bytes.len())])
}

fn threadinfo(stream: &mut TcpStream, state: &Mutex<ConsoleState>, params: &ParamList) -> std::io::Result<()> {
    let id = params.get_u32("thread").unwrap_or(0);
    if !state.lock().unwrap().threads.contains(&id) {
        return send(stream, &["405- no such thread"]);
    }
    send(
        stream,
        &[
            "202- thread info follows",
            "suspend=0 priority=0x8 tlsbase=0x7FFBF000 base=0x70000000 limit=0x6FFF0000 slack=0x0 nameaddr=0x00000000 namelen=0x0 proc=0x1 lasterr=0x0",
            ".",
        ],
    )
}

/// Switch this connection to notification mode and park it.
fn become_notifier(mut stream: TcpStream, state: &Mutex<ConsoleState>) {
    let pending = std::mem::take(&mut state.lock().unwrap().pending_events);
    let mut lines = pending;
    lines.push("205- now a notification channel".to_owned());
    if send_owned(&mut stream, &lines).is_err() {
        return;
    }

    let peer = stream.peer_addr().unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    state.lock().unwrap().notifiers.push((peer, stream));

    // Wait for the client to hang up, then forget the channel.
    let mut sink = String::new();
    while matches!(reader.read_line(&mut sink), Ok(n) if n > 0) {
        sink.clear();
    }
    state.lock().unwrap().notifiers.retain(|(addr, _)| *addr != peer);
}
