//! Memory transfer encodings.
//!
//! Two paths move memory across the wire:
//!
//! - **Binary** (`getmemex`): after a `203` status line the console streams
//!   chunks, each prefixed by a little-endian `u16` header:
//!
//!   ```text
//!   [u16 LE: T LLLLLLL LLLLLLLL] [payload: L bytes]
//!    T = terminal flag (0x8000), L = payload length (0x7FFF mask)
//!   ```
//!
//!   The stream ends after a chunk with the terminal flag or a zero-length
//!   chunk. Reaching the requested count does not end it.
//!
//! - **Text** (`getmem` / `setmem`): two hex characters per byte. A console
//!   that cannot read a byte sends `??`, which decodes to zero and is
//!   reported separately so callers can tell it from a real `0x00`.

use crate::constants::{CHUNK_LENGTH_MASK, CHUNK_TERMINAL_FLAG};
use crate::error::{ConnectionError, Result};

// ── Command builders ────────────────────────────────────────────────────────

/// `getmem`: hex multi-line read.
pub fn getmem_command(address: u32, length: u32) -> String {
    format!("getmem addr=0x{address:08X} length=0x{length:08X}")
}

/// `getmemex`: binary chunked read.
pub fn getmemex_command(address: u32, length: u32) -> String {
    format!("getmemex addr=0x{address:08X} length=0x{length:08X}")
}

/// `setmem`: hex write of `data` at `address`.
pub fn setmem_command(address: u32, data: &[u8]) -> String {
    format!("setmem addr=0x{address:08X} data={}", encode_hex(data))
}

// ── Binary chunks ───────────────────────────────────────────────────────────

/// Decoded 2-byte chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Payload length in bytes.
    pub length: usize,
    /// No further chunks follow this one.
    pub terminal: bool,
}

impl ChunkHeader {
    /// Size of the header on the wire.
    pub const SIZE: usize = 2;

    /// Decode from wire bytes.
    pub fn decode(bytes: [u8; 2]) -> Self {
        let raw = u16::from_le_bytes(bytes);
        Self {
            length: usize::from(raw & CHUNK_LENGTH_MASK),
            terminal: raw & CHUNK_TERMINAL_FLAG != 0,
        }
    }

    /// Encode to wire bytes. Lengths above 0x7FFF are masked.
    pub fn encode(self) -> [u8; 2] {
        let mut raw = (self.length as u16) & CHUNK_LENGTH_MASK;
        if self.terminal {
            raw |= CHUNK_TERMINAL_FLAG;
        }
        raw.to_le_bytes()
    }
}

/// What a [`ChunkAssembler`] wants next from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkNeed {
    /// Two header bytes.
    Header,
    /// Exactly this many payload bytes.
    Payload(usize),
    /// The stream is complete.
    Done,
}

/// State machine that reassembles a binary chunk stream.
///
/// The caller loops on [`ChunkAssembler::need`], reading the requested bytes
/// from the wire and pushing them back in, then calls
/// [`ChunkAssembler::finish`]. A stream only ends on a header with the
/// terminal flag or a zero length, even once the expected count is met.
#[derive(Debug)]
pub struct ChunkAssembler {
    expected: Option<usize>,
    data: Vec<u8>,
    pending: Option<usize>,
    terminal_seen: bool,
    done: bool,
}

impl ChunkAssembler {
    /// Assembler for a stream of `expected` bytes, or of unknown length.
    pub fn new(expected: Option<usize>) -> Self {
        Self {
            expected,
            data: Vec::with_capacity(expected.unwrap_or(0)),
            pending: None,
            terminal_seen: false,
            done: false,
        }
    }

    /// Next input the assembler needs.
    pub fn need(&self) -> ChunkNeed {
        if self.done {
            return ChunkNeed::Done;
        }
        match self.pending {
            Some(len) => ChunkNeed::Payload(len),
            None => ChunkNeed::Header,
        }
    }

    /// Feed a decoded header.
    ///
    /// A chunk longer than the bytes still expected is a framing violation.
    pub fn push_header(&mut self, header: ChunkHeader) -> Result<()> {
        if let Some(expected) = self.expected {
            let remaining = expected - self.data.len();
            if header.length > remaining {
                return Err(ConnectionError::Framing(format!(
                    "chunk of {} bytes exceeds the {remaining} bytes still expected",
                    header.length
                )));
            }
        }
        if header.length == 0 {
            self.done = true;
        } else {
            self.pending = Some(header.length);
            self.terminal_seen = header.terminal;
        }
        Ok(())
    }

    /// Feed the payload announced by the last header.
    pub fn push_payload(&mut self, payload: &[u8]) -> Result<()> {
        match self.pending.take() {
            Some(len) if len == payload.len() => {
                self.data.extend_from_slice(payload);
                if self.terminal_seen {
                    self.done = true;
                }
                Ok(())
            }
            Some(len) => Err(ConnectionError::Framing(format!(
                "expected a {len}-byte chunk payload, got {} bytes",
                payload.len()
            ))),
            None => Err(ConnectionError::Framing(
                "chunk payload pushed without a header".to_owned(),
            )),
        }
    }

    /// Bytes collected so far.
    pub fn received(&self) -> usize {
        self.data.len()
    }

    /// Take the reassembled bytes, failing if fewer than expected arrived.
    pub fn finish(self) -> Result<Vec<u8>> {
        match self.expected {
            Some(expected) if self.data.len() != expected => {
                Err(ConnectionError::IncompleteTransfer {
                    expected,
                    received: self.data.len(),
                })
            }
            _ => Ok(self.data),
        }
    }
}

// ── Hex text ────────────────────────────────────────────────────────────────

/// Upper-case hex encoding used by `setmem`.
pub fn encode_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(char::from(DIGITS[usize::from(b >> 4)]));
        out.push(char::from(DIGITS[usize::from(b & 0x0F)]));
    }
    out
}

/// Decode one `getmem` reply line, appending bytes to `out`.
///
/// Returns the number of bytes that were `?` placeholders (decoded as 0).
pub fn decode_hex_line(line: &str, out: &mut Vec<u8>) -> Result<usize> {
    let bytes = line.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(ConnectionError::Framing(format!(
            "hex line has odd length {}: {line:?}",
            bytes.len()
        )));
    }

    let mut unreadable = 0;
    for pair in bytes.chunks_exact(2) {
        if pair[0] == b'?' || pair[1] == b'?' {
            unreadable += 1;
            out.push(0);
            continue;
        }
        let hi = hex_value(pair[0]);
        let lo = hex_value(pair[1]);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
            _ => {
                return Err(ConnectionError::Framing(format!(
                    "invalid hex digit in {line:?}"
                )))
            }
        }
    }
    Ok(unreadable)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
