//! Memory reads and writes.
//!
//! Reads below [`SMALL_READ_THRESHOLD`] bytes use the `getmem` hex path,
//! larger ones the `getmemex` binary path. Both either deliver exactly the
//! requested byte count or fail. Chunked variants split a transfer into
//! round trips, report progress after each chunk and honour cancellation
//! between chunks.

use tokio_util::sync::CancellationToken;

use super::{BusyToken, Connection};
use crate::address::AddressRange;
use crate::constants::{MAX_RECOMMENDED_CHUNK, SETMEM_CHUNK, SMALL_READ_THRESHOLD};
use crate::error::{ConnectionError, Result};
use crate::protocol::codec::{self, ChunkAssembler, ChunkHeader, ChunkNeed};
use crate::protocol::ResponseType;

/// Progress callback; receives the completed fraction in `0.0..=1.0`.
pub type Progress<'p> = &'p (dyn Fn(f64) + Send + Sync);

/// Outcome of a memory write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Bytes sent.
    pub bytes_written: usize,
    /// `setmem` commands the console answered with "memory not mapped".
    pub unmapped_chunks: usize,
}

impl WriteReport {
    /// Whether every chunk landed in mapped memory.
    pub fn fully_mapped(&self) -> bool {
        self.unmapped_chunks == 0
    }
}

/// Chunk size for a chunked read of `total` bytes.
///
/// Small reads get one hex round trip; large ones are capped so a single
/// chunk never runs too long against the read ceiling.
pub fn recommended_chunk_size(total: usize) -> usize {
    if total < SMALL_READ_THRESHOLD {
        SMALL_READ_THRESHOLD
    } else {
        total.min(MAX_RECOMMENDED_CHUNK)
    }
}

fn span(address: u32, count: usize) -> Result<u32> {
    let length = u32::try_from(count).map_err(|_overflow| ConnectionError::AddressOverflow {
        base: u64::from(address),
        length: count as u64,
    })?;
    AddressRange::new(address, length)?;
    Ok(length)
}

/// A fixed-size value stored in console memory.
pub trait ConsoleValue: Copy + Send {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decode from exactly [`Self::SIZE`] bytes.
    fn from_console_bytes(bytes: &[u8], little_endian: bool) -> Self;

    /// Encode to [`Self::SIZE`] bytes.
    fn to_console_bytes(self, little_endian: bool) -> Vec<u8>;
}

macro_rules! console_value {
    ($($ty:ty),* $(,)?) => {$(
        impl ConsoleValue for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn from_console_bytes(bytes: &[u8], little_endian: bool) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                if little_endian {
                    <$ty>::from_le_bytes(raw)
                } else {
                    <$ty>::from_be_bytes(raw)
                }
            }

            fn to_console_bytes(self, little_endian: bool) -> Vec<u8> {
                if little_endian {
                    self.to_le_bytes().to_vec()
                } else {
                    self.to_be_bytes().to_vec()
                }
            }
        }
    )*};
}

console_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl BusyToken<'_> {
    // ── Reads ───────────────────────────────────────────────────────────────

    /// Read `count` bytes, picking the hex or binary path by size.
    pub async fn read_bytes(&self, address: u32, count: usize) -> Result<Vec<u8>> {
        if count == 0 {
            self.conn.ensure_open()?;
            return Ok(Vec::new());
        }
        if count < SMALL_READ_THRESHOLD {
            self.read_bytes_text(address, count).await
        } else {
            self.read_bytes_binary(address, count).await
        }
    }

    /// Fill `dst` from console memory at `address`.
    pub async fn read_into(&self, address: u32, dst: &mut [u8]) -> Result<()> {
        let bytes = self.read_bytes(address, dst.len()).await?;
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    /// Read through `getmem`. Unreadable bytes come back as zero; use
    /// [`BusyToken::is_memory_invalid_or_protected`] to tell them apart.
    pub async fn read_bytes_text(&self, address: u32, count: usize) -> Result<Vec<u8>> {
        let length = span(address, count)?;
        let lines = self
            .send_command_lines(&codec::getmem_command(address, length))
            .await?;

        let mut out = Vec::with_capacity(count);
        for line in &lines {
            codec::decode_hex_line(line, &mut out)?;
        }
        if out.len() != count {
            return Err(ConnectionError::IncompleteTransfer {
                expected: count,
                received: out.len(),
            });
        }
        Ok(out)
    }

    /// Read through `getmemex` and the binary chunk stream.
    pub async fn read_bytes_binary(&self, address: u32, count: usize) -> Result<Vec<u8>> {
        let length = span(address, count)?;
        self.send_command_expect(
            &codec::getmemex_command(address, length),
            ResponseType::BinaryResponse,
        )
        .await?;
        self.receive_chunks(Some(count)).await
    }

    /// Collect a binary chunk stream of unknown length, after a command
    /// that answered [`ResponseType::BinaryResponse`].
    pub async fn receive_binary(&self) -> Result<Vec<u8>> {
        self.receive_chunks(None).await
    }

    async fn receive_chunks(&self, expected: Option<usize>) -> Result<Vec<u8>> {
        let mut assembler = ChunkAssembler::new(expected);
        loop {
            match assembler.need() {
                ChunkNeed::Header => {
                    let raw = self.read_exact(ChunkHeader::SIZE).await?;
                    let header = ChunkHeader::decode([raw[0], raw[1]]);
                    if let Err(e) = assembler.push_header(header) {
                        // The oversized payload is still on the wire.
                        self.conn.close_for("binary chunk larger than requested");
                        return Err(e);
                    }
                }
                ChunkNeed::Payload(len) => {
                    let payload = self.read_exact(len).await?;
                    assembler.push_payload(&payload)?;
                }
                ChunkNeed::Done => break,
            }
        }
        assembler.finish()
    }

    /// Whether any byte in `[address, address + count)` is unmapped or
    /// protected. Always `false` for an empty span.
    pub async fn is_memory_invalid_or_protected(&self, address: u32, count: usize) -> Result<bool> {
        if count == 0 {
            self.conn.ensure_open()?;
            return Ok(false);
        }
        let length = span(address, count)?;
        let lines = self
            .send_command_lines(&codec::getmem_command(address, length))
            .await?;
        Ok(lines.iter().any(|line| line.contains('?')))
    }

    /// Read `dst.len()` bytes in chunks of `chunk_size` (0 picks
    /// [`recommended_chunk_size`]), reporting progress after each chunk.
    ///
    /// Cancellation is checked before each chunk and leaves the connection
    /// open, since no frame is in flight at that point.
    pub async fn read_chunked(
        &self,
        address: u32,
        dst: &mut [u8],
        chunk_size: usize,
        progress: Option<Progress<'_>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        span(address, dst.len())?;
        let total = dst.len();
        let chunk_size = if chunk_size == 0 {
            recommended_chunk_size(total)
        } else {
            chunk_size
        };

        let mut offset = 0;
        while offset < total {
            if cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }
            let len = chunk_size.min(total - offset);
            let chunk = self.read_bytes(address + offset as u32, len).await?;
            dst[offset..offset + len].copy_from_slice(&chunk);
            offset += len;
            if let Some(report) = progress {
                report(offset as f64 / total as f64);
            }
        }
        Ok(())
    }

    // ── Writes ──────────────────────────────────────────────────────────────

    /// Write `data` at `address` through 64-byte `setmem` commands.
    ///
    /// Chunks landing in unmapped memory are counted, not treated as errors.
    pub async fn write_bytes(&self, address: u32, data: &[u8]) -> Result<WriteReport> {
        span(address, data.len())?;
        let mut report = WriteReport::default();
        for (i, chunk) in data.chunks(SETMEM_CHUNK).enumerate() {
            let chunk_address = address + (i * SETMEM_CHUNK) as u32;
            self.write_one(chunk_address, chunk, &mut report).await?;
        }
        if data.is_empty() {
            self.conn.ensure_open()?;
        }
        Ok(report)
    }

    async fn write_one(&self, address: u32, chunk: &[u8], report: &mut WriteReport) -> Result<()> {
        let command = codec::setmem_command(address, chunk);
        let response = self.send_command(&command).await?;
        match response.kind {
            ResponseType::SingleResponse => {}
            ResponseType::MemoryNotMapped => {
                log::debug!("[xbdm] setmem at 0x{address:08X} hit unmapped memory");
                report.unmapped_chunks += 1;
            }
            other => {
                return Err(ConnectionError::unexpected(
                    &command,
                    other,
                    ResponseType::SingleResponse,
                ))
            }
        }
        report.bytes_written += chunk.len();
        Ok(())
    }

    /// Chunked write with progress and cancellation between chunks.
    pub async fn write_chunked(
        &self,
        address: u32,
        data: &[u8],
        chunk_size: usize,
        progress: Option<Progress<'_>>,
        cancel: &CancellationToken,
    ) -> Result<WriteReport> {
        span(address, data.len())?;
        let chunk_size = if chunk_size == 0 { SETMEM_CHUNK } else { chunk_size };
        let total = data.len();
        let mut report = WriteReport::default();

        let mut offset = 0;
        while offset < total {
            if cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }
            let len = chunk_size.min(total - offset);
            let part = self
                .write_bytes(address + offset as u32, &data[offset..offset + len])
                .await?;
            report.bytes_written += part.bytes_written;
            report.unmapped_chunks += part.unmapped_chunks;
            offset += len;
            if let Some(report_progress) = progress {
                report_progress(offset as f64 / total as f64);
            }
        }
        Ok(report)
    }

    // ── Typed values ────────────────────────────────────────────────────────

    /// Read a value, honouring the connection's endianness.
    pub async fn read_value<T: ConsoleValue>(&self, address: u32) -> Result<T> {
        let bytes = self.read_bytes(address, T::SIZE).await?;
        Ok(T::from_console_bytes(&bytes, self.conn.is_little_endian()))
    }

    /// Write a value, honouring the connection's endianness.
    pub async fn write_value<T: ConsoleValue>(&self, address: u32, value: T) -> Result<WriteReport> {
        let bytes = value.to_console_bytes(self.conn.is_little_endian());
        self.write_bytes(address, &bytes).await
    }

    /// Read `len` bytes as ASCII, stopping at the first NUL.
    pub async fn read_string_ascii(&self, address: u32, len: usize) -> Result<String> {
        let bytes = self.read_bytes(address, len).await?;
        Ok(bytes
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| char::from(b))
            .collect())
    }
}

impl Connection {
    /// Read `count` bytes under one busy-token hold.
    pub async fn read_bytes(&self, address: u32, count: usize) -> Result<Vec<u8>> {
        self.busy().await?.read_bytes(address, count).await
    }

    /// Write `data` under one busy-token hold.
    pub async fn write_bytes(&self, address: u32, data: &[u8]) -> Result<WriteReport> {
        self.busy().await?.write_bytes(address, data).await
    }

    /// Chunked read under one busy-token hold.
    pub async fn read_chunked(
        &self,
        address: u32,
        dst: &mut [u8],
        chunk_size: usize,
        progress: Option<Progress<'_>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.busy()
            .await?
            .read_chunked(address, dst, chunk_size, progress, cancel)
            .await
    }

    /// Chunked write under one busy-token hold.
    pub async fn write_chunked(
        &self,
        address: u32,
        data: &[u8],
        chunk_size: usize,
        progress: Option<Progress<'_>>,
        cancel: &CancellationToken,
    ) -> Result<WriteReport> {
        self.busy()
            .await?
            .write_chunked(address, data, chunk_size, progress, cancel)
            .await
    }

    /// Read a typed value.
    pub async fn read_value<T: ConsoleValue>(&self, address: u32) -> Result<T> {
        self.busy().await?.read_value(address).await
    }

    /// Write a typed value.
    pub async fn write_value<T: ConsoleValue>(&self, address: u32, value: T) -> Result<WriteReport> {
        self.busy().await?.write_value(address, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_chunk_size() {
        assert_eq!(recommended_chunk_size(0), 128);
        assert_eq!(recommended_chunk_size(127), 128);
        assert_eq!(recommended_chunk_size(128), 128);
        assert_eq!(recommended_chunk_size(4096), 4096);
        assert_eq!(recommended_chunk_size(1 << 20), 0xC000);
    }

    #[test]
    fn test_span_rejects_wrapping() {
        assert!(span(0xFFFF_FF00, 0x100).is_err());
        assert_eq!(span(0xFFFF_FF00, 0xFF).unwrap(), 0xFF);
    }

    #[test]
    fn test_console_value_endianness() {
        assert_eq!(0x1234_5678u32.to_console_bytes(false), vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(0x1234_5678u32.to_console_bytes(true), vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(u16::from_console_bytes(&[0xBE, 0xEF], false), 0xBEEF);
        assert_eq!(i32::from_console_bytes(&[0xFF, 0xFF, 0xFF, 0xFE], false), -2);
        let f = 1.5f32.to_console_bytes(false);
        assert_eq!(f32::from_console_bytes(&f, false), 1.5);
    }

    #[test]
    fn test_write_report() {
        let report = WriteReport { bytes_written: 64, unmapped_chunks: 0 };
        assert!(report.fully_mapped());
        assert!(!WriteReport { unmapped_chunks: 1, ..report }.fully_mapped());
    }
}
