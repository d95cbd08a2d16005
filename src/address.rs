//! Address ranges and console-reported memory regions.

use serde::Serialize;

use crate::constants::{PROTECT_DENY_READ, PROTECT_DENY_WRITE};
use crate::error::{ConnectionError, Result};
use crate::protocol::ParamList;

/// A `[base, base + length)` span of the 32-bit console address space.
///
/// `base + length` never exceeds `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AddressRange {
    base: u32,
    length: u32,
}

impl AddressRange {
    /// Build a range, rejecting spans that wrap past `u32::MAX`.
    pub fn new(base: u32, length: u32) -> Result<Self> {
        if base.checked_add(length).is_none() {
            return Err(ConnectionError::AddressOverflow {
                base: u64::from(base),
                length: u64::from(length),
            });
        }
        Ok(Self { base, length })
    }

    /// The whole range a debug monitor connection can address.
    pub const fn full() -> Self {
        Self { base: 0, length: u32::MAX }
    }

    /// First address.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Span in bytes.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// One past the last address.
    pub fn end(&self) -> u32 {
        self.base + self.length
    }

    /// Whether `address` lies inside the range.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && address < self.end()
    }

    /// Whether `[address, address + length)` lies inside the range.
    pub fn contains_span(&self, address: u32, length: u32) -> Result<bool> {
        let span = Self::new(address, length)?;
        Ok(span.base >= self.base && span.end() <= self.end())
    }

    /// Shorten `length` so that `[address, address + length)` ends inside
    /// the range.
    pub fn clamp_length(&self, address: u32, length: u32) -> Result<u32> {
        let span = Self::new(address, length)?;
        Ok(self.end().min(span.end()).saturating_sub(address))
    }
}

/// One entry of the console's virtual memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryRegion {
    /// Virtual base address.
    pub base: u32,
    /// Size in bytes.
    pub size: u32,
    /// Page protection flags as reported by the console.
    pub protection: u32,
    /// Physical address backing the region.
    pub physical: u32,
}

impl MemoryRegion {
    /// Parse a `walkmem` line:
    /// `base=0x... size=0x... protect=0x... phys=0x...`.
    ///
    /// Missing fields read as zero.
    pub fn parse(line: &str) -> Self {
        let params = ParamList::parse(line, false);
        Self {
            base: params.get_u32("base").unwrap_or(0),
            size: params.get_u32("size").unwrap_or(0),
            protection: params.get_u32("protect").unwrap_or(0),
            physical: params.get_u32("phys").unwrap_or(0),
        }
    }

    /// Whether the region is safe to read.
    pub fn is_readable(&self) -> bool {
        self.protection & PROTECT_DENY_READ == 0
    }

    /// Whether the region is safe to write.
    pub fn is_writable(&self) -> bool {
        self.protection & PROTECT_DENY_WRITE == 0
    }

    /// The region as an [`AddressRange`], clamped to the address space.
    pub fn range(&self) -> AddressRange {
        let length = u32::MAX - self.base;
        AddressRange {
            base: self.base,
            length: self.size.min(length),
        }
    }
}
