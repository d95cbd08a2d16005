//! Pointer chains.
//!
//! A [`DynamicAddress`] is a base plus offsets. Resolving it dereferences
//! the base, adds the first offset, dereferences that, and so on:
//!
//! ```text
//! 82001000 -> 10 -> -4
//!    │         │     └─ *( *(0x82001000) + 0x10 ) - 4
//!    │         └─ *(0x82001000) + 0x10
//!    └─ base
//! ```
//!
//! The chain is re-read every time because the pointers it walks can move.

use std::fmt;
use std::str::FromStr;

use super::{BusyToken, Connection};
use crate::error::Result;

/// A base address and a chain of dereference offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DynamicAddress {
    base: i64,
    offsets: Vec<i32>,
}

impl DynamicAddress {
    /// Build from a base and offsets.
    pub fn new(base: i64, offsets: impl Into<Vec<i32>>) -> Self {
        Self {
            base,
            offsets: offsets.into(),
        }
    }

    /// Starting address.
    pub fn base(&self) -> i64 {
        self.base
    }

    /// Offsets applied after each dereference.
    pub fn offsets(&self) -> &[i32] {
        &self.offsets
    }
}

impl fmt::Display for DynamicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.base)?;
        for &offset in &self.offsets {
            if offset < 0 {
                write!(f, "->-{:X}", offset.unsigned_abs())?;
            } else {
                write!(f, "->{offset:X}")?;
            }
        }
        Ok(())
    }
}

/// Error parsing a [`DynamicAddress`] from `BASE->OFF->OFF` text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid pointer chain {0:?}: expected hex values joined by ->")]
pub struct ParseDynamicAddressError(String);

impl FromStr for DynamicAddress {
    type Err = ParseDynamicAddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ParseDynamicAddressError(s.to_owned());
        let mut parts = s.split("->").map(str::trim);

        let base = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let base = i64::from_str_radix(strip_hex(base), 16).map_err(|_bad| invalid())?;

        let offsets = parts
            .map(|part| {
                let (negative, digits) = match part.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, part),
                };
                let magnitude = i64::from_str_radix(strip_hex(digits), 16).map_err(|_bad| invalid())?;
                let value = if negative { -magnitude } else { magnitude };
                i32::try_from(value).map_err(|_range| invalid())
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { base, offsets })
    }
}

fn strip_hex(text: &str) -> &str {
    text.strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text)
}

/// Add a signed offset to a dereferenced pointer, failing when the result
/// leaves the 32-bit address space.
fn step(value: u32, offset: i32) -> Option<u32> {
    let next = i64::from(value) + i64::from(offset);
    u32::try_from(next).ok()
}

impl BusyToken<'_> {
    /// Walk `address` to its effective address.
    ///
    /// Returns `Ok(None)` when the chain leaves the address space, which is
    /// an ordinary outcome for stale pointers. The whole chain runs under
    /// this token, so nothing else touches the wire between hops.
    pub async fn resolve_pointer(&self, address: &DynamicAddress) -> Result<Option<u32>> {
        self.conn.ensure_open()?;
        let Ok(mut pointer) = u32::try_from(address.base) else {
            return Ok(None);
        };
        for &offset in &address.offsets {
            let value: u32 = self.read_value(pointer).await?;
            match step(value, offset) {
                Some(next) => pointer = next,
                None => return Ok(None),
            }
        }
        Ok(Some(pointer))
    }
}

impl Connection {
    /// Resolve a pointer chain under one busy-token hold.
    pub async fn resolve_pointer(&self, address: &DynamicAddress) -> Result<Option<u32>> {
        self.busy().await?.resolve_pointer(address).await
    }
}
