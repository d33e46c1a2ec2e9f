// vim: tw=80
//! Self-checking map entries
//!
//! Each entry is a little-endian `u32`.  The low 27 bits hold the value, and
//! the high 5 bits hold check bits derived from the value's CRC32.  Values that
//! would collide with the two sentinels are never stored.

use crate::layout::ENTRY_LIMIT;

const VALUE_BITS: u32 = 27;
const VALUE_MASK: u32 = (1 << VALUE_BITS) - 1;

/// What an entry means, once its check bits have been verified
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolved {
    /// Never mapped, or unmapped since
    Unused,
    /// Lost, pending repair.  Only exists in memory during a check.
    NotFound,
    Value(u32),
    /// Check bits don't match, or the value is out of range
    Corrupt,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MapEntry(u32);

impl MapEntry {
    pub const UNUSED: MapEntry = MapEntry(0xFFFF_FFFF);
    pub const NOT_FOUND: MapEntry = MapEntry(0xFFFF_FFFE);

    fn check_bits(value: u32) -> u32 {
        crc32fast::hash(&value.to_le_bytes()) & 0x1f
    }

    pub fn from_raw(raw: u32) -> Self {
        MapEntry(raw)
    }

    /// Encode a value.  It must be below [`ENTRY_LIMIT`].
    pub fn new(value: u32) -> Self {
        debug_assert!(u64::from(value) < ENTRY_LIMIT);
        MapEntry(value | (Self::check_bits(value) << VALUE_BITS))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn resolve(self) -> Resolved {
        match self {
            MapEntry::UNUSED => Resolved::Unused,
            MapEntry::NOT_FOUND => Resolved::NotFound,
            MapEntry(raw) => {
                let value = raw & VALUE_MASK;
                if u64::from(value) >= ENTRY_LIMIT ||
                    raw >> VALUE_BITS != Self::check_bits(value)
                {
                    Resolved::Corrupt
                } else {
                    Resolved::Value(value)
                }
            }
        }
    }
}

// LCOV_EXCL_STOP
