// vim: tw=80
//! Zone descriptors, as reported by a zoned block device

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use serde_derive::{Deserialize, Serialize};
use std::ops::Range;
use tracing::warn;

use crate::types::*;

/// The ZBC zone type field
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Primitive,
         Serialize)]
pub enum ZoneType {
    /// Randomly writable.  No write pointer.
    Conventional = 1,
    /// Sequential write required.  Writes must land at the write pointer.
    SeqRequired = 2,
    /// Sequential write preferred.  Random writes are allowed but slow.
    SeqPreferred = 3,
}

impl ZoneType {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        ZoneType::from_u8(nibble)
    }
}

/// The ZBC zone condition field, plus two states that only exist in memory.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ZoneCondition {
    NoWp,
    Empty,
    ImplicitOpen,
    ExplicitOpen,
    Closed,
    ReadOnly,
    Full,
    Offline,
    /// A refresh or reset is in progress.  Admission must wait.
    Busy,
    /// The device reported a condition we don't understand.
    Unknown,
}

impl ZoneCondition {
    /// Decode the 4-bit condition field of a zone descriptor
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble {
            0x0 => ZoneCondition::NoWp,
            0x1 => ZoneCondition::Empty,
            0x2 => ZoneCondition::ImplicitOpen,
            0x3 => ZoneCondition::ExplicitOpen,
            0x4 => ZoneCondition::Closed,
            0xd => ZoneCondition::ReadOnly,
            0xe => ZoneCondition::Full,
            0xf => ZoneCondition::Offline,
            x => {
                warn!(condition = x, "reserved zone condition");
                ZoneCondition::Unknown
            }
        }
    }

    /// Encode as the 4-bit condition field.  The in-memory states have no
    /// on-wire form, and encode as whatever the write pointer implies.
    pub fn to_nibble(self) -> u8 {
        match self {
            ZoneCondition::NoWp => 0x0,
            ZoneCondition::Empty => 0x1,
            ZoneCondition::ImplicitOpen => 0x2,
            ZoneCondition::ExplicitOpen => 0x3,
            ZoneCondition::Closed => 0x4,
            ZoneCondition::ReadOnly => 0xd,
            ZoneCondition::Full => 0xe,
            ZoneCondition::Offline => 0xf,
            ZoneCondition::Busy | ZoneCondition::Unknown => 0x4,
        }
    }
}

/// One zone's state.  Sectors are always 512 bytes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ZoneDescriptor {
    pub start: SectorT,
    pub len: SectorT,
    pub zone_type: ZoneType,
    pub cond: ZoneCondition,
    /// `None` for zones that have no write pointer
    pub wp: Option<SectorT>,
}

impl ZoneDescriptor {
    /// An empty zone of the given type
    pub fn empty(start: SectorT, len: SectorT, zone_type: ZoneType) -> Self {
        let (cond, wp) = if zone_type == ZoneType::Conventional {
            (ZoneCondition::NoWp, None)
        } else {
            (ZoneCondition::Empty, Some(start))
        };
        ZoneDescriptor { start, len, zone_type, cond, wp }
    }

    pub fn contains(&self, sector: SectorT) -> bool {
        sector >= self.start && sector < self.end()
    }

    /// One past the last sector of the zone.  Decoded descriptors never
    /// overflow here.
    pub fn end(&self) -> SectorT {
        self.start.saturating_add(self.len)
    }

    pub fn range(&self) -> Range<SectorT> {
        self.start..self.end()
    }

    /// Is this zone shingled, that is, does it have a write pointer?
    pub fn is_smr(&self) -> bool {
        self.zone_type != ZoneType::Conventional
    }

    pub fn is_seq_required(&self) -> bool {
        self.zone_type == ZoneType::SeqRequired
    }

    pub fn is_full(&self) -> bool {
        self.cond == ZoneCondition::Full ||
            self.wp.is_some_and(|wp| wp >= self.end())
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use rstest::rstest;
use super::*;

#[rstest]
#[case(0x0, ZoneCondition::NoWp)]
#[case(0x1, ZoneCondition::Empty)]
#[case(0x4, ZoneCondition::Closed)]
#[case(0xe, ZoneCondition::Full)]
#[case(0xf, ZoneCondition::Offline)]
#[case(0x7, ZoneCondition::Unknown)]
fn condition_nibble(#[case] nibble: u8, #[case] cond: ZoneCondition) {
    assert_eq!(ZoneCondition::from_nibble(nibble), cond);
}

#[test]
fn zone_type_nibble() {
    assert_eq!(ZoneType::from_nibble(1), Some(ZoneType::Conventional));
    assert_eq!(ZoneType::from_nibble(2), Some(ZoneType::SeqRequired));
    assert_eq!(ZoneType::from_nibble(0), None);
    assert_eq!(ZoneType::from_nibble(4), None);
}

#[test]
fn empty_conventional() {
    let z = ZoneDescriptor::empty(0, 0x800, ZoneType::Conventional);
    assert_eq!(z.wp, None);
    assert_eq!(z.cond, ZoneCondition::NoWp);
    assert!(!z.is_smr());
}

#[test]
fn geometry() {
    let z = ZoneDescriptor::empty(0x1000, 0x800, ZoneType::SeqRequired);
    assert!(z.contains(0x1000));
    assert!(z.contains(0x17ff));
    assert!(!z.contains(0x1800));
    assert!(!z.contains(0xfff));
    assert_eq!(z.end(), 0x1800);
    assert!(!z.is_full());
}
}
// LCOV_EXCL_STOP
