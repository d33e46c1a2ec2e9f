// vim: tw=80
//! The interface ZDM consumes from a zoned block device

use std::pin::Pin;

#[cfg(test)] use mockall::automock;
use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// Boxed future returned by every device operation
pub type BoxDevFut<T> =
    Pin<Box<dyn futures::Future<Output = Result<T>> + Send>>;

/// Filter for REPORT ZONES
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ReportingOption {
    All,
    Empty,
    ImplicitOpen,
    ExplicitOpen,
    Closed,
    Full,
    ReadOnly,
    Offline,
    NoWp,
}

/// What to reset with RESET WRITE POINTER
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResetTarget {
    /// The zone beginning at this sector
    Zone(SectorT),
    /// Every sequential zone on the device
    All,
}

/// A host-managed or host-aware zoned block device.
///
/// Zone operations are addressed in 512-byte sectors.  Data operations are
/// addressed in 4096-byte LBAs.
#[cfg_attr(test, automock)]
pub trait ZonedDevice: Send + Sync {
    /// Size of the device, in 512-byte sectors
    fn capacity(&self) -> SectorT;

    /// Number of 512-byte sectors per device logical block.  Zone reports are
    /// in logical blocks.
    fn logical_sector_scale(&self) -> u32;

    /// Issue REPORT ZONES starting at `start`, filling the caller's buffer.
    ///
    /// With `partial` set, the header's list length only counts the records
    /// that fit in the buffer.
    fn report_zones(&self, start: SectorT, buf: Vec<u8>,
                    option: ReportingOption, partial: bool)
        -> BoxDevFut<Vec<u8>>;

    /// Rewind a zone's write pointer, discarding its contents
    fn reset_write_pointer(&self, target: ResetTarget) -> BoxDevFut<()>;

    fn read_at(&self, buf: IoVecMut, lba: LbaT) -> BoxDevFut<()>;

    /// Ensure that all data written so far reaches stable storage.
    fn sync_all(&self) -> BoxDevFut<()>;

    fn write_at(&self, buf: IoVec, lba: LbaT) -> BoxDevFut<()>;
}
