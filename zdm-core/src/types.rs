// vim: tw=80
//! Common type definitions used throughout ZDM

use divbuf::{DivBuf, DivBufMut};
use nix::errno::Errno;
use serde::{
    ser::{Serialize, Serializer},
    de::{Deserialize, Deserializer},
    ser::SerializeTuple
};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    io,
    str::FromStr,
};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Indexes an LBA.  LBAs are always 4096 bytes
pub type LbaT = u64;

/// Indexes a 512-byte sector.  Zone reports and admission control work in
/// sectors, regardless of the device's logical block size.
pub type SectorT = u64;

/// Indexes a device's Zones, in ascending order of start sector.
pub type ZoneT = u32;

/// Indexes a megazone: a group of data zones that share one forward and one
/// reverse map address space.
pub type MzT = u32;

/// ZDM's error type.
///
/// The first group of variants is the translation layer's own taxonomy.  The
/// last two wrap errnos: `DeviceError` for failures reported by the zoned
/// device, `Sys` for locally detected conditions like lack of space.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// A report zones response buffer was truncated or malformed
    #[error("Malformed zone report")]
    DecodeError,
    /// A working buffer could not be allocated, even at the minimum size
    #[error("Cannot allocate buffer")]
    AllocationError,
    /// The I/O violates the zone's write pointer contract.  Not retryable.
    #[error("Request rejected by write pointer admission")]
    AdmissionReject,
    /// The zone's state is unknown or being refreshed.  Retry after the
    /// refresh completes.
    #[error("Request deferred pending zone refresh")]
    AdmissionDefer,
    /// Superblock checksum or magic mismatch
    #[error("Corrupt superblock")]
    CorruptSuperblock,
    /// Forward and reverse maps disagree in a way that can't be derived
    #[error("Map inconsistency")]
    MapInconsistency,
    /// The zoned device failed a report, reset, read, or write
    #[error("Device error: {0}")]
    DeviceError(Errno),
    #[error("{0}")]
    Sys(Errno),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let errno = e.raw_os_error()
            .map(Errno::from_raw)
            .unwrap_or(Errno::EIO);
        Error::DeviceError(errno)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::DeviceError(e)
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// ZDM UUID type
///
/// This is just like the `Uuid` from the `uuid` crate, except that it
/// serializes as a fixed-size array instead of a slice
// The Uuid crate serializes to a slice, and its maintainers have ruled out ever
// serializing to a fixed-size array instead.
// See Also [Uuid #557](https://github.com/uuid-rs/uuid/issues/557)
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Uuid(uuid::Uuid);

impl Uuid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn new_v4() -> Self {
        Uuid(uuid::Uuid::new_v4())
    }
}

impl FromStr for Uuid {
    type Err = <uuid::Uuid as FromStr>::Err;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        uuid::Uuid::from_str(s).map(Self)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
        where D: Deserializer<'de>
    {
        <[u8; 16]>::deserialize(deserializer)
        .map(|v| Uuid(uuid::Uuid::from_bytes(v)))
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Uuid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
        where S: Serializer
    {
        let bytes = self.0.as_bytes();
        debug_assert_eq!(bytes.len(), 16);
        let mut tup = serializer.serialize_tuple(16)?;
        for b in bytes.iter() {
            tup.serialize_element(&b)?;
        }
        tup.end()
    }
}

// LCOV_EXCL_STOP
