// vim: tw=80
//! On-disk metadata layout
//!
//! ```text
//! Block 0                 Primary superblock
//! Block 1                 Backup superblock
//! Per megazone, starting at block 2 + m * mz_meta_blocks:
//!     Key                 key_blocks
//!     Forward map         fwd_pages
//!     Reverse map         rev_pages
//!     CRC pages           crc_pages
//! Zone data_start_zone    First data zone of megazone 0
//! ```
//!
//! Metadata is rewritten in place, so it must live in zones without a strict
//! write pointer.

use nix::errno::Errno;
use serde_derive::{Deserialize, Serialize};

use crate::{
    types::*,
    util::*,
};

/// Number of superblock copies
pub const SUPERBLOCKS: LbaT = 2;

/// Map entries per 4 KiB page
pub const ENTRIES_PER_PAGE: u32 = (BYTES_PER_LBA / 4) as u32;

/// Largest value a map entry can hold, plus one
pub const ENTRY_LIMIT: u64 = (1 << 27) - 2;

/// Most megazones that a superblock can describe
pub const MAX_MEGAZONES: usize = 64;

/// Geometry of the underlying device, as input to [`Layout::compute`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Zone size in 512-byte sectors
    pub zone_sectors: SectorT,
    pub nr_zones: ZoneT,
    /// Leading zones that are conventional.  These never hold data.
    pub leading_conventional: ZoneT,
    /// Leading zones that may be rewritten in place: conventional or
    /// sequential-write-preferred.
    pub leading_rewritable: ZoneT,
}

/// Where everything lives on disk
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Layout {
    pub zone_sectors: SectorT,
    pub nr_zones: ZoneT,
    pub data_start_zone: ZoneT,
    pub zones_per_megazone: u32,
    /// Zones per megazone that don't contribute logical capacity
    pub over_provision: u32,
    pub megazones: MzT,
    pub key_blocks: LbaT,
    pub mz_meta_blocks: LbaT,
    pub fwd_pages: u32,
    pub rev_pages: u32,
    pub crc_pages: u32,
    /// Exported capacity, in 4 KiB blocks
    pub logical_blocks: LbaT,
}

impl Layout {
    pub const DEFAULT_ZONES_PER_MEGAZONE: u32 = 1024;
    pub const DEFAULT_OVER_PROVISION: u32 = 5;

    pub fn blocks_per_zone(&self) -> LbaT {
        self.zone_sectors / SECTORS_PER_LBA
    }

    /// Compute a layout for the given device geometry
    pub fn compute(geom: &Geometry, zones_per_megazone: u32,
                   over_provision: u32) -> Result<Self>
    {
        let z = zones_per_megazone;
        let op = over_provision;
        let bpz = geom.zone_sectors / SECTORS_PER_LBA;
        if op < 2 || op >= z || bpz == 0 ||
            geom.zone_sectors % SECTORS_PER_LBA != 0 ||
            u64::from(z) * bpz > ENTRY_LIMIT
        {
            return Err(Error::Sys(Errno::EINVAL));
        }
        let epp = u64::from(ENTRIES_PER_PAGE);
        let fwd_pages = div_roundup(u64::from(z - op) * bpz, epp) as u32;
        let rev_pages = div_roundup(u64::from(z) * bpz, epp) as u32;
        let crc_pages = div_roundup(fwd_pages + rev_pages, ENTRIES_PER_PAGE);
        let key_blocks = div_roundup(
            Self::key_size(z, fwd_pages + rev_pages + crc_pages, crc_pages),
            BYTES_PER_LBA as u64);
        let mz_meta_blocks = key_blocks + u64::from(fwd_pages) +
            u64::from(rev_pages) + u64::from(crc_pages);

        let mut layout = Layout {
            zone_sectors: geom.zone_sectors,
            nr_zones: geom.nr_zones,
            data_start_zone: geom.leading_conventional,
            zones_per_megazone: z,
            over_provision: op,
            megazones: 0,
            key_blocks,
            mz_meta_blocks,
            fwd_pages,
            rev_pages,
            crc_pages,
            logical_blocks: 0,
        };
        loop {
            if layout.data_start_zone >= geom.nr_zones {
                return Err(Error::Sys(Errno::ENOSPC));
            }
            let data_zones = geom.nr_zones - layout.data_start_zone;
            layout.megazones = data_zones / z;
            if data_zones % z > op {
                layout.megazones += 1;
            }
            if layout.megazones == 0 {
                return Err(Error::Sys(Errno::ENOSPC));
            }
            let meta_zones = div_roundup(layout.meta_end(), bpz) as ZoneT;
            if meta_zones <= layout.data_start_zone {
                break;
            }
            layout.data_start_zone = meta_zones;
        }
        if layout.megazones as usize > MAX_MEGAZONES {
            return Err(Error::Sys(Errno::EINVAL));
        }
        let meta_zones = div_roundup(layout.meta_end(), bpz) as ZoneT;
        if meta_zones > geom.leading_rewritable {
            return Err(Error::Sys(Errno::ENOSPC));
        }
        layout.logical_blocks = (0..layout.megazones)
            .map(|m| layout.mz_logical_blocks(m))
            .sum();
        Ok(layout)
    }

    pub fn crc_lba(&self, mz: MzT, page: u32) -> LbaT {
        self.fwd_lba(mz, self.fwd_pages + self.rev_pages + page)
    }

    pub fn fwd_lba(&self, mz: MzT, page: u32) -> LbaT {
        self.key_lba(mz) + self.key_blocks + LbaT::from(page)
    }

    /// Serialized size of a megazone key, in bytes
    fn key_size(zones: u32, pages: u32, crc_pages: u32) -> u64 {
        // checksum, generation, then three length-prefixed vectors of u32
        let stale = 8 + 4 * u64::from(zones);
        let written = 8 + 4 * u64::from(div_roundup(pages, 32));
        let crcs = 8 + 4 * u64::from(crc_pages);
        16 + stale + written + crcs
    }

    pub fn key_lba(&self, mz: MzT) -> LbaT {
        SUPERBLOCKS + LbaT::from(mz) * self.mz_meta_blocks
    }

    /// Split an exported block address into a megazone and an offset within
    /// that megazone's logical space.
    pub fn lba_to_mz(&self, lba: LbaT) -> Option<(MzT, u32)> {
        let stride = self.mz_stride();
        let mz = lba / stride;
        let off = lba % stride;
        if mz >= u64::from(self.megazones) ||
            off >= self.mz_logical_blocks(mz as MzT)
        {
            None
        } else {
            Some((mz as MzT, off as u32))
        }
    }

    /// One past the last metadata block
    pub fn meta_end(&self) -> LbaT {
        SUPERBLOCKS + LbaT::from(self.megazones) * self.mz_meta_blocks
    }

    /// Zone number of the megazone's first zone
    pub fn mz_first_zone(&self, mz: MzT) -> ZoneT {
        self.data_start_zone + mz * self.zones_per_megazone
    }

    /// Exported blocks of a megazone
    pub fn mz_logical_blocks(&self, mz: MzT) -> LbaT {
        let zones = self.mz_zones(mz);
        LbaT::from(zones.saturating_sub(self.over_provision)) *
            self.blocks_per_zone()
    }

    /// Logical address distance between the starts of consecutive megazones
    pub fn mz_stride(&self) -> LbaT {
        LbaT::from(self.zones_per_megazone - self.over_provision) *
            self.blocks_per_zone()
    }

    pub fn mz_to_lba(&self, mz: MzT, off: u32) -> LbaT {
        LbaT::from(mz) * self.mz_stride() + LbaT::from(off)
    }

    /// Number of zones in the megazone.  Only the last may be short.
    pub fn mz_zones(&self, mz: MzT) -> u32 {
        let first = self.mz_first_zone(mz);
        (self.nr_zones - first).min(self.zones_per_megazone)
    }

    /// Device address of a megazone-relative physical block
    pub fn pba_to_lba(&self, mz: MzT, pba: u32) -> LbaT {
        LbaT::from(self.mz_first_zone(mz)) * self.blocks_per_zone() +
            LbaT::from(pba)
    }

    /// Split a device address into a megazone and a physical block offset
    pub fn lba_to_pba(&self, lba: LbaT) -> Option<(MzT, u32)> {
        let bpz = self.blocks_per_zone();
        let zone = (lba / bpz) as ZoneT;
        if zone < self.data_start_zone {
            return None;
        }
        let mz = (zone - self.data_start_zone) / self.zones_per_megazone;
        if mz >= self.megazones {
            return None;
        }
        let pba = lba - LbaT::from(self.mz_first_zone(mz)) * bpz;
        Some((mz, pba as u32))
    }

    pub fn rev_lba(&self, mz: MzT, page: u32) -> LbaT {
        self.fwd_lba(mz, self.fwd_pages + page)
    }

    /// Start sector of a zone
    pub fn zone_start(&self, zone: ZoneT) -> SectorT {
        SectorT::from(zone) * self.zone_sectors
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use rstest::rstest;
use super::*;

/// 64 blocks per zone
fn small(nr_zones: ZoneT, conv: ZoneT) -> Geometry {
    Geometry {
        zone_sectors: 512,
        nr_zones,
        leading_conventional: conv,
        leading_rewritable: conv,
    }
}

#[test]
fn small_device() {
    let layout = Layout::compute(&small(18, 2), 8, 2).unwrap();
    assert_eq!(layout.fwd_pages, 1);
    assert_eq!(layout.rev_pages, 1);
    assert_eq!(layout.crc_pages, 1);
    assert_eq!(layout.key_blocks, 1);
    assert_eq!(layout.mz_meta_blocks, 4);
    assert_eq!(layout.data_start_zone, 2);
    assert_eq!(layout.megazones, 2);
    assert_eq!(layout.logical_blocks, 2 * 6 * 64);
    assert_eq!(layout.key_lba(1), 6);
    assert_eq!(layout.fwd_lba(1, 0), 7);
    assert_eq!(layout.rev_lba(1, 0), 8);
    assert_eq!(layout.crc_lba(1, 0), 9);
    assert_eq!(layout.meta_end(), 10);
}

/// A short trailing megazone is used if it has more zones than the
/// over-provisioning
#[rstest]
#[case(2 + 8 + 3, 2, 8 * 64 - 2 * 64 + 64)]
#[case(2 + 8 + 2, 1, 6 * 64)]
fn short_megazone(#[case] nr_zones: ZoneT, #[case] megazones: MzT,
                  #[case] logical: LbaT)
{
    let layout = Layout::compute(&small(nr_zones, 2), 8, 2).unwrap();
    assert_eq!(layout.megazones, megazones);
    assert_eq!(layout.logical_blocks, logical);
}

#[test]
fn metadata_grows_into_data() {
    // One conventional zone can hold 64 blocks of metadata: only 15
    // megazones' worth.  Thirty megazones need two zones.
    let geom = Geometry {
        zone_sectors: 512,
        nr_zones: 2 + 30 * 8,
        leading_conventional: 1,
        leading_rewritable: 4,
    };
    let layout = Layout::compute(&geom, 8, 2).unwrap();
    assert_eq!(layout.data_start_zone, 2);
    assert_eq!(layout.megazones, 30);
}

#[test]
fn metadata_in_swr_zones() {
    let geom = Geometry {
        zone_sectors: 512,
        nr_zones: 2 + 30 * 8,
        leading_conventional: 1,
        leading_rewritable: 1,
    };
    assert_eq!(Layout::compute(&geom, 8, 2),
               Err(Error::Sys(Errno::ENOSPC)));
}

#[rstest]
#[case(8, 1)]
#[case(8, 8)]
#[case(1 << 22, 5)]
fn bad_params(#[case] z: u32, #[case] op: u32) {
    assert_eq!(Layout::compute(&small(1000, 2), z, op),
               Err(Error::Sys(Errno::EINVAL)));
}

#[test]
fn too_many_megazones() {
    assert_eq!(Layout::compute(&small(8 + 65 * 8, 8), 8, 2),
               Err(Error::Sys(Errno::EINVAL)));
}

#[test]
fn too_small() {
    assert_eq!(Layout::compute(&small(4, 2), 8, 2),
               Err(Error::Sys(Errno::ENOSPC)));
}

#[test]
fn address_translation() {
    let layout = Layout::compute(&small(18, 2), 8, 2).unwrap();
    assert_eq!(layout.mz_stride(), 6 * 64);
    assert_eq!(layout.lba_to_mz(0), Some((0, 0)));
    assert_eq!(layout.lba_to_mz(6 * 64 + 5), Some((1, 5)));
    assert_eq!(layout.lba_to_mz(12 * 64), None);
    assert_eq!(layout.mz_to_lba(1, 5), 6 * 64 + 5);
    assert_eq!(layout.pba_to_lba(1, 65), 10 * 64 + 65);
    assert_eq!(layout.lba_to_pba(10 * 64 + 65), Some((1, 65)));
    assert_eq!(layout.lba_to_pba(5), None);
    assert_eq!(layout.lba_to_pba(18 * 64), None);
}

/// The default geometry: 256 MiB zones, 1024 zones per megazone
#[test]
fn default_fits_entry_range() {
    let geom = Geometry {
        zone_sectors: 1 << 19,
        nr_zones: 16 + 2048,
        leading_conventional: 16,
        leading_rewritable: 16,
    };
    let layout = Layout::compute(&geom, Layout::DEFAULT_ZONES_PER_MEGAZONE,
                                 Layout::DEFAULT_OVER_PROVISION).unwrap();
    assert_eq!(layout.megazones, 2);
    assert_eq!(layout.rev_pages, 65536);
    assert!(layout.meta_end() <= 16 * 65536);
}
}
// LCOV_EXCL_STOP
