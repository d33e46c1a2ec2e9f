// vim: tw=80
//! File-backed emulation of a host-managed zoned block device
//!
//! Data lives in an ordinary file.  Zone state lives in memory, and is saved
//! to a sidecar file named `<path>.zones` whenever the device is synced.

use std::{
    fs::{self, File, OpenOptions},
    hash::{Hash, Hasher},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use metrohash::MetroHash64;
use nix::errno::Errno;
use serde_derive::{Deserialize, Serialize};
use tokio::task;
use tracing::{debug, warn};

use crate::{
    device::*,
    report::{self, Same, HEADER_LEN, RECORD_LEN},
    types::*,
    util::*,
    zone::*,
};

/// Largest write issued when zeroing a reset zone
const ZERO_CHUNK: usize = 1 << 20;

/// Shape of an emulated device
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct FileGeometry {
    /// Zone size in 512-byte sectors.  Must be a whole number of LBAs.
    pub zone_sectors: SectorT,
    /// Number of conventional zones at the start of the device
    pub conventional_zones: u32,
    /// Emulate a host-aware drive, whose shingled zones are only
    /// sequential-write-preferred
    pub seq_preferred: bool,
    /// Logical block size in bytes.  Zone reports are in these units.
    pub logical_block_size: u32,
}

impl Default for FileGeometry {
    fn default() -> Self {
        FileGeometry {
            zone_sectors: 1 << 19,      // 256 MiB
            conventional_zones: 8,
            seq_preferred: false,
            logical_block_size: 4096,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
struct EmuZone {
    zone_type: ZoneType,
    cond: ZoneCondition,
    /// Offset of the write pointer from the zone's start
    wp: SectorT,
}

#[derive(Debug, Deserialize, Serialize)]
struct ZoneTableOnDisk {
    /// MetroHash64 self-checksum of everything else
    checksum: u64,
    geometry: FileGeometry,
    zones: Vec<EmuZone>,
}

impl ZoneTableOnDisk {
    fn hash(geometry: &FileGeometry, zones: &[EmuZone]) -> u64 {
        let mut hasher = MetroHash64::new();
        geometry.hash(&mut hasher);
        zones.hash(&mut hasher);
        hasher.finish()
    }

    fn new(geometry: FileGeometry, zones: Vec<EmuZone>) -> Self {
        let checksum = Self::hash(&geometry, &zones);
        ZoneTableOnDisk { checksum, geometry, zones }
    }
}

fn sidecar(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".zones");
    PathBuf::from(s)
}

fn eio() -> Error {
    Error::DeviceError(Errno::EIO)
}

/// A zoned block device emulated on top of a regular file
#[derive(Debug)]
pub struct FileZonedDevice {
    file: Arc<File>,
    geometry: FileGeometry,
    path: PathBuf,
    zones: Arc<Mutex<Vec<EmuZone>>>,
}

impl FileZonedDevice {
    /// Format an existing file as an emulated zoned device.  Every shingled
    /// zone starts out empty.
    ///
    /// The file's size must be at least one more zone than the number of
    /// conventional zones.  Any partial trailing zone is ignored.
    pub fn create<P: AsRef<Path>>(path: P, geometry: FileGeometry)
        -> Result<Self>
    {
        let spl = SECTORS_PER_LBA;
        if geometry.zone_sectors == 0 || geometry.zone_sectors % spl != 0 ||
            !matches!(geometry.logical_block_size, 512 | 4096)
        {
            return Err(Error::Sys(Errno::EINVAL));
        }
        let file = Self::open_file(path.as_ref())?;
        let len = file.metadata()?.len();
        let nzones = len / (geometry.zone_sectors * BYTES_PER_SECTOR as u64);
        if nzones <= u64::from(geometry.conventional_zones) {
            return Err(Error::Sys(Errno::ENOSPC));
        }
        let smr_type = if geometry.seq_preferred {
            ZoneType::SeqPreferred
        } else {
            ZoneType::SeqRequired
        };
        let zones = (0..nzones).map(|z| {
            if z < u64::from(geometry.conventional_zones) {
                EmuZone {
                    zone_type: ZoneType::Conventional,
                    cond: ZoneCondition::NoWp,
                    wp: 0
                }
            } else {
                EmuZone{zone_type: smr_type, cond: ZoneCondition::Empty, wp: 0}
            }
        }).collect::<Vec<_>>();
        let dev = FileZonedDevice {
            file: Arc::new(file),
            geometry,
            path: path.as_ref().to_path_buf(),
            zones: Arc::new(Mutex::new(zones)),
        };
        Self::save_zones(&dev.path, geometry, &dev.zones)?;
        Ok(dev)
    }

    fn descriptor(&self, i: usize, z: &EmuZone) -> ZoneDescriptor {
        let start = i as SectorT * self.geometry.zone_sectors;
        let wp = if z.zone_type == ZoneType::Conventional {
            None
        } else {
            Some(start + z.wp)
        };
        ZoneDescriptor {
            start,
            len: self.geometry.zone_sectors,
            zone_type: z.zone_type,
            cond: z.cond,
            wp
        }
    }

    pub fn geometry(&self) -> FileGeometry {
        self.geometry
    }

    /// Open an emulated device previously made by [`FileZonedDevice::create`]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read(sidecar(path.as_ref())).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::Sys(Errno::ENOENT)
            } else {
                Error::from(e)
            }
        })?;
        let table: ZoneTableOnDisk = bincode::deserialize(&raw[..])
            .map_err(|_| eio())?;
        if table.checksum != ZoneTableOnDisk::hash(&table.geometry, &table.zones)
        {
            warn!(path = %path.as_ref().display(), "Corrupt zone table");
            return Err(eio());
        }
        let file = Self::open_file(path.as_ref())?;
        Ok(FileZonedDevice {
            file: Arc::new(file),
            geometry: table.geometry,
            path: path.as_ref().to_path_buf(),
            zones: Arc::new(Mutex::new(table.zones)),
        })
    }

    fn open_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Error::Sys(Errno::ENOENT)
                } else {
                    Error::from(e)
                }
            })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn save_zones(path: &Path, geometry: FileGeometry,
                  zones: &Mutex<Vec<EmuZone>>) -> Result<()>
    {
        let table = ZoneTableOnDisk::new(geometry, zones.lock().unwrap().clone());
        let buf = bincode::serialize(&table).map_err(|_| eio())?;
        fs::write(sidecar(path), buf)?;
        Ok(())
    }

    /// Check a write against zone state, and advance the write pointer.
    fn validate_write(&self, sector: SectorT, len: SectorT) -> Result<()> {
        let zs = self.geometry.zone_sectors;
        let mut zones = self.zones.lock().unwrap();
        let first = (sector / zs) as usize;
        let last = ((sector + len - 1) / zs) as usize;
        if last >= zones.len() {
            return Err(eio());
        }
        for i in first..=last {
            let z = &mut zones[i];
            match z.zone_type {
                ZoneType::Conventional => continue,
                _ if first != last => {
                    debug!(sector, len, "write crosses a zone boundary");
                    return Err(eio());
                }
                _ => ()
            }
            let off = sector - i as SectorT * zs;
            match z.cond {
                ZoneCondition::ReadOnly | ZoneCondition::Offline |
                    ZoneCondition::Full => return Err(eio()),
                _ => ()
            }
            if z.zone_type == ZoneType::SeqRequired {
                if off != z.wp {
                    debug!(sector, wp = z.wp, "unaligned write");
                    return Err(eio());
                }
                z.wp += len;
            } else {
                z.wp = z.wp.max(off + len);
            }
            z.cond = if z.wp == zs {
                ZoneCondition::Full
            } else {
                ZoneCondition::ImplicitOpen
            };
        }
        Ok(())
    }

    /// Zero `[off, off + len)` of the file
    fn zero_range(file: &File, off: u64, len: u64) -> io::Result<()> {
        let zeros = vec![0u8; ZERO_CHUNK];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(ZERO_CHUNK as u64);
            file.write_all_at(&zeros[..n as usize], off + done)?;
            done += n;
        }
        Ok(())
    }
}

impl ZonedDevice for FileZonedDevice {
    fn capacity(&self) -> SectorT {
        self.zones.lock().unwrap().len() as SectorT * self.geometry.zone_sectors
    }

    fn logical_sector_scale(&self) -> u32 {
        self.geometry.logical_block_size / BYTES_PER_SECTOR as u32
    }

    fn report_zones(&self, start: SectorT, mut buf: Vec<u8>,
                    option: ReportingOption, partial: bool)
        -> BoxDevFut<Vec<u8>>
    {
        if buf.len() < HEADER_LEN {
            return Box::pin(futures::future::err(Error::Sys(Errno::EINVAL)));
        }
        let scale = self.logical_sector_scale();
        let zones = self.zones.lock().unwrap();
        let first = (start / self.geometry.zone_sectors) as usize;
        let types_differ = zones.iter()
            .any(|z| z.zone_type != zones[0].zone_type);
        let same = if types_differ {
            Same::SameLenDiffTypes
        } else {
            Same::AllSame
        };
        let matching = zones.iter()
            .enumerate()
            .skip(first)
            .filter(|(_, z)| match option {
                ReportingOption::All => true,
                ReportingOption::Empty => z.cond == ZoneCondition::Empty,
                ReportingOption::ImplicitOpen =>
                    z.cond == ZoneCondition::ImplicitOpen,
                ReportingOption::ExplicitOpen =>
                    z.cond == ZoneCondition::ExplicitOpen,
                ReportingOption::Closed => z.cond == ZoneCondition::Closed,
                ReportingOption::Full => z.cond == ZoneCondition::Full,
                ReportingOption::ReadOnly => z.cond == ZoneCondition::ReadOnly,
                ReportingOption::Offline => z.cond == ZoneCondition::Offline,
                ReportingOption::NoWp => z.cond == ZoneCondition::NoWp,
            })
            .map(|(i, z)| self.descriptor(i, z))
            .collect::<Vec<_>>();
        drop(zones);
        buf.fill(0);
        let room = (buf.len() - HEADER_LEN) / RECORD_LEN;
        let nrecs = matching.len().min(room);
        for (i, desc) in matching.iter().take(nrecs).enumerate() {
            let off = HEADER_LEN + i * RECORD_LEN;
            report::encode_record(&mut buf[off..off + RECORD_LEN], desc, scale);
        }
        let listed = if partial { nrecs } else { matching.len() };
        report::encode_header(&mut buf, (listed * RECORD_LEN) as u32, same);
        Box::pin(futures::future::ok(buf))
    }

    fn reset_write_pointer(&self, target: ResetTarget) -> BoxDevFut<()> {
        let zs = self.geometry.zone_sectors;
        let mut ranges = Vec::new();
        {
            let mut zones = self.zones.lock().unwrap();
            let targets = match target {
                ResetTarget::Zone(sector) => {
                    let i = (sector / zs) as usize;
                    if sector % zs != 0 || i >= zones.len() ||
                        zones[i].zone_type == ZoneType::Conventional
                    {
                        return Box::pin(futures::future::err(
                            Error::DeviceError(Errno::EINVAL)));
                    }
                    i..i + 1
                }
                ResetTarget::All => 0..zones.len()
            };
            for i in targets {
                let z = &mut zones[i];
                match (z.zone_type, z.cond) {
                    (ZoneType::Conventional, _) => continue,
                    (_, ZoneCondition::ReadOnly | ZoneCondition::Offline) => {
                        if let ResetTarget::Zone(_) = target {
                            return Box::pin(futures::future::err(eio()));
                        }
                        continue;
                    }
                    _ => ()
                }
                if z.wp > 0 {
                    let start = i as u64 * zs * BYTES_PER_SECTOR as u64;
                    ranges.push((start, z.wp * BYTES_PER_SECTOR as u64));
                }
                z.wp = 0;
                z.cond = ZoneCondition::Empty;
            }
        }
        let file = self.file.clone();
        Box::pin(async move {
            task::spawn_blocking(move || {
                for (off, len) in ranges {
                    Self::zero_range(&file, off, len)?;
                }
                Ok::<(), io::Error>(())
            }).await
            .map_err(|_| eio())?
            .map_err(Error::from)
        })
    }

    fn read_at(&self, mut buf: IoVecMut, lba: LbaT) -> BoxDevFut<()> {
        let off = lba * BYTES_PER_LBA as u64;
        let sectors = (buf.len() / BYTES_PER_SECTOR) as SectorT;
        if lba * SECTORS_PER_LBA + sectors > self.capacity() {
            return Box::pin(futures::future::err(eio()));
        }
        let file = self.file.clone();
        Box::pin(async move {
            task::spawn_blocking(move || file.read_exact_at(&mut buf[..], off))
                .await
                .map_err(|_| eio())?
                .map_err(Error::from)
        })
    }

    fn sync_all(&self) -> BoxDevFut<()> {
        let file = self.file.clone();
        let path = self.path.clone();
        let geometry = self.geometry;
        let zones = self.zones.clone();
        Box::pin(async move {
            task::spawn_blocking(move || {
                file.sync_all()?;
                Self::save_zones(&path, geometry, &zones)
            }).await
            .map_err(|_| eio())?
        })
    }

    fn write_at(&self, buf: IoVec, lba: LbaT) -> BoxDevFut<()> {
        debug_assert_eq!(buf.len() % BYTES_PER_LBA, 0);
        let sector = lba * SECTORS_PER_LBA;
        let len = (buf.len() / BYTES_PER_SECTOR) as SectorT;
        if len == 0 {
            return Box::pin(futures::future::ok(()));
        }
        if let Err(e) = self.validate_write(sector, len) {
            return Box::pin(futures::future::err(e));
        }
        let off = lba * BYTES_PER_LBA as u64;
        let file = self.file.clone();
        Box::pin(async move {
            task::spawn_blocking(move || file.write_all_at(&buf[..], off))
                .await
                .map_err(|_| eio())?
                .map_err(Error::from)
        })
    }
}

// LCOV_EXCL_STOP
