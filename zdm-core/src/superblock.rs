// vim: tw=80
//! The Metadata Superblock
//!
//! ```text
//! Offset  Size    Field
//! 0       4       CRC32 of the whole block, computed with this field zeroed
//! 4       4       Reserved
//! 8       16      Magic
//! 24      16      UUID
//! 40      4       Version, 0xMMMMmmpt
//! 44      4       Flags.  Bit 0 is the dirty flag.
//! 48      8       Generation
//! 56      56      Layout
//! 112     1       Discard
//! 113     1       GC status
//! 116     16      GC tunables
//! 132     16      Cache tunables
//! 160     64      Label, NUL padded
//! 224     512     Key LBA of each megazone
//! ```
//!
//! All fields are little-endian.  Block 0 holds the primary copy and block 1
//! the backup.

use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use divbuf::DivBufShared;
use nix::errno::Errno;
use num_traits::FromPrimitive;
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    config::{CacheTunables, FormatOptions, GcStatus, GcTunables, LABEL_MAX},
    device::ZonedDevice,
    layout::{Layout, MAX_MEGAZONES, SUPERBLOCKS},
    types::*,
    util::*,
};

pub const MAGIC: [u8; 16] = [
    0x7a, 0x6f, 0x6e, 0x65, 0x63, 0x44, 0x45, 0x56,
    0x82, 0x65, 0xf5, 0x7f, 0x48, 0xba, 0x6d, 0x81
];

/// Version 1.0.0
pub const VERSION: u32 = 0x0001_0000;

/// Most blocks that [`wipe`] will zero
pub const WIPE_BLOCKS: LbaT = 2048;

const FLAG_DIRTY: u32 = 1;

const CRC: usize = 0;
const MAGIC_OFS: usize = 8;
const UUID: usize = 24;
const VERS: usize = 40;
const FLAGS: usize = 44;
const GENERATION: usize = 48;
const LAYOUT: usize = 56;
const DISCARD: usize = 112;
const GC_STATUS: usize = 113;
const GC: usize = 116;
const CACHE: usize = 132;
const LABEL: usize = 160;
const KEYS: usize = 224;

/// CRC32 of a superblock block, with its checksum field treated as zero
pub fn checksum(block: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[0u8; 4]);
    hasher.update(&block[CRC + 4..BYTES_PER_LBA]);
    hasher.finalize()
}

/// Does the block's stored checksum match its contents?
pub fn verify(block: &[u8]) -> bool {
    block.len() >= BYTES_PER_LBA &&
        LittleEndian::read_u32(&block[CRC..CRC + 4]) == checksum(block)
}

/// In-memory form of the superblock
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Superblock {
    pub uuid: Uuid,
    pub version: u32,
    pub dirty: bool,
    pub generation: u64,
    pub layout: Layout,
    pub discard: bool,
    pub gc: GcTunables,
    pub cache: CacheTunables,
    pub label: String,
}

impl Superblock {
    /// Parse an on-disk superblock
    pub fn decode(block: &[u8]) -> Result<Self> {
        if !verify(block) {
            return Err(Error::CorruptSuperblock);
        }
        if block[MAGIC_OFS..MAGIC_OFS + 16] != MAGIC[..] {
            return Err(Error::CorruptSuperblock);
        }
        let version = LittleEndian::read_u32(&block[VERS..]);
        if version >> 16 != VERSION >> 16 {
            warn!(version, "Unsupported superblock version");
            return Err(Error::Sys(Errno::ENOTSUP));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&block[UUID..UUID + 16]);
        let l = &block[LAYOUT..];
        let layout = Layout {
            zone_sectors: LittleEndian::read_u64(&l[0..]),
            nr_zones: LittleEndian::read_u32(&l[8..]),
            data_start_zone: LittleEndian::read_u32(&l[12..]),
            zones_per_megazone: LittleEndian::read_u32(&l[16..]),
            over_provision: LittleEndian::read_u32(&l[20..]),
            megazones: LittleEndian::read_u32(&l[24..]),
            key_blocks: LittleEndian::read_u32(&l[28..]).into(),
            mz_meta_blocks: LittleEndian::read_u32(&l[32..]).into(),
            fwd_pages: LittleEndian::read_u32(&l[36..]),
            rev_pages: LittleEndian::read_u32(&l[40..]),
            crc_pages: LittleEndian::read_u32(&l[44..]),
            logical_blocks: LittleEndian::read_u64(&l[48..]),
        };
        if layout.megazones as usize > MAX_MEGAZONES {
            return Err(Error::CorruptSuperblock);
        }
        for mz in 0..layout.megazones {
            let ofs = KEYS + 8 * mz as usize;
            if LittleEndian::read_u64(&block[ofs..]) != layout.key_lba(mz) {
                warn!(mz, "Superblock key location doesn't match its layout");
                return Err(Error::CorruptSuperblock);
            }
        }
        let status = GcStatus::from_u8(block[GC_STATUS])
            .ok_or(Error::CorruptSuperblock)?;
        let g = &block[GC..];
        let gc = GcTunables {
            prio_def: LittleEndian::read_u16(&g[0..]),
            prio_low: LittleEndian::read_u16(&g[2..]),
            prio_high: LittleEndian::read_u16(&g[4..]),
            prio_crit: LittleEndian::read_u16(&g[6..]),
            wm_crit: LittleEndian::read_u16(&g[8..]),
            wm_high: LittleEndian::read_u16(&g[10..]),
            wm_low: LittleEndian::read_u16(&g[12..]),
            status,
        };
        let c = &block[CACHE..];
        let cache = CacheTunables {
            size: LittleEndian::read_u32(&c[0..]),
            read_ahead: LittleEndian::read_u32(&c[4..]),
            ageout_ms: LittleEndian::read_u32(&c[8..]),
            journal_age: LittleEndian::read_u32(&c[12..]),
        };
        let raw_label = &block[LABEL..LABEL + LABEL_MAX + 1];
        let label_len = raw_label.iter()
            .position(|b| *b == 0)
            .unwrap_or(LABEL_MAX);
        let label = String::from_utf8_lossy(&raw_label[..label_len])
            .into_owned();
        Ok(Superblock {
            uuid: Uuid::from_bytes(uuid),
            version,
            dirty: LittleEndian::read_u32(&block[FLAGS..]) & FLAG_DIRTY != 0,
            generation: LittleEndian::read_u64(&block[GENERATION..]),
            layout,
            discard: block[DISCARD] != 0,
            gc,
            cache,
            label,
        })
    }

    /// Serialize to a full block, checksum included
    pub fn encode(&self) -> Vec<u8> {
        let mut block = vec![0u8; BYTES_PER_LBA];
        block[MAGIC_OFS..MAGIC_OFS + 16].copy_from_slice(&MAGIC[..]);
        block[UUID..UUID + 16].copy_from_slice(self.uuid.as_bytes());
        LittleEndian::write_u32(&mut block[VERS..], self.version);
        let flags = if self.dirty { FLAG_DIRTY } else { 0 };
        LittleEndian::write_u32(&mut block[FLAGS..], flags);
        LittleEndian::write_u64(&mut block[GENERATION..], self.generation);
        {
            let layout = &self.layout;
            let l = &mut block[LAYOUT..];
            LittleEndian::write_u64(&mut l[0..], layout.zone_sectors);
            LittleEndian::write_u32(&mut l[8..], layout.nr_zones);
            LittleEndian::write_u32(&mut l[12..], layout.data_start_zone);
            LittleEndian::write_u32(&mut l[16..], layout.zones_per_megazone);
            LittleEndian::write_u32(&mut l[20..], layout.over_provision);
            LittleEndian::write_u32(&mut l[24..], layout.megazones);
            LittleEndian::write_u32(&mut l[28..], layout.key_blocks as u32);
            LittleEndian::write_u32(&mut l[32..], layout.mz_meta_blocks as u32);
            LittleEndian::write_u32(&mut l[36..], layout.fwd_pages);
            LittleEndian::write_u32(&mut l[40..], layout.rev_pages);
            LittleEndian::write_u32(&mut l[44..], layout.crc_pages);
            LittleEndian::write_u64(&mut l[48..], layout.logical_blocks);
        }
        block[DISCARD] = u8::from(self.discard);
        block[GC_STATUS] = self.gc.status as u8;
        {
            let g = &mut block[GC..];
            LittleEndian::write_u16(&mut g[0..], self.gc.prio_def);
            LittleEndian::write_u16(&mut g[2..], self.gc.prio_low);
            LittleEndian::write_u16(&mut g[4..], self.gc.prio_high);
            LittleEndian::write_u16(&mut g[6..], self.gc.prio_crit);
            LittleEndian::write_u16(&mut g[8..], self.gc.wm_crit);
            LittleEndian::write_u16(&mut g[10..], self.gc.wm_high);
            LittleEndian::write_u16(&mut g[12..], self.gc.wm_low);
        }
        {
            let c = &mut block[CACHE..];
            LittleEndian::write_u32(&mut c[0..], self.cache.size);
            LittleEndian::write_u32(&mut c[4..], self.cache.read_ahead);
            LittleEndian::write_u32(&mut c[8..], self.cache.ageout_ms);
            LittleEndian::write_u32(&mut c[12..], self.cache.journal_age);
        }
        let label = self.label.as_bytes();
        let label_len = label.len().min(LABEL_MAX);
        block[LABEL..LABEL + label_len].copy_from_slice(&label[..label_len]);
        for mz in 0..self.layout.megazones.min(MAX_MEGAZONES as u32) {
            let ofs = KEYS + 8 * mz as usize;
            LittleEndian::write_u64(&mut block[ofs..], self.layout.key_lba(mz));
        }
        let crc = checksum(&block);
        LittleEndian::write_u32(&mut block[CRC..], crc);
        block
    }

    /// A clean superblock for a newly formatted device
    pub fn new(layout: Layout, opts: &FormatOptions) -> Self {
        Superblock {
            uuid: opts.uuid.unwrap_or_else(Uuid::new_v4),
            version: VERSION,
            dirty: false,
            generation: 1,
            layout,
            discard: opts.discard,
            gc: opts.gc,
            cache: opts.cache,
            label: opts.label.clone(),
        }
    }
}

async fn read_blocks(device: &dyn ZonedDevice, lba: LbaT, n: LbaT)
    -> Result<Vec<u8>>
{
    let dbs = DivBufShared::from(vec![0u8; n as usize * BYTES_PER_LBA]);
    device.read_at(dbs.try_mut().expect("fresh buffer"), lba).await?;
    let buf = dbs.try_const().expect("no writers");
    Ok(buf[..].to_vec())
}

/// Read both superblock copies and return the first valid one.
///
/// Without `repair`, only the primary is considered.  With it, a damaged
/// primary is replaced by the backup.
pub async fn load(device: &dyn ZonedDevice, repair: bool)
    -> Result<Superblock>
{
    let blocks = read_blocks(device, 0, SUPERBLOCKS).await?;
    let primary = Superblock::decode(&blocks[..BYTES_PER_LBA]);
    match primary {
        Ok(sb) => Ok(sb),
        Err(Error::CorruptSuperblock) if repair => {
            warn!("Primary superblock is corrupt; trying the backup");
            let sb = Superblock::decode(&blocks[BYTES_PER_LBA..])?;
            write_one(device, &sb.encode(), 0).await?;
            device.sync_all().await?;
            info!("Restored the primary superblock from the backup");
            Ok(sb)
        }
        Err(e) => Err(e)
    }
}

/// Look for a superblock without complaint.
///
/// Returns `None` if the primary block has a bad checksum or no magic.
pub async fn probe(device: &dyn ZonedDevice) -> Result<Option<Superblock>> {
    let block = read_blocks(device, 0, 1).await?;
    if !verify(&block) || block[MAGIC_OFS..MAGIC_OFS + 16] != MAGIC[..] {
        return Ok(None);
    }
    Superblock::decode(&block).map(Some)
}

/// Zero the superblocks and as much of the metadata region as can be found,
/// up to [`WIPE_BLOCKS`].
pub async fn wipe(device: &dyn ZonedDevice) -> Result<()> {
    const CHUNK: LbaT = 256;
    let end = match probe(device).await {
        Ok(Some(sb)) => sb.layout.meta_end(),
        _ => SUPERBLOCKS
    }.min(WIPE_BLOCKS);
    let zero = DivBufShared::from(vec![0u8; CHUNK as usize * BYTES_PER_LBA]);
    let mut lba = 0;
    while lba < end {
        let n = CHUNK.min(end - lba);
        let buf = zero.try_const().expect("no writers")
            .slice_to(n as usize * BYTES_PER_LBA);
        device.write_at(buf, lba).await?;
        lba += n;
    }
    device.sync_all().await?;
    info!(blocks = end, "Wiped metadata");
    Ok(())
}

async fn write_one(device: &dyn ZonedDevice, block: &[u8], lba: LbaT)
    -> Result<()>
{
    let dbs = DivBufShared::from(block.to_vec());
    device.write_at(dbs.try_const().expect("no writers"), lba).await
}

/// Write both copies of the superblock and make them durable
pub async fn write(device: &dyn ZonedDevice, sb: &Superblock) -> Result<()> {
    let block = sb.encode();
    write_one(device, &block, 0).await?;
    write_one(device, &block, 1).await?;
    device.sync_all().await
}

/// Owns the active superblock, and serializes updates to it
pub struct SuperblockManager {
    device: Arc<dyn ZonedDevice>,
    sb: Mutex<Superblock>,
    /// Held while writing to disk
    wlock: futures_locks::Mutex<()>,
}

impl SuperblockManager {
    pub fn get(&self) -> Superblock {
        self.sb.lock().unwrap().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.sb.lock().unwrap().dirty
    }

    /// Persist the clean flag and bump the generation.  The caller must have
    /// already flushed every dirty map page.
    pub async fn mark_clean(&self) -> Result<()> {
        self.modify(|sb| {
            sb.dirty = false;
            sb.generation += 1;
        }).await
    }

    /// Persist the dirty flag, if it isn't set already
    pub async fn mark_dirty(&self) -> Result<()> {
        if self.is_dirty() {
            return Ok(());
        }
        let _guard = self.wlock.lock().await;
        let mut new = self.get();
        if new.dirty {
            return Ok(());
        }
        new.dirty = true;
        write(&*self.device, &new).await?;
        *self.sb.lock().unwrap() = new;
        Ok(())
    }

    /// Apply `f` to a copy of the superblock and write it.  The in-memory copy
    /// only changes if the write succeeds.
    pub async fn modify<F>(&self, f: F) -> Result<()>
        where F: FnOnce(&mut Superblock)
    {
        let _guard = self.wlock.lock().await;
        let mut new = self.get();
        f(&mut new);
        write(&*self.device, &new).await?;
        *self.sb.lock().unwrap() = new;
        Ok(())
    }

    pub fn new(device: Arc<dyn ZonedDevice>, sb: Superblock) -> Self {
        SuperblockManager {
            device,
            sb: Mutex::new(sb),
            wlock: futures_locks::Mutex::new(()),
        }
    }
}

// LCOV_EXCL_STOP
