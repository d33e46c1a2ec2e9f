// vim: tw=80
//! One megazone's slice of the map: its pages, its key, and its zones

use std::{
    collections::{BTreeSet, HashMap, hash_map::Entry},
    future::Future,
    hash::{Hash, Hasher},
    sync::{Arc, Mutex},
    time::Duration,
};

use divbuf::DivBufShared;
use fixedbitset::FixedBitSet;
use futures::channel::oneshot;
use metrohash::MetroHash64;
use nix::errno::Errno;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{
    device::ZonedDevice,
    layout::{ENTRIES_PER_PAGE, Layout},
    types::*,
    util::*,
    zone_store::ZoneStore,
};
use super::{
    cache::PageCache,
    entry::{MapEntry, Resolved},
    page::{MapPage, PageKey, Table},
};

/// Free zones per megazone that only the garbage collector may open
pub const GC_RESERVE: usize = 1;

const EPP: u32 = ENTRIES_PER_PAGE;

/// On-disk form of a megazone's key
#[derive(Debug, Deserialize, Serialize)]
struct KeyOnDisk {
    /// MetroHash64 self-checksum.  Includes the key's LBA, to detect
    /// misdirected writes.
    checksum: u64,
    generation: u64,
    /// Stale blocks in each zone
    stale: Vec<u32>,
    /// Bitmap of pages that have ever been written
    written: Vec<u32>,
    /// CRC32 of each CRC page
    crc_sums: Vec<u32>,
}

impl KeyOnDisk {
    fn hash(lba: LbaT, generation: u64, stale: &[u32], written: &[u32],
            crc_sums: &[u32]) -> u64
    {
        let mut hasher = MetroHash64::new();
        hasher.write_u64(lba);
        generation.hash(&mut hasher);
        stale.hash(&mut hasher);
        written.hash(&mut hasher);
        crc_sums.hash(&mut hasher);
        hasher.finish()
    }

    fn deserialize(lba: LbaT, buf: &[u8]) -> Result<Self> {
        let kod: KeyOnDisk = bincode::deserialize(buf)
            .map_err(|_| Error::MapInconsistency)?;
        let expected = Self::hash(lba, kod.generation, &kod.stale,
                                  &kod.written, &kod.crc_sums);
        if expected == kod.checksum {
            Ok(kod)
        } else {
            Err(Error::MapInconsistency)
        }
    }

    fn new(lba: LbaT, st: &MzState) -> Self {
        let written = st.written.as_slice().to_vec();
        let checksum = Self::hash(lba, st.generation, &st.stale, &written,
                                  &st.crc_sums);
        KeyOnDisk {
            checksum,
            generation: st.generation,
            stale: st.stale.clone(),
            written,
            crc_sums: st.crc_sums.clone()
        }
    }
}

#[derive(Debug)]
pub(super) struct MzState {
    pub(super) generation: u64,
    pub(super) stale: Vec<u32>,
    pub(super) written: FixedBitSet,
    pub(super) crc_sums: Vec<u32>,
    key_dirty: bool,
    /// Zone currently receiving writes, as an index within the megazone
    open: Option<u32>,
    free: BTreeSet<u32>,
}

/// How one data zone is being used
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneUsage {
    /// Index of the zone within its megazone
    pub idx: u32,
    /// Blocks below the write pointer
    pub written: u32,
    /// Written blocks that no longer hold live data
    pub stale: u32,
    pub open: bool,
    pub free: bool,
}

impl ZoneUsage {
    pub fn live(&self) -> u32 {
        self.written.saturating_sub(self.stale)
    }
}

type Waiters = Vec<oneshot::Sender<Result<Arc<MapPage>>>>;

/// A group of zones sharing one forward and one reverse address space.
pub struct MegazoneGroup {
    pub(super) mz: MzT,
    pub(super) layout: Layout,
    pub(super) device: Arc<dyn ZonedDevice>,
    store: Arc<ZoneStore>,
    pub(super) cache: Mutex<PageCache>,
    /// Pages being read from disk, and whoever else is waiting for them
    pending: Mutex<HashMap<PageKey, Waiters>>,
    /// Serializes allocation, device writes, and map mutation
    io_lock: tokio::sync::Mutex<()>,
    /// Allows only one writeback at a time
    pub(super) flush_lock: tokio::sync::Mutex<()>,
    pub(super) state: Mutex<MzState>,
}

impl MegazoneGroup {
    /// Pick the device block for the next write: the open zone's write
    /// pointer, opening a free zone if need be.
    ///
    /// Ordinary writes may not use the last [`GC_RESERVE`] zones' worth of
    /// unwritten blocks, whether they're in free zones or in the open zone.
    pub fn allocate(&self, for_gc: bool) -> Result<LbaT> {
        let bpz = self.layout.blocks_per_zone();
        let reserve = GC_RESERVE as LbaT * bpz;
        let mut st = self.state.lock().unwrap();
        loop {
            if let Some(idx) = st.open {
                let (start, end) = self.zone_limits(idx);
                let wp = self.store.lookup(start)
                    .and_then(|d| d.wp)
                    .unwrap_or(start);
                if wp < end {
                    let room = (end - wp) / SECTORS_PER_LBA;
                    let avail = st.free.len() as LbaT * bpz + room;
                    if !for_gc && avail <= reserve {
                        return Err(Error::Sys(Errno::ENOSPC));
                    }
                    return Ok(wp / SECTORS_PER_LBA);
                }
                st.open = None;
            }
            if st.free.is_empty() || (!for_gc && st.free.len() <= GC_RESERVE) {
                return Err(Error::Sys(Errno::ENOSPC));
            }
            let idx = st.free.pop_first();
            debug!(mz = self.mz, zone = ?idx, "opening zone");
            st.open = idx;
        }
    }

    /// Assign each zone to the free set, the open zone, or neither, based on
    /// its write pointer.  The first partially written zone becomes the open
    /// zone.
    pub fn classify_zones(&self) {
        let mut st = self.state.lock().unwrap();
        st.free.clear();
        st.open = None;
        for idx in 0..self.zones() {
            let (start, end) = self.zone_limits(idx);
            let wp = self.store.lookup(start)
                .and_then(|d| d.wp)
                .unwrap_or(start);
            if wp <= start {
                st.free.insert(idx);
                st.stale[idx as usize] = 0;
            } else if wp < end && st.open.is_none() {
                st.open = Some(idx);
            }
        }
    }

    pub(super) fn crc_location(&self, key: PageKey) -> (u32, u32) {
        let flat = self.flat(key);
        (flat / EPP, flat % EPP)
    }

    async fn crc_page(&self, i: u32) -> Result<Arc<MapPage>> {
        let key = PageKey::new(Table::Crc, i);
        self.get_cached(key, async move {
            let flat = self.flat(key);
            let (written, expected) = {
                let st = self.state.lock().unwrap();
                (st.written.contains(flat as usize), st.crc_sums[i as usize])
            };
            if !written {
                return Ok(MapPage::new(key));
            }
            let buf = self.read_block(self.page_lba(key)).await?;
            if crc32fast::hash(&buf) != expected {
                warn!(mz = self.mz, page = i, "CRC page checksum mismatch");
                return Err(Error::MapInconsistency);
            }
            Ok(MapPage::from_bytes(key, &buf))
        }).await
    }

    /// A fresh megazone with every page unwritten and every zone free
    pub fn create(mz: MzT, layout: Layout, device: Arc<dyn ZonedDevice>,
                  store: Arc<ZoneStore>, cache_pages: usize) -> Self
    {
        let zones = layout.mz_zones(mz) as usize;
        let pages = Self::total_pages(&layout);
        let st = MzState {
            generation: 0,
            stale: vec![0; zones],
            written: FixedBitSet::with_capacity(pages),
            crc_sums: vec![0; layout.crc_pages as usize],
            key_dirty: true,
            open: None,
            free: (0..zones as u32).collect(),
        };
        Self::new(mz, layout, device, store, cache_pages, st)
    }

    /// Evict clean pages that haven't been used for a while
    pub fn evict_aged(&self, ageout: Duration) -> usize {
        self.cache.lock().unwrap().evict_aged(ageout)
    }

    /// Index of a page among every page of the megazone: forward pages first,
    /// then reverse pages, then CRC pages.
    pub(super) fn flat(&self, key: PageKey) -> u32 {
        match key.table {
            Table::Fwd => key.index,
            Table::Rev => self.layout.fwd_pages + key.index,
            Table::Crc => {
                self.layout.fwd_pages + self.layout.rev_pages + key.index
            }
        }
    }

    /// Write every dirty page, then every dirty CRC page, then the key.
    #[instrument(skip(self), fields(mz = self.mz))]
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let dirty = self.cache.lock().unwrap().dirty_pages();
        let mut wrote = false;
        for page in dirty.iter().filter(|p| p.key().table != Table::Crc) {
            let key = page.key();
            let (crc_i, crc_slot) = self.crc_location(key);
            let crc_page = self.crc_page(crc_i).await?;
            let buf = page.take_for_writeback();
            let sum = crc32fast::hash(&buf);
            if let Err(e) = self.write_block(buf, self.page_lba(key)).await {
                page.mark_dirty();
                return Err(e);
            }
            crc_page.set_raw(crc_slot, sum);
            self.state.lock().unwrap().written.insert(self.flat(key) as usize);
            wrote = true;
        }
        drop(dirty);
        let dirty_crcs = self.cache.lock().unwrap().dirty_pages();
        for page in dirty_crcs.iter().filter(|p| p.key().table == Table::Crc) {
            let key = page.key();
            let buf = page.take_for_writeback();
            let sum = crc32fast::hash(&buf);
            if let Err(e) = self.write_block(buf, self.page_lba(key)).await {
                page.mark_dirty();
                return Err(e);
            }
            let mut st = self.state.lock().unwrap();
            st.crc_sums[key.index as usize] = sum;
            st.written.insert(self.flat(key) as usize);
            wrote = true;
        }
        let key_dirty = self.state.lock().unwrap().key_dirty;
        if wrote || key_dirty {
            self.write_key().await?;
        }
        Ok(())
    }

    pub fn free_zones(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    /// Return the cached page, or load it with `load`.  Concurrent loads of
    /// the same page are coalesced.
    async fn get_cached<F>(&self, key: PageKey, load: F)
        -> Result<Arc<MapPage>>
        where F: Future<Output = Result<MapPage>>
    {
        let rx = {
            let mut cache = self.cache.lock().unwrap();
            if let Some(page) = cache.get(&key) {
                return Ok(page);
            }
            let mut pending = self.pending.lock().unwrap();
            match pending.entry(key) {
                Entry::Occupied(mut o) => {
                    let (tx, rx) = oneshot::channel();
                    o.get_mut().push(tx);
                    Some(rx)
                }
                Entry::Vacant(v) => {
                    v.insert(Vec::new());
                    None
                }
            }
        };
        if let Some(rx) = rx {
            return rx.await.unwrap_or(Err(Error::Sys(Errno::EIO)));
        }
        let r = load.await.map(Arc::new);
        let mut cache = self.cache.lock().unwrap();
        let waiters = self.pending.lock().unwrap()
            .remove(&key)
            .unwrap_or_default();
        let r = r.map(|page| cache.insert(page));
        for w in waiters {
            // The waiter may have given up
            let _ = w.send(r.clone());
        }
        r
    }

    /// Record a new mapping from `loff` to `pba`, both megazone-relative.
    ///
    /// Returns the physical block that `loff` used to map to.  That block
    /// becomes stale.  The caller must hold the io lock.
    pub async fn insert(&self, loff: u32, pba: u32) -> Result<Option<u32>> {
        let fwd = self.map_page(PageKey::new(Table::Fwd, loff / EPP)).await?;
        let old = fwd.get(loff % EPP).resolve();
        let rev = self.map_page(PageKey::new(Table::Rev, pba / EPP)).await?;
        let old_rev = match old {
            Resolved::Value(opba) => {
                let key = PageKey::new(Table::Rev, opba / EPP);
                Some((opba, self.map_page(key).await?))
            }
            Resolved::Unused => None,
            r => {
                warn!(mz = self.mz, loff, ?r, "overwriting damaged entry");
                None
            }
        };
        fwd.set(loff % EPP, MapEntry::new(pba));
        rev.set(pba % EPP, MapEntry::new(loff));
        let prev = old_rev.map(|(opba, orev)| {
            if orev.get(opba % EPP).resolve() == Resolved::Value(loff) {
                orev.set(opba % EPP, MapEntry::UNUSED);
            }
            self.mark_stale(opba);
            opba
        });
        drop((fwd, rev));
        self.shrink().await?;
        Ok(prev)
    }

    pub fn io_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.io_lock
    }

    /// Every live block in a zone, as `(pba, loff)` pairs
    pub async fn live_blocks(&self, idx: u32) -> Result<Vec<(u32, u32)>> {
        let bpz = self.layout.blocks_per_zone() as u32;
        let start = idx * bpz;
        let end = start + bpz;
        let mut live = Vec::new();
        let mut p = start;
        while p < end {
            let page = self.map_page(PageKey::new(Table::Rev, p / EPP)).await?;
            let page_end = end.min((p / EPP + 1) * EPP);
            for q in p..page_end {
                match page.get(q % EPP).resolve() {
                    Resolved::Value(loff) => live.push((q, loff)),
                    Resolved::Unused => (),
                    r => {
                        warn!(mz = self.mz, pba = q, ?r, "damaged rev entry");
                        return Err(Error::MapInconsistency);
                    }
                }
            }
            p = page_end;
        }
        Ok(live)
    }

    pub async fn lookup(&self, loff: u32) -> Result<Option<u32>> {
        let page = self.map_page(PageKey::new(Table::Fwd, loff / EPP)).await?;
        let r = page.get(loff % EPP).resolve();
        drop(page);
        self.shrink().await?;
        Self::resolved_to_option(r)
    }

    async fn map_page(&self, key: PageKey) -> Result<Arc<MapPage>> {
        debug_assert!(key.table != Table::Crc);
        self.get_cached(key, async move {
            let flat = self.flat(key);
            if !self.state.lock().unwrap().written.contains(flat as usize) {
                return Ok(MapPage::new(key));
            }
            let (crc_i, crc_slot) = self.crc_location(key);
            let expected = self.crc_page(crc_i).await?.get_raw(crc_slot);
            let buf = self.read_block(self.page_lba(key)).await?;
            if crc32fast::hash(&buf) != expected {
                warn!(mz = self.mz, ?key, "map page checksum mismatch");
                return Err(Error::MapInconsistency);
            }
            Ok(MapPage::from_bytes(key, &buf))
        }).await
    }

    pub(super) fn mark_key_dirty(&self) {
        self.state.lock().unwrap().key_dirty = true;
    }

    fn mark_stale(&self, pba: u32) {
        let bpz = self.layout.blocks_per_zone() as u32;
        let mut st = self.state.lock().unwrap();
        if let Some(s) = st.stale.get_mut((pba / bpz) as usize) {
            *s += 1;
        }
        st.key_dirty = true;
    }

    pub fn mz(&self) -> MzT {
        self.mz
    }

    fn new(mz: MzT, layout: Layout, device: Arc<dyn ZonedDevice>,
           store: Arc<ZoneStore>, cache_pages: usize, st: MzState) -> Self
    {
        MegazoneGroup {
            mz,
            layout,
            device,
            store,
            cache: Mutex::new(PageCache::with_capacity(cache_pages)),
            pending: Mutex::new(HashMap::new()),
            io_lock: tokio::sync::Mutex::new(()),
            flush_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(st),
        }
    }

    /// Load a megazone's key from disk
    pub async fn open(mz: MzT, layout: Layout, device: Arc<dyn ZonedDevice>,
                      store: Arc<ZoneStore>, cache_pages: usize)
        -> Result<Self>
    {
        let lba = layout.key_lba(mz);
        let len = layout.key_blocks as usize * BYTES_PER_LBA;
        let dbs = DivBufShared::from(vec![0u8; len]);
        device.read_at(dbs.try_mut().expect("fresh buffer"), lba).await?;
        let buf = dbs.try_const().expect("no writers");
        let kod = KeyOnDisk::deserialize(lba, &buf[..]).inspect_err(|_| {
            warn!(mz, lba, "Corrupt megazone key");
        })?;
        let pages = Self::total_pages(&layout);
        if kod.stale.len() != layout.mz_zones(mz) as usize ||
            kod.crc_sums.len() != layout.crc_pages as usize ||
            kod.written.len() * 32 < pages
        {
            warn!(mz, "Megazone key doesn't match the layout");
            return Err(Error::MapInconsistency);
        }
        let st = MzState {
            generation: kod.generation,
            stale: kod.stale,
            written: FixedBitSet::with_capacity_and_blocks(pages, kod.written),
            crc_sums: kod.crc_sums,
            key_dirty: false,
            open: None,
            free: BTreeSet::new(),
        };
        Ok(Self::new(mz, layout, device, store, cache_pages, st))
    }

    pub(super) fn page_lba(&self, key: PageKey) -> LbaT {
        match key.table {
            Table::Fwd => self.layout.fwd_lba(self.mz, key.index),
            Table::Rev => self.layout.rev_lba(self.mz, key.index),
            Table::Crc => self.layout.crc_lba(self.mz, key.index),
        }
    }

    pub(super) async fn read_block(&self, lba: LbaT) -> Result<Vec<u8>> {
        let dbs = DivBufShared::from(vec![0u8; BYTES_PER_LBA]);
        self.device.read_at(dbs.try_mut().expect("fresh buffer"), lba).await?;
        let buf = dbs.try_const().expect("no writers");
        Ok(buf[..].to_vec())
    }

    /// Return a reclaimed zone to the free set
    pub fn release_zone(&self, idx: u32) {
        let mut st = self.state.lock().unwrap();
        st.stale[idx as usize] = 0;
        if st.open == Some(idx) {
            st.open = None;
        }
        st.free.insert(idx);
        st.key_dirty = true;
    }

    /// Unmap a logical block.  Returns the physical block it used to occupy,
    /// which becomes stale.  The caller must hold the io lock.
    pub async fn remove(&self, loff: u32) -> Result<Option<u32>> {
        let fwd = self.map_page(PageKey::new(Table::Fwd, loff / EPP)).await?;
        let opba = match fwd.get(loff % EPP).resolve() {
            Resolved::Value(opba) => opba,
            Resolved::Unused => return Ok(None),
            _ => return Err(Error::MapInconsistency)
        };
        let orev = self.map_page(PageKey::new(Table::Rev, opba / EPP)).await?;
        fwd.set(loff % EPP, MapEntry::UNUSED);
        if orev.get(opba % EPP).resolve() == Resolved::Value(loff) {
            orev.set(opba % EPP, MapEntry::UNUSED);
        }
        self.mark_stale(opba);
        drop((fwd, orev));
        self.shrink().await?;
        Ok(Some(opba))
    }

    fn resolved_to_option(r: Resolved) -> Result<Option<u32>> {
        match r {
            Resolved::Value(v) => Ok(Some(v)),
            Resolved::Unused => Ok(None),
            Resolved::NotFound | Resolved::Corrupt => {
                Err(Error::MapInconsistency)
            }
        }
    }

    /// Which logical block occupies a physical block?
    pub async fn reverse(&self, pba: u32) -> Result<Option<u32>> {
        let page = self.map_page(PageKey::new(Table::Rev, pba / EPP)).await?;
        let r = page.get(pba % EPP).resolve();
        drop(page);
        self.shrink().await?;
        Self::resolved_to_option(r)
    }

    /// Bring the cache back within its capacity, writing back dirty pages if
    /// necessary.
    async fn shrink(&self) -> Result<()> {
        let fits = self.cache.lock().unwrap().evict_excess();
        if !fits {
            debug!(mz = self.mz, "page cache full; flushing");
            self.flush().await?;
            self.cache.lock().unwrap().evict_excess();
        }
        Ok(())
    }

    pub(super) fn total_pages(layout: &Layout) -> usize {
        (layout.fwd_pages + layout.rev_pages + layout.crc_pages) as usize
    }

    pub(super) async fn write_block(&self, buf: Vec<u8>, lba: LbaT)
        -> Result<()>
    {
        let dbs = DivBufShared::from(buf);
        self.device.write_at(dbs.try_const().expect("no writers"), lba).await
    }

    pub(super) async fn write_key(&self) -> Result<()> {
        let lba = self.layout.key_lba(self.mz);
        let buf = {
            let mut st = self.state.lock().unwrap();
            st.generation += 1;
            st.key_dirty = false;
            let kod = KeyOnDisk::new(lba, &st);
            bincode::serialize(&kod).map_err(|_| Error::Sys(Errno::EIO))?
        };
        let len = self.layout.key_blocks as usize * BYTES_PER_LBA;
        if buf.len() > len {
            return Err(Error::Sys(Errno::EINVAL));
        }
        let mut padded = buf;
        padded.resize(len, 0);
        let r = self.write_block(padded, lba).await;
        if r.is_err() {
            self.state.lock().unwrap().key_dirty = true;
        }
        r
    }

    /// Sector range of a zone, by its index within the megazone
    pub fn zone_limits(&self, idx: u32) -> (SectorT, SectorT) {
        let zone = self.layout.mz_first_zone(self.mz) + idx;
        let start = self.layout.zone_start(zone);
        (start, start + self.layout.zone_sectors)
    }

    pub fn zone_usage(&self) -> Vec<ZoneUsage> {
        let st = self.state.lock().unwrap();
        (0..self.zones()).map(|idx| {
            let (start, _) = self.zone_limits(idx);
            let wp = self.store.lookup(start)
                .and_then(|d| d.wp)
                .unwrap_or(start);
            ZoneUsage {
                idx,
                written: ((wp - start) / SECTORS_PER_LBA) as u32,
                stale: st.stale[idx as usize],
                open: st.open == Some(idx),
                free: st.free.contains(&idx),
            }
        }).collect()
    }

    /// Number of data zones in this megazone
    pub fn zones(&self) -> u32 {
        self.layout.mz_zones(self.mz)
    }
}

// LCOV_EXCL_STOP
