// vim: tw=80
//! The translation device
//!
//! `Zdm` exports a randomly writable block device on top of a zoned one.
//! Every logical block write lands at the write pointer of its megazone's open
//! zone, and the map remembers where it went.

use std::{
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use nix::errno::Errno;
use tokio::{
    runtime::Handle,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    admission::{Admission, IoRequest, admit},
    config::{Config, FormatOptions, GcStatus},
    device::ZonedDevice,
    gc::{self, Cleaner, Urgency},
    layout::{Geometry, Layout},
    map::{CheckReport, Map, MegazoneGroup},
    refresh::ZoneRefresher,
    superblock::{self, Superblock, SuperblockManager},
    types::*,
    util::*,
    zone::{ZoneDescriptor, ZoneType},
    zone_store::ZoneStore,
};

/// Derive the layout inputs from a fully refreshed zone store.
///
/// Zones must be contiguous and equally sized, except that a short final zone
/// is ignored.
pub fn geometry(zones: &[ZoneDescriptor]) -> Result<Geometry> {
    let first = zones.first().ok_or(Error::Sys(Errno::EINVAL))?;
    let zone_sectors = first.len;
    let mut nr_zones: ZoneT = 0;
    for (i, z) in zones.iter().enumerate() {
        if z.start != i as SectorT * zone_sectors {
            warn!(start = z.start, "zones are not contiguous");
            return Err(Error::Sys(Errno::EINVAL));
        }
        if z.len != zone_sectors {
            if i == zones.len() - 1 && z.len < zone_sectors {
                debug!(start = z.start, len = z.len, "ignoring runt zone");
                break;
            }
            warn!(start = z.start, len = z.len, "irregular zone size");
            return Err(Error::Sys(Errno::EINVAL));
        }
        nr_zones += 1;
    }
    let leading_conventional = zones.iter()
        .take_while(|z| z.zone_type == ZoneType::Conventional)
        .count() as ZoneT;
    let leading_rewritable = zones.iter()
        .take_while(|z| !z.is_seq_required())
        .count() as ZoneT;
    Ok(Geometry {
        zone_sectors,
        nr_zones,
        leading_conventional: leading_conventional.min(nr_zones),
        leading_rewritable: leading_rewritable.min(nr_zones),
    })
}

/// Everything the foreground path and the background tasks share
pub(crate) struct Shared {
    pub(crate) device: Arc<dyn ZonedDevice>,
    pub(crate) store: Arc<ZoneStore>,
    pub(crate) refresher: Arc<ZoneRefresher>,
    pub(crate) map: Map,
    pub(crate) sbm: SuperblockManager,
    /// Map mutations hold it shared.  Sync holds it exclusively, so that the
    /// clean flag never covers a half-applied mutation.
    pub(crate) txn: futures_locks::RwLock<()>,
    /// Only one garbage collection pass at a time
    pub(crate) gc_lock: tokio::sync::Mutex<()>,
    pub(crate) handle: Handle,
}

impl Shared {
    /// Flush the map, make it durable, and mark the superblock clean.
    pub(crate) async fn sync(&self) -> Result<()> {
        let _txn = self.txn.write().await;
        self.map.flush().await?;
        self.device.sync_all().await?;
        if self.sbm.is_dirty() {
            self.sbm.mark_clean().await?;
        }
        Ok(())
    }

    /// A device write failed after admission advanced the write pointer.
    /// Fence the zone until a refresh learns where the pointer really is.
    pub(crate) fn write_failed(&self, dev_lba: LbaT) {
        let sector = dev_lba * SECTORS_PER_LBA;
        if let Some(desc) = self.store.lookup(sector) {
            warn!(zone = desc.start, "write failed; revalidating zone");
            self.store.mark_busy(desc.range(), 1);
            drop(self.refresher.spawn(&self.handle, desc.range()));
        }
    }
}

/// An activated translation device
pub struct Zdm {
    pub(crate) shared: Arc<Shared>,
    config: Config,
    cleaner: Option<Cleaner>,
    /// Periodic background tasks
    tasks: Vec<JoinHandle<()>>,
}

impl Zdm {
    /// Wait for a refresh of `range`, up to the configured timeout
    async fn await_refresh(&self, range: Range<SectorT>) {
        let mut rx = self.shared.refresher.subscribe();
        drop(self.shared.refresher.spawn(&self.shared.handle, range));
        let timeout = self.config.defer_timeout();
        if tokio::time::timeout(timeout, rx.changed()).await.is_err() {
            warn!(?timeout, "timed out waiting for a zone refresh");
        }
    }

    /// Check an inactive device's map without activating it.
    ///
    /// With `fix`, the map is repaired, and then the superblock is marked
    /// clean.
    pub async fn check_device(device: Arc<dyn ZonedDevice>, config: &Config,
                              fix: bool) -> Result<CheckReport>
    {
        let (sb, store, _) = Self::load(&device, config).await?;
        let cache_pages = config.cache_pages
            .unwrap_or(sb.cache.size as usize);
        let map = Map::open(sb.layout, device.clone(), store, cache_pages)
            .await?;
        let report = map.check(fix).await?;
        if fix && sb.dirty {
            device.sync_all().await?;
            SuperblockManager::new(device, sb).mark_clean().await?;
        }
        Ok(report)
    }

    /// Check the map, and optionally repair it.  Fails with
    /// `MapInconsistency` if repair was requested but couldn't finish.
    pub async fn check(&self, fix: bool) -> Result<CheckReport> {
        let _txn = self.shared.txn.write().await;
        self.shared.map.flush().await?;
        self.shared.map.check(fix).await
    }

    /// Unmap `nblocks` logical blocks beginning at `lba`
    pub async fn discard(&self, lba: LbaT, nblocks: LbaT) -> Result<()> {
        if !self.shared.sbm.get().discard {
            return Err(Error::Sys(Errno::EOPNOTSUPP));
        }
        self.validate_range(lba, nblocks)?;
        let _txn = self.shared.txn.read().await;
        self.shared.sbm.mark_dirty().await?;
        for l in lba..lba + nblocks {
            self.shared.map.remove(l).await?;
        }
        Ok(())
    }

    /// Size in bytes of the smallest shingled zone
    pub fn discard_granularity(&self) -> Option<u64> {
        self.shared.store.discard_granularity()
    }

    /// Format `device` and activate it
    pub async fn format(device: Arc<dyn ZonedDevice>, opts: &FormatOptions,
                        config: Config) -> Result<Self>
    {
        opts.validate()?;
        if let Some(old) = superblock::probe(&*device).await? {
            if !opts.force {
                warn!(uuid = %old.uuid, "device is already formatted");
                return Err(Error::Sys(Errno::EEXIST));
            }
            superblock::wipe(&*device).await?;
        }
        let store = Arc::new(ZoneStore::default());
        let refresher = Arc::new(ZoneRefresher::new(device.clone(),
            store.clone(), config.refresh_buffer));
        refresher.refresh_all().await?;
        let geom = geometry(&store.snapshot())?;
        let layout = Layout::compute(&geom, opts.zones_per_megazone,
                                     opts.over_provision)?;
        let data_start = layout.zone_start(layout.data_start_zone);
        for desc in store.snapshot() {
            if desc.start >= data_start &&
                desc.wp.is_some_and(|wp| wp > desc.start)
            {
                refresher.reset_zone(desc.start).await?;
            }
        }
        let cache_pages = config.cache_pages
            .unwrap_or(opts.cache.size as usize);
        let map = Map::format(layout, device.clone(), store.clone(),
                              cache_pages).await?;
        let sb = Superblock::new(layout, opts);
        superblock::write(&*device, &sb).await?;
        info!(uuid = %sb.uuid, megazones = layout.megazones,
              logical_blocks = layout.logical_blocks, "formatted");
        map.classify_zones();
        let sbm = SuperblockManager::new(device.clone(), sb);
        Ok(Self::start(device, store, refresher, map, sbm, config))
    }

    /// Collect garbage now, returning the number of zones reclaimed
    pub async fn gc_now(&self) -> Result<usize> {
        gc::collect(&self.shared).await
    }

    /// Kick the background collector if this megazone is getting full
    fn kick_gc(&self, mzg: &MegazoneGroup) {
        let tun = self.shared.sbm.get().gc;
        if tun.status == GcStatus::Off {
            return;
        }
        if Urgency::new(&tun, mzg.free_zones(), mzg.zones()) > Urgency::Idle {
            if let Some(cleaner) = self.cleaner.as_ref() {
                drop(cleaner.clean());
            }
        }
    }

    /// Read the superblock and the zone table, and make sure they agree
    async fn load(device: &Arc<dyn ZonedDevice>, config: &Config)
        -> Result<(Superblock, Arc<ZoneStore>, Arc<ZoneRefresher>)>
    {
        let sb = superblock::load(&**device, config.repair_superblock).await?;
        let store = Arc::new(ZoneStore::default());
        let refresher = Arc::new(ZoneRefresher::new(device.clone(),
            store.clone(), config.refresh_buffer));
        refresher.refresh_all().await?;
        let geom = geometry(&store.snapshot())?;
        let layout = Layout::compute(&geom, sb.layout.zones_per_megazone,
                                     sb.layout.over_provision)?;
        if layout != sb.layout {
            warn!(?layout, expected = ?sb.layout,
                  "device zones don't match the superblock");
            return Err(Error::Sys(Errno::EINVAL));
        }
        Ok((sb, store, refresher))
    }

    /// Exported capacity, in 4 KiB blocks
    pub fn logical_blocks(&self) -> LbaT {
        self.shared.map.layout().logical_blocks
    }

    /// Activate a previously formatted device.
    ///
    /// If the device wasn't cleanly deactivated, the map is checked and
    /// repaired first.  Activation fails if repair fails.
    pub async fn open(device: Arc<dyn ZonedDevice>, config: Config)
        -> Result<Self>
    {
        let (sb, store, refresher) = Self::load(&device, &config).await?;
        let cache_pages = config.cache_pages
            .unwrap_or(sb.cache.size as usize);
        let map = Map::open(sb.layout, device.clone(), store.clone(),
                            cache_pages).await?;
        let dirty = sb.dirty;
        if dirty || config.force_check {
            if dirty {
                warn!(uuid = %sb.uuid, "not cleanly deactivated; checking map");
            }
            let report = map.check(true).await?;
            if !report.is_clean() {
                info!(?report, "map repaired");
            }
        }
        map.classify_zones();
        let sbm = SuperblockManager::new(device.clone(), sb);
        let zdm = Self::start(device, store, refresher, map, sbm, config);
        if dirty {
            zdm.shared.sync().await?;
        }
        Ok(zdm)
    }

    /// Read whole blocks.  Blocks that were never written, or were discarded,
    /// read as zeros.
    pub async fn read_at(&self, buf: IoVecMut, lba: LbaT) -> Result<()> {
        if buf.len() % BYTES_PER_LBA != 0 {
            return Err(Error::Sys(Errno::EINVAL));
        }
        self.validate_range(lba, (buf.len() / BYTES_PER_LBA) as LbaT)?;
        let mut rest = buf;
        let mut lba = lba;
        while !rest.is_empty() {
            let block = rest.split_to(BYTES_PER_LBA);
            self.read_block(block, lba).await?;
            lba += 1;
        }
        Ok(())
    }

    async fn read_block(&self, mut buf: IoVecMut, lba: LbaT) -> Result<()> {
        let mut defers = 0;
        loop {
            let r = {
                let _txn = self.shared.txn.read().await;
                let Some(dev_lba) = self.shared.map.lookup(lba).await? else {
                    buf.fill(0);
                    return Ok(());
                };
                let sector = dev_lba * SECTORS_PER_LBA;
                match admit(&self.shared.store,
                            &IoRequest::read(sector, SECTORS_PER_LBA))
                {
                    Ok(Admission::NothingThere) => {
                        buf.fill(0);
                        return Ok(());
                    }
                    Ok(Admission::Admit) => {
                        return self.shared.device.read_at(buf, dev_lba).await;
                    }
                    Err(e) => Err((e, sector))
                }
            };
            match r {
                Err((Error::AdmissionDefer, sector))
                    if defers < self.config.defer_retries =>
                {
                    defers += 1;
                    let range = self.shared.store.lookup(sector)
                        .map(|d| d.range())
                        .unwrap_or(sector..sector + SECTORS_PER_LBA);
                    self.await_refresh(range).await;
                }
                Err((Error::AdmissionDefer, _)) => {
                    return Err(Error::Sys(Errno::EAGAIN));
                }
                Err((e, _)) => return Err(e),
                Ok(()) => return Ok(())
            }
        }
    }

    /// Deactivate: stop the background tasks and sync.
    pub async fn shutdown(mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(cleaner) = self.cleaner.take() {
            cleaner.shutdown().await;
        }
        self.shared.sync().await?;
        info!(uuid = %self.shared.sbm.get().uuid, "deactivated");
        Ok(())
    }

    fn start(device: Arc<dyn ZonedDevice>, store: Arc<ZoneStore>,
             refresher: Arc<ZoneRefresher>, map: Map, sbm: SuperblockManager,
             config: Config) -> Self
    {
        let handle = Handle::current();
        let shared = Arc::new(Shared {
            device,
            store,
            refresher,
            map,
            sbm,
            txn: futures_locks::RwLock::new(()),
            gc_lock: tokio::sync::Mutex::new(()),
            handle: handle.clone(),
        });
        let cleaner = Cleaner::new(&handle, shared.clone());
        let mut tasks = Vec::new();
        if let Some(ms) = config.sync_interval_ms {
            let weak = Arc::downgrade(&shared);
            let dirty_ticks = Arc::new(AtomicU32::new(0));
            tasks.push(schedule_periodic(&handle, Duration::from_millis(ms),
                move || {
                    let weak = weak.clone();
                    let dirty_ticks = dirty_ticks.clone();
                    async move {
                        if let Some(shared) = weak.upgrade() {
                            Self::periodic_sync(&shared, &dirty_ticks).await;
                        }
                    }
                }
            ));
        }
        if let Some(ms) = config.revalidate_interval_ms {
            let weak = Arc::downgrade(&shared);
            tasks.push(schedule_periodic(&handle, Duration::from_millis(ms),
                move || {
                    let weak = weak.clone();
                    async move {
                        let Some(shared) = weak.upgrade() else { return };
                        // Exclude writers, whose admitted but incomplete
                        // writes the device wouldn't report yet
                        let _txn = shared.txn.write().await;
                        if let Err(e) = shared.refresher.refresh_all().await {
                            warn!(error = ?e, "zone revalidation failed");
                        }
                    }
                }
            ));
        }
        Zdm { shared, config, cleaner: Some(cleaner), tasks }
    }

    /// Age out idle cache pages, and sync once the superblock has been dirty
    /// for long enough.
    async fn periodic_sync(shared: &Shared, dirty_ticks: &AtomicU32) {
        let tun = shared.sbm.get().cache;
        let evicted = shared.map.evict_aged(tun.ageout());
        if evicted > 0 {
            debug!(evicted, "aged out map pages");
        }
        if !shared.sbm.is_dirty() {
            dirty_ticks.store(0, Ordering::Relaxed);
            return;
        }
        if dirty_ticks.fetch_add(1, Ordering::Relaxed) + 1 < tun.journal_age {
            return;
        }
        dirty_ticks.store(0, Ordering::Relaxed);
        if let Err(e) = shared.sync().await {
            warn!(error = ?e, "periodic sync failed");
        }
    }

    /// A copy of the active superblock
    pub fn superblock(&self) -> Superblock {
        self.shared.sbm.get()
    }

    /// Make every completed write durable and mark the device clean
    pub async fn sync(&self) -> Result<()> {
        self.shared.sync().await
    }

    async fn try_write_block(&self, mzg: &MegazoneGroup, loff: u32,
                             data: IoVec) -> Result<()>
    {
        let shared = &self.shared;
        let _txn = shared.txn.read().await;
        shared.sbm.mark_dirty().await?;
        let _io = mzg.io_lock().lock().await;
        let dev_lba = mzg.allocate(false)?;
        let sector = dev_lba * SECTORS_PER_LBA;
        admit(&shared.store, &IoRequest::write(sector, SECTORS_PER_LBA))?;
        if let Err(e) = shared.device.write_at(data, dev_lba).await {
            shared.write_failed(dev_lba);
            return Err(e);
        }
        let (_, pba) = shared.map.layout().lba_to_pba(dev_lba)
            .ok_or(Error::Sys(Errno::EINVAL))?;
        mzg.insert(loff, pba).await?;
        Ok(())
    }

    fn validate_range(&self, lba: LbaT, nblocks: LbaT) -> Result<()> {
        match lba.checked_add(nblocks) {
            Some(end) if end <= self.logical_blocks() => Ok(()),
            _ => Err(Error::Sys(Errno::EINVAL))
        }
    }

    /// Write whole blocks
    pub async fn write_at(&self, buf: IoVec, lba: LbaT) -> Result<()> {
        if buf.len() % BYTES_PER_LBA != 0 {
            return Err(Error::Sys(Errno::EINVAL));
        }
        self.validate_range(lba, (buf.len() / BYTES_PER_LBA) as LbaT)?;
        let mut rest = buf;
        let mut lba = lba;
        while !rest.is_empty() {
            let block = rest.split_to(BYTES_PER_LBA);
            self.write_block(block, lba).await?;
            lba += 1;
        }
        Ok(())
    }

    async fn write_block(&self, data: IoVec, lba: LbaT) -> Result<()> {
        let (mzg, loff) = self.shared.map.locate(lba)?;
        let mut defers = 0;
        let mut collected = false;
        loop {
            match self.try_write_block(mzg, loff, data.clone()).await {
                Err(Error::AdmissionDefer)
                    if defers < self.config.defer_retries =>
                {
                    defers += 1;
                    let (start, _) = mzg.zone_limits(0);
                    let (_, end) = mzg.zone_limits(mzg.zones() - 1);
                    self.await_refresh(start..end).await;
                }
                Err(Error::AdmissionDefer) => {
                    return Err(Error::Sys(Errno::EAGAIN));
                }
                Err(Error::Sys(Errno::ENOSPC)) if !collected => {
                    debug!(mz = mzg.mz(), "out of free zones; collecting");
                    collected = true;
                    gc::collect(&self.shared).await?;
                }
                Err(e) => return Err(e),
                Ok(()) => {
                    self.kick_gc(mzg);
                    return Ok(());
                }
            }
        }
    }

    pub fn zone_store(&self) -> &Arc<ZoneStore> {
        &self.shared.store
    }
}

impl Drop for Zdm {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// LCOV_EXCL_STOP
