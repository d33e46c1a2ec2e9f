// vim: tw=80
//! The Logical-to-Physical Map
//!
//! Each megazone has its own forward table (logical offset to physical
//! block), reverse table (physical block to logical offset), and CRC table
//! guarding both.  Megazones are independent, so they can be flushed and
//! checked independently.

use std::{
    sync::Arc,
    time::Duration,
};

use futures::future;
use nix::errno::Errno;
use tracing::info;

use crate::{
    device::ZonedDevice,
    layout::Layout,
    types::*,
    zone_store::ZoneStore,
};

mod cache;
mod check;
mod entry;
mod megazone;
mod page;

pub use self::check::CheckReport;
pub use self::entry::{MapEntry, Resolved};
pub use self::megazone::{GC_RESERVE, MegazoneGroup, ZoneUsage};

/// Fewest pages any megazone's cache may hold
pub const MIN_CACHE_PAGES: usize = 8;

pub struct Map {
    layout: Layout,
    mzs: Vec<Arc<MegazoneGroup>>,
}

impl Map {
    fn cache_share(layout: &Layout, cache_pages: usize) -> usize {
        (cache_pages / layout.megazones.max(1) as usize).max(MIN_CACHE_PAGES)
    }

    /// Check every megazone, and optionally repair them.
    pub async fn check(&self, fix: bool) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        for mzg in self.mzs.iter() {
            report += mzg.check(fix).await?;
        }
        info!(?report, fix, "map check");
        Ok(report)
    }

    /// Assign every data zone to its megazone's free set or open zone, based
    /// on the zone store's write pointers.
    pub fn classify_zones(&self) {
        for mzg in self.mzs.iter() {
            mzg.classify_zones();
        }
    }

    /// An empty map, not yet written to disk.
    ///
    /// `cache_pages` is the page cache budget, shared among megazones.
    pub fn create(layout: Layout, device: Arc<dyn ZonedDevice>,
                  store: Arc<ZoneStore>, cache_pages: usize) -> Self
    {
        let share = Self::cache_share(&layout, cache_pages);
        let mzs = (0..layout.megazones)
            .map(|mz| Arc::new(MegazoneGroup::create(mz, layout,
                device.clone(), store.clone(), share)))
            .collect();
        Map { layout, mzs }
    }

    pub fn evict_aged(&self, ageout: Duration) -> usize {
        self.mzs.iter().map(|mzg| mzg.evict_aged(ageout)).sum()
    }

    /// Write every dirty page and key in every megazone.
    pub async fn flush(&self) -> Result<()> {
        future::try_join_all(self.mzs.iter().map(|mzg| mzg.flush())).await?;
        Ok(())
    }

    /// Create a new map and write its empty keys to disk
    pub async fn format(layout: Layout, device: Arc<dyn ZonedDevice>,
                        store: Arc<ZoneStore>, cache_pages: usize)
        -> Result<Self>
    {
        let map = Self::create(layout, device, store, cache_pages);
        map.flush().await?;
        Ok(map)
    }

    /// Free zones across all megazones
    pub fn free_zones(&self) -> usize {
        self.mzs.iter().map(|mzg| mzg.free_zones()).sum()
    }

    /// Map a logical block to its megazone
    pub fn locate(&self, lba: LbaT) -> Result<(&Arc<MegazoneGroup>, u32)> {
        let (mz, loff) = self.layout.lba_to_mz(lba)
            .ok_or(Error::Sys(Errno::EINVAL))?;
        Ok((&self.mzs[mz as usize], loff))
    }

    /// Map a device block to its megazone
    fn locate_physical(&self, dev_lba: LbaT)
        -> Result<(&Arc<MegazoneGroup>, u32)>
    {
        let (mz, pba) = self.layout.lba_to_pba(dev_lba)
            .ok_or(Error::Sys(Errno::EINVAL))?;
        Ok((&self.mzs[mz as usize], pba))
    }

    /// Map logical block `lba` to device block `dev_lba`, returning the device
    /// block it used to occupy.  Both must lie in the same megazone.
    pub async fn insert(&self, lba: LbaT, dev_lba: LbaT)
        -> Result<Option<LbaT>>
    {
        let (mzg, loff) = self.locate(lba)?;
        let (pmzg, pba) = self.locate_physical(dev_lba)?;
        if mzg.mz() != pmzg.mz() {
            return Err(Error::Sys(Errno::EINVAL));
        }
        let _guard = mzg.io_lock().lock().await;
        let old = mzg.insert(loff, pba).await?;
        Ok(old.map(|p| self.layout.pba_to_lba(mzg.mz(), p)))
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Where does a logical block live on the device, if anywhere?
    pub async fn lookup(&self, lba: LbaT) -> Result<Option<LbaT>> {
        let (mzg, loff) = self.locate(lba)?;
        let pba = mzg.lookup(loff).await?;
        Ok(pba.map(|p| self.layout.pba_to_lba(mzg.mz(), p)))
    }

    pub fn megazones(&self) -> &[Arc<MegazoneGroup>] {
        &self.mzs[..]
    }

    /// Load an existing map's keys.  Pages are loaded on demand.
    pub async fn open(layout: Layout, device: Arc<dyn ZonedDevice>,
                      store: Arc<ZoneStore>, cache_pages: usize)
        -> Result<Self>
    {
        let share = Self::cache_share(&layout, cache_pages);
        let futs = (0..layout.megazones).map(|mz| {
            MegazoneGroup::open(mz, layout, device.clone(), store.clone(),
                                share)
        });
        let mzs = future::try_join_all(futs).await?
            .into_iter()
            .map(Arc::new)
            .collect();
        Ok(Map { layout, mzs })
    }

    /// Unmap a logical block, returning the device block it used to occupy.
    pub async fn remove(&self, lba: LbaT) -> Result<Option<LbaT>> {
        let (mzg, loff) = self.locate(lba)?;
        let _guard = mzg.io_lock().lock().await;
        let old = mzg.remove(loff).await?;
        Ok(old.map(|p| self.layout.pba_to_lba(mzg.mz(), p)))
    }

    /// Which logical block occupies a device block, if any?
    pub async fn reverse(&self, dev_lba: LbaT) -> Result<Option<LbaT>> {
        let (mzg, pba) = self.locate_physical(dev_lba)?;
        let loff = mzg.reverse(pba).await?;
        Ok(loff.map(|l| self.layout.mz_to_lba(mzg.mz(), l)))
    }
}

// LCOV_EXCL_STOP
