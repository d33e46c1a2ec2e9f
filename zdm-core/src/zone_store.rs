// vim: tw=80
//! In-memory index of a device's zones
//!
//! Each descriptor lives in its own slot, behind its own lock.  Slots are never
//! freed while the store lives, so a caller that looked up a slot can keep
//! mutating it while the structural lock is held by somebody else.

use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{Arc, Mutex, RwLock},
};
use tracing::debug;

use crate::{
    types::*,
    util::*,
    zone::*,
};

type Slot = Arc<Mutex<ZoneDescriptor>>;

#[derive(Debug, Default)]
struct Index {
    /// Maps each zone's start sector to its slot
    by_start: BTreeMap<SectorT, usize>,
    slots: Vec<Slot>,
}

impl Index {
    /// Find the slot of the zone containing `sector`, if any
    fn find(&self, sector: SectorT) -> Option<Slot> {
        self.by_start.range(..=sector)
            .next_back()
            .map(|(_, &i)| self.slots[i].clone())
    }

    /// All slots whose zones begin in the half-open sector range, in order.
    /// The zone containing `range.start` is included even if it begins
    /// earlier.
    fn slots_in(&self, range: Range<SectorT>) -> Vec<Slot> {
        let first = self.by_start.range(..=range.start)
            .next_back()
            .map(|(&s, _)| s)
            .unwrap_or(range.start);
        self.by_start.range(first..range.end)
            .map(|(_, &i)| self.slots[i].clone())
            .collect()
    }
}

/// Result of [`ZoneStore::mark_busy`]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BusyMark {
    /// Zones examined, including conventional ones
    pub visited: usize,
    /// Shingled zones that this call marked busy
    pub marked: usize,
    /// Shingled zones that were busy already
    pub already_busy: usize,
}

/// The Zone Descriptor Store.  Zones are ordered by start sector.
#[derive(Debug, Default)]
pub struct ZoneStore {
    index: RwLock<Index>,
}

impl ZoneStore {
    /// The smallest non-conventional zone's size, in bytes.  This is the
    /// unit in which discards can actually reclaim space.
    pub fn discard_granularity(&self) -> Option<u64> {
        self.snapshot()
            .iter()
            .filter(|z| z.is_smr())
            .map(|z| z.len * BYTES_PER_SECTOR as u64)
            .min()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap().slots.len()
    }

    /// Return a copy of the zone containing `sector`.
    ///
    /// `None` means that the sector lies outside of every known zone.
    pub fn lookup(&self, sector: SectorT) -> Option<ZoneDescriptor> {
        self.with_zone(sector, |z| *z)
    }

    /// Fence up to `max_zones` zones, beginning with the one containing
    /// `range.start`, against admission.  Conventional zones are counted but
    /// not fenced.
    pub fn mark_busy(&self, range: Range<SectorT>, max_zones: usize)
        -> BusyMark
    {
        let slots = self.index.read().unwrap().slots_in(range);
        let mut bm = BusyMark::default();
        for slot in slots.into_iter().take(max_zones) {
            bm.visited += 1;
            let mut z = slot.lock().unwrap();
            if !z.is_smr() {
                continue;
            }
            if z.cond == ZoneCondition::Busy {
                bm.already_busy += 1;
            } else {
                z.cond = ZoneCondition::Busy;
                bm.marked += 1;
            }
        }
        debug!(?bm, "mark_busy");
        bm
    }

    /// Copies of every zone, ordered by start sector
    pub fn snapshot(&self) -> Vec<ZoneDescriptor> {
        let index = self.index.read().unwrap();
        index.by_start.values()
            .map(|&i| *index.slots[i].lock().unwrap())
            .collect()
    }

    /// Insert a new zone, or merge fresh state into an existing one.
    ///
    /// Returns the previous state, if the zone already existed.  A new zone
    /// may not overlap an existing one.
    pub fn upsert(&self, desc: ZoneDescriptor) -> Result<Option<ZoneDescriptor>>
    {
        {
            let index = self.index.read().unwrap();
            if let Some(&i) = index.by_start.get(&desc.start) {
                let slot = index.slots[i].clone();
                drop(index);
                let mut z = slot.lock().unwrap();
                let prev = *z;
                if prev.len != desc.len {
                    return Err(Error::Sys(nix::errno::Errno::EINVAL));
                }
                z.zone_type = desc.zone_type;
                z.cond = desc.cond;
                z.wp = desc.wp;
                return Ok(Some(prev));
            }
        }
        let mut index = self.index.write().unwrap();
        // Somebody may have inserted it while we were unlocked
        if index.by_start.contains_key(&desc.start) {
            drop(index);
            return self.upsert(desc);
        }
        if let Some(pred) = index.find(desc.start) {
            if pred.lock().unwrap().end() > desc.start {
                return Err(Error::Sys(nix::errno::Errno::EINVAL));
            }
        }
        if let Some((&succ, _)) = index.by_start.range(desc.start..).next() {
            if desc.end() > succ {
                return Err(Error::Sys(nix::errno::Errno::EINVAL));
            }
        }
        let i = index.slots.len();
        index.slots.push(Arc::new(Mutex::new(desc)));
        index.by_start.insert(desc.start, i);
        Ok(None)
    }

    /// Run `f` on the zone containing `sector`, under that zone's lock.
    pub fn with_zone<F, R>(&self, sector: SectorT, f: F) -> Option<R>
        where F: FnOnce(&mut ZoneDescriptor) -> R
    {
        let slot = self.index.read().unwrap().find(sector)?;
        let mut z = slot.lock().unwrap();
        if z.contains(sector) {
            Some(f(&mut z))
        } else {
            None
        }
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use nix::errno::Errno;
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use super::*;

const ZLEN: SectorT = 0x800;

/// One conventional zone followed by three sequential-required zones
#[fixture]
fn store() -> ZoneStore {
    let store = ZoneStore::default();
    store.upsert(ZoneDescriptor::empty(0, ZLEN, ZoneType::Conventional))
        .unwrap();
    for i in 1..4 {
        store.upsert(
            ZoneDescriptor::empty(i * ZLEN, ZLEN, ZoneType::SeqRequired)
        ).unwrap();
    }
    store
}

#[rstest]
fn lookup(store: ZoneStore) {
    assert_eq!(store.lookup(0).unwrap().zone_type, ZoneType::Conventional);
    assert_eq!(store.lookup(ZLEN - 1).unwrap().start, 0);
    assert_eq!(store.lookup(ZLEN).unwrap().start, ZLEN);
    assert_eq!(store.lookup(3 * ZLEN + 5).unwrap().start, 3 * ZLEN);
    assert!(store.lookup(4 * ZLEN).is_none());
}

#[test]
fn lookup_gap() {
    let store = ZoneStore::default();
    store.upsert(ZoneDescriptor::empty(ZLEN, ZLEN, ZoneType::SeqRequired))
        .unwrap();
    assert!(store.lookup(0).is_none());
}

#[rstest]
fn upsert_merges(store: ZoneStore) {
    let mut fresh = store.lookup(ZLEN).unwrap();
    fresh.wp = Some(ZLEN + 8);
    fresh.cond = ZoneCondition::Closed;
    let prev = store.upsert(fresh).unwrap().unwrap();
    assert_eq!(prev.wp, Some(ZLEN));
    assert_eq!(store.lookup(ZLEN).unwrap(), fresh);
    assert_eq!(store.len(), 4);
}

#[rstest]
fn upsert_overlap(store: ZoneStore) {
    let d = ZoneDescriptor::empty(4 * ZLEN - 8, ZLEN, ZoneType::SeqRequired);
    assert_eq!(store.upsert(d), Err(Error::Sys(Errno::EINVAL)));
    let store2 = ZoneStore::default();
    store2.upsert(ZoneDescriptor::empty(ZLEN, ZLEN, ZoneType::SeqRequired))
        .unwrap();
    let d = ZoneDescriptor::empty(8, ZLEN, ZoneType::SeqRequired);
    assert_eq!(store2.upsert(d), Err(Error::Sys(Errno::EINVAL)));
}

#[rstest]
fn upsert_changed_len(store: ZoneStore) {
    let d = ZoneDescriptor::empty(ZLEN, ZLEN / 2, ZoneType::SeqRequired);
    assert_eq!(store.upsert(d), Err(Error::Sys(Errno::EINVAL)));
}

#[rstest]
fn mark_busy(store: ZoneStore) {
    let bm = store.mark_busy(0..4 * ZLEN, 3);
    assert_eq!(bm, BusyMark{visited: 3, marked: 2, already_busy: 0});
    assert_eq!(store.lookup(ZLEN).unwrap().cond, ZoneCondition::Busy);
    assert_eq!(store.lookup(3 * ZLEN).unwrap().cond, ZoneCondition::Empty);
    assert_eq!(store.lookup(0).unwrap().cond, ZoneCondition::NoWp);

    let bm = store.mark_busy(ZLEN..4 * ZLEN, 8);
    assert_eq!(bm, BusyMark{visited: 3, marked: 1, already_busy: 2});
}

#[rstest]
fn mark_busy_mid_zone(store: ZoneStore) {
    let bm = store.mark_busy(ZLEN + 5..ZLEN + 6, 8);
    assert_eq!(bm.marked, 1);
    assert_eq!(store.lookup(ZLEN).unwrap().cond, ZoneCondition::Busy);
}

#[rstest]
fn discard_granularity(store: ZoneStore) {
    assert_eq!(store.discard_granularity(), Some(ZLEN * 512));
    assert_eq!(ZoneStore::default().discard_granularity(), None);
}

#[rstest]
fn snapshot_is_ordered(store: ZoneStore) {
    let starts = store.snapshot().iter().map(|z| z.start).collect::<Vec<_>>();
    assert_eq!(starts, vec![0, ZLEN, 2 * ZLEN, 3 * ZLEN]);
}
}
// LCOV_EXCL_STOP
