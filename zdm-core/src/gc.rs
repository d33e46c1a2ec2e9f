// vim: tw=80
//! Garbage collection
//!
//! Reclaims zones by relocating their live blocks into an open zone, then
//! resetting them.  Each reclaim is a [`GcCycle`], a state machine that does a
//! bounded amount of work per step so it can be abandoned between steps.

use std::sync::Arc;

use divbuf::DivBufShared;
use futures::{
    StreamExt,
    channel::{mpsc, oneshot},
};
use itertools::Itertools;
use nix::errno::Errno;
use tokio::{
    runtime::Handle,
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    admission::{IoRequest, admit},
    config::{GcStatus, GcTunables},
    map::{MegazoneGroup, ZoneUsage},
    types::*,
    util::*,
    zdm::Shared,
};

/// How badly a megazone needs free zones
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Urgency {
    Idle,
    Low,
    High,
    Critical,
}

impl Urgency {
    /// Classify a megazone with `free` free zones out of `zones`
    pub fn new(tun: &GcTunables, free: usize, zones: u32) -> Self {
        if tun.status == GcStatus::Force || free <= usize::from(tun.wm_crit) {
            return Urgency::Critical;
        }
        let pct = free * 100 / zones.max(1) as usize;
        if pct < usize::from(tun.wm_high) {
            Urgency::High
        } else if pct < usize::from(tun.wm_low) {
            Urgency::Low
        } else {
            Urgency::Idle
        }
    }

    /// Highest occupancy a zone may have and still be collected
    pub fn threshold(self, tun: &GcTunables) -> u16 {
        match self {
            Urgency::Critical => tun.prio_def,
            Urgency::High => tun.prio_low,
            Urgency::Low => tun.prio_high,
            Urgency::Idle => tun.prio_crit,
        }
    }
}

/// Live blocks as a fraction of a zone, scaled to `0..=0xffff`
pub fn occupancy(live: u32, zone_blocks: u32) -> u32 {
    (u64::from(live) * 0xffff / u64::from(zone_blocks.max(1))) as u32
}

/// Pick the zone to reclaim: the one with the most stale blocks among those
/// no fuller than `limit`.  Ties go to the lowest zone.  A zone with nothing
/// stale gains nothing from collection.
pub fn select_victim(usage: &[ZoneUsage], zone_blocks: u32, limit: u16)
    -> Option<u32>
{
    usage.iter()
        .filter(|u| !u.open && !u.free && u.stale > 0)
        .filter(|u| occupancy(u.live(), zone_blocks) <= u32::from(limit))
        .max_by(|a, b| a.stale.cmp(&b.stale).then(b.idx.cmp(&a.idx)))
        .map(|u| u.idx)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GcState {
    /// Choose a victim zone
    New,
    /// List the victim's live blocks
    Prepare,
    /// Read a batch of live blocks
    Read,
    /// Write the batch elsewhere and remap it
    Write,
    /// Persist the map
    Meta,
    /// Reset the victim and return it to the free set
    Complete,
    Done,
}

/// Summary of one finished cycle
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Reclaimed {
    pub mz: MzT,
    /// Index of the zone within its megazone
    pub zone: u32,
    /// Live blocks moved out of it
    pub relocated: usize,
}

struct Relocation {
    pba: u32,
    loff: u32,
    data: DivBufShared,
}

/// One zone reclaim
pub struct GcCycle {
    state: GcState,
    mzg: Option<Arc<MegazoneGroup>>,
    victim: u32,
    /// `(pba, loff)` of every block that was live at PREPARE
    live: Vec<(u32, u32)>,
    cursor: usize,
    batch: Vec<Relocation>,
    batch_size: usize,
    relocated: usize,
    /// Has COMPLETE already sent us back for stragglers?
    rechecked: bool,
}

impl GcCycle {
    async fn complete(&mut self, shared: &Shared) -> Result<GcState> {
        let mzg = self.megazone()?;
        let _txn = shared.txn.write().await;
        let remaining = mzg.live_blocks(self.victim).await?;
        if !remaining.is_empty() {
            if self.rechecked {
                warn!(mz = mzg.mz(), zone = self.victim,
                      n = remaining.len(), "zone still has live blocks");
                return Err(Error::MapInconsistency);
            }
            self.rechecked = true;
            self.live = remaining;
            self.cursor = 0;
            return Ok(GcState::Read);
        }
        let (start, _) = mzg.zone_limits(self.victim);
        shared.refresher.reset_zone(start).await?;
        mzg.release_zone(self.victim);
        info!(mz = mzg.mz(), zone = self.victim, relocated = self.relocated,
              "zone reclaimed");
        Ok(GcState::Done)
    }

    fn megazone(&self) -> Result<Arc<MegazoneGroup>> {
        self.mzg.clone().ok_or(Error::Sys(Errno::EINVAL))
    }

    /// A cycle that relocates at most `batch_size` blocks per READ
    pub fn new(batch_size: usize) -> Self {
        GcCycle {
            state: GcState::New,
            mzg: None,
            victim: 0,
            live: Vec::new(),
            cursor: 0,
            batch: Vec::new(),
            batch_size: batch_size.max(1),
            relocated: 0,
            rechecked: false,
        }
    }

    async fn prepare(&mut self) -> Result<GcState> {
        let mzg = self.megazone()?;
        self.live = mzg.live_blocks(self.victim).await?;
        self.cursor = 0;
        debug!(mz = mzg.mz(), zone = self.victim, live = self.live.len(),
               "relocating");
        if self.live.is_empty() {
            Ok(GcState::Meta)
        } else {
            Ok(GcState::Read)
        }
    }

    async fn read(&mut self, shared: &Shared) -> Result<GcState> {
        let mzg = self.megazone()?;
        let layout = shared.map.layout();
        let end = (self.cursor + self.batch_size).min(self.live.len());
        for &(pba, loff) in &self.live[self.cursor..end] {
            let data = DivBufShared::from(vec![0u8; BYTES_PER_LBA]);
            let dbm = data.try_mut().expect("fresh buffer");
            let lba = layout.pba_to_lba(mzg.mz(), pba);
            shared.device.read_at(dbm, lba).await?;
            self.batch.push(Relocation { pba, loff, data });
        }
        self.cursor = end;
        Ok(GcState::Write)
    }

    /// Run the cycle to completion.  Returns the reclaimed zone, if any zone
    /// was worth reclaiming.
    #[instrument(skip_all)]
    pub async fn run(mut self, shared: &Shared) -> Result<Option<Reclaimed>> {
        loop {
            match self.step(shared).await {
                Ok(GcState::Done) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(state = ?self.state, error = ?e,
                          "garbage collection cycle aborted");
                    return Err(e);
                }
            }
        }
        Ok(self.mzg.as_ref().map(|mzg| Reclaimed {
            mz: mzg.mz(),
            zone: self.victim,
            relocated: self.relocated,
        }))
    }

    fn select(&mut self, shared: &Shared) -> GcState {
        if shared.refresher.in_reset() {
            debug!("zone reset in progress; not collecting");
            return GcState::Done;
        }
        let tun = shared.sbm.get().gc;
        if tun.status == GcStatus::Off {
            return GcState::Done;
        }
        let bpz = shared.map.layout().blocks_per_zone() as u32;
        let order = shared.map.megazones()
            .iter()
            .sorted_by_key(|mzg| (mzg.free_zones(), mzg.mz()));
        for mzg in order {
            let urgency = Urgency::new(&tun, mzg.free_zones(), mzg.zones());
            let limit = urgency.threshold(&tun);
            if let Some(victim) = select_victim(&mzg.zone_usage(), bpz, limit)
            {
                debug!(mz = mzg.mz(), zone = victim, ?urgency,
                       "selected zone for collection");
                self.mzg = Some(mzg.clone());
                self.victim = victim;
                return GcState::Prepare;
            }
        }
        GcState::Done
    }

    pub fn state(&self) -> GcState {
        self.state
    }

    /// Advance by one state
    pub async fn step(&mut self, shared: &Shared) -> Result<GcState> {
        self.state = match self.state {
            GcState::New => self.select(shared),
            GcState::Prepare => self.prepare().await?,
            GcState::Read => self.read(shared).await?,
            GcState::Write => self.write(shared).await?,
            GcState::Meta => {
                shared.sync().await?;
                GcState::Complete
            }
            GcState::Complete => self.complete(shared).await?,
            GcState::Done => GcState::Done,
        };
        Ok(self.state)
    }

    async fn write(&mut self, shared: &Shared) -> Result<GcState> {
        let mzg = self.megazone()?;
        let layout = shared.map.layout();
        let _txn = shared.txn.read().await;
        shared.sbm.mark_dirty().await?;
        for r in self.batch.drain(..) {
            let _io = mzg.io_lock().lock().await;
            // The block may have been overwritten or discarded since PREPARE,
            // or relocated by an earlier, aborted cycle.
            if mzg.lookup(r.loff).await? != Some(r.pba) {
                debug!(loff = r.loff, pba = r.pba, "block no longer live");
                continue;
            }
            let dev_lba = mzg.allocate(true)?;
            let sector = dev_lba * SECTORS_PER_LBA;
            admit(&shared.store, &IoRequest::write(sector, SECTORS_PER_LBA))?;
            let data = r.data.try_const().expect("no writers");
            if let Err(e) = shared.device.write_at(data, dev_lba).await {
                shared.write_failed(dev_lba);
                return Err(e);
            }
            let (_, pba) = layout.lba_to_pba(dev_lba)
                .ok_or(Error::Sys(Errno::EINVAL))?;
            mzg.insert(r.loff, pba).await?;
            self.relocated += 1;
        }
        if self.cursor < self.live.len() {
            Ok(GcState::Read)
        } else {
            Ok(GcState::Meta)
        }
    }
}

/// Run cycles until nothing is worth reclaiming.  Returns the number of zones
/// reclaimed.
pub async fn collect(shared: &Shared) -> Result<usize> {
    let _guard = shared.gc_lock.lock().await;
    let batch = shared.sbm.get().cache.read_ahead as usize;
    let limit = shared.map.megazones()
        .iter()
        .map(|mzg| mzg.zones() as usize)
        .sum::<usize>();
    let mut reclaimed = 0;
    while reclaimed < limit {
        match GcCycle::new(batch).run(shared).await? {
            Some(_) => reclaimed += 1,
            None => break
        }
    }
    Ok(reclaimed)
}

/// Background garbage collector
pub struct Cleaner {
    jh: JoinHandle<()>,
    tx: Option<mpsc::Sender<oneshot::Sender<()>>>
}

impl Cleaner {
    /// Request a collection pass.  Does not wait for it.
    ///
    /// The returned `Receiver` fires when the pass is done.  It is canceled
    /// if the request was dropped, either because a pass is already queued or
    /// because a zone reset was in progress.
    pub fn clean(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Some(sender) = self.tx.as_ref() {
            if let Err(e) = sender.clone().try_send(tx) {
                if !e.is_full() {
                    warn!("garbage collector is not running");
                }
            }
        }
        rx
    }

    pub fn new(handle: &Handle, shared: Arc<Shared>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let jh = Cleaner::run(handle, shared, rx);
        Cleaner { jh, tx: Some(tx) }
    }

    fn run(handle: &Handle, shared: Arc<Shared>,
           mut rx: mpsc::Receiver<oneshot::Sender<()>>) -> JoinHandle<()>
    {
        handle.spawn(async move {
            while let Some(tx) = rx.next().await {
                if shared.refresher.in_reset() {
                    debug!("dropping collection request during zone reset");
                    continue;
                }
                match collect(&shared).await {
                    Ok(n) if n > 0 => debug!(zones = n, "collection pass done"),
                    Ok(_) => (),
                    Err(e) => warn!(error = ?e, "collection pass failed")
                }
                // The requester may not care
                let _ = tx.send(());
            }
        })
    }

    /// Stop the background task, after it finishes any pass in progress
    pub async fn shutdown(mut self) {
        drop(self.tx.take());
        if let Err(e) = self.jh.await {
            warn!(error = ?e, "garbage collector task failed");
        }
    }
}

// LCOV_EXCL_STOP
