// vim: tw=80
//! Background Zone Refresh
//!
//! Zone state is re-queried from the device in bounded chunks.  Each chunk
//! decodes one report, merges it into the zone store, and advances a cursor.
//! Whenever a chain of chunks ends, for whatever reason, waiters are released
//! so they can retry their deferred I/O.

use std::{
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::{
    runtime::Handle,
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, instrument, warn};

use crate::{
    device::{ReportingOption, ResetTarget, ZonedDevice},
    report::{self, Same},
    types::*,
    zone::ZoneDescriptor,
    zone_store::ZoneStore,
};

/// Default size of the report buffer
pub const DEFAULT_BUFFER_LEN: usize = 512 * 1024;

/// Smallest report buffer worth trying
pub const MIN_BUFFER_LEN: usize = 512;

/// Allocate a zeroed buffer, halving the request on failure.
///
/// `try_alloc` returns `None` when an allocation of the given size fails.
/// Returns [`Error::AllocationError`] once the size would drop below
/// [`MIN_BUFFER_LEN`].
pub fn alloc_with<F>(mut len: usize, mut try_alloc: F) -> Result<Vec<u8>>
    where F: FnMut(usize) -> Option<Vec<u8>>
{
    while len >= MIN_BUFFER_LEN {
        if let Some(buf) = try_alloc(len) {
            return Ok(buf);
        }
        warn!(len, "Report buffer allocation failed; halving");
        len /= 2;
    }
    Err(Error::AllocationError)
}

fn try_alloc(len: usize) -> Option<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).ok()?;
    v.resize(len, 0);
    Some(v)
}

/// What happened during one chunk of a refresh chain
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    /// More zones remain
    Continue,
    /// The chain reached its end
    Done,
    /// Zones are being reset.  The chain should stop without error.
    Abandoned,
}

/// One refresh chain, with its continuation cursor
#[derive(Clone, Debug)]
pub struct RefreshTask {
    /// Next sector to report from
    pub cursor: SectorT,
    /// Stop once the cursor reaches this sector
    pub end: SectorT,
    /// Uniform zone length, once learned from a device whose report doesn't
    /// assert equal lengths
    expected_len: Option<SectorT>,
    buffer_len: usize,
}

impl RefreshTask {
    pub fn new(range: Range<SectorT>, buffer_len: usize) -> Self {
        RefreshTask {
            cursor: range.start,
            end: range.end,
            expected_len: None,
            buffer_len,
        }
    }

    /// Refresh one chunk of zones
    pub async fn step(&mut self, r: &ZoneRefresher) -> Result<Step> {
        if r.in_reset() {
            debug!(cursor = self.cursor, "refresh abandoned: zones in reset");
            return Ok(Step::Abandoned);
        }
        if self.cursor >= self.end {
            return Ok(Step::Done);
        }
        let buf = alloc_with(self.buffer_len, r.alloc)?;
        // Keep whatever size succeeded for the rest of the chain
        self.buffer_len = buf.len();
        let scale = r.device.logical_sector_scale();
        let buf = r.device
            .report_zones(self.cursor, buf, ReportingOption::All, true)
            .await?;
        let header = report::decode_header(&buf)?;
        if header.same == Same::Different && self.expected_len.is_none() {
            // The first zone on the device sets the standard, wherever this
            // chain started.
            let small = alloc_with(MIN_BUFFER_LEN, r.alloc)?;
            let small = r.device
                .report_zones(0, small, ReportingOption::All, true)
                .await?;
            let zlen = report::first_zone_len(&small, scale)?;
            debug!(zlen, "learned the uniform zone length");
            self.expected_len = Some(zlen);
            return Ok(Step::Continue);
        }
        let rpt = report::decode(&buf, scale, self.expected_len)?;
        for zone in rpt.zones.iter() {
            if zone.start >= self.end {
                break;
            }
            r.store.upsert(*zone)?;
        }
        match rpt.next {
            Some(next) if next > self.cursor => {
                self.cursor = next;
                if next >= self.end {
                    Ok(Step::Done)
                } else {
                    Ok(Step::Continue)
                }
            }
            _ => Ok(Step::Done)
        }
    }
}

/// Keeps the zone store in sync with the device
pub struct ZoneRefresher {
    device: Arc<dyn ZonedDevice>,
    store: Arc<ZoneStore>,
    buffer_len: usize,
    /// Number of zone resets in progress
    resets: AtomicUsize,
    /// Bumped every time a chain ends
    released: watch::Sender<u64>,
    alloc: fn(usize) -> Option<Vec<u8>>,
}

impl ZoneRefresher {
    /// Is any zone being reset?
    pub fn in_reset(&self) -> bool {
        self.resets.load(Ordering::Acquire) > 0
    }

    pub fn new(device: Arc<dyn ZonedDevice>, store: Arc<ZoneStore>,
               buffer_len: usize) -> Self
    {
        let (released, _) = watch::channel(0);
        ZoneRefresher {
            device,
            store,
            buffer_len,
            resets: AtomicUsize::new(0),
            released,
            alloc: try_alloc,
        }
    }

    /// Run a refresh chain over `range` to completion.
    ///
    /// Zones within the range stay busy if the chain fails.  Waiters are
    /// released regardless.
    #[instrument(skip(self))]
    pub async fn refresh(&self, range: Range<SectorT>) -> Result<()> {
        let mut task = RefreshTask::new(range, self.buffer_len);
        let r = loop {
            match task.step(self).await {
                Ok(Step::Continue) => continue,
                Ok(Step::Done) | Ok(Step::Abandoned) => break Ok(()),
                Err(e) => {
                    warn!(cursor = task.cursor, error = ?e,
                          "zone refresh failed");
                    break Err(e);
                }
            }
        };
        self.release();
        r
    }

    /// Refresh every zone on the device
    pub async fn refresh_all(&self) -> Result<()> {
        self.refresh(0..self.device.capacity()).await
    }

    fn release(&self) {
        self.released.send_modify(|epoch| *epoch += 1);
    }

    /// Rewind a zone's write pointer.
    ///
    /// The zone is fenced busy while the reset is in flight.  On success its
    /// descriptor becomes empty; on failure it stays busy until the next
    /// refresh.
    #[instrument(skip(self))]
    pub async fn reset_zone(&self, start: SectorT) -> Result<()> {
        let desc = self.store.lookup(start)
            .filter(|d| d.start == start)
            .ok_or(Error::Sys(nix::errno::Errno::EINVAL))?;
        self.resets.fetch_add(1, Ordering::AcqRel);
        self.store.mark_busy(desc.range(), 1);
        let r = self.device
            .reset_write_pointer(ResetTarget::Zone(start))
            .await;
        self.resets.fetch_sub(1, Ordering::AcqRel);
        let r = match r {
            Ok(()) => {
                let empty = ZoneDescriptor::empty(start, desc.len,
                                                  desc.zone_type);
                self.store.upsert(empty).map(drop)
            }
            Err(e) => {
                warn!(start, error = ?e, "zone reset failed; zone stays busy");
                Err(e)
            }
        };
        self.release();
        r
    }

    /// Spawn a refresh chain in the background
    pub fn spawn(self: &Arc<Self>, handle: &Handle, range: Range<SectorT>)
        -> JoinHandle<Result<()>>
    {
        let me = self.clone();
        handle.spawn(async move { me.refresh(range).await })
    }

    /// Receive a notification whenever a refresh chain ends
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.released.subscribe()
    }

    #[cfg(test)]
    fn with_alloc(mut self, alloc: fn(usize) -> Option<Vec<u8>>) -> Self {
        self.alloc = alloc;
        self
    }
}

// LCOV_EXCL_STOP
