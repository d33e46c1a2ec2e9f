// vim: tw=80
//! Write pointer admission control
//!
//! Decides, from in-memory state only, whether an I/O may be issued to the
//! device.  Never blocks on device I/O.

use tracing::{debug, warn};

use crate::{
    types::*,
    zone::*,
    zone_store::ZoneStore,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// An I/O request, in 512-byte sectors
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IoRequest {
    pub sector: SectorT,
    pub len: SectorT,
    pub dir: Direction,
}

impl IoRequest {
    pub fn read(sector: SectorT, len: SectorT) -> Self {
        IoRequest { sector, len, dir: Direction::Read }
    }

    pub fn write(sector: SectorT, len: SectorT) -> Self {
        IoRequest { sector, len, dir: Direction::Write }
    }
}

/// Successful outcomes of admission
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    /// Issue the I/O to the device
    Admit,
    /// A read beyond the write pointer.  Complete it with zeros instead of
    /// issuing it.
    NothingThere,
}

fn decide(z: &mut ZoneDescriptor, req: &IoRequest) -> Result<Admission> {
    match z.cond {
        ZoneCondition::Busy | ZoneCondition::Unknown => {
            return Err(Error::AdmissionDefer);
        }
        // Let the device fail it
        ZoneCondition::Offline => return Ok(Admission::Admit),
        _ => ()
    }
    match (req.dir, z.zone_type) {
        (Direction::Write, ZoneType::SeqPreferred) => {
            if let Some(wp) = z.wp.as_mut() {
                *wp = (*wp + req.len).min(z.start + z.len);
            }
            Ok(Admission::Admit)
        }
        (Direction::Write, ZoneType::SeqRequired) => {
            if z.cond == ZoneCondition::ReadOnly {
                return Ok(Admission::Admit);
            }
            let wp = z.wp.unwrap_or(z.start);
            if z.is_full() {
                warn!(sector = req.sector, zone = z.start,
                      "Write to a full zone");
                return Err(Error::AdmissionReject);
            }
            if req.sector != wp {
                warn!(sector = req.sector, wp, "Misaligned write");
                return Err(Error::AdmissionReject);
            }
            if req.sector + req.len > z.end() {
                warn!(sector = req.sector, len = req.len, end = z.end(),
                      "Write crosses the end of its zone");
                return Err(Error::AdmissionReject);
            }
            let wp = wp + req.len;
            z.wp = Some(wp);
            z.cond = if wp == z.end() {
                ZoneCondition::Full
            } else {
                ZoneCondition::ImplicitOpen
            };
            Ok(Admission::Admit)
        }
        (Direction::Read, ZoneType::SeqRequired) => {
            match z.wp {
                Some(wp) if wp <= req.sector => Ok(Admission::NothingThere),
                _ => Ok(Admission::Admit)
            }
        }
        _ => Ok(Admission::Admit)
    }
}

/// Decide whether `req` may be issued, advancing the write pointer if so.
///
/// The decision and the write pointer update are atomic with respect to other
/// admissions to the same zone.
pub fn admit(store: &ZoneStore, req: &IoRequest) -> Result<Admission> {
    let r = store.with_zone(req.sector, |z| decide(z, req))
        .unwrap_or(Ok(Admission::Admit));
    if r == Err(Error::AdmissionDefer) {
        debug!(sector = req.sector, "admission deferred");
    }
    r
}

// LCOV_EXCL_STOP
