// vim: tw=80
//! Consistency checking and repair of a megazone's map
//!
//! The forward table is authoritative.  The reverse table is rebuilt from it,
//! and only consulted to recover forward entries that were lost.

use std::{
    collections::BTreeSet,
    ops::AddAssign,
    sync::Arc,
};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{error, info, warn};

use crate::{
    layout::ENTRIES_PER_PAGE,
    types::*,
};
use super::{
    entry::{MapEntry, Resolved},
    megazone::MegazoneGroup,
    page::{MapPage, PageKey, Table},
};

const EPP: u32 = ENTRIES_PER_PAGE;

/// Marks a physical block that no logical block claims
const UNCLAIMED: u32 = u32::MAX;

/// Outcome of a map check
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CheckReport {
    /// Forward entries that were changed
    pub fwd_fixed: u64,
    /// Reverse entries that were changed
    pub rev_fixed: u64,
    /// Pages whose checksum didn't match
    pub corrupt_pages: u64,
    /// Forward entries that were lost, and couldn't be recovered from the
    /// reverse table
    pub unrecoverable: u64,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        *self == CheckReport::default()
    }
}

impl AddAssign for CheckReport {
    fn add_assign(&mut self, rhs: Self) {
        self.fwd_fixed += rhs.fwd_fixed;
        self.rev_fixed += rhs.rev_fixed;
        self.corrupt_pages += rhs.corrupt_pages;
        self.unrecoverable += rhs.unrecoverable;
    }
}

/// Result of reconciling the two tables in memory
#[derive(Debug, Default)]
struct Reconciled {
    report: CheckReport,
    /// Forward pages that were modified
    fwd_pages: BTreeSet<u32>,
    /// Reverse pages that were modified
    rev_pages: BTreeSet<u32>,
    /// Live blocks per zone
    live: Vec<u32>,
}

fn put(table: &mut [MapEntry], pages: &mut BTreeSet<u32>, i: usize,
       e: MapEntry)
{
    table[i] = e;
    pages.insert(i as u32 / EPP);
}

/// Make `fwd` and `rev` agree with each other.
///
/// * `nfwd`: number of logical blocks in the megazone
/// * `zone_written`: blocks below each zone's write pointer
fn reconcile(fwd: &mut [MapEntry], rev: &mut [MapEntry], nfwd: usize,
             zone_written: &[u32], bpz: u32) -> Reconciled
{
    let nrev = zone_written.len() * bpz as usize;
    let mut r = Reconciled {
        live: vec![0; zone_written.len()],
        ..Default::default()
    };
    // Is there data on the device at this physical block?
    let on_disk = |p: u32| {
        (p as usize) < nrev && p % bpz < zone_written[(p / bpz) as usize]
    };

    // Nothing may be mapped past the end of either address space
    for l in nfwd..fwd.len() {
        if fwd[l] != MapEntry::UNUSED {
            put(fwd, &mut r.fwd_pages, l, MapEntry::UNUSED);
            r.report.fwd_fixed += 1;
        }
    }
    for p in nrev..rev.len() {
        if rev[p] != MapEntry::UNUSED {
            put(rev, &mut r.rev_pages, p, MapEntry::UNUSED);
            r.report.rev_fixed += 1;
        }
    }

    // Claim physical blocks for each valid forward entry.  Invalid entries
    // become NOT_FOUND, pending recovery.
    let mut claimed = vec![UNCLAIMED; nrev];
    for l in 0..nfwd {
        match fwd[l].resolve() {
            Resolved::Unused | Resolved::NotFound => (),
            Resolved::Value(p) if on_disk(p) => {
                let other = claimed[p as usize];
                if other == UNCLAIMED {
                    claimed[p as usize] = l as u32;
                } else if rev[p as usize].resolve() ==
                    Resolved::Value(l as u32)
                {
                    warn!(pba = p, loff = l, other, "doubly mapped block");
                    put(fwd, &mut r.fwd_pages, other as usize,
                        MapEntry::NOT_FOUND);
                    claimed[p as usize] = l as u32;
                } else {
                    warn!(pba = p, loff = l, other, "doubly mapped block");
                    put(fwd, &mut r.fwd_pages, l, MapEntry::NOT_FOUND);
                }
            }
            Resolved::Value(_) | Resolved::Corrupt => {
                put(fwd, &mut r.fwd_pages, l, MapEntry::NOT_FOUND);
            }
        }
    }

    // Make the reverse table agree with every claim
    for (p, &l) in claimed.iter().enumerate() {
        if l != UNCLAIMED && rev[p].resolve() != Resolved::Value(l) {
            put(rev, &mut r.rev_pages, p, MapEntry::new(l));
            r.report.rev_fixed += 1;
        }
    }

    // Use the remaining reverse entries to recover lost forward entries, and
    // discard the rest.
    let mut rev_damaged = false;
    for p in 0..nrev {
        if claimed[p] != UNCLAIMED {
            continue;
        }
        match rev[p].resolve() {
            Resolved::Unused => (),
            Resolved::Value(l) if (l as usize) < nfwd &&
                on_disk(p as u32) &&
                fwd[l as usize] == MapEntry::NOT_FOUND =>
            {
                put(fwd, &mut r.fwd_pages, l as usize, MapEntry::new(p as u32));
                r.report.fwd_fixed += 1;
                claimed[p] = l;
            }
            Resolved::Value(_) => {
                put(rev, &mut r.rev_pages, p, MapEntry::UNUSED);
                r.report.rev_fixed += 1;
            }
            Resolved::Corrupt | Resolved::NotFound => {
                rev_damaged = true;
                put(rev, &mut r.rev_pages, p, MapEntry::UNUSED);
                r.report.rev_fixed += 1;
            }
        }
    }

    // Whatever is still lost was either never durably mapped, or is gone.
    // If the reverse table is intact, it's the former.
    for l in 0..nfwd {
        if fwd[l] == MapEntry::NOT_FOUND {
            if rev_damaged {
                r.report.unrecoverable += 1;
            } else {
                put(fwd, &mut r.fwd_pages, l, MapEntry::UNUSED);
                r.report.fwd_fixed += 1;
            }
        }
    }

    for (p, &l) in claimed.iter().enumerate() {
        if l != UNCLAIMED {
            r.live[p / bpz as usize] += 1;
        }
    }
    r
}

/// Fail unless a reconciliation that claims full recovery really left the
/// tables consistent.  Unrecoverable entries are the caller's to report.
fn confirm(report: &CheckReport, fwd: &[MapEntry], rev: &[MapEntry],
           nfwd: usize) -> Result<()>
{
    if report.unrecoverable == 0 && !verify(fwd, rev, nfwd) {
        error!(?report, "map tables still disagree after reconciliation");
        return Err(Error::MapInconsistency);
    }
    Ok(())
}

/// Are the two tables exact inverses of each other?
fn verify(fwd: &[MapEntry], rev: &[MapEntry], nfwd: usize) -> bool {
    let mut mapped = 0;
    for (l, e) in fwd.iter().enumerate().take(nfwd) {
        match e.resolve() {
            Resolved::Unused => (),
            Resolved::Value(p) => {
                if rev.get(p as usize).map(|e| e.resolve()) !=
                    Some(Resolved::Value(l as u32))
                {
                    return false;
                }
                mapped += 1;
            }
            _ => return false
        }
    }
    let rmapped = rev.iter()
        .filter(|e| matches!(e.resolve(), Resolved::Value(_)))
        .count();
    mapped == rmapped
}

fn words(buf: &[u8]) -> Vec<u32> {
    let mut words = vec![0u32; EPP as usize];
    LittleEndian::read_u32_into(buf, &mut words);
    words
}

impl MegazoneGroup {
    /// Check the on-disk map for consistency, and optionally repair it.
    ///
    /// Reads every table directly from disk, so any dirty pages should be
    /// flushed first.  With `fix`, the repaired pages are written back and
    /// the per-zone stale counts recomputed, unless some mappings were
    /// unrecoverable, in which case nothing is written and the result is
    /// [`Error::MapInconsistency`].
    pub async fn check(&self, fix: bool) -> Result<CheckReport> {
        let _io = self.io_lock().lock().await;
        let layout = self.layout;
        let (written, crc_sums) = {
            let st = self.state.lock().unwrap();
            (st.written.clone(), st.crc_sums.clone())
        };
        let mut report = CheckReport::default();

        let mut crc_ok = Vec::with_capacity(layout.crc_pages as usize);
        let mut crc_words = Vec::with_capacity(layout.crc_pages as usize);
        for i in 0..layout.crc_pages {
            let key = PageKey::new(Table::Crc, i);
            if !written.contains(self.flat(key) as usize) {
                crc_ok.push(true);
                crc_words.push(vec![0u32; EPP as usize]);
                continue;
            }
            let buf = self.read_block(self.page_lba(key)).await?;
            let ok = crc32fast::hash(&buf) == crc_sums[i as usize];
            if !ok {
                warn!(mz = self.mz, page = i, "corrupt CRC page");
                report.corrupt_pages += 1;
            }
            crc_ok.push(ok);
            crc_words.push(words(&buf));
        }

        // Pages that must be rewritten even if reconciliation doesn't
        // touch them, because their checksums are wrong.
        let mut rewrite = BTreeSet::new();
        let mut tables = Vec::with_capacity(2);
        for (table, pages) in [(Table::Fwd, layout.fwd_pages),
                               (Table::Rev, layout.rev_pages)]
        {
            let mut entries = Vec::with_capacity((pages * EPP) as usize);
            for i in 0..pages {
                let key = PageKey::new(table, i);
                if !written.contains(self.flat(key) as usize) {
                    entries.extend(std::iter::repeat(MapEntry::UNUSED)
                                   .take(EPP as usize));
                    continue;
                }
                let buf = self.read_block(self.page_lba(key)).await?;
                let (ci, slot) = self.crc_location(key);
                let ci = ci as usize;
                let sum = crc32fast::hash(&buf);
                if !crc_ok[ci] {
                    rewrite.insert(key);
                } else if crc_words[ci][slot as usize] != sum {
                    warn!(mz = self.mz, ?key, "corrupt map page");
                    report.corrupt_pages += 1;
                    rewrite.insert(key);
                }
                // Salvage whatever individual entries are intact
                entries.extend(words(&buf).into_iter().map(MapEntry::from_raw));
            }
            tables.push(entries);
        }
        let mut rev = tables.pop().unwrap_or_default();
        let mut fwd = tables.pop().unwrap_or_default();

        let bpz = layout.blocks_per_zone() as u32;
        let zone_written = self.zone_usage().iter()
            .map(|u| u.written)
            .collect::<Vec<_>>();
        let nfwd = layout.mz_logical_blocks(self.mz) as usize;
        let rec = reconcile(&mut fwd, &mut rev, nfwd, &zone_written, bpz);
        report += rec.report;
        confirm(&report, &fwd, &rev, nfwd)?;
        info!(mz = self.mz, ?report, "map check complete");

        if !fix {
            return Ok(report);
        }
        if report.unrecoverable > 0 {
            return Err(Error::MapInconsistency);
        }

        rewrite.extend(rec.fwd_pages.iter().map(|&i| PageKey::new(Table::Fwd, i)));
        rewrite.extend(rec.rev_pages.iter().map(|&i| PageKey::new(Table::Rev, i)));
        {
            let mut cache = self.cache.lock().unwrap();
            for key in rewrite.iter() {
                let table = if key.table == Table::Fwd { &fwd } else { &rev };
                let start = (key.index * EPP) as usize;
                let page = MapPage::new(*key);
                for (i, e) in table[start..start + EPP as usize].iter()
                    .enumerate()
                {
                    page.set(i as u32, *e);
                }
                cache.remove(key);
                cache.insert(Arc::new(page));
            }
            // Damaged CRC pages get rebuilt from scratch.  Every page they
            // cover is being rewritten.
            for (i, ok) in crc_ok.iter().enumerate() {
                if !ok {
                    let page = MapPage::new(PageKey::new(Table::Crc, i as u32));
                    page.mark_dirty();
                    cache.remove(&page.key());
                    cache.insert(Arc::new(page));
                }
            }
        }
        {
            let mut st = self.state.lock().unwrap();
            for (idx, stale) in st.stale.iter_mut().enumerate() {
                *stale = zone_written[idx].saturating_sub(rec.live[idx]);
            }
        }
        self.mark_key_dirty();
        self.flush().await?;
        Ok(report)
    }
}

// LCOV_EXCL_STOP
