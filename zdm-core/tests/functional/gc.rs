// vim: tw=80
//! Garbage collection, and recovery from failed writes

use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use pretty_assertions::assert_eq;
use rstest::rstest;

use zdm_core::{
    config::{Config, GcStatus, GcTunables},
    device::{BoxDevFut, ReportingOption, ResetTarget},
    Error,
    IoVec,
    IoVecMut,
    SectorT,
};

use super::*;

/// Logical blocks in one megazone
const MZ_BLOCKS: usize = 384;

async fn formatted(harness: &Harness, status: GcStatus) -> Zdm {
    let opts = FormatOptions {
        gc: GcTunables { status, ..Default::default() },
        ..format_options()
    };
    Zdm::format(harness.device(), &opts, Config::default())
        .await
        .unwrap()
}

async fn verify(zdm: &Zdm, lba: LbaT, gens: &[u32]) {
    let data = read_blocks(zdm, lba, gens.len()).await;
    for (i, gen) in gens.iter().enumerate() {
        let l = lba + i as LbaT;
        let block = &data[i * BYTES_PER_LBA..(i + 1) * BYTES_PER_LBA];
        assert!(block == &pattern(l, *gen)[..], "lba {l} isn't from round {gen}");
    }
}

/// Rewriting the same zone's worth of blocks many times over needs several
/// times the megazone's physical space.  Wholly stale zones are reclaimed
/// without moving anything.
#[rstest]
#[test_log::test(tokio::test)]
async fn overwrite_whole_zones(harness: Harness) {
    let zdm = formatted(&harness, GcStatus::On).await;
    for gen in 0..20 {
        write_blocks(&zdm, 0, BPZ, gen).await;
    }
    verify(&zdm, 0, &[19; BPZ]).await;
    let report = zdm.check(false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    zdm.shutdown().await.unwrap();

    let zdm = Zdm::open(harness.device(), Config::default()).await.unwrap();
    verify(&zdm, 0, &[19; BPZ]).await;
    zdm.shutdown().await.unwrap();
}

/// Fill a megazone's logical space, then rewrite half of it.  The half-stale
/// zones can only be reclaimed by relocating their live blocks.
#[rstest]
#[test_log::test(tokio::test)]
async fn relocate(harness: Harness) {
    let zdm = formatted(&harness, GcStatus::On).await;
    write_blocks(&zdm, 0, MZ_BLOCKS, 0).await;
    for lba in (0..MZ_BLOCKS as LbaT).step_by(2) {
        write_blocks(&zdm, lba, 1, 1).await;
    }
    zdm.gc_now().await.unwrap();
    let gens = (0..MZ_BLOCKS).map(|i| if i % 2 == 0 { 1 } else { 0 })
        .collect::<Vec<_>>();
    verify(&zdm, 0, &gens).await;
    let report = zdm.check(false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    zdm.shutdown().await.unwrap();

    let zdm = Zdm::open(harness.device(), Config::default()).await.unwrap();
    verify(&zdm, 0, &gens).await;
    // There's room to keep going
    write_blocks(&zdm, 1, 1, 2).await;
    verify(&zdm, 0, &[1, 2, 1]).await;
    zdm.shutdown().await.unwrap();
}

/// Both megazones collect independently
#[rstest]
#[test_log::test(tokio::test)]
async fn both_megazones(harness: Harness) {
    let zdm = formatted(&harness, GcStatus::On).await;
    for gen in 0..10 {
        write_blocks(&zdm, 0, BPZ, gen).await;
        write_blocks(&zdm, MZ_BLOCKS as LbaT, BPZ, gen).await;
    }
    verify(&zdm, 0, &[9; BPZ]).await;
    verify(&zdm, MZ_BLOCKS as LbaT, &[9; BPZ]).await;
    zdm.shutdown().await.unwrap();
}

/// Without collection, stale blocks eventually use up the space
#[rstest]
#[test_log::test(tokio::test)]
async fn disabled(harness: Harness) {
    let zdm = formatted(&harness, GcStatus::Off).await;
    // Seven of the eight zones are usable by ordinary writes
    for gen in 0..7 {
        write_blocks(&zdm, 0, BPZ, gen).await;
    }
    let dbs = DivBufShared::from(pattern(0, 7));
    let r = zdm.write_at(dbs.try_const().unwrap(), 0).await;
    assert_eq!(r, Err(Error::Sys(Errno::ENOSPC)));
    assert_eq!(zdm.gc_now().await, Ok(0));
    verify(&zdm, 0, &[6; BPZ]).await;
    // The other megazone is unaffected
    write_blocks(&zdm, MZ_BLOCKS as LbaT, 1, 0).await;
}

/// Fails data writes on demand
struct Flaky {
    inner: FileZonedDevice,
    fail: AtomicBool,
    /// First block that may fail.  Metadata writes below it always succeed.
    data_start: LbaT,
}

impl ZonedDevice for Flaky {
    fn capacity(&self) -> SectorT {
        self.inner.capacity()
    }

    fn logical_sector_scale(&self) -> u32 {
        self.inner.logical_sector_scale()
    }

    fn report_zones(&self, start: SectorT, buf: Vec<u8>,
                    option: ReportingOption, partial: bool)
        -> BoxDevFut<Vec<u8>>
    {
        self.inner.report_zones(start, buf, option, partial)
    }

    fn reset_write_pointer(&self, target: ResetTarget) -> BoxDevFut<()> {
        self.inner.reset_write_pointer(target)
    }

    fn read_at(&self, buf: IoVecMut, lba: LbaT) -> BoxDevFut<()> {
        self.inner.read_at(buf, lba)
    }

    fn sync_all(&self) -> BoxDevFut<()> {
        self.inner.sync_all()
    }

    fn write_at(&self, buf: IoVec, lba: LbaT) -> BoxDevFut<()> {
        if lba >= self.data_start && self.fail.load(Ordering::Relaxed) {
            Box::pin(futures::future::err(Error::DeviceError(Errno::EIO)))
        } else {
            self.inner.write_at(buf, lba)
        }
    }
}

/// A failed write leaves the zone's write pointer in doubt.  ZDM must learn
/// the truth from the device before writing there again.
#[rstest]
#[test_log::test(tokio::test)]
async fn write_failure(harness: Harness) {
    let flaky = Arc::new(Flaky {
        inner: FileZonedDevice::open(&harness.path).unwrap(),
        fail: AtomicBool::new(false),
        data_start: 2 * BPZ as LbaT,
    });
    let zdm = Zdm::format(flaky.clone(), &format_options(), Config::default())
        .await
        .unwrap();
    write_blocks(&zdm, 0, 2, 0).await;

    flaky.fail.store(true, Ordering::Relaxed);
    let dbs = DivBufShared::from(pattern(2, 0));
    let r = zdm.write_at(dbs.try_const().unwrap(), 2).await;
    assert_eq!(r, Err(Error::DeviceError(Errno::EIO)));
    flaky.fail.store(false, Ordering::Relaxed);

    write_blocks(&zdm, 2, 4, 1).await;
    verify(&zdm, 0, &[0, 0, 1, 1, 1, 1]).await;
    let report = zdm.check(false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    zdm.shutdown().await.unwrap();

    let zdm = Zdm::open(harness.device(), Config::default()).await.unwrap();
    verify(&zdm, 0, &[0, 0, 1, 1, 1, 1]).await;
    zdm.shutdown().await.unwrap();
}
