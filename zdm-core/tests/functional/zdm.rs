// vim: tw=80
//! Reads and writes through an activated device, and reactivation

use divbuf::DivBufShared;
use nix::errno::Errno;
use pretty_assertions::assert_eq;
use rstest::rstest;

use zdm_core::{
    config::Config,
    superblock,
    Error,
};

use super::*;

async fn formatted(harness: &Harness) -> Zdm {
    Zdm::format(harness.device(), &format_options(), Config::default())
        .await
        .unwrap()
}

#[rstest]
#[tokio::test]
async fn format(harness: Harness) {
    let zdm = formatted(&harness).await;
    assert_eq!(zdm.logical_blocks(), LOGICAL_BLOCKS);
    assert_eq!(zdm.discard_granularity(), Some(ZONE_SECTORS * 512));
    let sb = zdm.superblock();
    assert_eq!(sb.label, "functional");
    assert_eq!(sb.layout.megazones, 2);
    assert_eq!(sb.layout.meta_end(), 10);
    assert!(!sb.dirty);
    zdm.shutdown().await.unwrap();
}

/// An existing superblock is only overwritten when forced
#[rstest]
#[tokio::test]
async fn format_twice(harness: Harness) {
    let zdm = formatted(&harness).await;
    let uuid = zdm.superblock().uuid;
    write_blocks(&zdm, 0, 4, 0).await;
    zdm.shutdown().await.unwrap();

    let r = Zdm::format(harness.device(), &format_options(), Config::default())
        .await;
    assert_eq!(r.err(), Some(Error::Sys(Errno::EEXIST)));

    let opts = FormatOptions { force: true, ..format_options() };
    let zdm = Zdm::format(harness.device(), &opts, Config::default())
        .await
        .unwrap();
    assert_ne!(zdm.superblock().uuid, uuid);
    // The old data is gone
    assert!(read_blocks(&zdm, 0, 4).await.iter().all(|b| *b == 0));
    zdm.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn unwritten_reads_zero(harness: Harness) {
    let zdm = formatted(&harness).await;
    let data = read_blocks(&zdm, 700, 3).await;
    assert!(data.iter().all(|b| *b == 0));
}

#[rstest]
#[tokio::test]
async fn write_read(harness: Harness) {
    let zdm = formatted(&harness).await;
    write_blocks(&zdm, 5, 3, 0).await;
    let expected = (5..8).flat_map(|l| pattern(l, 0)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 5, 3).await, expected);
    // The neighbors are untouched
    assert!(read_blocks(&zdm, 4, 1).await.iter().all(|b| *b == 0));
    assert!(read_blocks(&zdm, 8, 1).await.iter().all(|b| *b == 0));
}

/// A request may span both megazones
#[rstest]
#[tokio::test]
async fn write_across_megazones(harness: Harness) {
    let zdm = formatted(&harness).await;
    write_blocks(&zdm, 380, 10, 0).await;
    let expected = (380..390).flat_map(|l| pattern(l, 0)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 380, 10).await, expected);
}

#[rstest]
#[tokio::test]
async fn overwrite(harness: Harness) {
    let zdm = formatted(&harness).await;
    write_blocks(&zdm, 10, 8, 0).await;
    write_blocks(&zdm, 12, 2, 1).await;
    let expected = (10..18).flat_map(|l| {
        if (12..14).contains(&l) { pattern(l, 1) } else { pattern(l, 0) }
    }).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 10, 8).await, expected);
    let report = zdm.check(false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
}

#[rstest]
#[case::past_end(LOGICAL_BLOCKS, BYTES_PER_LBA)]
#[case::straddles_end(LOGICAL_BLOCKS - 1, 2 * BYTES_PER_LBA)]
#[case::partial_block(0, 100)]
#[tokio::test]
async fn bad_request(harness: Harness, #[case] lba: LbaT, #[case] len: usize) {
    let zdm = formatted(&harness).await;
    let dbs = DivBufShared::from(vec![0u8; len]);
    let r = zdm.write_at(dbs.try_const().unwrap(), lba).await;
    assert_eq!(r, Err(Error::Sys(Errno::EINVAL)));
    let r = zdm.read_at(dbs.try_mut().unwrap(), lba).await;
    assert_eq!(r, Err(Error::Sys(Errno::EINVAL)));
}

#[rstest]
#[tokio::test]
async fn discard(harness: Harness) {
    let zdm = formatted(&harness).await;
    write_blocks(&zdm, 20, 4, 0).await;
    zdm.discard(21, 2).await.unwrap();
    let data = read_blocks(&zdm, 20, 4).await;
    assert_eq!(&data[..BYTES_PER_LBA], &pattern(20, 0)[..]);
    assert!(data[BYTES_PER_LBA..3 * BYTES_PER_LBA].iter().all(|b| *b == 0));
    assert_eq!(&data[3 * BYTES_PER_LBA..], &pattern(23, 0)[..]);
    // Discarding unmapped blocks is harmless
    zdm.discard(600, 8).await.unwrap();
    assert_eq!(zdm.discard(LOGICAL_BLOCKS - 1, 2).await,
               Err(Error::Sys(Errno::EINVAL)));
}

#[rstest]
#[tokio::test]
async fn discard_unsupported(harness: Harness) {
    let opts = FormatOptions { discard: false, ..format_options() };
    let zdm = Zdm::format(harness.device(), &opts, Config::default())
        .await
        .unwrap();
    assert_eq!(zdm.discard(0, 1).await, Err(Error::Sys(Errno::EOPNOTSUPP)));
}

/// Everything written before a clean shutdown is there after reactivation
#[rstest]
#[tokio::test]
async fn restart(harness: Harness) {
    let zdm = formatted(&harness).await;
    write_blocks(&zdm, 0, 16, 0).await;
    write_blocks(&zdm, 500, 16, 0).await;
    write_blocks(&zdm, 4, 4, 1).await;
    zdm.shutdown().await.unwrap();

    let device = harness.device();
    assert!(!superblock::load(&*device, false).await.unwrap().dirty);
    let zdm = Zdm::open(device, Config::default()).await.unwrap();
    assert_eq!(zdm.logical_blocks(), LOGICAL_BLOCKS);
    let expected = (0..16).flat_map(|l| {
        if (4..8).contains(&l) { pattern(l, 1) } else { pattern(l, 0) }
    }).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 0, 16).await, expected);
    let expected = (500..516).flat_map(|l| pattern(l, 0)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 500, 16).await, expected);

    // New writes go after the old ones
    write_blocks(&zdm, 16, 4, 2).await;
    let expected = (16..20).flat_map(|l| pattern(l, 2)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 16, 4).await, expected);
    let report = zdm.check(false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    zdm.shutdown().await.unwrap();
}

/// A device that went away without syncing is checked on reactivation.
/// Synced writes survive; unsynced mappings may not, but the map is
/// consistent either way.
#[rstest]
#[tokio::test]
async fn crash(harness: Harness) {
    let device = harness.device();
    let zdm = Zdm::format(device.clone(), &format_options(), Config::default())
        .await
        .unwrap();
    write_blocks(&zdm, 0, 8, 0).await;
    zdm.sync().await.unwrap();
    write_blocks(&zdm, 100, 8, 0).await;
    // The data and write pointers reach the disk, but the map doesn't
    device.sync_all().await.unwrap();
    drop(zdm);

    let device = harness.device();
    assert!(superblock::load(&*device, false).await.unwrap().dirty);
    let zdm = Zdm::open(device.clone(), Config::default()).await.unwrap();
    assert!(!superblock::load(&*device, false).await.unwrap().dirty);
    let expected = (0..8).flat_map(|l| pattern(l, 0)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 0, 8).await, expected);
    assert!(read_blocks(&zdm, 100, 8).await.iter().all(|b| *b == 0));
    let report = zdm.check(false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");

    // The lost blocks' space is stale, and must not be reused in place
    write_blocks(&zdm, 100, 8, 1).await;
    let expected = (100..108).flat_map(|l| pattern(l, 1)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 100, 8).await, expected);
    zdm.shutdown().await.unwrap();
}

/// The superblock must describe the device it's on
#[rstest]
#[tokio::test]
async fn layout_mismatch(harness: Harness) {
    formatted(&harness).await.shutdown().await.unwrap();
    // Grow the device by a zone, behind ZDM's back
    let geometry = FileZonedDevice::open(&harness.path).unwrap().geometry();
    let f = OpenOptions::new().write(true).open(&harness.path).unwrap();
    f.set_len((NR_ZONES + 1) * ZONE_SECTORS * 512).unwrap();
    drop(f);
    FileZonedDevice::create(&harness.path, geometry).unwrap();

    let r = Zdm::open(harness.device(), Config::default()).await;
    assert_eq!(r.err(), Some(Error::Sys(Errno::EINVAL)));
}

/// Writes issued while a sync is in progress are neither lost nor
/// corrupted
#[rstest]
#[tokio::test]
async fn concurrent_sync(harness: Harness) {
    let zdm = formatted(&harness).await;
    let writer = async {
        for lba in 0..64 {
            write_blocks(&zdm, lba, 1, 0).await;
        }
    };
    let syncer = async {
        for _ in 0..8 {
            zdm.sync().await.unwrap();
            tokio::task::yield_now().await;
        }
    };
    futures::join!(writer, syncer);
    let expected = (0..64).flat_map(|l| pattern(l, 0)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 0, 64).await, expected);
    let report = zdm.check(false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
}
