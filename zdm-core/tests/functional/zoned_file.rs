// vim: tw=80
//! The emulated device, as seen through zone reports

use std::sync::Arc;

use divbuf::DivBufShared;
use pretty_assertions::assert_eq;
use rstest::rstest;

use zdm_core::{
    device::ResetTarget,
    refresh::{DEFAULT_BUFFER_LEN, ZoneRefresher},
    zone::{ZoneCondition, ZoneType},
    zone_store::ZoneStore,
    zoned_file::FileZonedDevice,
    SECTORS_PER_LBA,
};

use super::*;

async fn refreshed(device: Arc<dyn ZonedDevice>) -> Arc<ZoneStore> {
    let store = Arc::new(ZoneStore::default());
    let refresher = ZoneRefresher::new(device, store.clone(),
                                       DEFAULT_BUFFER_LEN);
    refresher.refresh_all().await.unwrap();
    store
}

async fn write(device: &dyn ZonedDevice, lba: LbaT, n: usize) {
    let dbs = DivBufShared::from(vec![0x42u8; n * BYTES_PER_LBA]);
    device.write_at(dbs.try_const().unwrap(), lba).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn report_all(harness: Harness) {
    let store = refreshed(harness.device()).await;
    let zones = store.snapshot();
    assert_eq!(zones.len(), NR_ZONES as usize);
    for (i, z) in zones.iter().enumerate() {
        assert_eq!(z.start, i as u64 * ZONE_SECTORS);
        assert_eq!(z.len, ZONE_SECTORS);
        if i < 2 {
            assert_eq!(z.zone_type, ZoneType::Conventional);
        } else {
            assert_eq!(z.zone_type, ZoneType::SeqRequired);
            assert_eq!(z.cond, ZoneCondition::Empty);
            assert_eq!(z.wp, Some(z.start));
        }
    }
    assert_eq!(store.discard_granularity(), Some(ZONE_SECTORS * 512));
}

/// Write pointers survive a reopen, but only once synced
#[rstest]
#[tokio::test]
async fn write_pointers_persist(harness: Harness) {
    let z2 = 2 * ZONE_SECTORS;
    let z3 = 3 * ZONE_SECTORS;
    {
        let device = harness.device();
        write(&*device, z2 / SECTORS_PER_LBA, 3).await;
        device.sync_all().await.unwrap();
        write(&*device, z3 / SECTORS_PER_LBA, 1).await;
    }
    let store = refreshed(harness.device()).await;
    let zone2 = store.lookup(z2).unwrap();
    assert_eq!(zone2.wp, Some(z2 + 3 * SECTORS_PER_LBA));
    assert_eq!(zone2.cond, ZoneCondition::ImplicitOpen);
    assert_eq!(store.lookup(z3).unwrap().wp, Some(z3));
}

/// Resetting every zone empties them all, and zeroes their contents
#[rstest]
#[tokio::test]
async fn reset_all(harness: Harness) {
    let device = harness.device();
    for zone in 2..NR_ZONES {
        write(&*device, zone * ZONE_SECTORS / SECTORS_PER_LBA, 2).await;
    }
    device.reset_write_pointer(ResetTarget::All).await.unwrap();
    let store = refreshed(device.clone()).await;
    for z in store.snapshot().into_iter().skip(2) {
        assert_eq!(z.wp, Some(z.start));
        assert_eq!(z.cond, ZoneCondition::Empty);
    }
    let dbs = DivBufShared::from(vec![0xffu8; BYTES_PER_LBA]);
    device.read_at(dbs.try_mut().unwrap(), 2 * ZONE_SECTORS / SECTORS_PER_LBA)
        .await
        .unwrap();
    assert!(dbs.try_const().unwrap().iter().all(|b| *b == 0));
}

#[rstest]
fn missing_sidecar(harness: Harness) {
    fs::remove_file(sidecar(&harness.path)).unwrap();
    assert!(FileZonedDevice::open(&harness.path).is_err());
}
