// vim: tw=80
//! Offline checking and repair of a damaged map

use pretty_assertions::assert_eq;
use rstest::rstest;

use zdm_core::{
    config::Config,
    layout::Layout,
    Error,
};

use super::*;

/// Format, map some blocks in the first megazone, and deactivate cleanly
async fn populated(harness: &Harness) -> Layout {
    let zdm = Zdm::format(harness.device(), &format_options(),
                          Config::default())
        .await
        .unwrap();
    write_blocks(&zdm, 0, 10, 0).await;
    write_blocks(&zdm, 300, 10, 0).await;
    let layout = zdm.superblock().layout;
    zdm.shutdown().await.unwrap();
    layout
}

#[rstest]
#[test_log::test(tokio::test)]
async fn clean(harness: Harness) {
    populated(&harness).await;
    for fix in [false, true] {
        let report = Zdm::check_device(harness.device(), &Config::default(),
                                       fix)
            .await
            .unwrap();
        assert!(report.is_clean(), "{report:?}");
    }
}

/// A forward page can be rebuilt from the reverse table
#[rstest]
#[test_log::test(tokio::test)]
async fn corrupt_fwd_page(harness: Harness) {
    let layout = populated(&harness).await;
    harness.overwrite(layout.fwd_lba(0, 0), &[0u8; BYTES_PER_LBA]);

    let report = Zdm::check_device(harness.device(), &Config::default(), false)
        .await
        .unwrap();
    assert_eq!(report.corrupt_pages, 1);
    assert_eq!(report.unrecoverable, 0);
    assert!(report.fwd_fixed >= 20);

    let report = Zdm::check_device(harness.device(), &Config::default(), true)
        .await
        .unwrap();
    assert_eq!(report.corrupt_pages, 1);
    let report = Zdm::check_device(harness.device(), &Config::default(), false)
        .await
        .unwrap();
    assert!(report.is_clean(), "{report:?}");

    let zdm = Zdm::open(harness.device(), Config::default()).await.unwrap();
    let expected = (0..10).flat_map(|l| pattern(l, 0)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 0, 10).await, expected);
    let expected = (300..310).flat_map(|l| pattern(l, 0)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 300, 10).await, expected);
    zdm.shutdown().await.unwrap();
}

/// The reverse table is rebuilt from the forward table
#[rstest]
#[test_log::test(tokio::test)]
async fn corrupt_rev_page(harness: Harness) {
    let layout = populated(&harness).await;
    harness.overwrite(layout.rev_lba(0, 0), &[0u8; BYTES_PER_LBA]);

    let report = Zdm::check_device(harness.device(), &Config::default(), true)
        .await
        .unwrap();
    assert_eq!(report.corrupt_pages, 1);
    assert_eq!(report.unrecoverable, 0);
    assert!(report.rev_fixed > 0);

    let zdm = Zdm::open(harness.device(), Config::default()).await.unwrap();
    let expected = (0..10).flat_map(|l| pattern(l, 0)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 0, 10).await, expected);
    let report = zdm.check(false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    zdm.shutdown().await.unwrap();
}

/// With both tables gone, the mappings can't be recovered.  Repair refuses,
/// and so does activation.
#[rstest]
#[test_log::test(tokio::test)]
async fn unrecoverable(harness: Harness) {
    let layout = populated(&harness).await;
    harness.overwrite(layout.fwd_lba(0, 0), &[0u8; BYTES_PER_LBA]);
    harness.overwrite(layout.rev_lba(0, 0), &[0u8; BYTES_PER_LBA]);

    let report = Zdm::check_device(harness.device(), &Config::default(), false)
        .await
        .unwrap();
    assert!(report.unrecoverable > 0);
    let r = Zdm::check_device(harness.device(), &Config::default(), true)
        .await;
    assert_eq!(r, Err(Error::MapInconsistency));

    let config = Config { force_check: true, ..Default::default() };
    assert!(Zdm::open(harness.device(), config).await.is_err());
}
