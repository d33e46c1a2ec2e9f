// vim: tw=80
//! Superblock damage, repair, and wiping

use pretty_assertions::assert_eq;
use rstest::rstest;

use zdm_core::{
    config::Config,
    superblock,
    Error,
};

use super::*;

async fn formatted(harness: &Harness) {
    let zdm = Zdm::format(harness.device(), &format_options(),
                          Config::default())
        .await
        .unwrap();
    write_blocks(&zdm, 0, 4, 0).await;
    zdm.shutdown().await.unwrap();
}

/// Flip some bits in the primary superblock
fn damage_primary(harness: &Harness) {
    harness.overwrite(0, &[0xa5u8; 64]);
}

#[rstest]
#[tokio::test]
async fn corrupt_primary(harness: Harness) {
    formatted(&harness).await;
    damage_primary(&harness);
    let r = Zdm::open(harness.device(), Config::default()).await;
    assert_eq!(r.err(), Some(Error::CorruptSuperblock));
    // The primary is still damaged
    let r = superblock::load(&*harness.device(), false).await;
    assert_eq!(r, Err(Error::CorruptSuperblock));
}

/// The backup restores a damaged primary, if asked
#[rstest]
#[tokio::test]
async fn repair_primary(harness: Harness) {
    formatted(&harness).await;
    damage_primary(&harness);
    let config = Config { repair_superblock: true, ..Default::default() };
    let zdm = Zdm::open(harness.device(), config).await.unwrap();
    assert_eq!(zdm.superblock().label, "functional");
    let expected = (0..4).flat_map(|l| pattern(l, 0)).collect::<Vec<_>>();
    assert_eq!(read_blocks(&zdm, 0, 4).await, expected);
    zdm.shutdown().await.unwrap();

    let zdm = Zdm::open(harness.device(), Config::default()).await.unwrap();
    zdm.shutdown().await.unwrap();
}

/// Each activation writes a new generation
#[rstest]
#[tokio::test]
async fn generation(harness: Harness) {
    formatted(&harness).await;
    let device = harness.device();
    let before = superblock::load(&*device, false).await.unwrap().generation;
    let zdm = Zdm::open(device.clone(), Config::default()).await.unwrap();
    write_blocks(&zdm, 8, 1, 0).await;
    zdm.shutdown().await.unwrap();
    let after = superblock::load(&*device, false).await.unwrap().generation;
    assert!(after > before, "{after} <= {before}");
}

#[rstest]
#[tokio::test]
async fn wipe(harness: Harness) {
    formatted(&harness).await;
    let device = harness.device();
    superblock::wipe(&*device).await.unwrap();
    assert_eq!(superblock::probe(&*device).await, Ok(None));
    assert!(Zdm::open(device.clone(), Config::default()).await.is_err());

    // A wiped device may be formatted again without force
    let zdm = Zdm::format(device, &format_options(), Config::default())
        .await
        .unwrap();
    assert!(read_blocks(&zdm, 0, 4).await.iter().all(|b| *b == 0));
    zdm.shutdown().await.unwrap();
}
