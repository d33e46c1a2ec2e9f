// vim: tw=80
//! Functional tests.  Each one runs ZDM against a file-backed emulated zoned
//! device.

use std::{
    fs::{self, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use divbuf::DivBufShared;
use rstest::fixture;
use tempfile::{Builder, TempDir};

use zdm_core::{
    config::FormatOptions,
    device::ZonedDevice,
    zoned_file::{FileGeometry, FileZonedDevice},
    BYTES_PER_LBA,
    LbaT,
    Zdm,
};

/// Sectors per emulated zone: 64 blocks
const ZONE_SECTORS: u64 = 512;
const NR_ZONES: u64 = 18;

/// Blocks exported by the standard format: two megazones of six usable zones
const LOGICAL_BLOCKS: LbaT = 768;

/// Blocks in one zone
const BPZ: usize = 64;

struct Harness {
    path: PathBuf,
    _tempdir: TempDir,
}

impl Harness {
    fn device(&self) -> Arc<dyn ZonedDevice> {
        Arc::new(FileZonedDevice::open(&self.path).unwrap())
    }

    /// Scribble directly on the backing file.  Only meaningful for the
    /// conventional zones, and only while nothing has the device open.
    fn overwrite(&self, lba: LbaT, data: &[u8]) {
        let f = OpenOptions::new().write(true).open(&self.path).unwrap();
        f.write_all_at(data, lba * BYTES_PER_LBA as u64).unwrap();
    }
}

/// Eighteen zones of 256 KiB, the first two conventional
#[fixture]
fn harness() -> Harness {
    let tempdir = Builder::new()
        .prefix(concat!(module_path!(), "."))
        .tempdir()
        .unwrap();
    let path = tempdir.path().join("zoned");
    let f = fs::File::create(&path).unwrap();
    f.set_len(NR_ZONES * ZONE_SECTORS * 512).unwrap();
    let geometry = FileGeometry {
        zone_sectors: ZONE_SECTORS,
        conventional_zones: 2,
        seq_preferred: false,
        logical_block_size: 4096,
    };
    FileZonedDevice::create(&path, geometry).unwrap();
    Harness { path, _tempdir: tempdir }
}

fn format_options() -> FormatOptions {
    FormatOptions {
        zones_per_megazone: 8,
        over_provision: 2,
        label: String::from("functional"),
        ..Default::default()
    }
}

/// Contents of `lba` as written in round `gen`
fn pattern(lba: LbaT, gen: u32) -> Vec<u8> {
    let mut v = vec![0u8; BYTES_PER_LBA];
    for (i, chunk) in v.chunks_mut(16).enumerate() {
        chunk[0..8].copy_from_slice(&lba.to_le_bytes());
        chunk[8..12].copy_from_slice(&gen.to_le_bytes());
        chunk[12..16].copy_from_slice(&(i as u32).to_le_bytes());
    }
    v
}

/// Write `n` blocks beginning at `lba`, all from round `gen`
async fn write_blocks(zdm: &Zdm, lba: LbaT, n: usize, gen: u32) {
    let buf = (0..n as LbaT)
        .flat_map(|i| pattern(lba + i, gen))
        .collect::<Vec<_>>();
    let dbs = DivBufShared::from(buf);
    zdm.write_at(dbs.try_const().unwrap(), lba).await.unwrap();
}

async fn read_blocks(zdm: &Zdm, lba: LbaT, n: usize) -> Vec<u8> {
    let dbs = DivBufShared::from(vec![0xa5u8; n * BYTES_PER_LBA]);
    zdm.read_at(dbs.try_mut().unwrap(), lba).await.unwrap();
    let v = dbs.try_const().unwrap()[..].to_vec();
    v
}

fn sidecar(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".zones");
    PathBuf::from(s)
}

mod check;
mod gc;
mod superblock;
mod zdm;
mod zoned_file;
