use std::{path::PathBuf, process::Command};

use assert_cmd::prelude::*;
use rstest::{fixture, rstest};
use tempfile::{Builder, TempDir};

fn zdmadm() -> Command {
    Command::cargo_bin("zdmadm").unwrap()
}

type Harness = (PathBuf, TempDir);

/// An emulated drive of eighteen 1 MiB zones, two of them conventional
#[fixture]
fn emulated() -> Harness {
    let tempdir = Builder::new()
        .prefix(concat!(module_path!(), "."))
        .tempdir()
        .unwrap();
    let path = tempdir.path().join("zoned");
    zdmadm()
        .args(["emulate", "-z", "1", "-c", "2", "-s", "18"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicates::str::contains("18 zones"));
    (path, tempdir)
}

/// Two megazones of eight zones, each with two over-provisioned zones
#[fixture]
fn formatted(emulated: Harness) -> Harness {
    let (path, tempdir) = emulated;
    zdmadm()
        .args(["create", "-z", "8", "-o", "2", "-l", "scratch"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicates::str::contains("3072 blocks"));
    (path, tempdir)
}

mod check {
    use super::*;

    #[rstest]
    fn clean(formatted: Harness) {
        let (path, _tempdir) = formatted;
        zdmadm()
            .arg("check")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicates::str::contains("unrecoverable entries: 0"));
    }

    #[rstest]
    fn fix(formatted: Harness) {
        let (path, _tempdir) = formatted;
        zdmadm()
            .args(["check", "--fix"])
            .arg(&path)
            .assert()
            .success();
    }

    #[rstest]
    fn unformatted(emulated: Harness) {
        let (path, _tempdir) = emulated;
        zdmadm()
            .arg("check")
            .arg(&path)
            .assert()
            .failure();
    }
}

mod create {
    use super::*;

    /// An existing superblock is only overwritten on request
    #[rstest]
    fn twice(formatted: Harness) {
        let (path, _tempdir) = formatted;
        zdmadm()
            .args(["create", "-z", "8", "-o", "2"])
            .arg(&path)
            .assert()
            .failure();
        zdmadm()
            .args(["create", "-f", "-z", "8", "-o", "2", "-l", "again"])
            .arg(&path)
            .assert()
            .success();
        zdmadm()
            .arg("show")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicates::str::contains("label: again"));
    }

    /// Metadata doesn't fit in two conventional zones with the default
    /// megazone size
    #[rstest]
    fn too_small(emulated: Harness) {
        let (path, _tempdir) = emulated;
        zdmadm()
            .arg("create")
            .arg(&path)
            .assert()
            .failure();
    }

    #[rstest]
    fn no_device() {
        zdmadm()
            .args(["create", "/nonexistent/zoned"])
            .assert()
            .failure();
    }
}

#[rstest]
fn emulate_missing_file() {
    let tempdir = Builder::new()
        .prefix(concat!(module_path!(), "."))
        .tempdir()
        .unwrap();
    zdmadm()
        .args(["emulate", "-z", "1"])
        .arg(tempdir.path().join("nothing"))
        .assert()
        .failure();
}

#[rstest]
fn modify(formatted: Harness) {
    let (path, _tempdir) = formatted;
    zdmadm()
        .args(["modify", "--gc", "off", "--label", "renamed",
               "--read-ahead", "16"])
        .arg(&path)
        .assert()
        .success();
    zdmadm()
        .arg("show")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicates::str::contains("label: renamed"))
        .stdout(predicates::str::contains("status: Off"))
        .stdout(predicates::str::contains("read_ahead: 16"));
}

#[rstest]
fn restore(formatted: Harness) {
    let (path, _tempdir) = formatted;
    zdmadm()
        .arg("restore")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicates::str::contains("3072 blocks"))
        .stdout(predicates::str::contains(
            "discard granularity: 1048576 bytes"));
}

mod show {
    use super::*;

    #[rstest]
    fn superblock(formatted: Harness) {
        let (path, _tempdir) = formatted;
        zdmadm()
            .arg("show")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicates::str::contains("label: scratch"))
            .stdout(predicates::str::contains("dirty: false"))
            .stdout(predicates::str::contains("zones_per_megazone: 8"));
    }

    #[rstest]
    fn zones(formatted: Harness) {
        let (path, _tempdir) = formatted;
        zdmadm()
            .args(["show", "--zones"])
            .arg(&path)
            .assert()
            .success()
            .stdout(predicates::str::contains("Conventional"))
            .stdout(predicates::str::contains("SeqRequired"));
    }
}

#[rstest]
fn wipe(formatted: Harness) {
    let (path, _tempdir) = formatted;
    zdmadm()
        .arg("wipe")
        .arg(&path)
        .assert()
        .success();
    zdmadm()
        .arg("restore")
        .arg(&path)
        .assert()
        .failure();
    // Once wiped, the device may be formatted again without force
    zdmadm()
        .args(["create", "-z", "8", "-o", "2"])
        .arg(&path)
        .assert()
        .success();
}
