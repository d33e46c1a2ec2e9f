// vim: tw=80
//! Runtime configuration and format-time tunables

use std::{fs, path::Path, str::FromStr, time::Duration};

use enum_primitive_derive::Primitive;
use nix::errno::Errno;
use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    layout::Layout,
    types::*,
};

/// Longest label the superblock can hold, in bytes
pub const LABEL_MAX: usize = 63;

/// Whether the garbage collector runs
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Primitive, Serialize)]
pub enum GcStatus {
    Off = 0,
    On = 1,
    /// Collect as if every megazone were critically short of space
    Force = 2,
}

impl Default for GcStatus {
    fn default() -> Self {
        GcStatus::On
    }
}

impl FromStr for GcStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" | "Off" => Ok(GcStatus::Off),
            "on" | "On" => Ok(GcStatus::On),
            "force" | "Force" => Ok(GcStatus::Force),
            _ => Err(Error::Sys(Errno::EINVAL))
        }
    }
}

/// Garbage collection thresholds, persisted in the superblock.
///
/// The priorities are compared against a zone's occupancy, scaled so that
/// `0xffff` means completely live.  The more urgent the need for space, the
/// fuller a zone may be and still get collected.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct GcTunables {
    /// Occupancy limit when space is critical
    pub prio_def: u16,
    /// Occupancy limit when free space is below `wm_high`
    pub prio_low: u16,
    /// Occupancy limit when free space is below `wm_low`
    pub prio_high: u16,
    /// Occupancy limit when space is plentiful
    pub prio_crit: u16,
    /// Free zones per megazone at or below which space is critical
    pub wm_crit: u16,
    /// Percentage of free zones
    pub wm_high: u16,
    /// Percentage of free zones
    pub wm_low: u16,
    pub status: GcStatus,
}

impl Default for GcTunables {
    fn default() -> Self {
        GcTunables {
            prio_def: 0xff00,
            prio_low: 0x7fff,
            prio_high: 0x0400,
            prio_crit: 0x0040,
            wm_crit: 7,
            wm_high: 5,
            wm_low: 25,
            status: GcStatus::On,
        }
    }
}

/// Map page cache tunables, persisted in the superblock
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CacheTunables {
    /// Total page cache capacity, in pages
    pub size: u32,
    /// Most blocks that one garbage collection read may relocate
    pub read_ahead: u32,
    /// Clean pages unused for this long are evicted
    pub ageout_ms: u32,
    /// Sync intervals that the superblock may stay dirty before the periodic
    /// sync task cleans it
    pub journal_age: u32,
}

impl CacheTunables {
    pub fn ageout(&self) -> Duration {
        Duration::from_millis(self.ageout_ms.into())
    }
}

impl Default for CacheTunables {
    fn default() -> Self {
        CacheTunables {
            size: 4096,
            read_ahead: 64,
            ageout_ms: 9000,
            journal_age: 3,
        }
    }
}

/// Runtime settings.  Nothing here is persisted.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// Override the superblock's page cache size
    pub cache_pages: Option<usize>,
    /// Initial size of the zone report buffer, in bytes
    pub refresh_buffer: usize,
    /// How long a deferred write waits for a zone refresh
    pub defer_timeout_ms: u64,
    /// How many times a deferred write is retried
    pub defer_retries: u32,
    /// Period of the background sync task, if any
    pub sync_interval_ms: Option<u64>,
    /// Period of the background zone re-validation, if any
    pub revalidate_interval_ms: Option<u64>,
    /// Check the map on activation even if the superblock is clean
    pub force_check: bool,
    /// Restore a damaged primary superblock from the backup
    pub repair_superblock: bool,
}

impl Config {
    pub fn defer_timeout(&self) -> Duration {
        Duration::from_millis(self.defer_timeout_ms)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path.as_ref())?;
        s.parse()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_pages: None,
            refresh_buffer: 512 * 1024,
            defer_timeout_ms: 5000,
            defer_retries: 3,
            sync_interval_ms: None,
            revalidate_interval_ms: None,
            force_check: false,
            repair_superblock: false,
        }
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_yaml_ng::from_str(s).map_err(|e| {
            warn!("Invalid configuration: {e}");
            Error::Sys(Errno::EINVAL)
        })
    }
}

/// Parameters for formatting a new device
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FormatOptions {
    pub zones_per_megazone: u32,
    /// Zones per megazone that don't contribute logical capacity
    pub over_provision: u32,
    pub label: String,
    /// Generated if not specified
    pub uuid: Option<Uuid>,
    /// Whether the exported device supports discard
    pub discard: bool,
    pub gc: GcTunables,
    pub cache: CacheTunables,
    /// Overwrite an existing superblock
    pub force: bool,
}

impl FormatOptions {
    pub fn validate(&self) -> Result<()> {
        if self.label.len() > LABEL_MAX ||
            self.over_provision < 2 ||
            self.over_provision >= self.zones_per_megazone
        {
            return Err(Error::Sys(Errno::EINVAL));
        }
        Ok(())
    }
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            zones_per_megazone: Layout::DEFAULT_ZONES_PER_MEGAZONE,
            over_provision: Layout::DEFAULT_OVER_PROVISION,
            label: String::new(),
            uuid: None,
            discard: true,
            gc: GcTunables::default(),
            cache: CacheTunables::default(),
            force: false,
        }
    }
}

// LCOV_EXCL_STOP
