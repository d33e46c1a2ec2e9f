use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{crate_version, Parser};
use nix::errno::Errno;
use tracing_subscriber::EnvFilter;
use zdm_core::{
    config::{Config, FormatOptions, GcStatus, LABEL_MAX},
    device::ZonedDevice,
    layout::Layout,
    refresh::ZoneRefresher,
    superblock,
    zone_store::ZoneStore,
    zoned_file::{FileGeometry, FileZonedDevice},
    Error,
    Result,
    Uuid,
    Zdm,
};

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => Config::from_file(p),
        None => Ok(Config::default())
    }
}

fn open_device(path: &Path) -> Result<Arc<dyn ZonedDevice>> {
    Ok(Arc::new(FileZonedDevice::open(path)?))
}

#[derive(Parser, Clone, Debug)]
/// Check the map of an inactive device
struct Check {
    /// Repair whatever can be repaired
    #[clap(short, long)]
    fix:    bool,
    /// Runtime configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    path:   PathBuf,
}

impl Check {
    async fn main(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let device = open_device(&self.path)?;
        let report = Zdm::check_device(device, &config, self.fix).await?;
        println!("forward entries fixed: {}", report.fwd_fixed);
        println!("reverse entries fixed: {}", report.rev_fixed);
        println!("corrupt pages:         {}", report.corrupt_pages);
        println!("unrecoverable entries: {}", report.unrecoverable);
        if !self.fix && !report.is_clean() {
            return Err(Error::MapInconsistency);
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Format a zoned device for use as a translation device
struct Create {
    /// Overwrite an existing superblock
    #[clap(short, long)]
    force:              bool,
    #[clap(short, long, default_value = "")]
    label:              String,
    /// UUID of the new device.  Generated if not specified.
    #[clap(long)]
    uuid:               Option<Uuid>,
    #[clap(short, long, default_value_t = Layout::DEFAULT_ZONES_PER_MEGAZONE)]
    zones_per_megazone: u32,
    /// Zones per megazone reserved for garbage collection
    #[clap(short, long, default_value_t = Layout::DEFAULT_OVER_PROVISION)]
    over_provision:     u32,
    /// Don't advertise discard support
    #[clap(long)]
    no_discard:         bool,
    /// Runtime configuration file
    #[clap(short, long)]
    config:             Option<PathBuf>,
    path:               PathBuf,
}

impl Create {
    async fn main(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let device = open_device(&self.path)?;
        let opts = FormatOptions {
            zones_per_megazone: self.zones_per_megazone,
            over_provision: self.over_provision,
            label: self.label,
            uuid: self.uuid,
            discard: !self.no_discard,
            force: self.force,
            ..Default::default()
        };
        let zdm = Zdm::format(device, &opts, config).await?;
        let sb = zdm.superblock();
        println!("{} {} blocks", sb.uuid, zdm.logical_blocks());
        zdm.shutdown().await
    }
}

#[derive(Parser, Clone, Debug)]
/// Turn a regular file into an emulated zoned device
struct Emulate {
    /// Zone size in MiB
    #[clap(short, long, default_value_t = 256)]
    zone_size:     u64,
    /// Number of leading conventional zones
    #[clap(short, long, default_value_t = 8)]
    conventional:  u32,
    /// Emulate a host-aware drive
    #[clap(long)]
    seq_preferred: bool,
    /// Logical block size in bytes
    #[clap(short, long, default_value_t = 4096)]
    block_size:    u32,
    /// Set the file's size in MiB, creating it if necessary
    #[clap(short, long)]
    size:          Option<u64>,
    path:          PathBuf,
}

impl Emulate {
    async fn main(self) -> Result<()> {
        if let Some(mib) = self.size {
            let f = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            f.set_len(mib << 20)?;
        }
        let geometry = FileGeometry {
            zone_sectors: self.zone_size << 11,
            conventional_zones: self.conventional,
            seq_preferred: self.seq_preferred,
            logical_block_size: self.block_size,
        };
        let device = FileZonedDevice::create(&self.path, geometry)?;
        println!("{}: {} zones", self.path.display(),
                 device.capacity() / geometry.zone_sectors);
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Change the tunables stored in the superblock
struct Modify {
    #[clap(short, long)]
    label:       Option<String>,
    /// Garbage collection: off, on, or force
    #[clap(short, long)]
    gc:          Option<GcStatus>,
    #[clap(long)]
    prio_def:    Option<u16>,
    #[clap(long)]
    prio_low:    Option<u16>,
    #[clap(long)]
    prio_high:   Option<u16>,
    #[clap(long)]
    prio_crit:   Option<u16>,
    /// Free zones per megazone below which space is critical
    #[clap(long)]
    wm_crit:     Option<u16>,
    /// Percentage of free zones
    #[clap(long)]
    wm_high:     Option<u16>,
    /// Percentage of free zones
    #[clap(long)]
    wm_low:      Option<u16>,
    /// Map page cache size, in pages
    #[clap(long)]
    cache_size:  Option<u32>,
    /// Blocks per garbage collection read
    #[clap(long)]
    read_ahead:  Option<u32>,
    #[clap(long)]
    ageout_ms:   Option<u32>,
    #[clap(long)]
    journal_age: Option<u32>,
    path:        PathBuf,
}

impl Modify {
    async fn main(self) -> Result<()> {
        let device = open_device(&self.path)?;
        let mut sb = superblock::load(&*device, false).await?;
        if let Some(label) = self.label {
            if label.len() > LABEL_MAX {
                eprintln!("Label may be at most {LABEL_MAX} bytes");
                return Err(Error::Sys(Errno::EINVAL));
            }
            sb.label = label;
        }
        let gc = &mut sb.gc;
        let settings = [
            (self.prio_def, &mut gc.prio_def),
            (self.prio_low, &mut gc.prio_low),
            (self.prio_high, &mut gc.prio_high),
            (self.prio_crit, &mut gc.prio_crit),
            (self.wm_crit, &mut gc.wm_crit),
            (self.wm_high, &mut gc.wm_high),
            (self.wm_low, &mut gc.wm_low),
        ];
        for (new, field) in settings {
            if let Some(v) = new {
                *field = v;
            }
        }
        if let Some(status) = self.gc {
            sb.gc.status = status;
        }
        let cache = &mut sb.cache;
        let settings = [
            (self.cache_size, &mut cache.size),
            (self.read_ahead, &mut cache.read_ahead),
            (self.ageout_ms, &mut cache.ageout_ms),
            (self.journal_age, &mut cache.journal_age),
        ];
        for (new, field) in settings {
            if let Some(v) = new {
                *field = v;
            }
        }
        superblock::write(&*device, &sb).await
    }
}

#[derive(Parser, Clone, Debug)]
/// Activate a device, report its capacity, and deactivate it
struct Restore {
    /// Runtime configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    path:   PathBuf,
}

impl Restore {
    async fn main(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let device = open_device(&self.path)?;
        let zdm = Zdm::open(device, config).await?;
        println!("{} blocks", zdm.logical_blocks());
        if let Some(g) = zdm.discard_granularity() {
            println!("discard granularity: {g} bytes");
        }
        zdm.shutdown().await
    }
}

#[derive(Parser, Clone, Debug)]
/// Print the superblock
struct Show {
    /// Also print the zone table
    #[clap(short, long)]
    zones: bool,
    path:  PathBuf,
}

impl Show {
    async fn main(self) -> Result<()> {
        let device = open_device(&self.path)?;
        let sb = superblock::load(&*device, false).await?;
        let yaml = serde_yaml_ng::to_string(&sb)
            .map_err(|_| Error::Sys(Errno::EINVAL))?;
        print!("{yaml}");
        if self.zones {
            let store = Arc::new(ZoneStore::default());
            let refresher = ZoneRefresher::new(device.clone(), store.clone(),
                zdm_core::refresh::DEFAULT_BUFFER_LEN);
            refresher.refresh_all().await?;
            let mut table = tabular::Table::new("{:>} {:>} {:<} {:<} {:>}");
            let mut hrow = tabular::Row::new();
            for h in ["START", "LENGTH", "TYPE", "CONDITION", "WP"] {
                hrow.add_cell(h);
            }
            table.add_row(hrow);
            for z in store.snapshot() {
                let wp = z.wp.map(|wp| wp.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let mut row = tabular::Row::new();
                row.add_cell(z.start)
                    .add_cell(z.len)
                    .add_cell(format!("{:?}", z.zone_type))
                    .add_cell(format!("{:?}", z.cond))
                    .add_cell(wp);
                table.add_row(row);
            }
            print!("{table}");
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Erase the superblocks and metadata
struct Wipe {
    path: PathBuf,
}

impl Wipe {
    async fn main(self) -> Result<()> {
        let device = open_device(&self.path)?;
        superblock::wipe(&*device).await
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Check(Check),
    Create(Create),
    Emulate(Emulate),
    Modify(Modify),
    Restore(Restore),
    Show(Show),
    Wipe(Wipe),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli: Cli = Cli::parse();
    match cli.cmd {
        SubCommand::Check(check) => check.main().await,
        SubCommand::Create(create) => create.main().await,
        SubCommand::Emulate(emulate) => emulate.main().await,
        SubCommand::Modify(modify) => modify.main().await,
        SubCommand::Restore(restore) => restore.main().await,
        SubCommand::Show(show) => show.main().await,
        SubCommand::Wipe(wipe) => wipe.main().await,
    }
}
