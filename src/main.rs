//! blockmux - inspect disk images the way the volume manager sees them.
//!
//! Reports device geometry, partition tables and partition extents, and
//! dumps logical blocks read through the slot registry.

use blockmux::blockdev::VirtualBlockDevice;
use blockmux::config::DEFAULT_SECTOR_SIZE;
use blockmux::device::{ImageDevice, PhysicalDevice};
use blockmux::partition::{resolve, scan, PartitionKind, PartitionScheme};
use blockmux::{Error, ManagerConfig, Registry, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "blockmux")]
#[command(author, version, about, long_about = None)]
#[command(
    about = "Partition discovery and block multiplexing for disk images",
    long_about = "Scans GPT/MBR partition tables and reads logical blocks through the same slot registry the filesystem engine uses."
)]
struct Cli {
    /// Sector size assumed for plain image files
    #[arg(long, global = true, default_value_t = DEFAULT_SECTOR_SIZE)]
    sector_size: u32,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sector size, sector count and capacity
    Geometry {
        /// Disk image or block device
        image: PathBuf,
    },

    /// List the partition table
    Scan {
        /// Disk image or block device
        image: PathBuf,

        /// Print the table as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the extent of one partition id
    Resolve {
        /// Disk image or block device
        image: PathBuf,

        /// Partition id
        partition_id: u32,
    },

    /// Hex dump logical blocks
    Dump {
        /// Disk image or block device
        image: PathBuf,

        /// First logical block, relative to the partition
        #[arg(long)]
        block: u64,

        /// Number of blocks
        #[arg(long, default_value = "1")]
        count: u32,

        /// Partition id (default: whole device)
        #[arg(long)]
        partition: Option<u32>,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::default(),
    };

    match cli.command {
        Commands::Geometry { image } => cmd_geometry(&image, cli.sector_size, &config),
        Commands::Scan { image, json } => cmd_scan(&image, cli.sector_size, json),
        Commands::Resolve {
            image,
            partition_id,
        } => cmd_resolve(&image, cli.sector_size, partition_id),
        Commands::Dump {
            image,
            block,
            count,
            partition,
        } => cmd_dump(&image, cli.sector_size, &config, block, count, partition),
    }
}

fn cmd_geometry(image: &Path, sector_size: u32, config: &ManagerConfig) -> Result<()> {
    let device = ImageDevice::read_only(image, sector_size)?;
    device.open()?;
    let geometry = device.geometry();
    device.close()?;
    let geometry = geometry?;

    println!("Device:        {}", device.name());
    println!("Sector size:   {} bytes", geometry.sector_size);
    println!("Sectors:       {}", geometry.sector_count);
    println!("Capacity:      {} bytes", geometry.capacity());
    if geometry.block_size != 0 {
        println!("Erase block:   {} bytes", geometry.block_size);
    }
    if geometry.sector_size != 0 && config.block_size % geometry.sector_size == 0 {
        println!(
            "Block ratio:   {} sectors per {}-byte block",
            config.block_size / geometry.sector_size,
            config.block_size
        );
    } else {
        println!("Block ratio:   incompatible with {}-byte blocks", config.block_size);
    }

    Ok(())
}

fn cmd_scan(image: &Path, sector_size: u32, json: bool) -> Result<()> {
    let device = ImageDevice::read_only(image, sector_size)?;
    let scheme = scan(&device);

    if json {
        println!("{}", serde_json::to_string_pretty(&scheme)?);
        return Ok(());
    }

    println!("Scheme: {}", scheme.name());
    let Some(table) = scheme.table() else {
        println!("(no partition table; whole device)");
        return Ok(());
    };

    let mut any = false;
    for (id, entry) in table.populated() {
        any = true;
        let detail = match &entry.kind {
            PartitionKind::Mbr {
                system_id,
                bootable,
            } => format!(
                "type {:#04x}{}",
                system_id,
                if *bootable { " boot" } else { "" }
            ),
            PartitionKind::Gpt {
                type_guid, name, ..
            } => format!("{} {}", type_guid, name),
            PartitionKind::Empty => String::new(),
        };
        println!(
            "{:>3}  start {:>12}  size {:>14}  {}",
            id, entry.offset, entry.size, detail
        );
    }
    if !any {
        println!("(empty)");
    }

    Ok(())
}

fn cmd_resolve(image: &Path, sector_size: u32, partition_id: u32) -> Result<()> {
    let device = ImageDevice::read_only(image, sector_size)?;
    let scheme = scan(&device);
    let extent = resolve(partition_id, &scheme)?;

    println!("Scheme:        {}", scheme.name());
    println!("Partition:     {}", partition_id);
    println!("Start sector:  {}", extent.offset);
    println!("Size:          {} bytes", extent.size);

    Ok(())
}

fn cmd_dump(
    image: &Path,
    sector_size: u32,
    config: &ManagerConfig,
    block: u64,
    count: u32,
    partition: Option<u32>,
) -> Result<()> {
    let device: Arc<dyn PhysicalDevice> = Arc::new(ImageDevice::read_only(image, sector_size)?);

    let mut desc = VirtualBlockDevice::new(config.block_size);
    if let Some(id) = partition {
        let scheme: PartitionScheme = scan(device.as_ref());
        desc.set_partition(resolve(id, &scheme)?);
    }

    let registry = Registry::new(config);
    let slot = registry.allocate_slot()?;
    let result = dump_slot(&registry, slot, device, desc, block, count);
    registry.release_slot(slot)?;
    result
}

fn dump_slot(
    registry: &Registry,
    slot: blockmux::SlotIndex,
    device: Arc<dyn PhysicalDevice>,
    desc: VirtualBlockDevice,
    block: u64,
    count: u32,
) -> Result<()> {
    registry.bind(slot, device, desc)?;
    registry.open(slot)?;
    let desc = registry.descriptor(slot)?;

    if block.saturating_add(count as u64) > desc.block_count() {
        return Err(Error::InvalidArgument(format!(
            "blocks {}..{} past the end ({} blocks)",
            block,
            block.saturating_add(count as u64),
            desc.block_count()
        )));
    }

    let mut buf = vec![0u8; desc.transfer_len(count)];
    registry.read(slot, desc.first_block() + block, count, &mut buf)?;
    registry.close(slot)?;

    let base = (desc.first_block() + block) * desc.block_size() as u64;
    for (i, line) in buf.chunks(16).enumerate() {
        let offset = base + (i * 16) as u64;
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("{:012x}  {:<32}  {}", offset, hex::encode(line), ascii);
    }

    Ok(())
}
