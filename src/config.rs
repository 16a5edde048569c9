//! Configuration constants and types for blockmux.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum number of concurrently mounted volumes (registry slots).
pub const MAX_VOLUMES: usize = 4;

/// Default logical block size issued by the filesystem engine (4KB).
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Sector size assumed for disk images that carry no geometry.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Smallest logical block size accepted.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Default upper bound on blocks moved by a single read/write call.
pub const DEFAULT_MAX_TRANSFER_BLOCKS: u32 = 256;

/// Partition entries in a legacy MBR.
pub const MBR_CAPACITY: usize = 4;

/// Partition entries parsed from a GPT entry array.
pub const GPT_CAPACITY: usize = 128;

/// Legacy MBR boot sector layout.
pub mod mbr_layout {
    /// Boot signature bytes at the end of sector 0.
    pub const SIGNATURE: [u8; 2] = [0x55, 0xAA];

    /// Offset of the boot signature.
    pub const SIGNATURE_OFFSET: usize = 510;

    /// Offset of the first partition entry.
    pub const ENTRIES_OFFSET: usize = 446;

    /// Size of one partition entry.
    pub const ENTRY_SIZE: usize = 16;

    /// Minimum bytes needed to parse a boot sector.
    pub const SECTOR_LEN: usize = 512;
}

/// GUID partition table layout.
pub mod gpt_layout {
    /// Header signature: "EFI PART".
    pub const SIGNATURE: [u8; 8] = *b"EFI PART";

    /// LBA of the primary header.
    pub const HEADER_LBA: u64 = 1;

    /// Smallest legal header size.
    pub const MIN_HEADER_SIZE: u32 = 92;

    /// Smallest legal partition entry size.
    pub const MIN_ENTRY_SIZE: u32 = 128;

    /// Refuse entry arrays larger than this (1 MiB).
    pub const MAX_ARRAY_BYTES: u64 = 1 << 20;
}

/// Format options handed to the engine's mkfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkfsOptions {
    /// Logical block size of the new filesystem.
    pub block_size: u32,

    /// Whether the journal is enabled.
    pub journal: bool,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            journal: true,
        }
    }
}

/// Configuration for a [`VolumeManager`](crate::VolumeManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Logical block size the engine issues I/O in.
    pub block_size: u32,

    /// Honour the engine's lock/unlock hooks around raw block I/O and
    /// install a per-mount lock.
    pub io_locking: bool,

    /// Fail a mount whose partition id exceeds the scheme capacity
    /// instead of falling back to whole-device addressing.
    pub strict_partition_ids: bool,

    /// Largest block count accepted by one read/write call.
    pub max_transfer_blocks: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            io_locking: true,
            strict_partition_ids: false,
            max_transfer_blocks: DEFAULT_MAX_TRANSFER_BLOCKS,
        }
    }
}

impl ManagerConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "block size must be a power of two >= {}, got {}",
                MIN_BLOCK_SIZE, self.block_size
            )));
        }
        if self.max_transfer_blocks == 0 {
            return Err(Error::InvalidConfig(
                "max_transfer_blocks must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
