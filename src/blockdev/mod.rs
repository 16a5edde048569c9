//! Virtual block device descriptors.
//!
//! A [`VirtualBlockDevice`] is what the filesystem engine sees: a logical
//! block size, the extent of the partition it lives in, and (once opened)
//! the ratio between logical blocks and the physical device's sectors.

pub mod geometry;

use crate::error::{Error, Result};
use crate::partition::PartitionExtent;
use serde::Serialize;

/// Filesystem-facing view of one mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualBlockDevice {
    /// Logical block size the engine issues I/O in.
    block_size: u32,
    /// Partition start in device sectors. `None` is the "no partition"
    /// sentinel and means whole-device addressing.
    part_offset: Option<u64>,
    /// Partition size in bytes.
    part_size: u64,
    /// Native sector size of the backing device; 0 until opened.
    sector_size: u32,
    /// Sectors per logical block; 0 until opened.
    ratio: u32,
    /// Logical blocks in the partition; 0 until opened.
    block_count: u64,
}

impl VirtualBlockDevice {
    /// Create an unopened descriptor with no partition assigned.
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            part_offset: None,
            part_size: 0,
            sector_size: 0,
            ratio: 0,
            block_count: 0,
        }
    }

    /// Copy a resolved partition extent into this descriptor.
    pub fn set_partition(&mut self, extent: PartitionExtent) {
        self.part_offset = Some(extent.offset);
        self.part_size = extent.size;
    }

    /// Reset to the whole-device sentinel.
    pub fn clear_partition(&mut self) {
        self.part_offset = None;
        self.part_size = 0;
    }

    /// Logical block size.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Partition start in sectors, or `None` for the sentinel.
    pub fn part_offset(&self) -> Option<u64> {
        self.part_offset
    }

    /// Partition start in bytes (0 for the sentinel or before open).
    pub fn part_offset_bytes(&self) -> u64 {
        self.part_offset.unwrap_or(0) * self.sector_size as u64
    }

    /// First logical block of the partition, for engines that address
    /// the device absolutely.
    pub fn first_block(&self) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        self.part_offset_bytes() / self.block_size as u64
    }

    /// Partition size in bytes.
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Native sector size recorded at open.
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Sectors per logical block recorded at open.
    pub fn ratio(&self) -> u32 {
        self.ratio
    }

    /// Logical blocks in the partition.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Whether geometry has been negotiated.
    pub fn is_open(&self) -> bool {
        self.ratio != 0
    }

    /// Convert a logical `(blk_id, blk_cnt)` into `(sector, sector_count)`.
    pub fn scale(&self, blk_id: u64, blk_cnt: u32) -> Result<(u64, u64)> {
        if !self.is_open() {
            return Err(Error::ProtocolViolation(
                "block I/O on a descriptor that was never opened".to_string(),
            ));
        }
        let ratio = self.ratio as u64;
        let sector = blk_id.checked_mul(ratio).ok_or(Error::AddressOverflow {
            blk_id,
            ratio: self.ratio,
        })?;
        Ok((sector, blk_cnt as u64 * ratio))
    }

    /// Bytes one transfer of `blk_cnt` blocks occupies.
    pub fn transfer_len(&self, blk_cnt: u32) -> usize {
        blk_cnt as usize * self.block_size as usize
    }

    fn record_open(&mut self, sector_size: u32, ratio: u32, part_size: u64) {
        self.sector_size = sector_size;
        self.ratio = ratio;
        self.part_size = part_size;
        self.block_count = part_size / self.block_size as u64;
    }

    fn record_close(&mut self) {
        self.sector_size = 0;
        self.ratio = 0;
        self.block_count = 0;
    }
}
