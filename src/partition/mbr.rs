//! Legacy MBR boot sector parser.

use crate::config::{mbr_layout, MBR_CAPACITY};
use crate::error::{Error, Result};
use crate::partition::{PartitionEntry, PartitionKind, PartitionTable};

const BOOTABLE: u8 = 0x80;

/// Parse the four primary entries of a boot sector.
///
/// Entries keep their slot position, so partition id N is always the
/// N-th entry of the sector. Sizes are converted to bytes with
/// `sector_size`.
pub fn parse_mbr(sector: &[u8], sector_size: u32) -> Result<PartitionTable> {
    if sector.len() < mbr_layout::SECTOR_LEN {
        return Err(Error::NotFound(format!(
            "boot sector too small: {} bytes",
            sector.len()
        )));
    }

    let sig = &sector[mbr_layout::SIGNATURE_OFFSET..mbr_layout::SIGNATURE_OFFSET + 2];
    if sig != mbr_layout::SIGNATURE {
        return Err(Error::NotFound(format!(
            "no MBR signature (found {:02X}{:02X})",
            sig[0], sig[1]
        )));
    }

    let mut table = PartitionTable::with_capacity(MBR_CAPACITY);
    for id in 0..MBR_CAPACITY {
        let off = mbr_layout::ENTRIES_OFFSET + id * mbr_layout::ENTRY_SIZE;
        let raw = &sector[off..off + mbr_layout::ENTRY_SIZE];

        let status = raw[0];
        if status != 0 && status != BOOTABLE {
            // A volume boot record also ends in 55AA; its code bytes land
            // here and never look like a status flag.
            return Err(Error::NotFound(format!(
                "entry {} has invalid status byte {:#04x}",
                id, status
            )));
        }

        let system_id = raw[4];
        if system_id == 0 {
            continue;
        }

        let first_lba = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let sectors = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);

        table.set(
            id,
            PartitionEntry {
                offset: first_lba as u64,
                size: sectors as u64 * sector_size as u64,
                kind: PartitionKind::Mbr {
                    system_id,
                    bootable: status == BOOTABLE,
                },
            },
        );
    }

    Ok(table)
}
