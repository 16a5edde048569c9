//! Builders for partition table test images.

use crate::config::{gpt_layout, mbr_layout};

/// One primary entry of a synthetic MBR.
pub struct MbrPart {
    slot: usize,
    system_id: u8,
    first_lba: u32,
    sectors: u32,
    bootable: bool,
}

impl MbrPart {
    pub fn new(slot: usize, system_id: u8, first_lba: u32, sectors: u32) -> Self {
        Self {
            slot,
            system_id,
            first_lba,
            sectors,
            bootable: false,
        }
    }

    pub fn bootable(mut self) -> Self {
        self.bootable = true;
        self
    }
}

/// A 512-byte boot sector holding `parts`.
pub fn mbr_sector(parts: &[MbrPart]) -> Vec<u8> {
    let mut sector = vec![0u8; mbr_layout::SECTOR_LEN];
    for part in parts {
        let off = mbr_layout::ENTRIES_OFFSET + part.slot * mbr_layout::ENTRY_SIZE;
        sector[off] = if part.bootable { 0x80 } else { 0 };
        sector[off + 4] = part.system_id;
        sector[off + 8..off + 12].copy_from_slice(&part.first_lba.to_le_bytes());
        sector[off + 12..off + 16].copy_from_slice(&part.sectors.to_le_bytes());
    }
    sector[mbr_layout::SIGNATURE_OFFSET..mbr_layout::SIGNATURE_OFFSET + 2]
        .copy_from_slice(&mbr_layout::SIGNATURE);
    sector
}

/// Linux filesystem data type GUID in on-disk byte order.
pub const LINUX_FS_GUID: [u8; 16] = [
    0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4,
];

/// One entry of a synthetic GPT.
pub struct GptPart {
    pub slot: usize,
    pub first_lba: u64,
    pub last_lba: u64,
    pub name: &'static str,
}

const ENTRY_COUNT: u32 = 128;
const ENTRY_SIZE: u32 = 128;

/// A full disk image with a protective MBR and a primary GPT.
pub fn gpt_image(sector_size: usize, total_sectors: u64, parts: &[GptPart]) -> Vec<u8> {
    let mut image = vec![0u8; sector_size * total_sectors as usize];

    let protective_len = (total_sectors - 1).min(u32::MAX as u64) as u32;
    let mbr = mbr_sector(&[MbrPart::new(0, 0xEE, 1, protective_len)]);
    image[..mbr.len()].copy_from_slice(&mbr);

    let mut entries = vec![0u8; (ENTRY_COUNT * ENTRY_SIZE) as usize];
    for part in parts {
        let e = &mut entries[part.slot * ENTRY_SIZE as usize..][..ENTRY_SIZE as usize];
        e[0..16].copy_from_slice(&LINUX_FS_GUID);
        e[16] = 0xA0;
        e[17] = part.slot as u8;
        e[32..40].copy_from_slice(&part.first_lba.to_le_bytes());
        e[40..48].copy_from_slice(&part.last_lba.to_le_bytes());
        for (i, unit) in part.name.encode_utf16().take(36).enumerate() {
            e[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    let entries_lba = 2u64;
    let entries_at = entries_lba as usize * sector_size;
    image[entries_at..entries_at + entries.len()].copy_from_slice(&entries);

    let mut header = vec![0u8; 92];
    header[0..8].copy_from_slice(&gpt_layout::SIGNATURE);
    header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    header[12..16].copy_from_slice(&92u32.to_le_bytes());
    header[24..32].copy_from_slice(&gpt_layout::HEADER_LBA.to_le_bytes());
    header[32..40].copy_from_slice(&(total_sectors - 1).to_le_bytes());
    header[40..48].copy_from_slice(&34u64.to_le_bytes());
    header[48..56].copy_from_slice(&(total_sectors - 34).to_le_bytes());
    header[56..72].copy_from_slice(&[0x11; 16]);
    header[72..80].copy_from_slice(&entries_lba.to_le_bytes());
    header[80..84].copy_from_slice(&ENTRY_COUNT.to_le_bytes());
    header[84..88].copy_from_slice(&ENTRY_SIZE.to_le_bytes());
    header[88..92].copy_from_slice(&crc32fast::hash(&entries).to_le_bytes());
    let crc = crc32fast::hash(&header);
    header[16..20].copy_from_slice(&crc.to_le_bytes());

    let header_at = gpt_layout::HEADER_LBA as usize * sector_size;
    image[header_at..header_at + header.len()].copy_from_slice(&header);
    image
}
