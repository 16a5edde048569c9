//! GUID partition table parser.

use crate::config::{gpt_layout, GPT_CAPACITY};
use crate::device::PhysicalDevice;
use crate::error::{Error, Result};
use crate::partition::{PartitionEntry, PartitionKind, PartitionTable};
use serde::{Serialize, Serializer};

/// A GUID as stored on disk (first three fields little-endian).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid([u8; 16]);

impl Guid {
    /// Wrap raw on-disk bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Whether every byte is zero (unused entry).
    pub fn is_nil(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{}-{}",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            hex::encode_upper(&b[8..10]),
            hex::encode_upper(&b[10..16])
        )
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid({})", self)
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Fields of the primary GPT header this crate relies on.
#[derive(Debug, Clone)]
struct GptHeader {
    entries_lba: u64,
    entry_count: u32,
    entry_size: u32,
    entries_crc: u32,
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn u64_at(data: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(raw)
}

fn invalid(reason: String) -> Error {
    Error::NotFound(reason)
}

/// Validate the header sector read from LBA 1.
fn parse_header(sector: &[u8]) -> Result<GptHeader> {
    if sector.len() < gpt_layout::MIN_HEADER_SIZE as usize {
        return Err(invalid(format!("header sector too small: {}", sector.len())));
    }
    if sector[0..8] != gpt_layout::SIGNATURE {
        return Err(invalid("no GPT signature".to_string()));
    }

    let header_size = u32_at(sector, 12);
    if header_size < gpt_layout::MIN_HEADER_SIZE || header_size as usize > sector.len() {
        return Err(invalid(format!("bad GPT header size {}", header_size)));
    }

    let stored_crc = u32_at(sector, 16);
    let mut header = sector[..header_size as usize].to_vec();
    header[16..20].fill(0);
    let crc = crc32fast::hash(&header);
    if crc != stored_crc {
        return Err(invalid(format!(
            "GPT header CRC mismatch: stored {:08X}, computed {:08X}",
            stored_crc, crc
        )));
    }

    let my_lba = u64_at(sector, 24);
    if my_lba != gpt_layout::HEADER_LBA {
        return Err(invalid(format!("GPT header claims LBA {}", my_lba)));
    }

    let entry_size = u32_at(sector, 84);
    if entry_size < gpt_layout::MIN_ENTRY_SIZE || entry_size % 8 != 0 {
        return Err(invalid(format!("bad GPT entry size {}", entry_size)));
    }

    Ok(GptHeader {
        entries_lba: u64_at(sector, 72),
        entry_count: u32_at(sector, 80),
        entry_size,
        entries_crc: u32_at(sector, 88),
    })
}

fn parse_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn parse_entries(array: &[u8], header: &GptHeader, sector_size: u32) -> PartitionTable {
    let mut table = PartitionTable::with_capacity(GPT_CAPACITY);
    let count = (header.entry_count as usize).min(GPT_CAPACITY);

    for (id, raw) in array
        .chunks_exact(header.entry_size as usize)
        .take(count)
        .enumerate()
    {
        let mut type_bytes = [0u8; 16];
        type_bytes.copy_from_slice(&raw[0..16]);
        let type_guid = Guid::from_bytes(type_bytes);
        if type_guid.is_nil() {
            continue;
        }

        let mut unique_bytes = [0u8; 16];
        unique_bytes.copy_from_slice(&raw[16..32]);
        let first_lba = u64_at(raw, 32);
        let last_lba = u64_at(raw, 40);
        if last_lba < first_lba {
            log::warn!("GPT entry {} ends before it starts, skipped", id);
            continue;
        }
        let Some(size) = (last_lba - first_lba)
            .checked_add(1)
            .and_then(|sectors| sectors.checked_mul(sector_size as u64))
        else {
            log::warn!(
                "GPT entry {} spans LBA {}..={}, size overflows, skipped",
                id,
                first_lba,
                last_lba
            );
            continue;
        };

        table.set(
            id,
            PartitionEntry {
                offset: first_lba,
                size,
                kind: PartitionKind::Gpt {
                    type_guid,
                    unique_guid: Guid::from_bytes(unique_bytes),
                    name: parse_name(&raw[56..128]),
                },
            },
        );
    }

    table
}

/// Read and validate the primary GPT of an open device.
///
/// Any structural problem (signature, sizes, either CRC) is reported as
/// an error so the caller can fall back to MBR.
pub fn parse_gpt(device: &dyn PhysicalDevice, sector_size: u32) -> Result<PartitionTable> {
    let mut sector = vec![0u8; sector_size as usize];
    let moved = device.read_sectors(gpt_layout::HEADER_LBA, 1, &mut sector)?;
    if moved != 1 {
        return Err(Error::ShortTransfer {
            expected: 1,
            actual: moved,
        });
    }
    let header = parse_header(&sector)?;

    let array_len = header.entry_count as u64 * header.entry_size as u64;
    if array_len == 0 || array_len > gpt_layout::MAX_ARRAY_BYTES {
        return Err(invalid(format!("bad GPT entry array size {}", array_len)));
    }
    let ss = sector_size as u64;
    let array_sectors = array_len.div_ceil(ss);
    let mut array = vec![0u8; (array_sectors * ss) as usize];
    let moved = device.read_sectors(header.entries_lba, array_sectors, &mut array)?;
    if moved != array_sectors {
        return Err(Error::ShortTransfer {
            expected: array_sectors,
            actual: moved,
        });
    }
    array.truncate(array_len as usize);

    let crc = crc32fast::hash(&array);
    if crc != header.entries_crc {
        return Err(invalid(format!(
            "GPT entry array CRC mismatch: stored {:08X}, computed {:08X}",
            header.entries_crc, crc
        )));
    }

    Ok(parse_entries(&array, &header, sector_size))
}
