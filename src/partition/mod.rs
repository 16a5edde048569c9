//! Partition discovery.
//!
//! Exactly one partitioning scheme is active for a physical device at a
//! time: GPT (up to 128 entries), MBR (up to 4 entries) or none at all.
//!
//! ```text
//! scan(device) ── GPT header valid? ── yes ──> Gpt(table)
//!                        │ no
//!                        └─ MBR signature? ── yes ──> Mbr(table)
//!                                  │ no
//!                                  └──> None (whole device)
//! ```

mod gpt;
mod mbr;
mod resolver;
mod scanner;

#[cfg(test)]
pub(crate) mod fixtures;

use crate::config::{GPT_CAPACITY, MBR_CAPACITY};
use serde::Serialize;

pub use gpt::{parse_gpt, Guid};
pub use mbr::parse_mbr;
pub use resolver::resolve;
pub use scanner::{scan, PartitionScanner, ScanState};

/// Location of a partition on its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionExtent {
    /// First sector of the partition.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
}

/// What the partition table says about an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PartitionKind {
    /// Unused slot.
    Empty,
    /// Legacy MBR primary partition.
    Mbr { system_id: u8, bootable: bool },
    /// GPT partition.
    Gpt {
        type_guid: Guid,
        unique_guid: Guid,
        name: String,
    },
}

/// One slot of a partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionEntry {
    /// First sector of the partition.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
    /// Scheme-specific description.
    pub kind: PartitionKind,
}

impl PartitionEntry {
    /// An unused slot.
    pub fn empty() -> Self {
        Self {
            offset: 0,
            size: 0,
            kind: PartitionKind::Empty,
        }
    }

    /// Whether the slot holds no partition.
    pub fn is_empty(&self) -> bool {
        self.kind == PartitionKind::Empty
    }

    /// Offset and size only.
    pub fn extent(&self) -> PartitionExtent {
        PartitionExtent {
            offset: self.offset,
            size: self.size,
        }
    }
}

/// Fixed-capacity table of partition entries, indexed by partition id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTable {
    entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// A table of `capacity` empty entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: vec![PartitionEntry::empty(); capacity],
        }
    }

    /// Store `entry` at slot `id`. Ids past the capacity are ignored.
    pub fn set(&mut self, id: usize, entry: PartitionEntry) -> bool {
        match self.entries.get_mut(id) {
            Some(slot) => {
                *slot = entry;
                true
            }
            None => false,
        }
    }

    /// Entry at slot `id`.
    pub fn get(&self, id: usize) -> Option<&PartitionEntry> {
        self.entries.get(id)
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// All slots, including empty ones.
    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    /// `(id, entry)` for every populated slot.
    pub fn populated(&self) -> impl Iterator<Item = (usize, &PartitionEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| !e.is_empty())
    }
}

/// Result of scanning a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scheme", content = "table", rename_all = "lowercase")]
pub enum PartitionScheme {
    /// GUID partition table.
    Gpt(PartitionTable),
    /// Legacy master boot record.
    Mbr(PartitionTable),
    /// No recognised partition table; only whole-device addressing.
    None,
}

impl PartitionScheme {
    /// Partition ids the scheme can address (128, 4 or 0).
    pub fn capacity(&self) -> usize {
        match self {
            PartitionScheme::Gpt(_) => GPT_CAPACITY,
            PartitionScheme::Mbr(_) => MBR_CAPACITY,
            PartitionScheme::None => 0,
        }
    }

    /// The partition table, if any.
    pub fn table(&self) -> Option<&PartitionTable> {
        match self {
            PartitionScheme::Gpt(table) | PartitionScheme::Mbr(table) => Some(table),
            PartitionScheme::None => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            PartitionScheme::Gpt(_) => "gpt",
            PartitionScheme::Mbr(_) => "mbr",
            PartitionScheme::None => "none",
        }
    }
}
