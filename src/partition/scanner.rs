//! Partition table scanner with a per-device result cache.

use crate::config::mbr_layout;
use crate::device::PhysicalDevice;
use crate::error::{Error, Result};
use crate::partition::{parse_gpt, parse_mbr, PartitionScheme};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Scan state of one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    /// Not scanned since creation or the last reset.
    Unscanned,
    /// Scanned; the result holds until reset.
    Scanned(Arc<PartitionScheme>),
}

/// Detect the partitioning scheme of `device`.
///
/// GPT is tried first: a GPT disk also carries a protective MBR that
/// would otherwise read as one legacy partition spanning the disk. Scan
/// failures never surface; an unreadable or blank device scans as
/// [`PartitionScheme::None`].
pub fn scan(device: &dyn PhysicalDevice) -> PartitionScheme {
    if let Err(e) = device.open() {
        log::warn!("{}: cannot open for partition scan: {}", device.name(), e);
        return PartitionScheme::None;
    }

    let scheme = scan_open(device);

    if let Err(e) = device.close() {
        log::warn!("{}: close after partition scan: {}", device.name(), e);
    }
    log::debug!("{}: partition scheme {}", device.name(), scheme.name());
    scheme
}

fn scan_open(device: &dyn PhysicalDevice) -> PartitionScheme {
    let sector_size = match device.geometry() {
        Ok(geometry) => geometry.sector_size,
        Err(e) => {
            log::warn!("{}: no geometry for partition scan: {}", device.name(), e);
            return PartitionScheme::None;
        }
    };
    if sector_size == 0 {
        return PartitionScheme::None;
    }

    match parse_gpt(device, sector_size) {
        Ok(table) => return PartitionScheme::Gpt(table),
        Err(e) => log::debug!("{}: GPT scan failed: {}", device.name(), e),
    }

    match read_boot_sector(device, sector_size).and_then(|s| parse_mbr(&s, sector_size)) {
        Ok(table) => PartitionScheme::Mbr(table),
        Err(e) => {
            log::debug!("{}: MBR scan failed: {}", device.name(), e);
            PartitionScheme::None
        }
    }
}

fn read_boot_sector(device: &dyn PhysicalDevice, sector_size: u32) -> Result<Vec<u8>> {
    let count = (mbr_layout::SECTOR_LEN as u64).div_ceil(sector_size as u64);
    let mut buf = vec![0u8; (count * sector_size as u64) as usize];
    let moved = device.read_sectors(0, count, &mut buf)?;
    if moved != count {
        return Err(Error::ShortTransfer {
            expected: count,
            actual: moved,
        });
    }
    Ok(buf)
}

/// Caches one scan result per physical device name.
///
/// A device is scanned at most once per mount cycle; unmount resets it
/// so the next mount sees a freshly written table.
#[derive(Debug, Default)]
pub struct PartitionScanner {
    cache: Mutex<HashMap<String, Arc<PartitionScheme>>>,
}

impl PartitionScanner {
    /// Create an empty scanner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached scheme for `device`, scanning it on first use.
    pub fn scan(&self, device: &dyn PhysicalDevice) -> Arc<PartitionScheme> {
        let mut cache = self.cache.lock();
        if let Some(scheme) = cache.get(device.name()) {
            return Arc::clone(scheme);
        }
        let scheme = Arc::new(scan(device));
        cache.insert(device.name().to_string(), Arc::clone(&scheme));
        scheme
    }

    /// Current state for the device called `name`.
    pub fn state(&self, name: &str) -> ScanState {
        match self.cache.lock().get(name) {
            Some(scheme) => ScanState::Scanned(Arc::clone(scheme)),
            None => ScanState::Unscanned,
        }
    }

    /// Forget the scan result for `name`.
    pub fn reset(&self, name: &str) {
        if self.cache.lock().remove(name).is_some() {
            log::debug!("{}: partition scan reset", name);
        }
    }
}
