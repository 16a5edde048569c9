//! Physical block devices.
//!
//! A physical device is owned by whoever created it; the registry and
//! the scanner only hold shared references while a volume uses it.

mod image;
mod memory;

use crate::error::Result;
use serde::Serialize;

pub use image::ImageDevice;
pub use memory::{MemoryDevice, TransferStats};

/// Geometry reported by a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceGeometry {
    /// Native sector size in bytes.
    pub sector_size: u32,
    /// Total number of sectors.
    pub sector_count: u64,
    /// Minimum addressable block size in bytes.
    pub block_size: u32,
}

impl DeviceGeometry {
    /// Total capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.sector_count * self.sector_size as u64
    }
}

/// A raw block device addressed in native sectors.
///
/// `open`/`close` are reference counted: opening an already open device
/// succeeds, and the device stays open until every opener has closed it.
pub trait PhysicalDevice: Send + Sync {
    /// Identifier of the device (e.g. `sd0` or an image path).
    fn name(&self) -> &str;

    /// Open the device for reading and writing.
    fn open(&self) -> Result<()>;

    /// Drop one open reference.
    fn close(&self) -> Result<()>;

    /// Query sector size, sector count and block size.
    fn geometry(&self) -> Result<DeviceGeometry>;

    /// Read `count` sectors starting at `sector` into `buf`.
    ///
    /// Returns the number of sectors actually transferred, which is short
    /// when the request runs past the end of the device.
    fn read_sectors(&self, sector: u64, count: u64, buf: &mut [u8]) -> Result<u64>;

    /// Write `count` sectors starting at `sector` from `buf`.
    ///
    /// Returns the number of sectors actually transferred.
    fn write_sectors(&self, sector: u64, count: u64, buf: &[u8]) -> Result<u64>;
}

impl std::fmt::Debug for dyn PhysicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PhysicalDevice({})", self.name())
    }
}
