//! RAM-backed physical device with fault injection.

use crate::device::{DeviceGeometry, PhysicalDevice};
use crate::error::{Error, Result};
use parking_lot::Mutex;

/// Counters of sector transfers issued against a [`MemoryDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Number of read calls.
    pub reads: u64,
    /// Number of write calls.
    pub writes: u64,
    /// Sectors moved by read calls.
    pub sectors_read: u64,
    /// Sectors moved by write calls.
    pub sectors_written: u64,
    /// `(sector, count)` of the most recent read request.
    pub last_read: Option<(u64, u64)>,
    /// `(sector, count)` of the most recent write request.
    pub last_write: Option<(u64, u64)>,
}

#[derive(Default)]
struct Faults {
    fail_open: bool,
    fail_geometry: bool,
    /// Cap on sectors moved per call; simulates short transfers.
    transfer_limit: Option<u64>,
}

/// A physical device held entirely in memory.
pub struct MemoryDevice {
    name: String,
    geometry: DeviceGeometry,
    data: Mutex<Vec<u8>>,
    refs: Mutex<usize>,
    faults: Mutex<Faults>,
    stats: Mutex<TransferStats>,
}

impl MemoryDevice {
    /// Create a zero-filled device.
    pub fn new(name: &str, sector_size: u32, sector_count: u64) -> Self {
        Self::with_block_size(name, sector_size, sector_count, sector_size)
    }

    /// Create a zero-filled device with a distinct minimum block size.
    pub fn with_block_size(name: &str, sector_size: u32, sector_count: u64, block_size: u32) -> Self {
        let len = sector_count as usize * sector_size as usize;
        Self {
            name: name.to_string(),
            geometry: DeviceGeometry {
                sector_size,
                sector_count,
                block_size,
            },
            data: Mutex::new(vec![0u8; len]),
            refs: Mutex::new(0),
            faults: Mutex::new(Faults::default()),
            stats: Mutex::new(TransferStats::default()),
        }
    }

    /// Create a device whose contents are `image`. Trailing bytes that do
    /// not fill a whole sector are dropped.
    pub fn from_image(name: &str, sector_size: u32, mut image: Vec<u8>) -> Self {
        let sector_count = image.len() as u64 / sector_size as u64;
        image.truncate((sector_count * sector_size as u64) as usize);
        let dev = Self::new(name, sector_size, 0);
        Self {
            geometry: DeviceGeometry {
                sector_count,
                ..dev.geometry
            },
            data: Mutex::new(image),
            ..dev
        }
    }

    /// Make subsequent `open` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.faults.lock().fail_open = fail;
    }

    /// Make subsequent `geometry` calls fail.
    pub fn set_fail_geometry(&self, fail: bool) {
        self.faults.lock().fail_geometry = fail;
    }

    /// Cap the number of sectors any single call transfers.
    pub fn set_transfer_limit(&self, limit: Option<u64>) {
        self.faults.lock().transfer_limit = limit;
    }

    /// Transfer counters since creation or the last reset.
    pub fn stats(&self) -> TransferStats {
        *self.stats.lock()
    }

    /// Zero the transfer counters.
    pub fn reset_stats(&self) {
        *self.stats.lock() = TransferStats::default();
    }

    /// Number of outstanding opens.
    pub fn open_count(&self) -> usize {
        *self.refs.lock()
    }

    /// Copy of the full device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.refs.lock() == 0 {
            return Err(Error::ProtocolViolation(format!(
                "device {} used while closed",
                self.name
            )));
        }
        Ok(())
    }

    /// Work out how many sectors a request will actually move.
    fn plan(&self, sector: u64, count: u64, buf_len: usize) -> Result<(usize, usize)> {
        let ss = self.geometry.sector_size as u64;
        let needed = count
            .checked_mul(ss)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| Error::InvalidArgument(format!("{} sectors overflow a buffer", count)))?;
        if buf_len < needed {
            return Err(Error::InvalidBuffer {
                expected: needed,
                actual: buf_len,
            });
        }
        if sector >= self.geometry.sector_count {
            return Ok((0, 0));
        }
        let mut moved = count.min(self.geometry.sector_count - sector);
        if let Some(limit) = self.faults.lock().transfer_limit {
            moved = moved.min(limit);
        }
        // sector < sector_count, so both products fit the backing buffer
        Ok(((sector * ss) as usize, (moved * ss) as usize))
    }
}

impl PhysicalDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<()> {
        if self.faults.lock().fail_open {
            return Err(Error::DeviceOpen {
                device: self.name.clone(),
                reason: "injected open failure".to_string(),
            });
        }
        *self.refs.lock() += 1;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut refs = self.refs.lock();
        if *refs == 0 {
            return Err(Error::ProtocolViolation(format!(
                "close of unopened device {}",
                self.name
            )));
        }
        *refs -= 1;
        Ok(())
    }

    fn geometry(&self) -> Result<DeviceGeometry> {
        self.ensure_open()?;
        if self.faults.lock().fail_geometry {
            return Err(Error::DeviceOpen {
                device: self.name.clone(),
                reason: "geometry query not supported".to_string(),
            });
        }
        Ok(self.geometry)
    }

    fn read_sectors(&self, sector: u64, count: u64, buf: &mut [u8]) -> Result<u64> {
        self.ensure_open()?;
        let (start, len) = self.plan(sector, count, buf.len())?;
        buf[..len].copy_from_slice(&self.data.lock()[start..start + len]);

        let moved = (len / self.geometry.sector_size as usize) as u64;
        let mut stats = self.stats.lock();
        stats.reads += 1;
        stats.sectors_read += moved;
        stats.last_read = Some((sector, count));
        Ok(moved)
    }

    fn write_sectors(&self, sector: u64, count: u64, buf: &[u8]) -> Result<u64> {
        self.ensure_open()?;
        let (start, len) = self.plan(sector, count, buf.len())?;
        self.data.lock()[start..start + len].copy_from_slice(&buf[..len]);

        let moved = (len / self.geometry.sector_size as usize) as u64;
        let mut stats = self.stats.lock();
        stats.writes += 1;
        stats.sectors_written += moved;
        stats.last_write = Some((sector, count));
        Ok(moved)
    }
}
