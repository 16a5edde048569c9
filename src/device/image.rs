//! Disk image and raw block device access.
//!
//! Regular files are treated as disk images with a caller-chosen sector
//! size. On Linux, block device nodes report their own geometry through
//! the `BLK*` ioctls.

use crate::device::{DeviceGeometry, PhysicalDevice};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::{Path, PathBuf};

struct OpenState {
    file: Option<File>,
    refs: usize,
}

/// Physical device backed by an image file or a raw block device node.
pub struct ImageDevice {
    path: PathBuf,
    name: String,
    /// Sector size used when the backing file is a plain image.
    image_sector_size: u32,
    writable: bool,
    state: Mutex<OpenState>,
}

impl ImageDevice {
    /// Describe a read/write device at `path`. Nothing is opened yet.
    pub fn new(path: &Path, sector_size: u32) -> Result<Self> {
        Self::with_mode(path, sector_size, true)
    }

    /// Describe a read-only device at `path`.
    pub fn read_only(path: &Path, sector_size: u32) -> Result<Self> {
        Self::with_mode(path, sector_size, false)
    }

    fn with_mode(path: &Path, sector_size: u32, writable: bool) -> Result<Self> {
        if sector_size == 0 {
            return Err(Error::InvalidGeometry(
                "sector size must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            name: path.display().to_string(),
            image_sector_size: sector_size,
            writable,
            state: Mutex::new(OpenState {
                file: None,
                refs: 0,
            }),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(self.writable)
            .open(&self.path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    Error::PermissionDenied(format!(
                        "Cannot open block device {}. Try running with sudo.",
                        self.path.display()
                    ))
                } else {
                    Error::DeviceOpen {
                        device: self.name.clone(),
                        reason: e.to_string(),
                    }
                }
            })
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> Result<T>) -> Result<T> {
        let state = self.state.lock();
        match state.file.as_ref() {
            Some(file) => f(file),
            None => Err(Error::ProtocolViolation(format!(
                "device {} used while closed",
                self.name
            ))),
        }
    }

    fn file_geometry(&self, file: &File) -> Result<DeviceGeometry> {
        let meta = file.metadata()?;
        if meta.file_type().is_block_device() {
            return block_device_geometry(file);
        }
        let sector_size = self.image_sector_size;
        Ok(DeviceGeometry {
            sector_size,
            sector_count: meta.len() / sector_size as u64,
            block_size: sector_size,
        })
    }

    /// Clamp a request to the sectors that exist on the device.
    fn clamp(&self, geometry: &DeviceGeometry, sector: u64, count: u64) -> u64 {
        if sector >= geometry.sector_count {
            0
        } else {
            count.min(geometry.sector_count - sector)
        }
    }
}

fn check_buffer(len: usize, count: u64, sector_size: u32) -> Result<usize> {
    let needed = count
        .checked_mul(sector_size as u64)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or(Error::InvalidBuffer {
            expected: usize::MAX,
            actual: len,
        })?;
    if len < needed {
        return Err(Error::InvalidBuffer {
            expected: needed,
            actual: len,
        });
    }
    Ok(needed)
}

impl PhysicalDevice for ImageDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.file.is_none() {
            state.file = Some(self.open_file()?);
            log::debug!("opened device {}", self.name);
        }
        state.refs += 1;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.refs == 0 {
            return Err(Error::ProtocolViolation(format!(
                "close of unopened device {}",
                self.name
            )));
        }
        state.refs -= 1;
        if state.refs == 0 {
            state.file = None;
            log::debug!("closed device {}", self.name);
        }
        Ok(())
    }

    fn geometry(&self) -> Result<DeviceGeometry> {
        self.with_file(|file| self.file_geometry(file))
    }

    fn read_sectors(&self, sector: u64, count: u64, buf: &mut [u8]) -> Result<u64> {
        self.with_file(|file| {
            let geometry = self.file_geometry(file)?;
            check_buffer(buf.len(), count, geometry.sector_size)?;
            let available = self.clamp(&geometry, sector, count);
            let ss = geometry.sector_size as u64;
            let len = (available * ss) as usize;

            let mut done = 0usize;
            while done < len {
                let n = file.read_at(&mut buf[done..len], sector * ss + done as u64)?;
                if n == 0 {
                    break;
                }
                done += n;
            }
            Ok(done as u64 / ss)
        })
    }

    fn write_sectors(&self, sector: u64, count: u64, buf: &[u8]) -> Result<u64> {
        if !self.writable {
            return Err(Error::PermissionDenied(format!(
                "Device {} not opened for writing",
                self.name
            )));
        }
        self.with_file(|file| {
            let geometry = self.file_geometry(file)?;
            check_buffer(buf.len(), count, geometry.sector_size)?;
            let available = self.clamp(&geometry, sector, count);
            let ss = geometry.sector_size as u64;
            let len = (available * ss) as usize;

            file.write_all_at(&buf[..len], sector * ss)?;
            Ok(available)
        })
    }
}

#[cfg(target_os = "linux")]
fn block_device_geometry(file: &File) -> Result<DeviceGeometry> {
    use std::os::unix::io::AsRawFd;

    const BLKSSZGET: libc::c_ulong = 0x1268;
    const BLKPBSZGET: libc::c_ulong = 0x127b;
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let fd = file.as_raw_fd();
    let mut sector_size: libc::c_int = 0;
    let mut block_size: libc::c_uint = 0;
    let mut bytes: u64 = 0;

    // SAFETY: `fd` is a valid open descriptor for the lifetime of `file`
    // and every out-pointer matches the size the kernel writes for that
    // request.
    unsafe {
        if libc::ioctl(fd, BLKSSZGET as _, &mut sector_size) < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        if libc::ioctl(fd, BLKPBSZGET as _, &mut block_size) < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        if libc::ioctl(fd, BLKGETSIZE64 as _, &mut bytes) < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }

    if sector_size <= 0 {
        return Err(Error::InvalidGeometry(format!(
            "device reported sector size {}",
            sector_size
        )));
    }
    let sector_size = sector_size as u32;
    Ok(DeviceGeometry {
        sector_size,
        sector_count: bytes / sector_size as u64,
        block_size: block_size.max(sector_size),
    })
}

#[cfg(not(target_os = "linux"))]
fn block_device_geometry(_file: &File) -> Result<DeviceGeometry> {
    Err(Error::Unsupported(
        "Raw block device geometry is only available on Linux".to_string(),
    ))
}
