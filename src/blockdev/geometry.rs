//! Geometry adapter: negotiates sector/block sizes with a physical device
//! and scales logical block I/O into sector I/O.

use crate::blockdev::VirtualBlockDevice;
use crate::device::{DeviceGeometry, PhysicalDevice};
use crate::error::{Error, Result};

/// Open `device` and record its geometry in `desc`.
///
/// An unset partition offset becomes 0 and the partition grows to the
/// whole device. The logical block size must be a whole multiple of the
/// sector size, and a partition must start on a logical block boundary.
/// On failure the device is closed again.
pub fn open(device: &dyn PhysicalDevice, desc: &mut VirtualBlockDevice) -> Result<DeviceGeometry> {
    device.open()?;

    let negotiated = device
        .geometry()
        .and_then(|geometry| negotiate(&geometry, desc).map(|()| geometry));

    match negotiated {
        Ok(geometry) => {
            log::debug!(
                "{}: sector {} x{} blocks of {}, partition @{} sectors, {} bytes",
                device.name(),
                geometry.sector_size,
                desc.ratio,
                desc.block_size,
                desc.part_offset.unwrap_or(0),
                desc.part_size
            );
            Ok(geometry)
        }
        Err(e) => {
            if let Err(close_err) = device.close() {
                log::warn!("{}: close after failed open: {}", device.name(), close_err);
            }
            Err(e)
        }
    }
}

fn negotiate(geometry: &DeviceGeometry, desc: &mut VirtualBlockDevice) -> Result<()> {
    let sector_size = geometry.sector_size;
    if sector_size == 0 {
        return Err(Error::InvalidGeometry(
            "device reported a zero sector size".to_string(),
        ));
    }
    if desc.block_size < sector_size || desc.block_size % sector_size != 0 {
        return Err(Error::InvalidGeometry(format!(
            "block size {} is not a multiple of sector size {}",
            desc.block_size, sector_size
        )));
    }
    let ratio = desc.block_size / sector_size;
    let capacity = geometry.capacity();

    let part_size = match desc.part_offset {
        None => {
            desc.part_offset = Some(0);
            capacity
        }
        Some(offset) => {
            if offset % ratio as u64 != 0 {
                return Err(Error::InvalidGeometry(format!(
                    "partition @{} sectors is not aligned to {}-byte blocks",
                    offset, desc.block_size
                )));
            }
            let end = offset
                .checked_mul(sector_size as u64)
                .and_then(|start| start.checked_add(desc.part_size));
            match end {
                Some(end) if end <= capacity => desc.part_size,
                _ => {
                    return Err(Error::InvalidGeometry(format!(
                        "partition @{} sectors, {} bytes exceeds device capacity {}",
                        offset, desc.part_size, capacity
                    )))
                }
            }
        }
    };

    desc.record_open(sector_size, ratio, part_size);
    Ok(())
}

fn check_transfer(moved: u64, expected: u64, device: &dyn PhysicalDevice, op: &str) -> Result<()> {
    if moved != expected {
        log::error!(
            "{}: {} moved {} of {} sectors",
            device.name(),
            op,
            moved,
            expected
        );
        return Err(Error::ShortTransfer {
            expected,
            actual: moved,
        });
    }
    Ok(())
}

fn check_buffer(desc: &VirtualBlockDevice, blk_cnt: u32, len: usize) -> Result<()> {
    let expected = desc.transfer_len(blk_cnt);
    if len != expected {
        return Err(Error::InvalidBuffer {
            expected,
            actual: len,
        });
    }
    Ok(())
}

/// Read `blk_cnt` logical blocks starting at `blk_id`.
pub fn read(
    device: &dyn PhysicalDevice,
    desc: &VirtualBlockDevice,
    blk_id: u64,
    blk_cnt: u32,
    buf: &mut [u8],
) -> Result<()> {
    check_buffer(desc, blk_cnt, buf.len())?;
    let (sector, count) = desc.scale(blk_id, blk_cnt)?;
    let moved = device.read_sectors(sector, count, buf)?;
    check_transfer(moved, count, device, "read")
}

/// Write `blk_cnt` logical blocks starting at `blk_id`.
pub fn write(
    device: &dyn PhysicalDevice,
    desc: &VirtualBlockDevice,
    blk_id: u64,
    blk_cnt: u32,
    buf: &[u8],
) -> Result<()> {
    check_buffer(desc, blk_cnt, buf.len())?;
    let (sector, count) = desc.scale(blk_id, blk_cnt)?;
    let moved = device.write_sectors(sector, count, buf)?;
    check_transfer(moved, count, device, "write")
}

/// Close `device` and forget the negotiated geometry.
pub fn close(device: &dyn PhysicalDevice, desc: &mut VirtualBlockDevice) -> Result<()> {
    desc.record_close();
    device.close()
}
