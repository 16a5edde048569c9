//! Virtual block device multiplexer.
//!
//! A fixed table of [`MAX_VOLUMES`] slots binds each mounted volume to its
//! physical device and negotiated geometry. The filesystem engine talks
//! to a slot through [`SlotDevice`], which forwards every block callback
//! to the registry so each volume addresses its own device.

use crate::blockdev::{geometry, VirtualBlockDevice};
use crate::config::{ManagerConfig, MAX_VOLUMES};
use crate::device::{DeviceGeometry, PhysicalDevice};
use crate::engine::BlockDeviceHooks;
use crate::error::{Error, Result};
use crate::sync::BlockingLock;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Index of a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotIndex(usize);

impl SlotIndex {
    /// Wrap a raw index. Out-of-range indices are rejected on use.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Raw index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

struct Binding {
    device: Arc<dyn PhysicalDevice>,
    desc: VirtualBlockDevice,
    geometry: Option<DeviceGeometry>,
}

enum Slot {
    Free,
    /// Handed out by `allocate_slot`, no device yet.
    Reserved,
    Bound(Binding),
}

/// Fixed-capacity table of mounted volumes.
pub struct Registry {
    slots: Mutex<[Slot; MAX_VOLUMES]>,
    /// Driver-level I/O locks, one per physical device name. Slots on
    /// the same device share a lock; other devices proceed in parallel.
    device_locks: Mutex<HashMap<String, Arc<BlockingLock>>>,
    io_locking: bool,
    max_transfer_blocks: u32,
}

fn violation(slot: SlotIndex, what: &str) -> Error {
    log::error!("{}: {}", slot, what);
    Error::ProtocolViolation(format!("{}: {}", slot, what))
}

impl Registry {
    /// Create an empty registry.
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| Slot::Free)),
            device_locks: Mutex::new(HashMap::new()),
            io_locking: config.io_locking,
            max_transfer_blocks: config.max_transfer_blocks,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        MAX_VOLUMES
    }

    /// Number of slots not free.
    pub fn occupied(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| !matches!(s, Slot::Free))
            .count()
    }

    /// Reserve the first free slot.
    pub fn allocate_slot(&self) -> Result<SlotIndex> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|s| matches!(s, Slot::Free))
            .ok_or(Error::NoFreeSlot {
                capacity: MAX_VOLUMES,
            })?;
        slots[index] = Slot::Reserved;
        log::debug!("allocated slot{}", index);
        Ok(SlotIndex(index))
    }

    /// Attach `device` and its descriptor to a reserved slot.
    pub fn bind(
        &self,
        slot: SlotIndex,
        device: Arc<dyn PhysicalDevice>,
        desc: VirtualBlockDevice,
    ) -> Result<()> {
        let mut slots = self.slots.lock();
        let entry = slots
            .get_mut(slot.0)
            .ok_or_else(|| violation(slot, "index out of range"))?;
        if !matches!(entry, Slot::Reserved) {
            return Err(violation(slot, "bind on a slot that was not reserved"));
        }
        log::debug!("{} bound to {}", slot, device.name());
        *entry = Slot::Bound(Binding {
            device,
            desc,
            geometry: None,
        });
        Ok(())
    }

    fn with_binding<T>(&self, slot: SlotIndex, f: impl FnOnce(&mut Binding) -> Result<T>) -> Result<T> {
        let mut slots = self.slots.lock();
        match slots.get_mut(slot.0) {
            Some(Slot::Bound(binding)) => f(binding),
            Some(_) => Err(violation(slot, "no device assigned")),
            None => Err(violation(slot, "index out of range")),
        }
    }

    /// Open the slot's device and negotiate geometry. Opening an open
    /// slot returns the recorded geometry.
    pub fn open(&self, slot: SlotIndex) -> Result<DeviceGeometry> {
        let (device, mut desc, ready) = self.with_binding(slot, |b| {
            Ok((Arc::clone(&b.device), b.desc.clone(), b.geometry))
        })?;
        if let Some(geometry) = ready {
            return Ok(geometry);
        }

        // The physical open may block; it runs without the table lock.
        let negotiated = geometry::open(device.as_ref(), &mut desc)?;
        let stored = self.with_binding(slot, |b| {
            if !Arc::ptr_eq(&b.device, &device) {
                return Err(violation(slot, "rebound while opening"));
            }
            match b.geometry {
                Some(existing) => Ok((existing, false)),
                None => {
                    b.desc = desc.clone();
                    b.geometry = Some(negotiated);
                    Ok((negotiated, true))
                }
            }
        });

        match stored {
            Ok((geometry, true)) => Ok(geometry),
            Ok((geometry, false)) => {
                // A concurrent open won; drop the extra device reference.
                log::debug!("{}: concurrent open, closing extra reference", slot);
                close_extra(slot, device.as_ref(), &mut desc);
                Ok(geometry)
            }
            Err(e) => {
                // Slot was released while the device was opening.
                close_extra(slot, device.as_ref(), &mut desc);
                Err(e)
            }
        }
    }

    /// Read `blk_cnt` logical blocks of the slot's device into `buf`.
    pub fn read(&self, slot: SlotIndex, blk_id: u64, blk_cnt: u32, buf: &mut [u8]) -> Result<()> {
        let (device, desc) = self.io_target(slot, blk_cnt)?;
        geometry::read(device.as_ref(), &desc, blk_id, blk_cnt, buf)
    }

    /// Write `blk_cnt` logical blocks from `buf` to the slot's device.
    pub fn write(&self, slot: SlotIndex, blk_id: u64, blk_cnt: u32, buf: &[u8]) -> Result<()> {
        let (device, desc) = self.io_target(slot, blk_cnt)?;
        geometry::write(device.as_ref(), &desc, blk_id, blk_cnt, buf)
    }

    /// Snapshot the device and descriptor so I/O runs without the table lock.
    fn io_target(&self, slot: SlotIndex, blk_cnt: u32) -> Result<(Arc<dyn PhysicalDevice>, VirtualBlockDevice)> {
        if blk_cnt > self.max_transfer_blocks {
            return Err(Error::TransferTooLarge {
                requested: blk_cnt,
                max: self.max_transfer_blocks,
            });
        }
        self.with_binding(slot, |b| {
            if b.geometry.is_none() {
                return Err(violation(slot, "block I/O before open"));
            }
            Ok((Arc::clone(&b.device), b.desc.clone()))
        })
    }

    /// Close the slot's device. The binding stays until `release_slot`.
    pub fn close(&self, slot: SlotIndex) -> Result<()> {
        self.with_binding(slot, |b| {
            if b.geometry.take().is_none() {
                return Err(violation(slot, "close without open"));
            }
            geometry::close(b.device.as_ref(), &mut b.desc)
        })
    }

    /// Take the driver-level I/O lock of the slot's device when locking
    /// is enabled. Blocks while another slot on the same device holds it.
    pub fn lock(&self, slot: SlotIndex) -> Result<()> {
        let name = self.with_binding(slot, |b| Ok(b.device.name().to_string()))?;
        if self.io_locking {
            let lock = Arc::clone(self.device_locks.lock().entry(name).or_insert_with_key(|name| {
                Arc::new(BlockingLock::new(format!("blockdev:{}", name)))
            }));
            lock.acquire();
        }
        Ok(())
    }

    /// Release the driver-level I/O lock of the slot's device when
    /// locking is enabled.
    pub fn unlock(&self, slot: SlotIndex) -> Result<()> {
        let name = self.with_binding(slot, |b| Ok(b.device.name().to_string()))?;
        if self.io_locking {
            let lock = self.device_locks.lock().get(&name).cloned();
            match lock {
                Some(lock) => lock.release()?,
                None => return Err(violation(slot, "unlock without lock")),
            }
        }
        Ok(())
    }

    /// Return the slot to the free pool, closing its device if still open.
    pub fn release_slot(&self, slot: SlotIndex) -> Result<()> {
        let mut slots = self.slots.lock();
        let entry = slots
            .get_mut(slot.0)
            .ok_or_else(|| violation(slot, "index out of range"))?;
        if let Slot::Bound(binding) = entry {
            if binding.geometry.take().is_some() {
                log::warn!("{}: released while {} still open", slot, binding.device.name());
                if let Err(e) = geometry::close(binding.device.as_ref(), &mut binding.desc) {
                    log::warn!("{}: close on release: {}", slot, e);
                }
            }
        }
        *entry = Slot::Free;
        log::debug!("released {}", slot);
        Ok(())
    }

    /// Descriptor currently bound to `slot`.
    pub fn descriptor(&self, slot: SlotIndex) -> Result<VirtualBlockDevice> {
        self.with_binding(slot, |b| Ok(b.desc.clone()))
    }

    /// Device currently bound to `slot`.
    pub fn device(&self, slot: SlotIndex) -> Result<Arc<dyn PhysicalDevice>> {
        self.with_binding(slot, |b| Ok(Arc::clone(&b.device)))
    }

    /// Slots bound to the device called `name`.
    pub fn slots_for(&self, name: &str) -> Vec<SlotIndex> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Bound(b) if b.device.name() == name => Some(SlotIndex(i)),
                _ => None,
            })
            .collect()
    }
}

fn close_extra(slot: SlotIndex, device: &dyn PhysicalDevice, desc: &mut VirtualBlockDevice) {
    if let Err(e) = geometry::close(device, desc) {
        log::warn!("{}: close of extra {} reference: {}", slot, device.name(), e);
    }
}

/// Engine-facing block device for one registry slot.
pub struct SlotDevice {
    registry: Arc<Registry>,
    slot: SlotIndex,
    block_size: u32,
}

impl SlotDevice {
    /// Wrap `slot` of `registry`.
    pub fn new(registry: Arc<Registry>, slot: SlotIndex, block_size: u32) -> Self {
        Self {
            registry,
            slot,
            block_size,
        }
    }

    /// The slot this device forwards to.
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }
}

impl BlockDeviceHooks for SlotDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn descriptor(&self) -> Result<VirtualBlockDevice> {
        self.registry.descriptor(self.slot)
    }

    fn open(&self) -> Result<()> {
        self.registry.open(self.slot).map(|_| ())
    }

    fn read(&self, blk_id: u64, blk_cnt: u32, buf: &mut [u8]) -> Result<()> {
        self.registry.read(self.slot, blk_id, blk_cnt, buf)
    }

    fn write(&self, blk_id: u64, blk_cnt: u32, buf: &[u8]) -> Result<()> {
        self.registry.write(self.slot, blk_id, blk_cnt, buf)
    }

    fn close(&self) -> Result<()> {
        self.registry.close(self.slot)
    }

    fn lock(&self) -> Result<()> {
        self.registry.lock(self.slot)
    }

    fn unlock(&self) -> Result<()> {
        self.registry.unlock(self.slot)
    }
}
