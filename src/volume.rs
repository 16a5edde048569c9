//! Volume manager: mount orchestration over the registry, the partition
//! scanner and the filesystem engine.
//!
//! ```text
//! mount(dev, part, "/mnt/sd")
//!   -> scanner.scan(dev)            (cached per device)
//!   -> resolve(part, scheme)        (out of range -> whole device)
//!   -> registry.allocate_slot()
//!   -> registry.bind(slot, dev, descriptor)
//!   -> engine.register_device + engine.mount
//! ```
//!
//! Any failure unwinds everything acquired so far before the error is
//! returned.

use crate::blockdev::VirtualBlockDevice;
use crate::config::{ManagerConfig, MkfsOptions};
use crate::device::PhysicalDevice;
use crate::engine::{BlockDeviceHooks, FilesystemEngine, FsStats};
use crate::error::{Error, Result};
use crate::partition::{resolve, PartitionExtent, PartitionScanner};
use crate::registry::{Registry, SlotDevice, SlotIndex};
use crate::sync::BlockingLock;
use crate::vfs::MountPoint;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Public description of an active mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    /// Mount point as given to the engine (trailing slash).
    pub mount_point: String,
    /// Physical device name.
    pub device: String,
    /// Partition id requested at mount time.
    pub partition_id: u32,
    /// Registry slot serving the volume.
    pub slot: SlotIndex,
    /// Partitioning scheme found on the device.
    pub scheme: &'static str,
    /// Whether the partition id fell back to whole-device addressing.
    pub whole_device: bool,
}

struct MountRecord {
    info: MountInfo,
    /// Resolved extent; `None` when the whole device is mounted.
    extent: Option<PartitionExtent>,
    registration: String,
    /// Per-mount lock handed to the engine; dropped with the mount.
    _lock: Option<Arc<BlockingLock>>,
}

/// Owns the registry, the scan cache and the mount table.
pub struct VolumeManager<E: FilesystemEngine> {
    engine: Arc<E>,
    config: ManagerConfig,
    registry: Arc<Registry>,
    scanner: PartitionScanner,
    mounts: Mutex<HashMap<String, MountRecord>>,
}

fn registration_name(device: &str, slot: SlotIndex) -> String {
    format!("{}#{}", device, slot.index())
}

/// Where a mount request landed on its device.
struct Placement {
    desc: VirtualBlockDevice,
    extent: Option<PartitionExtent>,
    scheme: &'static str,
}

impl MountRecord {
    /// Whether this mount already covers `extent` of `device`. The whole
    /// device overlaps every partition on it.
    fn covers(&self, device: &str, extent: Option<PartitionExtent>) -> bool {
        self.info.device == device
            && match (self.extent, extent) {
                (Some(mounted), Some(wanted)) => mounted == wanted,
                _ => true,
            }
    }
}

impl<E: FilesystemEngine> VolumeManager<E> {
    /// Create a manager driving `engine`.
    pub fn new(engine: Arc<E>, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::new(&config));
        Ok(Self {
            engine,
            config,
            registry,
            scanner: PartitionScanner::new(),
            mounts: Mutex::new(HashMap::new()),
        })
    }

    /// The filesystem engine.
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// The slot registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The partition scan cache.
    pub fn scanner(&self) -> &PartitionScanner {
        &self.scanner
    }

    /// Active configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Mount partition `partition_id` of `device` at `mount_point`.
    pub fn mount(
        &self,
        device: Arc<dyn PhysicalDevice>,
        partition_id: u32,
        mount_point: &str,
    ) -> Result<SlotIndex> {
        let mp = MountPoint::parse(mount_point)?;
        let key = mp.engine_key();

        let mut mounts = self.mounts.lock();
        if mounts.contains_key(&key) {
            return Err(Error::Busy(format!("{} already mounted", mp)));
        }

        let placement = match self.place(device.as_ref(), partition_id) {
            Ok(placement) => placement,
            Err(e) => {
                self.scanner.reset(device.name());
                return Err(e);
            }
        };
        if let Some(other) = mounts
            .values()
            .find(|m| m.covers(device.name(), placement.extent))
        {
            return Err(Error::Busy(format!(
                "{} partition {} already mounted at {}",
                device.name(),
                partition_id,
                other.info.mount_point
            )));
        }

        let slot = match self.registry.allocate_slot() {
            Ok(slot) => slot,
            Err(e) => {
                self.scanner.reset(device.name());
                return Err(e);
            }
        };
        match self.mount_in_slot(slot, &device, partition_id, placement, &key) {
            Ok(record) => {
                log::info!(
                    "mounted {} partition {} ({}) at {} via {}",
                    record.info.device,
                    partition_id,
                    record.info.scheme,
                    key,
                    slot
                );
                mounts.insert(key, record);
                Ok(slot)
            }
            Err(e) => {
                log::warn!("mount of {} at {} failed: {}", device.name(), key, e);
                if let Err(release_err) = self.registry.release_slot(slot) {
                    log::error!("{}: release after failed mount: {}", slot, release_err);
                }
                self.scanner.reset(device.name());
                Err(e)
            }
        }
    }

    /// Scan `device` and resolve `partition_id` into a descriptor.
    fn place(&self, device: &dyn PhysicalDevice, partition_id: u32) -> Result<Placement> {
        let scheme = self.scanner.scan(device);

        let mut desc = VirtualBlockDevice::new(self.config.block_size);
        let extent = match resolve(partition_id, &scheme) {
            Ok(extent) => {
                desc.set_partition(extent);
                Some(extent)
            }
            Err(e) if !self.config.strict_partition_ids => {
                log::warn!(
                    "{}: {}; mounting the whole device",
                    device.name(),
                    e
                );
                desc.clear_partition();
                None
            }
            Err(e) => return Err(e),
        };

        Ok(Placement {
            desc,
            extent,
            scheme: scheme.name(),
        })
    }

    fn mount_in_slot(
        &self,
        slot: SlotIndex,
        device: &Arc<dyn PhysicalDevice>,
        partition_id: u32,
        placement: Placement,
        key: &str,
    ) -> Result<MountRecord> {
        self.registry.bind(slot, Arc::clone(device), placement.desc)?;

        let registration = registration_name(device.name(), slot);
        let hooks: Arc<dyn BlockDeviceHooks> = Arc::new(SlotDevice::new(
            Arc::clone(&self.registry),
            slot,
            self.config.block_size,
        ));
        self.engine.register_device(&registration, hooks)?;

        if let Err(e) = self.engine.mount(&registration, key, false) {
            self.unregister_quietly(&registration);
            return Err(e);
        }

        let lock = if self.config.io_locking {
            let lock = Arc::new(BlockingLock::new(format!("mount:{}", key)));
            if let Err(e) = self.engine.setup_locks(key, lock.clone()) {
                if let Err(umount_err) = self.engine.umount(key) {
                    log::error!("{}: umount after lock setup failure: {}", key, umount_err);
                }
                self.unregister_quietly(&registration);
                return Err(e);
            }
            Some(lock)
        } else {
            None
        };

        Ok(MountRecord {
            info: MountInfo {
                mount_point: key.to_string(),
                device: device.name().to_string(),
                partition_id,
                slot,
                scheme: placement.scheme,
                whole_device: placement.extent.is_none(),
            },
            extent: placement.extent,
            registration,
            _lock: lock,
        })
    }

    fn unregister_quietly(&self, registration: &str) {
        if let Err(e) = self.engine.unregister_device(registration) {
            log::warn!("unregister {}: {}", registration, e);
        }
    }

    /// Unmount the volume at `mount_point`.
    pub fn unmount(&self, mount_point: &str) -> Result<()> {
        let key = MountPoint::parse(mount_point)?.engine_key();

        let mut mounts = self.mounts.lock();
        if !mounts.contains_key(&key) {
            return Err(Error::NotMounted(key));
        }
        self.engine.umount(&key)?;

        let Some(record) = mounts.remove(&key) else {
            return Err(Error::NotMounted(key));
        };
        self.unregister_quietly(&record.registration);
        self.registry.release_slot(record.info.slot)?;
        self.scanner.reset(&record.info.device);
        log::info!("unmounted {} from {}", record.info.device, key);
        Ok(())
    }

    /// Create a filesystem on `device`, or on one of its partitions.
    ///
    /// The device must not be mounted. The slot and registration used
    /// for formatting are always released before returning.
    pub fn mkfs(&self, device: Arc<dyn PhysicalDevice>, partition_id: Option<u32>) -> Result<()> {
        let _mounts = self.mounts.lock();
        if !self.registry.slots_for(device.name()).is_empty() {
            return Err(Error::Busy(format!("{} is mounted", device.name())));
        }

        let mut desc = VirtualBlockDevice::new(self.config.block_size);
        if let Some(id) = partition_id {
            let scheme = self.scanner.scan(device.as_ref());
            desc.set_partition(resolve(id, &scheme)?);
        }

        let slot = self.registry.allocate_slot()?;
        let result = self.format_in_slot(slot, &device, desc);

        if let Err(e) = self.registry.release_slot(slot) {
            log::error!("{}: release after mkfs: {}", slot, e);
        }
        self.scanner.reset(device.name());
        match &result {
            Ok(()) => log::info!("created filesystem on {}", device.name()),
            Err(e) => log::warn!("mkfs on {} failed: {}", device.name(), e),
        }
        result
    }

    fn format_in_slot(
        &self,
        slot: SlotIndex,
        device: &Arc<dyn PhysicalDevice>,
        desc: VirtualBlockDevice,
    ) -> Result<()> {
        self.registry.bind(slot, Arc::clone(device), desc)?;

        let registration = registration_name(device.name(), slot);
        let hooks: Arc<dyn BlockDeviceHooks> = Arc::new(SlotDevice::new(
            Arc::clone(&self.registry),
            slot,
            self.config.block_size,
        ));
        self.engine.register_device(&registration, Arc::clone(&hooks))?;

        let options = MkfsOptions {
            block_size: self.config.block_size,
            ..MkfsOptions::default()
        };
        let result = hooks
            .open()
            .and_then(|()| self.engine.mkfs(Arc::clone(&hooks), &options));

        self.unregister_quietly(&registration);
        result
    }

    /// Superblock statistics of the volume at `mount_point`.
    pub fn statfs(&self, mount_point: &str) -> Result<FsStats> {
        let key = MountPoint::parse(mount_point)?.engine_key();
        if !self.mounts.lock().contains_key(&key) {
            return Err(Error::NotMounted(key));
        }
        self.engine.superblock_stats(&key)
    }

    /// All active mounts, ordered by slot.
    pub fn mounts(&self) -> Vec<MountInfo> {
        let mut list: Vec<MountInfo> = self
            .mounts
            .lock()
            .values()
            .map(|m| m.info.clone())
            .collect();
        list.sort_by_key(|m| m.slot.index());
        list
    }

    /// The mount serving `path`, preferring the longest mount point.
    pub fn mount_for(&self, path: &str) -> Option<MountInfo> {
        self.mounts
            .lock()
            .values()
            .filter(|m| {
                MountPoint::parse(&m.info.mount_point)
                    .map(|mp| mp.contains(path))
                    .unwrap_or(false)
            })
            .max_by_key(|m| m.info.mount_point.len())
            .map(|m| m.info.clone())
    }
}
