//! blockmux: block device multiplexing for an ext4-style filesystem engine.
//!
//! Lets a filesystem engine that issues I/O in fixed logical blocks mount
//! up to four volumes at once, each on its own physical device and
//! partition.
//!
//! # Features
//!
//! - **Partition discovery**: GPT (128 entries), MBR (4 entries) or none
//! - **Geometry adapter**: logical blocks scaled onto physical sectors
//! - **Slot registry**: per-volume device binding with optional I/O locking
//! - **Mount orchestration**: mount, unmount, mkfs and statfs over the engine
//! - **VFS glue**: descriptors over the engine's file and directory handles
//!
//! # Architecture
//!
//! ```text
//! engine ──hooks──> SlotDevice ──> Registry[slot] ──> geometry ──> PhysicalDevice
//!                                       ▲
//! VolumeManager ── scan / resolve ──────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use blockmux::device::ImageDevice;
//! use blockmux::partition::{resolve, scan};
//! use std::path::Path;
//!
//! let disk = ImageDevice::new(Path::new("disk.img"), 512).unwrap();
//! let scheme = scan(&disk);
//! let extent = resolve(0, &scheme).unwrap();
//! println!("partition 0 starts at sector {}", extent.offset);
//! ```

pub mod blockdev;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod partition;
pub mod registry;
pub mod sync;
pub mod vfs;
pub mod volume;

pub use config::{ManagerConfig, MkfsOptions};
pub use engine::{BlockDeviceHooks, FilesystemEngine, FsStats};
pub use error::{Error, ErrorKind, Result};
pub use registry::{Registry, SlotIndex};
pub use vfs::ExtVfs;
pub use volume::{MountInfo, VolumeManager};
