//! Interfaces to the filesystem engine.
//!
//! The engine itself (inode layout, journaling, extent trees, path
//! resolution inside a mount) is an external collaborator. blockmux only
//! needs the surface below: block device registration, mount lifecycle,
//! superblock statistics and file/directory handles.

use crate::blockdev::VirtualBlockDevice;
use crate::config::MkfsOptions;
use crate::error::Result;
use crate::sync::BlockingLock;
use serde::Serialize;
use std::sync::Arc;

/// Block device callbacks the engine drives.
///
/// Block ids are in logical blocks of [`block_size`](Self::block_size)
/// and address the physical device absolutely; engines add the
/// partition start reported by [`descriptor`](Self::descriptor).
pub trait BlockDeviceHooks: Send + Sync {
    /// Logical block size of the device.
    fn block_size(&self) -> u32;

    /// Current descriptor: partition extent and negotiated geometry.
    fn descriptor(&self) -> Result<VirtualBlockDevice>;

    /// Open the backing device.
    fn open(&self) -> Result<()>;

    /// Read `blk_cnt` blocks starting at `blk_id`.
    fn read(&self, blk_id: u64, blk_cnt: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `blk_cnt` blocks starting at `blk_id`.
    fn write(&self, blk_id: u64, blk_cnt: u32, buf: &[u8]) -> Result<()>;

    /// Close the backing device.
    fn close(&self) -> Result<()>;

    /// Serialize raw I/O against other volumes on the same device.
    fn lock(&self) -> Result<()>;

    /// Counterpart of [`lock`](Self::lock).
    fn unlock(&self) -> Result<()>;
}

/// Lock the engine holds around its own metadata operations on a mount.
pub trait MountLock: Send + Sync {
    /// Block until held.
    fn lock(&self);

    /// Release.
    fn unlock(&self);
}

impl MountLock for BlockingLock {
    fn lock(&self) {
        self.acquire();
    }

    fn unlock(&self) {
        if let Err(e) = self.release() {
            log::error!("mount lock {}: {}", self.name(), e);
        }
    }
}

/// Superblock statistics of a mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsStats {
    /// Filesystem block size in bytes.
    pub block_size: u32,
    /// Total blocks.
    pub total_blocks: u64,
    /// Free blocks.
    pub free_blocks: u64,
}

/// Type of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    Directory,
    Regular,
}

/// One entry returned while iterating a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// The filesystem engine collaborator.
pub trait FilesystemEngine: Send + Sync {
    /// Open file handle.
    type File: Send;
    /// Open directory handle.
    type Dir: Send;

    /// Make `device` known to the engine under `name`.
    fn register_device(&self, name: &str, device: Arc<dyn BlockDeviceHooks>) -> Result<()>;

    /// Forget the device registered under `name`.
    fn unregister_device(&self, name: &str) -> Result<()>;

    /// Mount the registered device `name` at `mount_point`.
    fn mount(&self, name: &str, mount_point: &str, read_only: bool) -> Result<()>;

    /// Unmount `mount_point`.
    fn umount(&self, mount_point: &str) -> Result<()>;

    /// Install the lock the engine takes around metadata operations.
    fn setup_locks(&self, mount_point: &str, lock: Arc<dyn MountLock>) -> Result<()>;

    /// Create a fresh filesystem on `device`.
    fn mkfs(&self, device: Arc<dyn BlockDeviceHooks>, options: &MkfsOptions) -> Result<()>;

    /// Superblock statistics of the filesystem mounted at `mount_point`.
    fn superblock_stats(&self, mount_point: &str) -> Result<FsStats>;

    /// Write back cached blocks of the mount containing `path`.
    fn cache_flush(&self, path: &str) -> Result<()>;

    /// Open a file with POSIX `flags`.
    fn file_open(&self, path: &str, flags: i32) -> Result<Self::File>;

    /// Close a file.
    fn file_close(&self, file: Self::File) -> Result<()>;

    /// Read at the file position.
    fn file_read(&self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize>;

    /// Write at the file position.
    fn file_write(&self, file: &mut Self::File, buf: &[u8]) -> Result<usize>;

    /// Move the file position to `offset` from the start.
    fn file_seek(&self, file: &mut Self::File, offset: u64) -> Result<u64>;

    /// Current file size.
    fn file_size(&self, file: &Self::File) -> u64;

    /// Remove a regular file.
    fn file_remove(&self, path: &str) -> Result<()>;

    /// Rename a file or directory.
    fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;

    /// Mode bits of `path`.
    fn mode(&self, path: &str) -> Result<u32>;

    /// Create a directory.
    fn dir_make(&self, path: &str) -> Result<()>;

    /// Open a directory for iteration.
    fn dir_open(&self, path: &str) -> Result<Self::Dir>;

    /// Close a directory.
    fn dir_close(&self, dir: Self::Dir) -> Result<()>;

    /// Remove a directory and its contents.
    fn dir_remove(&self, path: &str) -> Result<()>;

    /// Next entry, or `None` at the end.
    fn dir_next(&self, dir: &mut Self::Dir) -> Option<DirEntry>;

    /// Size recorded in the directory inode.
    fn dir_size(&self, dir: &Self::Dir) -> u64;
}
