//! Shared helpers for integration tests: an in-memory filesystem engine
//! that keeps its superblock on the block device, and disk image builders.

#![allow(dead_code)]

use blockmux::config::MkfsOptions;
use blockmux::engine::{BlockDeviceHooks, DirEntry, EntryKind, FilesystemEngine, FsStats, MountLock};
use blockmux::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const MAGIC: &[u8; 8] = b"MOCKFS01";

/// Superblock stored in the first logical block of the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
}

impl Superblock {
    fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut block = vec![0u8; block_size];
        block[0..8].copy_from_slice(MAGIC);
        block[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        block[12..20].copy_from_slice(&self.total_blocks.to_le_bytes());
        block[20..28].copy_from_slice(&self.free_blocks.to_le_bytes());
        block
    }

    fn decode(block: &[u8]) -> Option<Self> {
        if block.len() < 28 || &block[0..8] != MAGIC {
            return None;
        }
        Some(Self {
            block_size: u32::from_le_bytes(block[8..12].try_into().ok()?),
            total_blocks: u64::from_le_bytes(block[12..20].try_into().ok()?),
            free_blocks: u64::from_le_bytes(block[20..28].try_into().ok()?),
        })
    }
}

fn read_superblock(device: &dyn BlockDeviceHooks) -> Result<Option<Superblock>> {
    let desc = device.descriptor()?;
    let mut block = vec![0u8; device.block_size() as usize];
    device.lock()?;
    let result = device.read(desc.first_block(), 1, &mut block);
    device.unlock()?;
    result?;
    Ok(Superblock::decode(&block))
}

fn write_superblock(device: &dyn BlockDeviceHooks, sb: &Superblock) -> Result<()> {
    let desc = device.descriptor()?;
    let block = sb.encode(device.block_size() as usize);
    device.lock()?;
    let result = device.write(desc.first_block(), 1, &block);
    device.unlock()?;
    result
}

fn engine_err(op: &'static str, code: i32) -> Error {
    Error::Engine { op, code }
}

fn normalise(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

struct Mounted {
    device: Arc<dyn BlockDeviceHooks>,
    superblock: Superblock,
    lock: Option<Arc<dyn MountLock>>,
}

#[derive(Default)]
struct Tree {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
pub struct MockFile {
    path: String,
    pos: u64,
}

#[derive(Debug)]
pub struct MockDir {
    path: String,
    entries: Vec<DirEntry>,
    next: usize,
}

/// Filesystem engine double.
///
/// Mount state and superblocks live on the registered block devices;
/// file contents live in memory.
#[derive(Default)]
pub struct MockEngine {
    devices: Mutex<HashMap<String, Arc<dyn BlockDeviceHooks>>>,
    mounts: Mutex<HashMap<String, Mounted>>,
    tree: Mutex<Tree>,
    flushes: AtomicUsize,
    pub fail_mount: Mutex<bool>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_lock(&self, mount_point: &str) -> bool {
        self.mounts
            .lock()
            .get(mount_point)
            .map(|m| m.lock.is_some())
            .unwrap_or(false)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Mount root that owns `path`.
    fn mount_of(&self, path: &str) -> Result<String> {
        let path = normalise(path);
        self.mounts
            .lock()
            .keys()
            .map(|k| normalise(k))
            .filter(|root| root == "/" || path == *root || path.starts_with(&format!("{}/", root)))
            .max_by_key(|root| root.len())
            .ok_or_else(|| engine_err("lookup", libc::ENOENT))
    }

    fn is_dir(&self, path: &str) -> bool {
        let path = normalise(path);
        let is_root = self
            .mounts
            .lock()
            .keys()
            .any(|k| normalise(k) == path);
        is_root || self.tree.lock().dirs.contains(&path)
    }

    fn with_locked<T>(&self, path: &str, f: impl FnOnce() -> T) -> Result<T> {
        let root = self.mount_of(path)?;
        let lock = self
            .mounts
            .lock()
            .iter()
            .find(|(k, _)| normalise(k) == root)
            .and_then(|(_, m)| m.lock.clone());
        if let Some(lock) = &lock {
            lock.lock();
        }
        let out = f();
        if let Some(lock) = &lock {
            lock.unlock();
        }
        Ok(out)
    }
}

impl FilesystemEngine for MockEngine {
    type File = MockFile;
    type Dir = MockDir;

    fn register_device(&self, name: &str, device: Arc<dyn BlockDeviceHooks>) -> Result<()> {
        let mut devices = self.devices.lock();
        if devices.contains_key(name) {
            return Err(engine_err("register_device", libc::EEXIST));
        }
        devices.insert(name.to_string(), device);
        Ok(())
    }

    fn unregister_device(&self, name: &str) -> Result<()> {
        self.devices
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| engine_err("unregister_device", libc::ENOENT))
    }

    fn mount(&self, name: &str, mount_point: &str, _read_only: bool) -> Result<()> {
        if *self.fail_mount.lock() {
            return Err(engine_err("mount", libc::EIO));
        }
        let device = self
            .devices
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| engine_err("mount", libc::ENODEV))?;
        device.open()?;
        let superblock = match read_superblock(device.as_ref()) {
            Ok(Some(sb)) => sb,
            Ok(None) => {
                device.close()?;
                return Err(engine_err("mount", libc::EINVAL));
            }
            Err(e) => {
                device.close()?;
                return Err(e);
            }
        };
        self.mounts.lock().insert(
            mount_point.to_string(),
            Mounted {
                device,
                superblock,
                lock: None,
            },
        );
        Ok(())
    }

    fn umount(&self, mount_point: &str) -> Result<()> {
        let mounted = self
            .mounts
            .lock()
            .remove(mount_point)
            .ok_or_else(|| engine_err("umount", libc::ENOENT))?;
        write_superblock(mounted.device.as_ref(), &mounted.superblock)?;
        mounted.device.close()
    }

    fn setup_locks(&self, mount_point: &str, lock: Arc<dyn MountLock>) -> Result<()> {
        let mut mounts = self.mounts.lock();
        let mounted = mounts
            .get_mut(mount_point)
            .ok_or_else(|| engine_err("setup_locks", libc::ENOENT))?;
        mounted.lock = Some(lock);
        Ok(())
    }

    fn mkfs(&self, device: Arc<dyn BlockDeviceHooks>, options: &MkfsOptions) -> Result<()> {
        device.open()?;
        let desc = device.descriptor()?;
        let total_blocks = desc.block_count();
        let sb = Superblock {
            block_size: options.block_size,
            total_blocks,
            free_blocks: total_blocks.saturating_sub(if options.journal { 2 } else { 1 }),
        };
        let result = write_superblock(device.as_ref(), &sb);
        device.close()?;
        result
    }

    fn superblock_stats(&self, mount_point: &str) -> Result<FsStats> {
        let mounts = self.mounts.lock();
        let mounted = mounts
            .get(mount_point)
            .ok_or_else(|| engine_err("superblock_stats", libc::ENOENT))?;
        Ok(FsStats {
            block_size: mounted.superblock.block_size,
            total_blocks: mounted.superblock.total_blocks,
            free_blocks: mounted.superblock.free_blocks,
        })
    }

    fn cache_flush(&self, path: &str) -> Result<()> {
        let root = self.mount_of(path)?;
        let (device, sb) = {
            let mounts = self.mounts.lock();
            let (_, mounted) = mounts
                .iter()
                .find(|(k, _)| normalise(k) == root)
                .ok_or_else(|| engine_err("cache_flush", libc::ENOENT))?;
            (Arc::clone(&mounted.device), mounted.superblock)
        };
        write_superblock(device.as_ref(), &sb)?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn file_open(&self, path: &str, flags: i32) -> Result<MockFile> {
        self.mount_of(path)?;
        let path = normalise(path);
        if self.is_dir(&path) {
            return Err(engine_err("file_open", libc::EISDIR));
        }
        if !self.is_dir(&parent(&path)) {
            return Err(engine_err("file_open", libc::ENOENT));
        }
        self.with_locked(&path, || {
            let mut tree = self.tree.lock();
            match tree.files.get_mut(&path) {
                Some(data) => {
                    if flags & libc::O_TRUNC != 0 {
                        data.clear();
                    }
                    Ok(())
                }
                None if flags & libc::O_CREAT != 0 => {
                    tree.files.insert(path.clone(), Vec::new());
                    Ok(())
                }
                None => Err(engine_err("file_open", libc::ENOENT)),
            }
        })??;
        let pos = if flags & libc::O_APPEND != 0 {
            self.tree.lock().files.get(&path).map(|d| d.len() as u64).unwrap_or(0)
        } else {
            0
        };
        Ok(MockFile { path, pos })
    }

    fn file_close(&self, _file: MockFile) -> Result<()> {
        Ok(())
    }

    fn file_read(&self, file: &mut MockFile, buf: &mut [u8]) -> Result<usize> {
        let tree = self.tree.lock();
        let data = tree
            .files
            .get(&file.path)
            .ok_or_else(|| engine_err("file_read", libc::ENOENT))?;
        let start = (file.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        file.pos += n as u64;
        Ok(n)
    }

    fn file_write(&self, file: &mut MockFile, buf: &[u8]) -> Result<usize> {
        let mut tree = self.tree.lock();
        let data = tree
            .files
            .get_mut(&file.path)
            .ok_or_else(|| engine_err("file_write", libc::ENOENT))?;
        let start = file.pos as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        file.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn file_seek(&self, file: &mut MockFile, offset: u64) -> Result<u64> {
        file.pos = offset;
        Ok(offset)
    }

    fn file_size(&self, file: &MockFile) -> u64 {
        self.tree
            .lock()
            .files
            .get(&file.path)
            .map(|d| d.len() as u64)
            .unwrap_or(0)
    }

    fn file_remove(&self, path: &str) -> Result<()> {
        let path = normalise(path);
        self.with_locked(&path, || {
            self.tree
                .lock()
                .files
                .remove(&path)
                .map(|_| ())
                .ok_or_else(|| engine_err("file_remove", libc::ENOENT))
        })?
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old_path = normalise(old_path);
        let new_path = normalise(new_path);
        self.mount_of(&new_path)?;
        let mut tree = self.tree.lock();
        if let Some(data) = tree.files.remove(&old_path) {
            tree.files.insert(new_path, data);
            return Ok(());
        }
        if !tree.dirs.remove(&old_path) {
            return Err(engine_err("rename", libc::ENOENT));
        }
        let prefix = format!("{}/", old_path);
        let moved_dirs: Vec<String> = tree.dirs.iter().filter(|d| d.starts_with(&prefix)).cloned().collect();
        for dir in moved_dirs {
            tree.dirs.remove(&dir);
            tree.dirs.insert(format!("{}{}", new_path, &dir[old_path.len()..]));
        }
        let moved_files: Vec<String> = tree.files.keys().filter(|f| f.starts_with(&prefix)).cloned().collect();
        for file in moved_files {
            if let Some(data) = tree.files.remove(&file) {
                tree.files.insert(format!("{}{}", new_path, &file[old_path.len()..]), data);
            }
        }
        tree.dirs.insert(new_path);
        Ok(())
    }

    fn mode(&self, path: &str) -> Result<u32> {
        let path = normalise(path);
        if self.is_dir(&path) {
            Ok(libc::S_IFDIR as u32 | 0o755)
        } else if self.tree.lock().files.contains_key(&path) {
            Ok(libc::S_IFREG as u32 | 0o644)
        } else {
            Err(engine_err("mode", libc::ENOENT))
        }
    }

    fn dir_make(&self, path: &str) -> Result<()> {
        self.mount_of(path)?;
        let path = normalise(path);
        if self.is_dir(&path) || self.tree.lock().files.contains_key(&path) {
            return Err(engine_err("dir_make", libc::EEXIST));
        }
        if !self.is_dir(&parent(&path)) {
            return Err(engine_err("dir_make", libc::ENOENT));
        }
        self.with_locked(&path, || {
            self.tree.lock().dirs.insert(path.clone());
        })
    }

    fn dir_open(&self, path: &str) -> Result<MockDir> {
        self.mount_of(path)?;
        let path = normalise(path);
        if !self.is_dir(&path) {
            return Err(engine_err("dir_open", libc::ENOENT));
        }
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        let tree = self.tree.lock();
        let child = |p: &String| -> Option<String> {
            let rest = p.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };
        let mut entries: Vec<DirEntry> = tree
            .dirs
            .iter()
            .filter_map(|d| child(d))
            .map(|name| DirEntry {
                name,
                kind: EntryKind::Directory,
            })
            .collect();
        entries.extend(tree.files.keys().filter_map(|f| child(f)).map(|name| DirEntry {
            name,
            kind: EntryKind::Regular,
        }));
        Ok(MockDir {
            path,
            entries,
            next: 0,
        })
    }

    fn dir_close(&self, _dir: MockDir) -> Result<()> {
        Ok(())
    }

    fn dir_remove(&self, path: &str) -> Result<()> {
        let path = normalise(path);
        let prefix = format!("{}/", path);
        self.with_locked(&path, || {
            let mut tree = self.tree.lock();
            if !tree.dirs.remove(&path) {
                return Err(engine_err("dir_remove", libc::ENOENT));
            }
            tree.dirs.retain(|d| !d.starts_with(&prefix));
            tree.files.retain(|f, _| !f.starts_with(&prefix));
            Ok(())
        })?
    }

    fn dir_next(&self, dir: &mut MockDir) -> Option<DirEntry> {
        let entry = dir.entries.get(dir.next).cloned();
        if entry.is_some() {
            dir.next += 1;
        }
        entry
    }

    fn dir_size(&self, dir: &MockDir) -> u64 {
        // One 4 KiB directory block per 64 entries.
        4096 * (dir.entries.len() as u64 / 64 + 1)
    }
}

/// Image of `sectors` zeroed sectors with an MBR holding `parts`
/// (`(slot, system_id, first_lba, sector_count)`).
pub fn mbr_image(sector_size: usize, sectors: u64, parts: &[(usize, u8, u32, u32)]) -> Vec<u8> {
    let mut image = vec![0u8; sector_size * sectors as usize];
    for &(slot, system_id, first_lba, count) in parts {
        let off = 446 + slot * 16;
        image[off + 4] = system_id;
        image[off + 8..off + 12].copy_from_slice(&first_lba.to_le_bytes());
        image[off + 12..off + 16].copy_from_slice(&count.to_le_bytes());
    }
    image[510] = 0x55;
    image[511] = 0xAA;
    image
}

/// Image with a protective MBR and a primary GPT holding `parts`
/// (`(slot, first_lba, last_lba)`).
pub fn gpt_image(sector_size: usize, sectors: u64, parts: &[(usize, u64, u64)]) -> Vec<u8> {
    let mut image = mbr_image(sector_size, sectors, &[(0, 0xEE, 1, (sectors - 1) as u32)]);

    let mut entries = vec![0u8; 128 * 128];
    for &(slot, first, last) in parts {
        let e = &mut entries[slot * 128..(slot + 1) * 128];
        e[0..16].copy_from_slice(&[
            0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47,
            0x7D, 0xE4,
        ]);
        e[16] = slot as u8 + 1;
        e[32..40].copy_from_slice(&first.to_le_bytes());
        e[40..48].copy_from_slice(&last.to_le_bytes());
    }
    let entries_at = 2 * sector_size;
    image[entries_at..entries_at + entries.len()].copy_from_slice(&entries);

    let mut header = vec![0u8; 92];
    header[0..8].copy_from_slice(b"EFI PART");
    header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    header[12..16].copy_from_slice(&92u32.to_le_bytes());
    header[24..32].copy_from_slice(&1u64.to_le_bytes());
    header[32..40].copy_from_slice(&(sectors - 1).to_le_bytes());
    header[40..48].copy_from_slice(&34u64.to_le_bytes());
    header[48..56].copy_from_slice(&(sectors - 34).to_le_bytes());
    header[72..80].copy_from_slice(&2u64.to_le_bytes());
    header[80..84].copy_from_slice(&128u32.to_le_bytes());
    header[84..88].copy_from_slice(&128u32.to_le_bytes());
    header[88..92].copy_from_slice(&crc32fast::hash(&entries).to_le_bytes());
    let crc = crc32fast::hash(&header);
    header[16..20].copy_from_slice(&crc.to_le_bytes());
    image[sector_size..sector_size + 92].copy_from_slice(&header);
    image
}
