//! File and directory entry points over the filesystem engine.

use crate::engine::{DirEntry, FilesystemEngine};
use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::Arc;

/// Engine handle behind an open descriptor.
#[derive(Debug)]
pub enum OpenHandle<F, D> {
    File(F),
    Directory(D),
}

/// Per-open state: the engine handle plus the position and size the
/// dispatch layer reports.
#[derive(Debug)]
pub struct FileDescriptor<F, D> {
    path: String,
    flags: i32,
    pos: u64,
    size: u64,
    handle: OpenHandle<F, D>,
}

impl<F, D> FileDescriptor<F, D> {
    /// Path the descriptor was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Open flags.
    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Current position. For directories, the number of entries returned
    /// so far.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// File size as of the last operation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the descriptor refers to a directory.
    pub fn is_directory(&self) -> bool {
        matches!(self.handle, OpenHandle::Directory(_))
    }
}

/// Descriptor type for engine `E`.
pub type EngineDescriptor<E> =
    FileDescriptor<<E as FilesystemEngine>::File, <E as FilesystemEngine>::Dir>;

/// Result of [`ExtVfs::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub mode: u32,
    pub size: u64,
}

/// VFS glue translating POSIX-style calls into engine operations.
pub struct ExtVfs<E: FilesystemEngine> {
    engine: Arc<E>,
}

impl<E: FilesystemEngine> ExtVfs<E> {
    /// Wrap `engine`.
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// Open `path`.
    ///
    /// `O_DIRECTORY` opens a directory, creating it first when `O_CREAT`
    /// is also set. Everything else is passed to the engine's file open.
    pub fn open(&self, path: &str, flags: i32) -> Result<EngineDescriptor<E>> {
        if flags & libc::O_DIRECTORY != 0 {
            if flags & libc::O_CREAT != 0 {
                self.engine.dir_make(path)?;
            }
            let dir = self.engine.dir_open(path)?;
            let size = self.engine.dir_size(&dir);
            log::trace!("opened directory {}", path);
            return Ok(FileDescriptor {
                path: path.to_string(),
                flags,
                pos: 0,
                size,
                handle: OpenHandle::Directory(dir),
            });
        }

        let file = self.engine.file_open(path, flags)?;
        let size = self.engine.file_size(&file);
        let pos = if flags & libc::O_APPEND != 0 { size } else { 0 };
        log::trace!("opened file {} ({} bytes)", path, size);
        Ok(FileDescriptor {
            path: path.to_string(),
            flags,
            pos,
            size,
            handle: OpenHandle::File(file),
        })
    }

    /// Close a descriptor, releasing its engine handle.
    pub fn close(&self, fd: EngineDescriptor<E>) -> Result<()> {
        match fd.handle {
            OpenHandle::File(file) => self.engine.file_close(file),
            OpenHandle::Directory(dir) => self.engine.dir_close(dir),
        }
    }

    /// Read from the current position.
    pub fn read(&self, fd: &mut EngineDescriptor<E>, buf: &mut [u8]) -> Result<usize> {
        let OpenHandle::File(file) = &mut fd.handle else {
            return Err(Error::InvalidArgument(format!("{} is a directory", fd.path)));
        };
        let n = self.engine.file_read(file, buf)?;
        fd.pos += n as u64;
        Ok(n)
    }

    /// Write at the current position.
    pub fn write(&self, fd: &mut EngineDescriptor<E>, buf: &[u8]) -> Result<usize> {
        let OpenHandle::File(file) = &mut fd.handle else {
            return Err(Error::InvalidArgument(format!("{} is a directory", fd.path)));
        };
        let n = self.engine.file_write(file, buf)?;
        fd.pos += n as u64;
        fd.size = self.engine.file_size(file);
        Ok(n)
    }

    /// Write back the engine cache of the mount holding the descriptor.
    pub fn flush(&self, fd: &EngineDescriptor<E>) -> Result<()> {
        self.engine.cache_flush(&fd.path)
    }

    /// Seek to an absolute `offset`.
    pub fn lseek(&self, fd: &mut EngineDescriptor<E>, offset: u64) -> Result<u64> {
        let OpenHandle::File(file) = &mut fd.handle else {
            return Err(Error::InvalidArgument(format!("{} is a directory", fd.path)));
        };
        fd.pos = self.engine.file_seek(file, offset)?;
        Ok(fd.pos)
    }

    /// Advisory lock queries are accepted and ignored.
    pub fn ioctl(&self, _fd: &EngineDescriptor<E>, cmd: i32) -> Result<i32> {
        match cmd {
            libc::F_GETLK | libc::F_SETLK => Ok(0),
            other => Err(Error::UnsupportedIoctl(other)),
        }
    }

    /// Return up to `max_entries` further entries of a directory.
    pub fn getdents(&self, fd: &mut EngineDescriptor<E>, max_entries: usize) -> Result<Vec<DirEntry>> {
        if max_entries == 0 {
            return Err(Error::InvalidArgument(
                "getdents needs room for at least one entry".to_string(),
            ));
        }
        let OpenHandle::Directory(dir) = &mut fd.handle else {
            return Err(Error::InvalidArgument(format!("{} is not a directory", fd.path)));
        };

        let mut entries = Vec::new();
        while entries.len() < max_entries {
            match self.engine.dir_next(dir) {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        fd.pos += entries.len() as u64;
        Ok(entries)
    }

    /// Mode and size of `path`, probing it as a directory first.
    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let size = match self.engine.dir_open(path) {
            Ok(dir) => {
                let size = self.engine.dir_size(&dir);
                self.engine.dir_close(dir)?;
                size
            }
            Err(_) => {
                let file = self.engine.file_open(path, libc::O_RDONLY)?;
                let size = self.engine.file_size(&file);
                self.engine.file_close(file)?;
                size
            }
        };
        let mode = self.engine.mode(path)?;
        Ok(FileStat { mode, size })
    }

    /// Remove `path`: directories recursively, otherwise as a file.
    pub fn unlink(&self, path: &str) -> Result<()> {
        match self.engine.dir_open(path) {
            Ok(dir) => {
                self.engine.dir_close(dir)?;
                self.engine.dir_remove(path)
            }
            Err(_) => self.engine.file_remove(path),
        }
    }

    /// Rename a file or directory.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.engine.rename(old_path, new_path)
    }
}
