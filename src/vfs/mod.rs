//! VFS glue between a POSIX-style dispatch layer and the filesystem
//! engine.
//!
//! Provides mount point normalisation and per-open descriptors over the
//! engine's file and directory handles.

mod ops;
mod path;

pub use ops::{EngineDescriptor, ExtVfs, FileDescriptor, FileStat, OpenHandle};
pub use path::MountPoint;
