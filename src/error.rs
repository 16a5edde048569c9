//! Error types for blockmux.

use thiserror::Error;

/// Result type alias for blockmux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification shared by every [`Error`] variant.
///
/// Mount orchestration and the VFS glue only ever look at the kind (and
/// the status code derived from it); the variant carries the detail for
/// logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Physical read/write mismatch or device open/close failure.
    Io,
    /// No free registry slot, unknown device or mount point.
    NotFound,
    /// Partition id past the active scheme's capacity.
    OutOfRange,
    /// Device already mounted.
    Busy,
    /// Slot invariant violated; a logic bug in the caller.
    ProtocolViolation,
    /// Bad argument, geometry or configuration.
    InvalidArgument,
    /// Failure reported by the filesystem engine.
    Engine,
    /// Operation not available on this platform or device.
    Unsupported,
}

/// Errors that can occur in blockmux operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the underlying device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device transferred fewer sectors than requested.
    #[error("Short transfer: requested {expected} sectors, device moved {actual}")]
    ShortTransfer { expected: u64, actual: u64 },

    /// The physical device refused to open or report its geometry.
    #[error("Cannot open device {device}: {reason}")]
    DeviceOpen { device: String, reason: String },

    /// Permission denied on a raw device.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Every registry slot is in use.
    #[error("No free volume slot (all {capacity} slots in use)")]
    NoFreeSlot { capacity: usize },

    /// Nothing is mounted at the given path.
    #[error("Not mounted: {0}")]
    NotMounted(String),

    /// Device or file not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Partition id exceeds the active scheme's capacity.
    #[error("Partition id {id} out of range (scheme holds {capacity} entries)")]
    PartitionOutOfRange { id: u32, capacity: usize },

    /// Device or volume already in use.
    #[error("Busy: {0}")]
    Busy(String),

    /// A slot was used in a way that can only come from a logic bug.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Block and sector sizes cannot be reconciled.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Caller buffer does not match the requested transfer.
    #[error("Buffer size mismatch: need {expected} bytes, got {actual} bytes")]
    InvalidBuffer { expected: usize, actual: usize },

    /// Block count exceeds what one call may transfer.
    #[error("Transfer of {requested} blocks exceeds the limit of {max}")]
    TransferTooLarge { requested: u32, max: u32 },

    /// Scaling a block address to sectors overflowed.
    #[error("Block address overflow: block {blk_id} x{ratio}")]
    AddressOverflow { blk_id: u64, ratio: u32 },

    /// Invalid path format.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Argument rejected by a VFS entry point.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// ioctl command not handled by the glue layer.
    #[error("Unsupported ioctl command {0:#x}")]
    UnsupportedIoctl(i32),

    /// Operation not supported.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The filesystem engine reported an error code.
    #[error("Engine {op} failed with code {code}")]
    Engine { op: &'static str, code: i32 },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_)
            | Error::ShortTransfer { .. }
            | Error::DeviceOpen { .. }
            | Error::PermissionDenied(_) => ErrorKind::Io,
            Error::NoFreeSlot { .. } | Error::NotMounted(_) | Error::NotFound(_) => {
                ErrorKind::NotFound
            }
            Error::PartitionOutOfRange { .. } => ErrorKind::OutOfRange,
            Error::Busy(_) => ErrorKind::Busy,
            Error::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Error::InvalidGeometry(_)
            | Error::InvalidBuffer { .. }
            | Error::TransferTooLarge { .. }
            | Error::AddressOverflow { .. }
            | Error::InvalidPath(_)
            | Error::InvalidArgument(_)
            | Error::InvalidConfig(_)
            | Error::Serialization(_) => ErrorKind::InvalidArgument,
            Error::Engine { .. } => ErrorKind::Engine,
            Error::UnsupportedIoctl(_) | Error::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Negated status code handed back to the VFS dispatch layer.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            Error::PermissionDenied(_) => -libc::EACCES,
            // Unknown ioctl commands answer -EIO, not -ENOSYS.
            Error::UnsupportedIoctl(_) => -libc::EIO,
            Error::Engine { code, .. } => -code.abs(),
            _ => match self.kind() {
                ErrorKind::Io => -libc::EIO,
                ErrorKind::NotFound => -libc::ENOENT,
                ErrorKind::OutOfRange => -libc::ERANGE,
                ErrorKind::Busy => -libc::EBUSY,
                ErrorKind::ProtocolViolation => -libc::EFAULT,
                ErrorKind::InvalidArgument => -libc::EINVAL,
                ErrorKind::Engine => -libc::EIO,
                ErrorKind::Unsupported => -libc::ENOSYS,
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
