//! Device error taxonomy

use core::fmt;

/// Device Result type
pub type DevResult<T> = Result<T, DevError>;

/// Errors reported by storage devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    /// Bad offset, length, alignment or options
    InvalidArgument,
    /// Unknown type, name, chip or logical block
    NotFound,
    /// Allocation failed
    OutOfMemory,
    /// Bus failure, busy timeout or reported program/erase failure
    IoError,
    /// Uncorrectable ECC error or malformed on-chip metadata
    Corrupt,
    /// Outstanding references prevent the operation
    Busy,
    /// Operation not implemented by this driver
    Unsupported,
    /// Chip answered but its geometry could not be established
    UnknownGeometry,
    /// Bad-block remap refused
    Remap(RemapError),
}

/// Reasons a bad-block remap is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapError {
    /// The on-chip lookup table has no free slot
    TableFull,
    /// The logical block already has an entry
    Duplicate,
    /// Source and destination are on different dies
    CrossDie,
}

impl DevError {
    /// Convert to errno-style error code
    pub fn to_errno(&self) -> i32 {
        match self {
            DevError::InvalidArgument => -22, // EINVAL
            DevError::NotFound => -6,         // ENXIO
            DevError::OutOfMemory => -12,     // ENOMEM
            DevError::IoError => -5,          // EIO
            DevError::Corrupt => -74,         // EBADMSG
            DevError::Busy => -16,            // EBUSY
            DevError::Unsupported => -95,     // EOPNOTSUPP
            DevError::UnknownGeometry => -19, // ENODEV
            DevError::Remap(RemapError::TableFull) => -28, // ENOSPC
            DevError::Remap(RemapError::Duplicate) => -17, // EEXIST
            DevError::Remap(RemapError::CrossDie) => -18,  // EXDEV
        }
    }
}

impl fmt::Display for DevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevError::InvalidArgument => f.write_str("invalid argument"),
            DevError::NotFound => f.write_str("not found"),
            DevError::OutOfMemory => f.write_str("out of memory"),
            DevError::IoError => f.write_str("I/O error"),
            DevError::Corrupt => f.write_str("data corrupt"),
            DevError::Busy => f.write_str("busy"),
            DevError::Unsupported => f.write_str("unsupported"),
            DevError::UnknownGeometry => f.write_str("geometry undetermined"),
            DevError::Remap(RemapError::TableFull) => f.write_str("remap table full"),
            DevError::Remap(RemapError::Duplicate) => f.write_str("duplicate remap entry"),
            DevError::Remap(RemapError::CrossDie) => f.write_str("remap across dies"),
        }
    }
}

impl From<RemapError> for DevError {
    fn from(e: RemapError) -> Self {
        DevError::Remap(e)
    }
}
