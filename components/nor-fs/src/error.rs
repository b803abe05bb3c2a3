/// Status of a filesystem or block device operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The block device failed, carrying its own error code.
    Io(i32),
    /// No valid superblock record on the device.
    NotFormatted,
    /// Metadata is present but inconsistent.
    Corrupt,
    NotFound,
    Exists,
    NotDir,
    IsDir,
    NotEmpty,
    /// Every block is in use.
    NoSpace,
    /// The handle pool is full.
    NoHandles,
    /// A handle that was closed or never handed out.
    BadHandle,
    NameTooLong,
    /// Malformed argument or device geometry.
    Invalid,
    /// A position or size beyond what the device can address.
    FileTooLarge,
    NotReadable,
    NotWritable,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
