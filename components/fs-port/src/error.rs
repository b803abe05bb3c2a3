/// Status reported to callers of the port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed argument or a handle that is not open.
    InvalidParameter,
    NotFound,
    NotFormatted,
    Corrupt,
    /// The handle pool is full.
    ResourceExhausted,
    NotEmpty,
    IsADirectory,
    NotADirectory,
    ReadOnly,
    /// A read found no more data, not a failure.
    EndOfFile,
    /// A directory listing is complete, not a failure.
    EndOfStream,
    /// The block device reported an error.
    IoFailure,
    AlreadyExists,
    NoSpace,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl From<nor_fs::Error> for Error {
    fn from(error: nor_fs::Error) -> Self {
        use nor_fs::Error as Core;
        match error {
            Core::Io(code) => {
                error!("block device error {:x}", code);
                Self::IoFailure
            }
            Core::NotFormatted => Self::NotFormatted,
            Core::Corrupt => Self::Corrupt,
            Core::NotFound => Self::NotFound,
            Core::Exists => Self::AlreadyExists,
            Core::NotDir => Self::NotADirectory,
            Core::IsDir => Self::IsADirectory,
            Core::NotEmpty => Self::NotEmpty,
            Core::NoSpace => Self::NoSpace,
            Core::NoHandles => Self::ResourceExhausted,
            Core::BadHandle
            | Core::NameTooLong
            | Core::Invalid
            | Core::FileTooLarge
            | Core::NotReadable
            | Core::NotWritable => Self::InvalidParameter,
        }
    }
}
