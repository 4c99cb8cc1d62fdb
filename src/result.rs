//! Error types and the related `Result<T>`

use std::io;

use thiserror::Error;

pub type DatapackResult<T> = Result<T, DatapackError>;

#[derive(Debug, Error)]
pub enum DatapackError {
    /// An error from underlying I/O
    #[error("I/O Error")]
    Io(#[from] io::Error),

    /// The container's magic, header, or records are malformed.
    #[error("Invalid datapack: {0}")]
    InvalidPack(&'static str),

    /// The header declares a format version we can't read.
    #[error("Unsupported datapack version {0}")]
    UnsupportedVersion(u8),

    /// The table or a payload is shorter than the header or a record claims.
    #[error("Truncated datapack: {0}")]
    Truncated(&'static str),

    /// No entry in the container has the given filename.
    #[error("No file in the datapack named {0}")]
    NoSuchFile(String),

    /// The process image doesn't export the given entry table.
    #[error("No symbol {0} in the running process")]
    NoSuchSymbol(String),

    /// A write was requested but there is nowhere to put it.
    #[error("Can't open {0} for writing without an override directory")]
    ReadOnly(String),

    /// Inflating an entry failed or didn't produce its declared size.
    #[error("Corrupt data in {0}")]
    Corrupt(String),

    /// Couldn't allocate the output buffer for an entry.
    #[error("Couldn't allocate {0} bytes")]
    OutOfMemory(usize),

    /// Two entries given to the writer share a name.
    #[error("Duplicate entry for {0}")]
    DuplicateEntry(String),

    /// A value doesn't fit in its field of the container format.
    #[error("Too large for a datapack: {0}")]
    TooLarge(String),

    /// A size from the container doesn't fit in a usize,
    /// probably on a 32-bit system.
    #[error("Datapack entry too large for address space")]
    InsufficientAddressSpace,
}

/// The broad category of a [`DatapackError`].
///
/// Variants carry details for humans;
/// callers that only care what went wrong can match on this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Truncated,
    NotFound,
    Permission,
    Data,
    Memory,
    Io,
}

impl DatapackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatapackError::Io(_) => ErrorKind::Io,
            DatapackError::InvalidPack(_)
            | DatapackError::UnsupportedVersion(_)
            | DatapackError::DuplicateEntry(_)
            | DatapackError::TooLarge(_) => ErrorKind::Format,
            DatapackError::Truncated(_) => ErrorKind::Truncated,
            DatapackError::NoSuchFile(_) | DatapackError::NoSuchSymbol(_) => ErrorKind::NotFound,
            DatapackError::ReadOnly(_) => ErrorKind::Permission,
            DatapackError::Corrupt(_) => ErrorKind::Data,
            DatapackError::OutOfMemory(_) | DatapackError::InsufficientAddressSpace => {
                ErrorKind::Memory
            }
        }
    }
}

impl From<DatapackError> for io::Error {
    fn from(e: DatapackError) -> Self {
        if let DatapackError::Io(inner) = e {
            return inner;
        }
        let kind = match e.kind() {
            ErrorKind::Io => io::ErrorKind::Other,
            ErrorKind::Format | ErrorKind::Data => io::ErrorKind::InvalidData,
            ErrorKind::Truncated => io::ErrorKind::UnexpectedEof,
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::Permission => io::ErrorKind::PermissionDenied,
            ErrorKind::Memory => io::ErrorKind::OutOfMemory,
        };
        io::Error::new(kind, e)
    }
}

/// Maps a failed `read_exact()` to a truncation error,
/// passing other I/O errors through.
pub(crate) fn truncated_on_eof(e: io::Error, what: &'static str) -> DatapackError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        DatapackError::Truncated(what)
    } else {
        DatapackError::Io(e)
    }
}
