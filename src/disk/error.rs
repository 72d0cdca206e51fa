use std::io;

use thiserror::Error;

/// Errors that can be returned from disk image operations.  These are
/// generally converted into `io::Error`.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DiskError {
    /// Unknown error
    #[error("unknown error")]
    Unknown,
    /// Bad container magic, truncated image, or unrecognized filesystem
    #[error("not an Atari disk image or filesystem")]
    FormatError,
    /// No free bit left in the VTOC bitmap
    #[error("disk is full")]
    DiskFull,
    /// Read past the end of a file
    #[error("end of file")]
    EndOfFile,
    /// Filename exceeds the 8+3 name field
    #[error("filename too long")]
    NameTooLong,
    /// No never-used or deleted slot left in the directory
    #[error("directory is full")]
    DirectoryFull,
    /// The directory entry is not a subdirectory
    #[error("not a directory")]
    NotADirectory,
    /// The filesystem variant does not implement this capability
    #[error("operation not supported by this filesystem")]
    UnsupportedOperation,
    /// Import source does not exist
    #[error("file does not exist")]
    MissingFile,
    /// Sector number 0 or beyond the end of the disk
    #[error("bad sector number")]
    InvalidSector,
    /// Offset out of bounds
    #[error("offset out of bounds")]
    InvalidOffset,
    /// A sector handle was used after its cache slot was recycled
    #[error("stale sector handle")]
    StaleSector,
    /// A file chain visits the same sector twice
    #[error("chain loop detected")]
    ChainLoop,
    /// Unknown DOS name requested for installation
    #[error("unknown DOS format")]
    UnknownDos,
    /// Unknown property name or unparsable property value
    #[error("invalid property")]
    InvalidProperty,
    /// Malformed line in a directory index
    #[error("invalid directory index line")]
    InvalidIndex,
}

impl From<DiskError> for io::Error {
    fn from(error: DiskError) -> io::Error {
        use std::io::ErrorKind;
        let kind = match error {
            DiskError::Unknown => ErrorKind::Other,
            DiskError::FormatError => ErrorKind::InvalidData,
            DiskError::DiskFull => ErrorKind::Other,
            DiskError::EndOfFile => ErrorKind::UnexpectedEof,
            DiskError::NameTooLong => ErrorKind::InvalidInput,
            DiskError::DirectoryFull => ErrorKind::Other,
            DiskError::NotADirectory => ErrorKind::InvalidInput,
            DiskError::UnsupportedOperation => ErrorKind::Unsupported,
            DiskError::MissingFile => ErrorKind::NotFound,
            DiskError::InvalidSector => ErrorKind::InvalidInput,
            DiskError::InvalidOffset => ErrorKind::InvalidInput,
            DiskError::StaleSector => ErrorKind::Other,
            DiskError::ChainLoop => ErrorKind::InvalidData,
            DiskError::UnknownDos => ErrorKind::InvalidInput,
            DiskError::InvalidProperty => ErrorKind::InvalidInput,
            DiskError::InvalidIndex => ErrorKind::InvalidData,
        };
        io::Error::new(kind, error)
    }
}

impl From<io::Error> for DiskError {
    fn from(error: io::Error) -> DiskError {
        DiskError::from_io_error(&error).unwrap_or(DiskError::Unknown)
    }
}

impl DiskError {
    /// If the provided `io::Error` contains a `DiskError`, return the
    /// underlying `DiskError`.  If not, return None.
    pub fn from_io_error(error: &io::Error) -> Option<DiskError> {
        error
            .get_ref()
            .and_then(|e| e.downcast_ref::<DiskError>())
            .cloned()
    }

    /// This is sometimes useful instead of .into() when the compiler doesn't
    /// have enough information to perform type inference.
    pub fn to_io_error(&self) -> io::Error {
        self.clone().into()
    }
}

impl PartialEq<io::Error> for DiskError {
    fn eq(&self, other: &io::Error) -> bool {
        match DiskError::from_io_error(other) {
            Some(ref e) if e == self => true,
            _ => false,
        }
    }
}

impl PartialEq<DiskError> for io::Error {
    fn eq(&self, other: &DiskError) -> bool {
        match DiskError::from_io_error(self) {
            Some(ref e) if e == other => true,
            _ => false,
        }
    }
}
