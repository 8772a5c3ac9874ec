//! Error types and the related `Result<T>`

use thiserror::Error;

pub type ZipResult<T> = Result<T, ZipError>;

#[derive(Debug, Error)]
pub enum ZipError {
    /// An error from the underlying writer
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    /// An entry handed to the encoder can't be stored as given
    /// (empty or malformed name, duplicate, directory with content...)
    #[error("Invalid entry {path:?}: {reason}")]
    InvalidEntry { path: String, reason: &'static str },

    /// The archive comment handed to the encoder can't be stored as given
    #[error("Invalid archive comment: {0}")]
    InvalidComment(&'static str),

    /// The input isn't a ZIP archive we can make sense of.
    #[error("Invalid Zip archive: {0}")]
    InvalidArchive(&'static str),

    /// A specific entry's records are broken
    /// (bad local header, offsets out of range, undecodable data).
    #[error("Corrupt entry {path}: {reason}")]
    CorruptEntry { path: String, reason: &'static str },

    /// An entry's contents don't match the CRC-32 the archive recorded for it.
    #[error("Checksum mismatch for {path}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    /// Something doesn't fit in the fields of a classic (non-Zip64) archive.
    ///
    /// When a decoded archive only marks a field as overflowed,
    /// `size` is `limit + 1`, the least it could have been.
    #[error("{what} of {size} exceeds the Zip limit of {limit}")]
    SizeLimit {
        what: &'static str,
        size: u64,
        limit: u64,
    },

    /// Decoding a UTF-8 name failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// The ZIP archive uses an unsupported feature
    #[error("Unsupported Zip archive: {0}")]
    UnsupportedArchive(String),

    /// The ZIP archive is prepended some unknown bytes.
    /// (Use [`ZipArchive::with_prepended_data()`] if this is okay.)
    ///
    /// [`ZipArchive::with_prepended_data()`]: ../read/struct.ZipArchive.html#method.with_prepended_data
    #[error("Archive prepended with {0} unknown bytes")]
    PrependedWithUnknownBytes(usize),

    /// A cast from a 64-bit int to a usize failed,
    /// probably on a 32-bit system.
    #[error("Zip archive too large for address space")]
    InsufficientAddressSpace,
}

impl ZipError {
    /// The name of the entry this error concerns, if it concerns just one.
    pub fn entry_path(&self) -> Option<&str> {
        match self {
            ZipError::InvalidEntry { path, .. }
            | ZipError::CorruptEntry { path, .. }
            | ZipError::ChecksumMismatch { path, .. } => Some(path),
            _ => None,
        }
    }

    /// True if the archive was well-formed but some contents failed their CRC.
    pub fn is_integrity(&self) -> bool {
        matches!(self, ZipError::ChecksumMismatch { .. })
    }

    /// True if the input couldn't be parsed as a ZIP archive.
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            ZipError::InvalidArchive(_)
                | ZipError::CorruptEntry { .. }
                | ZipError::PrependedWithUnknownBytes(_)
                | ZipError::Encoding(_)
        )
    }
}
