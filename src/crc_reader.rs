//! Helper module to compute a CRC32 checksum

use std::io;
use std::io::prelude::*;

use crc32fast::Hasher;
use thiserror::Error;

/// The error a [`Crc32Reader`] wraps in an `io::Error` when it hits EOF
/// with a checksum other than the expected one.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Invalid checksum: expected {expected:#010x}, got {actual:#010x}")]
pub struct ChecksumError {
    pub expected: u32,
    pub actual: u32,
}

impl ChecksumError {
    /// Digs a `ChecksumError` back out of an `io::Error`, if that's what it holds.
    pub fn from_io(e: &io::Error) -> Option<Self> {
        e.get_ref()
            .and_then(|inner| inner.downcast_ref::<ChecksumError>())
            .copied()
    }
}

/// Reader that validates the CRC32 when it reaches the EOF.
pub struct Crc32Reader<R> {
    inner: R,
    hasher: Hasher,
    provided_checksum: u32,
}

impl<R> Crc32Reader<R> {
    pub fn new(inner: R, provided_checksum: u32) -> Crc32Reader<R> {
        Crc32Reader {
            inner,
            hasher: Hasher::new(),
            provided_checksum,
        }
    }

    /// Returns an error if the final checksum doesn't match the one provided by `new()`
    fn check_matches(&self) -> Result<(), ChecksumError> {
        let actual = self.hasher.clone().finalize();
        if actual == self.provided_checksum {
            Ok(())
        } else {
            Err(ChecksumError {
                expected: self.provided_checksum,
                actual,
            })
        }
    }
}

impl<R: Read> Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        if count == 0 && !buf.is_empty() {
            self.check_matches()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        self.hasher.update(&buf[0..count]);
        Ok(count)
    }
}
