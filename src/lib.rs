//! zipcodec turns named, in-memory files into ZIP archives and back:
//!
//! ```
//! use zipcodec::*;
//!
//! let bytes = encode(&[
//!     ArchiveEntry::directory("greetings"),
//!     ArchiveEntry::new("greetings/hello.txt", "Hi there"),
//! ])?;
//!
//! let entries = decode(&bytes)?;
//! assert_eq!(entries[1].name, "greetings/hello.txt");
//! assert_eq!(entries[1].content, b"Hi there");
//! # Ok::<(), zipcodec::result::ZipError>(())
//! ```
//!
//! Both directions are pure functions over byte buffers.
//! Writing the archive to disk, uploading it, or offering it as a download
//! is up to you.
//!
//! Archives are the classic (non-Zip64) flavor, so no entry, offset,
//! or central directory can exceed 4 GiB, and there can be at most 65535 entries.
//! Going past those limits is an error, never a silently-truncated field.
//! Entries are stored uncompressed by default;
//! DEFLATE is available through [`EncodeOptions`].
//!
//! Decoding starts from the central directory at the back of the archive,
//! then follows each recorded offset to its local file header,
//! checking that every offset lands where it should and every CRC-32 matches.
//! Anything amiss fails the decode with a [`ZipError`] saying what
//! (and usually which entry) was wrong, rather than handing back a partial list.
//! If you'd rather keep the entries that survived, see [`IntegrityPolicy`].
//!
//! For metadata, or to decompress several entries concurrently,
//! open a [`ZipArchive`] directly:
//! its readers are `Send`, and it never copies the archive.
//!
//! [`EncodeOptions`]: write/struct.EncodeOptions.html
//! [`ZipError`]: result/enum.ZipError.html
//! [`IntegrityPolicy`]: read/enum.IntegrityPolicy.html
//! [`ZipArchive`]: read/struct.ZipArchive.html

pub mod read;
pub mod result;
pub mod write;

pub use read::{decode, decode_with, CompressionMethod, ZipArchive};
pub use write::{encode, encode_with, ArchiveEntry};

mod arch;
mod crc_reader;
mod spec;
