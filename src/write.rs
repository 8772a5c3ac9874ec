//! Tools for writing a ZIP archive.
//!
//! [`encode()`] turns a list of [`ArchiveEntry`]s into a complete archive.
//! To build one up piece by piece (or straight into a file), use a [`ZipWriter`].
//!
//! [`encode()`]: fn.encode.html
//! [`ArchiveEntry`]: struct.ArchiveEntry.html
//! [`ZipWriter`]: struct.ZipWriter.html

use std::borrow::Cow;
use std::collections::HashSet;
use std::io::prelude::*;

use chrono::{NaiveDate, NaiveDateTime};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use log::*;
use memchr::memmem;

use crate::read::CompressionMethod;
use crate::result::*;
use crate::spec;

/// A named file (or directory) and its uncompressed contents
///
/// Names are relative paths with `/` separators.
/// Directories are named with a trailing `/` and have no contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub content: Vec<u8>,
}

impl ArchiveEntry {
    pub fn new<S: Into<String>, C: Into<Vec<u8>>>(name: S, content: C) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Makes a directory entry, appending the trailing slash if needed.
    pub fn directory<S: Into<String>>(name: S) -> Self {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        Self {
            name,
            content: Vec::new(),
        }
    }

    /// Returns true if the entry names a directory
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// Options for [`encode_with()`] and [`ZipWriter`]
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    compression_method: CompressionMethod,
    compression_level: u32,
    last_modified: NaiveDateTime,
    permissions: Option<u32>,
    comment: Vec<u8>,
}

/// The earliest time MS-DOS can represent
fn dos_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            compression_method: CompressionMethod::Stored,
            compression_level: 6,
            last_modified: dos_epoch(),
            permissions: None,
            comment: Vec::new(),
        }
    }
}

impl EncodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the compression method for new files
    ///
    /// The default is `CompressionMethod::Stored`.
    /// Directories are always stored.
    pub fn compression_method(mut self, method: CompressionMethod) -> Self {
        self.compression_method = method;
        self
    }

    /// Set the DEFLATE level, from 0 (fastest) to 9 (smallest).
    ///
    /// The default is 6.
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    /// Set the last modified time recorded for every entry
    ///
    /// The default is 1980-01-01 00:00:00, the MS-DOS epoch,
    /// so encoding the same entries always produces the same bytes.
    pub fn last_modified(mut self, timestamp: NaiveDateTime) -> Self {
        self.last_modified = timestamp;
        self
    }

    /// Set the permissions for new entries.
    ///
    /// The format is represented with unix-style permissions.
    /// The default is `0o644`, which represents `rw-r--r--` for files,
    /// and `0o755`, which represents `rwxr-xr-x` for directories
    pub fn unix_permissions(mut self, mode: u32) -> Self {
        self.permissions = Some(mode & 0o777);
        self
    }

    /// Set the archive comment. The default is no comment.
    pub fn comment<C: Into<Vec<u8>>>(mut self, comment: C) -> Self {
        self.comment = comment.into();
        self
    }
}

/// What we need to remember about each entry to write the central directory
#[derive(Debug)]
struct WrittenEntry {
    name: String,
    flags: u16,
    compression_method: CompressionMethod,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    header_offset: u32,
    external_file_attributes: u32,
    is_dir: bool,
}

/// Generator for ZIP files.
///
/// Since every entry's contents are in hand before its header is written,
/// the writer never needs to seek back and patch anything:
/// any `Write` will do.
///
/// ```
/// # use zipcodec::write::ZipWriter;
/// # use zipcodec::CompressionMethod;
/// let mut zip = ZipWriter::new(Vec::new());
/// zip.add_directory("docs")?;
/// zip.add_file("docs/hello.txt", b"Hi there")?;
/// zip.add_file_with_method("docs/big.txt", &[b'z'; 4096], CompressionMethod::Deflate)?;
/// let bytes: Vec<u8> = zip.finish()?;
/// assert_eq!(zipcodec::decode(&bytes)?.len(), 3);
/// # Ok::<(), zipcodec::result::ZipError>(())
/// ```
pub struct ZipWriter<W: Write> {
    inner: W,
    files: Vec<WrittenEntry>,
    names: HashSet<String>,
    bytes_written: u64,
    options: EncodeOptions,
}

impl<W: Write> ZipWriter<W> {
    /// Initializes the ZipWriter with default options.
    pub fn new(inner: W) -> Self {
        Self::with_options(inner, EncodeOptions::default())
    }

    pub fn with_options(inner: W, options: EncodeOptions) -> Self {
        Self {
            inner,
            files: Vec::new(),
            names: HashSet::new(),
            bytes_written: 0,
            options,
        }
    }

    /// Set the ZIP archive comment.
    pub fn set_comment<C: Into<Vec<u8>>>(&mut self, comment: C) {
        self.options.comment = comment.into();
    }

    /// Adds a file or directory, depending on its name.
    pub fn add_entry(&mut self, entry: &ArchiveEntry) -> ZipResult<()> {
        if entry.is_dir() {
            if !entry.content.is_empty() {
                return Err(ZipError::InvalidEntry {
                    path: entry.name.clone(),
                    reason: "Directories can't have contents",
                });
            }
            self.write_entry(&entry.name, &[], CompressionMethod::Stored, true)
        } else {
            self.add_file(&entry.name, &entry.content)
        }
    }

    /// Adds a file, compressed with the writer's default method.
    pub fn add_file(&mut self, name: &str, content: &[u8]) -> ZipResult<()> {
        let method = self.options.compression_method;
        self.add_file_with_method(name, content, method)
    }

    /// Adds a file, compressed with the given method.
    pub fn add_file_with_method(
        &mut self,
        name: &str,
        content: &[u8],
        method: CompressionMethod,
    ) -> ZipResult<()> {
        if name.ends_with('/') {
            return Err(ZipError::InvalidEntry {
                path: name.to_owned(),
                reason: "File names can't end in a slash",
            });
        }
        self.write_entry(name, content, method, false)
    }

    /// Adds a directory entry, appending the trailing slash if needed.
    pub fn add_directory(&mut self, name: &str) -> ZipResult<()> {
        let name: Cow<str> = if name.ends_with('/') {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(format!("{name}/"))
        };
        self.write_entry(&name, &[], CompressionMethod::Stored, true)
    }

    /// Writes a local file header and the (possibly compressed) contents,
    /// remembering what the central directory will need.
    fn write_entry(
        &mut self,
        name: &str,
        content: &[u8],
        method: CompressionMethod,
        is_dir: bool,
    ) -> ZipResult<()> {
        validate_name(name)?;
        if self.names.contains(name) {
            return Err(ZipError::InvalidEntry {
                path: name.to_owned(),
                reason: "Duplicate entry",
            });
        }
        if self.files.len() as u64 >= spec::MAX_ENTRIES {
            return Err(ZipError::SizeLimit {
                what: "Entry count",
                size: self.files.len() as u64 + 1,
                limit: spec::MAX_ENTRIES,
            });
        }

        let uncompressed_size = check_size("Entry size", content.len() as u64)?;
        let header_offset = check_size("Local header offset", self.bytes_written)?;
        let crc32 = crc32fast::hash(content);
        let data = compress(content, method, self.options.compression_level)?;
        let compressed_size = check_size("Compressed entry size", data.len() as u64)?;

        let (last_modified_time, last_modified_date) = spec::to_msdos(&self.options.last_modified);
        let flags = if name.is_ascii() { 0 } else { spec::UTF8_FLAG };

        let mut header = Vec::with_capacity(spec::LocalFileHeader::FIXED_SIZE + name.len());
        spec::LocalFileHeader {
            minimum_extract_version: spec::minimum_extract_version(method, is_dir),
            flags,
            compression_method: method.to_u16(),
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path: name.as_bytes(),
            extra_field: &[],
        }
        .write(&mut header);
        self.emit(&header)?;
        self.emit(&data)?;

        debug!(
            "Wrote {} at offset {} ({:?}, {} -> {} bytes)",
            name, header_offset, method, uncompressed_size, compressed_size
        );

        let permissions = if is_dir {
            0o040000 | self.options.permissions.unwrap_or(0o755)
        } else {
            0o100000 | self.options.permissions.unwrap_or(0o644)
        };
        self.files.push(WrittenEntry {
            name: name.to_owned(),
            flags,
            compression_method: method,
            crc32,
            compressed_size,
            uncompressed_size,
            header_offset,
            external_file_attributes: permissions << 16,
            is_dir,
        });
        self.names.insert(name.to_owned());
        Ok(())
    }

    /// Writes the central directory and the End of central directory record,
    /// returning the underlying writer.
    pub fn finish(mut self) -> ZipResult<W> {
        check_comment(&self.options.comment)?;
        let central_directory_offset = check_size("Central directory offset", self.bytes_written)?;
        let (last_modified_time, last_modified_date) = spec::to_msdos(&self.options.last_modified);

        let mut central_directory = Vec::new();
        for file in &self.files {
            spec::CentralDirectoryEntry {
                source_version: spec::SOURCE_VERSION,
                minimum_extract_version: spec::minimum_extract_version(
                    file.compression_method,
                    file.is_dir,
                ),
                flags: file.flags,
                compression_method: file.compression_method.to_u16(),
                last_modified_time,
                last_modified_date,
                crc32: file.crc32,
                compressed_size: file.compressed_size,
                uncompressed_size: file.uncompressed_size,
                disk_number: 0,
                internal_file_attributes: 0,
                external_file_attributes: file.external_file_attributes,
                header_offset: file.header_offset,
                path: file.name.as_bytes(),
                extra_field: &[],
                file_comment: &[],
            }
            .write(&mut central_directory);
        }
        let central_directory_size =
            check_size("Central directory size", central_directory.len() as u64)?;
        self.emit(&central_directory)?;

        let entries = u16::try_from(self.files.len()).map_err(|_| ZipError::SizeLimit {
            what: "Entry count",
            size: self.files.len() as u64,
            limit: spec::MAX_ENTRIES,
        })?;

        let mut eocdr = Vec::with_capacity(
            spec::EndOfCentralDirectory::FIXED_SIZE + self.options.comment.len(),
        );
        spec::EndOfCentralDirectory {
            disk_number: 0,
            disk_with_central_directory: 0,
            entries_on_this_disk: entries,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment: &self.options.comment,
        }
        .write(&mut eocdr);
        self.emit(&eocdr)?;
        self.inner.flush()?;

        debug!(
            "Finished archive: {} entries, central directory of {} bytes at offset {}",
            entries, central_directory_size, central_directory_offset
        );
        Ok(self.inner)
    }

    fn emit(&mut self, bytes: &[u8]) -> ZipResult<()> {
        self.inner.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

/// Makes sure a size or offset fits in the 32 bits a classic archive gives it.
fn check_size(what: &'static str, size: u64) -> ZipResult<u32> {
    u32::try_from(size).map_err(|_| ZipError::SizeLimit {
        what,
        size,
        limit: spec::MAX_SIZE,
    })
}

/// The comment ends the archive, so it has to fit in its length field
/// and can't hold anything a reader might mistake for the real EOCDR.
fn check_comment(comment: &[u8]) -> ZipResult<()> {
    if comment.len() as u64 > spec::MAX_FIELD_LENGTH {
        return Err(ZipError::SizeLimit {
            what: "Archive comment length",
            size: comment.len() as u64,
            limit: spec::MAX_FIELD_LENGTH,
        });
    }
    if memmem::find(comment, &spec::EOCDR_MAGIC).is_some() {
        return Err(ZipError::InvalidComment(
            "Contains an End Of Central Directory signature",
        ));
    }
    Ok(())
}

/// Entry names must be non-empty, relative, `/`-separated paths
/// that fit in the 16-bit name field.
fn validate_name(name: &str) -> ZipResult<()> {
    let invalid = |reason: &'static str| -> ZipResult<()> {
        Err(ZipError::InvalidEntry {
            path: name.to_owned(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("Name is empty");
    }
    if name.len() as u64 > spec::MAX_FIELD_LENGTH {
        return invalid("Name is longer than 65535 bytes");
    }
    if name.contains('\\') {
        return invalid("Backslashes aren't path separators in Zip archives");
    }
    // Directories get one trailing slash; everything else splits into components.
    let path = name.strip_suffix('/').unwrap_or(name);
    for component in path.split('/') {
        match component {
            "" => return invalid("Name must be relative, without empty components"),
            "." | ".." => return invalid("Name can't contain . or .. components"),
            _ => {}
        }
    }
    Ok(())
}

/// Compresses `content` with the given method.
fn compress(content: &[u8], method: CompressionMethod, level: u32) -> ZipResult<Cow<'_, [u8]>> {
    match method {
        CompressionMethod::Stored => Ok(Cow::Borrowed(content)),
        CompressionMethod::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
            encoder.write_all(content)?;
            Ok(Cow::Owned(encoder.finish()?))
        }
        CompressionMethod::Unsupported(method) => Err(ZipError::UnsupportedArchive(format!(
            "Compression method {method} not supported"
        ))),
    }
}

/// Encodes the given entries into a ZIP archive, stored without compression.
///
/// ```
/// # use zipcodec::*;
/// let bytes = encode(&[ArchiveEntry::new("hello.txt", "Hi there")])?;
/// assert_eq!(&bytes[..4], b"PK\x03\x04");
/// # Ok::<(), zipcodec::result::ZipError>(())
/// ```
pub fn encode(entries: &[ArchiveEntry]) -> ZipResult<Vec<u8>> {
    encode_with(entries, &EncodeOptions::default())
}

/// Encodes the given entries into a ZIP archive with the given options.
pub fn encode_with(entries: &[ArchiveEntry], options: &EncodeOptions) -> ZipResult<Vec<u8>> {
    let mut writer = ZipWriter::with_options(Vec::new(), options.clone());
    for entry in entries {
        writer.add_entry(entry)?;
    }
    writer.finish()
}
