//! Tools for reading a ZIP archive.
//!
//! To decode an archive in one go, call [`decode()`].
//! For more control (metadata, streaming reads, reading entries in parallel),
//! create a [`ZipArchive`] from the bytes.
//!
//! [`decode()`]: fn.decode.html
//! [`ZipArchive`]: struct.ZipArchive.html

use std::borrow::Cow;
use std::io;
use std::io::prelude::*;

use camino::{Utf8Component, Utf8Path};
use chrono::NaiveDateTime;
use flate2::read::DeflateDecoder;
use log::*;

use crate::arch::usize;
use crate::crc_reader::{ChecksumError, Crc32Reader};
use crate::result::*;
use crate::spec;
use crate::write::ArchiveEntry;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// The file is uncompressed
    #[default]
    Stored,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

/// Metadata for a file or directory in the archive,
/// retrieved from its central directory
#[derive(Debug, PartialEq, Eq)]
pub struct FileMetadata<'a> {
    /// Uncompressed size of the file in bytes
    pub size: usize,

    /// Compressed size of the file in bytes
    pub compressed_size: usize,

    /// Compression algorithm used to store the file
    pub compression_method: CompressionMethod,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// True if the file is encrypted (decryption is unsupported)
    pub encrypted: bool,

    /// The provided path of the file.
    pub path: Cow<'a, Utf8Path>,

    /// When the file was last modified,
    /// or `None` if the archive recorded a nonsensical MS-DOS date.
    pub last_modified: Option<NaiveDateTime>,

    /// Unix mode bits, if the file was archived in a Unix OS.
    ///
    /// This library does _not_ try to convert DOS permission bits into
    /// roughly-equivalent Unix mode bits, or do other cross-OS handwaving.
    pub unix_mode: Option<u16>,

    /// The offset to the local file header in the archive
    pub(crate) header_offset: usize,

    /// True if the local header defers its sizes and CRC to a data descriptor
    pub(crate) has_data_descriptor: bool,
}

impl FileMetadata<'_> {
    /// Returns true if the given entry is a directory
    pub fn is_dir(&self) -> bool {
        // Path::ends_with() doesn't consider separators,
        // so we need a different approach.
        self.size == 0 && self.path.as_str().ends_with('/')
    }

    /// Returns true if the given entry is a file
    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    pub fn into_owned(self) -> FileMetadata<'static> {
        FileMetadata {
            path: Cow::Owned(self.path.into_owned()),
            ..self
        }
    }
}

/// A ZIP archive to be read
#[derive(Debug)]
pub struct ZipArchive<'a> {
    /// The contents of the ZIP archive, as a byte slice,
    /// starting at the archive proper (i.e., after any prepended data).
    mapping: &'a [u8],
    /// A list of entries from the ZIP's central directory
    entries: Vec<FileMetadata<'a>>,
    /// Where the central directory starts, which is also where file data must end.
    central_directory_offset: usize,
    /// The archive's comment, from the End of central directory record
    comment: &'a [u8],
}

impl<'a> ZipArchive<'a> {
    /// Reads a ZIP archive from a byte slice.
    ///
    /// The slice must hold just the archive: it must start with a
    /// local file header (unless the archive is empty)
    /// and end with the End of central directory record.
    ///
    /// ```
    /// # use zipcodec::*;
    /// let bytes = encode(&[ArchiveEntry::new("hello.txt", "Hi there")])?;
    /// let archive = ZipArchive::new(&bytes)?;
    /// assert_eq!(archive.entries()[0].path.as_str(), "hello.txt");
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(mapping: &'a [u8]) -> ZipResult<Self> {
        let (new_archive, archive_offset) = Self::with_prepended_data(mapping)?;
        if archive_offset != 0 {
            return Err(ZipError::PrependedWithUnknownBytes(archive_offset));
        }
        if !new_archive.entries.is_empty()
            && !new_archive.mapping.starts_with(&spec::LOCAL_FILE_HEADER_MAGIC)
        {
            return Err(ZipError::InvalidArchive(
                "Archive doesn't start with a local file header",
            ));
        }
        Ok(new_archive)
    }

    /// Like `ZipArchive::new()`, but allows arbitrary data to prepend the archive.
    /// Returns the ZipArchive and the number of bytes prepended to the archive.
    ///
    /// Since a ZIP archive's metadata sits at the back of the file,
    /// many formats consist of ZIP archives prepended with some other data.
    /// For example, a self-extracting archive is one with an executable in the front.
    pub fn with_prepended_data(mapping: &'a [u8]) -> ZipResult<(Self, usize)> {
        if mapping.len() < spec::EndOfCentralDirectory::FIXED_SIZE {
            return Err(ZipError::InvalidArchive("Too small to be a Zip archive"));
        }
        let eocdr_posit = spec::find_eocdr(mapping)?;
        let eocdr = spec::EndOfCentralDirectory::parse(&mapping[eocdr_posit..])?;
        trace!("{:?}", eocdr);

        if eocdr.disk_number != eocdr.disk_with_central_directory {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: disk ({}) != disk with central directory ({})",
                eocdr.disk_number, eocdr.disk_with_central_directory
            )));
        }
        if eocdr.entries != eocdr.entries_on_this_disk {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: entries ({}) != entries this disk ({})",
                eocdr.entries, eocdr.entries_on_this_disk
            )));
        }

        if !eocdr.describes_central_directory(mapping, eocdr_posit) {
            if let Some(zip64_eocdr_locator) =
                spec::Zip64EndOfCentralDirectoryLocator::find(mapping, eocdr_posit)?
            {
                trace!("{:?}", zip64_eocdr_locator);
                // We don't read these, but try to say which limit the archive needed them for.
                let zip64_eocdr_end = eocdr_posit - spec::Zip64EndOfCentralDirectoryLocator::SIZE;
                let zip64_eocdr = usize(zip64_eocdr_locator.zip64_eocdr_offset)
                    .ok()
                    .and_then(|start| mapping.get(start..zip64_eocdr_end))
                    .and_then(|record| spec::Zip64EndOfCentralDirectory::parse(record).ok());
                return Err(match zip64_eocdr {
                    Some(zip64_eocdr) => {
                        trace!("{:?}", zip64_eocdr);
                        zip64_eocdr.limit_error()
                    }
                    None => {
                        ZipError::UnsupportedArchive(String::from("No support for Zip64 archives"))
                    }
                });
            }
            if let Some(e) = eocdr.saturated_field_error() {
                return Err(e);
            }
        }

        // Zip files can be prepended by arbitrary junk,
        // so all the given positions might be off.
        // The offset is the actual position versus the stored one.
        let central_directory_size = usize(eocdr.central_directory_size)?;
        let nominal_offset = usize(eocdr.central_directory_offset)?;
        let archive_offset = eocdr_posit
            .checked_sub(central_directory_size)
            .and_then(|actual| actual.checked_sub(nominal_offset))
            .ok_or(ZipError::InvalidArchive(
                "Invalid central directory size or offset",
            ))?;

        let mapping = &mapping[archive_offset..];
        trace!(
            "{} entries at nominal offset {}",
            eocdr.entries,
            nominal_offset
        );

        if usize(eocdr.entries)? * spec::CentralDirectoryEntry::FIXED_SIZE > central_directory_size
        {
            return Err(ZipError::InvalidArchive(
                "Central directory too small for its entry count",
            ));
        }

        let mut central_directory =
            &mapping[nominal_offset..nominal_offset + central_directory_size];

        let mut entries = Vec::with_capacity(usize(eocdr.entries)?);

        for _ in 0..eocdr.entries {
            let dir_entry = spec::CentralDirectoryEntry::parse_and_consume(&mut central_directory)?;
            trace!("{:?}", dir_entry);

            let file_metadata = FileMetadata::from_cde(&dir_entry)?;
            debug!("{:?}", file_metadata);
            warn_on_strange_path(&file_metadata.path);
            entries.push(file_metadata);
        }

        if !central_directory.is_empty() {
            return Err(ZipError::InvalidArchive(
                "Central directory size doesn't match its entries",
            ));
        }

        Ok((
            ZipArchive {
                mapping,
                entries,
                central_directory_offset: nominal_offset,
                comment: eocdr.file_comment,
            },
            archive_offset,
        ))
    }

    /// Returns the entries found in the ZIP archive's central directory,
    /// in the order the directory lists them.
    ///
    /// No effort is made to deduplicate these entries;
    /// archives made elsewhere can hold the same path twice.
    pub fn entries(&self) -> &[FileMetadata<'a>] {
        &self.entries
    }

    /// Returns the archive's comment.
    pub fn comment(&self) -> &'a [u8] {
        self.comment
    }

    /// Reads the given file from the ZIP archive.
    ///
    /// Since each file in a ZIP archive is compressed independently,
    /// multiple files can be read in parallel.
    ///
    /// The CRC-32 is checked once the reader hits EOF;
    /// a mismatch comes back as an `io::Error` of kind `InvalidData`.
    /// Use [`read_to_vec()`](#method.read_to_vec) to get a [`ZipError`] instead.
    pub fn read(&self, metadata: &FileMetadata<'_>) -> ZipResult<Box<dyn io::Read + Send + 'a>> {
        let corrupt = |reason: &'static str| ZipError::CorruptEntry {
            path: metadata.path.to_string(),
            reason,
        };

        if metadata.header_offset >= self.central_directory_offset {
            return Err(corrupt("Local header offset points past the file data"));
        }
        let mut file_slice = &self.mapping[metadata.header_offset..self.central_directory_offset];
        let local_header =
            spec::LocalFileHeader::parse_and_consume(&mut file_slice).map_err(|e| match e {
                ZipError::InvalidArchive(reason) => corrupt(reason),
                other => other,
            })?;
        trace!("{:?}", local_header);
        let local_metadata = FileMetadata::from_local_header(&local_header, metadata)?;
        debug!("Reading {:?}", local_metadata);
        if cfg!(feature = "check-local-metadata") && *metadata != local_metadata {
            return Err(corrupt(
                "Central directory entry doesn't match local file header",
            ));
        }

        if metadata.encrypted {
            return Err(ZipError::UnsupportedArchive(format!(
                "Can't read encrypted file {}",
                metadata.path
            )));
        }

        if file_slice.len() < metadata.compressed_size {
            return Err(corrupt("Entry data runs into the central directory"));
        }

        make_reader(
            metadata.compression_method,
            metadata.crc32,
            io::Cursor::new(&file_slice[0..metadata.compressed_size]),
        )
    }

    /// Reads the given file from the ZIP archive into memory,
    /// checking its size and CRC-32 along the way.
    pub fn read_to_vec(&self, metadata: &FileMetadata<'_>) -> ZipResult<Vec<u8>> {
        let reader = self.read(metadata)?;
        let path = || metadata.path.to_string();

        // Read one past the declared size so we notice entries
        // that decompress to more than they claim.
        let mut contents = Vec::new();
        reader
            .take(metadata.size as u64 + 1)
            .read_to_end(&mut contents)
            .map_err(|e| match ChecksumError::from_io(&e) {
                Some(ChecksumError { expected, actual }) => ZipError::ChecksumMismatch {
                    path: path(),
                    expected,
                    actual,
                },
                None => ZipError::CorruptEntry {
                    path: path(),
                    reason: "Couldn't decompress entry data",
                },
            })?;

        if contents.len() != metadata.size {
            return Err(ZipError::CorruptEntry {
                path: path(),
                reason: "Entry size doesn't match its header",
            });
        }
        Ok(contents)
    }
}

/// ZIP archives can name anything.
/// We hand names back as-is, but it's worth a word if they escape their directory.
fn warn_on_strange_path(path: &Utf8Path) {
    for component in path.components() {
        match component {
            Utf8Component::Prefix(_) | Utf8Component::RootDir => {
                warn!("Absolute path {path} found in archive");
                return;
            }
            Utf8Component::ParentDir => {
                warn!("Parent dir (..) found in path {path}");
                return;
            }
            Utf8Component::CurDir | Utf8Component::Normal(_) => {}
        }
    }
}

/// Returns a boxed read trait for a compressed file,
/// given its compression method and expected CRC.
fn make_reader<'a, R: io::Read + Send + 'a>(
    compression_method: CompressionMethod,
    crc32: u32,
    reader: R,
) -> ZipResult<Box<dyn io::Read + Send + 'a>> {
    match compression_method {
        CompressionMethod::Stored => Ok(Box::new(Crc32Reader::new(reader, crc32))),
        CompressionMethod::Deflate => {
            let deflate_reader = DeflateDecoder::new(reader);
            Ok(Box::new(Crc32Reader::new(deflate_reader, crc32)))
        }
        CompressionMethod::Unsupported(method) => Err(ZipError::UnsupportedArchive(format!(
            "Compression method {method} not supported"
        ))),
    }
}

/// What to do with entries whose contents fail their CRC-32
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum IntegrityPolicy {
    /// Fail the whole decode, returning no entries at all.
    #[default]
    Abort,
    /// Drop just the offending entries, listing them in [`DecodedArchive::discarded`].
    /// Structural problems still fail the whole decode.
    DiscardEntry,
}

/// Options for [`decode_with()`]
#[derive(Debug, Copy, Clone, Default)]
pub struct DecodeOptions {
    integrity_policy: IntegrityPolicy,
    allow_prepended_data: bool,
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set what happens to entries that fail their CRC-32.
    ///
    /// The default is `IntegrityPolicy::Abort`.
    pub fn integrity_policy(mut self, policy: IntegrityPolicy) -> Self {
        self.integrity_policy = policy;
        self
    }

    /// Accept archives with unknown bytes in front of them
    /// (see [`ZipArchive::with_prepended_data()`]).
    ///
    /// The default is to reject them.
    pub fn allow_prepended_data(mut self, allow: bool) -> Self {
        self.allow_prepended_data = allow;
        self
    }
}

/// The result of [`decode_with()`]
#[derive(Debug)]
pub struct DecodedArchive {
    /// Decoded entries, in central directory order
    pub entries: Vec<ArchiveEntry>,
    /// Entries dropped under `IntegrityPolicy::DiscardEntry`,
    /// as the errors they failed with.
    pub discarded: Vec<ZipError>,
    /// The archive's comment
    pub comment: Vec<u8>,
    /// How many unknown bytes preceded the archive
    pub prepended_bytes: usize,
}

/// Decodes a ZIP archive into its entries, in central directory order.
///
/// Any structural problem or CRC mismatch fails the whole decode.
///
/// ```
/// # use zipcodec::*;
/// let bytes = encode(&[ArchiveEntry::new("hello.txt", "Hi there")])?;
/// let entries = decode(&bytes)?;
/// assert_eq!(entries, [ArchiveEntry::new("hello.txt", "Hi there")]);
/// # Ok::<(), zipcodec::result::ZipError>(())
/// ```
pub fn decode(bytes: &[u8]) -> ZipResult<Vec<ArchiveEntry>> {
    decode_with(bytes, &DecodeOptions::default()).map(|decoded| decoded.entries)
}

/// Decodes a ZIP archive with the given options.
pub fn decode_with(bytes: &[u8], options: &DecodeOptions) -> ZipResult<DecodedArchive> {
    let (archive, prepended_bytes) = if options.allow_prepended_data {
        ZipArchive::with_prepended_data(bytes)?
    } else {
        (ZipArchive::new(bytes)?, 0)
    };

    let mut entries = Vec::with_capacity(archive.entries().len());
    let mut discarded = Vec::new();

    for metadata in archive.entries() {
        match archive.read_to_vec(metadata) {
            Ok(content) => entries.push(ArchiveEntry {
                name: metadata.path.as_str().to_owned(),
                content,
            }),
            Err(e)
                if e.is_integrity()
                    && options.integrity_policy == IntegrityPolicy::DiscardEntry =>
            {
                warn!("Discarding {}: {}", metadata.path, e);
                discarded.push(e);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(DecodedArchive {
        entries,
        discarded,
        comment: archive.comment().to_vec(),
        prepended_bytes,
    })
}
