//! Code specific to the ZIP file format specification.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`read`] and [`write`] modules.
//!
//! Most comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! [_Zip Files: History, Explanation and Implementation_]
//! is also a fantastic resource and a great read.
//!
//! [`read`]: ../read/index.html
//! [`write`]: ../write/index.html
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT
//! [_Zip Files: History, Explanation and Implementation_]: https://www.hanshq.net/zip.html

use std::borrow::Cow;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use codepage_437::*;
use memchr::memmem;

use crate::arch::usize;
use crate::read::{CompressionMethod, FileMetadata};
use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
pub const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// Central directory magic number
pub const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
pub const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];

/// Bit 11 of the general purpose flags: names are UTF-8
pub const UTF8_FLAG: u16 = 1 << 11;

/// The largest entry count the classic EOCDR can hold
pub const MAX_ENTRIES: u64 = u16::MAX as u64;
/// The largest size or offset the classic records can hold
pub const MAX_SIZE: u64 = u32::MAX as u64;
/// The largest name, extra field, or comment
pub const MAX_FIELD_LENGTH: u64 = u16::MAX as u64;

/// Zip64 extended information extra field ID
const ZIP64_EXTRA_FIELD: u16 = 0x0001;

impl CompressionMethod {
    fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Unsupported(v),
        }
    }

    pub(crate) fn to_u16(self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unsupported(v) => v,
        }
    }
}

/// The OS a file in the archive was compressed with.
/// Used to decode additional metadata like permissions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum System {
    Dos,
    Unix,
    Unknown,
}

impl System {
    pub fn from_source_version(source_version: u16) -> Self {
        // 4.4.2.1 The upper byte indicates the compatibility of the file
        // attribute information.  If the external file attributes
        // are compatible with MS-DOS and can be read by PKZIP for
        // DOS version 2.04g then this value will be zero.  If these
        // attributes are not compatible, then this value will
        // identify the host system on which the attributes are
        // compatible.
        //
        // 4.4.2.2 The current mappings are:
        //
        //  0 - MS-DOS and OS/2 (FAT / VFAT / FAT32 file systems)
        //  3 - UNIX
        //  (and a couple dozen others we don't care about)
        match source_version >> 8 {
            0 => System::Dos,
            3 => System::Unix,
            _ => System::Unknown,
        }
    }
}

/// "Version made by": Unix attributes, spec version 2.0
pub const SOURCE_VERSION: u16 = (3 << 8) | 20;

/// The minimum version needed to extract an entry stored with the given method.
pub fn minimum_extract_version(method: CompressionMethod, is_dir: bool) -> u16 {
    // 4.4.3.2 Current minimum feature versions are as defined below:
    //
    //  1.0 - Default value
    //  2.0 - File is a folder (directory)
    //  2.0 - File is compressed using Deflate compression
    if is_dir || method == CompressionMethod::Deflate {
        20
    } else {
        10
    }
}

/// Splits `n` bytes off the front of the provided slice, shrinking it.
///
/// Unlike `split_at()`, this returns an error (instead of panicking)
/// when the input is truncated.
fn take<'a>(input: &mut &'a [u8], n: usize) -> ZipResult<&'a [u8]> {
    if input.len() < n {
        return Err(ZipError::InvalidArchive("Unexpected end of archive"));
    }
    let (front, rest) = input.split_at(n);
    *input = rest;
    Ok(front)
}

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> ZipResult<u64> {
    let b = take(input, 8)?;
    Ok(u64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> ZipResult<u32> {
    let b = take(input, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> ZipResult<u16> {
    let b = take(input, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Narrows a variable-length field's length to the 16 bits the records give it.
/// Callers validate lengths first; this is the last line.
fn field_length(field: &[u8]) -> u16 {
    debug_assert!(field.len() as u64 <= MAX_FIELD_LENGTH);
    field.len() as u16
}

/// Data from the End of central directory record
///
/// Found at the back of the ZIP archive and provides offsets for finding
/// its central directory, along with lots of stuff that stopped being relevant
/// when we stopped breaking ZIP archives onto multiple floppies.
#[derive(Debug, PartialEq, Eq)]
pub struct EndOfCentralDirectory<'a> {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub file_comment: &'a [u8],
}

impl<'a> EndOfCentralDirectory<'a> {
    // 4.3.16  End of central directory record:
    //
    // end of central dir signature    4 bytes  (0x06054b50)
    // number of this disk             2 bytes
    // number of the disk with the
    // start of the central directory  2 bytes
    // total number of entries in
    // the central dir on this disk    2 bytes
    // total number of entries in
    // the central dir                 2 bytes
    // size of the central directory   4 bytes
    // offset of start of central
    // directory with respect to
    // the starting disk number        4 bytes
    // zipfile comment length          2 bytes
    // zipfile comment (variable size)

    pub const FIXED_SIZE: usize = 22;

    pub fn parse(mut eocdr: &'a [u8]) -> ZipResult<Self> {
        if take(&mut eocdr, 4)? != EOCDR_MAGIC {
            return Err(ZipError::InvalidArchive(
                "Invalid End Of Central Directory Record",
            ));
        }
        let disk_number = read_u16(&mut eocdr)?;
        let disk_with_central_directory = read_u16(&mut eocdr)?;
        let entries_on_this_disk = read_u16(&mut eocdr)?;
        let entries = read_u16(&mut eocdr)?;
        let central_directory_size = read_u32(&mut eocdr)?;
        let central_directory_offset = read_u32(&mut eocdr)?;
        let comment_length = usize(read_u16(&mut eocdr)?)?;
        let file_comment = take(&mut eocdr, comment_length)?;

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment,
        })
    }

    /// True if the classic fields describe a central directory that ends
    /// right where this record starts (possibly after some prepended data).
    ///
    /// Zip64 archives put their own records in that gap,
    /// so this is how we tell them apart from classic ones
    /// whose last entry's name just happens to look like a Zip64 locator.
    pub fn describes_central_directory(&self, mapping: &[u8], eocdr_posit: usize) -> bool {
        if self.entries == 0 && self.central_directory_size == 0 {
            return true;
        }
        let start = usize(self.central_directory_size)
            .ok()
            .and_then(|size| eocdr_posit.checked_sub(size));
        match (start, usize(self.central_directory_offset)) {
            (Some(start), Ok(nominal)) => {
                start >= nominal
                    && mapping
                        .get(start..)
                        .map_or(false, |cd| cd.starts_with(&CENTRAL_DIRECTORY_MAGIC))
            }
            _ => false,
        }
    }

    /// Returns the limit an archive ran past if one of the classic fields
    /// holds the "look in the Zip64 record" sentinel.
    pub fn saturated_field_error(&self) -> Option<ZipError> {
        let saturated = |what: &'static str, size: u64, limit: u64| {
            (size == limit).then(|| ZipError::SizeLimit {
                what,
                size: limit + 1,
                limit,
            })
        };
        saturated("Entry count", self.entries.into(), MAX_ENTRIES)
            .or_else(|| {
                saturated(
                    "Central directory size",
                    self.central_directory_size.into(),
                    MAX_SIZE,
                )
            })
            .or_else(|| {
                saturated(
                    "Central directory offset",
                    self.central_directory_offset.into(),
                    MAX_SIZE,
                )
            })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&EOCDR_MAGIC);
        write_u16(out, self.disk_number);
        write_u16(out, self.disk_with_central_directory);
        write_u16(out, self.entries_on_this_disk);
        write_u16(out, self.entries);
        write_u32(out, self.central_directory_size);
        write_u32(out, self.central_directory_offset);
        write_u16(out, field_length(self.file_comment));
        out.extend_from_slice(self.file_comment);
    }
}

/// Searches backward through `mapping` to find the
/// End of central directory record.
///
/// It should be right at the end of the file,
/// but its variable-length comment means we can't jump to a known offset.
/// A candidate only counts if its comment ends exactly where the archive does,
/// so a stray magic number in the comment itself doesn't fool us.
pub fn find_eocdr(mapping: &[u8]) -> ZipResult<usize> {
    let max_record_size = EndOfCentralDirectory::FIXED_SIZE + MAX_FIELD_LENGTH as usize;
    let search_start = mapping.len().saturating_sub(max_record_size);

    let mut search_space = &mapping[search_start..];
    while let Some(candidate) = memmem::rfind(search_space, &EOCDR_MAGIC) {
        let posit = search_start + candidate;
        if let Some(fixed) = mapping.get(posit..posit + EndOfCentralDirectory::FIXED_SIZE) {
            let comment_length = u16::from_le_bytes([fixed[20], fixed[21]]) as usize;
            if posit + EndOfCentralDirectory::FIXED_SIZE + comment_length == mapping.len() {
                return Ok(posit);
            }
        }
        search_space = &search_space[..candidate];
    }
    Err(ZipError::InvalidArchive(
        "Couldn't find End Of Central Directory Record",
    ))
}

/// Data from the Zip64 end of central directory locator
///
/// This should immediately precede the End of central directory record
/// on Zip64 files and tell us where to find the Zip64 end of central directory record.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub zip64_eocdr_offset: u64,
}

impl Zip64EndOfCentralDirectoryLocator {
    pub const SIZE: usize = 20;

    /// Looks for the locator just before the EOCDR at `eocdr_posit`.
    pub fn find(mapping: &[u8], eocdr_posit: usize) -> ZipResult<Option<Self>> {
        // 4.3.15 Zip64 end of central directory locator
        //
        // zip64 end of central dir locator
        // signature                       4 bytes  (0x07064b50)
        // number of the disk with the
        // start of the zip64 end of
        // central directory               4 bytes
        // relative offset of the zip64
        // end of central directory record 8 bytes
        // total number of disks           4 bytes
        let start = match eocdr_posit.checked_sub(Self::SIZE) {
            Some(s) => s,
            None => return Ok(None),
        };
        let mut locator = &mapping[start..eocdr_posit];
        if take(&mut locator, 4)? != ZIP64_EOCDR_LOCATOR_MAGIC {
            return Ok(None);
        }
        let _disk_with_central_directory = read_u32(&mut locator)?;
        let zip64_eocdr_offset = read_u64(&mut locator)?;

        Ok(Some(Self { zip64_eocdr_offset }))
    }
}

/// The interesting part of a Zip64 end of central directory record
///
/// We don't read Zip64 archives,
/// but we do want to tell the user which classic limit they blew past.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectory {
    pub entries: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    pub fn parse(mut eocdr: &[u8]) -> ZipResult<Self> {
        // 4.3.14  Zip64 end of central directory record
        //
        // zip64 end of central dir
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 end of central
        // directory record                8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // number of the disk with the
        // start of the central directory  4 bytes
        // total number of entries in the
        // central directory on this disk  8 bytes
        // total number of entries in the
        // central directory               8 bytes
        // size of the central directory   8 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        8 bytes
        if take(&mut eocdr, 4)? != ZIP64_EOCDR_MAGIC {
            return Err(ZipError::InvalidArchive(
                "Couldn't find zip64 End Of Central Directory Record",
            ));
        }
        take(&mut eocdr, 8 + 2 + 2 + 4 + 4 + 8)?;
        let entries = read_u64(&mut eocdr)?;
        let central_directory_size = read_u64(&mut eocdr)?;
        let central_directory_offset = read_u64(&mut eocdr)?;
        Ok(Self {
            entries,
            central_directory_size,
            central_directory_offset,
        })
    }

    /// Returns the error describing which classic limit this archive exceeds.
    pub fn limit_error(&self) -> ZipError {
        if self.entries > MAX_ENTRIES {
            return ZipError::SizeLimit {
                what: "Entry count",
                size: self.entries,
                limit: MAX_ENTRIES,
            };
        }
        if self.central_directory_size > MAX_SIZE {
            return ZipError::SizeLimit {
                what: "Central directory size",
                size: self.central_directory_size,
                limit: MAX_SIZE,
            };
        }
        if self.central_directory_offset > MAX_SIZE {
            return ZipError::SizeLimit {
                what: "Central directory offset",
                size: self.central_directory_offset,
                limit: MAX_SIZE,
            };
        }
        ZipError::UnsupportedArchive(String::from("No support for Zip64 archives"))
    }
}

/// Data from a central directory entry
///
/// Each of these records contians information about a file or folder
/// stored in the ZIP archive.
#[derive(Debug, PartialEq, Eq)]
pub struct CentralDirectoryEntry<'a> {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
    pub file_comment: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    // 4.3.12  Central directory structure:
    //
    //   central file header signature   4 bytes  (0x02014b50)
    //   version made by                 2 bytes
    //   version needed to extract       2 bytes
    //   general purpose bit flag        2 bytes
    //   compression method              2 bytes
    //   last mod file time              2 bytes
    //   last mod file date              2 bytes
    //   crc-32                          4 bytes
    //   compressed size                 4 bytes
    //   uncompressed size               4 bytes
    //   file name length                2 bytes
    //   extra field length              2 bytes
    //   file comment length             2 bytes
    //   disk number start               2 bytes
    //   internal file attributes        2 bytes
    //   external file attributes        4 bytes
    //   relative offset of local header 4 bytes
    //
    //   file name (variable size)
    //   extra field (variable size)
    //   file comment (variable size)

    pub const FIXED_SIZE: usize = 46;

    pub fn parse_and_consume(entry: &mut &'a [u8]) -> ZipResult<Self> {
        if take(entry, 4)? != CENTRAL_DIRECTORY_MAGIC {
            return Err(ZipError::InvalidArchive("Invalid central directory entry"));
        }
        let source_version = read_u16(entry)?;
        let minimum_extract_version = read_u16(entry)?;
        let flags = read_u16(entry)?;
        let compression_method = read_u16(entry)?;
        let last_modified_time = read_u16(entry)?;
        let last_modified_date = read_u16(entry)?;
        let crc32 = read_u32(entry)?;
        let compressed_size = read_u32(entry)?;
        let uncompressed_size = read_u32(entry)?;
        let path_length = usize(read_u16(entry)?)?;
        let extra_field_length = usize(read_u16(entry)?)?;
        let file_comment_length = usize(read_u16(entry)?)?;
        let disk_number = read_u16(entry)?;
        let internal_file_attributes = read_u16(entry)?;
        let external_file_attributes = read_u32(entry)?;
        let header_offset = read_u32(entry)?;
        let path = take(entry, path_length)?;
        let extra_field = take(entry, extra_field_length)?;
        let file_comment = take(entry, file_comment_length)?;

        Ok(Self {
            source_version,
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            internal_file_attributes,
            external_file_attributes,
            header_offset,
            path,
            extra_field,
            file_comment,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&CENTRAL_DIRECTORY_MAGIC);
        write_u16(out, self.source_version);
        write_u16(out, self.minimum_extract_version);
        write_u16(out, self.flags);
        write_u16(out, self.compression_method);
        write_u16(out, self.last_modified_time);
        write_u16(out, self.last_modified_date);
        write_u32(out, self.crc32);
        write_u32(out, self.compressed_size);
        write_u32(out, self.uncompressed_size);
        write_u16(out, field_length(self.path));
        write_u16(out, field_length(self.extra_field));
        write_u16(out, field_length(self.file_comment));
        write_u16(out, self.disk_number);
        write_u16(out, self.internal_file_attributes);
        write_u32(out, self.external_file_attributes);
        write_u32(out, self.header_offset);
        out.extend_from_slice(self.path);
        out.extend_from_slice(self.extra_field);
        out.extend_from_slice(self.file_comment);
    }

    pub fn size_in_file(&self) -> usize {
        Self::FIXED_SIZE + self.path.len() + self.extra_field.len() + self.file_comment.len()
    }
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumped to be CP437.
fn is_utf8(flags: u16) -> bool {
    // Bit 11: Language encoding flag (EFS).  If this bit is set,
    //         the filename and comment fields for this file
    //         MUST be encoded using UTF-8. (see APPENDIX D)
    flags & UTF8_FLAG != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
fn is_encrypted(flags: u16) -> bool {
    // Bit 0: If set, indicates that the file is encrypted
    flags & 1 != 0
}

/// Extracts the "sizes and CRC follow the data" bit from the 16-bit flags field.
fn has_data_descriptor(flags: u16) -> bool {
    // Bit 3: If this bit is set, the fields crc-32, compressed
    //        size and uncompressed size are set to zero in the
    //        local header.  The correct values are put in the
    //        data descriptor immediately following the compressed
    //        data.
    flags & (1 << 3) != 0
}

/// Decodes a raw path as UTF-8 or CP437, depending on the flags.
fn decode_path(raw: &[u8], flags: u16) -> ZipResult<Cow<'_, Utf8Path>> {
    if is_utf8(flags) {
        let utf8 = std::str::from_utf8(raw).map_err(ZipError::Encoding)?;
        Ok(Cow::Borrowed(Utf8Path::new(utf8)))
    } else {
        let str_cow: Cow<str> = Cow::borrow_from_cp437(raw, &CP437_CONTROL);
        // Annoying: doesn't seem to be any Cow<str> -> Cow<Path>
        Ok(match str_cow {
            Cow::Borrowed(s) => Cow::Borrowed(Utf8Path::new(s)),
            Cow::Owned(s) => Cow::Owned(Utf8PathBuf::from(s)),
        })
    }
}

impl<'a> FileMetadata<'a> {
    /// Extracts `FileMetadata` from a central directory entry
    pub(crate) fn from_cde(cde: &CentralDirectoryEntry<'a>) -> ZipResult<Self> {
        let path = decode_path(cde.path, cde.flags)?;

        if cde.disk_number != 0 {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: file {} claims to be on disk {}",
                path, cde.disk_number,
            )));
        }

        check_extra_field(cde.extra_field, cde.uncompressed_size, cde.compressed_size)?;

        let unix_mode = match System::from_source_version(cde.source_version) {
            System::Unix => Some((cde.external_file_attributes >> 16) as u16),
            System::Dos | System::Unknown => None,
        };

        Ok(Self {
            size: usize(cde.uncompressed_size)?,
            compressed_size: usize(cde.compressed_size)?,
            compression_method: CompressionMethod::from_u16(cde.compression_method),
            crc32: cde.crc32,
            encrypted: is_encrypted(cde.flags),
            path,
            last_modified: parse_msdos(cde.last_modified_time, cde.last_modified_date),
            unix_mode,
            header_offset: usize(cde.header_offset)?,
            has_data_descriptor: has_data_descriptor(cde.flags),
        })
    }

    /// Extract metadata from a local file header.
    ///
    /// The local header doesn't contain the offset or attributes,
    /// and might defer its sizes and CRC to a data descriptor,
    /// so take those from the central directory's version.
    pub(crate) fn from_local_header(
        local: &LocalFileHeader<'a>,
        central: &FileMetadata<'_>,
    ) -> ZipResult<Self> {
        let path = decode_path(local.path, local.flags)?;
        let has_data_descriptor = has_data_descriptor(local.flags);

        let (size, compressed_size, crc32) = if has_data_descriptor {
            (central.size, central.compressed_size, central.crc32)
        } else {
            check_extra_field(
                local.extra_field,
                local.uncompressed_size,
                local.compressed_size,
            )?;
            (
                usize(local.uncompressed_size)?,
                usize(local.compressed_size)?,
                local.crc32,
            )
        };

        Ok(Self {
            size,
            compressed_size,
            compression_method: CompressionMethod::from_u16(local.compression_method),
            crc32,
            encrypted: is_encrypted(local.flags),
            path,
            last_modified: parse_msdos(local.last_modified_time, local.last_modified_date),
            unix_mode: central.unix_mode,
            header_offset: central.header_offset,
            has_data_descriptor,
        })
    }
}

/// Converts MS-DOS time and date fields to a timestamp,
/// or `None` if they don't name a real date (e.g., all zeroes).
pub fn parse_msdos(time: u16, date: u16) -> Option<NaiveDateTime> {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)?.and_hms_opt(hours, minutes, seconds)
}

/// Converts a timestamp to MS-DOS `(time, date)` fields.
///
/// DOS dates can't go before 1980 or after 2107; we clamp to that range.
/// Odd seconds round down.
pub fn to_msdos(timestamp: &NaiveDateTime) -> (u16, u16) {
    let earliest = NaiveDate::from_ymd_opt(1980, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0));
    let latest = NaiveDate::from_ymd_opt(2107, 12, 31).and_then(|d| d.and_hms_opt(23, 59, 58));
    let mut timestamp = *timestamp;
    if let Some(earliest) = earliest {
        timestamp = timestamp.max(earliest);
    }
    if let Some(latest) = latest {
        timestamp = timestamp.min(latest);
    }

    let time = ((timestamp.hour() as u16) << 11)
        | ((timestamp.minute() as u16) << 5)
        | (timestamp.second() as u16 / 2);
    let date = (((timestamp.year() - 1980) as u16) << 9)
        | ((timestamp.month() as u16) << 5)
        | timestamp.day() as u16;
    (time, date)
}

/// Walks the "extra fields" found in central directory entries
/// and local file headers, making sure they're well-formed.
///
/// We don't use any of them, but a Zip64 field means sizes and offsets
/// live beyond the classic 32-bit fields, so we report the limit it crossed.
fn check_extra_field(
    mut extra_field: &[u8],
    uncompressed_size: u32,
    compressed_size: u32,
) -> ZipResult<()> {
    // 4.5.1 In order to allow different programs and different types
    // of information to be stored in the 'extra' field in .ZIP
    // files, the following structure MUST be used for all
    // programs storing data in this field:

    //     header1+data1 + header2+data2 . . .

    // Each header MUST consist of:

    //     Header ID - 2 bytes
    //     Data Size - 2 bytes
    while !extra_field.is_empty() {
        let kind = read_u16(&mut extra_field)?;
        let field_len = usize(read_u16(&mut extra_field)?)?;
        let mut data = take(&mut extra_field, field_len).map_err(|_| {
            ZipError::InvalidArchive("Extra data field runs past the end of its record")
        })?;

        if kind == ZIP64_EXTRA_FIELD {
            // 4.5.3 The order of the fields in the zip64 extended
            // information record is fixed, but the fields MUST
            // only appear if the corresponding Local or Central
            // directory record field is set to 0xFFFF or 0xFFFFFFFF.
            for (what, field) in [
                ("Entry size", uncompressed_size),
                ("Compressed entry size", compressed_size),
            ] {
                if field == u32::MAX {
                    let size = read_u64(&mut data)?;
                    if size > MAX_SIZE {
                        return Err(ZipError::SizeLimit {
                            what,
                            size,
                            limit: MAX_SIZE,
                        });
                    }
                }
            }
            return Err(ZipError::UnsupportedArchive(String::from(
                "No support for Zip64 extended information",
            )));
        }
    }
    Ok(())
}

/// Data from a local file header
///
/// Each files' actual contents is preceded by this header.
/// These headers alllow for "streaming" decompression without
/// the use of the central directory,
/// but we only use them to double-check the central directory.
#[derive(Debug, PartialEq, Eq)]
pub struct LocalFileHeader<'a> {
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
}

impl<'a> LocalFileHeader<'a> {
    // 4.3.7  Local file header:
    //
    // local file header signature     4 bytes  (0x04034b50)
    // version needed to extract       2 bytes
    // general purpose bit flag        2 bytes
    // compression method              2 bytes
    // last mod file time              2 bytes
    // last mod file date              2 bytes
    // crc-32                          4 bytes
    // compressed size                 4 bytes
    // uncompressed size               4 bytes
    // file name length                2 bytes
    // extra field length              2 bytes
    //
    // file name (variable size)
    // extra field (variable size)

    pub const FIXED_SIZE: usize = 30;

    pub fn parse_and_consume(header: &mut &'a [u8]) -> ZipResult<Self> {
        if take(header, 4)? != LOCAL_FILE_HEADER_MAGIC {
            return Err(ZipError::InvalidArchive(
                "Missing local file header signature",
            ));
        }
        let minimum_extract_version = read_u16(header)?;
        let flags = read_u16(header)?;
        let compression_method = read_u16(header)?;
        let last_modified_time = read_u16(header)?;
        let last_modified_date = read_u16(header)?;
        let crc32 = read_u32(header)?;
        let compressed_size = read_u32(header)?;
        let uncompressed_size = read_u32(header)?;
        let path_length = usize(read_u16(header)?)?;
        let extra_field_length = usize(read_u16(header)?)?;
        let path = take(header, path_length)?;
        let extra_field = take(header, extra_field_length)?;

        Ok(Self {
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path,
            extra_field,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&LOCAL_FILE_HEADER_MAGIC);
        write_u16(out, self.minimum_extract_version);
        write_u16(out, self.flags);
        write_u16(out, self.compression_method);
        write_u16(out, self.last_modified_time);
        write_u16(out, self.last_modified_date);
        write_u32(out, self.crc32);
        write_u32(out, self.compressed_size);
        write_u32(out, self.uncompressed_size);
        write_u16(out, field_length(self.path));
        write_u16(out, field_length(self.extra_field));
        out.extend_from_slice(self.path);
        out.extend_from_slice(self.extra_field);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn timestamp(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_msdos_timestamps() {
        let t = timestamp(2021, 7, 14, 13, 37, 42);
        let (time, date) = to_msdos(&t);
        assert_eq!(parse_msdos(time, date), Some(t));

        // Two-second precision
        let odd = timestamp(2021, 7, 14, 13, 37, 43);
        let (time, date) = to_msdos(&odd);
        assert_eq!(parse_msdos(time, date), Some(t));

        // Zeroed fields aren't a date.
        assert_eq!(parse_msdos(0, 0), None);

        // Clamp to the representable range
        let (time, date) = to_msdos(&timestamp(1970, 1, 1, 0, 0, 0));
        assert_eq!((time, date), (0, (1 << 5) | 1));
        assert_eq!(
            parse_msdos(time, date),
            Some(timestamp(1980, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_eocdr_search_skips_magic_in_comment() {
        let mut archive = Vec::new();
        let comment = b"sneaky PK\x05\x06 comment";
        EndOfCentralDirectory {
            disk_number: 0,
            disk_with_central_directory: 0,
            entries_on_this_disk: 0,
            entries: 0,
            central_directory_size: 0,
            central_directory_offset: 0,
            file_comment: comment,
        }
        .write(&mut archive);

        assert_eq!(find_eocdr(&archive).unwrap(), 0);
        let eocdr = EndOfCentralDirectory::parse(&archive).unwrap();
        assert_eq!(eocdr.file_comment, comment);

        // Chop the comment short and the record no longer ends the archive.
        archive.pop();
        assert!(matches!(
            find_eocdr(&archive),
            Err(ZipError::InvalidArchive(_))
        ));
    }

    fn empty_eocdr() -> EndOfCentralDirectory<'static> {
        EndOfCentralDirectory {
            disk_number: 0,
            disk_with_central_directory: 0,
            entries_on_this_disk: 0,
            entries: 0,
            central_directory_size: 0,
            central_directory_offset: 0,
            file_comment: b"",
        }
    }

    #[test]
    fn test_saturated_fields() {
        assert!(empty_eocdr().saturated_field_error().is_none());

        let eocdr = EndOfCentralDirectory {
            central_directory_offset: u32::MAX,
            ..empty_eocdr()
        };
        match eocdr.saturated_field_error() {
            Some(ZipError::SizeLimit { what, size, limit }) => {
                assert_eq!(what, "Central directory offset");
                assert!(size > limit);
            }
            other => panic!("Expected a size limit error, got {:?}", other),
        }

        let eocdr = EndOfCentralDirectory {
            entries_on_this_disk: u16::MAX,
            entries: u16::MAX,
            ..empty_eocdr()
        };
        assert!(matches!(
            eocdr.saturated_field_error(),
            Some(ZipError::SizeLimit {
                what: "Entry count",
                ..
            })
        ));
    }

    #[test]
    fn test_central_directory_placement() {
        let mut archive = b"junk".to_vec();
        let cd_start = archive.len();
        archive.extend_from_slice(&CENTRAL_DIRECTORY_MAGIC);
        archive.extend_from_slice(&[0; 16]);
        let eocdr_posit = archive.len();

        let eocdr = EndOfCentralDirectory {
            entries_on_this_disk: 1,
            entries: 1,
            central_directory_size: 20,
            ..empty_eocdr()
        };
        assert!(eocdr.describes_central_directory(&archive, eocdr_posit));

        // Claims to start past where it actually does
        let eocdr = EndOfCentralDirectory {
            central_directory_offset: cd_start as u32 + 1,
            ..eocdr
        };
        assert!(!eocdr.describes_central_directory(&archive, eocdr_posit));

        // Doesn't land on a central directory record
        let eocdr = EndOfCentralDirectory {
            central_directory_size: 19,
            central_directory_offset: 0,
            ..eocdr
        };
        assert!(!eocdr.describes_central_directory(&archive, eocdr_posit));

        // Bigger than everything before it
        let eocdr = EndOfCentralDirectory {
            central_directory_size: u32::MAX,
            ..eocdr
        };
        assert!(!eocdr.describes_central_directory(&archive, eocdr_posit));

        assert!(empty_eocdr().describes_central_directory(&archive, eocdr_posit));
    }

    #[test]
    fn test_truncated_central_directory_entry() {
        let cde = CentralDirectoryEntry {
            source_version: SOURCE_VERSION,
            minimum_extract_version: 10,
            flags: 0,
            compression_method: 0,
            last_modified_time: 0,
            last_modified_date: 33,
            crc32: 0x1ad514ba,
            compressed_size: 8,
            uncompressed_size: 8,
            disk_number: 0,
            internal_file_attributes: 0,
            external_file_attributes: 0o100644 << 16,
            header_offset: 0,
            path: b"hello.txt",
            extra_field: b"",
            file_comment: b"",
        };
        let mut bytes = Vec::new();
        cde.write(&mut bytes);
        assert_eq!(bytes.len(), cde.size_in_file());

        let mut whole = &bytes[..];
        assert_eq!(
            CentralDirectoryEntry::parse_and_consume(&mut whole).unwrap(),
            cde
        );
        assert!(whole.is_empty());

        for cut in 0..bytes.len() {
            let mut truncated = &bytes[..cut];
            assert!(CentralDirectoryEntry::parse_and_consume(&mut truncated).is_err());
        }
    }

    #[test]
    fn test_cp437_names() {
        // 0x81 is ü in CP437, but not valid UTF-8 on its own.
        let path = decode_path(b"m\x81sli.txt", 0).unwrap();
        assert_eq!(path.as_str(), "müsli.txt");
        assert!(matches!(
            decode_path(b"m\x81sli.txt", UTF8_FLAG),
            Err(ZipError::Encoding(_))
        ));
    }

    #[test]
    fn test_zip64_extra_field() {
        let mut extra = Vec::new();
        write_u16(&mut extra, ZIP64_EXTRA_FIELD);
        write_u16(&mut extra, 8);
        extra.extend_from_slice(&(5 * MAX_SIZE).to_le_bytes());
        match check_extra_field(&extra, u32::MAX, 100) {
            Err(ZipError::SizeLimit { what, size, .. }) => {
                assert_eq!(what, "Entry size");
                assert_eq!(size, 5 * MAX_SIZE);
            }
            other => panic!("Expected a size limit error, got {:?}", other),
        }

        // Lies about its length
        let mut extra = Vec::new();
        write_u16(&mut extra, 0x5455);
        write_u16(&mut extra, 9);
        extra.push(1);
        assert!(matches!(
            check_extra_field(&extra, 0, 0),
            Err(ZipError::InvalidArchive(_))
        ));
    }
}
