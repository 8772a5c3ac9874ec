use std::io;

use chrono::NaiveDate;

use zipcodec::read::{DecodeOptions, IntegrityPolicy};
use zipcodec::result::ZipError;
use zipcodec::write::{EncodeOptions, ZipWriter};
use zipcodec::*;

/// Cheap, deterministic noise (xorshift64) so content doesn't compress away.
fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn sample_entries() -> Vec<ArchiveEntry> {
    vec![
        ArchiveEntry::new("empty.txt", ""),
        ArchiveEntry::directory("nested"),
        ArchiveEntry::new("nested/noise.bin", noise(1, 70_000)),
        ArchiveEntry::new("nested/deeper/lines.txt", "line\n".repeat(3000)),
        ArchiveEntry::new("one-byte", "!"),
        ArchiveEntry::new("Grüße/日本語.txt", "non-ASCII names"),
    ]
}

/// Where each entry's data starts and ends in a stored archive.
/// We lay these out ourselves so the tests don't trust the decoder to find them.
fn stored_content_ranges(entries: &[ArchiveEntry]) -> Vec<std::ops::Range<usize>> {
    let mut offset = 0;
    entries
        .iter()
        .map(|e| {
            let start = offset + 30 + e.name.len();
            offset = start + e.content.len();
            start..offset
        })
        .collect()
}

#[test]
fn hello_there() {
    let bytes = encode(&[ArchiveEntry::new("hello.txt", "Hi there")]).unwrap();
    assert_eq!(&bytes[0..4], &[0x50, 0x4B, 0x03, 0x04]);
    assert_eq!(
        decode(&bytes).unwrap(),
        [ArchiveEntry::new("hello.txt", "Hi there")]
    );
}

#[test]
fn round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let entries = sample_entries();
    for method in [CompressionMethod::Stored, CompressionMethod::Deflate] {
        let options = EncodeOptions::new().compression_method(method);
        let bytes = encode_with(&entries, &options).unwrap();
        assert_eq!(decode(&bytes).unwrap(), entries, "{:?}", method);
    }

    // Encoding is deterministic.
    assert_eq!(encode(&entries).unwrap(), encode(&entries).unwrap());
}

#[test]
fn empty_archive() {
    let bytes = encode(&[]).unwrap();
    assert_eq!(bytes.len(), 22);
    assert_eq!(&bytes[0..4], &[0x50, 0x4B, 0x05, 0x06]);
    // Entry counts
    assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
    assert!(decode(&bytes).unwrap().is_empty());
}

#[test]
fn flipped_content_bytes_fail_the_checksum() {
    let entries = vec![
        ArchiveEntry::new("a.txt", "alpha"),
        ArchiveEntry::new("b/bravo.bin", noise(2, 300)),
        ArchiveEntry::new("c.txt", "charlie"),
    ];
    let bytes = encode(&entries).unwrap();

    for (entry, range) in entries.iter().zip(stored_content_ranges(&entries)) {
        assert_eq!(&bytes[range.clone()], &entry.content[..]);
        for i in range {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x20;
            match decode(&corrupted) {
                Err(e @ ZipError::ChecksumMismatch { .. }) => {
                    assert!(e.is_integrity());
                    assert_eq!(e.entry_path(), Some(entry.name.as_str()));
                }
                other => panic!("Flipping byte {} gave {:?}", i, other),
            }
        }
    }
}

#[test]
fn discard_corrupt_entries() {
    let _ = env_logger::builder().is_test(true).try_init();

    let entries = vec![
        ArchiveEntry::new("a.txt", "alpha"),
        ArchiveEntry::new("b.txt", "bravo"),
        ArchiveEntry::new("c.txt", "charlie"),
    ];
    let mut bytes = encode(&entries).unwrap();
    let bravo = stored_content_ranges(&entries)[1].clone();
    bytes[bravo.start] = b'B';

    // By default, nothing comes back.
    assert!(matches!(
        decode(&bytes),
        Err(ZipError::ChecksumMismatch { .. })
    ));

    let decoded = decode_with(
        &bytes,
        &DecodeOptions::new().integrity_policy(IntegrityPolicy::DiscardEntry),
    )
    .unwrap();
    assert_eq!(decoded.entries, [entries[0].clone(), entries[2].clone()]);
    assert_eq!(decoded.discarded.len(), 1);
    assert_eq!(decoded.discarded[0].entry_path(), Some("b.txt"));
}

#[test]
fn duplicate_names_are_rejected() {
    let result = encode(&[
        ArchiveEntry::new("a.txt", "first"),
        ArchiveEntry::new("a.txt", "second"),
    ]);
    match result {
        Err(ZipError::InvalidEntry { path, reason }) => {
            assert_eq!(path, "a.txt");
            assert_eq!(reason, "Duplicate entry");
        }
        other => panic!("Expected a duplicate entry error, got {:?}", other),
    }
}

#[test]
fn bad_names_are_rejected() {
    for name in ["", "/abs.txt", "../up.txt", "a\\b.txt", "a//b.txt"] {
        match encode(&[ArchiveEntry::new(name, "x")]) {
            Err(e @ ZipError::InvalidEntry { .. }) => assert_eq!(e.entry_path(), Some(name)),
            other => panic!("{:?} gave {:?}", name, other),
        }
    }
}

/// Reads the offset field of every central directory record by hand
/// and makes sure each one lands on a local file header.
#[test]
fn central_directory_offsets() {
    let entries = sample_entries();
    for method in [CompressionMethod::Stored, CompressionMethod::Deflate] {
        let bytes =
            encode_with(&entries, &EncodeOptions::new().compression_method(method)).unwrap();

        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]) as usize;
        let u32_at = |i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]) as usize
        };

        let eocdr = bytes.len() - 22;
        assert_eq!(&bytes[eocdr..eocdr + 4], b"PK\x05\x06");
        assert_eq!(u16_at(eocdr + 10), entries.len());
        let cd_size = u32_at(eocdr + 12);
        let cd_offset = u32_at(eocdr + 16);
        assert_eq!(cd_offset + cd_size, eocdr);

        let mut record = cd_offset;
        let mut local_offsets = Vec::new();
        for entry in &entries {
            assert_eq!(&bytes[record..record + 4], b"PK\x01\x02");
            let name_length = u16_at(record + 28);
            let extra_length = u16_at(record + 30);
            let comment_length = u16_at(record + 32);
            let local = u32_at(record + 42);
            assert_eq!(&bytes[local..local + 4], b"PK\x03\x04");
            assert_eq!(
                &bytes[record + 46..record + 46 + name_length],
                entry.name.as_bytes()
            );
            // Same name in the local header
            assert_eq!(u16_at(local + 26), name_length);
            assert_eq!(&bytes[local + 30..local + 30 + name_length], entry.name.as_bytes());
            local_offsets.push(local);
            record += 46 + name_length + extra_length + comment_length;
        }
        assert_eq!(record, eocdr);
        assert_eq!(local_offsets[0], 0);
        assert!(local_offsets.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn truncated_archives_are_format_errors() {
    let bytes = encode(&[
        ArchiveEntry::new("a.txt", "alpha"),
        ArchiveEntry::directory("dir"),
        ArchiveEntry::new("dir/lines.txt", "line\n".repeat(40)),
    ])
    .unwrap();
    for cut in 0..bytes.len() {
        match decode(&bytes[..cut]) {
            Err(e) => assert!(e.is_format(), "Truncating at {} gave {:?}", cut, e),
            Ok(entries) => panic!("Truncating at {} decoded {:?}", cut, entries),
        }
    }
}

#[test]
fn corrupt_bytes_never_panic() {
    let bytes = encode_with(
        &[
            ArchiveEntry::new("a.txt", "alpha"),
            ArchiveEntry::directory("dir"),
            ArchiveEntry::new("dir/b.txt", "bravo ".repeat(20)),
        ],
        &EncodeOptions::new()
            .compression_method(CompressionMethod::Deflate)
            .comment("comment"),
    )
    .unwrap();
    for i in 0..bytes.len() {
        for flip in [0x01, 0x80, 0xff] {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= flip;
            // Plenty of these are errors, some (e.g., version fields) aren't.
            // None of them should panic.
            let _ = decode(&corrupted);
        }
    }
}

#[test]
fn prepended_data() {
    let mut bytes = b"MZ not a real executable".to_vec();
    let junk = bytes.len();
    let entries = sample_entries();
    bytes.extend(encode(&entries).unwrap());

    match decode(&bytes) {
        Err(ZipError::PrependedWithUnknownBytes(n)) => assert_eq!(n, junk),
        other => panic!("Expected prepended data error, got {:?}", other),
    }

    let decoded = decode_with(&bytes, &DecodeOptions::new().allow_prepended_data(true)).unwrap();
    assert_eq!(decoded.prepended_bytes, junk);
    assert_eq!(decoded.entries, entries);
}

#[test]
fn bad_central_directory_offset() {
    let mut bytes = encode(&[ArchiveEntry::new("a.txt", "alpha")]).unwrap();
    let eocdr = bytes.len() - 22;
    // Claim the central directory starts further in than it can.
    bytes[eocdr + 16..eocdr + 20].copy_from_slice(&1000u32.to_le_bytes());
    assert!(matches!(
        decode(&bytes),
        Err(ZipError::InvalidArchive(_))
    ));
}

#[test]
fn not_a_zip_at_all() {
    for junk in [&b""[..], &b"PK"[..], &b"Hello, I am definitely not a zip file."[..]] {
        assert!(matches!(decode(junk), Err(ZipError::InvalidArchive(_))));
    }
}

#[test]
fn too_many_entries() {
    let mut zip = ZipWriter::new(io::sink());
    for i in 0..65535 {
        zip.add_file(&format!("{i:05}"), b"").unwrap();
    }
    match zip.add_file("one-too-many", b"") {
        Err(ZipError::SizeLimit { what, size, limit }) => {
            assert_eq!(what, "Entry count");
            assert_eq!(size, 65536);
            assert_eq!(limit, 65535);
        }
        other => panic!("Expected a size limit error, got {:?}", other),
    }
    zip.finish().unwrap();
}

/// A Zip64 archive claiming more entries than the classic format allows
#[test]
fn zip64_archives_hit_the_size_limit() {
    let mut bytes = Vec::new();
    // Zip64 end of central directory record
    bytes.extend_from_slice(b"PK\x06\x06");
    bytes.extend_from_slice(&44u64.to_le_bytes());
    bytes.extend_from_slice(&45u16.to_le_bytes());
    bytes.extend_from_slice(&45u16.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&70_000u64.to_le_bytes());
    bytes.extend_from_slice(&70_000u64.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    // Zip64 end of central directory locator
    bytes.extend_from_slice(b"PK\x06\x07");
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    // End of central directory record, with everything punted to Zip64
    bytes.extend_from_slice(b"PK\x05\x06");
    bytes.extend_from_slice(&[0; 4]);
    bytes.extend_from_slice(&[0xff; 4]);
    bytes.extend_from_slice(&[0xff; 8]);
    bytes.extend_from_slice(&[0; 2]);

    match decode(&bytes) {
        Err(ZipError::SizeLimit { what, size, .. }) => {
            assert_eq!(what, "Entry count");
            assert_eq!(size, 70_000);
        }
        other => panic!("Expected a size limit error, got {:?}", other),
    }
}

/// The last name in the central directory sits right before the EOCDR,
/// exactly where a Zip64 locator would.
#[test]
fn names_that_look_like_zip64_locators() {
    let entries = vec![
        ArchiveEntry::new("first.txt", "Hi there"),
        ArchiveEntry::new("PK\u{6}\u{7}aaaaaaaaaaaaaaaa", "Hi there"),
    ];
    let bytes = encode(&entries).unwrap();
    let eocdr = bytes.len() - 22;
    assert_eq!(&bytes[eocdr - 20..eocdr - 16], b"PK\x06\x07");
    assert_eq!(decode(&bytes).unwrap(), entries);

    let mut prefixed = b"#!/bin/sh\n".to_vec();
    prefixed.extend_from_slice(&bytes);
    let decoded =
        decode_with(&prefixed, &DecodeOptions::new().allow_prepended_data(true)).unwrap();
    assert_eq!(decoded.entries, entries);
}

/// An EOCDR that punts to Zip64 records that aren't there
#[test]
fn saturated_fields_without_zip64_records() {
    let mut bytes = vec![0; 20];
    bytes.extend_from_slice(b"PK\x05\x06");
    bytes.extend_from_slice(&[0; 4]);
    bytes.extend_from_slice(&[0xff; 4]);
    bytes.extend_from_slice(&[0xff; 8]);
    bytes.extend_from_slice(&[0; 2]);

    match decode(&bytes) {
        Err(ZipError::SizeLimit { what, size, limit }) => {
            assert_eq!(what, "Entry count");
            assert_eq!(limit, 65535);
            assert!(size > limit);
        }
        other => panic!("Expected a size limit error, got {:?}", other),
    }
}

/// 65535 fits in the entry count field, even though it doubles as the Zip64 sentinel.
#[test]
fn most_entries_possible() {
    let mut zip = ZipWriter::new(Vec::new());
    for i in 0..65535 {
        zip.add_file(&format!("{i:05}"), b"").unwrap();
    }
    let bytes = zip.finish().unwrap();

    let archive = ZipArchive::new(&bytes).unwrap();
    assert_eq!(archive.entries().len(), 65535);
    assert_eq!(archive.entries()[65534].path.as_str(), "65534");
}

#[test]
fn metadata_round_trip() {
    let when = NaiveDate::from_ymd_opt(2024, 2, 29)
        .unwrap()
        .and_hms_opt(23, 59, 58)
        .unwrap();
    let bytes = encode_with(
        &[
            ArchiveEntry::directory("bin"),
            ArchiveEntry::new("bin/run.sh", "#!/bin/sh\n"),
        ],
        &EncodeOptions::new()
            .last_modified(when)
            .unix_permissions(0o750)
            .comment("zipcodec"),
    )
    .unwrap();

    let archive = ZipArchive::new(&bytes).unwrap();
    assert_eq!(archive.comment(), b"zipcodec");
    let entries = archive.entries();
    assert!(entries[0].is_dir());
    assert_eq!(entries[0].unix_mode, Some(0o040750));
    assert!(entries[1].is_file());
    assert_eq!(entries[1].unix_mode, Some(0o100750));
    for entry in entries {
        assert_eq!(entry.last_modified, Some(when));
    }
}
