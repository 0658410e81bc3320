//! Reading XP3 archives.
use super::checksum::*;
use super::entry::*;
use super::error::*;
use super::header::*;
use super::index::*;
use super::segment::*;
use crate::ext::io::*;
use crate::types::Xp3Config;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Upper bound for buffers preallocated from declared file sizes.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Data of one extracted entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extracted {
    pub data: Vec<u8>,
    pub checksum: ChecksumStatus,
}

/// Outcome of [Xp3Archive::extract_all].
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, Xp3Error)>,
}

impl ExtractReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An opened XP3 archive.
///
/// The index is parsed once when opening. The backing reader is shared behind
/// a mutex and every segment read seeks under the lock, so entries may be
/// extracted from several threads at once.
pub struct Xp3Archive<T> {
    reader: Arc<Mutex<T>>,
    header: Xp3Header,
    /// Absolute position of the signature.
    base_offset: u64,
    entries: Vec<FileEntry>,
    lookup: HashMap<String, usize>,
    warnings: Vec<Xp3Error>,
    config: Xp3Config,
}

impl Xp3Archive<std::io::BufReader<std::fs::File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, Xp3Config::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: Xp3Config) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::new(std::io::BufReader::new(file), config)
    }
}

fn record_warning(warnings: &mut Vec<Xp3Error>, warning: Xp3Error) {
    warn!("{}", warning);
    crate::COUNTER.inc_warning();
    warnings.push(warning);
}

impl<T: Read + Seek> Xp3Archive<T> {
    /// Parse the header and the whole index. Any error aborts the open.
    pub fn new(mut reader: T, config: Xp3Config) -> Result<Self> {
        let mut base_offset = reader.stream_position()?;
        if config.scan_for_signature {
            match find_signature(&mut reader, config.scan_limit)? {
                Some(pos) => {
                    if pos != base_offset {
                        debug!("Found XP3 signature at {:#x}", pos);
                    }
                    base_offset = pos;
                }
                None => debug!("No XP3 signature in the first {} bytes", config.scan_limit),
            }
        }
        reader.seek(SeekFrom::Start(base_offset))?;
        let header = Xp3Header::read(&mut reader)?;
        let mut warnings = Vec::new();
        for warning in header.reserved_field_warnings() {
            record_warning(&mut warnings, warning);
        }

        let index_offset = header.index_offset();
        if index_offset < header.size() {
            return Err(Xp3Error::CorruptIndex(format!(
                "index offset {:#x} points into the header",
                index_offset
            )));
        }
        let index_pos = base_offset.checked_add(index_offset).ok_or_else(|| {
            Xp3Error::CorruptIndex(format!("index offset {:#x} overflows", index_offset))
        })?;
        let index = read_index(&mut reader, index_pos)?;
        let entries = parse_index(&index)?;

        let len = reader.stream_length()?;
        for entry in &entries {
            for seg in &entry.segments {
                let end = base_offset
                    .checked_add(seg.offset)
                    .and_then(|p| p.checked_add(seg.archived_size));
                if end.is_none_or(|end| end > len) {
                    return Err(Xp3Error::CorruptSegmentTable(format!(
                        "{}: segment at {:#x} ({} bytes) lies outside the archive",
                        entry.name, seg.offset, seg.archived_size
                    )));
                }
            }
        }

        let mut lookup = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if lookup.contains_key(&entry.name) {
                record_warning(&mut warnings, Xp3Error::DuplicateEntry(entry.name.clone()));
            } else {
                lookup.insert(entry.name.clone(), i);
            }
        }
        debug!(
            "Opened XP3 archive ({:?}) with {} entries",
            header.version(),
            entries.len()
        );
        Ok(Self {
            reader: Arc::new(Mutex::new(reader)),
            header,
            base_offset,
            entries,
            lookup,
            warnings,
            config,
        })
    }

    /// Reconstruct one entry and check its Adler-32.
    ///
    /// A checksum mismatch is logged and reported in the result, unless
    /// `strict_checksum` is set, in which case it is an error.
    pub fn extract_entry(&self, entry: &FileEntry) -> Result<Extracted> {
        let mut data = Vec::with_capacity(entry.original_size.min(MAX_PREALLOC) as usize);
        for seg in &entry.segments {
            data.extend_from_slice(&read_segment(&*self.reader, seg, self.base_offset)?);
        }
        if data.len() as u64 != entry.original_size {
            return Err(Xp3Error::SizeMismatch {
                name: entry.name.clone(),
                expected: entry.original_size,
                actual: data.len() as u64,
            });
        }
        let checksum = self.check_checksum(entry, adler32(&data))?;
        Ok(Extracted { data, checksum })
    }

    fn check_checksum(&self, entry: &FileEntry, actual: u32) -> Result<ChecksumStatus> {
        let status = ChecksumStatus::check(entry.checksum, actual);
        if let ChecksumStatus::Mismatch { expected, actual } = status {
            let err = Xp3Error::ChecksumMismatch {
                name: entry.name.clone(),
                expected,
                actual,
            };
            if self.config.strict_checksum {
                return Err(err);
            }
            warn!("{}", err);
            crate::COUNTER.inc_warning();
        }
        Ok(status)
    }

    /// Whole contents of the entry called `name`.
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        Ok(self.extract_entry(self.get(name)?)?.data)
    }

    /// Streaming reader over the entry called `name`.
    pub fn open_entry(&self, name: &str) -> Result<EntryReader<T>> {
        let entry = self.get(name)?.clone();
        Ok(EntryReader::new(self.reader.clone(), entry, self.base_offset))
    }

    fn extract_entry_to<W: Write>(&self, entry: &FileEntry, mut sink: W) -> Result<ChecksumStatus> {
        let reader = EntryReader::new(self.reader.clone(), entry.clone(), self.base_offset);
        let mut stream = ChecksumStream::new(reader);
        let written = std::io::copy(&mut stream, &mut sink).map_err(Xp3Error::from_io)?;
        sink.flush()?;
        if written != entry.original_size {
            return Err(Xp3Error::SizeMismatch {
                name: entry.name.clone(),
                expected: entry.original_size,
                actual: written,
            });
        }
        self.check_checksum(entry, stream.checksum())
    }

    /// Stream the entry called `name` into `sink`.
    ///
    /// Data is written as it is decoded, so with `strict_checksum` a mismatch
    /// is only reported after the sink has received everything.
    pub fn extract<W: Write>(&self, name: &str, sink: W) -> Result<ChecksumStatus> {
        self.extract_entry_to(self.get(name)?, sink)
    }

    fn extract_entry_to_dir(&self, entry: &FileEntry, dir: &Path) -> Result<PathBuf> {
        let path = output_path(dir, &entry.name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        if let Err(e) = self.extract_entry_to(entry, file) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        Ok(path)
    }

    /// Write the entry called `name` to `dir/<name>`, creating directories.
    pub fn extract_to<P: AsRef<Path>>(&self, name: &str, dir: P) -> Result<PathBuf> {
        self.extract_entry_to_dir(self.get(name)?, dir.as_ref())
    }

    /// Extract every entry below `dir`. Failed entries are collected, not fatal.
    pub fn extract_all<P: AsRef<Path>>(&self, dir: P) -> ExtractReport {
        let dir = dir.as_ref();
        let mut report = ExtractReport::default();
        for entry in &self.entries {
            match self.extract_entry_to_dir(entry, dir) {
                Ok(_) => {
                    crate::COUNTER.inc_ok();
                    report.succeeded.push(entry.name.clone());
                }
                Err(e) => {
                    error!("Failed to extract {}: {}", entry.name, e);
                    crate::COUNTER.inc_error();
                    report.failed.push((entry.name.clone(), e));
                }
            }
        }
        report
    }
}

impl<T> Xp3Archive<T> {
    pub fn header(&self) -> &Xp3Header {
        &self.header
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn config(&self) -> &Xp3Config {
        &self.config
    }

    /// Non-fatal problems found while opening.
    pub fn warnings(&self) -> &[Xp3Error] {
        &self.warnings
    }

    /// Entries in archive order.
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn list(&self) -> Vec<EntrySummary> {
        self.entries.iter().map(|e| e.summary()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&FileEntry> {
        self.lookup.get(name).map(|&i| &self.entries[i])
    }

    fn get(&self, name: &str) -> Result<&FileEntry> {
        self.find(name)
            .ok_or_else(|| Xp3Error::EntryNotFound(name.to_string()))
    }
}

/// Destination of `name` below `dir`. Names that could escape `dir` are rejected.
fn output_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let name = normalize_name(name)?;
    let rel = Path::new(&name);
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(Xp3Error::InvalidFileName(name));
    }
    Ok(dir.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xp3::consts::*;
    use crate::xp3::writer::*;
    use std::io::Cursor;

    fn text(n: usize) -> Vec<u8> {
        (0..n).map(|i| b"0123456789abcdef"[(i * 7 + i / 16) % 16]).collect()
    }

    fn pack(config: &Xp3Config, files: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut writer = Xp3ArchiveWriter::new(Cursor::new(Vec::new()), config).unwrap();
        for (name, data) in files {
            writer.add_file(name, data, AddOptions::default()).unwrap();
        }
        writer.finalize().unwrap().into_inner()
    }

    fn raw_config() -> Xp3Config {
        Xp3Config {
            compress_files: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_corrupted_checksum_is_soft() {
        let data = pack(&raw_config(), &[("a.txt", b"abc".to_vec())]);
        let mut corrupted = data.clone();
        corrupted[XP3_V2_HEADER_SIZE as usize] = b'x';

        let archive = Xp3Archive::new(Cursor::new(corrupted.clone()), raw_config()).unwrap();
        let entry = archive.find("a.txt").unwrap();
        let extracted = archive.extract_entry(entry).unwrap();
        assert_eq!(extracted.data, b"xbc");
        assert_eq!(
            extracted.checksum,
            ChecksumStatus::Mismatch {
                expected: 0x024d0127,
                actual: adler32(b"xbc"),
            }
        );
        let mut sink = Vec::new();
        assert!(archive.extract("a.txt", &mut sink).unwrap().is_mismatch());
        assert_eq!(sink, b"xbc");

        let strict = Xp3Config {
            strict_checksum: true,
            ..raw_config()
        };
        let archive = Xp3Archive::new(Cursor::new(corrupted), strict.clone()).unwrap();
        assert!(matches!(
            archive.read_file("a.txt"),
            Err(Xp3Error::ChecksumMismatch { .. })
        ));
        let archive = Xp3Archive::new(Cursor::new(data), strict).unwrap();
        let extracted = archive.extract_entry(archive.find("a.txt").unwrap()).unwrap();
        assert_eq!(extracted.checksum, ChecksumStatus::Verified);
    }

    #[test]
    fn test_missing_checksum() {
        let config = Xp3Config {
            write_checksum: false,
            ..Default::default()
        };
        let archive = Xp3Archive::new(Cursor::new(pack(&config, &[("a", text(10))])), config).unwrap();
        let extracted = archive.extract_entry(&archive.entries()[0]).unwrap();
        assert_eq!(extracted.checksum, ChecksumStatus::Missing);
    }

    #[test]
    fn test_reserved_field_warning_is_not_fatal() {
        let mut data = pack(&Xp3Config::default(), &[("a.txt", text(50))]);
        data[19] = 2; // minor version
        let archive = Xp3Archive::new(Cursor::new(data), Xp3Config::default()).unwrap();
        assert_eq!(archive.warnings().len(), 1);
        assert!(matches!(
            archive.warnings()[0],
            Xp3Error::UnsupportedReservedField {
                field: "minor_version",
                value: 2
            }
        ));
        assert_eq!(archive.read_file("a.txt").unwrap(), text(50));
    }

    #[test]
    fn test_bad_magic_and_bad_offsets() {
        let err = Xp3Archive::new(Cursor::new(b"PK\x03\x04 not an xp3 at all".to_vec()), raw_config());
        assert!(matches!(err, Err(Xp3Error::BadMagic(_))));

        let mut data = pack(&raw_config(), &[("a.txt", text(50))]);
        data[32..40].copy_from_slice(&8u64.to_le_bytes());
        let err = Xp3Archive::new(Cursor::new(data), raw_config());
        assert!(matches!(err, Err(Xp3Error::CorruptIndex(_))));
    }

    #[test]
    fn test_segment_outside_archive() {
        let entry = FileEntry {
            name: "ghost.bin".into(),
            flags: 0,
            original_size: 100,
            archived_size: 100,
            segments: vec![Segment {
                compressed: false,
                offset: 1000,
                original_size: 100,
                archived_size: 100,
            }],
            checksum: None,
        };
        let mut cur = Cursor::new(Vec::new());
        let field = Xp3Header::new(FormatVersion::V2, 0).write(&mut cur).unwrap();
        write_index(&mut cur, &build_index(&[entry]).unwrap(), None).unwrap();
        patch_index_offset(&mut cur, field, 40).unwrap();
        cur.set_position(0);
        let err = Xp3Archive::new(cur, raw_config());
        assert!(matches!(err, Err(Xp3Error::CorruptSegmentTable(_))));
    }

    /// Archive with one entry `big.bin` whose single segment is `stored`,
    /// declared to hold `original_size` bytes. No checksum is written.
    fn archive_with_segment(stored: &[u8], compressed: bool, original_size: u64) -> Vec<u8> {
        let mut cur = Cursor::new(Vec::new());
        let field = Xp3Header::new(FormatVersion::V2, 0).write(&mut cur).unwrap();
        let offset = cur.position();
        cur.write_all(stored).unwrap();
        let entry = FileEntry {
            name: "big.bin".into(),
            flags: 0,
            original_size,
            archived_size: stored.len() as u64,
            segments: vec![Segment {
                compressed,
                offset,
                original_size,
                archived_size: stored.len() as u64,
            }],
            checksum: None,
        };
        let index_offset = cur.position();
        write_index(&mut cur, &build_index(&[entry]).unwrap(), None).unwrap();
        patch_index_offset(&mut cur, field, index_offset).unwrap();
        cur.into_inner()
    }

    #[test]
    fn test_oversized_segment_fails_every_extract() {
        let stored = deflate(&text(100), 6).unwrap();
        let data = archive_with_segment(&stored, true, 10);
        let archive = Xp3Archive::new(Cursor::new(data), raw_config()).unwrap();
        assert!(matches!(
            archive.read_file("big.bin"),
            Err(Xp3Error::CorruptSegmentData { offset: 40, .. })
        ));
        let mut sink = Vec::new();
        assert!(matches!(
            archive.extract("big.bin", &mut sink),
            Err(Xp3Error::CorruptSegmentData { offset: 40, .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            archive.extract_to("big.bin", dir.path()),
            Err(Xp3Error::CorruptSegmentData { .. })
        ));
        assert!(!dir.path().join("big.bin").exists());
        let report = archive.extract_all(dir.path());
        assert!(report.succeeded.is_empty());
        assert!(matches!(
            report.failed[0].1,
            Xp3Error::CorruptSegmentData { offset: 40, .. }
        ));
    }

    #[test]
    fn test_bad_deflate_stream_is_corrupt_data() {
        let mut stored = deflate(&text(5000), 6).unwrap();
        for b in &mut stored[2..5] {
            *b ^= 0xFF;
        }
        let data = archive_with_segment(&stored, true, 5000);
        let archive = Xp3Archive::new(Cursor::new(data), raw_config()).unwrap();
        assert!(matches!(
            archive.read_file("big.bin"),
            Err(Xp3Error::CorruptSegmentData { .. })
        ));
        assert!(matches!(
            archive.extract("big.bin", std::io::sink()),
            Err(Xp3Error::CorruptSegmentData { offset: 40, .. })
        ));
    }

    #[test]
    fn test_scan_for_signature() {
        let mut data = b"MZ\x90\x00 self extracting stub".to_vec();
        data.resize(4099, 0xCC);
        data.extend_from_slice(&pack(&Xp3Config::default(), &[("scenario/01.ks", text(5000))]));
        assert!(matches!(
            Xp3Archive::new(Cursor::new(data.clone()), Xp3Config::default()),
            Err(Xp3Error::BadMagic(_))
        ));
        let config = Xp3Config {
            scan_for_signature: true,
            ..Default::default()
        };
        let archive = Xp3Archive::new(Cursor::new(data), config).unwrap();
        assert_eq!(archive.base_offset(), 4099);
        assert_eq!(archive.read_file("scenario/01.ks").unwrap(), text(5000));
        let mut streamed = Vec::new();
        archive
            .open_entry("scenario/01.ks")
            .unwrap()
            .read_to_end(&mut streamed)
            .unwrap();
        assert_eq!(streamed, text(5000));
    }

    #[test]
    fn test_extract_to_and_all() {
        let files = vec![
            ("startup.tjs", text(100)),
            ("image/bg/title.png", text(3000)),
            ("empty.txt", Vec::new()),
        ];
        let archive =
            Xp3Archive::new(Cursor::new(pack(&Xp3Config::default(), &files)), Xp3Config::default())
                .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = archive.extract_to("image/bg/title.png", dir.path()).unwrap();
        assert_eq!(path, dir.path().join("image").join("bg").join("title.png"));
        assert_eq!(std::fs::read(&path).unwrap(), text(3000));
        assert!(matches!(
            archive.extract_to("missing", dir.path()),
            Err(Xp3Error::EntryNotFound(_))
        ));

        let out = tempfile::tempdir().unwrap();
        let report = archive.extract_all(out.path());
        assert!(report.is_complete());
        assert_eq!(report.succeeded.len(), 3);
        for (name, data) in &files {
            assert_eq!(&std::fs::read(out.path().join(name)).unwrap(), data);
        }
    }

    #[test]
    fn test_extract_all_collects_failures() {
        let files = vec![("good.txt", b"fine".to_vec()), ("bad.txt", b"abc".to_vec())];
        let mut data = pack(&raw_config(), &files);
        // "bad.txt" is stored right after "good.txt"
        data[XP3_V2_HEADER_SIZE as usize + 4] = b'x';
        let strict = Xp3Config {
            strict_checksum: true,
            ..raw_config()
        };
        let archive = Xp3Archive::new(Cursor::new(data), strict).unwrap();
        let out = tempfile::tempdir().unwrap();
        let report = archive.extract_all(out.path());
        assert_eq!(report.succeeded, vec!["good.txt".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad.txt");
        assert!(matches!(report.failed[0].1, Xp3Error::ChecksumMismatch { .. }));
        assert!(!out.path().join("bad.txt").exists());
    }

    #[test]
    fn test_unsafe_names_are_not_extracted() {
        assert!(output_path(Path::new("out"), "../../etc/passwd").is_err());
        assert!(output_path(Path::new("out"), "a/../../b").is_err());
        assert!(output_path(Path::new("out"), "").is_err());
        assert_eq!(
            output_path(Path::new("out"), "/abs/file").unwrap(),
            Path::new("out").join("abs").join("file")
        );
    }

    #[test]
    fn test_concurrent_extraction() {
        let files: Vec<(String, Vec<u8>)> = (0..8)
            .map(|i| (format!("voice/{:02}.ogg", i), text(2000 + i * 317)))
            .collect();
        let refs: Vec<(&str, Vec<u8>)> = files.iter().map(|(n, d)| (n.as_str(), d.clone())).collect();
        let config = Xp3Config {
            segmenter: crate::xp3::segmenter::SegmenterConfig::Fixed { size: 512 },
            ..Default::default()
        };
        let archive = Xp3Archive::new(Cursor::new(pack(&config, &refs)), config).unwrap();
        std::thread::scope(|s| {
            for (name, data) in &files {
                let archive = &archive;
                s.spawn(move || {
                    for _ in 0..5 {
                        assert_eq!(&archive.read_file(name).unwrap(), data);
                    }
                });
            }
        });
    }
}
