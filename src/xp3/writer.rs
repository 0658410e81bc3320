//! Write sessions producing XP3 archives.
use super::checksum::adler32;
use super::consts::*;
use super::entry::*;
use super::error::*;
use super::header::*;
use super::index::*;
use super::segment::*;
use super::segmenter::*;
use crate::types::Xp3Config;
use crate::utils::threadpool::ThreadPool;
#[cfg(feature = "dedup")]
use sha2::{Digest, Sha256};
#[cfg(feature = "dedup")]
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::{Seek, Write};
use std::path::Path;
use tracing::{debug, info};

/// Per-file options for [Xp3ArchiveWriter::add_file].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Overrides `compress_files` from the session config.
    pub compress: Option<bool>,
    /// Set the protection flag, which asks extraction tools to leave the file alone.
    pub protected: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Packing statistics of a write session.
pub struct Stats {
    pub files: usize,
    pub total_original_size: u64,
    pub final_archive_size: u64,
    pub total_segments: usize,
    pub unique_segments: usize,
    pub compressed_segments: usize,
    pub deduplication_savings: u64,
    pub index_size: u64,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Files: {}\nTotal Original Size: {} bytes\nFinal Archive Size: {} bytes\nTotal Segments: {}\nUnique Segments: {}\nCompressed Segments: {}\nDeduplication Savings: {} bytes\nIndex Size: {} bytes",
            self.files,
            self.total_original_size,
            self.final_archive_size,
            self.total_segments,
            self.unique_segments,
            self.compressed_segments,
            self.deduplication_savings,
            self.index_size,
        )
    }
}

/// An open write session.
///
/// Segments are appended as files are added. The index and the real index
/// offset are only written by [Xp3ArchiveWriter::finalize]; until then the
/// header points at offset 0, which no reader accepts.
pub struct Xp3ArchiveWriter<T: Write + Seek> {
    file: T,
    /// Absolute position of the archive start in `file`.
    start: u64,
    /// Absolute position of the next write.
    pos: u64,
    index_offset_field: u64,
    entries: Vec<FileEntry>,
    names: HashSet<String>,
    policy: CompressionPolicy,
    compress_index: bool,
    write_checksum: bool,
    segmenter: Option<Box<dyn Segmenter + Send + Sync>>,
    workers: Option<ThreadPool<(usize, Result<EncodedSegment>)>>,
    #[cfg(feature = "dedup")]
    segments: Option<HashMap<[u8; 32], Segment>>,
    stats: Stats,
}

impl Xp3ArchiveWriter<std::io::BufWriter<std::fs::File>> {
    /// Create (or truncate) `path` and start a session on it.
    pub fn create<P: AsRef<Path>>(path: P, config: &Xp3Config) -> Result<Self> {
        let file = std::fs::File::create(path)?;
        Self::new(std::io::BufWriter::new(file), config)
    }
}

impl<T: Write + Seek> Xp3ArchiveWriter<T> {
    /// Start a session at the writer's current position.
    pub fn new(mut file: T, config: &Xp3Config) -> Result<Self> {
        let start = file.stream_position()?;
        let header = Xp3Header::new(config.version, 0); // Placeholder for index offset
        let index_offset_field = header.write(&mut file)?;
        let pos = start + header.size();
        let segmenter = create_segmenter(config.segmenter)?;
        let workers = if segmenter.is_some() && config.compress_files && config.compress_workers > 1
        {
            Some(ThreadPool::new(config.compress_workers, "xp3-compress-")?)
        } else {
            None
        };
        if config.dedup_segments && !cfg!(feature = "dedup") {
            tracing::warn!("Segment deduplication requires the \"dedup\" feature, ignored");
        }
        debug!(
            "Started XP3 {:?} session, segmenter {:?}",
            config.version, config.segmenter
        );
        Ok(Self {
            file,
            start,
            pos,
            index_offset_field,
            entries: Vec::new(),
            names: HashSet::new(),
            policy: config.compression_policy(),
            compress_index: config.compress_index,
            write_checksum: config.write_checksum,
            segmenter,
            workers,
            #[cfg(feature = "dedup")]
            segments: config.dedup_segments.then(HashMap::new),
            stats: Stats {
                final_archive_size: header.size(),
                ..Default::default()
            },
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Entries added so far, in archive order.
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    fn encode_pieces(&self, pieces: &[&[u8]], policy: &CompressionPolicy) -> Result<Vec<EncodedSegment>> {
        let workers = match self.workers.as_ref() {
            Some(workers) if policy.compress && pieces.len() > 1 => workers,
            _ => {
                return pieces
                    .iter()
                    .map(|piece| encode_segment(piece, policy))
                    .collect();
            }
        };
        for (i, piece) in pieces.iter().enumerate() {
            let piece = piece.to_vec();
            let policy = *policy;
            workers
                .execute(move || (i, encode_segment(&piece, &policy)))
                .map_err(std::io::Error::other)?;
        }
        let mut results = workers.take_results();
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, r)| r).collect()
    }

    fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.pos - self.start;
        self.file.write_all(data)?;
        self.pos += data.len() as u64;
        self.stats.final_archive_size = self.pos - self.start;
        Ok(offset)
    }

    /// Store one segment, reusing an identical stored copy when deduplicating.
    fn store_segment(&mut self, piece: &[u8], encoded: EncodedSegment) -> Result<Segment> {
        #[cfg(feature = "dedup")]
        let hash: Option<[u8; 32]> = match self.segments.as_ref() {
            Some(segments) => {
                let hash: [u8; 32] = Sha256::digest(piece).into();
                if let Some(seg) = segments.get(&hash) {
                    self.stats.total_segments += 1;
                    self.stats.deduplication_savings += seg.archived_size;
                    return Ok(*seg);
                }
                Some(hash)
            }
            None => None,
        };
        #[cfg(not(feature = "dedup"))]
        let _ = piece;
        let offset = self.append(&encoded.data)?;
        let seg = encoded.at(offset);
        self.stats.total_segments += 1;
        self.stats.unique_segments += 1;
        if seg.compressed {
            self.stats.compressed_segments += 1;
        }
        #[cfg(feature = "dedup")]
        if let (Some(segments), Some(hash)) = (self.segments.as_mut(), hash) {
            segments.insert(hash, seg);
        }
        Ok(seg)
    }

    /// Store `data` under `name`. The bytes are written immediately.
    pub fn add_file(&mut self, name: &str, data: &[u8], options: AddOptions) -> Result<()> {
        let name = normalize_name(name)?;
        if self.names.contains(&name) {
            return Err(Xp3Error::DuplicateEntry(name));
        }
        let policy = CompressionPolicy {
            compress: options.compress.unwrap_or(self.policy.compress),
            ..self.policy
        };
        let mut pieces: Vec<&[u8]> = match self.segmenter.as_ref() {
            Some(segmenter) => segmenter.segment(data).collect(),
            None => vec![data],
        };
        if pieces.is_empty() {
            // An empty file still gets one (empty) segment.
            pieces.push(data);
        }
        let encoded = self.encode_pieces(&pieces, &policy)?;
        let mut segments = Vec::with_capacity(pieces.len());
        for (piece, enc) in pieces.iter().zip(encoded) {
            segments.push(self.store_segment(piece, enc)?);
        }
        let entry = FileEntry {
            name: name.clone(),
            flags: if options.protected {
                TVP_XP3_FILE_PROTECTED
            } else {
                0
            },
            original_size: data.len() as u64,
            archived_size: segments.iter().map(|s| s.archived_size).sum(),
            segments,
            checksum: self.write_checksum.then(|| adler32(data)),
        };
        entry.validate()?;
        debug!(
            "Added {} ({} bytes, {} segments, {} stored)",
            entry.name,
            entry.original_size,
            entry.segments.len(),
            entry.archived_size
        );
        self.stats.files += 1;
        self.stats.total_original_size += entry.original_size;
        self.names.insert(name);
        self.entries.push(entry);
        Ok(())
    }

    /// Write the index, point the header at it and flush.
    pub fn finalize(self) -> Result<T> {
        Ok(self.finalize_with_stats()?.0)
    }

    /// Like [Xp3ArchiveWriter::finalize], also returning the final statistics.
    pub fn finalize_with_stats(mut self) -> Result<(T, Stats)> {
        let index = build_index(&self.entries)?;
        let index_offset = self.pos - self.start;
        let compression = self.compress_index.then_some(self.policy.level);
        write_index(&mut self.file, &index, compression)?;
        let end = self.file.stream_position()?;
        patch_index_offset(&mut self.file, self.index_offset_field, index_offset)?;
        self.file.flush()?;
        self.stats.index_size = index.len() as u64;
        self.stats.final_archive_size = end - self.start;
        info!("XP3 Archive Statistics:\n{}", self.stats);
        Ok((self.file, self.stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xp3::archive::Xp3Archive;
    use std::io::Cursor;

    fn config() -> Xp3Config {
        Xp3Config {
            compress_workers: 2,
            ..Default::default()
        }
    }

    fn text(n: usize) -> Vec<u8> {
        (0..n)
            .map(|i| b"the quick brown fox jumps over the lazy dog "[i % 44])
            .collect()
    }

    fn pack(config: &Xp3Config, files: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut writer = Xp3ArchiveWriter::new(Cursor::new(Vec::new()), config).unwrap();
        for (name, data) in files {
            writer.add_file(name, data, AddOptions::default()).unwrap();
        }
        writer.finalize().unwrap().into_inner()
    }

    fn open(data: Vec<u8>, config: &Xp3Config) -> Xp3Archive<Cursor<Vec<u8>>> {
        Xp3Archive::new(Cursor::new(data), config.clone()).unwrap()
    }

    #[test]
    fn test_round_trip_versions_and_compression() {
        let files = vec![
            ("startup.tjs", text(3000)),
            ("image/bg.png", (0..=255u8).cycle().take(1000).collect()),
            ("empty.txt", Vec::new()),
        ];
        for version in [FormatVersion::V1, FormatVersion::V2] {
            for compress in [false, true] {
                let config = Xp3Config {
                    version,
                    compress_files: compress,
                    compress_index: compress,
                    ..config()
                };
                let archive = open(pack(&config, &files), &config);
                assert_eq!(archive.header().version(), version);
                assert_eq!(archive.entries().len(), files.len());
                for (entry, (name, data)) in archive.entries().iter().zip(&files) {
                    assert_eq!(&entry.name, name);
                    assert_eq!(entry.is_compressed(), compress && !data.is_empty());
                    assert_eq!(&archive.read_file(name).unwrap(), data);
                }
            }
        }
    }

    #[test]
    fn test_header_offset_positions() {
        let config = Xp3Config {
            version: FormatVersion::V1,
            ..config()
        };
        let data = pack(&config, &[("a.txt", b"hello".to_vec())]);
        let offset = u64::from_le_bytes(data[11..19].try_into().unwrap());
        assert_eq!(offset, 19 + 5);

        let data = pack(&Xp3Config::default(), &[("a.txt", b"hello".to_vec())]);
        assert_eq!(&data[11..19], &XP3_V2_SENTINEL);
        let offset = u64::from_le_bytes(data[32..40].try_into().unwrap());
        assert!(offset >= 40 + 5);
        assert_eq!(data[offset as usize], TVP_XP3_INDEX_ENCODE_ZLIB);
    }

    #[test]
    fn test_empty_file_has_one_raw_segment() {
        let archive = open(pack(&config(), &[("empty", Vec::new())]), &config());
        let entry = archive.find("empty").unwrap();
        assert_eq!(entry.segments.len(), 1);
        assert!(!entry.segments[0].compressed);
        assert_eq!(entry.segments[0].original_size, 0);
        assert_eq!(entry.checksum, Some(1));
        assert!(archive.read_file("empty").unwrap().is_empty());
    }

    #[test]
    fn test_multi_segment_round_trip() {
        let config = Xp3Config {
            segmenter: SegmenterConfig::Fixed { size: 1000 },
            ..config()
        };
        let data = text(4500);
        let archive = open(pack(&config, &[("big.ks", data.clone())]), &config);
        let entry = archive.find("big.ks").unwrap();
        assert_eq!(entry.segments.len(), 5);
        assert_eq!(
            entry.segments.iter().map(|s| s.original_size).sum::<u64>(),
            4500
        );
        assert!(entry.segments.windows(2).all(|w| w[0].offset < w[1].offset));
        assert_eq!(archive.read_file("big.ks").unwrap(), data);
    }

    #[cfg(feature = "dedup")]
    #[test]
    fn test_dedup_reuses_segments() {
        let config = Xp3Config {
            segmenter: SegmenterConfig::Fixed { size: 1000 },
            dedup_segments: true,
            ..config()
        };
        let data = text(4000);
        let mut writer = Xp3ArchiveWriter::new(Cursor::new(Vec::new()), &config).unwrap();
        writer.add_file("a.ks", &data, AddOptions::default()).unwrap();
        let stored_once = writer.stats().final_archive_size;
        writer.add_file("b.ks", &data, AddOptions::default()).unwrap();
        assert_eq!(writer.stats().final_archive_size, stored_once);
        assert!(writer.stats().deduplication_savings > 0);
        assert_eq!(writer.entries()[0].segments, writer.entries()[1].segments);
        let archive = open(writer.finalize().unwrap().into_inner(), &config);
        assert_eq!(archive.read_file("b.ks").unwrap(), data);
    }

    #[test]
    fn test_final_size_counts_header_and_index() {
        let mut prefixed = Cursor::new(vec![0xEE; 7]);
        prefixed.set_position(7);
        let mut writer = Xp3ArchiveWriter::new(prefixed, &config()).unwrap();
        assert_eq!(writer.stats().final_archive_size, XP3_V2_HEADER_SIZE);
        writer.add_file("a.txt", &text(3000), AddOptions::default()).unwrap();
        let (file, stats) = writer.finalize_with_stats().unwrap();
        let data = file.into_inner();
        assert_eq!(stats.final_archive_size, data.len() as u64 - 7);
        assert!(stats.index_size > 0);
        assert_eq!(stats.files, 1);
    }

    #[test]
    fn test_add_options_and_names() {
        let mut writer = Xp3ArchiveWriter::new(Cursor::new(Vec::new()), &config()).unwrap();
        let options = AddOptions {
            compress: Some(false),
            protected: true,
        };
        writer.add_file("\\system\\Config.tjs", &text(2000), options).unwrap();
        assert!(matches!(
            writer.add_file("system/Config.tjs", b"x", AddOptions::default()),
            Err(Xp3Error::DuplicateEntry(_))
        ));
        assert!(matches!(
            writer.add_file("../evil", b"x", AddOptions::default()),
            Err(Xp3Error::InvalidFileName(_))
        ));
        let archive = open(writer.finalize().unwrap().into_inner(), &config());
        let list = archive.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "system/Config.tjs");
        assert!(list[0].protected);
        assert!(!list[0].compressed);
    }

    #[test]
    fn test_unfinalized_session_does_not_open() {
        let mut writer = Xp3ArchiveWriter::new(Cursor::new(Vec::new()), &config()).unwrap();
        writer.add_file("a.txt", &text(100), AddOptions::default()).unwrap();
        let data = writer.file.get_ref().clone();
        drop(writer);
        assert!(Xp3Archive::new(Cursor::new(data), config()).is_err());
    }

    #[test]
    fn test_create_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.xp3");
        let mut writer = Xp3ArchiveWriter::create(&path, &config()).unwrap();
        writer.add_file("readme.txt", b"hello xp3", AddOptions::default()).unwrap();
        writer.finalize().unwrap();
        let archive = Xp3Archive::open(&path).unwrap();
        assert_eq!(archive.read_file("readme.txt").unwrap(), b"hello xp3");
    }
}
