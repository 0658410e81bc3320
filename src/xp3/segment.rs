//! Segment payloads: zlib or raw, plus a streaming reader over a whole entry.
use super::entry::*;
use super::error::*;
use super::index::{deflate, inflate_exact};
use crate::ext::io::*;
use flate2::read::ZlibDecoder;
use std::io::{Read, Seek, SeekFrom, Take};
use std::sync::{Arc, Mutex};

/// Whether and how a segment is deflated when packing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub compress: bool,
    pub level: u32,
    /// Keep the raw bytes when deflate does not shrink them.
    pub only_if_smaller: bool,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            compress: true,
            level: 6,
            only_if_smaller: true,
        }
    }
}

/// Stored form of one segment, ready to be appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedSegment {
    pub compressed: bool,
    pub original_size: u64,
    pub data: Vec<u8>,
}

impl EncodedSegment {
    pub fn archived_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Table record for this segment once stored at `offset`.
    pub fn at(&self, offset: u64) -> Segment {
        Segment {
            compressed: self.compressed,
            offset,
            original_size: self.original_size,
            archived_size: self.archived_size(),
        }
    }
}

pub fn encode_segment(data: &[u8], policy: &CompressionPolicy) -> Result<EncodedSegment> {
    if policy.compress && !data.is_empty() {
        let compressed = deflate(data, policy.level)?;
        if !policy.only_if_smaller || compressed.len() < data.len() {
            return Ok(EncodedSegment {
                compressed: true,
                original_size: data.len() as u64,
                data: compressed,
            });
        }
    }
    Ok(EncodedSegment {
        compressed: false,
        original_size: data.len() as u64,
        data: data.to_vec(),
    })
}

/// Turn the stored bytes of `seg` back into its original bytes.
pub fn decode_segment(seg: &Segment, stored: Vec<u8>) -> Result<Vec<u8>> {
    if seg.compressed {
        inflate_exact(&stored, seg.original_size).map_err(|e| Xp3Error::CorruptSegmentData {
            offset: seg.offset,
            reason: e.to_string(),
        })
    } else if stored.len() as u64 != seg.original_size {
        Err(Xp3Error::CorruptSegmentData {
            offset: seg.offset,
            reason: format!(
                "raw segment holds {} bytes, expected {}",
                stored.len(),
                seg.original_size
            ),
        })
    } else {
        Ok(stored)
    }
}

/// Positioned read and decode of one segment.
///
/// `base` is the absolute position of the archive start; segment offsets are
/// relative to it.
pub fn read_segment<R: ReadAt + ?Sized>(reader: &R, seg: &Segment, base: u64) -> Result<Vec<u8>> {
    let offset = base
        .checked_add(seg.offset)
        .ok_or_else(|| Xp3Error::CorruptSegmentTable(format!("offset {:#x} overflows", seg.offset)))?;
    let stored = reader
        .read_exact_vec_at(offset, seg.archived_size as usize)
        .map_err(|e| {
            Xp3Error::eof_as(e, || Xp3Error::CorruptSegmentData {
                offset: seg.offset,
                reason: "segment is truncated".into(),
            })
        })?;
    decode_segment(seg, stored)
}

struct SegmentCache<T> {
    index: usize,
    /// Bytes already produced by `decoder`.
    pos: u64,
    decoder: ZlibDecoder<Take<MutexWrapper<T>>>,
}

/// [Read] + [Seek] stream over one entry's reconstructed data.
///
/// Segments are read lazily through the shared archive reader. A compressed
/// segment is inflated from its start, so seeking backwards inside one costs a
/// fresh decode up to the target.
pub struct EntryReader<T> {
    reader: Arc<Mutex<T>>,
    entry: FileEntry,
    base: u64,
    cache: Option<SegmentCache<T>>,
    pos: u64,
    /// Logical start of each segment.
    starts: Vec<u64>,
}

impl<T: Read + Seek> EntryReader<T> {
    pub fn new(reader: Arc<Mutex<T>>, entry: FileEntry, base: u64) -> Self {
        let mut pos = 0;
        let starts = entry
            .segments
            .iter()
            .map(|seg| {
                let p = pos;
                pos += seg.original_size;
                p
            })
            .collect();
        Self {
            reader,
            entry,
            base,
            cache: None,
            pos: 0,
            starts,
        }
    }

    pub fn entry(&self) -> &FileEntry {
        &self.entry
    }

    pub fn len(&self) -> u64 {
        self.entry.original_size
    }

    pub fn is_empty(&self) -> bool {
        self.entry.original_size == 0
    }

    /// Last segment starting at or before `pos`, which skips empty segments.
    fn segment_at(&self, pos: u64) -> usize {
        self.starts.partition_point(|&p| p <= pos).saturating_sub(1)
    }
}

/// Map a broken zlib stream to [Xp3Error::CorruptSegmentData]. Errors from
/// the backing reader keep their kind.
fn inflate_error(seg: &Segment, err: std::io::Error) -> std::io::Error {
    match err.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => {
            corrupt(seg, &err.to_string())
        }
        _ => err,
    }
}

fn corrupt(seg: &Segment, reason: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        Xp3Error::CorruptSegmentData {
            offset: seg.offset,
            reason: reason.to_string(),
        },
    )
}

impl<T: Read + Seek> Read for EntryReader<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.entry.original_size {
            self.cache.take();
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let seg_index = self.segment_at(self.pos);
        let seg = self.entry.segments[seg_index];
        let skip = self.pos - self.starts[seg_index];
        let remaining = seg.original_size - skip;
        let want = (buf.len() as u64).min(remaining) as usize;
        let buf = &mut buf[..want];
        let offset = self.base + seg.offset;
        let readed = if seg.compressed {
            if let Some(cache) = &self.cache {
                if cache.index != seg_index || cache.pos > skip {
                    self.cache = None;
                }
            }
            let reader = &self.reader;
            let cache = self.cache.get_or_insert_with(|| SegmentCache {
                index: seg_index,
                pos: 0,
                decoder: ZlibDecoder::new(
                    MutexWrapper::new(reader.clone(), offset).take(seg.archived_size),
                ),
            });
            if cache.pos < skip {
                let skipped = std::io::copy(
                    &mut (&mut cache.decoder).take(skip - cache.pos),
                    &mut std::io::sink(),
                )
                .map_err(|e| inflate_error(&seg, e))?; // skip
                cache.pos += skipped;
                if cache.pos < skip {
                    return Err(corrupt(&seg, "compressed segment ended early"));
                }
            }
            let readed = cache
                .decoder
                .read(buf)
                .map_err(|e| inflate_error(&seg, e))?;
            if readed == 0 {
                return Err(corrupt(&seg, "compressed segment ended early"));
            }
            cache.pos += readed as u64;
            if cache.pos == seg.original_size {
                let mut extra = [0u8; 1];
                let more = cache
                    .decoder
                    .read(&mut extra)
                    .map_err(|e| inflate_error(&seg, e))?;
                if more != 0 {
                    return Err(corrupt(&seg, "segment inflates past its declared size"));
                }
            }
            readed
        } else {
            let readed = MutexWrapper::new(self.reader.clone(), offset + skip)
                .take(remaining)
                .read(buf)?;
            if readed == 0 {
                return Err(corrupt(&seg, "segment is truncated"));
            }
            readed
        };
        self.pos += readed as u64;
        Ok(readed)
    }
}

impl<T: Read + Seek> Seek for EntryReader<T> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(p) => (p, 0),
            SeekFrom::End(offset) => (self.entry.original_size, offset),
            SeekFrom::Current(offset) => (self.pos, offset),
        };
        let new_pos = base.checked_add_signed(offset).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Seek before the start of the entry",
            )
        })?;
        self.pos = new_pos;
        Ok(self.pos)
    }

    fn stream_position(&mut self) -> std::io::Result<u64> {
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 13) as u8 * 7).collect()
    }

    /// Store `data` split at `cuts` and return the archive bytes and entry.
    fn store(data: &[u8], cuts: &[usize], compress: &[bool]) -> (Vec<u8>, FileEntry) {
        let mut archive = vec![0xAA; 16];
        let mut segments = Vec::new();
        let mut start = 0;
        for (i, &end) in cuts.iter().chain(std::iter::once(&data.len())).enumerate() {
            let policy = CompressionPolicy {
                compress: compress[i],
                level: 6,
                only_if_smaller: false,
            };
            let enc = encode_segment(&data[start..end], &policy).unwrap();
            segments.push(enc.at(archive.len() as u64));
            archive.extend_from_slice(&enc.data);
            start = end;
        }
        let entry = FileEntry {
            name: "data.bin".into(),
            flags: 0,
            original_size: data.len() as u64,
            archived_size: segments.iter().map(|s| s.archived_size).sum(),
            segments,
            checksum: None,
        };
        (archive, entry)
    }

    #[test]
    fn test_encode_policy() {
        let data = sample(4096);
        let enc = encode_segment(&data, &CompressionPolicy::default()).unwrap();
        assert!(enc.compressed);
        assert!(enc.archived_size() < 4096);

        let noise: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let enc = encode_segment(&noise, &CompressionPolicy::default()).unwrap();
        assert!(!enc.compressed);
        assert_eq!(enc.data, noise);

        let enc = encode_segment(&[], &CompressionPolicy::default()).unwrap();
        assert!(!enc.compressed);
        assert_eq!(enc.original_size, 0);
    }

    #[test]
    fn test_read_segments_concatenate() {
        let data = sample(10_000);
        let (archive, entry) = store(&data, &[3000, 3000, 7000], &[true, false, false, true]);
        entry.validate().unwrap();
        let shared = Mutex::new(Cursor::new(archive));
        let mut out = Vec::new();
        for seg in &entry.segments {
            out.extend_from_slice(&read_segment(&shared, seg, 0).unwrap());
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_truncated_compressed_segment() {
        let data = sample(5000);
        let (archive, entry) = store(&data, &[], &[true]);
        let seg = entry.segments[0];
        let stored = archive[seg.offset as usize..seg.offset as usize + 2].to_vec();
        assert!(matches!(
            decode_segment(&seg, stored),
            Err(Xp3Error::CorruptSegmentData { .. })
        ));
        let shared = Mutex::new(Cursor::new(archive[..archive.len() - 4].to_vec()));
        assert!(matches!(
            read_segment(&shared, &seg, 0),
            Err(Xp3Error::CorruptSegmentData { .. })
        ));
    }

    #[test]
    fn test_entry_reader_stream_and_seek() {
        let data = sample(20_000);
        let (archive, entry) = store(&data, &[5000, 5000, 12_000], &[true, true, false, true]);
        let shared = Arc::new(Mutex::new(Cursor::new(archive)));
        let mut reader = EntryReader::new(shared, entry, 0);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        for &target in &[15_000u64, 100, 4999, 5000, 12_001, 100] {
            reader.seek(SeekFrom::Start(target)).unwrap();
            let mut buf = [0u8; 300];
            reader.read_exact(&mut buf).unwrap();
            let t = target as usize;
            assert_eq!(&buf[..], &data[t..t + 300]);
        }
        reader.seek(SeekFrom::End(-10)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[data.len() - 10..]);
        assert!(reader.seek(SeekFrom::Current(-30_000)).is_err());
    }

    #[test]
    fn test_entry_reader_rejects_oversized_inflate() {
        let data = sample(100);
        let (archive, mut entry) = store(&data, &[], &[true]);
        entry.segments[0].original_size = 10;
        entry.original_size = 10;
        let shared = Arc::new(Mutex::new(Cursor::new(archive)));
        let mut out = Vec::new();
        let err = EntryReader::new(shared, entry, 0)
            .read_to_end(&mut out)
            .unwrap_err();
        assert!(matches!(
            Xp3Error::from_io(err),
            Xp3Error::CorruptSegmentData { offset: 16, .. }
        ));
    }

    #[test]
    fn test_entry_reader_reports_bad_deflate_as_corrupt() {
        let data = sample(5000);
        let (mut archive, entry) = store(&data, &[], &[true]);
        let start = entry.segments[0].offset as usize;
        for b in &mut archive[start + 2..start + 5] {
            *b ^= 0xFF;
        }
        let shared = Arc::new(Mutex::new(Cursor::new(archive)));
        let mut out = Vec::new();
        let err = EntryReader::new(shared, entry, 0)
            .read_to_end(&mut out)
            .unwrap_err();
        assert!(matches!(
            Xp3Error::from_io(err),
            Xp3Error::CorruptSegmentData { offset: 16, .. }
        ));
    }

    #[test]
    fn test_entry_reader_with_base_offset() {
        let data = sample(1000);
        let (archive, entry) = store(&data, &[400], &[false, true]);
        let mut shifted = vec![0u8; 77];
        shifted.extend_from_slice(&archive);
        let shared = Arc::new(Mutex::new(Cursor::new(shifted)));
        let mut out = Vec::new();
        EntryReader::new(shared, entry, 77)
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, data);
    }
}
