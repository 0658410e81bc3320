//! `File` records: metadata, segment table and checksum of one stored file.
use super::chunk::*;
use super::consts::*;
use super::error::*;
use crate::utils::encoding::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// A contiguous stored run of a file's data.
pub struct Segment {
    pub compressed: bool,
    /// Offset of the stored bytes from the start of the archive.
    pub offset: u64,
    pub original_size: u64,
    pub archived_size: u64,
}

impl Segment {
    pub fn flags(&self) -> u32 {
        if self.compressed {
            TVP_XP3_SEGM_ENCODE_ZLIB
        } else {
            TVP_XP3_SEGM_ENCODE_RAW
        }
    }

    fn decode(record: &[u8]) -> Result<Self> {
        let flags = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let u64_at = |pos: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&record[pos..pos + 8]);
            u64::from_le_bytes(buf)
        };
        let compressed = match flags & TVP_XP3_SEGM_ENCODE_METHOD_MASK {
            TVP_XP3_SEGM_ENCODE_RAW => false,
            TVP_XP3_SEGM_ENCODE_ZLIB => true,
            method => {
                return Err(Xp3Error::CorruptSegmentTable(format!(
                    "unknown segment encode method {}",
                    method
                )));
            }
        };
        let seg = Segment {
            compressed,
            offset: u64_at(4),
            original_size: u64_at(12),
            archived_size: u64_at(20),
        };
        if !seg.compressed && seg.original_size != seg.archived_size {
            return Err(Xp3Error::CorruptSegmentTable(format!(
                "raw segment at {:#x} stores {} bytes but declares {}",
                seg.offset, seg.archived_size, seg.original_size
            )));
        }
        Ok(seg)
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.flags().to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.original_size.to_le_bytes());
        buf.extend_from_slice(&self.archived_size.to_le_bytes());
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path, `/` separated.
    pub name: String,
    pub flags: u32,
    pub original_size: u64,
    pub archived_size: u64,
    pub segments: Vec<Segment>,
    /// Adler-32 of the reconstructed data.
    pub checksum: Option<u32>,
}

/// Listing record for one entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub name: String,
    pub size: u64,
    pub archived_size: u64,
    pub compressed: bool,
    pub protected: bool,
}

impl FileEntry {
    /// The protection bit only asks tools not to extract the file.
    pub fn is_protected(&self) -> bool {
        self.flags & TVP_XP3_FILE_PROTECTED != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.segments.iter().any(|s| s.compressed)
    }

    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            name: self.name.clone(),
            size: self.original_size,
            archived_size: self.archived_size,
            compressed: self.is_compressed(),
            protected: self.is_protected(),
        }
    }

    /// Decode a `File` chunk payload with the built-in handlers.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        DEFAULT_DECODER.decode(payload)
    }

    /// Encode as a complete `File` chunk.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = encode_utf16le(&self.name);
        let name_len = u16::try_from(name.len() / 2).map_err(|_| {
            Xp3Error::InvalidFileName(format!("{} (name too long)", self.name))
        })?;
        let mut info = Vec::with_capacity(INFO_FIXED_SIZE + name.len());
        info.extend_from_slice(&self.flags.to_le_bytes());
        info.extend_from_slice(&self.original_size.to_le_bytes());
        info.extend_from_slice(&self.archived_size.to_le_bytes());
        info.extend_from_slice(&name_len.to_le_bytes());
        info.extend_from_slice(&name);

        let mut segm = Vec::with_capacity(self.segments.len() * SEGMENT_RECORD_SIZE);
        for seg in &self.segments {
            seg.encode(&mut segm);
        }

        let mut inner = ChunkWriter::new();
        inner.write_chunk(CHUNK_INFO, &info)?;
        inner.write_chunk(CHUNK_SEGM, &segm)?;
        if let Some(checksum) = self.checksum {
            inner.write_chunk(CHUNK_ADLR, &checksum.to_le_bytes())?;
        }
        let mut file = ChunkWriter::new();
        file.write_chunk(CHUNK_FILE, &inner.into_inner())?;
        Ok(file.into_inner())
    }

    /// Check the declared sizes against the segment table.
    pub fn validate(&self) -> Result<()> {
        let mut original = 0u64;
        let mut archived = 0u64;
        for seg in &self.segments {
            original = original.checked_add(seg.original_size).ok_or_else(|| {
                Xp3Error::CorruptSegmentTable(format!("{}: segment sizes overflow", self.name))
            })?;
            archived = archived.checked_add(seg.archived_size).ok_or_else(|| {
                Xp3Error::CorruptSegmentTable(format!("{}: segment sizes overflow", self.name))
            })?;
        }
        if original != self.original_size || archived != self.archived_size {
            return Err(Xp3Error::CorruptSegmentTable(format!(
                "{}: declared {}/{} bytes but segments hold {}/{}",
                self.name, self.original_size, self.archived_size, original, archived
            )));
        }
        Ok(())
    }
}

/// Decoded contents of an `info` chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub flags: u32,
    pub original_size: u64,
    pub archived_size: u64,
    pub name: String,
}

/// A `File` record while its nested chunks are being decoded.
#[derive(Clone, Debug, Default)]
pub struct PartialEntry {
    pub info: Option<FileInfo>,
    pub segments: Option<Vec<Segment>>,
    pub checksum: Option<u32>,
}

impl PartialEntry {
    pub fn finish(self) -> Result<FileEntry> {
        let info = self
            .info
            .ok_or_else(|| Xp3Error::CorruptIndex("File chunk without info chunk".into()))?;
        let segments = self.segments.ok_or_else(|| {
            Xp3Error::CorruptIndex(format!("File chunk {} without segm chunk", info.name))
        })?;
        let entry = FileEntry {
            name: info.name,
            flags: info.flags,
            original_size: info.original_size,
            archived_size: info.archived_size,
            segments,
            checksum: self.checksum,
        };
        entry.validate()?;
        Ok(entry)
    }
}

/// Decodes one nested chunk into the entry under construction.
pub type ChunkHandler = fn(&[u8], &mut PartialEntry) -> Result<()>;

/// Tag-keyed handler table for the chunks nested in a `File` record.
///
/// Tags without a handler are skipped.
#[derive(Clone)]
pub struct EntryDecoder {
    handlers: HashMap<[u8; 4], ChunkHandler>,
}

impl EntryDecoder {
    /// A decoder that knows no tags.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Install `handler` for `tag`, returning the handler it replaces.
    pub fn register(&mut self, tag: [u8; 4], handler: ChunkHandler) -> Option<ChunkHandler> {
        self.handlers.insert(tag, handler)
    }

    pub fn decode(&self, payload: &[u8]) -> Result<FileEntry> {
        let mut partial = PartialEntry::default();
        for chunk in ChunkReader::new(payload) {
            let chunk = chunk?;
            match self.handlers.get(&chunk.tag) {
                Some(handler) => handler(chunk.data, &mut partial)?,
                None => tracing::debug!("Skipping unknown File sub-chunk {:?}", chunk.tag_str()),
            }
        }
        partial.finish()
    }
}

impl Default for EntryDecoder {
    fn default() -> Self {
        let mut decoder = Self::empty();
        decoder.register(*CHUNK_INFO, decode_info);
        decoder.register(*CHUNK_SEGM, decode_segm);
        decoder.register(*CHUNK_ADLR, decode_adlr);
        decoder
    }
}

impl std::fmt::Debug for EntryDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<String> = self
            .handlers
            .keys()
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .collect();
        f.debug_struct("EntryDecoder").field("tags", &tags).finish()
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_DECODER: EntryDecoder = EntryDecoder::default();
}

pub fn decode_info(data: &[u8], entry: &mut PartialEntry) -> Result<()> {
    if data.len() < INFO_FIXED_SIZE {
        return Err(Xp3Error::CorruptIndex(format!(
            "info chunk is {} bytes, need at least {}",
            data.len(),
            INFO_FIXED_SIZE
        )));
    }
    let flags = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[4..12]);
    let original_size = u64::from_le_bytes(buf);
    buf.copy_from_slice(&data[12..20]);
    let archived_size = u64::from_le_bytes(buf);
    let name_len = u16::from_le_bytes([data[20], data[21]]) as usize;
    let name_bytes = &data[INFO_FIXED_SIZE..];
    if name_len * 2 > name_bytes.len() {
        return Err(Xp3Error::CorruptIndex(format!(
            "file name of {} code units overruns info chunk ({} bytes left)",
            name_len,
            name_bytes.len()
        )));
    }
    let (decoded, exact) = decode_utf16le(&name_bytes[..name_len * 2]);
    if !exact {
        warn!("File name {:?} is not valid UTF-16, decoded lossily", decoded);
        crate::COUNTER.inc_warning();
    }
    let mut name = decoded.trim_end_matches('\0').to_string();
    if name.contains('\\') {
        warn!("File name {:?} uses '\\' as separator, normalized to '/'", name);
        crate::COUNTER.inc_warning();
        name = name.replace('\\', "/");
    }
    entry.info = Some(FileInfo {
        flags,
        original_size,
        archived_size,
        name,
    });
    Ok(())
}

pub fn decode_segm(data: &[u8], entry: &mut PartialEntry) -> Result<()> {
    if data.len() % SEGMENT_RECORD_SIZE != 0 {
        return Err(Xp3Error::CorruptSegmentTable(format!(
            "segm chunk is {} bytes, not a multiple of {}",
            data.len(),
            SEGMENT_RECORD_SIZE
        )));
    }
    let segments = data
        .chunks_exact(SEGMENT_RECORD_SIZE)
        .map(Segment::decode)
        .collect::<Result<Vec<_>>>()?;
    entry.segments = Some(segments);
    Ok(())
}

pub fn decode_adlr(data: &[u8], entry: &mut PartialEntry) -> Result<()> {
    if data.len() < 4 {
        return Err(Xp3Error::CorruptIndex(format!(
            "adlr chunk is {} bytes, need 4",
            data.len()
        )));
    }
    entry.checksum = Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
    Ok(())
}

/// Normalize a path for storage: `\` becomes `/` and leading `/` are dropped.
///
/// Empty names and names with empty, `.` or `..` components are rejected.
pub fn normalize_name(name: &str) -> Result<String> {
    let replaced = name.replace('\\', "/");
    let trimmed = replaced.trim_start_matches('/');
    if trimmed.is_empty()
        || trimmed
            .split('/')
            .any(|c| c.is_empty() || c == "." || c == "..")
    {
        return Err(Xp3Error::InvalidFileName(name.to_string()));
    }
    Ok(trimmed.to_string())
}
