//! The trailing index: an optionally zlib-compressed run of `File` chunks.
use super::chunk::*;
use super::consts::*;
use super::entry::*;
use super::error::*;
use crate::ext::io::*;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::debug;

/// Upper bound for buffers preallocated from untrusted size fields.
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

fn check_remaining(what: &str, size: u64, remaining: u64) -> Result<()> {
    if size > remaining {
        return Err(Xp3Error::CorruptIndex(format!(
            "{} of {} bytes runs past the end of the archive ({} bytes left)",
            what, size, remaining
        )));
    }
    Ok(())
}

/// Inflate a zlib stream that must expand to exactly `expected` bytes.
pub(crate) fn inflate_exact(data: &[u8], expected: u64) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected.min(MAX_PREALLOC) as usize);
    flate2::read::ZlibDecoder::new(data)
        .take(expected.saturating_add(1))
        .read_to_end(&mut out)?;
    if out.len() as u64 != expected {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("inflated to {} bytes, expected {}", out.len(), expected),
        ));
    }
    Ok(out)
}

pub(crate) fn deflate(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut e = flate2::write::ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2),
        flate2::Compression::new(level),
    );
    e.write_all(data)?;
    e.finish()
}

/// Read the index block at `offset` and return the uncompressed chunk stream.
pub fn read_index<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<Vec<u8>> {
    let len = reader.stream_length()?;
    if offset >= len {
        return Err(Xp3Error::CorruptIndex(format!(
            "index offset {:#x} is outside the archive ({} bytes)",
            offset, len
        )));
    }
    reader.seek(SeekFrom::Start(offset))?;
    let truncated = || Xp3Error::CorruptIndex("index block is truncated".into());
    let flag = reader
        .read_u8()
        .map_err(|e| Xp3Error::eof_as(e, truncated))?;
    match flag {
        TVP_XP3_INDEX_ENCODE_RAW => {
            let size = reader
                .read_u64()
                .map_err(|e| Xp3Error::eof_as(e, truncated))?;
            check_remaining("raw index", size, len - offset - 9)?;
            debug!("Raw index at {:#x}, {} bytes", offset, size);
            Ok(reader.read_exact_vec(size as usize)?)
        }
        TVP_XP3_INDEX_ENCODE_ZLIB => {
            let mut sizes = [0u64; 2];
            for size in sizes.iter_mut() {
                *size = reader
                    .read_u64()
                    .map_err(|e| Xp3Error::eof_as(e, truncated))?;
            }
            let [compressed_size, original_size] = sizes;
            check_remaining("compressed index", compressed_size, len - offset - 17)?;
            debug!(
                "Compressed index at {:#x}, {} -> {} bytes",
                offset, compressed_size, original_size
            );
            let compressed = reader.read_exact_vec(compressed_size as usize)?;
            inflate_exact(&compressed, original_size)
                .map_err(|e| Xp3Error::CorruptIndex(format!("failed to inflate index: {}", e)))
        }
        flag if flag & TVP_XP3_INDEX_CONTINUE != 0 => Err(Xp3Error::CorruptIndex(format!(
            "chained index blocks are not supported (flag {:#04x})",
            flag
        ))),
        flag => Err(Xp3Error::CorruptIndex(format!(
            "unknown index encode method {:#04x}",
            flag
        ))),
    }
}

/// Decode every `File` record of an index. Other top-level chunks are skipped.
pub fn parse_index(data: &[u8]) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for chunk in ChunkReader::new(data) {
        let chunk = chunk?;
        if chunk.is(CHUNK_FILE) {
            entries.push(FileEntry::decode(chunk.data)?);
        } else {
            debug!(
                "Skipping index chunk {:?} ({} bytes)",
                chunk.tag_str(),
                chunk.data.len()
            );
        }
    }
    Ok(entries)
}

/// Serialize entries into an uncompressed index chunk stream.
pub fn build_index(entries: &[FileEntry]) -> Result<Vec<u8>> {
    let mut index = Vec::new();
    for entry in entries {
        index.extend_from_slice(&entry.encode()?);
    }
    Ok(index)
}

/// Write the index block. `compression` is the zlib level, or `None` for a raw index.
pub fn write_index<W: Write>(writer: &mut W, index: &[u8], compression: Option<u32>) -> Result<()> {
    match compression {
        Some(level) => {
            let compressed = deflate(index, level)?;
            writer.write_u8(TVP_XP3_INDEX_ENCODE_ZLIB)?;
            writer.write_u64(compressed.len() as u64)?;
            writer.write_u64(index.len() as u64)?;
            writer.write_all(&compressed)?;
        }
        None => {
            writer.write_u8(TVP_XP3_INDEX_ENCODE_RAW)?;
            writer.write_u64(index.len() as u64)?;
            writer.write_all(index)?;
        }
    }
    Ok(())
}
