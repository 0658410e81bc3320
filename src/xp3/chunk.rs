//! Tag + length framing shared by the index and the `File` records.
//!
//! A chunk is a 4-byte ASCII tag, a little-endian u64 payload length (not
//! counting these 12 bytes), then the payload. Readers skip tags they do not
//! know by the length alone.
use super::consts::*;
use super::error::*;
use crate::ext::io::*;
use std::io::Write;

/// One framed chunk borrowed from its region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub tag: [u8; 4],
    pub data: &'a [u8],
}

impl<'a> Chunk<'a> {
    pub fn is(&self, tag: &[u8; 4]) -> bool {
        &self.tag == tag
    }

    pub fn tag_str(&self) -> String {
        String::from_utf8_lossy(&self.tag).into_owned()
    }
}

/// Iterates the chunks of a region.
#[derive(Debug)]
pub struct ChunkReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ChunkReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Offset of the next chunk within the region.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read the next chunk and advance past its payload.
    ///
    /// Fewer than 12 trailing bytes cannot hold a chunk and end the region.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk<'a>>> {
        let remaining = self.data.len() - self.pos;
        if remaining < CHUNK_HEADER_SIZE {
            self.pos = self.data.len();
            return Ok(None);
        }
        let header = &self.data[self.pos..self.pos + CHUNK_HEADER_SIZE];
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&header[..4]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&header[4..]);
        let len = u64::from_le_bytes(len_bytes);
        let start = self.pos + CHUNK_HEADER_SIZE;
        let available = self.data.len() - start;
        if len > available as u64 {
            let at = self.pos;
            self.pos = self.data.len();
            return Err(Xp3Error::CorruptIndex(format!(
                "chunk {:?} at {:#x} declares {} bytes but only {} remain",
                String::from_utf8_lossy(&tag),
                at,
                len,
                available
            )));
        }
        let end = start + len as usize;
        self.pos = end;
        Ok(Some(Chunk {
            tag,
            data: &self.data[start..end],
        }))
    }
}

impl<'a> Iterator for ChunkReader<'a> {
    type Item = Result<Chunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

/// Builds a run of chunks in memory.
#[derive(Debug, Default)]
pub struct ChunkWriter {
    buf: Vec<u8>,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_chunk(&mut self, tag: &[u8; 4], payload: &[u8]) -> Result<()> {
        self.buf.write_all(tag)?;
        self.buf.write_u64(payload.len() as u64)?;
        self.buf.write_all(payload)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
