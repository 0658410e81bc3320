//! XP3 header detection and emission.
//!
//! Two layouts exist. Both start with [XP3_MAGIC]:
//!
//! * V1: `magic | index_offset(8)`
//! * V2: `magic | 17 00 00 00 00 00 00 00 | minor_version(4) | tag(1) | index_size(8) | index_offset(8)`
use super::consts::*;
use super::error::*;
use crate::ext::io::*;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::debug;

const SCAN_BLOCK_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Header layout written by a packer.
pub enum FormatVersion {
    /// Original layout
    V1,
    /// Layout introduced with Kirikiri 2.30
    #[default]
    V2,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Xp3Header {
    V1 {
        index_offset: u64,
    },
    V2 {
        /// Always 1 so far.
        minor_version: u32,
        /// Always `0x80` so far.
        tag: u8,
        /// Reserved, always 0 so far.
        index_size: u64,
        index_offset: u64,
    },
}

impl Xp3Header {
    pub fn new(version: FormatVersion, index_offset: u64) -> Self {
        match version {
            FormatVersion::V1 => Xp3Header::V1 { index_offset },
            FormatVersion::V2 => Xp3Header::V2 {
                minor_version: XP3_V2_MINOR_VERSION,
                tag: XP3_V2_HEADER_TAG,
                index_size: 0,
                index_offset,
            },
        }
    }

    pub fn version(&self) -> FormatVersion {
        match self {
            Xp3Header::V1 { .. } => FormatVersion::V1,
            Xp3Header::V2 { .. } => FormatVersion::V2,
        }
    }

    pub fn index_offset(&self) -> u64 {
        match self {
            Xp3Header::V1 { index_offset } | Xp3Header::V2 { index_offset, .. } => *index_offset,
        }
    }

    /// Size of the header in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Xp3Header::V1 { .. } => XP3_V1_HEADER_SIZE,
            Xp3Header::V2 { .. } => XP3_V2_HEADER_SIZE,
        }
    }

    /// Parse a header at the reader's current position.
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let mut magic = Vec::with_capacity(XP3_MAGIC.len());
        reader
            .by_ref()
            .take(XP3_MAGIC.len() as u64)
            .read_to_end(&mut magic)?;
        if magic[..] != XP3_MAGIC[..] {
            return Err(Xp3Error::BadMagic(magic));
        }
        let truncated = || Xp3Error::CorruptIndex("XP3 header is truncated".into());
        let mut sentinel = [0u8; 8];
        reader
            .peek_extract(&mut sentinel)
            .map_err(|e| Xp3Error::eof_as(e, truncated))?;
        let header = if sentinel == XP3_V2_SENTINEL {
            reader.seek(SeekFrom::Current(sentinel.len() as i64))?;
            let read_v2 = |reader: &mut R| -> std::io::Result<Self> {
                Ok(Xp3Header::V2 {
                    minor_version: reader.read_u32()?,
                    tag: reader.read_u8()?,
                    index_size: reader.read_u64()?,
                    index_offset: reader.read_u64()?,
                })
            };
            read_v2(reader).map_err(|e| Xp3Error::eof_as(e, truncated))?
        } else {
            Xp3Header::V1 {
                index_offset: reader
                    .read_u64()
                    .map_err(|e| Xp3Error::eof_as(e, truncated))?,
            }
        };
        debug!(
            "XP3 header: {:?}, index at {:#x}",
            header.version(),
            header.index_offset()
        );
        Ok(header)
    }

    /// Reserved V2 fields that hold values other than the documented ones.
    pub fn reserved_field_warnings(&self) -> Vec<Xp3Error> {
        let mut warnings = Vec::new();
        if let Xp3Header::V2 {
            minor_version,
            tag,
            index_size,
            ..
        } = *self
        {
            if minor_version != XP3_V2_MINOR_VERSION {
                warnings.push(Xp3Error::UnsupportedReservedField {
                    field: "minor_version",
                    value: minor_version as u64,
                });
            }
            if tag != XP3_V2_HEADER_TAG {
                warnings.push(Xp3Error::UnsupportedReservedField {
                    field: "header_tag",
                    value: tag as u64,
                });
            }
            if index_size != 0 {
                warnings.push(Xp3Error::UnsupportedReservedField {
                    field: "index_size",
                    value: index_size,
                });
            }
        }
        warnings
    }

    /// Write the header at the writer's position.
    ///
    /// Returns the absolute position of the index offset field, to be
    /// patched with [patch_index_offset] once the index is laid out.
    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> Result<u64> {
        writer.write_all(XP3_MAGIC)?;
        if let Xp3Header::V2 {
            minor_version,
            tag,
            index_size,
            ..
        } = *self
        {
            writer.write_all(&XP3_V2_SENTINEL)?;
            writer.write_u32(minor_version)?;
            writer.write_u8(tag)?;
            writer.write_u64(index_size)?;
        }
        let field_pos = writer.stream_position()?;
        writer.write_u64(self.index_offset())?;
        Ok(field_pos)
    }
}

/// Store the final index offset into a header written by [Xp3Header::write].
pub fn patch_index_offset<W: Write + Seek>(
    writer: &mut W,
    field_pos: u64,
    index_offset: u64,
) -> Result<()> {
    writer.write_u64_at(field_pos, index_offset)?;
    Ok(())
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Search the first `limit` bytes from the current position for the XP3
/// signature, as found in archives appended to an executable.
///
/// The reader position is restored. Returns the absolute offset of the magic.
pub fn find_signature<R: Read + Seek>(reader: &mut R, limit: u64) -> Result<Option<u64>> {
    let start = reader.stream_position()?;
    let overlap = XP3_MAGIC.len() - 1;
    let mut buf = vec![0u8; SCAN_BLOCK_SIZE + overlap];
    let mut carry = 0usize;
    let mut base = start;
    let mut found = None;
    loop {
        let n = fill(reader, &mut buf[carry..])?;
        let filled = carry + n;
        if let Some(pos) = memchr::memmem::find(&buf[..filled], XP3_MAGIC) {
            found = Some(base + pos as u64);
            break;
        }
        if n == 0 || base + (filled as u64) - start >= limit {
            break;
        }
        carry = overlap.min(filled);
        buf.copy_within(filled - carry..filled, 0);
        base += (filled - carry) as u64;
    }
    reader.seek(SeekFrom::Start(start))?;
    Ok(found.filter(|&pos| pos - start < limit))
}
