/// XP3 file header signature: `XP3\r\n \n\x1a\x8b\x67\x01`
pub const XP3_MAGIC: &[u8; 11] = b"XP3\r\n \n\x1a\x8b\x67\x01";
/// Marks the V2 (Kirikiri 2.30+) header layout when found right after the magic.
pub const XP3_V2_SENTINEL: [u8; 8] = [0x17, 0, 0, 0, 0, 0, 0, 0];
pub const XP3_V2_MINOR_VERSION: u32 = 1;
pub const XP3_V2_HEADER_TAG: u8 = TVP_XP3_INDEX_CONTINUE;
pub const XP3_V1_HEADER_SIZE: u64 = 11 + 8;
pub const XP3_V2_HEADER_SIZE: u64 = 11 + 8 + 4 + 1 + 8 + 8;

// Chunk names
pub const CHUNK_FILE: &[u8; 4] = b"File";
pub const CHUNK_INFO: &[u8; 4] = b"info";
pub const CHUNK_SEGM: &[u8; 4] = b"segm";
pub const CHUNK_ADLR: &[u8; 4] = b"adlr";

/// Tag (4) + length (8)
pub const CHUNK_HEADER_SIZE: usize = 12;
/// flags (4) + offset (8) + original size (8) + archived size (8)
pub const SEGMENT_RECORD_SIZE: usize = 28;
/// `info` payload without the file name
pub const INFO_FIXED_SIZE: usize = 4 + 8 + 8 + 2;

// Index entry flags
pub const TVP_XP3_INDEX_ENCODE_METHOD_MASK: u8 = 0x07;
pub const TVP_XP3_INDEX_ENCODE_RAW: u8 = 0;
pub const TVP_XP3_INDEX_ENCODE_ZLIB: u8 = 1;
pub const TVP_XP3_INDEX_CONTINUE: u8 = 0x80;

// File entry flags
pub const TVP_XP3_FILE_PROTECTED: u32 = 1 << 31;

// Segment entry flags
pub const TVP_XP3_SEGM_ENCODE_METHOD_MASK: u32 = 0x07;
pub const TVP_XP3_SEGM_ENCODE_RAW: u32 = 0;
pub const TVP_XP3_SEGM_ENCODE_ZLIB: u32 = 1;
