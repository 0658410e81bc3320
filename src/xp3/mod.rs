//! Kirikiri XP3 archive codec.
//!
//! [Xp3Archive] opens and extracts archives, [Xp3ArchiveWriter] packs them.
pub mod archive;
pub mod checksum;
pub mod chunk;
pub mod consts;
pub mod entry;
pub mod error;
pub mod header;
pub mod index;
pub mod segment;
pub mod segmenter;
pub mod writer;

pub use archive::{ExtractReport, Extracted, Xp3Archive};
pub use checksum::ChecksumStatus;
pub use entry::{EntrySummary, FileEntry, Segment};
pub use error::{Result, Xp3Error};
pub use header::{FormatVersion, Xp3Header};
pub use segment::EntryReader;
pub use segmenter::{SegmenterConfig, parse_segmenter_config};
pub use writer::{AddOptions, Stats, Xp3ArchiveWriter};
