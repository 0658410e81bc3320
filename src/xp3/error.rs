//! Error types for XP3 parsing and packing

use thiserror::Error;

/// Result type for XP3 operations
pub type Result<T> = std::result::Result<T, Xp3Error>;

/// XP3 error types
#[derive(Error, Debug)]
pub enum Xp3Error {
    /// IO error from the backing storage
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream does not start with the XP3 signature
    #[error("Invalid XP3 magic: {0:02X?}")]
    BadMagic(Vec<u8>),

    /// A reserved header field holds a value this codec does not know.
    /// Only ever reported as a warning.
    #[error("Unsupported value in reserved header field {field}: {value:#x}")]
    UnsupportedReservedField { field: &'static str, value: u64 },

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Corrupt segment table: {0}")]
    CorruptSegmentTable(String),

    #[error("Corrupt segment data at offset {offset:#x}: {reason}")]
    CorruptSegmentData { offset: u64, reason: String },

    /// Reconstructed length differs from the declared size
    #[error("Size mismatch for {name}: declared {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// Adler-32 mismatch. Soft unless strict checksums are requested.
    #[error("Checksum mismatch for {name}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Segmenter error: {0}")]
    Segmenter(String),
}

impl Xp3Error {
    /// Whether the format treats this condition as advisory.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Xp3Error::UnsupportedReservedField { .. } | Xp3Error::ChecksumMismatch { .. }
        )
    }

    /// Recover an error that was carried through an [std::io::Error].
    pub(crate) fn from_io(err: std::io::Error) -> Xp3Error {
        match err.downcast::<Xp3Error>() {
            Ok(e) => e,
            Err(err) => Xp3Error::Io(err),
        }
    }

    /// Turn an early end of stream into `f()`, pass other IO errors through.
    pub(crate) fn eof_as(err: std::io::Error, f: impl FnOnce() -> Xp3Error) -> Xp3Error {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            f()
        } else {
            Xp3Error::Io(err)
        }
    }
}

#[test]
fn test_from_io_recovers_wrapped_error() {
    let wrapped = std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        Xp3Error::CorruptSegmentData {
            offset: 0x28,
            reason: "compressed segment ended early".into(),
        },
    );
    assert!(matches!(
        Xp3Error::from_io(wrapped),
        Xp3Error::CorruptSegmentData { offset: 0x28, .. }
    ));
    let plain = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    assert!(matches!(Xp3Error::from_io(plain), Xp3Error::Io(_)));
}
