use crate::xp3::header::FormatVersion;
use crate::xp3::segment::CompressionPolicy;
use crate::xp3::segmenter::SegmenterConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_zlib_compression_level() -> u32 {
    6
}

fn default_compress_workers() -> usize {
    num_cpus::get()
}

/// Signature scans look this far into the stream.
fn default_scan_limit() -> u64 {
    16 * 1024 * 1024
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Options shared by the XP3 reader and writer
pub struct Xp3Config {
    /// Header layout written by new archives.
    pub version: FormatVersion,
    /// Deflate file segments when packing.
    pub compress_files: bool,
    /// Deflate the index when packing.
    pub compress_index: bool,
    /// Zlib compression level (0-9)
    pub zlib_compression_level: u32,
    /// Store a segment raw when deflate would not make it smaller.
    pub compress_only_if_smaller: bool,
    /// Write an `adlr` chunk for every file.
    pub write_checksum: bool,
    /// How files are split into segments.
    pub segmenter: SegmenterConfig,
    /// Threads used to deflate the segments of one file.
    pub compress_workers: usize,
    /// Store identical segments once.
    pub dedup_segments: bool,
    /// Fail reads whose Adler-32 does not match instead of warning.
    pub strict_checksum: bool,
    /// Look for the XP3 signature past the start of the stream,
    /// e.g. behind an executable stub.
    pub scan_for_signature: bool,
    pub scan_limit: u64,
}

impl Default for Xp3Config {
    fn default() -> Self {
        Self {
            version: FormatVersion::default(),
            compress_files: true,
            compress_index: true,
            zlib_compression_level: default_zlib_compression_level(),
            compress_only_if_smaller: true,
            write_checksum: true,
            segmenter: SegmenterConfig::default(),
            compress_workers: default_compress_workers(),
            dedup_segments: false,
            strict_checksum: false,
            scan_for_signature: false,
            scan_limit: default_scan_limit(),
        }
    }
}

impl Xp3Config {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn compression_policy(&self) -> CompressionPolicy {
        CompressionPolicy {
            compress: self.compress_files,
            level: self.zlib_compression_level.min(9),
            only_if_smaller: self.compress_only_if_smaller,
        }
    }
}

#[test]
fn test_config_defaults_from_partial_json() {
    let config: Xp3Config =
        serde_json::from_str(r#"{"version":"v1","segmenter":{"type":"fixed","size":1024}}"#)
            .unwrap();
    assert_eq!(config.version, FormatVersion::V1);
    assert_eq!(config.segmenter, SegmenterConfig::Fixed { size: 1024 });
    assert!(config.compress_files);
    assert!(config.write_checksum);
    assert_eq!(config.zlib_compression_level, 6);
    assert!(!config.strict_checksum);
    assert!(config.compress_workers >= 1);
}

#[test]
fn test_config_from_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xp3.json");
    std::fs::write(&path, r#"{"strict_checksum":true,"compress_index":false}"#).unwrap();
    let config = Xp3Config::from_json_file(&path).unwrap();
    assert!(config.strict_checksum);
    assert!(!config.compress_index);
    assert_eq!(config.version, FormatVersion::V2);

    std::fs::write(&path, "{ not json").unwrap();
    assert!(Xp3Config::from_json_file(&path).is_err());
    assert!(Xp3Config::from_json_file(dir.path().join("missing.json")).is_err());
}
