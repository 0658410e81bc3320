//! Adler-32 checksums over reconstructed file data.
use adler::Adler32;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Adler-32 of `data`.
pub fn adler32(data: &[u8]) -> u32 {
    adler::adler32_slice(data)
}

/// Outcome of checking an entry against its `adlr` chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ChecksumStatus {
    Verified,
    /// The entry carries no checksum.
    Missing,
    Mismatch { expected: u32, actual: u32 },
}

impl ChecksumStatus {
    pub fn check(expected: Option<u32>, actual: u32) -> Self {
        match expected {
            None => ChecksumStatus::Missing,
            Some(expected) if expected == actual => ChecksumStatus::Verified,
            Some(expected) => ChecksumStatus::Mismatch { expected, actual },
        }
    }

    pub fn is_mismatch(&self) -> bool {
        matches!(self, ChecksumStatus::Mismatch { .. })
    }
}

/// Passes data through while accumulating its Adler-32.
pub struct ChecksumStream<T> {
    inner: T,
    adler: Adler32,
}

impl<T> ChecksumStream<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            adler: Adler32::new(),
        }
    }

    pub fn checksum(&self) -> u32 {
        self.adler.checksum()
    }

    pub fn into_inner(self) -> (T, u32) {
        let sum = self.adler.checksum();
        (self.inner, sum)
    }
}

impl<T: Read> Read for ChecksumStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.adler.write_slice(&buf[..n]);
        Ok(n)
    }
}

impl<T: Write> Write for ChecksumStream<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.adler.write_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[test]
fn test_adler32_known_vectors() {
    assert_eq!(adler32(b""), 1);
    assert_eq!(adler32(b"abc"), 0x024d0127);
    assert_eq!(adler32(b"Wikipedia"), 0x11E60398);
}

#[test]
fn test_checksum_stream_matches_slice() {
    let data: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let mut stream = ChecksumStream::new(&data[..]);
    let mut out = Vec::new();
    std::io::copy(&mut stream, &mut out).unwrap();
    assert_eq!(out, data);
    assert_eq!(stream.checksum(), adler32(&data));

    let mut sink = ChecksumStream::new(Vec::new());
    sink.write_all(b"abc").unwrap();
    let (inner, sum) = sink.into_inner();
    assert_eq!(inner, b"abc");
    assert_eq!(sum, 0x024d0127);
}

#[test]
fn test_checksum_status() {
    assert_eq!(ChecksumStatus::check(None, 5), ChecksumStatus::Missing);
    assert_eq!(ChecksumStatus::check(Some(5), 5), ChecksumStatus::Verified);
    assert!(ChecksumStatus::check(Some(4), 5).is_mismatch());
}
