//! Extensions for [std::io] used by the archive codecs.
//!
//! Every multi-byte integer is converted with explicit little-endian byte
//! order, never with the host representation.
use crate::ext::mutex::*;
use std::io::*;
use std::sync::{Arc, Mutex};

pub trait Peek {
    /// Fill `buf` without moving the stream position.
    fn peek_extract(&mut self, buf: &mut [u8]) -> Result<()>;
}

impl<T: Read + Seek> Peek for T {
    fn peek_extract(&mut self, buf: &mut [u8]) -> Result<()> {
        let current_pos = self.stream_position()?;
        let res = self.read_exact(buf);
        self.seek(SeekFrom::Start(current_pos))?;
        res
    }
}

pub trait ReadExt {
    fn read_u8(&mut self) -> Result<u8>;
    fn read_u32(&mut self) -> Result<u32>;
    fn read_u64(&mut self) -> Result<u64>;

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>>;
}

impl<T: Read> ReadExt for T {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }
    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

pub trait WriteExt {
    fn write_u8(&mut self, value: u8) -> Result<()>;
    fn write_u32(&mut self, value: u32) -> Result<()>;
    fn write_u64(&mut self, value: u64) -> Result<()>;
}

impl<T: Write> WriteExt for T {
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }
    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }
    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }
}

pub trait SeekExt {
    /// Total length of the stream. The current position is preserved.
    fn stream_length(&mut self) -> Result<u64>;
}

impl<T: Seek> SeekExt for T {
    fn stream_length(&mut self) -> Result<u64> {
        let current_pos = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(current_pos))?;
        Ok(len)
    }
}

pub trait WriteAtExt {
    /// Overwrite a little-endian u64 at `offset` and return to the previous position.
    fn write_u64_at(&mut self, offset: u64, value: u64) -> Result<()>;
}

impl<T: Write + Seek> WriteAtExt for T {
    fn write_u64_at(&mut self, offset: u64, value: u64) -> Result<()> {
        let current_pos = self.stream_position()?;
        self.seek(SeekFrom::Start(offset))?;
        self.write_u64(value)?;
        self.seek(SeekFrom::Start(current_pos))?;
        Ok(())
    }
}

/// Positioned reads on a shared reader.
///
/// The seek and the read happen under one lock, so callers on different
/// threads never observe each other's cursor.
pub trait ReadAt {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn read_exact_vec_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl<T: Read + Seek> ReadAt for Mutex<T> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.lock_blocking();
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(buf)
    }
}

/// A [Read] view of a shared reader with its own cursor.
#[derive(Debug)]
pub struct MutexWrapper<T> {
    inner: Arc<Mutex<T>>,
    pos: u64,
}

impl<T> MutexWrapper<T> {
    pub fn new(inner: Arc<Mutex<T>>, pos: u64) -> Self {
        Self { inner, pos }
    }
}

impl<T: Read + Seek> Read for MutexWrapper<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.inner.lock_blocking();
        reader.seek(SeekFrom::Start(self.pos))?;
        let readed = reader.read(buf)?;
        self.pos += readed as u64;
        Ok(readed)
    }
}

#[test]
fn test_le_helpers() {
    let mut buf = Vec::new();
    buf.write_u8(0x7f).unwrap();
    buf.write_u32(0x03040506).unwrap();
    buf.write_u64(0x0708090a0b0c0d0e).unwrap();
    assert_eq!(&buf[..3], &[0x7f, 0x06, 0x05]);
    let mut reader = &buf[..];
    assert_eq!(reader.read_u8().unwrap(), 0x7f);
    assert_eq!(reader.read_u32().unwrap(), 0x03040506);
    assert_eq!(reader.read_u64().unwrap(), 0x0708090a0b0c0d0e);
    assert!(reader.read_u8().is_err());
}

#[test]
fn test_write_u64_at_keeps_position() {
    let mut cur = Cursor::new(vec![0u8; 16]);
    cur.seek(SeekFrom::End(0)).unwrap();
    cur.write_u64_at(4, 0x1122334455667788).unwrap();
    assert_eq!(cur.stream_position().unwrap(), 16);
    assert_eq!(&cur.get_ref()[4..12], &0x1122334455667788u64.to_le_bytes());
}

#[test]
fn test_mutex_wrapper_independent_cursors() {
    let shared = Arc::new(Mutex::new(Cursor::new(b"0123456789".to_vec())));
    let mut a = MutexWrapper::new(shared.clone(), 2);
    let mut b = MutexWrapper::new(shared.clone(), 7);
    let mut buf = [0u8; 2];
    a.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"23");
    b.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"78");
    a.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"45");
    assert_eq!(shared.read_exact_vec_at(0, 3).unwrap(), b"012");
}
