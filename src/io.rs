//! Framed binary I/O: buffered reader/writer with a running CRC and a
//! sticky error flag, used by every entity serializer.
//!
//! Every primitive write updates the CRC over the bytes being written
//! *before* buffering, and every primitive read updates the CRC over the
//! bytes being consumed *including bytes that are merely skipped* — the CRC
//! covers the byte stream, not what the caller chooses to materialize.
//! Once a primitive fails, every later primitive on the same reader/writer
//! is a no-op that returns the same cached error, matching the sticky-flag
//! discipline of the reference implementation.

use std::io::{Read, Write};

use crate::crc::Crc32;
use crate::error::TqdbError;

/// Maximum length, in bytes, of a length-prefixed string field.
pub const MAX_STRING_LEN: usize = 4096;

/// Buffered writer that threads every byte through a running CRC.
pub struct FramedWriter<'a> {
    inner: &'a mut dyn Write,
    crc: Crc32,
    error: Option<ErrorTag>,
}

/// A cheaply cloneable tag for the sticky error, since `TqdbError` itself
/// doesn't implement `Clone`.
#[derive(Clone, Copy, Debug)]
enum ErrorTag {
    Io,
}

impl ErrorTag {
    fn into_error(self) -> TqdbError {
        match self {
            ErrorTag::Io => TqdbError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "framed I/O sticky error",
            )),
        }
    }
}

impl<'a> FramedWriter<'a> {
    pub fn new(inner: &'a mut dyn Write) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
            error: None,
        }
    }

    fn fail(&mut self, e: std::io::Error) -> TqdbError {
        self.error = Some(ErrorTag::Io);
        TqdbError::Io(e)
    }

    /// Write raw bytes, feeding them into the running CRC first.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TqdbError> {
        if let Some(tag) = self.error {
            return Err(tag.into_error());
        }
        self.crc.update(bytes);
        self.inner.write_all(bytes).map_err(|e| self.fail(e))
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), TqdbError> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<(), TqdbError> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), TqdbError> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<(), TqdbError> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<(), TqdbError> {
        self.write_raw(&v.to_le_bytes())
    }

    /// Write a length-prefixed string, capped at `0xFFFF` bytes.
    pub fn write_str(&mut self, s: &str) -> Result<(), TqdbError> {
        let bytes = s.as_bytes();
        let len = bytes.len().min(0xFFFF);
        self.write_u16(len as u16)?;
        if len > 0 {
            self.write_raw(&bytes[..len])?;
        }
        Ok(())
    }

    /// Flush any buffering performed by the underlying writer.
    pub fn flush(&mut self) -> Result<(), TqdbError> {
        if let Some(tag) = self.error {
            return Err(tag.into_error());
        }
        self.inner.flush().map_err(|e| self.fail(e))
    }

    /// One's-complement the accumulated CRC, consuming the writer.
    pub fn finalize_crc(self) -> u32 {
        self.crc.finalize()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Buffered reader that threads every consumed byte through a running CRC,
/// including bytes that are skipped rather than materialized.
pub struct FramedReader<'a> {
    inner: &'a mut dyn Read,
    crc: Crc32,
    error: Option<ErrorTag>,
}

impl<'a> FramedReader<'a> {
    pub fn new(inner: &'a mut dyn Read) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
            error: None,
        }
    }

    fn fail(&mut self, e: std::io::Error) -> TqdbError {
        self.error = Some(ErrorTag::Io);
        TqdbError::Io(e)
    }

    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<(), TqdbError> {
        if let Some(tag) = self.error {
            return Err(tag.into_error());
        }
        if let Err(e) = self.inner.read_exact(buf) {
            return Err(self.fail(e));
        }
        self.crc.update(buf);
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, TqdbError> {
        let mut buf = [0u8; 1];
        self.read_raw(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, TqdbError> {
        let mut buf = [0u8; 2];
        self.read_raw(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32, TqdbError> {
        let mut buf = [0u8; 4];
        self.read_raw(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_i32(&mut self) -> Result<i32, TqdbError> {
        let mut buf = [0u8; 4];
        self.read_raw(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_i64(&mut self) -> Result<i64, TqdbError> {
        let mut buf = [0u8; 8];
        self.read_raw(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Skip `len` bytes, still feeding them into the running CRC.
    pub fn skip(&mut self, len: usize) -> Result<(), TqdbError> {
        if let Some(tag) = self.error {
            return Err(tag.into_error());
        }
        let mut remaining = len;
        let mut scratch = [0u8; 256];
        while remaining > 0 {
            let chunk = remaining.min(scratch.len());
            if let Err(e) = self.inner.read_exact(&mut scratch[..chunk]) {
                return Err(self.fail(e));
            }
            self.crc.update(&scratch[..chunk]);
            remaining -= chunk;
        }
        Ok(())
    }

    /// Read a length-prefixed string, rejecting anything past
    /// [`MAX_STRING_LEN`] as corruption.
    pub fn read_str(&mut self) -> Result<String, TqdbError> {
        let len = self.read_u16()? as usize;
        if len > MAX_STRING_LEN {
            self.error = Some(ErrorTag::Io);
            return Err(TqdbError::Corrupt(format!(
                "string length {len} exceeds max {MAX_STRING_LEN}"
            )));
        }
        if len == 0 {
            return Ok(String::new());
        }
        let mut buf = vec![0u8; len];
        self.read_raw(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Skip a length-prefixed string without materializing it.
    pub fn skip_str(&mut self) -> Result<(), TqdbError> {
        let len = self.read_u16()? as usize;
        if len > MAX_STRING_LEN {
            self.error = Some(ErrorTag::Io);
            return Err(TqdbError::Corrupt(format!(
                "string length {len} exceeds max {MAX_STRING_LEN}"
            )));
        }
        if len > 0 {
            self.skip(len)?;
        }
        Ok(())
    }

    pub fn finalize_crc(self) -> u32 {
        self.crc.finalize()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}
