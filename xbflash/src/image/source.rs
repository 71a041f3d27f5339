//! Seek+read access to a firmware image.
//!
//! The install engines only ever see a [`FirmwareSource`]. Anything that is
//! `Read + Seek` (a [`std::fs::File`], a [`std::io::Cursor`]) is a source
//! already; [`BufferSource`] holds an image that is entirely in memory.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Random-access reader over a firmware image.
pub trait FirmwareSource {
    /// Position the cursor at `offset` bytes from the start of the image.
    fn seek(&mut self, offset: u32) -> Result<()>;

    /// Read up to `buf.len()` bytes at the cursor. `Ok(0)` marks the end of
    /// the image.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Fill `buf` completely; running out of image is an error.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => {
                    return Err(Error::Validation(format!(
                        "image ends {} bytes short of a {}-byte field",
                        buf.len() - filled,
                        buf.len()
                    )));
                },
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Read one byte.
    fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_full(&mut b)?;
        Ok(b[0])
    }

    /// Read a big-endian 16-bit value.
    fn read_u16_be(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_full(&mut b)?;
        Ok(BigEndian::read_u16(&b))
    }

    /// Read a big-endian 32-bit value.
    fn read_u32_be(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_full(&mut b)?;
        Ok(BigEndian::read_u32(&b))
    }
}

impl<T: Read + Seek> FirmwareSource for T {
    fn seek(&mut self, offset: u32) -> Result<()> {
        Seek::seek(self, SeekFrom::Start(u64::from(offset)))?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match Read::read(self, buf) {
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
                other => return Ok(other?),
            }
        }
    }
}

/// Firmware image held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct BufferSource {
    data: Vec<u8>,
    offset: usize,
}

impl BufferSource {
    /// Wrap an in-memory image.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
        }
    }

    /// Load a whole file into memory.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data
            .len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.data
            .is_empty()
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.offset
    }

    /// The whole image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl FirmwareSource for BufferSource {
    fn seek(&mut self, offset: u32) -> Result<()> {
        let offset = offset as usize;
        if offset > self.data.len() {
            return Err(Error::InvalidState(format!(
                "seek to {offset} past end of {}-byte image",
                self.data
                    .len()
            )));
        }
        self.offset = offset;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.data[self.offset..];
        let n = remaining
            .len()
            .min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;
        Ok(n)
    }
}
