//! `.oem` firmware images (DigiMesh 900, XTend, XStream).
//!
//! All multi-byte values are big-endian. The image starts with a 12-byte
//! header followed by the version string:
//!
//! | Offset | Size | Field                                      |
//! |--------|------|--------------------------------------------|
//! | 0      | 2    | magic `0x93FD`                             |
//! | 2      | 2    | checksum adjustment                        |
//! | 4      | 4    | image length, header included              |
//! | 8      | 2    | header length (offset of the first block)  |
//! | 10     | 1    | module id (upper byte of `ATHV`)           |
//! | 11     | 1    | software compatibility id (`AT%C`)         |
//! | 12     | 4    | version string (`ATVR`, e.g. `"8042"`)     |
//!
//! After the header comes a chain of `[length:2][payload]` blocks ending with
//! a zero-length block. Blocks alternate between data sent to the bootloader
//! and the reply the bootloader is expected to echo back. Summing every
//! 16-bit word of the image gives zero.

use byteorder::{BigEndian, ByteOrder};

use crate::{
    error::{Error, Result},
    image::source::FirmwareSource,
};

/// First two bytes of every `.oem` image.
pub const MAGIC: u16 = 0x93FD;

/// Offset of the 32-bit image length.
pub const OFS_IMAGE_LEN: u32 = 4;
/// Offset of the 16-bit header length.
pub const OFS_HEADER_LEN: u32 = 8;
/// Offset of the module id byte.
pub const OFS_MODULE_ID: u32 = 10;
/// Offset of the software compatibility byte.
pub const OFS_SW_COMPAT: u32 = 11;
/// Offset of the version string.
pub const OFS_VERSION: u32 = 12;

/// Size of the fixed header, version string excluded.
pub const HEADER_SIZE: usize = 12;
/// Length of the version string.
pub const VERSION_LEN: usize = 4;

/// Smallest valid image.
pub const MIN_IMAGE_LEN: u32 = 32;
/// Largest valid image (XTend; XBee tops out at 64K, XStream at 32K).
pub const MAX_IMAGE_LEN: u32 = 128 * 1024;

/// Bootloader reply to `+` on every module family.
pub const BOOTLOADER_ACK: u8 = b'U';
/// Bootloader reply to `+` on XStream.
pub const BOOTLOADER_NAK: u8 = 0x11;

const UNLOCK_OFFSET: u16 = 0xDB8A;
const UNLOCK_MASK: u16 = 0x3FFF;

/// Parsed `.oem` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OemHeader {
    /// Magic number (`0x93FD` for a valid image).
    pub magic: u16,
    /// Checksum adjustment word.
    pub checksum: u16,
    /// Declared image length including the header.
    pub image_len: u32,
    /// Offset of the first block.
    pub header_len: u16,
    /// Must match the upper byte of the module's `ATHV` response.
    pub module_id: u8,
    /// Must match the module's `AT%C` response.
    pub software_id: u8,
    /// Firmware version as it appears in `ATVR`.
    pub version: [u8; VERSION_LEN],
}

impl OemHeader {
    /// Parse the header from the first 16 bytes of an image.
    ///
    /// Only the layout is checked; see [`verify`] for full validation.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + VERSION_LEN {
            return Err(Error::Validation(format!(
                "{} bytes is too short for an OEM header",
                bytes.len()
            )));
        }
        let mut version = [0u8; VERSION_LEN];
        version.copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + VERSION_LEN]);
        Ok(Self {
            magic: BigEndian::read_u16(&bytes[0..2]),
            checksum: BigEndian::read_u16(&bytes[2..4]),
            image_len: BigEndian::read_u32(&bytes[4..8]),
            header_len: BigEndian::read_u16(&bytes[8..10]),
            module_id: bytes[10],
            software_id: bytes[11],
            version,
        })
    }

    /// Read the header from the start of `source`.
    pub fn read_from<S: FirmwareSource + ?Sized>(source: &mut S) -> Result<Self> {
        let mut bytes = [0u8; HEADER_SIZE + VERSION_LEN];
        source.seek(0)?;
        source.read_full(&mut bytes)?;
        Self::parse(&bytes)
    }

    /// Version string as text.
    pub fn version_str(&self) -> String {
        String::from_utf8_lossy(&self.version).into_owned()
    }

    /// Check the fields that can be checked without the image body.
    pub fn check(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Validation(format!(
                "bad magic 0x{:04X} (expected 0x{MAGIC:04X})",
                self.magic
            )));
        }
        if !(MIN_IMAGE_LEN..=MAX_IMAGE_LEN).contains(&self.image_len) || self.image_len & 1 != 0 {
            return Err(Error::Validation(format!(
                "image length {} must be even and within {MIN_IMAGE_LEN}..={MAX_IMAGE_LEN}",
                self.image_len
            )));
        }
        Ok(())
    }
}

/// Sum of the big-endian 16-bit words in `bytes` (mod 2^16). A trailing odd
/// byte is ignored.
#[must_use]
pub fn word_sum(bytes: &[u8]) -> u16 {
    bytes
        .chunks_exact(2)
        .fold(0u16, |sum, w| sum.wrapping_add(BigEndian::read_u16(w)))
}

/// Validate a whole image: magic, length and checksum.
///
/// `scratch` is used to stream the body; any non-empty buffer works. No
/// transport is involved.
pub fn verify<S: FirmwareSource + ?Sized>(source: &mut S, scratch: &mut [u8]) -> Result<OemHeader> {
    let header = OemHeader::read_from(source)?;
    header.check()?;

    let chunk = scratch.len() & !1;
    if chunk == 0 {
        return Err(Error::InvalidState(
            "scratch buffer too small to verify image".into(),
        ));
    }

    source.seek(0)?;
    let mut remaining = header.image_len as usize;
    let mut sum = 0u16;
    while remaining > 0 {
        let take = remaining.min(chunk);
        source.read_full(&mut scratch[..take])?;
        sum = sum.wrapping_add(word_sum(&scratch[..take]));
        remaining -= take;
    }

    if sum != 0 {
        return Err(Error::Validation(format!(
            "checksum failed (word sum 0x{sum:04X})"
        )));
    }
    Ok(header)
}

/// Parse up to four upper-case hex digits from the start of an AT response.
///
/// Parsing stops at the first byte below `'0'` (e.g. the end of the line).
#[must_use]
pub fn hex2word(text: &[u8]) -> u16 {
    text.iter()
        .take(4)
        .take_while(|&&ch| ch >= b'0')
        .fold(0u16, |value, &ch| {
            let ch = ch.to_ascii_uppercase();
            let digit = if ch >= b'A' { ch - (b'A' - 10) } else { ch - b'0' };
            (value << 4) | u16::from(digit)
        })
}

/// Programming-mode unlock code derived from the low word of `ATSL`.
#[must_use]
pub fn unlock_code(serial_low: u16) -> u16 {
    serial_low.wrapping_add(UNLOCK_OFFSET) & UNLOCK_MASK
}

/// `%Pxxxx` command (without the `AT` prefix) that unlocks programming mode.
#[must_use]
pub fn unlock_command(serial_low: u16) -> [u8; 6] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let code = unlock_code(serial_low);
    let mut cmd = *b"%P0000";
    for (i, slot) in cmd[2..]
        .iter_mut()
        .enumerate()
    {
        let shift = 12 - 4 * i;
        *slot = HEX[usize::from((code >> shift) & 0xF)];
    }
    cmd
}

/// Shape of an image's block chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BlockChain {
    /// Number of non-empty blocks (outbound and echo blocks together).
    pub blocks: usize,
    /// Payload bytes across all blocks, length prefixes excluded.
    pub payload_bytes: u64,
}

impl BlockChain {
    /// Number of outbound blocks the bootloader will receive.
    pub fn transfers(&self) -> usize {
        self.blocks / 2
    }
}

/// Walk the block chain of a checked image.
///
/// Fails if a block runs past the declared image length or the chain has no
/// terminating zero-length block.
pub fn count_blocks<S: FirmwareSource + ?Sized>(
    source: &mut S,
    header: &OemHeader,
) -> Result<BlockChain> {
    let mut chain = BlockChain::default();
    let mut offset = u32::from(header.header_len);
    loop {
        if offset + 2 > header.image_len {
            return Err(Error::Validation(format!(
                "block chain runs off the end of the image at offset {offset}"
            )));
        }
        source.seek(offset)?;
        let len = source.read_u16_be()?;
        if len == 0 {
            return Ok(chain);
        }
        let next = offset + 2 + u32::from(len);
        if next > header.image_len {
            return Err(Error::Validation(format!(
                "{len}-byte block at offset {offset} overruns the {}-byte image",
                header.image_len
            )));
        }
        chain.blocks += 1;
        chain.payload_bytes += u64::from(len);
        offset = next;
    }
}
