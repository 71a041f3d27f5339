//! Firmware image handling.
//!
//! - [`source`]: seek+read access to an image ([`FirmwareSource`]).
//! - [`oem`]: `.oem` header validation and block-chain helpers.
//!
//! `.ebl` images are streamed to the bootloader as-is; only their header tag
//! and chip signature are looked at, to tell them apart from `.oem` images.

pub mod oem;
pub mod source;

use std::path::Path;

use byteorder::{BigEndian, ByteOrder};

pub use source::{BufferSource, FirmwareSource};

/// Header tag at offset 0 of an `.ebl` image.
const EBL_TAG_HEADER: u16 = 0x0000;

/// Chip signatures found at offset 6 of an `.ebl` header.
const EBL_SIGNATURES: [(u16, &str); 3] = [
    (0xE250, "EM250"),
    (0xE260, "EM260"),
    (0xE350, "EM35x"),
];

/// Firmware image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ImageKind {
    /// Ember bootloader image (XBee ZB / ZNet), sent with XMODEM.
    Ebl,
    /// Block-echo image (DigiMesh 900, XTend, XStream).
    Oem,
}

impl ImageKind {
    /// Guess the format from the file extension, falling back to the content.
    pub fn detect(path: Option<&Path>, bytes: &[u8]) -> Option<Self> {
        let by_ext = path
            .and_then(Path::extension)
            .and_then(|ext| ext.to_str())
            .and_then(|ext| match ext.to_ascii_lowercase().as_str() {
                "ebl" => Some(Self::Ebl),
                "oem" => Some(Self::Oem),
                _ => None,
            });
        by_ext.or_else(|| Self::from_magic(bytes))
    }

    /// Identify the format from the first bytes of the image.
    pub fn from_magic(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 2 && BigEndian::read_u16(&bytes[0..2]) == oem::MAGIC {
            return Some(Self::Oem);
        }
        ebl_chip(bytes).map(|_| Self::Ebl)
    }

    /// Short name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ebl => "ebl",
            Self::Oem => "oem",
        }
    }
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Chip family named by an `.ebl` header, if `bytes` starts with one.
pub fn ebl_chip(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 8 || BigEndian::read_u16(&bytes[0..2]) != EBL_TAG_HEADER {
        return None;
    }
    let signature = BigEndian::read_u16(&bytes[6..8]);
    EBL_SIGNATURES
        .iter()
        .find(|(sig, _)| *sig == signature)
        .map(|(_, name)| *name)
}
