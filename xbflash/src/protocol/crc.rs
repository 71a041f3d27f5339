//! Checksums used by the XMODEM sender.

/// CRC-16/XMODEM polynomial.
const POLY: u16 = 0x1021;

/// Compute CRC-16/XMODEM (poly 0x1021, init 0x0000, no reflection, no xorout).
#[must_use]
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    crc16_xmodem_update(0, data)
}

/// Continue a CRC-16/XMODEM calculation from a previous value.
#[must_use]
pub fn crc16_xmodem_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Classic XMODEM checksum: 8-bit sum of all data bytes.
#[must_use]
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}
