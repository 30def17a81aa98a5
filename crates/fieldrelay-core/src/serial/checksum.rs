//! Frame checksum
//!
//! Device firmware checksums every line with a CRC-16/CCITT variant
//! (reflected polynomial 0x8408, initial value 0xFFFF, no final XOR; this is
//! the variant also catalogued as CRC-16/MCRF4XX). The byte-at-a-time update
//! below is the form the firmware uses, so it is kept verbatim rather than
//! table driven.

/// Initial CRC register value
const CRC_INIT: u16 = 0xFFFF;

/// Compute the checksum of an ASCII message.
pub fn compute(message: &str) -> u16 {
    message.bytes().fold(CRC_INIT, update)
}

/// Feed one byte into the CRC register.
pub fn update(crc: u16, byte: u8) -> u16 {
    let mut d = u16::from(byte) ^ (crc & 0xFF);
    d ^= (d << 4) & 0xFF;
    (((d << 8) & 0xFFFF) | ((crc >> 8) & 0xFF)) ^ (d >> 4) ^ (d << 3)
}
