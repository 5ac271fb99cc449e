//! CRC-16 used to protect every packet on the wire.
//!
//! This is the nibble-at-a-time variant with the reflected 0xA001 table
//! (CRC-16/ARC: initial value 0, no final xor). The table is part of the
//! wire contract, so it is kept exactly as peers compute it.

const CRC16_TABLE: [u16; 16] = [
    0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401,
    0xA001, 0x6C00, 0x7800, 0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
];

/// Fold `data` into a running CRC and return the new value.
///
/// Start a fresh computation with `crc = 0`. Feeding two slices one after
/// the other gives the same result as feeding their concatenation.
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        let b = u16::from(byte);
        crc = ((crc >> 4) & 0x0FFF) ^ CRC16_TABLE[((crc ^ b) & 0xF) as usize];
        crc = ((crc >> 4) & 0x0FFF) ^ CRC16_TABLE[((crc ^ (b >> 4)) & 0xF) as usize];
    }
    crc
}
