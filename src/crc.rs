// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Table-driven CRC-16/CCITT and CRC-32 over a byte stream.
//!
//! The 16-bit accumulator is the XMODEM-CRC formulation: bytes shift in at
//! the bottom, so the sender flushes two zero bytes before transmitting the
//! check, and a receiver folding the message plus the transmitted check ends
//! at zero. The 32-bit accumulator seeds with all ones and is complemented
//! on the wire; a receiver folding message plus check ends at
//! [`CRC32_RESIDUE`].

/// All-ones seed for the 32-bit accumulator.
pub const CRC32_SEED: u32 = 0xFFFF_FFFF;

/// Value a 32-bit accumulator holds after folding a message followed by its
/// transmitted (complemented, little-endian) check.
pub const CRC32_RESIDUE: u32 = 0xDEBB_20E3;

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = build_crc16_table();
static CRC32_TABLE: [u32; 256] = build_crc32_table();

/// Feed one byte into a CCITT CRC-16 accumulator (start from 0).
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    CRC16_TABLE[(crc >> 8) as usize] ^ (crc << 8) ^ byte as u16
}

/// Flush the accumulator with two zero bytes, yielding the wire check.
pub fn crc16_finish(crc: u16) -> u16 {
    crc16_update(crc16_update(crc, 0), 0)
}

/// Feed one byte into a CRC-32 accumulator (start from [`CRC32_SEED`]).
pub fn crc32_update(crc: u32, byte: u8) -> u32 {
    CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8)
}

/// CRC-32 of a whole buffer: all-ones seed, complemented result.
pub fn crc32_of(bytes: &[u8]) -> u32 {
    let mut crc = CRC32_SEED;
    for &b in bytes {
        crc = crc32_update(crc, b);
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn crc16_of(bytes: &[u8]) -> u16 {
        let crc = bytes.iter().fold(0u16, |acc, &b| crc16_update(acc, b));
        crc16_finish(crc)
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16_of(b"123456789"), 0x31C3);
        assert_eq!(crc16_of(b""), 0);
    }

    #[test]
    fn test_crc16_receiver_residue() {
        // Folding the message and then its transmitted check lands on zero.
        let msg = b"the quick brown fox";
        let wire = crc16_of(msg);
        let mut crc = msg.iter().fold(0u16, |acc, &b| crc16_update(acc, b));
        crc = crc16_update(crc, (wire >> 8) as u8);
        crc = crc16_update(crc, wire as u8);
        assert_eq!(crc, 0);
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32_of(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_crc32_receiver_residue() {
        let msg = b"lazy dog";
        let wire = crc32_of(msg);
        let mut crc = msg.iter().fold(CRC32_SEED, |acc, &b| crc32_update(acc, b));
        for b in wire.to_le_bytes() {
            crc = crc32_update(crc, b);
        }
        assert_eq!(crc, CRC32_RESIDUE);
    }

    #[test]
    fn test_crc32_matches_crc32fast() {
        let mut rng = rand::rng();
        for _ in 0..32 {
            let len = rng.random_range(0..2048);
            let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            assert_eq!(crc32_of(&data), crc32fast::hash(&data));
        }
    }

    #[test]
    fn test_crc16_detects_single_bit_flips() {
        let mut rng = rand::rng();
        let msg: Vec<u8> = (0..64).map(|_| rng.random()).collect();
        let wire = crc16_of(&msg);
        for _ in 0..100 {
            let mut corrupt = msg.clone();
            let idx = rng.random_range(0..corrupt.len());
            corrupt[idx] ^= 1 << rng.random_range(0..8);
            assert_ne!(crc16_of(&corrupt), wire);
        }
    }
}
