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

//! ZMODEM wire constants: control bytes, frame types, frame-end markers,
//! header encodings, and negotiation flag bits.

/// Pad byte opening every frame leader
pub const ZPAD: u8 = b'*';

/// Link escape byte; doubles as the cancel byte when repeated
pub const ZDLE: u8 = 0x18;

/// Software flow-control resume
pub const XON: u8 = 0x11;

/// Software flow-control stop
pub const XOFF: u8 = 0x13;

/// Data-link escape, hidden from the transport alongside XON/XOFF
pub const DLE: u8 = 0x10;

/// Carriage return, escaped only when the Telenet hazard applies
pub const CR: u8 = 0x0D;

/// Line feed, terminates hex frames together with CR
pub const LF: u8 = 0x0A;

/// Escaped-sequence argument standing for a literal 0x7F
pub const ZRUB0: u8 = b'l';

/// Escaped-sequence argument standing for a literal 0xFF
pub const ZRUB1: u8 = b'm';

/// SendInit flag asking the receiver to escape all control bytes
pub const TX_ESCAPE_CONTROLS: u8 = 0x40;

/// FileHeader conversion flag: transfer verbatim binary
pub const CONVERT_BINARY: u8 = 1;

/// FileHeader management flag: append to an existing file
pub const MANAGE_APPEND: u8 = 3;

/// FileHeader management flag: replace an existing file
pub const MANAGE_CLOBBER: u8 = 4;

/// FileHeader management flag: transfer only if newer than the remote copy
pub const MANAGE_NEWER: u8 = 5;

/// FileHeader management flag: never replace an existing file
pub const MANAGE_PROTECT: u8 = 7;

/// FileHeader management bit: skip files the receiver has no copy of
pub const MANAGE_SKIP_IF_ABSENT: u8 = 0x80;

// ============================================================================
// Frame types
// ============================================================================

/// Every header carries one of these, tagged by its wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Sender asks the receiver to announce itself
    RequestInit = 0,
    /// Receiver capability report; also acknowledges EndOfFile
    ReceiveInit = 1,
    /// Sender options and attention string follow as data
    SendInit = 2,
    /// Positive acknowledgment carrying the acknowledged offset
    Ack = 3,
    /// File metadata follows as data
    FileHeader = 4,
    /// Receiver declines the offered file
    Skip = 5,
    /// Negative acknowledgment; resend the last frame
    Nak = 6,
    /// Terminate the current transfer
    Abort = 7,
    /// End of session
    Finish = 8,
    /// Receiver wants data restarted at the carried offset
    ResumeAt = 9,
    /// Data subpackets follow from the carried offset
    DataFollows = 10,
    /// End of file at the carried offset
    EndOfFile = 11,
    /// Fatal read/write error reported by the peer
    FatalError = 12,
    /// Request for (or reply carrying) a whole-file CRC
    CrcRequest = 13,
    /// Peer wants the carried token echoed back in an Ack
    Challenge = 14,
    /// Command completed; carries the exit status
    Complete = 15,
    /// Peer cancelled the session
    Cancel = 16,
    /// Query for free storage space
    FreeSpaceQuery = 17,
    /// Command string follows as data
    Command = 18,
    /// Text for the peer's diagnostic stream follows as data
    StdErr = 19,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Option<FrameType> {
        match byte {
            0 => Some(FrameType::RequestInit),
            1 => Some(FrameType::ReceiveInit),
            2 => Some(FrameType::SendInit),
            3 => Some(FrameType::Ack),
            4 => Some(FrameType::FileHeader),
            5 => Some(FrameType::Skip),
            6 => Some(FrameType::Nak),
            7 => Some(FrameType::Abort),
            8 => Some(FrameType::Finish),
            9 => Some(FrameType::ResumeAt),
            10 => Some(FrameType::DataFollows),
            11 => Some(FrameType::EndOfFile),
            12 => Some(FrameType::FatalError),
            13 => Some(FrameType::CrcRequest),
            14 => Some(FrameType::Challenge),
            15 => Some(FrameType::Complete),
            16 => Some(FrameType::Cancel),
            17 => Some(FrameType::FreeSpaceQuery),
            18 => Some(FrameType::Command),
            19 => Some(FrameType::StdErr),
            _ => None,
        }
    }
}

// ============================================================================
// Data subpacket terminators
// ============================================================================

/// Marker closing every data subpacket, sent escaped after the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameEnd {
    /// Frame ends; a header follows
    EndOfFrame = b'h',
    /// Frame continues nonstop
    ContinueNoAck = b'i',
    /// Frame continues; an Ack is expected
    ContinueAckRequested = b'j',
    /// Frame ends; an Ack is expected
    EndOfFrameAckRequested = b'k',
}

impl FrameEnd {
    pub fn from_byte(byte: u8) -> Option<FrameEnd> {
        match byte {
            b'h' => Some(FrameEnd::EndOfFrame),
            b'i' => Some(FrameEnd::ContinueNoAck),
            b'j' => Some(FrameEnd::ContinueAckRequested),
            b'k' => Some(FrameEnd::EndOfFrameAckRequested),
            _ => None,
        }
    }
}

// ============================================================================
// Header encodings
// ============================================================================

/// The three wire renderings of a header, self-described by a tag byte
/// after the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// ASCII hex digits, 16-bit CRC; survives any terminal translation
    Hex,
    /// Escaped binary, 16-bit CRC
    Binary16,
    /// Escaped binary, 32-bit CRC
    Binary32,
}

impl Encoding {
    pub fn tag(self) -> u8 {
        match self {
            Encoding::Hex => b'B',
            Encoding::Binary16 => b'A',
            Encoding::Binary32 => b'C',
        }
    }

    pub fn from_tag(byte: u8) -> Option<Encoding> {
        match byte {
            b'B' => Some(Encoding::Hex),
            b'A' => Some(Encoding::Binary16),
            b'C' => Some(Encoding::Binary32),
            _ => None,
        }
    }

    /// Whether frames in this encoding carry a 32-bit check.
    pub fn wide_crc(self) -> bool {
        matches!(self, Encoding::Binary32)
    }
}

// ============================================================================
// Receiver capabilities
// ============================================================================

bitflags::bitflags! {
    /// Capability bits the receiver reports in its ReceiveInit flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RxCaps: u8 {
        /// Link is full duplex; the sender may stream ahead
        const FULL_DUPLEX = 0x01;
        /// Receiver can overlap disk and line I/O
        const OVERLAP_IO = 0x02;
        /// Receiver can send a break signal
        const SEND_BREAK = 0x04;
        /// Receiver can decrypt
        const DECRYPT = 0x08;
        /// Receiver can uncompress
        const LZW = 0x10;
        /// Receiver accepts 32-bit frame checks
        const CRC32 = 0x20;
        /// Receiver needs all control bytes escaped
        const ESCAPE_CONTROLS = 0x40;
        /// Receiver needs the high bit escaped
        const ESCAPE_8BIT = 0x80;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_round_trip() {
        for byte in 0u8..20 {
            let ft = FrameType::from_byte(byte).expect("known frame type");
            assert_eq!(ft as u8, byte);
        }
        assert_eq!(FrameType::from_byte(20), None);
        assert_eq!(FrameType::from_byte(0xFF), None);
    }

    #[test]
    fn test_frame_end_bytes() {
        assert_eq!(FrameEnd::from_byte(b'h'), Some(FrameEnd::EndOfFrame));
        assert_eq!(FrameEnd::from_byte(b'k'), Some(FrameEnd::EndOfFrameAckRequested));
        assert_eq!(FrameEnd::from_byte(b'a'), None);
        assert_eq!(FrameEnd::ContinueNoAck as u8, b'i');
        assert_eq!(FrameEnd::ContinueAckRequested as u8, b'j');
    }

    #[test]
    fn test_encoding_tags() {
        for enc in [Encoding::Hex, Encoding::Binary16, Encoding::Binary32] {
            assert_eq!(Encoding::from_tag(enc.tag()), Some(enc));
        }
        assert_eq!(Encoding::from_tag(b'D'), None);
        assert!(Encoding::Binary32.wide_crc());
        assert!(!Encoding::Binary16.wide_crc());
    }
}
