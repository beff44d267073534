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

//! Escaping codec: renders an arbitrary byte stream safe for a link that
//! may interpret XON/XOFF/DLE and that reserves one escape byte for its own
//! framing. Escaped bytes travel as the introducer followed by the byte
//! XORed with 0x40.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{DLE, FrameEnd, XOFF, XON, ZDLE, ZRUB0, ZRUB1};
use crate::serial::SerialPort;

/// Consecutive cancel bytes that end the session.
const CANCEL_BURST: usize = 5;

/// One decoded unit from the escaped stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unescaped {
    /// A literal payload byte
    Byte(u8),
    /// A subpacket terminator
    End(FrameEnd),
}

/// Stateful encoder. The previous output byte is tracked because a carriage
/// return following an at-sign must be hidden from Telenet-style relays.
#[derive(Debug, Clone)]
pub struct Escaper {
    /// Escape every control byte, not just the link-hazardous ones.
    pub escape_all: bool,
    last_sent: u8,
}

impl Escaper {
    pub fn new(escape_all: bool) -> Escaper {
        Escaper {
            escape_all,
            last_sent: 0,
        }
    }

    /// Append `byte` to `out` in link-safe form.
    pub fn push(&mut self, out: &mut Vec<u8>, byte: u8) {
        match byte {
            ZDLE => self.escaped(out, byte),
            0x0D | 0x8D => {
                if self.escape_all || self.last_sent & 0x7F == b'@' {
                    self.escaped(out, byte)
                } else {
                    self.plain(out, byte)
                }
            }
            DLE | XON | XOFF | 0x90 | 0x91 | 0x93 => self.escaped(out, byte),
            _ if self.escape_all && byte & 0x60 == 0 => self.escaped(out, byte),
            _ => self.plain(out, byte),
        }
    }

    /// Append every byte of `bytes` in link-safe form.
    pub fn push_all(&mut self, out: &mut Vec<u8>, bytes: &[u8]) {
        for &b in bytes {
            self.push(out, b);
        }
    }

    fn plain(&mut self, out: &mut Vec<u8>, byte: u8) {
        self.last_sent = byte;
        out.push(byte);
    }

    fn escaped(&mut self, out: &mut Vec<u8>, byte: u8) {
        let b = byte ^ 0x40;
        self.last_sent = b;
        out.push(ZDLE);
        out.push(b);
    }
}

/// Read one unit from the escaped stream.
///
/// Flow-control bytes the remote line injected on its own are discarded; in
/// escape-all mode any unescaped control byte is treated the same way. A run
/// of [`CANCEL_BURST`] cancel bytes surfaces as [`Error::Cancelled`] and a
/// two-byte sequence outside the escape table as [`Error::BadEscape`].
pub fn read_escaped(
    port: &mut dyn SerialPort,
    escape_all: bool,
    timeout: Duration,
) -> Result<Unescaped> {
    loop {
        let b = port.read_byte(timeout).map_err(Error::from_read)?;
        if b & 0x60 != 0 {
            return Ok(Unescaped::Byte(b));
        }
        match b {
            ZDLE => break,
            DLE | XON | XOFF | 0x90 | 0x91 | 0x93 => continue,
            _ if escape_all => continue,
            _ => return Ok(Unescaped::Byte(b)),
        }
    }

    // Escape introducer seen; it is itself the first cancel byte.
    let mut cancels = 1;
    loop {
        let b = port.read_byte(timeout).map_err(Error::from_read)?;
        if b == ZDLE {
            cancels += 1;
            if cancels >= CANCEL_BURST {
                return Err(Error::Cancelled);
            }
            continue;
        }
        match b {
            DLE | XON | XOFF | 0x90 | 0x91 | 0x93 => continue,
            ZRUB0 => return Ok(Unescaped::Byte(0x7F)),
            ZRUB1 => return Ok(Unescaped::Byte(0xFF)),
            _ => {
                if let Some(end) = FrameEnd::from_byte(b) {
                    return Ok(Unescaped::End(end));
                }
                if b & 0x60 == 0x40 {
                    return Ok(Unescaped::Byte(b ^ 0x40));
                }
                return Err(Error::BadEscape(b));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;
    use rand::Rng;

    const TIMEOUT: Duration = Duration::from_millis(10);

    fn escape(bytes: &[u8], escape_all: bool) -> Vec<u8> {
        let mut esc = Escaper::new(escape_all);
        let mut out = Vec::new();
        esc.push_all(&mut out, bytes);
        out
    }

    /// Decode an escaped stream back to literal bytes.
    fn unescape(wire: &[u8], escape_all: bool) -> Vec<u8> {
        let responses = wire.iter().map(|&b| Some(b)).collect();
        let mut port = MockSerialPort::new(responses, Vec::new());
        let mut out = Vec::new();
        loop {
            match read_escaped(&mut port, escape_all, TIMEOUT) {
                Ok(Unescaped::Byte(b)) => out.push(b),
                Ok(Unescaped::End(_)) => panic!("unexpected frame end"),
                Err(Error::Timeout) => break,
                Err(e) => panic!("decode failed: {e}"),
            }
        }
        out
    }

    #[test]
    fn test_printable_bytes_pass_verbatim() {
        assert_eq!(escape(b"hello, WORLD 123", false), b"hello, WORLD 123");
    }

    #[test]
    fn test_hazardous_bytes_are_escaped() {
        for b in [ZDLE, XON, XOFF, DLE, 0x90, 0x91, 0x93] {
            assert_eq!(escape(&[b], false), vec![ZDLE, b ^ 0x40]);
        }
    }

    #[test]
    fn test_carriage_return_after_at_sign() {
        // Plain CR passes, but '@' followed by CR must be hidden.
        assert_eq!(escape(b"a\rb", false), b"a\rb");
        assert_eq!(escape(b"@\r", false), vec![b'@', ZDLE, 0x0D ^ 0x40]);
        assert_eq!(escape(&[b'@', 0x8D], false), vec![b'@', ZDLE, 0x8D ^ 0x40]);
    }

    #[test]
    fn test_escape_all_mode_covers_every_control() {
        for b in 0u8..=0xFF {
            let out = escape(&[b], true);
            if b & 0x60 == 0 {
                assert_eq!(out, vec![ZDLE, b ^ 0x40], "byte {b:#04x}");
            } else {
                assert_eq!(out, vec![b], "byte {b:#04x}");
            }
        }
    }

    #[test]
    fn test_round_trip_random_payloads() {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let len = rng.random_range(0..512);
            let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            assert_eq!(unescape(&escape(&data, false), false), data);
            assert_eq!(unescape(&escape(&data, true), true), data);
        }
    }

    #[test]
    fn test_escaping_is_idempotent_through_decode() {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let len = rng.random_range(0..256);
            let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            let once = escape(&data, false);
            let again = escape(&unescape(&once, false), false);
            assert_eq!(again, once);
        }
    }

    #[test]
    fn test_decoder_discards_injected_flow_control() {
        // XON/XOFF the line inserted on its own never reach the payload.
        let wire = [b'a', XON, b'b', XOFF, 0x91, b'c'];
        assert_eq!(unescape(&wire, false), b"abc");
    }

    #[test]
    fn test_rubout_escapes() {
        let wire = [ZDLE, ZRUB0, ZDLE, ZRUB1];
        assert_eq!(unescape(&wire, false), vec![0x7F, 0xFF]);
    }

    #[test]
    fn test_frame_end_markers() {
        let responses = vec![Some(ZDLE), Some(b'k')];
        let mut port = MockSerialPort::new(responses, Vec::new());
        assert_eq!(
            read_escaped(&mut port, false, TIMEOUT).unwrap(),
            Unescaped::End(FrameEnd::EndOfFrameAckRequested)
        );
    }

    #[test]
    fn test_cancel_burst() {
        let responses = vec![Some(ZDLE); 5];
        let mut port = MockSerialPort::new(responses, Vec::new());
        assert!(matches!(
            read_escaped(&mut port, false, TIMEOUT),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_bad_escape_sequence() {
        let responses = vec![Some(ZDLE), Some(b'0')];
        let mut port = MockSerialPort::new(responses, Vec::new());
        assert!(matches!(
            read_escaped(&mut port, false, TIMEOUT),
            Err(Error::BadEscape(b'0'))
        ));
    }
}
