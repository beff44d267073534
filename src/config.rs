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

//! Operator-tunable transfer knobs and the negotiated per-session state.

use crate::escape::Escaper;
use crate::protocol::{
    Encoding, MANAGE_APPEND, MANAGE_CLOBBER, MANAGE_NEWER, MANAGE_PROTECT, MANAGE_SKIP_IF_ABSENT,
    RxCaps,
};

/// Block length is never backed off below this.
pub const MIN_BLOCK_LEN: usize = 32;

/// Per-file disposition requested of the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilePolicy {
    /// Let the receiver apply its own default
    #[default]
    ReceiverDefault,
    /// Replace an existing file unconditionally
    Clobber,
    /// Append to an existing file
    Append,
    /// Never replace an existing file
    Protect,
    /// Transfer only files newer than the receiver's copy
    NewerOnly,
}

impl FilePolicy {
    pub fn flag_byte(self, skip_if_absent: bool) -> u8 {
        let base = match self {
            FilePolicy::ReceiverDefault => 0,
            FilePolicy::Clobber => MANAGE_CLOBBER,
            FilePolicy::Append => MANAGE_APPEND,
            FilePolicy::Protect => MANAGE_PROTECT,
            FilePolicy::NewerOnly => MANAGE_NEWER,
        };
        if skip_if_absent {
            base | MANAGE_SKIP_IF_ABSENT
        } else {
            base
        }
    }
}

/// Operator knobs consumed by the frame codec and the state machine.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Cap the data block length below the speed-derived default
    pub block_len: Option<usize>,
    /// Max unacknowledged bytes in flight; 0 trusts the link end to end
    pub window: usize,
    /// Bytes between mid-stream ack requests when a window is active
    pub ack_spacing: usize,
    /// Offer 32-bit frame checks when the receiver supports them
    pub want_crc32: bool,
    /// Escape all control bytes, and ask the receiver to do the same
    pub escape_controls: bool,
    pub policy: FilePolicy,
    /// Ask the receiver to skip files it has no copy of
    pub skip_if_absent: bool,
    /// Send the full path instead of the bare file name
    pub full_path: bool,
    /// Attention string the receiver replays to interrupt us mid-stream
    pub attn: Vec<u8>,
    /// Line speed, used for the garbage budget and the block-length ladder
    pub baud: u32,
    /// Same-offset resyncs tolerated before the block length is halved
    pub resync_backoff: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            block_len: None,
            window: 0,
            ack_spacing: 1024,
            want_crc32: true,
            escape_controls: false,
            policy: FilePolicy::default(),
            skip_if_absent: false,
            full_path: false,
            attn: Vec::new(),
            baud: 9600,
            resync_backoff: 4,
        }
    }
}

/// Block length for the line speed, clamped to the receiver's buffer and any
/// operator cap.
pub fn block_len_for(config: &TransferConfig, rx_buf_len: usize) -> usize {
    let mut len = match config.baud {
        b if b > 2400 => 1024,
        b if b > 1200 => 512,
        b if b > 300 => 256,
        _ => 128,
    };
    if rx_buf_len > 0 && len > rx_buf_len {
        len = rx_buf_len;
    }
    if let Some(cap) = config.block_len {
        if len > cap {
            len = cap;
        }
    }
    len.max(MIN_BLOCK_LEN)
}

// ============================================================================
// Session state
// ============================================================================

/// Negotiated parameters and live transfer accounting. One value is owned by
/// the state machine and threaded through every frame-codec call; the codec
/// layers themselves hold no state.
#[derive(Debug)]
pub struct SessionState {
    /// Wire encoding for binary frames once negotiated
    pub encoding: Encoding,
    /// Output escaping state
    pub escaper: Escaper,
    /// Receiver capability report
    pub rx_caps: RxCaps,
    /// Receiver buffer length; 0 means unlimited
    pub rx_buf_len: usize,
    /// Active data block length (backed off under repeated resyncs)
    pub block_len: usize,
    /// Max unacknowledged bytes in flight; 0 means unlimited
    pub window: usize,
    /// Bytes between mid-stream ack requests
    pub ack_spacing: usize,
    /// Next file offset to transmit
    pub tx_offset: u32,
    /// Highest offset the receiver has acknowledged
    pub acked_offset: u32,
    /// Offset of the most recent receiver resync
    pub resync_offset: u32,
    /// Consecutive resyncs seen at that same offset
    pub resync_count: u32,
    /// Garbage bytes tolerated per header hunt
    pub garbage_budget: usize,
    /// Garbage bytes discarded by the most recent header hunt
    pub garbage_seen: usize,
    resync_backoff: u32,
}

impl SessionState {
    pub fn new(config: &TransferConfig) -> SessionState {
        SessionState {
            encoding: Encoding::Hex,
            escaper: Escaper::new(config.escape_controls),
            rx_caps: RxCaps::empty(),
            rx_buf_len: 0,
            block_len: 128,
            window: config.window,
            ack_spacing: config.ack_spacing,
            tx_offset: 0,
            acked_offset: 0,
            resync_offset: 0,
            resync_count: 0,
            garbage_budget: config.window + config.baud as usize,
            garbage_seen: 0,
            resync_backoff: config.resync_backoff,
        }
    }

    /// Fold the receiver's capability report into the session.
    pub fn negotiate(&mut self, config: &TransferConfig, caps: RxCaps, rx_buf_len: usize) {
        self.rx_caps = caps;
        self.rx_buf_len = rx_buf_len;
        self.encoding = if config.want_crc32 && caps.contains(RxCaps::CRC32) {
            Encoding::Binary32
        } else {
            Encoding::Binary16
        };
        if caps.contains(RxCaps::ESCAPE_CONTROLS) {
            self.escaper.escape_all = true;
        }
        self.block_len = block_len_for(config, rx_buf_len);
    }

    /// Unacknowledged bytes currently in flight.
    pub fn in_flight(&self) -> u32 {
        self.tx_offset.wrapping_sub(self.acked_offset)
    }

    /// Reset transfer accounting at the receiver-requested start offset.
    pub fn begin_stream(&mut self, offset: u32) {
        self.tx_offset = offset;
        self.acked_offset = offset;
        self.resync_offset = offset;
        self.resync_count = 0;
        self.garbage_seen = 0;
    }

    /// Record a receiver resync at `offset`. Repeats at the same offset
    /// beyond the back-off threshold halve the block length, floored at
    /// [`MIN_BLOCK_LEN`].
    pub fn note_resync(&mut self, offset: u32) {
        if offset == self.resync_offset {
            self.resync_count += 1;
            if self.resync_count > self.resync_backoff {
                self.resync_count = 0;
                if self.block_len > MIN_BLOCK_LEN {
                    self.block_len = (self.block_len / 2).max(MIN_BLOCK_LEN);
                }
            }
        } else {
            self.resync_offset = offset;
            self.resync_count = 0;
        }
        self.tx_offset = offset;
        self.acked_offset = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len_ladder() {
        let mut config = TransferConfig::default();
        for (baud, want) in [(110, 128), (300, 128), (1200, 256), (2400, 512), (9600, 1024)] {
            config.baud = baud;
            assert_eq!(block_len_for(&config, 0), want, "baud {baud}");
        }
    }

    #[test]
    fn test_block_len_clamps() {
        let mut config = TransferConfig {
            baud: 9600,
            ..TransferConfig::default()
        };
        assert_eq!(block_len_for(&config, 512), 512);
        config.block_len = Some(256);
        assert_eq!(block_len_for(&config, 512), 256);
        config.block_len = Some(8);
        assert_eq!(block_len_for(&config, 0), MIN_BLOCK_LEN);
    }

    #[test]
    fn test_negotiation_picks_wide_crc() {
        let config = TransferConfig::default();
        let mut session = SessionState::new(&config);
        session.negotiate(&config, RxCaps::CRC32 | RxCaps::FULL_DUPLEX, 0);
        assert_eq!(session.encoding, Encoding::Binary32);

        let mut session = SessionState::new(&config);
        session.negotiate(&config, RxCaps::FULL_DUPLEX, 0);
        assert_eq!(session.encoding, Encoding::Binary16);

        let no32 = TransferConfig {
            want_crc32: false,
            ..TransferConfig::default()
        };
        let mut session = SessionState::new(&no32);
        session.negotiate(&no32, RxCaps::CRC32, 0);
        assert_eq!(session.encoding, Encoding::Binary16);
    }

    #[test]
    fn test_negotiation_adopts_receiver_escaping() {
        let config = TransferConfig::default();
        let mut session = SessionState::new(&config);
        assert!(!session.escaper.escape_all);
        session.negotiate(&config, RxCaps::ESCAPE_CONTROLS, 0);
        assert!(session.escaper.escape_all);
    }

    #[test]
    fn test_resync_backoff_halves_once_per_five_repeats() {
        let config = TransferConfig::default();
        let mut session = SessionState::new(&config);
        session.negotiate(&config, RxCaps::CRC32, 0);
        assert_eq!(session.block_len, 1024);
        session.begin_stream(0);

        // First resync at a new offset arms the counter without backing off.
        session.note_resync(100);
        assert_eq!(session.block_len, 1024);

        // Four repeats are tolerated; the fifth halves the block length.
        for _ in 0..4 {
            session.note_resync(100);
            assert_eq!(session.block_len, 1024);
        }
        session.note_resync(100);
        assert_eq!(session.block_len, 512);

        // The counter restarts: another five repeats, another halving.
        for _ in 0..4 {
            session.note_resync(100);
            assert_eq!(session.block_len, 512);
        }
        session.note_resync(100);
        assert_eq!(session.block_len, 256);

        // Moving to a fresh offset clears the run.
        session.note_resync(200);
        session.note_resync(200);
        assert_eq!(session.block_len, 256);
    }

    #[test]
    fn test_resync_backoff_floor() {
        let config = TransferConfig::default();
        let mut session = SessionState::new(&config);
        session.block_len = MIN_BLOCK_LEN;
        session.begin_stream(0);
        for _ in 0..32 {
            session.note_resync(0);
        }
        assert_eq!(session.block_len, MIN_BLOCK_LEN);
    }
}
