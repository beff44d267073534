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

//! Error taxonomy for the transfer engine.
//!
//! Recoverable wire conditions (timeouts, bad checks, garbage) are retried
//! locally by the state machine; only exhausted retry budgets and explicit
//! peer endings propagate out of a session.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No byte arrived within the deadline
    #[error("timed out waiting for the remote")]
    Timeout,

    /// A header or data subpacket failed its CRC check
    #[error("CRC mismatch on received frame")]
    BadCrc,

    /// The remote sent a cancel burst
    #[error("transfer cancelled by the remote")]
    Cancelled,

    /// The escape introducer was followed by a byte outside the escape table
    #[error("malformed escape sequence: 0x{0:02X}")]
    BadEscape(u8),

    /// The resynchronization garbage budget was exhausted, or a frame was
    /// structurally malformed
    #[error("line garbage limit exceeded while hunting for a frame")]
    Garbage,

    /// More payload arrived than the subpacket bound allows
    #[error("data subpacket exceeds {limit} bytes")]
    TooLong { limit: usize },

    /// The remote ended the session with an abort or fatal-error frame
    #[error("remote aborted the session")]
    PeerAbort,

    /// A bounded retry loop ran out of attempts
    #[error("retry limit exhausted during {0}")]
    RetryLimit(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Session ran to completion; `failed` files could not be sent
    #[error("transfer complete, {failed} file(s) failed")]
    TransferComplete { failed: usize },
}

impl Error {
    /// Classify a transport read failure: a missed deadline is a protocol
    /// timeout, anything else is a real I/O fault.
    pub(crate) fn from_read(err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::TimedOut {
            Error::Timeout
        } else {
            Error::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
