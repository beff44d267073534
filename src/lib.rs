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

//! # zlink
//!
//! ZMODEM sender engine for unreliable byte links: modem lines, terminal
//! servers, or any pipe that can move one byte at a time with a timeout.
//!
//! The engine negotiates capabilities over self-describing headers, streams
//! files in CRC-terminated subpackets behind a transmit window, resumes
//! interrupted transfers at the receiver-requested offset, and recovers from
//! line noise with bounded retries. Headers travel in one of three wire
//! renderings:
//!
//! ```text
//! hex:     * * ZDLE B  tt pppppppp cccc CR LF [XON]   handshake, control
//! binary:  *   ZDLE A  t p p p p c c                  data, CRC-16
//! wide:    *   ZDLE C  t p p p p c c c c              data, CRC-32
//! ```
//!
//! Layering, leaf to root: [`crc`] (integrity), [`escape`] (line-safe byte
//! stream), [`frame`] (headers and data subpackets), [`sender`] (the session
//! state machine), with [`serial`] as the transport boundary and [`config`]
//! carrying operator knobs and negotiated session state.

pub mod config;
pub mod crc;
pub mod error;
pub mod escape;
pub mod frame;
pub mod protocol;
pub mod sender;
pub mod serial;

pub use config::{FilePolicy, SessionState, TransferConfig};
pub use error::{Error, Result};
pub use frame::Header;
pub use protocol::{Encoding, FrameEnd, FrameType, RxCaps};
pub use sender::{FileTransferRecord, SenderFsm, SenderState};
pub use serial::{RealSerialPort, SerialPort};
