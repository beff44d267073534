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

//! Sender-side transfer state machine: capability exchange, per-file
//! metadata exchange, windowed streaming with crash-recovery resync,
//! end-of-session handshake, and command sessions.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::config::{SessionState, TransferConfig};
use crate::crc;
use crate::error::Error;
use crate::frame::{self, Header};
use crate::protocol::{
    CONVERT_BINARY, Encoding, FrameEnd, FrameType, RxCaps, TX_ESCAPE_CONTROLS, ZDLE,
};
use crate::serial::SerialPort;

// ============================================================================
// Retry and timing policy
// ============================================================================

/// Classic retry ceiling for one exchange
const MAX_RETRIES: u32 = 10;

/// The attention/escape setup exchange tolerates a longer retry run
const MAX_SETUP_RETRIES: u32 = 20;

/// Deadline for a response header
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline when draining the reverse channel between chunks
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Reverse-channel garbage tolerated before the next chunk demands an ack
const JUNK_ACK_THRESHOLD: usize = 3;

/// Free-space reply when the local capacity is not known
const FREE_SPACE_UNKNOWN: u32 = u32::MAX;

// ============================================================================
// Per-file bookkeeping
// ============================================================================

/// How one queued file ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Sent,
    Skipped,
    Failed,
}

/// Metadata exchanged for the file currently on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferRecord {
    pub name: String,
    pub size: u64,
    pub mtime: u64,
    pub mode: u32,
    pub files_remaining: usize,
    pub bytes_remaining: u64,
}

impl FileTransferRecord {
    /// Snapshot local metadata for the wire.
    pub fn from_path(
        path: &Path,
        full_path: bool,
        files_remaining: usize,
        bytes_remaining: u64,
    ) -> std::io::Result<FileTransferRecord> {
        let meta = std::fs::metadata(path)?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        #[cfg(unix)]
        let mode = std::os::unix::fs::MetadataExt::mode(&meta);
        #[cfg(not(unix))]
        let mode = 0o100644;
        let name = if full_path {
            path.to_string_lossy().into_owned()
        } else {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        Ok(FileTransferRecord {
            name,
            size: meta.len(),
            mtime,
            mode,
            files_remaining,
            bytes_remaining,
        })
    }

    /// Wire form: NUL-terminated name, then "<size> <mtime octal> <mode
    /// octal> 0 <files remaining> <bytes remaining>", NUL-terminated.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + 32);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        let info = format!(
            "{} {:o} {:o} 0 {} {}",
            self.size, self.mtime, self.mode, self.files_remaining, self.bytes_remaining
        );
        out.extend_from_slice(info.as_bytes());
        out.push(0);
        out
    }
}

struct OutgoingFile {
    file: File,
    record: FileTransferRecord,
    path: PathBuf,
}

impl OutgoingFile {
    fn open(
        path: &Path,
        full_path: bool,
        files_remaining: usize,
        bytes_remaining: u64,
    ) -> std::io::Result<OutgoingFile> {
        let file = File::open(path)?;
        let record = FileTransferRecord::from_path(path, full_path, files_remaining, bytes_remaining)?;
        Ok(OutgoingFile {
            file,
            record,
            path: path.to_path_buf(),
        })
    }
}

/// What a reverse-channel or ack exchange decided about the current file.
enum Flow {
    Continue,
    FileDone,
    FileSkipped,
}

// ============================================================================
// States
// ============================================================================

pub struct Handshake;
pub struct SendSetup;
pub struct NextFile;
pub struct SendFileHeader;
pub struct StreamData;
pub struct SendEof;
pub struct SendCommand;
pub struct Finish;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    port: Box<dyn SerialPort>,
    config: TransferConfig,
    session: SessionState,
    files: Vec<PathBuf>,
    command: Option<String>,
    current: Option<OutgoingFile>,
    chunk: Vec<u8>,
    chunk_offset: u32,
    at_eof: bool,
    file_failed: bool,
    need_data_header: bool,
    first_since_resync: bool,
    junk_count: usize,
    headroom: usize,
    spacing_count: usize,
    retries: u32,
    failed: usize,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, Error>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            port: self.port,
            config: self.config,
            session: self.session,
            files: self.files,
            command: self.command,
            current: self.current,
            chunk: self.chunk,
            chunk_offset: self.chunk_offset,
            at_eof: self.at_eof,
            file_failed: self.file_failed,
            need_data_header: self.need_data_header,
            first_since_resync: self.first_since_resync,
            junk_count: self.junk_count,
            headroom: self.headroom,
            spacing_count: self.spacing_count,
            retries: self.retries,
            failed: self.failed,
        })
    }

    fn recv(&mut self, timeout: Duration) -> Result<Header, Error> {
        frame::receive_header(self.port.as_mut(), &mut self.session, timeout)
    }

    fn send_hex(&mut self, frame_type: FrameType, offset: u32) -> Result<(), Error> {
        frame::send_header(
            self.port.as_mut(),
            &mut self.session,
            Encoding::Hex,
            Header::with_offset(frame_type, offset),
        )
    }

    fn send_binary_header(&mut self, frame_type: FrameType, pos: [u8; 4]) -> Result<(), Error> {
        let enc = self.session.encoding;
        frame::send_header(
            self.port.as_mut(),
            &mut self.session,
            enc,
            Header::new(frame_type, pos),
        )
    }

    fn retry(&mut self, what: &'static str) -> Result<(), Error> {
        self.retry_up_to(MAX_RETRIES, what)
    }

    fn retry_up_to(&mut self, limit: u32, what: &'static str) -> Result<(), Error> {
        self.retries += 1;
        if self.retries >= limit {
            warn!(what, "retry limit exhausted");
            self.cancel_burst();
            Err(Error::RetryLimit(what))
        } else {
            debug!(what, attempt = self.retries, "retrying");
            Ok(())
        }
    }

    /// Courtesy cancel burst with rubouts so a live peer stops waiting.
    fn cancel_burst(&mut self) {
        let mut burst = [0x08u8; 16];
        burst[..8].fill(ZDLE);
        let _ = self.port.write_all(&burst);
        let _ = self.port.flush();
    }

    /// Close out the current file and advance the queue.
    fn finish_file(&mut self, outcome: FileOutcome) {
        if let Some(current) = self.current.take() {
            match outcome {
                FileOutcome::Sent => info!(file = %current.path.display(), "file sent"),
                FileOutcome::Skipped => {
                    info!(file = %current.path.display(), "file skipped by receiver")
                }
                FileOutcome::Failed => {
                    self.failed += 1;
                    warn!(file = %current.path.display(), "file failed");
                }
            }
        }
        if !self.files.is_empty() {
            self.files.remove(0);
        }
        self.file_failed = false;
        self.retries = 0;
    }

    /// Whole-file CRC-32 for transfer-if-different interrogation.
    fn file_crc(&mut self) -> std::io::Result<u32> {
        let Some(current) = self.current.as_mut() else {
            return Ok(0);
        };
        current.file.seek(SeekFrom::Start(0))?;
        let mut acc = crc::CRC32_SEED;
        let mut buf = [0u8; 4096];
        loop {
            let n = current.file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for &b in &buf[..n] {
                acc = crc::crc32_update(acc, b);
            }
        }
        current.file.seek(SeekFrom::Start(0))?;
        Ok(!acc)
    }

    /// Receiver wants the stream restarted at `offset`.
    fn reposition(&mut self, offset: u32) -> Result<(), Error> {
        let size = self.current.as_ref().map(|c| c.record.size).unwrap_or(0);
        let offset = offset.min(size as u32);
        warn!(offset, "receiver resynchronized");
        self.session.note_resync(offset);
        if let Some(current) = self.current.as_mut() {
            current.file.seek(SeekFrom::Start(offset as u64))?;
        }
        self.at_eof = false;
        self.first_since_resync = true;
        self.need_data_header = true;
        self.junk_count = 0;
        self.spacing_count = 0;
        self.headroom = self.session.rx_buf_len;
        Ok(())
    }

    /// Frame-end choice for the chunk about to go out, by priority.
    fn pick_frame_end(&self, n: usize) -> FrameEnd {
        let headroom_gone = self.session.rx_buf_len > 0 && self.headroom <= n;
        if self.first_since_resync
            || self.at_eof
            || headroom_gone
            || self.junk_count >= JUNK_ACK_THRESHOLD
        {
            FrameEnd::EndOfFrameAckRequested
        } else if self.session.window > 0
            && self.session.in_flight() as usize + n >= self.session.window
        {
            FrameEnd::EndOfFrameAckRequested
        } else if self.session.window > 0
            && self.session.ack_spacing > 0
            && self.spacing_count + n >= self.session.ack_spacing
        {
            FrameEnd::ContinueAckRequested
        } else {
            FrameEnd::ContinueNoAck
        }
    }

    /// Re-issue the last subpacket behind a fresh position header.
    fn resend_chunk(&mut self) -> Result<(), Error> {
        self.send_binary_header(FrameType::DataFollows, self.chunk_offset.to_le_bytes())?;
        frame::send_data(
            self.port.as_mut(),
            &mut self.session,
            &self.chunk,
            FrameEnd::EndOfFrameAckRequested,
        )
    }

    /// Block for the receiver's answer to an ack-requesting subpacket.
    fn await_chunk_ack(&mut self) -> Result<Flow, Error> {
        loop {
            match frame::receive_header(self.port.as_mut(), &mut self.session, RESPONSE_TIMEOUT) {
                Ok(header) => match header.frame_type {
                    FrameType::Ack => {
                        self.session.acked_offset = header.offset();
                        if self.session.acked_offset == self.session.tx_offset {
                            self.retries = 0;
                            return Ok(Flow::Continue);
                        }
                        // stale ack, keep waiting
                    }
                    FrameType::ResumeAt => {
                        self.reposition(header.offset())?;
                        return Ok(Flow::Continue);
                    }
                    FrameType::ReceiveInit => return Ok(Flow::FileDone),
                    FrameType::Skip => return Ok(Flow::FileSkipped),
                    FrameType::Cancel => return Err(Error::Cancelled),
                    FrameType::Abort | FrameType::FatalError => return Err(Error::PeerAbort),
                    other => {
                        debug!(frame = ?other, "unexpected while awaiting data ack");
                        self.resend_chunk()?;
                        self.retry("data ack")?;
                    }
                },
                Err(Error::Timeout | Error::BadCrc | Error::Garbage | Error::BadEscape(_)) => {
                    self.resend_chunk()?;
                    self.retry("data ack")?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain one pending frame from the reverse channel without stalling
    /// the stream.
    fn handle_reverse(&mut self) -> Result<Flow, Error> {
        match frame::receive_header(self.port.as_mut(), &mut self.session, POLL_TIMEOUT) {
            Ok(header) => match header.frame_type {
                FrameType::Ack => {
                    self.session.acked_offset = header.offset();
                    Ok(Flow::Continue)
                }
                FrameType::ResumeAt => {
                    self.reposition(header.offset())?;
                    Ok(Flow::Continue)
                }
                FrameType::ReceiveInit => Ok(Flow::FileDone),
                FrameType::Skip => Ok(Flow::FileSkipped),
                FrameType::Cancel => Err(Error::Cancelled),
                FrameType::Abort | FrameType::FatalError => Err(Error::PeerAbort),
                other => {
                    debug!(frame = ?other, "ignored on reverse channel");
                    Ok(Flow::Continue)
                }
            },
            Err(Error::Cancelled) => {
                // The receiver's attention sequence can look like a cancel
                // run; a reposition normally follows it.
                match frame::receive_header(self.port.as_mut(), &mut self.session, RESPONSE_TIMEOUT)
                {
                    Ok(header) if header.frame_type == FrameType::ResumeAt => {
                        self.reposition(header.offset())?;
                        Ok(Flow::Continue)
                    }
                    _ => Err(Error::Cancelled),
                }
            }
            Err(Error::Timeout | Error::Garbage | Error::BadCrc | Error::BadEscape(_)) => {
                self.junk_count += self.session.garbage_seen.max(1);
                Ok(Flow::Continue)
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<Handshake> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, Error> {
        let mut fsm = *self;
        fsm.send_hex(FrameType::RequestInit, 0)?;
        match fsm.recv(RESPONSE_TIMEOUT) {
            Ok(header) => match header.frame_type {
                FrameType::ReceiveInit => {
                    let caps = RxCaps::from_bits_truncate(header.flags());
                    let rx_buf_len = header.pos[0] as usize | (header.pos[1] as usize) << 8;
                    fsm.session.negotiate(&fsm.config, caps, rx_buf_len);
                    info!(
                        encoding = ?fsm.session.encoding,
                        block_len = fsm.session.block_len,
                        rx_buf_len,
                        caps = ?caps,
                        "receiver ready"
                    );
                    fsm.retries = 0;
                    if fsm.config.escape_controls || !fsm.config.attn.is_empty() {
                        Ok(fsm.transition::<SendSetup>())
                    } else if fsm.command.is_some() {
                        Ok(fsm.transition::<SendCommand>())
                    } else {
                        Ok(fsm.transition::<NextFile>())
                    }
                }
                FrameType::Challenge => {
                    fsm.send_hex(FrameType::Ack, header.offset())?;
                    Ok(Box::new(fsm))
                }
                FrameType::FreeSpaceQuery => {
                    fsm.send_hex(FrameType::Ack, FREE_SPACE_UNKNOWN)?;
                    Ok(Box::new(fsm))
                }
                // The peer's previous session is still winding down; offer
                // again.
                FrameType::Command => Ok(Box::new(fsm)),
                FrameType::Cancel => Err(Error::Cancelled),
                FrameType::Abort | FrameType::FatalError | FrameType::Finish => {
                    Err(Error::PeerAbort)
                }
                other => {
                    debug!(frame = ?other, "unexpected during handshake");
                    fsm.retry("handshake")?;
                    Ok(Box::new(fsm))
                }
            },
            Err(Error::Timeout | Error::BadCrc | Error::Garbage | Error::BadEscape(_)) => {
                fsm.retry("handshake")?;
                Ok(Box::new(fsm))
            }
            Err(e) => Err(e),
        }
    }
}

impl SenderState for SenderFsm<SendSetup> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, Error> {
        let mut fsm = *self;
        let flags = if fsm.config.escape_controls {
            [0, 0, 0, TX_ESCAPE_CONTROLS]
        } else {
            [0; 4]
        };
        fsm.send_binary_header(FrameType::SendInit, flags)?;
        let mut payload = fsm.config.attn.clone();
        payload.push(0);
        frame::send_data(
            fsm.port.as_mut(),
            &mut fsm.session,
            &payload,
            FrameEnd::EndOfFrameAckRequested,
        )?;
        match fsm.recv(RESPONSE_TIMEOUT) {
            Ok(header) => match header.frame_type {
                FrameType::Ack => {
                    fsm.retries = 0;
                    if fsm.command.is_some() {
                        Ok(fsm.transition::<SendCommand>())
                    } else {
                        Ok(fsm.transition::<NextFile>())
                    }
                }
                FrameType::Cancel => Err(Error::Cancelled),
                FrameType::Abort | FrameType::FatalError => Err(Error::PeerAbort),
                other => {
                    debug!(frame = ?other, "unexpected answering setup");
                    fsm.retry_up_to(MAX_SETUP_RETRIES, "setup")?;
                    Ok(Box::new(fsm))
                }
            },
            Err(Error::Timeout | Error::BadCrc | Error::Garbage | Error::BadEscape(_)) => {
                fsm.retry_up_to(MAX_SETUP_RETRIES, "setup")?;
                Ok(Box::new(fsm))
            }
            Err(e) => Err(e),
        }
    }
}

impl SenderState for SenderFsm<NextFile> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, Error> {
        let mut fsm = *self;
        let Some(path) = fsm.files.first().cloned() else {
            return Ok(fsm.transition::<Finish>());
        };
        let bytes_remaining = fsm
            .files
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        let files_remaining = fsm.files.len();
        match OutgoingFile::open(&path, fsm.config.full_path, files_remaining, bytes_remaining) {
            Ok(outgoing) => {
                info!(file = %path.display(), size = outgoing.record.size, "offering file");
                fsm.current = Some(outgoing);
                fsm.retries = 0;
                fsm.file_failed = false;
                Ok(fsm.transition::<SendFileHeader>())
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "cannot open file");
                fsm.files.remove(0);
                fsm.failed += 1;
                Ok(Box::new(fsm))
            }
        }
    }
}

impl SenderState for SenderFsm<SendFileHeader> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, Error> {
        let mut fsm = *self;
        let Some(wire) = fsm.current.as_ref().map(|c| c.record.to_wire()) else {
            return Ok(fsm.transition::<NextFile>());
        };
        let flags = [
            0,
            0,
            fsm.config.policy.flag_byte(fsm.config.skip_if_absent),
            CONVERT_BINARY,
        ];
        fsm.send_binary_header(FrameType::FileHeader, flags)?;
        frame::send_data(
            fsm.port.as_mut(),
            &mut fsm.session,
            &wire,
            FrameEnd::EndOfFrameAckRequested,
        )?;
        loop {
            match fsm.recv(RESPONSE_TIMEOUT) {
                Ok(header) => match header.frame_type {
                    FrameType::ResumeAt => {
                        let size = fsm.current.as_ref().map(|c| c.record.size).unwrap_or(0);
                        let offset = header.offset().min(size as u32);
                        if let Some(current) = fsm.current.as_mut() {
                            current.file.seek(SeekFrom::Start(offset as u64))?;
                        }
                        fsm.session.begin_stream(offset);
                        fsm.at_eof = false;
                        fsm.file_failed = false;
                        fsm.first_since_resync = true;
                        fsm.need_data_header = true;
                        fsm.junk_count = 0;
                        fsm.spacing_count = 0;
                        fsm.headroom = fsm.session.rx_buf_len;
                        fsm.retries = 0;
                        debug!(offset, "receiver positioned");
                        return Ok(fsm.transition::<StreamData>());
                    }
                    FrameType::Skip => {
                        fsm.finish_file(FileOutcome::Skipped);
                        return Ok(fsm.transition::<NextFile>());
                    }
                    FrameType::CrcRequest => match fsm.file_crc() {
                        Ok(check) => fsm.send_hex(FrameType::CrcRequest, check)?,
                        Err(e) => {
                            warn!(error = %e, "cannot checksum file");
                            fsm.finish_file(FileOutcome::Failed);
                            return Ok(fsm.transition::<NextFile>());
                        }
                    },
                    FrameType::Ack => {}
                    FrameType::Cancel => return Err(Error::Cancelled),
                    FrameType::Abort | FrameType::FatalError => return Err(Error::PeerAbort),
                    other => {
                        debug!(frame = ?other, "unexpected answering file header");
                        break;
                    }
                },
                Err(Error::Timeout | Error::BadCrc | Error::Garbage | Error::BadEscape(_)) => break,
                Err(e) => return Err(e),
            }
        }
        fsm.retry("file header")?;
        Ok(Box::new(fsm))
    }
}

impl SenderState for SenderFsm<StreamData> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, Error> {
        let mut fsm = *self;

        // Reverse-channel poll: drain acknowledgments and interrupts while
        // running ahead of the receiver.
        if fsm.session.in_flight() > 0 && fsm.port.peek_available()? {
            match fsm.handle_reverse()? {
                Flow::Continue => {}
                Flow::FileDone => return Ok(fsm.transition::<SendEof>()),
                Flow::FileSkipped => {
                    fsm.finish_file(FileOutcome::Skipped);
                    return Ok(fsm.transition::<NextFile>());
                }
            }
        }

        if fsm.at_eof && fsm.session.in_flight() == 0 {
            return Ok(fsm.transition::<SendEof>());
        }

        let len = fsm.session.block_len;
        let mut buf = vec![0u8; len];
        let n = {
            let Some(current) = fsm.current.as_mut() else {
                return Ok(fsm.transition::<NextFile>());
            };
            match current.file.read(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "file read failed, truncating transfer");
                    fsm.file_failed = true;
                    0
                }
            }
        };
        if n < len {
            fsm.at_eof = true;
        }
        buf.truncate(n);
        fsm.chunk = buf;
        fsm.chunk_offset = fsm.session.tx_offset;

        let end = fsm.pick_frame_end(n);
        if fsm.need_data_header {
            fsm.send_binary_header(FrameType::DataFollows, fsm.chunk_offset.to_le_bytes())?;
            fsm.need_data_header = false;
        }
        frame::send_data(fsm.port.as_mut(), &mut fsm.session, &fsm.chunk, end)?;
        fsm.session.tx_offset = fsm.session.tx_offset.wrapping_add(n as u32);
        fsm.first_since_resync = false;
        fsm.spacing_count += n;
        if fsm.session.rx_buf_len > 0 {
            fsm.headroom = fsm.headroom.saturating_sub(n);
        }

        match end {
            FrameEnd::EndOfFrameAckRequested => {
                fsm.need_data_header = true;
                fsm.spacing_count = 0;
                fsm.junk_count = 0;
                fsm.headroom = fsm.session.rx_buf_len;
                match fsm.await_chunk_ack()? {
                    Flow::Continue => {}
                    Flow::FileDone => return Ok(fsm.transition::<SendEof>()),
                    Flow::FileSkipped => {
                        fsm.finish_file(FileOutcome::Skipped);
                        return Ok(fsm.transition::<NextFile>());
                    }
                }
            }
            FrameEnd::ContinueAckRequested => fsm.spacing_count = 0,
            _ => {}
        }

        if fsm.at_eof && fsm.session.in_flight() == 0 {
            return Ok(fsm.transition::<SendEof>());
        }
        Ok(Box::new(fsm))
    }
}

impl SenderState for SenderFsm<SendEof> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, Error> {
        let mut fsm = *self;
        let offset = fsm.session.tx_offset;
        fsm.send_binary_header(FrameType::EndOfFile, offset.to_le_bytes())?;
        match fsm.recv(RESPONSE_TIMEOUT) {
            Ok(header) => match header.frame_type {
                FrameType::Ack | FrameType::ReceiveInit => {
                    let outcome = if fsm.file_failed {
                        FileOutcome::Failed
                    } else {
                        FileOutcome::Sent
                    };
                    fsm.finish_file(outcome);
                    Ok(fsm.transition::<NextFile>())
                }
                FrameType::ResumeAt => {
                    fsm.reposition(header.offset())?;
                    Ok(fsm.transition::<StreamData>())
                }
                FrameType::Cancel => Err(Error::Cancelled),
                FrameType::Skip | FrameType::Abort | FrameType::FatalError => Err(Error::PeerAbort),
                other => {
                    debug!(frame = ?other, "unexpected at end of file");
                    fsm.retry("end of file")?;
                    Ok(Box::new(fsm))
                }
            },
            Err(Error::Timeout | Error::BadCrc | Error::Garbage | Error::BadEscape(_)) => {
                fsm.retry("end of file")?;
                Ok(Box::new(fsm))
            }
            Err(e) => Err(e),
        }
    }
}

impl SenderState for SenderFsm<SendCommand> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, Error> {
        let mut fsm = *self;
        let Some(command) = fsm.command.clone() else {
            return Ok(fsm.transition::<Finish>());
        };
        fsm.send_binary_header(FrameType::Command, [0; 4])?;
        let mut payload = command.into_bytes();
        payload.push(0);
        frame::send_data(
            fsm.port.as_mut(),
            &mut fsm.session,
            &payload,
            FrameEnd::EndOfFrameAckRequested,
        )?;
        loop {
            match fsm.recv(RESPONSE_TIMEOUT) {
                Ok(header) => match header.frame_type {
                    FrameType::Complete => {
                        let status = header.offset();
                        info!(status, "remote command completed");
                        if status != 0 {
                            fsm.failed += 1;
                        }
                        return Ok(fsm.transition::<Finish>());
                    }
                    FrameType::Ack => {}
                    FrameType::Cancel => return Err(Error::Cancelled),
                    FrameType::Abort | FrameType::FatalError => return Err(Error::PeerAbort),
                    other => {
                        debug!(frame = ?other, "unexpected during command");
                        break;
                    }
                },
                Err(Error::Timeout | Error::BadCrc | Error::Garbage | Error::BadEscape(_)) => break,
                Err(e) => return Err(e),
            }
        }
        fsm.retry("command")?;
        Ok(Box::new(fsm))
    }
}

impl SenderState for SenderFsm<Finish> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, Error> {
        let mut fsm = *self;
        fsm.send_hex(FrameType::Finish, 0)?;
        match fsm.recv(RESPONSE_TIMEOUT) {
            Ok(header) if header.frame_type == FrameType::Finish => {
                // Drain line residue, then the closing courtesy bytes.
                fsm.port.purge_input()?;
                fsm.port.write_all(b"OO")?;
                fsm.port.flush()?;
                info!(failed = fsm.failed, "session finished");
                Err(Error::TransferComplete { failed: fsm.failed })
            }
            Ok(header)
                if matches!(
                    header.frame_type,
                    FrameType::Cancel | FrameType::Abort | FrameType::FatalError
                ) =>
            {
                // A goodbye gone wrong still ends the session.
                Err(Error::TransferComplete { failed: fsm.failed })
            }
            Err(Error::Cancelled) => Err(Error::TransferComplete { failed: fsm.failed }),
            Ok(_) | Err(Error::Timeout | Error::BadCrc | Error::Garbage | Error::BadEscape(_)) => {
                fsm.retries += 1;
                if fsm.retries >= MAX_RETRIES {
                    debug!("peer silent at finish");
                    Err(Error::TransferComplete { failed: fsm.failed })
                } else {
                    Ok(Box::new(fsm))
                }
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl SenderFsm<Handshake> {
    /// Build a sender for the queued files.
    pub fn new(
        port: Box<dyn SerialPort>,
        files: Vec<PathBuf>,
        config: TransferConfig,
    ) -> Box<dyn SenderState> {
        Self::build(port, files, None, config)
    }

    /// Build a sender that runs one remote command instead of files.
    pub fn new_command(
        port: Box<dyn SerialPort>,
        command: String,
        config: TransferConfig,
    ) -> Box<dyn SenderState> {
        Self::build(port, Vec::new(), Some(command), config)
    }

    fn build(
        port: Box<dyn SerialPort>,
        files: Vec<PathBuf>,
        command: Option<String>,
        config: TransferConfig,
    ) -> Box<dyn SenderState> {
        let session = SessionState::new(&config);
        Box::new(SenderFsm {
            state: PhantomData::<Handshake>,
            port,
            config,
            session,
            files,
            command,
            current: None,
            chunk: Vec::new(),
            chunk_offset: 0,
            at_eof: false,
            file_failed: false,
            need_data_header: true,
            first_since_resync: true,
            junk_count: 0,
            headroom: 0,
            spacing_count: 0,
            retries: 0,
            failed: 0,
        })
    }
}

/// Drive a sender to completion. Ok carries the failed-file count.
pub fn run(mut state: Box<dyn SenderState>) -> Result<usize, Error> {
    loop {
        match state.step() {
            Ok(next) => state = next,
            Err(Error::TransferComplete { failed }) => return Ok(failed),
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
