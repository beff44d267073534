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

use std::time::Duration;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort as SerialPortTrait, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte-transport operations the protocol engine needs from a link.
pub trait SerialPort: Send {
    /// Blocking single-byte read with a deadline; a missed deadline is an
    /// error of kind `TimedOut`.
    fn read_byte(&mut self, timeout: Duration) -> std::io::Result<u8>;

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn write_byte(&mut self, byte: u8) -> std::io::Result<()> {
        self.write_all(&[byte])
    }

    fn flush(&mut self) -> std::io::Result<()>;

    /// Discard any bytes already buffered on the input side.
    fn purge_input(&mut self) -> std::io::Result<()>;

    /// True when at least one byte can be read without blocking.
    fn peek_available(&mut self) -> std::io::Result<bool>;

    /// Assert a line break condition briefly.
    fn send_break(&mut self) -> std::io::Result<()>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

fn io_err(e: serialport::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

impl SerialPort for RealSerialPort {
    fn read_byte(&mut self, timeout: Duration) -> std::io::Result<u8> {
        self.port.set_timeout(timeout).map_err(io_err)?;
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no data before deadline",
            )),
            Ok(_) => Ok(buf[0]),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }

    fn purge_input(&mut self) -> std::io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io_err)
    }

    fn peek_available(&mut self) -> std::io::Result<bool> {
        Ok(self.port.bytes_to_read().map_err(io_err)? > 0)
    }

    fn send_break(&mut self) -> std::io::Result<()> {
        self.port.set_break().map_err(io_err)?;
        std::thread::sleep(Duration::from_millis(200));
        self.port.clear_break().map_err(io_err)
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Data to return on reads (None = timeout / nothing available)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn read_byte(&mut self, _timeout: Duration) -> std::io::Result<u8> {
        // Out of responses = timeout
        if self.read_pos >= self.read_buffer.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout",
            ));
        }

        match self.read_buffer[self.read_pos] {
            Some(byte) => {
                self.read_pos += 1;
                Ok(byte)
            }
            None => {
                self.read_pos += 1;
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Mock timeout",
                ))
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn purge_input(&mut self) -> std::io::Result<()> {
        self.read_pos = self.read_buffer.len();
        Ok(())
    }

    fn peek_available(&mut self) -> std::io::Result<bool> {
        if self.read_pos >= self.read_buffer.len() {
            return Ok(false);
        }
        // A timeout marker means "nothing available at this poll"
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn send_break(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}
