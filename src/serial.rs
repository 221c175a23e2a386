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

use std::io::{Read, Write};
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Non-blocking byte channel used by the shell and the receiver.
///
/// Nothing here may wait for input: callers poll `bytes_available`
/// and only read what is already buffered.
pub trait SerialPort: Send {
    fn bytes_available(&mut self) -> std::io::Result<usize>;

    /// Next buffered byte, or `None` if the channel is currently empty
    fn read_byte(&mut self) -> std::io::Result<Option<u8>>;

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn flush(&mut self) -> std::io::Result<()>;
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
            .timeout(Duration::from_millis(10))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn bytes_available(&mut self) -> std::io::Result<usize> {
        let count = self.port.bytes_to_read()?;
        Ok(count as usize)
    }

    fn read_byte(&mut self) -> std::io::Result<Option<u8>> {
        if self.bytes_available()? == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

/// Scripted channel. `None` in the input script marks a poll boundary:
/// the channel reports nothing available once, then moves on.
#[cfg(test)]
pub struct MockSerialPort {
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    write_log: Vec<u8>,
    // None = caller inspects writes itself
    expected_writes: Option<Vec<u8>>,
    // Channel breaks once the script is used up
    fail_when_drained: bool,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes: Some(expected_writes),
            fail_when_drained: false,
        }
    }

    pub fn unchecked(responses: Vec<Option<u8>>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes: None,
            fail_when_drained: false,
        }
    }

    /// Report a broken channel after the last scripted byte
    pub fn break_when_drained(mut self) -> Self {
        self.fail_when_drained = true;
        self
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.read_buffer.extend(bytes.iter().map(|&b| Some(b)));
    }

    pub fn written(&self) -> &[u8] {
        &self.write_log
    }

    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.write_log)
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn bytes_available(&mut self) -> std::io::Result<usize> {
        if let Some(None) = self.read_buffer.get(self.read_pos) {
            // Quiet for this poll only
            self.read_pos += 1;
            return Ok(0);
        }
        if self.fail_when_drained && self.read_pos == self.read_buffer.len() {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "line dropped"));
        }

        let count = self.read_buffer[self.read_pos..]
            .iter()
            .take_while(|b| b.is_some())
            .count();
        Ok(count)
    }

    fn read_byte(&mut self) -> std::io::Result<Option<u8>> {
        match self.read_buffer.get(self.read_pos) {
            Some(Some(byte)) => {
                self.read_pos += 1;
                Ok(Some(*byte))
            }
            _ => Ok(None),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        if let Some(expected) = &self.expected_writes {
            assert_eq!(
                &self.write_log,
                expected,
                "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
                expected.len(),
                expected,
                self.write_log.len(),
                self.write_log
            );
        }
    }
}
