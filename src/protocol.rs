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

//! XMODEM / YMODEM protocol constants

/// Start of header - begins a 128-byte data block
pub const SOH: u8 = 0x01;

/// Start of text - begins a 1024-byte data block
pub const STX: u8 = 0x02;

/// End of transmission - sender has no more data for the current file
pub const EOT: u8 = 0x04;

/// Acknowledge - receiver accepted the last block
pub const ACK: u8 = 0x06;

/// Negative acknowledge - receiver wants the last block again (checksum mode probe)
pub const NAK: u8 = 0x15;

/// Cancel - abort the transfer
pub const CAN: u8 = 0x18;

/// CRC mode probe - receiver asks the sender to use CRC-16
pub const CRC_PROBE: u8 = b'C';

/// Which of the two protocols a session speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Single file, no metadata, destination chosen by the caller
    Xmodem,
    /// Batch mode, each file announced by a header block 0
    Ymodem,
}

/// Payload size announced by a block's start marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSize {
    Standard = 128,
    OneK = 1024,
}

impl BlockSize {
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            SOH => Some(BlockSize::Standard),
            STX => Some(BlockSize::OneK),
            _ => None,
        }
    }

    pub fn len(self) -> usize {
        self as usize
    }
}

/// Control byte that opens a session and is resent while nothing arrives
pub fn initial_reply(use_crc: bool) -> u8 {
    if use_crc { CRC_PROBE } else { NAK }
}

/// Printable name for a control byte, used in log output
pub fn control_name(byte: u8) -> &'static str {
    match byte {
        SOH => "SOH",
        STX => "STX",
        EOT => "EOT",
        ACK => "ACK",
        NAK => "NAK",
        CAN => "CAN",
        CRC_PROBE => "'C'",
        _ => "?",
    }
}
