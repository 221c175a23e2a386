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

//! Per-block integrity check, accumulated one payload byte at a time

use std::fmt;
use crc16::{State, XMODEM};

/// Running checksum or CRC over the payload of the block in flight.
///
/// Reset at the start of every block. CRC mode is CRC-16/XMODEM
/// (polynomial 0x1021, zero seed) and is sent high byte first.
pub enum BlockCheck {
    Sum(u8),
    Crc(State<XMODEM>),
}

impl BlockCheck {
    pub fn new(use_crc: bool) -> Self {
        if use_crc {
            BlockCheck::Crc(State::<XMODEM>::new())
        } else {
            BlockCheck::Sum(0)
        }
    }

    pub fn update(&mut self, byte: u8) {
        match self {
            BlockCheck::Sum(sum) => *sum = sum.wrapping_add(byte),
            BlockCheck::Crc(state) => state.update(&[byte]),
        }
    }

    /// Number of trailer bytes the sender appends after the payload
    pub fn trailer_len(&self) -> usize {
        match self {
            BlockCheck::Sum(_) => 1,
            BlockCheck::Crc(_) => 2,
        }
    }

    pub fn value(&self) -> u16 {
        match self {
            BlockCheck::Sum(sum) => u16::from(*sum),
            BlockCheck::Crc(state) => state.get(),
        }
    }

    pub fn matches(&self, received: u16) -> bool {
        self.value() == received
    }
}

impl fmt::Debug for BlockCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockCheck::Sum(sum) => write!(f, "Sum(0x{:02X})", sum),
            BlockCheck::Crc(state) => write!(f, "Crc(0x{:04X})", state.get()),
        }
    }
}

/// Trailer bytes a sender would append to `data`
#[cfg(test)]
pub fn trailer(use_crc: bool, data: &[u8]) -> Vec<u8> {
    let mut check = BlockCheck::new(use_crc);
    for &byte in data {
        check.update(byte);
    }
    let value = check.value();
    if use_crc {
        vec![(value >> 8) as u8, value as u8]
    } else {
        vec![value as u8]
    }
}
