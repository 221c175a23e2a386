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

use std::collections::TryReserveError;

/// Fixed-capacity payload buffer for the block in flight.
///
/// The capacity is chosen once when a session starts and never changes.
/// Pushing past the capacity is refused rather than growing the buffer.
#[derive(Debug)]
pub struct BlockBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl BlockBuffer {
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)?;
        Ok(BlockBuffer { data, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append one byte. Returns false when the buffer is already full.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.data.len() >= self.capacity {
            return false;
        }
        self.data.push(byte);
        true
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}
