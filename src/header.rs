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

//! YMODEM block 0 parsing
//!
//! Block 0 carries `name NUL size [SP mtime ...] NUL` padded with zeros.
//! An all-zero block (empty name) ends the batch.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    /// Declared length, `None` when the sender left the field out
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("filename is not NUL-terminated")]
    Unterminated,

    #[error("filename is not valid UTF-8")]
    InvalidName,

    #[error("file size field is not a decimal number")]
    InvalidSize,
}

/// Parse a header block. `Ok(None)` means end of batch.
pub fn parse_header(block: &[u8]) -> Result<Option<FileHeader>, HeaderError> {
    let name_end = block
        .iter()
        .position(|&b| b == 0)
        .ok_or(HeaderError::Unterminated)?;

    if name_end == 0 {
        return Ok(None);
    }

    let name = std::str::from_utf8(&block[..name_end])
        .map_err(|_| HeaderError::InvalidName)?
        .to_string();

    let rest = &block[name_end + 1..];
    let field_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let size = parse_size(&rest[..field_end])?;

    Ok(Some(FileHeader { name, size }))
}

fn parse_size(field: &[u8]) -> Result<Option<u64>, HeaderError> {
    let start = field.iter().position(|&b| b != b' ').unwrap_or(field.len());
    let field = &field[start..];
    if field.is_empty() {
        return Ok(None);
    }

    let digits = field.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return Err(HeaderError::InvalidSize);
    }

    // Anything after the digits (modification time, mode, serial) is ignored
    let mut size: u64 = 0;
    for &b in &field[..digits] {
        size = size
            .checked_mul(10)
            .and_then(|s| s.checked_add(u64::from(b - b'0')))
            .ok_or(HeaderError::InvalidSize)?;
    }
    Ok(Some(size))
}
