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

//! Device pathname handling shared by the shell and the YMODEM receiver

use thiserror::Error;

/// Longest pathname either side will build
pub const MAX_PATH_LEN: usize = 128;

pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("missing pathname")]
    Empty,

    #[error("pathname too long")]
    TooLong { len: usize, max: usize },
}

/// Resolve `name` against `base`.
///
/// A name starting with `/` is used as-is. Anything else is appended to
/// `base` with exactly one separator between them. The result is never
/// truncated: if it would exceed [`MAX_PATH_LEN`] an error is returned.
pub fn join(base: &str, name: &str) -> Result<String, PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }

    let path = if name.starts_with(SEPARATOR) {
        name.to_string()
    } else {
        let base = if base.is_empty() { "/" } else { base };
        let mut path = String::with_capacity(base.len() + 1 + name.len());
        path.push_str(base);
        if !base.ends_with(SEPARATOR) {
            path.push(SEPARATOR);
        }
        path.push_str(name);
        path
    };

    if path.len() > MAX_PATH_LEN {
        return Err(PathError::TooLong { len: path.len(), max: MAX_PATH_LEN });
    }
    Ok(path)
}

/// Collapse `.`, `..` and repeated separators in an absolute path.
/// `..` at the root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split(SEPARATOR) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return SEPARATOR.to_string();
    }
    parts.iter().fold(String::new(), |mut acc, part| {
        acc.push(SEPARATOR);
        acc.push_str(part);
        acc
    })
}
