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

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

// ============================================================================
// Storage Trait
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Filesystem addressed by device-style absolute paths (`/dir/file`).
///
/// Write handles are closed by flushing and dropping them.
pub trait Storage {
    /// Create or truncate `path` for writing
    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn Write>>;

    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn Read>>;

    fn remove(&mut self, path: &str) -> io::Result<()>;

    fn exists(&self, path: &str) -> bool;

    fn is_dir(&self, path: &str) -> bool;

    fn mkdir(&mut self, path: &str) -> io::Result<()>;

    fn rmdir(&mut self, path: &str) -> io::Result<()>;

    fn list_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;
}

// ============================================================================
// Host Directory Implementation
// ============================================================================

/// Exposes a host directory as the device's `/`
pub struct RootedStorage {
    root: PathBuf,
}

impl RootedStorage {
    pub fn new(root: PathBuf) -> io::Result<Self> {
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("storage root is not a directory: {}", root.display()),
            ));
        }
        Ok(RootedStorage { root })
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("path escapes storage root: {}", path),
                    ));
                }
            }
        }
        Ok(resolved)
    }
}

impl Storage for RootedStorage {
    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn Write>> {
        let file = File::create(self.resolve(path)?)?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn Read>> {
        let file = File::open(self.resolve(path)?)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path)?)
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_dir()).unwrap_or(false)
    }

    fn mkdir(&mut self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.resolve(path)?)
    }

    fn rmdir(&mut self, path: &str) -> io::Result<()> {
        let dir = self.resolve(path)?;
        if dir == self.root {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "refusing to remove storage root",
            ));
        }
        fs::remove_dir(dir)
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path)?)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                is_dir: meta.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

// ============================================================================
// In-Memory Storage for Testing
// ============================================================================

#[cfg(test)]
pub use memory::MemoryStorage;
