//! # Block Device
//!
//! The engine never touches the filesystem directly; every byte that reaches
//! or leaves the store file goes through a [`BlockDevice`]. The device exposes
//! synchronous fixed-offset reads and writes with no alignment requirements —
//! page alignment is the engine's own offset arithmetic, not the device's.
//!
//! ## Contract
//!
//! - `read(offset, len)` fails when any part of the range lies past the end
//!   of the file; short reads are never returned.
//! - `write(offset, bytes)` extends the file as needed so the full range
//!   becomes addressable.
//! - `flush` makes previously written bytes durable (fsync).
//! - `truncate(len)` shrinks or extends the addressable range.
//!
//! [`FileDevice`] is the production implementation over `std::fs::File`.
//! Tests substitute their own implementations to inject I/O faults, which is
//! why the engine owns the device as a boxed trait object.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, StoreError};

/// Synchronous byte-addressed access to one named file.
pub trait BlockDevice: Send {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()>;

    fn truncate(&mut self, len: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [`BlockDevice`] over a regular file.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileDevice {
    /// Creates the file. Fails with `AlreadyExists` if it is present.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StoreError::AlreadyExists(path.display().to_string())
                } else {
                    StoreError::Io(e)
                }
            })?;

        debug!(path = %path.display(), "created store file");
        Ok(Self { file, path, len: 0 })
    }

    /// Opens an existing file. Fails with `NotFound` if it is absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StoreError::NotFound(path.display().to_string())
                } else {
                    StoreError::Io(e)
                }
            })?;
        let len = file.metadata()?.len();

        debug!(path = %path.display(), len, "opened store file");
        Ok(Self { file, path, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| StoreError::invalid(format!("read range overflow at {}", offset)))?;
        if end > self.len {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {} bytes at offset {} past end of file ({} bytes)",
                    len, offset, self.len
                ),
            )));
        }

        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.len = self.len.max(offset + bytes.len() as u64);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Whether a store file exists at `path`.
pub fn exists<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().is_file()
}

/// Removes the store file at `path`. Fails with `NotFound` if absent.
pub fn remove<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(StoreError::NotFound(path.display().to_string()));
    }
    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "removed store file");
    Ok(())
}
