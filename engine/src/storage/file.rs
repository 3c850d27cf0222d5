//! File-backed storage.
//!
//! `FileStorage` implements [`Storage`] on top of a regular file. Reads past
//! the current end of the file are errors; writes past it extend the file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::io::{Address, Storage, StorageError};

/// A byte-addressed store backed by a file on disk.
pub struct FileStorage {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileStorage {
    /// Create a new, empty file.
    ///
    /// Fails if the file already exists.
    pub fn create(path: &Path) -> Result<Self, FileError> {
        if path.exists() {
            return Err(FileError::AlreadyExists(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(FileError::Io)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len: 0,
        })
    }

    /// Open an existing file.
    pub fn open(path: &Path) -> Result<Self, FileError> {
        if !path.exists() {
            return Err(FileError::NotFound(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;
        let len = file.metadata().map_err(FileError::Io)?.len();

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn read_at(&mut self, addr: Address, buf: &mut [u8]) -> Result<(), StorageError> {
        let end = addr.checked_add(buf.len() as u64);
        if end.is_none_or(|end| end > self.len) {
            return Err(StorageError::OutOfBounds {
                addr,
                len: buf.len(),
                end: self.len,
            });
        }

        self.file.seek(SeekFrom::Start(addr))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, addr: Address, bytes: &[u8]) -> Result<(), StorageError> {
        self.file.seek(SeekFrom::Start(addr))?;
        self.file.write_all(bytes)?;
        self.len = self.len.max(addr + bytes.len() as u64);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn end_of_file(&self) -> u64 {
        self.len
    }
}

/// Errors that can occur when opening a file store.
#[derive(Debug)]
pub enum FileError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(PathBuf),
    /// File does not exist.
    NotFound(PathBuf),
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::NotFound(p) => write!(f, "file not found: {}", p.display()),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AlreadyExists(_) | Self::NotFound(_) => None,
        }
    }
}

impl From<FileError> for StorageError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Io(io_err) => Self::Io(io_err),
            FileError::AlreadyExists(path) => Self::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", path.display()),
            )),
            FileError::NotFound(path) => Self::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("file not found: {}", path.display()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.idx");

        {
            let mut storage = FileStorage::create(&path).expect("create");
            assert_eq!(storage.end_of_file(), 0);
            storage.write_at(100, b"hello world").expect("write");
            storage.sync().expect("sync");
            assert_eq!(storage.end_of_file(), 111);
        }

        {
            let mut storage = FileStorage::open(&path).expect("open");
            assert_eq!(storage.end_of_file(), 111);

            let mut buf = [0u8; 11];
            storage.read_at(100, &mut buf).expect("read");
            assert_eq!(&buf, b"hello world");

            // The gap before the first write reads back as zeros
            let mut gap = [0xAAu8; 8];
            storage.read_at(0, &mut gap).expect("read gap");
            assert_eq!(gap, [0u8; 8]);
        }
    }

    #[test]
    fn test_create_already_exists() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.idx");
        fs::write(&path, b"existing").expect("write file");

        let result = FileStorage::create(&path);
        assert!(matches!(result, Err(FileError::AlreadyExists(_))));
    }

    #[test]
    fn test_open_missing() {
        let dir = tempdir().expect("create temp dir");
        let result = FileStorage::open(&dir.path().join("missing.idx"));
        assert!(matches!(result, Err(FileError::NotFound(_))));
    }

    #[test]
    fn test_read_out_of_bounds() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.idx");
        let mut storage = FileStorage::create(&path).expect("create");
        storage.write_at(0, &[1, 2, 3, 4]).expect("write");

        let mut buf = [0u8; 8];
        let result = storage.read_at(0, &mut buf);
        assert!(matches!(result, Err(StorageError::OutOfBounds { .. })));
    }
}
