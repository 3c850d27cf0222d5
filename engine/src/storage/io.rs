//! Storage abstraction for deterministic simulation testing.
//!
//! This module provides a `Storage` trait that abstracts over byte-addressed
//! storage, allowing the engine to use real file I/O in production and
//! simulated in-memory storage in tests.
//!
//! # Design
//!
//! The trait is a minimal abstraction over the operations the metadata cache
//! and the superblock need:
//! - Reading a block of bytes at an address
//! - Writing a block of bytes at an address (extending the store if needed)
//! - Making previous writes durable
//!
//! Nothing above the metadata cache talks to a `Storage` directly.

/// A file address (byte offset from the start of the file).
pub type Address = u64;

/// Sentinel for "no address" (an unset node pointer, an empty tree root).
pub const UNDEFINED_ADDRESS: Address = u64::MAX;

/// Returns true if the address refers to real file space.
#[must_use]
pub const fn address_defined(addr: Address) -> bool {
    addr != UNDEFINED_ADDRESS
}

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Read past the end of the stored bytes.
    OutOfBounds { addr: Address, len: usize, end: u64 },
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::OutOfBounds { addr, len, end } => write!(
                f,
                "read of {len} bytes at address {addr} is out of bounds (end of file: {end})"
            ),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over byte-addressed storage.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read_at` returns the last written content for every byte it covers
/// - `write_at` past the current end grows the store (gaps read back as zeros)
/// - `sync` makes all previous writes durable
pub trait Storage {
    /// Fill `buf` with the bytes stored at `addr`.
    ///
    /// Returns an error if any part of the range lies past the end of the store.
    fn read_at(&mut self, addr: Address, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write `bytes` at `addr`.
    ///
    /// The write may be buffered until `sync` is called.
    fn write_at(&mut self, addr: Address, bytes: &[u8]) -> Result<(), StorageError>;

    /// Sync all pending writes to durable storage.
    fn sync(&mut self) -> Result<(), StorageError>;

    /// Number of bytes currently stored.
    fn end_of_file(&self) -> u64;
}
