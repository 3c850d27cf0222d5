//! Index file storage.
//!
//! A single file holds any number of trees. Everything in it is a
//! checksummed metadata block at a byte address:
//!
//! - Address 0: Superblock (encoding widths, end of allocated space)
//! - Everything else: tree headers and tree nodes, placed by the block allocator
//!
//! Tree code never touches the storage directly. It protects and unprotects
//! blocks through the metadata cache of an [`IndexFile`].
//!
//! # Usage
//!
//! ```ignore
//! use engine::storage::{FileOptions, FileStorage, IndexFile};
//!
//! let storage = FileStorage::create(path)?;
//! let mut file = IndexFile::create(storage, FileOptions::default())?;
//! let addr = file.allocate(512)?;
//! file.flush()?;
//! ```

pub mod allocator;
pub mod cache;
pub mod file;
pub mod image;
pub mod index_file;
pub mod io;
pub mod superblock;

pub use allocator::{AllocError, BlockAllocator};
pub use cache::{
    Access, CacheEntry, CacheError, CacheStats, EntryKind, EntryStatus, MetadataCache,
    UnprotectFlags,
};
pub use file::{FileError, FileStorage};
pub use image::{ImageError, ImageReader, ImageWriter};
pub use index_file::{FileOptions, IndexFile, IndexFileError};
pub use io::{Address, Storage, StorageError, UNDEFINED_ADDRESS, address_defined};
pub use superblock::{Superblock, SuperblockError};
