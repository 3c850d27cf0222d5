//! Index file: storage, superblock, allocator and metadata cache in one place.
//!
//! An `IndexFile` is what tree handles operate on. It owns the storage (through
//! the metadata cache), allocates and frees file space, and persists the
//! superblock on every flush.

use tracing::{debug, info};

use crate::storage::allocator::{AllocError, BlockAllocator};
use crate::storage::cache::{
    Access, CacheEntry, CacheError, CacheStats, EntryKind, EntryStatus, MetadataCache,
    UnprotectFlags,
};
use crate::storage::io::{Address, Storage, StorageError};
use crate::storage::superblock::{SUPERBLOCK_SIZE, Superblock, SuperblockError};

/// Options for creating or opening an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOptions {
    /// Bytes used to encode a file address (ignored on open).
    pub address_width: u8,
    /// Bytes used to encode a file length (ignored on open).
    pub length_width: u8,
    /// Relocate nodes instead of overwriting them in place.
    pub swmr_write: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            address_width: 8,
            length_width: 8,
            swmr_write: false,
        }
    }
}

/// Errors returned by index file operations.
#[derive(Debug)]
pub enum IndexFileError {
    /// Storage error.
    Storage(StorageError),
    /// Superblock error.
    Superblock(SuperblockError),
    /// Metadata cache error.
    Cache(CacheError),
    /// File space allocation error.
    Alloc(AllocError),
    /// The creation options are not usable.
    InvalidOptions(String),
}

impl std::fmt::Display for IndexFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Superblock(e) => write!(f, "superblock error: {e}"),
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::Alloc(e) => write!(f, "allocation error: {e}"),
            Self::InvalidOptions(msg) => write!(f, "invalid file options: {msg}"),
        }
    }
}

impl std::error::Error for IndexFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Superblock(e) => Some(e),
            Self::Cache(e) => Some(e),
            Self::Alloc(e) => Some(e),
            Self::InvalidOptions(_) => None,
        }
    }
}

impl From<StorageError> for IndexFileError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<SuperblockError> for IndexFileError {
    fn from(e: SuperblockError) -> Self {
        Self::Superblock(e)
    }
}

impl From<CacheError> for IndexFileError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<AllocError> for IndexFileError {
    fn from(e: AllocError) -> Self {
        Self::Alloc(e)
    }
}

/// An open index file.
pub struct IndexFile<S: Storage> {
    cache: MetadataCache<S>,
    allocator: BlockAllocator,
    superblock: Superblock,
    swmr_write: bool,
}

impl<S: Storage> IndexFile<S> {
    /// Initialize a new index file on empty storage.
    pub fn create(storage: S, options: FileOptions) -> Result<Self, IndexFileError> {
        for width in [options.address_width, options.length_width] {
            if !(2..=8).contains(&width) {
                return Err(IndexFileError::InvalidOptions(format!(
                    "width {width} outside 2..=8"
                )));
            }
        }

        let mut file = Self {
            cache: MetadataCache::new(storage),
            allocator: BlockAllocator::new(SUPERBLOCK_SIZE as u64),
            superblock: Superblock::new(options.address_width, options.length_width),
            swmr_write: options.swmr_write,
        };
        file.write_superblock()?;
        file.cache.storage_mut().sync()?;

        info!(
            address_width = options.address_width,
            length_width = options.length_width,
            swmr_write = options.swmr_write,
            "index file created"
        );
        Ok(file)
    }

    /// Open an existing index file.
    pub fn open(mut storage: S, swmr_write: bool) -> Result<Self, IndexFileError> {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        storage.read_at(0, &mut buf)?;
        let superblock = Superblock::from_bytes(&buf)?;

        info!(
            end_of_allocation = superblock.end_of_allocation,
            swmr_write, "index file opened"
        );
        Ok(Self {
            cache: MetadataCache::new(storage),
            allocator: BlockAllocator::resume(SUPERBLOCK_SIZE as u64, superblock.end_of_allocation),
            superblock,
            swmr_write,
        })
    }

    #[must_use]
    pub const fn address_width(&self) -> u8 {
        self.superblock.address_width
    }

    #[must_use]
    pub const fn length_width(&self) -> u8 {
        self.superblock.length_width
    }

    #[must_use]
    pub const fn swmr_write(&self) -> bool {
        self.swmr_write
    }

    #[must_use]
    pub const fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Address of the object a tool should open by default.
    #[must_use]
    pub const fn root_object(&self) -> Address {
        self.superblock.root_object
    }

    /// Record the default object; persisted on the next flush.
    pub const fn set_root_object(&mut self, addr: Address) {
        self.superblock.root_object = addr;
    }

    #[must_use]
    pub const fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    #[must_use]
    pub const fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        self.cache.storage()
    }

    pub const fn storage_mut(&mut self) -> &mut S {
        self.cache.storage_mut()
    }

    pub fn allocate(&mut self, size: usize) -> Result<Address, AllocError> {
        self.allocator.allocate(size as u64)
    }

    pub fn free(&mut self, addr: Address, size: usize) -> Result<(), AllocError> {
        self.allocator.free(addr, size as u64)
    }

    pub fn protect<T, E, F>(
        &mut self,
        addr: Address,
        kind: EntryKind,
        len: usize,
        access: Access,
        load: F,
    ) -> Result<T, E>
    where
        T: CacheEntry,
        E: From<CacheError>,
        F: FnOnce(&[u8]) -> Result<T, E>,
    {
        self.cache.protect(addr, kind, len, access, load)
    }

    /// Hand an entry back to the cache.
    ///
    /// With `DELETED | FREE_SPACE` the entry's file space is also freed.
    pub fn unprotect<T: CacheEntry>(
        &mut self,
        addr: Address,
        entry: T,
        flags: UnprotectFlags,
    ) -> Result<(), IndexFileError> {
        let len = entry.image_len();
        self.cache.unprotect(addr, entry, flags)?;
        if flags.contains(UnprotectFlags::DELETED | UnprotectFlags::FREE_SPACE) {
            self.allocator.free(addr, len as u64)?;
        }
        Ok(())
    }

    pub fn insert_entry<T: CacheEntry>(&mut self, addr: Address, entry: T) -> Result<(), CacheError> {
        self.cache.insert_entry(addr, entry)
    }

    pub fn remove_entry(&mut self, addr: Address) -> Result<(), CacheError> {
        self.cache.remove_entry(addr)
    }

    pub fn move_entry(&mut self, old: Address, new: Address) -> Result<(), CacheError> {
        self.cache.move_entry(old, new)
    }

    pub fn mark_dirty(&mut self, addr: Address) -> Result<(), CacheError> {
        self.cache.mark_dirty(addr)
    }

    pub fn pin(&mut self, addr: Address) -> Result<(), CacheError> {
        self.cache.pin(addr)
    }

    pub fn unpin(&mut self, addr: Address) -> Result<(), CacheError> {
        self.cache.unpin(addr)
    }

    #[must_use]
    pub fn status(&self, addr: Address) -> EntryStatus {
        self.cache.status(addr)
    }

    /// Number of cached entries owned by the entry at `owner`.
    #[must_use]
    pub fn dependents(&self, owner: Address) -> u32 {
        self.cache.dependents(owner)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Write every dirty entry and the superblock, then sync.
    pub fn flush(&mut self) -> Result<(), IndexFileError> {
        self.cache.flush()?;
        self.write_superblock()?;
        self.cache.storage_mut().sync()?;
        debug!(
            end_of_allocation = self.superblock.end_of_allocation,
            "index file flushed"
        );
        Ok(())
    }

    /// Flush, then drop every cache entry that is not pinned.
    pub fn evict(&mut self) -> Result<usize, IndexFileError> {
        self.flush()?;
        Ok(self.cache.evict()?)
    }

    /// Read bytes straight from storage, bypassing the cache.
    ///
    /// This is the view a second process reading the file would have.
    pub fn read_raw(&mut self, addr: Address, len: usize) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0u8; len];
        self.cache.storage_mut().read_at(addr, &mut buf)?;
        Ok(buf)
    }

    /// Flush and give back the storage.
    pub fn close(mut self) -> Result<S, IndexFileError> {
        self.flush()?;
        info!(
            end_of_allocation = self.superblock.end_of_allocation,
            "index file closed"
        );
        Ok(self.cache.into_storage())
    }

    fn write_superblock(&mut self) -> Result<(), StorageError> {
        self.superblock.end_of_allocation = self.allocator.end_of_allocation();
        let bytes = self.superblock.to_bytes();
        self.cache.storage_mut().write_at(0, &bytes)
    }
}
