//! Metadata cache.
//!
//! The cache owns every decoded metadata block (tree headers and tree nodes)
//! keyed by file address. Callers never hold references into the cache:
//! `protect` moves an entry out to the caller, who owns it exclusively until
//! it is handed back with `unprotect`. An entry can be protected at most once
//! at a time.
//!
//! # Owners
//!
//! Every entry may name an owner (the address of another entry, e.g. the
//! tree header of a node). The cache counts the live entries per owner and
//! treats an owner with a non-zero count as pinned, so a header is never
//! evicted while any of its nodes is still cached.
//!
//! # Flush dependencies
//!
//! An entry that points at other entries (a tree header at its root, an
//! internal node at its children) lists them through
//! [`CacheEntry::flush_children`]. Each cached child keeps the address of the
//! entry that last claimed it as its flush parent, and `flush` never writes a
//! parent while one of its children is still dirty. A reader following a
//! freshly written pointer therefore always finds a written block.
//!
//! # Invariants
//!
//! - A slot's entry is absent exactly while it is protected
//! - `dependents[o]` equals the number of slots whose owner is `o`
//! - Dirty entries are only written by `flush`; deleted entries are never written
//! - A flush parent is always a cached address

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::ops::BitOr;

use tracing::{debug, warn};

use crate::storage::image::ImageError;
use crate::storage::io::{Address, Storage, StorageError};

/// The kinds of entry the cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    TreeHeader,
    InternalNode,
    LeafNode,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TreeHeader => write!(f, "tree header"),
            Self::InternalNode => write!(f, "internal node"),
            Self::LeafNode => write!(f, "leaf node"),
        }
    }
}

/// How a protected entry may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The entry will not be modified.
    Read,
    /// The entry may be modified and handed back dirty.
    Write,
}

/// Flags accepted by `unprotect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnprotectFlags(u8);

impl UnprotectFlags {
    pub const NONE: Self = Self(0);
    /// The entry was modified and must be written on the next flush.
    pub const DIRTIED: Self = Self(1);
    /// The entry is dropped from the cache without being written.
    pub const DELETED: Self = Self(1 << 1);
    /// Together with `DELETED`: the entry's file space is returned to the allocator.
    pub const FREE_SPACE: Self = Self(1 << 2);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for UnprotectFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Snapshot of one address's cache state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryStatus {
    pub in_cache: bool,
    pub pinned: bool,
    pub protected: bool,
    pub dirty: bool,
}

/// A decoded metadata block the cache can hold.
pub trait CacheEntry: Any {
    /// What kind of block this is.
    fn kind(&self) -> EntryKind;

    /// Address of the entry this one keeps pinned, if any.
    fn owner(&self) -> Option<Address> {
        None
    }

    /// Addresses of the entries this one points at.
    ///
    /// Those entries are written before this one.
    fn flush_children(&self) -> Vec<Address> {
        Vec::new()
    }

    /// Size of the on-disk image in bytes.
    fn image_len(&self) -> usize;

    /// Encode the entry into `image`, which is exactly `image_len()` bytes.
    fn serialize(&self, image: &mut [u8]) -> Result<(), ImageError>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Errors returned by the metadata cache.
#[derive(Debug)]
pub enum CacheError {
    /// An entry already lives at this address.
    AlreadyCached(Address),
    /// No entry lives at this address.
    NotCached(Address),
    /// The entry is already handed out.
    AlreadyProtected(Address),
    /// The entry is not handed out.
    NotProtected(Address),
    /// The entry is not pinned.
    NotPinned(Address),
    /// The cached entry has a different kind than requested.
    WrongKind {
        addr: Address,
        expected: EntryKind,
        found: EntryKind,
    },
    /// A read-protected entry was handed back dirty.
    ReadOnly(Address),
    /// The entry is pinned and cannot be removed.
    Pinned(Address),
    /// Flush was requested while an entry is handed out.
    FlushWhileProtected(Address),
    /// Dirty entries wait on each other's flush.
    FlushDependencyCycle(Address),
    /// An entry could not be encoded.
    Serialize { addr: Address, source: ImageError },
    /// Storage error.
    Storage(StorageError),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyCached(a) => write!(f, "entry at address {a} already cached"),
            Self::NotCached(a) => write!(f, "no cached entry at address {a}"),
            Self::AlreadyProtected(a) => write!(f, "entry at address {a} already protected"),
            Self::NotProtected(a) => write!(f, "entry at address {a} is not protected"),
            Self::NotPinned(a) => write!(f, "entry at address {a} is not pinned"),
            Self::WrongKind {
                addr,
                expected,
                found,
            } => write!(
                f,
                "entry at address {addr} is a {found}, expected a {expected}"
            ),
            Self::ReadOnly(a) => write!(f, "read-protected entry at address {a} dirtied"),
            Self::Pinned(a) => write!(f, "entry at address {a} is pinned"),
            Self::FlushWhileProtected(a) => {
                write!(f, "cannot flush while entry at address {a} is protected")
            }
            Self::FlushDependencyCycle(a) => {
                write!(f, "flush dependencies of entry at address {a} form a cycle")
            }
            Self::Serialize { addr, source } => {
                write!(f, "failed to encode entry at address {addr}: {source}")
            }
            Self::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serialize { source, .. } => Some(source),
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for CacheError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Counters describing cache activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Protects served from memory.
    pub hits: u64,
    /// Protects that had to read storage.
    pub misses: u64,
    /// Entries added with `insert_entry`.
    pub inserts: u64,
    /// Entries relocated with `move_entry`.
    pub moves: u64,
    /// Entry images written by `flush`.
    pub writes: u64,
    /// Dependency rounds run by `flush`.
    pub flush_rounds: u64,
    /// Entries dropped by `evict`.
    pub evictions: u64,
}

struct Slot {
    entry: Option<Box<dyn CacheEntry>>,
    kind: EntryKind,
    owner: Option<Address>,
    /// Entry that points at this one and is written after it.
    flush_parent: Option<Address>,
    dirty: bool,
    pins: u32,
    protection: Option<Access>,
}

/// Cache of decoded metadata blocks over a [`Storage`].
pub struct MetadataCache<S: Storage> {
    storage: S,
    slots: HashMap<Address, Slot>,
    dependents: HashMap<Address, u32>,
    stats: CacheStats,
}

impl<S: Storage> MetadataCache<S> {
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            slots: HashMap::new(),
            dependents: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub const fn storage(&self) -> &S {
        &self.storage
    }

    pub const fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Give up the cache and return the storage. Unflushed entries are lost.
    pub fn into_storage(self) -> S {
        self.storage
    }

    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached entries, protected ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of cached entries that name `owner` as their owner.
    #[must_use]
    pub fn dependents(&self, owner: Address) -> u32 {
        self.dependents.get(&owner).copied().unwrap_or(0)
    }

    /// Hand out the entry at `addr`, loading it with `load` on a miss.
    ///
    /// `len` is the size of the on-disk image `load` decodes.
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
        if let Some(slot) = self.slots.get_mut(&addr) {
            if slot.protection.is_some() {
                return Err(CacheError::AlreadyProtected(addr).into());
            }
            let wrong_kind = CacheError::WrongKind {
                addr,
                expected: kind,
                found: slot.kind,
            };
            let entry = slot.entry.take().ok_or(CacheError::NotCached(addr))?;
            if slot.kind != kind || !entry.as_any().is::<T>() {
                slot.entry = Some(entry);
                return Err(wrong_kind.into());
            }
            let entry = entry.into_any().downcast::<T>().map_err(|_| wrong_kind)?;
            slot.protection = Some(access);
            self.stats.hits += 1;
            return Ok(*entry);
        }

        self.stats.misses += 1;
        let mut image = vec![0u8; len];
        self.storage
            .read_at(addr, &mut image)
            .map_err(CacheError::Storage)?;
        let entry = load(&image)?;

        let owner = entry.owner();
        self.slots.insert(
            addr,
            Slot {
                entry: None,
                kind,
                owner,
                flush_parent: None,
                dirty: false,
                pins: 0,
                protection: Some(access),
            },
        );
        self.acquire_owner(owner);
        self.adopt_children(addr, &entry.flush_children());
        Ok(entry)
    }

    /// Hand a protected entry back.
    pub fn unprotect<T: CacheEntry>(
        &mut self,
        addr: Address,
        entry: T,
        flags: UnprotectFlags,
    ) -> Result<(), CacheError> {
        let slot = self
            .slots
            .get_mut(&addr)
            .ok_or(CacheError::NotCached(addr))?;
        let Some(access) = slot.protection else {
            return Err(CacheError::NotProtected(addr));
        };

        slot.protection = None;
        if flags.contains(UnprotectFlags::DIRTIED) && access == Access::Read {
            slot.entry = Some(Box::new(entry));
            return Err(CacheError::ReadOnly(addr));
        }

        if flags.contains(UnprotectFlags::DELETED) {
            if self.dependents(addr) > 0 {
                warn!(
                    addr,
                    dependents = self.dependents(addr),
                    "deleting cache entry that still owns entries"
                );
            }
            if let Some(slot) = self.slots.remove(&addr) {
                self.release_owner(slot.owner);
            }
            self.orphan_children(addr);
            return Ok(());
        }

        let dirtied = flags.contains(UnprotectFlags::DIRTIED);
        let children = if dirtied {
            entry.flush_children()
        } else {
            Vec::new()
        };
        slot.dirty |= dirtied;
        slot.entry = Some(Box::new(entry));
        self.adopt_children(addr, &children);
        Ok(())
    }

    /// Add a freshly created entry. It starts dirty and unprotected.
    pub fn insert_entry<T: CacheEntry>(&mut self, addr: Address, entry: T) -> Result<(), CacheError> {
        if self.slots.contains_key(&addr) {
            return Err(CacheError::AlreadyCached(addr));
        }
        let owner = entry.owner();
        let children = entry.flush_children();
        self.slots.insert(
            addr,
            Slot {
                kind: entry.kind(),
                entry: Some(Box::new(entry)),
                owner,
                flush_parent: None,
                dirty: true,
                pins: 0,
                protection: None,
            },
        );
        self.acquire_owner(owner);
        self.adopt_children(addr, &children);
        self.stats.inserts += 1;
        Ok(())
    }

    /// Drop an unprotected, unpinned entry without writing it.
    pub fn remove_entry(&mut self, addr: Address) -> Result<(), CacheError> {
        let status = self.status(addr);
        if !status.in_cache {
            return Err(CacheError::NotCached(addr));
        }
        if status.protected {
            return Err(CacheError::AlreadyProtected(addr));
        }
        if status.pinned {
            return Err(CacheError::Pinned(addr));
        }
        if let Some(slot) = self.slots.remove(&addr) {
            self.release_owner(slot.owner);
        }
        self.orphan_children(addr);
        Ok(())
    }

    /// Relocate the entry at `old` to `new`. Protected entries may be moved.
    ///
    /// The entry is dirtied so its image is written at the new address; the
    /// bytes at `old` are left untouched.
    pub fn move_entry(&mut self, old: Address, new: Address) -> Result<(), CacheError> {
        if self.slots.contains_key(&new) {
            return Err(CacheError::AlreadyCached(new));
        }
        let mut slot = self.slots.remove(&old).ok_or(CacheError::NotCached(old))?;
        slot.dirty = true;
        self.slots.insert(new, slot);
        for slot in self.slots.values_mut() {
            if slot.flush_parent == Some(old) {
                slot.flush_parent = Some(new);
            }
        }
        self.stats.moves += 1;
        Ok(())
    }

    /// Mark an entry dirty without handing it back.
    pub fn mark_dirty(&mut self, addr: Address) -> Result<(), CacheError> {
        let slot = self
            .slots
            .get_mut(&addr)
            .ok_or(CacheError::NotCached(addr))?;
        if slot.protection == Some(Access::Read) {
            return Err(CacheError::ReadOnly(addr));
        }
        slot.dirty = true;
        Ok(())
    }

    pub fn pin(&mut self, addr: Address) -> Result<(), CacheError> {
        let slot = self
            .slots
            .get_mut(&addr)
            .ok_or(CacheError::NotCached(addr))?;
        slot.pins += 1;
        Ok(())
    }

    pub fn unpin(&mut self, addr: Address) -> Result<(), CacheError> {
        let slot = self
            .slots
            .get_mut(&addr)
            .ok_or(CacheError::NotCached(addr))?;
        if slot.pins == 0 {
            return Err(CacheError::NotPinned(addr));
        }
        slot.pins -= 1;
        Ok(())
    }

    /// The entry `addr` is written before, if any.
    #[must_use]
    pub fn flush_parent(&self, addr: Address) -> Option<Address> {
        self.slots.get(&addr).and_then(|slot| slot.flush_parent)
    }

    #[must_use]
    pub fn status(&self, addr: Address) -> EntryStatus {
        self.slots
            .get(&addr)
            .map_or_else(EntryStatus::default, |slot| EntryStatus {
                in_cache: true,
                pinned: slot.pins > 0 || self.dependents(addr) > 0,
                protected: slot.protection.is_some(),
                dirty: slot.dirty,
            })
    }

    /// Write every dirty entry and sync the storage.
    ///
    /// Runs in rounds: a round writes every dirty entry none of whose
    /// children is still dirty, in address order.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        if let Some((&addr, _)) = self.slots.iter().find(|(_, s)| s.protection.is_some()) {
            return Err(CacheError::FlushWhileProtected(addr));
        }

        let mut pending: Vec<Address> = self
            .slots
            .iter()
            .filter(|(_, s)| s.dirty)
            .map(|(&addr, _)| addr)
            .collect();
        let mut rounds = 0u64;

        while !pending.is_empty() {
            let waiting: HashSet<Address> = pending
                .iter()
                .filter_map(|addr| self.flush_parent(*addr))
                .collect();
            let (mut ready, rest): (Vec<Address>, Vec<Address>) =
                pending.into_iter().partition(|addr| !waiting.contains(addr));
            if ready.is_empty() {
                let stuck = rest.iter().copied().min().unwrap_or_default();
                return Err(CacheError::FlushDependencyCycle(stuck));
            }
            ready.sort_unstable();
            for addr in ready {
                self.write_entry(addr)?;
            }
            pending = rest;
            rounds += 1;
        }

        self.stats.flush_rounds += rounds;
        if rounds > 1 {
            debug!(rounds, "cache flushed children before parents");
        }
        self.storage.sync()?;
        Ok(())
    }

    fn write_entry(&mut self, addr: Address) -> Result<(), CacheError> {
        let Some(slot) = self.slots.get_mut(&addr) else {
            return Ok(());
        };
        let Some(entry) = slot.entry.as_ref() else {
            return Ok(());
        };
        let mut image = vec![0u8; entry.image_len()];
        entry
            .serialize(&mut image)
            .map_err(|source| CacheError::Serialize { addr, source })?;
        self.storage.write_at(addr, &image)?;
        slot.dirty = false;
        self.stats.writes += 1;
        Ok(())
    }

    /// Flush, then drop every entry that is neither pinned nor protected.
    ///
    /// Returns the number of entries dropped.
    pub fn evict(&mut self) -> Result<usize, CacheError> {
        self.flush()?;

        let mut evicted = 0;
        loop {
            let victims: Vec<Address> = self
                .slots
                .iter()
                .filter(|(addr, s)| {
                    s.protection.is_none() && s.pins == 0 && self.dependents(**addr) == 0
                })
                .map(|(&addr, _)| addr)
                .collect();
            if victims.is_empty() {
                break;
            }
            for addr in victims {
                if let Some(slot) = self.slots.remove(&addr) {
                    self.release_owner(slot.owner);
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            let cached: HashSet<Address> = self.slots.keys().copied().collect();
            for slot in self.slots.values_mut() {
                if slot.flush_parent.is_some_and(|parent| !cached.contains(&parent)) {
                    slot.flush_parent = None;
                }
            }
        }

        self.stats.evictions += evicted as u64;
        debug!(evicted, remaining = self.slots.len(), "cache evicted");
        Ok(evicted)
    }

    fn adopt_children(&mut self, parent: Address, children: &[Address]) {
        for child in children {
            if let Some(slot) = self.slots.get_mut(child) {
                slot.flush_parent = Some(parent);
            }
        }
    }

    fn orphan_children(&mut self, parent: Address) {
        for slot in self.slots.values_mut() {
            if slot.flush_parent == Some(parent) {
                slot.flush_parent = None;
            }
        }
    }

    fn acquire_owner(&mut self, owner: Option<Address>) {
        if let Some(owner) = owner {
            *self.dependents.entry(owner).or_insert(0) += 1;
        }
    }

    fn release_owner(&mut self, owner: Option<Address>) {
        let Some(owner) = owner else {
            return;
        };
        if let Some(count) = self.dependents.get_mut(&owner) {
            *count -= 1;
            if *count == 0 {
                self.dependents.remove(&owner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedStorage;

    /// Minimal entry: four payload bytes, optionally owned.
    #[derive(Debug, PartialEq, Eq)]
    struct Blob {
        value: u32,
        owner: Option<Address>,
    }

    impl CacheEntry for Blob {
        fn kind(&self) -> EntryKind {
            if self.owner.is_some() {
                EntryKind::LeafNode
            } else {
                EntryKind::TreeHeader
            }
        }

        fn owner(&self) -> Option<Address> {
            self.owner
        }

        fn image_len(&self) -> usize {
            4
        }

        fn serialize(&self, image: &mut [u8]) -> Result<(), ImageError> {
            image.copy_from_slice(&self.value.to_le_bytes());
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    fn load_blob(image: &[u8]) -> Result<Blob, CacheError> {
        Ok(Blob {
            value: u32::from_le_bytes([image[0], image[1], image[2], image[3]]),
            owner: None,
        })
    }

    /// Entry that points at other cached entries.
    #[derive(Debug)]
    struct Links {
        value: u32,
        children: Vec<Address>,
    }

    impl CacheEntry for Links {
        fn kind(&self) -> EntryKind {
            EntryKind::InternalNode
        }

        fn flush_children(&self) -> Vec<Address> {
            self.children.clone()
        }

        fn image_len(&self) -> usize {
            4
        }

        fn serialize(&self, image: &mut [u8]) -> Result<(), ImageError> {
            image.copy_from_slice(&self.value.to_le_bytes());
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    fn load_links(image: &[u8]) -> Result<Links, CacheError> {
        Ok(Links {
            value: u32::from_le_bytes([image[0], image[1], image[2], image[3]]),
            children: Vec::new(),
        })
    }

    fn links(value: u32, children: &[Address]) -> Links {
        Links {
            value,
            children: children.to_vec(),
        }
    }

    fn new_cache() -> MetadataCache<SimulatedStorage> {
        MetadataCache::new(SimulatedStorage::new(1))
    }

    #[test]
    fn test_insert_protect_unprotect() {
        let mut cache = new_cache();
        cache
            .insert_entry(
                8,
                Blob {
                    value: 7,
                    owner: None,
                },
            )
            .expect("insert");
        assert!(cache.status(8).dirty);

        let blob: Blob = cache
            .protect(8, EntryKind::TreeHeader, 4, Access::Write, load_blob)
            .expect("protect");
        assert_eq!(blob.value, 7);
        assert!(cache.status(8).protected);

        // A second protect of the same address is refused
        let again: Result<Blob, CacheError> =
            cache.protect(8, EntryKind::TreeHeader, 4, Access::Read, load_blob);
        assert!(matches!(again, Err(CacheError::AlreadyProtected(8))));

        cache
            .unprotect(8, blob, UnprotectFlags::NONE)
            .expect("unprotect");
        assert!(!cache.status(8).protected);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_flush_and_reload() {
        let mut cache = new_cache();
        cache
            .insert_entry(
                16,
                Blob {
                    value: 0xABCD,
                    owner: None,
                },
            )
            .expect("insert");
        cache.flush().expect("flush");
        assert!(!cache.status(16).dirty);
        assert_eq!(cache.stats().writes, 1);

        assert_eq!(cache.evict().expect("evict"), 1);
        assert!(!cache.status(16).in_cache);

        let blob: Blob = cache
            .protect(16, EntryKind::TreeHeader, 4, Access::Read, load_blob)
            .expect("reload");
        assert_eq!(blob.value, 0xABCD);
        assert_eq!(cache.stats().misses, 1);
        cache
            .unprotect(16, blob, UnprotectFlags::NONE)
            .expect("unprotect");
    }

    #[test]
    fn test_read_protection_cannot_dirty() {
        let mut cache = new_cache();
        cache
            .insert_entry(
                0,
                Blob {
                    value: 1,
                    owner: None,
                },
            )
            .expect("insert");
        let blob: Blob = cache
            .protect(0, EntryKind::TreeHeader, 4, Access::Read, load_blob)
            .expect("protect");
        let result = cache.unprotect(0, blob, UnprotectFlags::DIRTIED);
        assert!(matches!(result, Err(CacheError::ReadOnly(0))));

        // The entry went back to the cache untouched
        assert!(cache.status(0).in_cache);
        assert!(!cache.status(0).protected);
    }

    #[test]
    fn test_wrong_kind() {
        let mut cache = new_cache();
        cache
            .insert_entry(
                0,
                Blob {
                    value: 1,
                    owner: None,
                },
            )
            .expect("insert");
        let result: Result<Blob, CacheError> =
            cache.protect(0, EntryKind::InternalNode, 4, Access::Read, load_blob);
        assert!(matches!(result, Err(CacheError::WrongKind { .. })));
        assert!(!cache.status(0).protected);
    }

    #[test]
    fn test_owner_pinned_by_dependents() {
        let mut cache = new_cache();
        cache
            .insert_entry(
                0,
                Blob {
                    value: 1,
                    owner: None,
                },
            )
            .expect("insert owner");
        cache
            .insert_entry(
                4,
                Blob {
                    value: 2,
                    owner: Some(0),
                },
            )
            .expect("insert dependent");

        assert_eq!(cache.dependents(0), 1);
        assert!(cache.status(0).pinned);
        assert!(matches!(cache.remove_entry(0), Err(CacheError::Pinned(0))));

        // Deleting the dependent releases the owner
        let blob: Blob = cache
            .protect(4, EntryKind::LeafNode, 4, Access::Write, load_blob)
            .expect("protect");
        cache
            .unprotect(4, blob, UnprotectFlags::DELETED)
            .expect("delete");
        assert_eq!(cache.dependents(0), 0);
        assert!(!cache.status(0).pinned);
        cache.remove_entry(0).expect("remove owner");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_respects_pins_and_owners() {
        let mut cache = new_cache();
        cache
            .insert_entry(
                0,
                Blob {
                    value: 1,
                    owner: None,
                },
            )
            .expect("insert owner");
        cache
            .insert_entry(
                4,
                Blob {
                    value: 2,
                    owner: Some(0),
                },
            )
            .expect("insert dependent");
        cache
            .insert_entry(
                8,
                Blob {
                    value: 3,
                    owner: None,
                },
            )
            .expect("insert pinned");
        cache.pin(8).expect("pin");

        // Dependent goes first, then its owner; the pinned entry stays
        assert_eq!(cache.evict().expect("evict"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.status(8).pinned);

        cache.unpin(8).expect("unpin");
        assert!(matches!(cache.unpin(8), Err(CacheError::NotPinned(8))));
        assert_eq!(cache.evict().expect("evict"), 1);
    }

    #[test]
    fn test_move_entry_leaves_old_bytes() {
        let mut cache = new_cache();
        cache
            .insert_entry(
                0,
                Blob {
                    value: 0x1111,
                    owner: None,
                },
            )
            .expect("insert");
        cache.flush().expect("flush");

        let mut blob: Blob = cache
            .protect(0, EntryKind::TreeHeader, 4, Access::Write, load_blob)
            .expect("protect");
        cache.move_entry(0, 32).expect("move");
        blob.value = 0x2222;
        cache
            .unprotect(32, blob, UnprotectFlags::DIRTIED)
            .expect("unprotect at new address");
        cache.flush().expect("flush");

        let bytes = cache.storage().bytes();
        assert_eq!(&bytes[0..4], &0x1111u32.to_le_bytes());
        assert_eq!(&bytes[32..36], &0x2222u32.to_le_bytes());
        assert_eq!(cache.stats().moves, 1);
    }

    #[test]
    fn test_flush_while_protected() {
        let mut cache = new_cache();
        cache
            .insert_entry(
                0,
                Blob {
                    value: 1,
                    owner: None,
                },
            )
            .expect("insert");
        let blob: Blob = cache
            .protect(0, EntryKind::TreeHeader, 4, Access::Read, load_blob)
            .expect("protect");
        assert!(matches!(
            cache.flush(),
            Err(CacheError::FlushWhileProtected(0))
        ));
        cache
            .unprotect(0, blob, UnprotectFlags::NONE)
            .expect("unprotect");
        cache.flush().expect("flush");
    }

    #[test]
    fn test_flush_writes_children_before_parents() {
        let mut cache = new_cache();
        cache.storage_mut().enable_write_log();

        // Parent chain laid out against address order: 0 -> 32 -> 64
        cache.insert_entry(64, links(3, &[])).expect("insert leaf");
        cache.insert_entry(96, links(4, &[])).expect("insert sibling");
        cache.insert_entry(32, links(2, &[64, 96])).expect("insert middle");
        cache.insert_entry(0, links(1, &[32])).expect("insert top");
        assert_eq!(cache.flush_parent(64), Some(32));
        assert_eq!(cache.flush_parent(32), Some(0));
        assert_eq!(cache.flush_parent(0), None);

        cache.flush().expect("flush");
        assert_eq!(cache.storage().write_log(), &[64, 96, 32, 0]);
        assert_eq!(cache.stats().flush_rounds, 3);
    }

    #[test]
    fn test_flush_order_follows_moved_child() {
        let mut cache = new_cache();
        cache.insert_entry(64, links(2, &[])).expect("insert child");
        cache.insert_entry(0, links(1, &[64])).expect("insert parent");
        cache.flush().expect("flush");

        // Shadow the child to a lower address, then repoint the parent
        let child: Links = cache
            .protect(64, EntryKind::InternalNode, 4, Access::Write, load_links)
            .expect("protect child");
        cache.move_entry(64, 16).expect("move");
        assert_eq!(cache.flush_parent(16), Some(0));
        cache
            .unprotect(16, child, UnprotectFlags::DIRTIED)
            .expect("unprotect child");

        let mut parent: Links = cache
            .protect(0, EntryKind::InternalNode, 4, Access::Write, load_links)
            .expect("protect parent");
        parent.children = vec![16];
        cache
            .unprotect(0, parent, UnprotectFlags::DIRTIED)
            .expect("unprotect parent");

        cache.storage_mut().enable_write_log();
        cache.flush().expect("flush");
        assert_eq!(cache.storage().write_log(), &[16, 0]);
    }

    #[test]
    fn test_clean_parent_does_not_hold_back_children() {
        let mut cache = new_cache();
        cache.insert_entry(64, links(2, &[])).expect("insert child");
        cache.insert_entry(0, links(1, &[64])).expect("insert parent");
        cache.flush().expect("flush");

        let mut child: Links = cache
            .protect(64, EntryKind::InternalNode, 4, Access::Write, load_links)
            .expect("protect child");
        child.value = 9;
        cache
            .unprotect(64, child, UnprotectFlags::DIRTIED)
            .expect("unprotect child");

        cache.storage_mut().enable_write_log();
        cache.flush().expect("flush");
        assert_eq!(cache.storage().write_log(), &[64]);
    }

    #[test]
    fn test_deleted_parent_releases_children() {
        let mut cache = new_cache();
        cache.insert_entry(64, links(2, &[])).expect("insert child");
        cache.insert_entry(0, links(1, &[64])).expect("insert parent");

        let parent: Links = cache
            .protect(0, EntryKind::InternalNode, 4, Access::Write, load_links)
            .expect("protect parent");
        cache
            .unprotect(0, parent, UnprotectFlags::DELETED)
            .expect("delete parent");
        assert_eq!(cache.flush_parent(64), None);

        cache.flush().expect("flush");
        assert_eq!(&cache.storage().bytes()[64..68], &2u32.to_le_bytes());
    }

    #[test]
    fn test_flush_dependency_cycle() {
        let mut cache = new_cache();
        cache.insert_entry(0, links(1, &[])).expect("insert first");
        cache.insert_entry(32, links(2, &[0])).expect("insert second");

        let first: Links = cache
            .protect(0, EntryKind::InternalNode, 4, Access::Write, load_links)
            .expect("protect first");
        let first = links(first.value, &[32]);
        cache
            .unprotect(0, first, UnprotectFlags::DIRTIED)
            .expect("unprotect first");

        assert!(matches!(
            cache.flush(),
            Err(CacheError::FlushDependencyCycle(0))
        ));
    }
}
