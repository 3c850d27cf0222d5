//! Block allocator handing out byte ranges of the file.
//!
//! Space is carved from a sorted list of free extents (first fit) and, when no
//! extent is large enough, from the end of the allocated region. Freed ranges
//! are coalesced with their neighbours; a free range that reaches the end of
//! the allocated region shrinks it instead of being listed.
//!
//! # Invariants
//!
//! - Free extents never overlap and never touch (adjacent extents are merged)
//! - Every free extent lies below `end_of_allocation`
//! - No free extent ends exactly at `end_of_allocation`

use std::collections::BTreeMap;

use crate::storage::io::Address;

/// Errors returned by the block allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// A zero-byte block was requested.
    ZeroSize,
    /// The address space cannot grow any further.
    Exhausted { requested: u64 },
    /// The range being freed was never allocated or is already free.
    InvalidFree { addr: Address, size: u64 },
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "zero-sized allocation"),
            Self::Exhausted { requested } => {
                write!(f, "address space exhausted allocating {requested} bytes")
            }
            Self::InvalidFree { addr, size } => {
                write!(f, "invalid free of {size} bytes at address {addr}")
            }
        }
    }
}

impl std::error::Error for AllocError {}

/// Free-extent allocator for file space.
#[derive(Debug)]
pub struct BlockAllocator {
    /// Free extents: start address -> length.
    free: BTreeMap<Address, u64>,
    /// First byte past all allocated space.
    end_of_allocation: Address,
    /// Lowest address this allocator may hand out.
    base: Address,
}

impl BlockAllocator {
    /// Create an allocator for a fresh file whose first `base` bytes are reserved.
    #[must_use]
    pub const fn new(base: Address) -> Self {
        Self {
            free: BTreeMap::new(),
            end_of_allocation: base,
            base,
        }
    }

    /// Resume allocating in an existing file.
    ///
    /// Free extents are not persisted; space freed before the file was
    /// closed is not reused.
    #[must_use]
    pub fn resume(base: Address, end_of_allocation: Address) -> Self {
        Self {
            free: BTreeMap::new(),
            end_of_allocation: end_of_allocation.max(base),
            base,
        }
    }

    /// First byte past all allocated space.
    #[must_use]
    pub const fn end_of_allocation(&self) -> Address {
        self.end_of_allocation
    }

    /// Total bytes sitting in free extents.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    /// Number of free extents.
    #[must_use]
    pub fn free_extent_count(&self) -> usize {
        self.free.len()
    }

    /// Allocate `size` bytes.
    ///
    /// # Post-conditions
    /// - The returned range `[addr, addr + size)` overlaps no other live allocation
    pub fn allocate(&mut self, size: u64) -> Result<Address, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let fit = self
            .free
            .iter()
            .find(|&(_, &len)| len >= size)
            .map(|(&start, &len)| (start, len));

        if let Some((start, len)) = fit {
            self.free.remove(&start);
            if len > size {
                self.free.insert(start + size, len - size);
            }
            return Ok(start);
        }

        let addr = self.end_of_allocation;
        let end = addr
            .checked_add(size)
            .filter(|&end| end < u64::MAX)
            .ok_or(AllocError::Exhausted { requested: size })?;
        self.end_of_allocation = end;
        Ok(addr)
    }

    /// Return `[addr, addr + size)` to the allocator.
    pub fn free(&mut self, addr: Address, size: u64) -> Result<(), AllocError> {
        let invalid = AllocError::InvalidFree { addr, size };
        if size == 0 || addr < self.base {
            return Err(invalid);
        }
        let end = match addr.checked_add(size) {
            Some(end) if end <= self.end_of_allocation => end,
            _ => return Err(invalid),
        };

        // Reject overlap with the neighbouring free extents.
        let prev = self
            .free
            .range(..=addr)
            .next_back()
            .map(|(&s, &l)| (s, l));
        let next = self.free.range(addr..).next().map(|(&s, &l)| (s, l));
        if prev.is_some_and(|(start, len)| start + len > addr)
            || next.is_some_and(|(start, _)| start < end)
        {
            return Err(invalid);
        }

        let mut start = addr;
        let mut len = size;
        if let Some((prev_start, prev_len)) = prev.filter(|&(s, l)| s + l == addr) {
            self.free.remove(&prev_start);
            start = prev_start;
            len += prev_len;
        }
        if let Some((next_start, next_len)) = next.filter(|&(s, _)| s == end) {
            self.free.remove(&next_start);
            len += next_len;
        }

        if start + len == self.end_of_allocation {
            self.end_of_allocation = start;
        } else {
            self.free.insert(start, len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_grows_from_base() {
        let mut alloc = BlockAllocator::new(64);
        assert_eq!(alloc.allocate(100).expect("alloc"), 64);
        assert_eq!(alloc.allocate(50).expect("alloc"), 164);
        assert_eq!(alloc.end_of_allocation(), 214);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut alloc = BlockAllocator::new(0);
        assert_eq!(alloc.allocate(0), Err(AllocError::ZeroSize));
    }

    #[test]
    fn test_free_and_reuse() {
        let mut alloc = BlockAllocator::new(0);
        let a = alloc.allocate(128).expect("a");
        let b = alloc.allocate(128).expect("b");
        let _c = alloc.allocate(128).expect("c");

        alloc.free(b, 128).expect("free b");
        assert_eq!(alloc.free_bytes(), 128);

        // First fit reuses the hole
        assert_eq!(alloc.allocate(64).expect("reuse"), b);
        assert_eq!(alloc.free_bytes(), 64);

        alloc.free(a, 128).expect("free a");
        assert_eq!(alloc.free_extent_count(), 2);
    }

    #[test]
    fn test_coalescing() {
        let mut alloc = BlockAllocator::new(0);
        let a = alloc.allocate(100).expect("a");
        let b = alloc.allocate(100).expect("b");
        let c = alloc.allocate(100).expect("c");
        let _d = alloc.allocate(100).expect("d");

        alloc.free(a, 100).expect("free a");
        alloc.free(c, 100).expect("free c");
        assert_eq!(alloc.free_extent_count(), 2);

        alloc.free(b, 100).expect("free b");
        assert_eq!(alloc.free_extent_count(), 1);
        assert_eq!(alloc.free_bytes(), 300);
        assert_eq!(alloc.allocate(300).expect("whole"), a);
    }

    #[test]
    fn test_free_at_end_shrinks() {
        let mut alloc = BlockAllocator::new(0);
        let a = alloc.allocate(100).expect("a");
        let b = alloc.allocate(100).expect("b");

        alloc.free(b, 100).expect("free b");
        assert_eq!(alloc.end_of_allocation(), 100);
        assert_eq!(alloc.free_extent_count(), 0);

        alloc.free(a, 100).expect("free a");
        assert_eq!(alloc.end_of_allocation(), 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let mut alloc = BlockAllocator::new(0);
        let a = alloc.allocate(100).expect("a");
        let _b = alloc.allocate(100).expect("b");

        alloc.free(a, 100).expect("free a");
        assert!(matches!(
            alloc.free(a, 100),
            Err(AllocError::InvalidFree { .. })
        ));
        assert!(matches!(
            alloc.free(a + 50, 10),
            Err(AllocError::InvalidFree { .. })
        ));
        assert!(matches!(
            alloc.free(500, 10),
            Err(AllocError::InvalidFree { .. })
        ));
    }

    #[test]
    fn test_resume_keeps_end() {
        let mut alloc = BlockAllocator::resume(64, 4096);
        assert_eq!(alloc.allocate(16).expect("alloc"), 4096);
    }
}
