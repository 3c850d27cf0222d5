//! Errors returned by tree operations.

use crate::btree2::record::RecordError;
use crate::storage::{AllocError, CacheError, ImageError, IndexFileError, StorageError};

/// Errors returned by tree operations.
///
/// `DuplicateRecord`, `RecordNotFound` and `IndexOutOfRange` are ordinary
/// outcomes: they are detected before anything is changed. Every other
/// variant aborts the operation.
#[derive(Debug)]
pub enum BTreeError {
    /// File space could not be allocated or freed.
    AllocationFailed(AllocError),
    /// The metadata cache refused to hand out or take back a block.
    CacheProtectFailed(CacheError),
    /// A block's stored checksum does not match its contents.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// The header was written for a different record class.
    UnknownTreeClass { expected: u8, found: u8 },
    /// A record with the same key is already stored.
    DuplicateRecord,
    /// No record matches the query.
    RecordNotFound,
    /// A rank is past the end of the tree.
    IndexOutOfRange { index: u64, len: u64 },
    /// A record class callback failed.
    ComparatorOrCodecFailed(String),
    /// A node could not be split.
    CantSplit(String),
    /// Nodes could not be merged.
    CantMerge(String),
    /// Records could not be moved between siblings.
    CantRedistribute(String),
    /// Creation parameters do not describe a usable tree.
    InvalidParameters(String),
    /// A block decoded but describes an impossible tree.
    Corrupt(String),
    /// Storage error.
    Storage(StorageError),
    /// Metadata cache error outside of protect/unprotect.
    Cache(CacheError),
}

impl BTreeError {
    /// Whether the error left the tree untouched and the tree usable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DuplicateRecord | Self::RecordNotFound | Self::IndexOutOfRange { .. }
        )
    }
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllocationFailed(e) => write!(f, "allocation failed: {e}"),
            Self::CacheProtectFailed(e) => write!(f, "cache protect failed: {e}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            Self::UnknownTreeClass { expected, found } => {
                write!(f, "tree class {found} does not match expected class {expected}")
            }
            Self::DuplicateRecord => write!(f, "record already exists"),
            Self::RecordNotFound => write!(f, "record not found"),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for {len} records")
            }
            Self::ComparatorOrCodecFailed(msg) => write!(f, "record class failed: {msg}"),
            Self::CantSplit(msg) => write!(f, "unable to split node: {msg}"),
            Self::CantMerge(msg) => write!(f, "unable to merge nodes: {msg}"),
            Self::CantRedistribute(msg) => write!(f, "unable to redistribute records: {msg}"),
            Self::InvalidParameters(msg) => write!(f, "invalid tree parameters: {msg}"),
            Self::Corrupt(msg) => write!(f, "corrupt tree: {msg}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Cache(e) => write!(f, "cache error: {e}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AllocationFailed(e) => Some(e),
            Self::CacheProtectFailed(e) | Self::Cache(e) => Some(e),
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CacheError> for BTreeError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Storage(e) => Self::Storage(e),
            CacheError::AlreadyProtected(_)
            | CacheError::NotProtected(_)
            | CacheError::NotCached(_)
            | CacheError::WrongKind { .. }
            | CacheError::ReadOnly(_) => Self::CacheProtectFailed(e),
            _ => Self::Cache(e),
        }
    }
}

impl From<IndexFileError> for BTreeError {
    fn from(e: IndexFileError) -> Self {
        match e {
            IndexFileError::Storage(e) => Self::Storage(e),
            IndexFileError::Cache(e) => e.into(),
            IndexFileError::Alloc(e) => Self::AllocationFailed(e),
            IndexFileError::Superblock(e) => Self::Corrupt(e.to_string()),
            IndexFileError::InvalidOptions(msg) => Self::InvalidParameters(msg),
        }
    }
}

impl From<ImageError> for BTreeError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::ChecksumMismatch { expected, actual } => {
                Self::ChecksumMismatch { expected, actual }
            }
            ImageError::Codec(msg) => Self::ComparatorOrCodecFailed(msg),
            other => Self::Corrupt(other.to_string()),
        }
    }
}

impl From<RecordError> for BTreeError {
    fn from(e: RecordError) -> Self {
        Self::ComparatorOrCodecFailed(e.to_string())
    }
}

impl From<AllocError> for BTreeError {
    fn from(e: AllocError) -> Self {
        Self::AllocationFailed(e)
    }
}

impl From<StorageError> for BTreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}
