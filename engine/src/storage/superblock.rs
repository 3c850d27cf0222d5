//! Superblock structure and serialization.
//!
//! The superblock occupies the first `SUPERBLOCK_SIZE` bytes of the file and
//! records how the rest of the file is encoded.

use crate::storage::image::{self, ImageError};
use crate::storage::io::{Address, UNDEFINED_ADDRESS};

/// Magic number identifying an index file: "ENSOBT2F"
pub const MAGIC: [u8; 8] = *b"ENSOBT2F";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Bytes reserved for the superblock at address 0.
pub const SUPERBLOCK_SIZE: usize = 64;

/// Superblock field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const ADDRESS_WIDTH: usize = 12;
    pub const LENGTH_WIDTH: usize = 13;
    // 14-15: reserved
    pub const END_OF_ALLOCATION: usize = 16;
    pub const ROOT_OBJECT: usize = 24;
    pub const CHECKSUM: usize = 32;
    // 36-63: reserved
}

/// The superblock contains all metadata about the index file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version number.
    pub format_version: u32,
    /// Bytes used to encode a file address.
    pub address_width: u8,
    /// Bytes used to encode a file length or record count.
    pub length_width: u8,
    /// First byte past all allocated space.
    pub end_of_allocation: Address,
    /// Address of the tree header a tool should open by default.
    pub root_object: Address,
}

impl Superblock {
    /// Create a superblock for a fresh file.
    #[must_use]
    pub const fn new(address_width: u8, length_width: u8) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            address_width,
            length_width,
            end_of_allocation: SUPERBLOCK_SIZE as u64,
            root_object: UNDEFINED_ADDRESS,
        }
    }

    /// Serialize the superblock.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        buf[offsets::MAGIC..offsets::MAGIC + 8].copy_from_slice(&MAGIC);
        buf[offsets::FORMAT_VERSION..offsets::FORMAT_VERSION + 4]
            .copy_from_slice(&self.format_version.to_le_bytes());
        buf[offsets::ADDRESS_WIDTH] = self.address_width;
        buf[offsets::LENGTH_WIDTH] = self.length_width;
        buf[offsets::END_OF_ALLOCATION..offsets::END_OF_ALLOCATION + 8]
            .copy_from_slice(&self.end_of_allocation.to_le_bytes());
        buf[offsets::ROOT_OBJECT..offsets::ROOT_OBJECT + 8]
            .copy_from_slice(&self.root_object.to_le_bytes());
        let checksum = image::compute_checksum(&buf[..offsets::CHECKSUM]);
        buf[offsets::CHECKSUM..offsets::CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Deserialize a superblock.
    pub fn from_bytes(buf: &[u8; SUPERBLOCK_SIZE]) -> Result<Self, SuperblockError> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[offsets::MAGIC..offsets::MAGIC + 8]);
        if magic != MAGIC {
            return Err(SuperblockError::InvalidMagic(magic));
        }

        image::verify_image(buf, offsets::CHECKSUM).map_err(SuperblockError::Image)?;

        let format_version = read_u32(buf, offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }

        let address_width = buf[offsets::ADDRESS_WIDTH];
        let length_width = buf[offsets::LENGTH_WIDTH];
        for width in [address_width, length_width] {
            if !(2..=8).contains(&width) {
                return Err(SuperblockError::InvalidWidth(width));
            }
        }

        Ok(Self {
            format_version,
            address_width,
            length_width,
            end_of_allocation: read_u64(buf, offsets::END_OF_ALLOCATION),
            root_object: read_u64(buf, offsets::ROOT_OBJECT),
        })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Errors that can occur when reading a superblock.
#[derive(Debug)]
pub enum SuperblockError {
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Address or length width outside 2..=8.
    InvalidWidth(u8),
    /// Checksum or layout problem.
    Image(ImageError),
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(
                    f,
                    "invalid magic number: {:?}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidWidth(w) => write!(f, "invalid encoding width: {w}"),
            Self::Image(e) => write!(f, "superblock image: {e}"),
        }
    }
}

impl std::error::Error for SuperblockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(e) => Some(e),
            _ => None,
        }
    }
}
