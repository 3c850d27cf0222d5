//! On-disk image encoding helpers.
//!
//! Every metadata block (superblock, tree header, tree nodes) is written as a
//! little-endian image with a trailing CRC32 over all preceding bytes.
//! `ImageWriter` and `ImageReader` are cursors over such an image.
//!
//! Addresses and lengths are written with a per-file width (2..=8 bytes).
//! Record counts inside tree nodes use the smallest width that can hold the
//! largest count possible at that depth (see [`encoded_width`]).

// Widths are always <= 8, so shifting and narrowing casts are bounded.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::io::{Address, UNDEFINED_ADDRESS};

/// Size of the trailing checksum in bytes.
pub const CHECKSUM_SIZE: usize = 4;

/// Compute the CRC32 checksum of an image prefix.
#[must_use]
pub fn compute_checksum(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Number of bytes needed to encode any value in `0..=max`.
///
/// Always at least 1.
#[must_use]
pub const fn encoded_width(max: u64) -> u8 {
    if max == 0 {
        1
    } else {
        ((63 - max.leading_zeros()) / 8 + 1) as u8
    }
}

/// Largest value representable in `width` bytes.
#[must_use]
pub fn max_for_width(width: u8) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (u32::from(width) * 8)) - 1
    }
}

/// Errors related to image encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// The image ended before a field could be read or written.
    Truncated { needed: usize, available: usize },
    /// The block signature does not match.
    BadMagic { expected: [u8; 4], found: [u8; 4] },
    /// Unsupported format version.
    BadVersion { expected: u8, found: u8 },
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// A value does not fit in the width chosen for it.
    ValueTooWide { value: u64, width: u8 },
    /// A record could not be encoded or decoded by its class.
    Codec(String),
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "image truncated: needed {needed} bytes, {available} available")
            }
            Self::BadMagic { expected, found } => write!(
                f,
                "bad signature: expected {:?}, found {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(found)
            ),
            Self::BadVersion { expected, found } => {
                write!(f, "unsupported version {found} (expected {expected})")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            Self::ValueTooWide { value, width } => {
                write!(f, "value {value} does not fit in {width} bytes")
            }
            Self::Codec(msg) => write!(f, "record codec error: {msg}"),
        }
    }
}

impl std::error::Error for ImageError {}

/// Write cursor over an image buffer.
pub struct ImageWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ImageWriter<'a> {
    /// Start writing at the beginning of `buf`.
    pub const fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current write offset.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    fn reserve(&mut self, len: usize) -> Result<&mut [u8], ImageError> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(ImageError::Truncated {
                needed: end,
                available: self.buf.len(),
            });
        }
        let slot = &mut self.buf[self.pos..end];
        self.pos = end;
        Ok(slot)
    }

    /// Write raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), ImageError> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Hand out the next `len` bytes for a caller-side encoder.
    pub fn slot(&mut self, len: usize) -> Result<&mut [u8], ImageError> {
        self.reserve(len)
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), ImageError> {
        self.put_bytes(&[value])
    }

    pub fn put_u16(&mut self, value: u16) -> Result<(), ImageError> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), ImageError> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Write `value` in exactly `width` little-endian bytes.
    pub fn put_uint(&mut self, value: u64, width: u8) -> Result<(), ImageError> {
        if value > max_for_width(width) {
            return Err(ImageError::ValueTooWide { value, width });
        }
        let bytes = value.to_le_bytes();
        self.put_bytes(&bytes[..usize::from(width)])
    }

    /// Write a file address; the undefined address is all `0xFF` bytes.
    pub fn put_address(&mut self, addr: Address, width: u8) -> Result<(), ImageError> {
        if addr == UNDEFINED_ADDRESS {
            let slot = self.reserve(usize::from(width))?;
            slot.fill(0xFF);
            return Ok(());
        }
        if addr >= max_for_width(width) {
            return Err(ImageError::ValueTooWide { value: addr, width });
        }
        self.put_uint(addr, width)
    }

    /// Append the checksum of everything written so far.
    pub fn put_checksum(&mut self) -> Result<(), ImageError> {
        let checksum = compute_checksum(&self.buf[..self.pos]);
        self.put_u32(checksum)
    }
}

/// Read cursor over an image.
pub struct ImageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ImageReader<'a> {
    /// Start reading at the beginning of `data`.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current read offset.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Read the next `len` bytes.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], ImageError> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(ImageError::Truncated {
                needed: end,
                available: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, ImageError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ImageError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, ImageError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a `width`-byte little-endian unsigned value.
    pub fn uint(&mut self, width: u8) -> Result<u64, ImageError> {
        let b = self.bytes(usize::from(width))?;
        let mut raw = [0u8; 8];
        raw[..b.len()].copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a file address written by [`ImageWriter::put_address`].
    pub fn address(&mut self, width: u8) -> Result<Address, ImageError> {
        let value = self.uint(width)?;
        if value == max_for_width(width) {
            Ok(UNDEFINED_ADDRESS)
        } else {
            Ok(value)
        }
    }

    /// Check a four-byte block signature.
    pub fn expect_magic(&mut self, expected: [u8; 4]) -> Result<(), ImageError> {
        let b = self.bytes(4)?;
        let found = [b[0], b[1], b[2], b[3]];
        if found != expected {
            return Err(ImageError::BadMagic { expected, found });
        }
        Ok(())
    }

    /// Check a one-byte format version.
    pub fn expect_version(&mut self, expected: u8) -> Result<(), ImageError> {
        let found = self.u8()?;
        if found != expected {
            return Err(ImageError::BadVersion { expected, found });
        }
        Ok(())
    }

    /// Verify the checksum stored at the cursor against all preceding bytes.
    pub fn verify_checksum(&mut self) -> Result<(), ImageError> {
        let actual = compute_checksum(&self.data[..self.pos]);
        let expected = self.u32()?;
        if expected != actual {
            return Err(ImageError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }
}

/// Verify an image's checksum before decoding any field.
///
/// `checksum_offset` is where the checksum starts; everything before it is
/// covered.
pub fn verify_image(data: &[u8], checksum_offset: usize) -> Result<(), ImageError> {
    let mut reader = ImageReader::new(data);
    reader.bytes(checksum_offset)?;
    reader.verify_checksum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_width() {
        assert_eq!(encoded_width(0), 1);
        assert_eq!(encoded_width(1), 1);
        assert_eq!(encoded_width(255), 1);
        assert_eq!(encoded_width(256), 2);
        assert_eq!(encoded_width(65_535), 2);
        assert_eq!(encoded_width(65_536), 3);
        assert_eq!(encoded_width(u64::MAX), 8);
    }

    #[test]
    fn test_max_for_width() {
        assert_eq!(max_for_width(1), 255);
        assert_eq!(max_for_width(2), 65_535);
        assert_eq!(max_for_width(4), u64::from(u32::MAX));
        assert_eq!(max_for_width(8), u64::MAX);
        for width in 1..8 {
            assert_eq!(encoded_width(max_for_width(width)), width);
        }
    }

    #[test]
    fn test_writer_reader_fields() {
        let mut buf = [0u8; 32];
        let mut w = ImageWriter::new(&mut buf);
        w.put_bytes(b"TEST").expect("magic");
        w.put_u8(7).expect("u8");
        w.put_u16(0x1234).expect("u16");
        w.put_u32(0xDEAD_BEEF).expect("u32");
        w.put_uint(0x01_0203, 3).expect("uint");
        w.put_address(UNDEFINED_ADDRESS, 4).expect("undef");
        w.put_address(4096, 4).expect("addr");
        w.put_checksum().expect("checksum");
        let end = w.position();

        let mut r = ImageReader::new(&buf[..end]);
        r.expect_magic(*b"TEST").expect("magic");
        assert_eq!(r.u8().expect("u8"), 7);
        assert_eq!(r.u16().expect("u16"), 0x1234);
        assert_eq!(r.u32().expect("u32"), 0xDEAD_BEEF);
        assert_eq!(r.uint(3).expect("uint"), 0x01_0203);
        assert_eq!(r.address(4).expect("undef"), UNDEFINED_ADDRESS);
        assert_eq!(r.address(4).expect("addr"), 4096);
        r.verify_checksum().expect("checksum");
    }

    #[test]
    fn test_value_too_wide() {
        let mut buf = [0u8; 8];
        let mut w = ImageWriter::new(&mut buf);
        assert_eq!(
            w.put_uint(256, 1),
            Err(ImageError::ValueTooWide {
                value: 256,
                width: 1
            })
        );
    }

    #[test]
    fn test_truncated() {
        let mut buf = [0u8; 2];
        let mut w = ImageWriter::new(&mut buf);
        assert!(matches!(w.put_u32(1), Err(ImageError::Truncated { .. })));

        let mut r = ImageReader::new(&buf);
        assert!(matches!(r.u32(), Err(ImageError::Truncated { .. })));
    }

    #[test]
    fn test_checksum_detects_bit_flip() {
        let mut buf = [0u8; 12];
        let mut w = ImageWriter::new(&mut buf);
        w.put_bytes(b"ABCDEFGH").expect("bytes");
        w.put_checksum().expect("checksum");

        verify_image(&buf, 8).expect("clean image verifies");

        buf[3] ^= 0x10;
        assert!(matches!(
            verify_image(&buf, 8),
            Err(ImageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let buf = *b"XXXX\x02";
        let mut r = ImageReader::new(&buf);
        assert!(matches!(
            r.expect_magic(*b"BTLF"),
            Err(ImageError::BadMagic { .. })
        ));
        let mut r = ImageReader::new(&buf[4..]);
        assert_eq!(
            r.expect_version(0),
            Err(ImageError::BadVersion {
                expected: 0,
                found: 2
            })
        );
    }
}
