//! Record classes.
//!
//! A record class describes one fixed-size record format: how records are
//! ordered, built from insertion data, and encoded into node images. The
//! tree algorithms are generic over the class; the class value itself is the
//! per-tree context and is shared by every node of the tree.

use std::cmp::Ordering;
use std::fmt::Debug;

use crate::storage::ImageError;

/// Error reported by a record class callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    message: String,
}

impl RecordError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RecordError {}

impl From<RecordError> for ImageError {
    fn from(e: RecordError) -> Self {
        Self::Codec(e.message)
    }
}

/// A fixed-size record format the tree can store.
///
/// `encode` and `decode` must be exact inverses over `record_size()` bytes,
/// and `compare` must be a total order that is stable for a fixed query.
pub trait RecordClass: Clone + Debug + 'static {
    /// Decoded, in-memory record.
    type Record: Clone + Debug + PartialEq + 'static;
    /// What lookups are made with.
    type Query: ?Sized;
    /// What callers hand to `insert`.
    type Insert;

    /// Class id stored in every header and node image.
    const ID: u8;
    /// Human-readable class name.
    const NAME: &'static str;

    /// Encoded size of one record in bytes.
    fn record_size(&self) -> usize;

    /// Order `query` against `record`.
    fn compare(&self, query: &Self::Query, record: &Self::Record) -> Result<Ordering, RecordError>;

    /// Build a new record from insertion data.
    fn store(&self, insert: &Self::Insert) -> Result<Self::Record, RecordError>;

    /// The query that finds the record `insert` would create.
    fn query_of<'a>(&self, insert: &'a Self::Insert) -> &'a Self::Query;

    /// The query that finds `record`.
    fn key_of<'a>(&self, record: &'a Self::Record) -> &'a Self::Query;

    /// Encode `record` into exactly `record_size()` bytes.
    fn encode(&self, record: &Self::Record, raw: &mut [u8]) -> Result<(), RecordError>;

    /// Decode a record from exactly `record_size()` bytes.
    fn decode(&self, raw: &[u8]) -> Result<Self::Record, RecordError>;

    /// Render a record for diagnostics.
    fn debug(&self, record: &Self::Record) -> String {
        format!("{record:?}")
    }
}

fn read_u64(raw: &[u8], offset: usize) -> Result<u64, RecordError> {
    raw.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| RecordError::new(format!("record image too short: {} bytes", raw.len())))
}

fn write_u64(raw: &mut [u8], offset: usize, value: u64) -> Result<(), RecordError> {
    let len = raw.len();
    raw.get_mut(offset..offset + 8)
        .ok_or_else(|| RecordError::new(format!("record slot too short: {len} bytes")))?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Bare `u64` records ordered numerically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct U64Class;

impl RecordClass for U64Class {
    type Record = u64;
    type Query = u64;
    type Insert = u64;

    const ID: u8 = 1;
    const NAME: &'static str = "u64";

    fn record_size(&self) -> usize {
        8
    }

    fn compare(&self, query: &u64, record: &u64) -> Result<Ordering, RecordError> {
        Ok(query.cmp(record))
    }

    fn store(&self, insert: &u64) -> Result<u64, RecordError> {
        Ok(*insert)
    }

    fn query_of<'a>(&self, insert: &'a u64) -> &'a u64 {
        insert
    }

    fn key_of<'a>(&self, record: &'a u64) -> &'a u64 {
        record
    }

    fn encode(&self, record: &u64, raw: &mut [u8]) -> Result<(), RecordError> {
        write_u64(raw, 0, *record)
    }

    fn decode(&self, raw: &[u8]) -> Result<u64, RecordError> {
        read_u64(raw, 0)
    }

    fn debug(&self, record: &u64) -> String {
        record.to_string()
    }
}

/// A `u64` key with a `u64` payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: u64,
    pub value: u64,
}

/// [`KeyValue`] records ordered by key; queried by key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyValueClass;

impl RecordClass for KeyValueClass {
    type Record = KeyValue;
    type Query = u64;
    type Insert = KeyValue;

    const ID: u8 = 2;
    const NAME: &'static str = "key-value";

    fn record_size(&self) -> usize {
        16
    }

    fn compare(&self, query: &u64, record: &KeyValue) -> Result<Ordering, RecordError> {
        Ok(query.cmp(&record.key))
    }

    fn store(&self, insert: &KeyValue) -> Result<KeyValue, RecordError> {
        Ok(*insert)
    }

    fn query_of<'a>(&self, insert: &'a KeyValue) -> &'a u64 {
        &insert.key
    }

    fn key_of<'a>(&self, record: &'a KeyValue) -> &'a u64 {
        &record.key
    }

    fn encode(&self, record: &KeyValue, raw: &mut [u8]) -> Result<(), RecordError> {
        write_u64(raw, 0, record.key)?;
        write_u64(raw, 8, record.value)
    }

    fn decode(&self, raw: &[u8]) -> Result<KeyValue, RecordError> {
        Ok(KeyValue {
            key: read_u64(raw, 0)?,
            value: read_u64(raw, 8)?,
        })
    }

    fn debug(&self, record: &KeyValue) -> String {
        format!("{} => {}", record.key, record.value)
    }
}

/// Binary search returning the index of the last record compared and how
/// `query` compared to it. An empty slice yields `(0, Less)`.
fn locate_record<C: RecordClass>(
    class: &C,
    records: &[C::Record],
    query: &C::Query,
) -> Result<(usize, Ordering), RecordError> {
    let (mut lo, mut hi) = (0, records.len());
    let mut idx = 0;
    let mut cmp = Ordering::Less;

    while lo < hi && cmp != Ordering::Equal {
        idx = usize::midpoint(lo, hi);
        cmp = class.compare(query, &records[idx])?;
        if cmp == Ordering::Less {
            hi = idx;
        } else {
            lo = idx + 1;
        }
    }

    Ok((idx, cmp))
}

/// Find where `query` sits among sorted `records`.
///
/// Returns the first index whose record is not less than `query`, and how
/// `query` compared to the last record examined. On `Equal` the index is the
/// match; otherwise it is where `query` would be inserted, which is also the
/// child to descend into in an internal node.
pub fn insertion_point<C: RecordClass>(
    class: &C,
    records: &[C::Record],
    query: &C::Query,
) -> Result<(usize, Ordering), RecordError> {
    let (idx, cmp) = locate_record(class, records, query)?;
    if cmp == Ordering::Greater {
        Ok((idx + 1, cmp))
    } else {
        Ok((idx, cmp))
    }
}
