//! Tree header.
//!
//! The header is the control block every operation starts from: root
//! pointer, depth, fill percentages and the per-depth capacity table. It is a
//! metadata cache entry of its own; open handles keep it pinned so the
//! in-memory state (handle count, pending deletion, shadow epoch) survives
//! cache eviction.
//!
//! # Header image
//!
//! | Field | Size |
//! |-------|------|
//! | Signature `BTHD` | 4 |
//! | Version | 1 |
//! | Class id | 1 |
//! | Node size | 4 |
//! | Record size | 2 |
//! | Depth | 2 |
//! | Split percent | 1 |
//! | Merge percent | 1 |
//! | Root address | address width |
//! | Root record count | 2 |
//! | Root total record count | length width |
//! | Checksum | 4 |

// Counts are bounded by u16 node capacities and u64 totals.
#![allow(clippy::cast_possible_truncation)]

use std::any::Any;
use std::sync::Arc;

use crate::btree2::error::BTreeError;
use crate::btree2::node::NodePointer;
use crate::btree2::record::RecordClass;
use crate::storage::image::{CHECKSUM_SIZE, encoded_width, max_for_width, verify_image};
use crate::storage::{Address, CacheEntry, EntryKind, ImageError, ImageReader, ImageWriter};

/// Header block signature.
pub const HEADER_MAGIC: [u8; 4] = *b"BTHD";
/// Version of every tree block format.
pub const FORMAT_VERSION: u8 = 0;
/// Bytes every node spends on signature, version, class id and checksum.
pub const METADATA_PREFIX: usize = 10;

/// Parameters fixed when a tree is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateParams {
    /// Size of every node image in bytes.
    pub node_size: u32,
    /// A child holding this percentage of its capacity is split before insertion.
    pub split_percent: u8,
    /// A child at this percentage of its capacity is merged before removal.
    pub merge_percent: u8,
}

impl Default for CreateParams {
    fn default() -> Self {
        Self {
            node_size: 512,
            split_percent: 100,
            merge_percent: 40,
        }
    }
}

impl CreateParams {
    /// Check the parameters that do not depend on the record class.
    pub fn validate(&self) -> Result<(), BTreeError> {
        if self.node_size as usize <= METADATA_PREFIX {
            return Err(BTreeError::InvalidParameters(format!(
                "node size {} leaves no room for records",
                self.node_size
            )));
        }
        for (name, value) in [("split", self.split_percent), ("merge", self.merge_percent)] {
            if !(1..=100).contains(&value) {
                return Err(BTreeError::InvalidParameters(format!(
                    "{name} percent {value} outside 1..=100"
                )));
            }
        }
        if u16::from(self.merge_percent) * 2 >= u16::from(self.split_percent) {
            return Err(BTreeError::InvalidParameters(format!(
                "merge percent {} must be less than half the split percent {}",
                self.merge_percent, self.split_percent
            )));
        }
        Ok(())
    }
}

/// Capacity and thresholds of the nodes at one depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// Most records a node at this depth can hold.
    pub max_nrec: usize,
    /// A node holding this many records is split before it is entered.
    pub split_nrec: usize,
    /// A node holding this many records is merged before it is entered.
    pub merge_nrec: usize,
    /// Most records a subtree rooted at this depth can hold.
    pub cum_max_nrec: u64,
    /// Bytes needed to encode `cum_max_nrec`.
    pub cum_max_nrec_size: u8,
}

impl NodeInfo {
    fn new(max_nrec: usize, split_percent: u8, merge_percent: u8, cum_max_nrec: u64) -> Self {
        Self {
            max_nrec,
            split_nrec: max_nrec * usize::from(split_percent) / 100,
            merge_nrec: (max_nrec * usize::from(merge_percent) / 100).max(1),
            cum_max_nrec,
            cum_max_nrec_size: encoded_width(cum_max_nrec),
        }
    }

    /// Whether a split always leaves both halves above the merge threshold
    /// and a merge never overflows a node.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.max_nrec >= 2 && self.split_nrec > 2 * self.merge_nrec
    }
}

/// Fixed geometry shared by the header and every node of a tree.
#[derive(Debug)]
pub struct Layout<C: RecordClass> {
    pub class: C,
    pub node_size: usize,
    pub record_size: usize,
    pub address_width: u8,
    pub length_width: u8,
    /// Bytes used for a node's own record count in child pointers.
    pub max_nrec_size: u8,
}

impl<C: RecordClass> Layout<C> {
    pub fn new(
        class: C,
        node_size: usize,
        address_width: u8,
        length_width: u8,
    ) -> Result<Self, BTreeError> {
        let record_size = class.record_size();
        if record_size == 0 || record_size > usize::from(u16::MAX) {
            return Err(BTreeError::InvalidParameters(format!(
                "record size {record_size} outside 1..=65535"
            )));
        }
        let leaf_max = node_size.saturating_sub(METADATA_PREFIX) / record_size;
        if leaf_max > usize::from(u16::MAX) {
            return Err(BTreeError::InvalidParameters(format!(
                "node size {node_size} holds more than 65535 records"
            )));
        }
        Ok(Self {
            class,
            node_size,
            record_size,
            address_width,
            length_width,
            max_nrec_size: encoded_width(leaf_max as u64),
        })
    }

    /// Records that fit in a leaf.
    #[must_use]
    pub const fn leaf_capacity(&self) -> usize {
        self.node_size.saturating_sub(METADATA_PREFIX) / self.record_size
    }

    /// Encoded size of one child pointer in an internal node at `depth`.
    ///
    /// `child_count_width` is the width of the children's total record
    /// counts, which are only stored below depth 1.
    #[must_use]
    pub const fn pointer_size(&self, depth: u16, child_count_width: u8) -> usize {
        let counts = if depth > 1 { child_count_width as usize } else { 0 };
        self.address_width as usize + self.max_nrec_size as usize + counts
    }
}

/// Capacity table entry for the leaves.
fn leaf_info<C: RecordClass>(layout: &Layout<C>, split: u8, merge: u8) -> NodeInfo {
    let max = layout.leaf_capacity();
    NodeInfo::new(max, split, merge, max as u64)
}

/// Capacity table entry for internal nodes at `depth`, given the entry below.
fn internal_info<C: RecordClass>(
    layout: &Layout<C>,
    depth: u16,
    below: &NodeInfo,
    split: u8,
    merge: u8,
) -> NodeInfo {
    let pointer = layout.pointer_size(depth, below.cum_max_nrec_size);
    let max = layout
        .node_size
        .saturating_sub(METADATA_PREFIX + pointer)
        / (layout.record_size + pointer);
    let cum_max = (max as u64 + 1)
        .saturating_mul(below.cum_max_nrec)
        .saturating_add(max as u64);
    NodeInfo::new(max, split, merge, cum_max)
}

fn check_usable(depth: u16, info: &NodeInfo) -> Result<(), BTreeError> {
    if info.is_usable() {
        return Ok(());
    }
    Err(BTreeError::InvalidParameters(format!(
        "nodes at depth {depth} hold {} records, split at {} and merge at {}",
        info.max_nrec, info.split_nrec, info.merge_nrec
    )))
}

/// Reject geometries that some reachable depth cannot split or merge at.
///
/// Internal pointers widen as subtree totals grow, so capacity shrinks with
/// depth. A depth is reachable while the smallest valid tree of that depth
/// still has a record count the file's length width can encode.
fn check_reachable_depths<C: RecordClass>(
    layout: &Layout<C>,
    leaf: NodeInfo,
    params: CreateParams,
) -> Result<(), BTreeError> {
    check_usable(0, &leaf)?;
    let limit = max_for_width(layout.length_width);
    let mut below = leaf;
    // Fewest records in a non-root subtree rooted one level down
    let mut min_below = leaf.merge_nrec as u64;
    let mut depth = 1u16;
    // merge_nrec >= 1, so min_below at least doubles every level
    loop {
        // A root at `depth` holds one record over two such subtrees
        let reachable = min_below
            .checked_mul(2)
            .and_then(|n| n.checked_add(1))
            .is_some_and(|n| n <= limit);
        if !reachable {
            return Ok(());
        }
        let info = internal_info(
            layout,
            depth,
            &below,
            params.split_percent,
            params.merge_percent,
        );
        check_usable(depth, &info)?;
        let merge = info.merge_nrec as u64;
        min_below = (merge + 1).saturating_mul(min_below).saturating_add(merge);
        below = info;
        depth += 1;
    }
}

/// The control block of one tree.
#[derive(Debug)]
pub struct Header<C: RecordClass> {
    pub(crate) layout: Arc<Layout<C>>,
    /// Address of the header block.
    pub(crate) addr: Address,
    pub(crate) root: NodePointer,
    /// Depth of the root; leaves are depth 0.
    pub(crate) depth: u16,
    pub(crate) split_percent: u8,
    pub(crate) merge_percent: u8,
    /// Indexed by depth; always covers `0..=depth`.
    pub(crate) node_info: Vec<NodeInfo>,
    /// Open handles.
    pub(crate) file_rc: u32,
    /// Delete the tree when the last handle closes.
    pub(crate) pending_delete: bool,
    pub(crate) swmr_write: bool,
    pub(crate) shadow_epoch: u64,
    /// Smallest record seen by a lookup since the tree last changed.
    /// Never stored on disk.
    min_record: Option<C::Record>,
    /// Largest record seen by a lookup since the tree last changed.
    max_record: Option<C::Record>,
}

impl<C: RecordClass> Header<C> {
    /// Header of a new, empty tree.
    pub fn new(
        layout: Arc<Layout<C>>,
        addr: Address,
        params: CreateParams,
        swmr_write: bool,
    ) -> Result<Self, BTreeError> {
        params.validate()?;
        let leaf = leaf_info(&layout, params.split_percent, params.merge_percent);
        check_reachable_depths(&layout, leaf, params)?;

        Ok(Self {
            layout,
            addr,
            root: NodePointer::EMPTY,
            depth: 0,
            split_percent: params.split_percent,
            merge_percent: params.merge_percent,
            node_info: vec![leaf],
            file_rc: 0,
            pending_delete: false,
            swmr_write,
            shadow_epoch: 0,
            min_record: None,
            max_record: None,
        })
    }

    /// Size of a header image for the given encoding widths.
    #[must_use]
    pub const fn image_len_for(address_width: u8, length_width: u8) -> usize {
        22 + address_width as usize + length_width as usize
    }

    /// Capacity table entry for `depth`.
    ///
    /// Only depths up to the current root depth are guaranteed to exist.
    #[must_use]
    pub fn info(&self, depth: u16) -> &NodeInfo {
        &self.node_info[usize::from(depth)]
    }

    /// Extend the capacity table so it covers `depth`.
    pub(crate) fn ensure_depth(&mut self, depth: u16) -> Result<(), BTreeError> {
        while self.node_info.len() <= usize::from(depth) {
            let next = self.node_info.len() as u16;
            let below = self.node_info[usize::from(next - 1)];
            let info = internal_info(
                &self.layout,
                next,
                &below,
                self.split_percent,
                self.merge_percent,
            );
            if !info.is_usable() {
                return Err(BTreeError::CantSplit(format!(
                    "nodes at depth {next} would hold only {} records",
                    info.max_nrec
                )));
            }
            self.node_info.push(info);
        }
        Ok(())
    }

    /// Width of the children's total record counts in an internal node at `depth`.
    #[must_use]
    pub fn child_count_width(&self, depth: u16) -> u8 {
        if depth > 1 {
            self.info(depth - 1).cum_max_nrec_size
        } else {
            0
        }
    }

    /// Epoch given to nodes created or relocated now.
    #[must_use]
    pub const fn next_epoch(&self) -> u64 {
        self.shadow_epoch + 1
    }

    /// Smallest record in the tree, if a lookup has seen it since the last change.
    #[must_use]
    pub fn known_min(&self) -> Option<&C::Record> {
        self.min_record.as_ref()
    }

    /// Largest record in the tree, if a lookup has seen it since the last change.
    #[must_use]
    pub fn known_max(&self) -> Option<&C::Record> {
        self.max_record.as_ref()
    }

    /// Remember the ends of a leaf reached along the tree's outer edges.
    pub(crate) fn note_edge_leaf(&mut self, leftmost: bool, rightmost: bool, records: &[C::Record]) {
        if leftmost {
            if let Some(first) = records.first() {
                self.min_record = Some(first.clone());
            }
        }
        if rightmost {
            if let Some(last) = records.last() {
                self.max_record = Some(last.clone());
            }
        }
    }

    /// Drop the remembered bounds. Every change to the records calls this.
    pub(crate) fn forget_bounds(&mut self) {
        self.min_record = None;
        self.max_record = None;
    }

    /// The part of the header that is written to its image.
    #[must_use]
    pub const fn persistent_state(&self) -> (NodePointer, u16) {
        (self.root, self.depth)
    }

    #[must_use]
    pub const fn root(&self) -> NodePointer {
        self.root
    }

    #[must_use]
    pub const fn depth(&self) -> u16 {
        self.depth
    }

    #[must_use]
    pub fn layout(&self) -> &Layout<C> {
        &self.layout
    }

    /// Decode a header image.
    pub fn decode(
        image: &[u8],
        class: C,
        addr: Address,
        address_width: u8,
        length_width: u8,
        swmr_write: bool,
    ) -> Result<Self, BTreeError> {
        verify_image(image, image.len().saturating_sub(CHECKSUM_SIZE))?;

        let mut r = ImageReader::new(image);
        r.expect_magic(HEADER_MAGIC)?;
        r.expect_version(FORMAT_VERSION)?;
        let class_id = r.u8()?;
        if class_id != C::ID {
            return Err(BTreeError::UnknownTreeClass {
                expected: C::ID,
                found: class_id,
            });
        }
        let node_size = r.u32()? as usize;
        let record_size = usize::from(r.u16()?);
        let depth = r.u16()?;
        let split_percent = r.u8()?;
        let merge_percent = r.u8()?;
        let root_addr = r.address(address_width)?;
        let root_nrec = usize::from(r.u16()?);
        let root_all_nrec = r.uint(length_width)?;

        if record_size != class.record_size() {
            return Err(BTreeError::Corrupt(format!(
                "header records are {record_size} bytes, class {} uses {}",
                C::NAME,
                class.record_size()
            )));
        }

        let layout = Arc::new(Layout::new(class, node_size, address_width, length_width)?);
        let leaf = leaf_info(&layout, split_percent, merge_percent);
        let mut header = Self {
            layout,
            addr,
            root: NodePointer {
                addr: root_addr,
                node_nrec: root_nrec,
                all_nrec: root_all_nrec,
            },
            depth,
            split_percent,
            merge_percent,
            node_info: vec![leaf],
            file_rc: 0,
            pending_delete: false,
            swmr_write,
            shadow_epoch: 0,
            min_record: None,
            max_record: None,
        };
        header
            .ensure_depth(depth)
            .map_err(|e| BTreeError::Corrupt(e.to_string()))?;
        Ok(header)
    }
}

impl<C: RecordClass> CacheEntry for Header<C> {
    fn kind(&self) -> EntryKind {
        EntryKind::TreeHeader
    }

    fn flush_children(&self) -> Vec<Address> {
        if self.root.is_defined() {
            vec![self.root.addr]
        } else {
            Vec::new()
        }
    }

    fn image_len(&self) -> usize {
        Self::image_len_for(self.layout.address_width, self.layout.length_width)
    }

    fn serialize(&self, image: &mut [u8]) -> Result<(), ImageError> {
        let layout = &self.layout;
        let mut w = ImageWriter::new(image);
        w.put_bytes(&HEADER_MAGIC)?;
        w.put_u8(FORMAT_VERSION)?;
        w.put_u8(C::ID)?;
        w.put_u32(layout.node_size as u32)?;
        w.put_u16(layout.record_size as u16)?;
        w.put_u16(self.depth)?;
        w.put_u8(self.split_percent)?;
        w.put_u8(self.merge_percent)?;
        w.put_address(self.root.addr, layout.address_width)?;
        w.put_uint(self.root.node_nrec as u64, 2)?;
        w.put_uint(self.root.all_nrec, layout.length_width)?;
        w.put_checksum()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
