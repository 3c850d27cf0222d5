//! Tree nodes and node pointers.
//!
//! Nodes are metadata cache entries. A node never records its own record
//! count on disk: the pointer that leads to it carries the count, and the
//! image is decoded with it. Every node names the tree header as its owner,
//! so the header stays cached while any node of the tree does.
//!
//! # Leaf image
//!
//! Signature `BTLF`, version, class id, the encoded records, checksum.
//!
//! # Internal image
//!
//! Signature `BTIN`, version, class id, the encoded records, then one child
//! pointer per child, then the checksum. A child pointer is the child's
//! address, its record count (`max_nrec_size` bytes) and, below depth 1, its
//! subtree record count (`child_count_width` bytes).
//!
//! Both images are padded with zeros to the node size.

// Record counts are bounded by the u16 node capacity.
#![allow(clippy::cast_possible_truncation)]

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::btree2::error::BTreeError;
use crate::btree2::header::{FORMAT_VERSION, Header, Layout, METADATA_PREFIX};
use crate::btree2::record::RecordClass;
use crate::storage::image::{CHECKSUM_SIZE, verify_image};
use crate::storage::{
    Access, Address, CacheEntry, EntryKind, ImageError, ImageReader, ImageWriter, IndexFile,
    Storage, UNDEFINED_ADDRESS, UnprotectFlags,
};

/// Leaf block signature.
pub const LEAF_MAGIC: [u8; 4] = *b"BTLF";
/// Internal block signature.
pub const INTERNAL_MAGIC: [u8; 4] = *b"BTIN";

/// Reference to a child node plus the counts needed to skip loading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePointer {
    pub addr: Address,
    /// Records held by the node itself.
    pub node_nrec: usize,
    /// Records reachable through the node.
    pub all_nrec: u64,
}

impl NodePointer {
    /// Pointer to nothing: the root of an empty tree.
    pub const EMPTY: Self = Self {
        addr: UNDEFINED_ADDRESS,
        node_nrec: 0,
        all_nrec: 0,
    };

    #[must_use]
    pub const fn is_defined(&self) -> bool {
        self.addr != UNDEFINED_ADDRESS
    }
}

/// Records reachable through a node holding `nrec` records and `children`.
#[must_use]
pub fn subtree_count(nrec: usize, children: Option<&[NodePointer]>) -> u64 {
    nrec as u64 + children.map_or(0, |c| c.iter().map(|p| p.all_nrec).sum())
}

/// Nodes that can be relocated by the shadow protocol.
pub trait Shadowable: CacheEntry {
    /// Epoch at which the node was created or last relocated.
    fn shadow_epoch_mut(&mut self) -> &mut u64;
}

/// A leaf: sorted records, no children.
#[derive(Debug)]
pub struct LeafNode<C: RecordClass> {
    layout: Arc<Layout<C>>,
    owner: Address,
    pub(crate) shadow_epoch: u64,
    pub(crate) records: Vec<C::Record>,
}

impl<C: RecordClass> LeafNode<C> {
    #[must_use]
    pub fn new(hdr: &Header<C>, records: Vec<C::Record>) -> Self {
        Self {
            layout: Arc::clone(&hdr.layout),
            owner: hdr.addr,
            shadow_epoch: hdr.next_epoch(),
            records,
        }
    }

    #[must_use]
    pub fn records(&self) -> &[C::Record] {
        &self.records
    }

    /// Decode a leaf image holding `nrec` records.
    pub fn decode(
        image: &[u8],
        layout: Arc<Layout<C>>,
        owner: Address,
        nrec: usize,
        shadow_epoch: u64,
    ) -> Result<Self, BTreeError> {
        let checksum_offset = METADATA_PREFIX - CHECKSUM_SIZE + nrec * layout.record_size;
        if checksum_offset + CHECKSUM_SIZE > image.len() {
            return Err(BTreeError::Corrupt(format!(
                "leaf of {nrec} records does not fit in {} bytes",
                image.len()
            )));
        }
        verify_image(image, checksum_offset)?;

        let mut r = ImageReader::new(image);
        r.expect_magic(LEAF_MAGIC)?;
        r.expect_version(FORMAT_VERSION)?;
        expect_class::<C>(r.u8()?)?;
        let records = decode_records(&mut r, &layout, nrec)?;

        Ok(Self {
            layout,
            owner,
            shadow_epoch,
            records,
        })
    }
}

impl<C: RecordClass> CacheEntry for LeafNode<C> {
    fn kind(&self) -> EntryKind {
        EntryKind::LeafNode
    }

    fn owner(&self) -> Option<Address> {
        Some(self.owner)
    }

    fn image_len(&self) -> usize {
        self.layout.node_size
    }

    fn serialize(&self, image: &mut [u8]) -> Result<(), ImageError> {
        let mut w = ImageWriter::new(image);
        w.put_bytes(&LEAF_MAGIC)?;
        w.put_u8(FORMAT_VERSION)?;
        w.put_u8(C::ID)?;
        encode_records(&mut w, &self.layout, &self.records)?;
        w.put_checksum()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl<C: RecordClass> Shadowable for LeafNode<C> {
    fn shadow_epoch_mut(&mut self) -> &mut u64 {
        &mut self.shadow_epoch
    }
}

/// An internal node: `n` sorted records separating `n + 1` children.
#[derive(Debug)]
pub struct InternalNode<C: RecordClass> {
    layout: Arc<Layout<C>>,
    owner: Address,
    pub(crate) shadow_epoch: u64,
    pub(crate) depth: u16,
    /// Width of the children's subtree counts in the image.
    child_count_width: u8,
    pub(crate) records: Vec<C::Record>,
    pub(crate) children: Vec<NodePointer>,
}

impl<C: RecordClass> InternalNode<C> {
    #[must_use]
    pub fn new(
        hdr: &Header<C>,
        depth: u16,
        records: Vec<C::Record>,
        children: Vec<NodePointer>,
    ) -> Self {
        Self {
            layout: Arc::clone(&hdr.layout),
            owner: hdr.addr,
            shadow_epoch: hdr.next_epoch(),
            depth,
            child_count_width: hdr.child_count_width(depth),
            records,
            children,
        }
    }

    #[must_use]
    pub fn records(&self) -> &[C::Record] {
        &self.records
    }

    #[must_use]
    pub fn children(&self) -> &[NodePointer] {
        &self.children
    }

    /// Decode an internal image holding `nrec` records at `depth`.
    pub fn decode(
        image: &[u8],
        layout: Arc<Layout<C>>,
        owner: Address,
        nrec: usize,
        depth: u16,
        child_count_width: u8,
        shadow_epoch: u64,
    ) -> Result<Self, BTreeError> {
        let pointer_size = layout.pointer_size(depth, child_count_width);
        let checksum_offset = METADATA_PREFIX - CHECKSUM_SIZE
            + nrec * layout.record_size
            + (nrec + 1) * pointer_size;
        if checksum_offset + CHECKSUM_SIZE > image.len() {
            return Err(BTreeError::Corrupt(format!(
                "internal node of {nrec} records does not fit in {} bytes",
                image.len()
            )));
        }
        verify_image(image, checksum_offset)?;

        let mut r = ImageReader::new(image);
        r.expect_magic(INTERNAL_MAGIC)?;
        r.expect_version(FORMAT_VERSION)?;
        expect_class::<C>(r.u8()?)?;
        let records = decode_records(&mut r, &layout, nrec)?;

        let mut children = Vec::with_capacity(nrec + 1);
        for _ in 0..=nrec {
            let addr = r.address(layout.address_width)?;
            let node_nrec = r.uint(layout.max_nrec_size)? as usize;
            let all_nrec = if depth > 1 {
                r.uint(child_count_width)?
            } else {
                node_nrec as u64
            };
            children.push(NodePointer {
                addr,
                node_nrec,
                all_nrec,
            });
        }

        Ok(Self {
            layout,
            owner,
            shadow_epoch,
            depth,
            child_count_width,
            records,
            children,
        })
    }
}

impl<C: RecordClass> CacheEntry for InternalNode<C> {
    fn kind(&self) -> EntryKind {
        EntryKind::InternalNode
    }

    fn owner(&self) -> Option<Address> {
        Some(self.owner)
    }

    fn flush_children(&self) -> Vec<Address> {
        self.children.iter().map(|child| child.addr).collect()
    }

    fn image_len(&self) -> usize {
        self.layout.node_size
    }

    fn serialize(&self, image: &mut [u8]) -> Result<(), ImageError> {
        let layout = &self.layout;
        let mut w = ImageWriter::new(image);
        w.put_bytes(&INTERNAL_MAGIC)?;
        w.put_u8(FORMAT_VERSION)?;
        w.put_u8(C::ID)?;
        encode_records(&mut w, layout, &self.records)?;
        for child in &self.children {
            w.put_address(child.addr, layout.address_width)?;
            w.put_uint(child.node_nrec as u64, layout.max_nrec_size)?;
            if self.depth > 1 {
                w.put_uint(child.all_nrec, self.child_count_width)?;
            }
        }
        w.put_checksum()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl<C: RecordClass> Shadowable for InternalNode<C> {
    fn shadow_epoch_mut(&mut self) -> &mut u64 {
        &mut self.shadow_epoch
    }
}

fn expect_class<C: RecordClass>(found: u8) -> Result<(), BTreeError> {
    if found == C::ID {
        Ok(())
    } else {
        Err(BTreeError::UnknownTreeClass {
            expected: C::ID,
            found,
        })
    }
}

fn decode_records<C: RecordClass>(
    r: &mut ImageReader<'_>,
    layout: &Layout<C>,
    nrec: usize,
) -> Result<Vec<C::Record>, BTreeError> {
    let mut records = Vec::with_capacity(nrec);
    for _ in 0..nrec {
        let raw = r.bytes(layout.record_size)?;
        records.push(layout.class.decode(raw)?);
    }
    Ok(records)
}

fn encode_records<C: RecordClass>(
    w: &mut ImageWriter<'_>,
    layout: &Layout<C>,
    records: &[C::Record],
) -> Result<(), ImageError> {
    for record in records {
        let slot = w.slot(layout.record_size)?;
        layout.class.encode(record, slot)?;
    }
    Ok(())
}

/// A node of either kind, for code that treats siblings uniformly.
#[derive(Debug)]
pub enum Child<C: RecordClass> {
    Leaf(LeafNode<C>),
    Internal(InternalNode<C>),
}

impl<C: RecordClass> Child<C> {
    #[must_use]
    pub fn records(&self) -> &[C::Record] {
        match self {
            Self::Leaf(leaf) => &leaf.records,
            Self::Internal(node) => &node.records,
        }
    }

    pub const fn records_mut(&mut self) -> &mut Vec<C::Record> {
        match self {
            Self::Leaf(leaf) => &mut leaf.records,
            Self::Internal(node) => &mut node.records,
        }
    }

    /// Child pointers; `None` for a leaf.
    #[must_use]
    pub fn children(&self) -> Option<&[NodePointer]> {
        match self {
            Self::Leaf(_) => None,
            Self::Internal(node) => Some(&node.children),
        }
    }

    pub const fn children_mut(&mut self) -> Option<&mut Vec<NodePointer>> {
        match self {
            Self::Leaf(_) => None,
            Self::Internal(node) => Some(&mut node.children),
        }
    }

    /// Record count and subtree count, as the parent's pointer should hold them.
    #[must_use]
    pub fn counts(&self) -> (usize, u64) {
        let nrec = self.records().len();
        (nrec, subtree_count(nrec, self.children()))
    }

    /// An empty node of the same kind and depth.
    #[must_use]
    pub fn empty_sibling(&self, hdr: &Header<C>) -> Self {
        match self {
            Self::Leaf(_) => Self::Leaf(LeafNode::new(hdr, Vec::new())),
            Self::Internal(node) => {
                Self::Internal(InternalNode::new(hdr, node.depth, Vec::new(), Vec::new()))
            }
        }
    }

    const fn shadow_epoch_mut(&mut self) -> &mut u64 {
        match self {
            Self::Leaf(leaf) => &mut leaf.shadow_epoch,
            Self::Internal(node) => &mut node.shadow_epoch,
        }
    }
}

/// Unprotect flags for a node that is being removed from the tree.
///
/// Old space stays allocated in SWMR mode; readers may still reach it.
#[must_use]
pub fn deletion_flags<C: RecordClass>(hdr: &Header<C>) -> UnprotectFlags {
    if hdr.swmr_write {
        UnprotectFlags::DELETED
    } else {
        UnprotectFlags::DELETED | UnprotectFlags::FREE_SPACE
    }
}

fn check_count(addr: Address, expected: usize, found: usize) -> Result<(), BTreeError> {
    if expected == found {
        Ok(())
    } else {
        Err(BTreeError::Corrupt(format!(
            "node at {addr} holds {found} records, its pointer says {expected}"
        )))
    }
}

/// Protect the leaf `ptr` leads to.
pub fn protect_leaf<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    ptr: &NodePointer,
    access: Access,
) -> Result<LeafNode<C>, BTreeError> {
    let layout = Arc::clone(&hdr.layout);
    let leaf: LeafNode<C> = file.protect(
        ptr.addr,
        EntryKind::LeafNode,
        hdr.layout.node_size,
        access,
        |image| LeafNode::decode(image, layout, hdr.addr, ptr.node_nrec, hdr.shadow_epoch),
    )?;
    if let Err(e) = check_count(ptr.addr, ptr.node_nrec, leaf.records.len()) {
        file.unprotect(ptr.addr, leaf, UnprotectFlags::NONE)?;
        return Err(e);
    }
    Ok(leaf)
}

/// Protect the internal node at `depth` that `ptr` leads to.
pub fn protect_internal<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    ptr: &NodePointer,
    depth: u16,
    access: Access,
) -> Result<InternalNode<C>, BTreeError> {
    let layout = Arc::clone(&hdr.layout);
    let child_count_width = hdr.child_count_width(depth);
    let node: InternalNode<C> = file.protect(
        ptr.addr,
        EntryKind::InternalNode,
        hdr.layout.node_size,
        access,
        |image| {
            InternalNode::decode(
                image,
                layout,
                hdr.addr,
                ptr.node_nrec,
                depth,
                child_count_width,
                hdr.shadow_epoch,
            )
        },
    )?;
    if let Err(e) = check_count(ptr.addr, ptr.node_nrec, node.records.len()) {
        file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;
        return Err(e);
    }
    Ok(node)
}

/// Protect the node at `depth` that `ptr` leads to, relocating it first
/// when `shadow` is set.
pub fn protect_child<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    ptr: &mut NodePointer,
    depth: u16,
    shadow: bool,
) -> Result<Child<C>, BTreeError> {
    let mut child = if depth == 0 {
        Child::Leaf(protect_leaf(file, hdr, ptr, Access::Write)?)
    } else {
        Child::Internal(protect_internal(file, hdr, ptr, depth, Access::Write)?)
    };
    if shadow {
        if let Err(e) = shadow_node(file, hdr, ptr, child.shadow_epoch_mut()) {
            release_child(file, ptr.addr, child, UnprotectFlags::NONE)?;
            return Err(e);
        }
    }
    Ok(child)
}

/// Hand a node of either kind back to the cache.
pub fn release_child<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    addr: Address,
    child: Child<C>,
    flags: UnprotectFlags,
) -> Result<(), BTreeError> {
    match child {
        Child::Leaf(leaf) => file.unprotect(addr, leaf, flags)?,
        Child::Internal(node) => file.unprotect(addr, node, flags)?,
    }
    Ok(())
}

/// Relocate a protected node to fresh space so readers of the old image
/// keep a consistent view.
///
/// Does nothing if the node was already relocated (or created) in the
/// current epoch. The old space is not freed. Returns whether the node moved.
pub fn shadow_node<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    ptr: &mut NodePointer,
    epoch: &mut u64,
) -> Result<bool, BTreeError> {
    if *epoch > hdr.shadow_epoch {
        return Ok(false);
    }
    let new_addr = file.allocate(hdr.layout.node_size)?;
    file.move_entry(ptr.addr, new_addr)?;
    debug!(
        old = ptr.addr,
        new = new_addr,
        epoch = hdr.shadow_epoch,
        "node shadowed"
    );
    ptr.addr = new_addr;
    *epoch = hdr.next_epoch();
    Ok(true)
}

/// Hand a node back, dirty or clean. Dirty nodes are shadowed first in
/// SWMR mode, which may change `ptr.addr`.
pub fn release_node<C, S, N>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    ptr: &mut NodePointer,
    mut node: N,
    dirty: bool,
) -> Result<(), BTreeError>
where
    C: RecordClass,
    S: Storage,
    N: Shadowable,
{
    if !dirty {
        file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;
        return Ok(());
    }
    let shadowed = if hdr.swmr_write {
        shadow_node(file, hdr, ptr, node.shadow_epoch_mut()).map(|_| ())
    } else {
        Ok(())
    };
    file.unprotect(ptr.addr, node, UnprotectFlags::DIRTIED)?;
    shadowed
}

/// Put a freshly built node of either kind in the cache.
pub fn create_child<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    child: Child<C>,
) -> Result<Address, BTreeError> {
    match child {
        Child::Leaf(leaf) => create_node(file, leaf),
        Child::Internal(node) => create_node(file, node),
    }
}

/// Put a freshly built node in the cache at newly allocated space.
pub fn create_node<S: Storage, N: CacheEntry>(
    file: &mut IndexFile<S>,
    node: N,
) -> Result<Address, BTreeError> {
    let addr = file.allocate(node.image_len())?;
    file.insert_entry(addr, node)?;
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree2::header::CreateParams;
    use crate::btree2::record::{KeyValue, KeyValueClass};
    use crate::simulation::SimulatedStorage;
    use crate::storage::FileOptions;

    fn header(node_size: u32) -> Header<KeyValueClass> {
        let layout = Arc::new(
            Layout::new(KeyValueClass, node_size as usize, 8, 8).expect("layout"),
        );
        let mut hdr = Header::new(layout, 64, CreateParams {
            node_size,
            ..CreateParams::default()
        }, false)
        .expect("header");
        hdr.ensure_depth(2).expect("grow");
        hdr
    }

    fn kv(key: u64) -> KeyValue {
        KeyValue {
            key,
            value: key * 10,
        }
    }

    #[test]
    fn test_leaf_image_round_trip() {
        let hdr = header(128);
        let leaf = LeafNode::new(&hdr, vec![kv(1), kv(2), kv(3)]);
        let mut image = vec![0u8; leaf.image_len()];
        leaf.serialize(&mut image).expect("serialize");
        assert_eq!(&image[..4], b"BTLF");
        // Everything after the checksum is padding
        assert!(image[6 + 3 * 16 + 4..].iter().all(|&b| b == 0));

        let decoded = LeafNode::decode(&image, Arc::clone(&hdr.layout), 64, 3, 0)
            .expect("decode");
        assert_eq!(decoded.records(), leaf.records());
        assert_eq!(decoded.owner(), Some(64));
    }

    #[test]
    fn test_internal_image_round_trip() {
        let hdr = header(256);
        let children = vec![
            NodePointer {
                addr: 1000,
                node_nrec: 4,
                all_nrec: 20,
            },
            NodePointer {
                addr: 2000,
                node_nrec: 5,
                all_nrec: 31,
            },
        ];
        let node = InternalNode::new(&hdr, 2, vec![kv(50)], children);
        let mut image = vec![0u8; node.image_len()];
        node.serialize(&mut image).expect("serialize");

        let decoded = InternalNode::decode(
            &image,
            Arc::clone(&hdr.layout),
            64,
            1,
            2,
            hdr.child_count_width(2),
            0,
        )
        .expect("decode");
        assert_eq!(decoded.records(), node.records());
        assert_eq!(decoded.children(), node.children());
    }

    #[test]
    fn test_depth_one_pointers_omit_subtree_counts() {
        let hdr = header(128);
        let children = vec![
            NodePointer {
                addr: 1000,
                node_nrec: 4,
                all_nrec: 4,
            },
            NodePointer {
                addr: 2000,
                node_nrec: 3,
                all_nrec: 3,
            },
        ];
        let node = InternalNode::new(&hdr, 1, vec![kv(9)], children);
        let mut image = vec![0u8; node.image_len()];
        node.serialize(&mut image).expect("serialize");

        let decoded = InternalNode::decode(&image, Arc::clone(&hdr.layout), 64, 1, 1, 0, 0)
            .expect("decode");
        assert_eq!(decoded.children()[1].all_nrec, 3);
        assert_eq!(subtree_count(1, Some(decoded.children())), 8);
    }

    #[test]
    fn test_corrupt_leaf_detected() {
        let hdr = header(128);
        let leaf = LeafNode::new(&hdr, vec![kv(1), kv(2)]);
        let mut image = vec![0u8; leaf.image_len()];
        leaf.serialize(&mut image).expect("serialize");
        image[10] ^= 0x01;

        let result = LeafNode::decode(&image, Arc::clone(&hdr.layout), 64, 2, 0);
        assert!(matches!(result, Err(BTreeError::ChecksumMismatch { .. })));

        let result = LeafNode::decode(&image, Arc::clone(&hdr.layout), 64, 100, 0);
        assert!(matches!(result, Err(BTreeError::Corrupt(_))));
    }

    #[test]
    fn test_shadow_moves_once_per_epoch() {
        let mut file = IndexFile::create(SimulatedStorage::new(1), FileOptions {
            swmr_write: true,
            ..FileOptions::default()
        })
        .expect("file");
        let mut hdr = header(128);
        hdr.swmr_write = true;

        let leaf = LeafNode::new(&hdr, vec![kv(1)]);
        let addr = create_node(&mut file, leaf).expect("create");
        file.flush().expect("flush");
        let mut ptr = NodePointer {
            addr,
            node_nrec: 1,
            all_nrec: 1,
        };

        // Born in the next epoch: not relocated until the epoch advances
        let leaf = protect_leaf(&mut file, &hdr, &ptr, Access::Write).expect("protect");
        release_node(&mut file, &hdr, &mut ptr, leaf, true).expect("release");
        assert_eq!(ptr.addr, addr);

        hdr.shadow_epoch += 1;
        let leaf = protect_leaf(&mut file, &hdr, &ptr, Access::Write).expect("protect");
        release_node(&mut file, &hdr, &mut ptr, leaf, true).expect("release");
        assert_ne!(ptr.addr, addr);
        let moved = ptr.addr;

        let leaf = protect_leaf(&mut file, &hdr, &ptr, Access::Write).expect("protect");
        release_node(&mut file, &hdr, &mut ptr, leaf, true).expect("release");
        assert_eq!(ptr.addr, moved);
        assert!(file.status(moved).dirty);
        assert!(!file.status(addr).in_cache);
    }
}
