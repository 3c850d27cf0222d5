//! Insertion and update.
//!
//! Insertion descends from the root and makes room before it enters a
//! child: a child at its split threshold is first evened out with a sibling
//! that has room, or split when neither sibling has. The record is always
//! stored in a leaf. The root is split at the top, which is the only way the
//! tree grows taller.

use std::cmp::Ordering;

use tracing::debug;

use crate::btree2::error::BTreeError;
use crate::btree2::header::Header;
use crate::btree2::node::{
    InternalNode, LeafNode, NodePointer, create_node, protect_internal, protect_leaf,
    release_node, subtree_count,
};
use crate::btree2::rebalance::{redistribute2, redistribute3, split1};
use crate::btree2::record::{RecordClass, insertion_point};
use crate::btree2::search::find;
use crate::storage::{Access, IndexFile, Storage, UnprotectFlags};

/// Rebalance attempts per level before a split is forced.
const REBALANCE_RETRIES: u8 = 2;

/// What `update` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The record existed and the callback changed it.
    Modified,
    /// The record existed and the callback left it alone.
    Unchanged,
    /// The record did not exist and was inserted.
    Inserted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateStatus {
    Modified { changed: bool },
    Inserted,
    /// The leaf the record belongs in is full; nothing was changed.
    ChildFull,
}

/// Insert a new record.
pub fn insert<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &mut Header<C>,
    udata: &C::Insert,
) -> Result<(), BTreeError> {
    let query = hdr.layout.class.query_of(udata);
    if find(file, hdr, query)?.is_some() {
        return Err(BTreeError::DuplicateRecord);
    }
    hdr.forget_bounds();

    if !hdr.root.is_defined() {
        let leaf = LeafNode::new(hdr, Vec::new());
        let addr = create_node(file, leaf)?;
        hdr.root = NodePointer {
            addr,
            node_nrec: 0,
            all_nrec: 0,
        };
        debug!(addr, "root leaf created");
    } else if hdr.root.node_nrec >= hdr.info(hdr.depth).split_nrec {
        split_root(file, hdr)?;
    }

    let mut root = hdr.root;
    let result = if hdr.depth == 0 {
        insert_leaf(file, hdr, &mut root, udata)
    } else {
        insert_internal(file, hdr, hdr.depth, &mut root, udata)
    };
    hdr.root = root;
    result
}

/// Put a new internal root above the current one and split the old root
/// into its two children.
fn split_root<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &mut Header<C>,
) -> Result<(), BTreeError> {
    let depth = hdr.depth + 1;
    hdr.ensure_depth(depth)?;

    let old_root = hdr.root;
    let mut root = InternalNode::new(hdr, depth, Vec::new(), vec![old_root]);
    split1(file, hdr, &mut root, 0)?;
    let addr = create_node(file, root)?;

    hdr.root = NodePointer {
        addr,
        node_nrec: 1,
        all_nrec: old_root.all_nrec,
    };
    hdr.depth = depth;
    debug!(addr, depth, "root split");
    Ok(())
}

fn store_in_leaf<C: RecordClass>(
    hdr: &Header<C>,
    leaf: &mut LeafNode<C>,
    udata: &C::Insert,
) -> Result<(), BTreeError> {
    let class = &hdr.layout.class;
    let (idx, cmp) = insertion_point(class, &leaf.records, class.query_of(udata))?;
    if cmp == Ordering::Equal {
        return Err(BTreeError::DuplicateRecord);
    }
    if leaf.records.len() >= hdr.info(0).max_nrec {
        return Err(BTreeError::CantSplit(format!(
            "leaf already holds {} records",
            leaf.records.len()
        )));
    }
    let record = class.store(udata)?;
    leaf.records.insert(idx, record);
    Ok(())
}

fn insert_leaf<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    ptr: &mut NodePointer,
    udata: &C::Insert,
) -> Result<(), BTreeError> {
    let mut leaf = protect_leaf(file, hdr, ptr, Access::Write)?;
    if let Err(e) = store_in_leaf(hdr, &mut leaf, udata) {
        file.unprotect(ptr.addr, leaf, UnprotectFlags::NONE)?;
        return Err(e);
    }
    ptr.node_nrec = leaf.records.len();
    ptr.all_nrec = ptr.node_nrec as u64;
    release_node(file, hdr, ptr, leaf, true)
}

fn insert_internal<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    depth: u16,
    ptr: &mut NodePointer,
    udata: &C::Insert,
) -> Result<(), BTreeError> {
    let mut node = protect_internal(file, hdr, ptr, depth, Access::Write)?;
    let result = insert_below(file, hdr, &mut node, udata);
    finish_internal(file, hdr, ptr, node, result.is_ok())?;
    result
}

/// Record the node's counts in `ptr` and hand it back dirty.
///
/// A node whose descent failed is not shadowed.
pub(crate) fn finish_internal<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    ptr: &mut NodePointer,
    node: InternalNode<C>,
    succeeded: bool,
) -> Result<(), BTreeError> {
    ptr.node_nrec = node.records.len();
    ptr.all_nrec = subtree_count(node.records.len(), Some(&node.children));
    if succeeded {
        release_node(file, hdr, ptr, node, true)
    } else {
        file.unprotect(ptr.addr, node, UnprotectFlags::DIRTIED)?;
        Ok(())
    }
}

/// Make room in the child the record belongs in, then insert into it.
fn insert_below<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    node: &mut InternalNode<C>,
    udata: &C::Insert,
) -> Result<(), BTreeError> {
    let class = &hdr.layout.class;
    let query = class.query_of(udata);
    let child_depth = node.depth - 1;
    let split_nrec = hdr.info(child_depth).split_nrec;

    let (mut idx, cmp) = insertion_point(class, &node.records, query)?;
    if cmp == Ordering::Equal {
        return Err(BTreeError::DuplicateRecord);
    }

    let mut retries = REBALANCE_RETRIES;
    while node.children[idx].node_nrec >= split_nrec {
        make_room(file, hdr, node, idx, retries > 0)?;
        (idx, _) = insertion_point(class, &node.records, query)?;
        retries = retries.saturating_sub(1);
    }

    let child = &mut node.children[idx];
    if child_depth == 0 {
        insert_leaf(file, hdr, child, udata)
    } else {
        insert_internal(file, hdr, child_depth, child, udata)
    }
}

/// Bring child `idx` below its split threshold.
fn make_room<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    node: &mut InternalNode<C>,
    idx: usize,
    may_redistribute: bool,
) -> Result<(), BTreeError> {
    let split_nrec = hdr.info(node.depth - 1).split_nrec;
    let nrec = node.records.len();
    let has_room = |i: usize| node.children[i].node_nrec < split_nrec;

    if idx == 0 {
        if may_redistribute && has_room(1) {
            redistribute2(file, hdr, node, 0)
        } else {
            split1(file, hdr, node, 0)
        }
    } else if idx == nrec {
        if may_redistribute && has_room(idx - 1) {
            redistribute2(file, hdr, node, idx - 1)
        } else {
            split1(file, hdr, node, idx)
        }
    } else if may_redistribute && (has_room(idx - 1) || has_room(idx + 1)) {
        redistribute3(file, hdr, node, idx)
    } else {
        split1(file, hdr, node, idx)
    }
}

/// Apply `op` to a stored record. `op` returns whether it changed the record.
///
/// A change that moves the record to a different key position is undone and
/// reported as a class failure.
pub(crate) fn modify_record<C, F>(
    class: &C,
    record: &mut C::Record,
    op: F,
) -> Result<bool, BTreeError>
where
    C: RecordClass,
    F: FnOnce(&mut C::Record) -> bool,
{
    let original = record.clone();
    if !op(record) {
        return Ok(false);
    }
    match class.compare(class.key_of(&original), record) {
        Ok(Ordering::Equal) => Ok(true),
        Ok(_) => {
            *record = original;
            Err(BTreeError::ComparatorOrCodecFailed(
                "modified record no longer compares equal to its key".to_string(),
            ))
        }
        Err(e) => {
            *record = original;
            Err(e.into())
        }
    }
}

/// Modify the record matching `udata` if there is one, insert it otherwise.
pub fn update<C, S, F>(
    file: &mut IndexFile<S>,
    hdr: &mut Header<C>,
    udata: &C::Insert,
    op: F,
) -> Result<UpdateOutcome, BTreeError>
where
    C: RecordClass,
    S: Storage,
    F: FnOnce(&mut C::Record) -> bool,
{
    if !hdr.root.is_defined() {
        insert(file, hdr, udata)?;
        return Ok(UpdateOutcome::Inserted);
    }
    hdr.forget_bounds();

    let mut root = hdr.root;
    let result = if hdr.depth == 0 {
        update_leaf(file, hdr, &mut root, udata, op)
    } else {
        update_internal(file, hdr, hdr.depth, &mut root, udata, op)
    };
    hdr.root = root;

    match result? {
        UpdateStatus::Modified { changed: true } => Ok(UpdateOutcome::Modified),
        UpdateStatus::Modified { changed: false } => Ok(UpdateOutcome::Unchanged),
        UpdateStatus::Inserted => Ok(UpdateOutcome::Inserted),
        UpdateStatus::ChildFull => {
            insert(file, hdr, udata)?;
            Ok(UpdateOutcome::Inserted)
        }
    }
}

fn update_leaf<C, S, F>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    ptr: &mut NodePointer,
    udata: &C::Insert,
    op: F,
) -> Result<UpdateStatus, BTreeError>
where
    C: RecordClass,
    S: Storage,
    F: FnOnce(&mut C::Record) -> bool,
{
    let class = &hdr.layout.class;
    let mut leaf = protect_leaf(file, hdr, ptr, Access::Write)?;

    let status = match insertion_point(class, &leaf.records, class.query_of(udata)) {
        Err(e) => Err(e.into()),
        Ok((idx, Ordering::Equal)) => modify_record(class, &mut leaf.records[idx], op)
            .map(|changed| UpdateStatus::Modified { changed }),
        Ok(_) if leaf.records.len() >= hdr.info(0).split_nrec => Ok(UpdateStatus::ChildFull),
        Ok((idx, _)) => class.store(udata).map_err(BTreeError::from).map(|record| {
            leaf.records.insert(idx, record);
            UpdateStatus::Inserted
        }),
    };

    let dirty = matches!(
        status,
        Ok(UpdateStatus::Modified { changed: true } | UpdateStatus::Inserted)
    );
    ptr.node_nrec = leaf.records.len();
    ptr.all_nrec = ptr.node_nrec as u64;
    release_node(file, hdr, ptr, leaf, dirty)?;
    status
}

fn update_internal<C, S, F>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    depth: u16,
    ptr: &mut NodePointer,
    udata: &C::Insert,
    op: F,
) -> Result<UpdateStatus, BTreeError>
where
    C: RecordClass,
    S: Storage,
    F: FnOnce(&mut C::Record) -> bool,
{
    let mut node = protect_internal(file, hdr, ptr, depth, Access::Write)?;
    match update_below(file, hdr, &mut node, udata, op) {
        Ok((status, dirty)) => {
            if dirty {
                finish_internal(file, hdr, ptr, node, true)?;
            } else {
                release_node(file, hdr, ptr, node, false)?;
            }
            Ok(status)
        }
        Err(e) => {
            finish_internal(file, hdr, ptr, node, false)?;
            Err(e)
        }
    }
}

/// Returns the status and whether `node` changed.
fn update_below<C, S, F>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    node: &mut InternalNode<C>,
    udata: &C::Insert,
    op: F,
) -> Result<(UpdateStatus, bool), BTreeError>
where
    C: RecordClass,
    S: Storage,
    F: FnOnce(&mut C::Record) -> bool,
{
    let class = &hdr.layout.class;
    let (idx, cmp) = insertion_point(class, &node.records, class.query_of(udata))?;
    if cmp == Ordering::Equal {
        let changed = modify_record(class, &mut node.records[idx], op)?;
        return Ok((UpdateStatus::Modified { changed }, changed));
    }

    let child_depth = node.depth - 1;
    let before = node.children[idx];
    let child = &mut node.children[idx];
    let status = if child_depth == 0 {
        update_leaf(file, hdr, child, udata, op)?
    } else {
        update_internal(file, hdr, child_depth, child, udata, op)?
    };

    // The leaf was full; split here if this node can take the promoted record
    if status == UpdateStatus::ChildFull
        && node.records.len() < hdr.info(node.depth).split_nrec
    {
        insert_below(file, hdr, node, udata)?;
        return Ok((UpdateStatus::Inserted, true));
    }

    Ok((status, node.children[idx] != before))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::btree2::header::{CreateParams, Layout};
    use crate::btree2::record::{KeyValue, KeyValueClass};
    use crate::btree2::search::{Walk, iterate};
    use crate::simulation::SimulatedStorage;
    use crate::storage::FileOptions;

    fn setup(node_size: u32) -> (IndexFile<SimulatedStorage>, Header<KeyValueClass>) {
        let file =
            IndexFile::create(SimulatedStorage::new(11), FileOptions::default()).expect("file");
        let layout =
            Arc::new(Layout::new(KeyValueClass, node_size as usize, 8, 8).expect("layout"));
        let hdr = Header::new(
            layout,
            8,
            CreateParams {
                node_size,
                ..CreateParams::default()
            },
            false,
        )
        .expect("header");
        (file, hdr)
    }

    fn kv(key: u64) -> KeyValue {
        KeyValue { key, value: key }
    }

    #[test]
    fn test_first_insert_creates_root_leaf() {
        let (mut file, mut hdr) = setup(128);
        insert(&mut file, &mut hdr, &kv(5)).expect("insert");
        assert!(hdr.root.is_defined());
        assert_eq!(hdr.root.node_nrec, 1);
        assert_eq!(hdr.root.all_nrec, 1);
        assert_eq!(hdr.depth, 0);
    }

    #[test]
    fn test_root_splits_when_full() {
        let (mut file, mut hdr) = setup(128);
        let leaf_max = hdr.info(0).max_nrec as u64;
        for key in 1..=leaf_max + 1 {
            insert(&mut file, &mut hdr, &kv(key)).expect("insert");
        }
        assert_eq!(hdr.depth, 1);
        assert_eq!(hdr.root.node_nrec, 1);
        assert_eq!(hdr.root.all_nrec, leaf_max + 1);
    }

    #[test]
    fn test_duplicate_rejected_without_change() {
        let (mut file, mut hdr) = setup(128);
        for key in [10, 20, 30] {
            insert(&mut file, &mut hdr, &kv(key)).expect("insert");
        }
        let before = hdr.persistent_state();
        let result = insert(&mut file, &mut hdr, &KeyValue { key: 20, value: 99 });
        assert!(matches!(result, Err(BTreeError::DuplicateRecord)));
        assert_eq!(hdr.persistent_state(), before);
    }

    #[test]
    fn test_update_modifies_or_inserts() {
        let (mut file, mut hdr) = setup(128);
        for key in 0..40 {
            insert(&mut file, &mut hdr, &kv(key * 2)).expect("insert");
        }

        let outcome = update(&mut file, &mut hdr, &KeyValue { key: 10, value: 7 }, |r| {
            r.value = 7;
            true
        })
        .expect("update");
        assert_eq!(outcome, UpdateOutcome::Modified);

        let outcome =
            update(&mut file, &mut hdr, &kv(10), |_| false).expect("update unchanged");
        assert_eq!(outcome, UpdateOutcome::Unchanged);

        // Odd keys are absent and go in wherever the descent lands
        for key in 0..40 {
            let outcome =
                update(&mut file, &mut hdr, &kv(key * 2 + 1), |_| true).expect("update insert");
            assert_eq!(outcome, UpdateOutcome::Inserted);
        }
        assert_eq!(hdr.root.all_nrec, 80);

        let mut records = Vec::new();
        iterate(&mut file, &hdr, |r| {
            records.push(*r);
            Walk::Continue
        })
        .expect("iterate");
        let keys: Vec<u64> = records.iter().map(|r| r.key).collect();
        assert_eq!(keys, (0..80).collect::<Vec<_>>());
        assert_eq!(records[10].value, 7);
    }

    #[test]
    fn test_modify_rejects_key_change() {
        let class = KeyValueClass;
        let mut record = kv(4);
        let result = modify_record(&class, &mut record, |r| {
            r.key = 5;
            true
        });
        assert!(matches!(result, Err(BTreeError::ComparatorOrCodecFailed(_))));
        assert_eq!(record, kv(4));

        let changed = modify_record(&class, &mut record, |r| {
            r.value = 1;
            true
        })
        .expect("modify");
        assert!(changed);
        assert_eq!(record.value, 1);
    }
}
