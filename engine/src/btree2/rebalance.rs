//! Splitting, merging and redistributing sibling nodes.
//!
//! All five operations share one shape. The records of a run of adjacent
//! children are laid out in key order together with the parent's separators
//! between them, then cut again into a new run of children with new record
//! counts; the records at the cuts become the new separators. A split cuts
//! one child into two, a merge cuts two or three children into one fewer and
//! a redistribution keeps the number of children and evens their counts.
//!
//! The parent is handed in already protected. The children are protected
//! (and shadowed, in SWMR mode, if they survive) for the duration of the
//! operation. Children that are merged away are deleted from the cache.
//! The parent's own total record count never changes.

use tracing::debug;

use crate::btree2::error::BTreeError;
use crate::btree2::header::Header;
use crate::btree2::node::{
    Child, InternalNode, NodePointer, create_child, deletion_flags, protect_child, release_child,
};
use crate::btree2::record::RecordClass;
use crate::storage::{IndexFile, Storage, UnprotectFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Split,
    Merge,
    Redistribute,
}

impl Kind {
    fn error(self, msg: String) -> BTreeError {
        match self {
            Self::Split => BTreeError::CantSplit(msg),
            Self::Merge => BTreeError::CantMerge(msg),
            Self::Redistribute => BTreeError::CantRedistribute(msg),
        }
    }
}

/// Split child `idx` in two, promoting its middle record into `parent`.
///
/// The left half keeps `nrec / 2` records.
pub fn split1<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    parent: &mut InternalNode<C>,
    idx: usize,
) -> Result<(), BTreeError> {
    let nrec = parent.children[idx].node_nrec;
    let left = nrec / 2;
    let right = nrec
        .checked_sub(left + 1)
        .ok_or_else(|| BTreeError::CantSplit(format!("child {idx} holds {nrec} records")))?;
    rebalance(file, hdr, parent, idx, 1, &[left, right], Kind::Split)
}

/// Even out the records of children `idx` and `idx + 1`.
///
/// When the total is odd the smaller child gets the extra record.
pub fn redistribute2<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    parent: &mut InternalNode<C>,
    idx: usize,
) -> Result<(), BTreeError> {
    let left = parent.children[idx].node_nrec;
    let right = parent.children[idx + 1].node_nrec;
    let total = left + right;
    let targets = if left < right {
        [total - total / 2, total / 2]
    } else {
        [total / 2, total - total / 2]
    };
    rebalance(file, hdr, parent, idx, 2, &targets, Kind::Redistribute)
}

/// Even out the records of children `idx - 1`, `idx` and `idx + 1`.
pub fn redistribute3<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    parent: &mut InternalNode<C>,
    idx: usize,
) -> Result<(), BTreeError> {
    let total: usize = parent.children[idx - 1..=idx + 1]
        .iter()
        .map(|c| c.node_nrec)
        .sum();
    let middle = total / 3;
    let left = (total - middle) / 2;
    let right = total - middle - left;
    rebalance(file, hdr, parent, idx - 1, 3, &[left, middle, right], Kind::Redistribute)
}

/// Merge child `idx + 1` and the separator before it into child `idx`.
pub fn merge2<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    parent: &mut InternalNode<C>,
    idx: usize,
) -> Result<(), BTreeError> {
    let total = parent.children[idx].node_nrec + parent.children[idx + 1].node_nrec + 1;
    rebalance(file, hdr, parent, idx, 2, &[total], Kind::Merge)
}

/// Merge children `idx - 1`, `idx` and `idx + 1` into the first two.
pub fn merge3<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    parent: &mut InternalNode<C>,
    idx: usize,
) -> Result<(), BTreeError> {
    let records: usize = parent.children[idx - 1..=idx + 1]
        .iter()
        .map(|c| c.node_nrec)
        .sum();
    // Three children and two separators become two children and one separator
    let total = records + 1;
    rebalance(
        file,
        hdr,
        parent,
        idx - 1,
        3,
        &[total / 2, total - total / 2],
        Kind::Merge,
    )
}

/// Re-cut children `first..first + count` of `parent` into `targets.len()`
/// children holding `targets[i]` records each.
fn rebalance<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    parent: &mut InternalNode<C>,
    first: usize,
    count: usize,
    targets: &[usize],
    kind: Kind,
) -> Result<(), BTreeError> {
    let Some(child_depth) = parent.depth.checked_sub(1) else {
        return Err(kind.error("parent is a leaf".to_string()));
    };
    if count == 0 || targets.is_empty() || first + count > parent.children.len() {
        return Err(kind.error(format!(
            "children {first}..{} of a node with {}",
            first + count,
            parent.children.len()
        )));
    }

    let before: usize = parent.children[first..first + count]
        .iter()
        .map(|c| c.node_nrec)
        .sum::<usize>()
        + count
        - 1;
    let after: usize = targets.iter().sum::<usize>() + targets.len() - 1;
    if before != after {
        return Err(kind.error(format!(
            "{before} records cannot be cut into {targets:?}"
        )));
    }
    let max_nrec = hdr.info(child_depth).max_nrec;
    if let Some(over) = targets.iter().find(|&&t| t > max_nrec) {
        return Err(kind.error(format!(
            "{over} records exceed the {max_nrec} a node at depth {child_depth} holds"
        )));
    }
    let parent_nrec = parent.records.len() + targets.len() - count;
    if parent_nrec > hdr.info(parent.depth).max_nrec {
        return Err(kind.error(format!(
            "parent at depth {} cannot hold {parent_nrec} records",
            parent.depth
        )));
    }

    let mut nodes: Vec<Child<C>> = Vec::with_capacity(count.max(targets.len()));
    for i in 0..count {
        let shadow = hdr.swmr_write && i < targets.len();
        match protect_child(file, hdr, &mut parent.children[first + i], child_depth, shadow) {
            Ok(node) => nodes.push(node),
            Err(e) => {
                for (ptr, node) in parent.children[first..].iter().zip(nodes) {
                    release_child(file, ptr.addr, node, UnprotectFlags::NONE)?;
                }
                return Err(e);
            }
        }
    }

    // Gather everything in key order
    let mut records = Vec::with_capacity(before);
    let mut pointers = Vec::new();
    let mut separators = parent.records.drain(first..first + count - 1);
    for node in &mut nodes {
        records.append(node.records_mut());
        if let Some(children) = node.children_mut() {
            pointers.append(children);
        }
        records.extend(separators.next());
    }
    drop(separators);

    while nodes.len() < targets.len() {
        let sibling = nodes[0].empty_sibling(hdr);
        nodes.push(sibling);
    }

    // Cut it again
    let mut records = records.into_iter();
    let mut pointers = pointers.into_iter();
    let mut new_separators = Vec::with_capacity(targets.len() - 1);
    for (i, (&target, node)) in targets.iter().zip(nodes.iter_mut()).enumerate() {
        node.records_mut().extend(records.by_ref().take(target));
        if let Some(children) = node.children_mut() {
            children.extend(pointers.by_ref().take(target + 1));
        }
        if i + 1 < targets.len() {
            new_separators.extend(records.next());
        }
    }
    parent.records.splice(first..first, new_separators);

    // Hand the children back, in order
    let mut result = Ok(());
    for (i, node) in nodes.into_iter().enumerate() {
        let (node_nrec, all_nrec) = node.counts();
        let released = if i < count && i < targets.len() {
            let ptr = &mut parent.children[first + i];
            ptr.node_nrec = node_nrec;
            ptr.all_nrec = all_nrec;
            release_child(file, ptr.addr, node, UnprotectFlags::DIRTIED)
        } else if i < count {
            let ptr = parent.children.remove(first + targets.len());
            debug!(addr = ptr.addr, depth = child_depth, "merged node deleted");
            release_child(file, ptr.addr, node, deletion_flags(hdr))
        } else {
            create_child(file, node).map(|addr| {
                let ptr = NodePointer {
                    addr,
                    node_nrec,
                    all_nrec,
                };
                parent.children.insert(first + i, ptr);
            })
        };
        result = result.and(released);
    }
    result
}
