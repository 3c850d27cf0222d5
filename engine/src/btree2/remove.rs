//! Removal by key and by rank.
//!
//! Removal descends from the root and tops up a child before it enters it:
//! a child at its merge threshold takes records from a sibling with surplus,
//! or is merged with its siblings when none has any. A record held by an
//! internal node is swapped with its in-order predecessor, the last record of
//! the rightmost leaf under its left child, so the actual removal always
//! happens in a leaf. A root left with one record over two small children is
//! collapsed first, which is the only way the tree gets shorter.

use std::cmp::Ordering;

use tracing::debug;

use crate::btree2::error::BTreeError;
use crate::btree2::header::Header;
use crate::btree2::insert::finish_internal;
use crate::btree2::node::{
    InternalNode, NodePointer, deletion_flags, protect_internal, protect_leaf, release_node,
};
use crate::btree2::rebalance::{merge2, merge3, redistribute2, redistribute3};
use crate::btree2::record::{RecordClass, insertion_point};
use crate::btree2::search::{IterOrder, RankStep, find, route_rank};
use crate::storage::{Access, IndexFile, Storage, UnprotectFlags};

/// Rebalance attempts per level before a merge is forced.
const REBALANCE_RETRIES: u8 = 2;

/// Which record a removal descent is after.
enum Target<'q, Q: ?Sized> {
    Key(&'q Q),
    Rank(u64),
    /// The last record of the subtree: the predecessor being swapped up.
    Last,
}

impl<Q: ?Sized> Clone for Target<'_, Q> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Q: ?Sized> Copy for Target<'_, Q> {}

/// Remove the record matching `query` and return it.
pub fn remove<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &mut Header<C>,
    query: &C::Query,
) -> Result<C::Record, BTreeError> {
    if find(file, hdr, query)?.is_none() {
        return Err(BTreeError::RecordNotFound);
    }
    remove_target(file, hdr, Target::Key(query))
}

/// Remove the record at rank `n` in the given order and return it.
pub fn remove_by_idx<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &mut Header<C>,
    order: IterOrder,
    n: u64,
) -> Result<C::Record, BTreeError> {
    let len = hdr.root.all_nrec;
    if n >= len {
        return Err(BTreeError::IndexOutOfRange { index: n, len });
    }
    let rank = match order {
        IterOrder::Ascending => n,
        IterOrder::Descending => len - 1 - n,
    };
    remove_target(file, hdr, Target::Rank(rank))
}

fn remove_target<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &mut Header<C>,
    target: Target<'_, C::Query>,
) -> Result<C::Record, BTreeError> {
    hdr.forget_bounds();
    if hdr.depth > 0 && hdr.root.node_nrec == 1 {
        collapse_root(file, hdr)?;
    }

    let mut root = hdr.root;
    let result = if hdr.depth == 0 {
        remove_leaf(file, hdr, &mut root, target)
    } else {
        remove_internal(file, hdr, hdr.depth, &mut root, target, None)
    };
    hdr.root = root;
    result
}

/// Merge the two children of a one-record root into a new root, if they fit.
fn collapse_root<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &mut Header<C>,
) -> Result<(), BTreeError> {
    let depth = hdr.depth;
    let old_root = hdr.root.addr;
    let info = *hdr.info(depth - 1);
    let mut node = protect_internal(file, hdr, &hdr.root, depth, Access::Write)?;

    let merged = node.children[0].node_nrec + node.children[1].node_nrec + 1;
    if merged > 2 * info.merge_nrec + 2 || merged > info.max_nrec {
        file.unprotect(old_root, node, UnprotectFlags::NONE)?;
        return Ok(());
    }

    if let Err(e) = merge2(file, hdr, &mut node, 0) {
        file.unprotect(old_root, node, UnprotectFlags::DIRTIED)?;
        return Err(e);
    }
    let child = node.children[0];
    file.unprotect(old_root, node, deletion_flags(hdr))?;

    hdr.root = child;
    hdr.depth = depth - 1;
    debug!(old = old_root, new = child.addr, depth = hdr.depth, "root collapsed");
    Ok(())
}

fn remove_leaf<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    ptr: &mut NodePointer,
    target: Target<'_, C::Query>,
) -> Result<C::Record, BTreeError> {
    let class = &hdr.layout.class;
    let mut leaf = protect_leaf(file, hdr, ptr, Access::Write)?;

    let nrec = leaf.records.len();
    let located = match target {
        Target::Key(query) => insertion_point(class, &leaf.records, query)
            .map_err(BTreeError::from)
            .and_then(|(idx, cmp)| {
                if cmp == Ordering::Equal {
                    Ok(idx)
                } else {
                    Err(BTreeError::RecordNotFound)
                }
            }),
        Target::Rank(n) => usize::try_from(n)
            .ok()
            .filter(|&idx| idx < nrec)
            .ok_or(BTreeError::IndexOutOfRange {
                index: n,
                len: nrec as u64,
            }),
        Target::Last => nrec.checked_sub(1).ok_or(BTreeError::RecordNotFound),
    };
    let idx = match located {
        Ok(idx) => idx,
        Err(e) => {
            file.unprotect(ptr.addr, leaf, UnprotectFlags::NONE)?;
            return Err(e);
        }
    };

    let removed = leaf.records.remove(idx);
    ptr.node_nrec = leaf.records.len();
    ptr.all_nrec = ptr.node_nrec as u64;

    if leaf.records.is_empty() {
        let addr = ptr.addr;
        file.unprotect(addr, leaf, deletion_flags(hdr))?;
        *ptr = NodePointer::EMPTY;
        debug!(addr, "empty leaf deleted");
    } else {
        release_node(file, hdr, ptr, leaf, true)?;
    }
    Ok(removed)
}

/// Exchange `swap` with the last record of the leaf `ptr` leads to.
fn swap_leaf<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    ptr: &mut NodePointer,
    swap: &mut C::Record,
) -> Result<(), BTreeError> {
    let mut leaf = protect_leaf(file, hdr, ptr, Access::Write)?;
    let Some(last) = leaf.records.last_mut() else {
        file.unprotect(ptr.addr, leaf, UnprotectFlags::NONE)?;
        return Err(BTreeError::Corrupt(format!(
            "leaf at {} holds no predecessor",
            ptr.addr
        )));
    };
    std::mem::swap(last, swap);
    release_node(file, hdr, ptr, leaf, true)
}

fn remove_internal<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    depth: u16,
    ptr: &mut NodePointer,
    target: Target<'_, C::Query>,
    swap: Option<&mut C::Record>,
) -> Result<C::Record, BTreeError> {
    let mut node = protect_internal(file, hdr, ptr, depth, Access::Write)?;
    let result = remove_below(file, hdr, &mut node, target, swap);
    finish_internal(file, hdr, ptr, node, result.is_ok())?;
    result
}

/// The child a removal continues in.
struct Route<'q, Q: ?Sized> {
    child: usize,
    /// The record is this node's separator just after `child`.
    found: bool,
    /// What to look for inside the child.
    target: Target<'q, Q>,
}

fn route<'q, C: RecordClass>(
    class: &C,
    node: &InternalNode<C>,
    target: Target<'q, C::Query>,
) -> Result<Route<'q, C::Query>, BTreeError> {
    let route = match target {
        Target::Key(query) => {
            let (idx, cmp) = insertion_point(class, &node.records, query)?;
            let found = cmp == Ordering::Equal;
            Route {
                child: idx,
                found,
                target: if found { Target::Last } else { target },
            }
        }
        Target::Rank(rank) => match route_rank(&node.children, rank) {
            RankStep::Record(idx) => Route {
                child: idx,
                found: true,
                target: Target::Last,
            },
            RankStep::Child(idx, child_rank) => Route {
                child: idx,
                found: false,
                target: Target::Rank(child_rank),
            },
        },
        Target::Last => Route {
            child: node.records.len(),
            found: false,
            target,
        },
    };
    Ok(route)
}

fn remove_below<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    node: &mut InternalNode<C>,
    target: Target<'_, C::Query>,
    swap: Option<&mut C::Record>,
) -> Result<C::Record, BTreeError> {
    let class = &hdr.layout.class;
    let child_depth = node.depth - 1;
    let merge_nrec = hdr.info(child_depth).merge_nrec;

    let mut step = route(class, node, target)?;
    let mut retries = REBALANCE_RETRIES;
    while node.children[step.child].node_nrec <= merge_nrec {
        fill_child(file, hdr, node, step.child, retries > 0)?;
        step = route(class, node, target)?;
        retries = retries.saturating_sub(1);
    }

    let idx = step.child;
    let (records, children) = (&mut node.records, &mut node.children);
    let swap = if step.found {
        Some(&mut records[idx])
    } else {
        swap
    };
    let child = &mut children[idx];

    if child_depth == 0 {
        if let Some(swap) = swap {
            swap_leaf(file, hdr, child, swap)?;
        }
        remove_leaf(file, hdr, child, step.target)
    } else {
        remove_internal(file, hdr, child_depth, child, step.target, swap)
    }
}

/// Bring child `idx` above its merge threshold.
///
/// A merge that would overflow the merged node is replaced by a
/// redistribution, which always suffices in that case.
fn fill_child<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    node: &mut InternalNode<C>,
    idx: usize,
    may_redistribute: bool,
) -> Result<(), BTreeError> {
    let info = hdr.info(node.depth - 1);
    let (merge_nrec, max_nrec) = (info.merge_nrec, info.max_nrec);
    let nrec = node.records.len();
    let count = |i: usize| node.children[i].node_nrec;

    if idx == 0 {
        let (child, right) = (count(0), count(1));
        if (may_redistribute && right > merge_nrec) || child + right + 1 > max_nrec {
            redistribute2(file, hdr, node, 0)
        } else {
            merge2(file, hdr, node, 0)
        }
    } else if idx == nrec {
        let (left, child) = (count(idx - 1), count(idx));
        if (may_redistribute && left > merge_nrec) || left + child + 1 > max_nrec {
            redistribute2(file, hdr, node, idx - 1)
        } else {
            merge2(file, hdr, node, idx - 1)
        }
    } else {
        let (left, child, right) = (count(idx - 1), count(idx), count(idx + 1));
        let surplus = left > merge_nrec || right > merge_nrec;
        if (may_redistribute && surplus) || (left + child + right + 1).div_ceil(2) > max_nrec {
            redistribute3(file, hdr, node, idx)
        } else {
            merge3(file, hdr, node, idx)
        }
    }
}
