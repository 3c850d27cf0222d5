//! Lookups, in-order walks and in-place modification.
//!
//! Read paths protect one node at a time for reading and copy out what they
//! need before moving to the next node.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::btree2::error::BTreeError;
use crate::btree2::header::Header;
use crate::btree2::insert::{finish_internal, modify_record};
use crate::btree2::node::{NodePointer, protect_internal, protect_leaf, release_node};
use crate::btree2::record::{RecordClass, insertion_point};
use crate::storage::{Access, IndexFile, Storage, UnprotectFlags};

/// Direction of a rank lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterOrder {
    /// Rank 0 is the smallest record.
    Ascending,
    /// Rank 0 is the largest record.
    Descending,
}

/// Which neighbor of a query to look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neighbor {
    /// The largest record strictly less than the query.
    Less,
    /// The smallest record strictly greater than the query.
    Greater,
}

/// Returned by iteration callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Continue,
    Stop,
}

/// Where a rank falls within an internal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RankStep {
    /// The rank is the node's own record at this index.
    Record(usize),
    /// The rank lies in this child, at the given rank within it.
    Child(usize, u64),
}

/// Locate `rank` among an internal node's children and separators.
pub(crate) fn route_rank(children: &[NodePointer], mut rank: u64) -> RankStep {
    let last = children.len().saturating_sub(1);
    for (idx, child) in children.iter().enumerate() {
        if idx == last || child.all_nrec > rank {
            return RankStep::Child(idx, rank);
        }
        if child.all_nrec == rank {
            return RankStep::Record(idx);
        }
        rank -= child.all_nrec + 1;
    }
    RankStep::Child(last, rank)
}

enum Step<R> {
    Found(R),
    Descend(NodePointer),
    Missing,
}

/// Whether a node lies on the leftmost or rightmost path from the root.
#[derive(Debug, Clone, Copy)]
struct Spine {
    left: bool,
    right: bool,
}

impl Spine {
    const ROOT: Self = Self {
        left: true,
        right: true,
    };

    const fn child(self, idx: usize, children: usize) -> Self {
        Self {
            left: self.left && idx == 0,
            right: self.right && idx + 1 == children,
        }
    }
}

/// Whether `query` lies below the smallest or above the largest record seen.
fn outside_known_bounds<C: RecordClass>(
    hdr: &Header<C>,
    query: &C::Query,
) -> Result<bool, BTreeError> {
    let class = &hdr.layout.class;
    if let Some(min) = hdr.known_min() {
        if class.compare(query, min)? == Ordering::Less {
            return Ok(true);
        }
    }
    if let Some(max) = hdr.known_max() {
        if class.compare(query, max)? == Ordering::Greater {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether the remembered bounds show no record lies beyond `query`.
fn past_known_end<C: RecordClass>(
    hdr: &Header<C>,
    direction: Neighbor,
    query: &C::Query,
) -> Result<bool, BTreeError> {
    let class = &hdr.layout.class;
    let past = match direction {
        Neighbor::Less => match hdr.known_min() {
            Some(min) => class.compare(query, min)? != Ordering::Greater,
            None => false,
        },
        Neighbor::Greater => match hdr.known_max() {
            Some(max) => class.compare(query, max)? != Ordering::Less,
            None => false,
        },
    };
    Ok(past)
}

/// Find the record matching `query`.
///
/// A query outside the smallest and largest records seen by earlier
/// lookups returns without reading a node.
pub fn find<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &mut Header<C>,
    query: &C::Query,
) -> Result<Option<C::Record>, BTreeError> {
    if !hdr.root.is_defined() || outside_known_bounds(hdr, query)? {
        return Ok(None);
    }
    let layout = Arc::clone(&hdr.layout);
    let class = &layout.class;
    let mut ptr = hdr.root;
    let mut depth = hdr.depth;
    let mut spine = Spine::ROOT;

    loop {
        let step = if depth == 0 {
            let leaf = protect_leaf(file, hdr, &ptr, Access::Read)?;
            hdr.note_edge_leaf(spine.left, spine.right, &leaf.records);
            let step = insertion_point(class, &leaf.records, query).map(|(idx, cmp)| {
                if cmp == Ordering::Equal {
                    Step::Found(leaf.records[idx].clone())
                } else {
                    Step::Missing
                }
            });
            file.unprotect(ptr.addr, leaf, UnprotectFlags::NONE)?;
            step?
        } else {
            let node = protect_internal(file, hdr, &ptr, depth, Access::Read)?;
            let step = match insertion_point(class, &node.records, query) {
                Ok((idx, Ordering::Equal)) => Ok(Step::Found(node.records[idx].clone())),
                Ok((idx, _)) => {
                    spine = spine.child(idx, node.children.len());
                    Ok(Step::Descend(node.children[idx]))
                }
                Err(e) => Err(e),
            };
            file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;
            step?
        };

        match step {
            Step::Found(record) => return Ok(Some(record)),
            Step::Missing => return Ok(None),
            Step::Descend(child) => {
                ptr = child;
                depth -= 1;
            }
        }
    }
}

/// The record at rank `n` in the given order.
pub fn index<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    order: IterOrder,
    n: u64,
) -> Result<C::Record, BTreeError> {
    let len = hdr.root.all_nrec;
    if n >= len {
        return Err(BTreeError::IndexOutOfRange { index: n, len });
    }
    let mut rank = match order {
        IterOrder::Ascending => n,
        IterOrder::Descending => len - 1 - n,
    };
    let mut ptr = hdr.root;
    let mut depth = hdr.depth;

    loop {
        if depth == 0 {
            let leaf = protect_leaf(file, hdr, &ptr, Access::Read)?;
            let record = usize::try_from(rank)
                .ok()
                .and_then(|i| leaf.records.get(i))
                .cloned();
            file.unprotect(ptr.addr, leaf, UnprotectFlags::NONE)?;
            return record.ok_or_else(|| {
                BTreeError::Corrupt(format!("leaf at {} is missing rank {rank}", ptr.addr))
            });
        }

        let node = protect_internal(file, hdr, &ptr, depth, Access::Read)?;
        let step = match route_rank(&node.children, rank) {
            RankStep::Record(idx) => Step::Found(node.records[idx].clone()),
            RankStep::Child(idx, child_rank) => {
                rank = child_rank;
                Step::Descend(node.children[idx])
            }
        };
        file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;

        match step {
            Step::Found(record) => return Ok(record),
            Step::Descend(child) => {
                ptr = child;
                depth -= 1;
            }
            Step::Missing => return Err(BTreeError::RecordNotFound),
        }
    }
}

/// Index of the first record that is not behind `query` in `direction`.
fn neighbor_slot(direction: Neighbor, idx: usize, cmp: Ordering) -> usize {
    if cmp == Ordering::Equal && direction == Neighbor::Greater {
        idx + 1
    } else {
        idx
    }
}

/// The nearest record strictly less or strictly greater than `query`.
pub fn neighbor<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &mut Header<C>,
    direction: Neighbor,
    query: &C::Query,
) -> Result<C::Record, BTreeError> {
    if !hdr.root.is_defined() || past_known_end(hdr, direction, query)? {
        return Err(BTreeError::RecordNotFound);
    }
    let layout = Arc::clone(&hdr.layout);
    let class = &layout.class;
    let mut ptr = hdr.root;
    let mut depth = hdr.depth;
    let mut spine = Spine::ROOT;
    let mut candidate: Option<C::Record> = None;

    loop {
        if depth == 0 {
            let leaf = protect_leaf(file, hdr, &ptr, Access::Read)?;
            hdr.note_edge_leaf(spine.left, spine.right, &leaf.records);
            let found = insertion_point(class, &leaf.records, query).map(|(idx, cmp)| {
                let idx = neighbor_slot(direction, idx, cmp);
                match direction {
                    Neighbor::Less => idx.checked_sub(1).map(|i| leaf.records[i].clone()),
                    Neighbor::Greater => leaf.records.get(idx).cloned(),
                }
            });
            file.unprotect(ptr.addr, leaf, UnprotectFlags::NONE)?;
            return found?.or(candidate).ok_or(BTreeError::RecordNotFound);
        }

        let node = protect_internal(file, hdr, &ptr, depth, Access::Read)?;
        let step = insertion_point(class, &node.records, query).map(|(idx, cmp)| {
            let idx = neighbor_slot(direction, idx, cmp);
            let nearer = match direction {
                Neighbor::Less => idx.checked_sub(1).map(|i| node.records[i].clone()),
                Neighbor::Greater => node.records.get(idx).cloned(),
            };
            (nearer, spine.child(idx, node.children.len()), node.children[idx])
        });
        file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;

        let (nearer, below, child) = step?;
        if nearer.is_some() {
            candidate = nearer;
        }
        spine = below;
        ptr = child;
        depth -= 1;
    }
}

/// Walk every record in order until `op` stops the walk.
pub fn iterate<C, S, F>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    mut op: F,
) -> Result<Walk, BTreeError>
where
    C: RecordClass,
    S: Storage,
    F: FnMut(&C::Record) -> Walk,
{
    if !hdr.root.is_defined() {
        return Ok(Walk::Continue);
    }
    iterate_node(file, hdr, hdr.depth, hdr.root, &mut op)
}

fn iterate_node<C, S, F>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    depth: u16,
    ptr: NodePointer,
    op: &mut F,
) -> Result<Walk, BTreeError>
where
    C: RecordClass,
    S: Storage,
    F: FnMut(&C::Record) -> Walk,
{
    if depth == 0 {
        let leaf = protect_leaf(file, hdr, &ptr, Access::Read)?;
        let records = leaf.records.clone();
        file.unprotect(ptr.addr, leaf, UnprotectFlags::NONE)?;
        for record in &records {
            if op(record) == Walk::Stop {
                return Ok(Walk::Stop);
            }
        }
        return Ok(Walk::Continue);
    }

    let node = protect_internal(file, hdr, &ptr, depth, Access::Read)?;
    let records = node.records.clone();
    let children = node.children.clone();
    file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;

    for (idx, child) in children.into_iter().enumerate() {
        if iterate_node(file, hdr, depth - 1, child, op)? == Walk::Stop {
            return Ok(Walk::Stop);
        }
        if let Some(record) = records.get(idx) {
            if op(record) == Walk::Stop {
                return Ok(Walk::Stop);
            }
        }
    }
    Ok(Walk::Continue)
}

/// Change the record matching `query` in place.
///
/// `op` returns whether it changed the record; it must not change the
/// record's position in key order. Returns whether the record changed.
pub fn modify<C, S, F>(
    file: &mut IndexFile<S>,
    hdr: &mut Header<C>,
    query: &C::Query,
    op: F,
) -> Result<bool, BTreeError>
where
    C: RecordClass,
    S: Storage,
    F: FnOnce(&mut C::Record) -> bool,
{
    if !hdr.root.is_defined() {
        return Err(BTreeError::RecordNotFound);
    }
    hdr.forget_bounds();
    let mut root = hdr.root;
    let result = modify_node(file, hdr, hdr.depth, &mut root, query, op);
    hdr.root = root;
    result
}

fn modify_node<C, S, F>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    depth: u16,
    ptr: &mut NodePointer,
    query: &C::Query,
    op: F,
) -> Result<bool, BTreeError>
where
    C: RecordClass,
    S: Storage,
    F: FnOnce(&mut C::Record) -> bool,
{
    let class = &hdr.layout.class;

    if depth == 0 {
        let mut leaf = protect_leaf(file, hdr, ptr, Access::Write)?;
        let result = match insertion_point(class, &leaf.records, query) {
            Ok((idx, Ordering::Equal)) => modify_record(class, &mut leaf.records[idx], op),
            Ok(_) => Err(BTreeError::RecordNotFound),
            Err(e) => Err(e.into()),
        };
        let changed = matches!(result, Ok(true));
        release_node(file, hdr, ptr, leaf, changed)?;
        return result;
    }

    let mut node = protect_internal(file, hdr, ptr, depth, Access::Write)?;
    let (result, dirty) = match insertion_point(class, &node.records, query) {
        Ok((idx, Ordering::Equal)) => {
            let result = modify_record(class, &mut node.records[idx], op);
            let changed = matches!(result, Ok(true));
            (result, changed)
        }
        Ok((idx, _)) => {
            let before = node.children[idx];
            let result = modify_node(file, hdr, depth - 1, &mut node.children[idx], query, op);
            let moved = node.children[idx] != before;
            (result, moved)
        }
        Err(e) => (Err(e.into()), false),
    };

    if dirty {
        finish_internal(file, hdr, ptr, node, true)?;
    } else {
        release_node(file, hdr, ptr, node, false)?;
    }
    result
}
