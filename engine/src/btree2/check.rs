//! Whole-tree walks: invariant checking, space accounting and dumps.

use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::btree2::error::BTreeError;
use crate::btree2::header::Header;
use crate::btree2::node::{NodePointer, protect_internal, protect_leaf, subtree_count};
use crate::btree2::record::RecordClass;
use crate::storage::{Access, CacheEntry, IndexFile, Storage, UnprotectFlags};

/// Verify the structure of the whole tree.
///
/// Checks that every pointer's counts match the node it leads to, that an
/// in-order walk is strictly increasing, that separators bound their
/// subtrees, and that every node other than the root is filled between its
/// merge threshold and its capacity.
pub fn check_invariants<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
) -> Result<(), BTreeError> {
    if !hdr.root.is_defined() {
        if hdr.root.all_nrec != 0 || hdr.depth != 0 {
            return Err(BTreeError::Corrupt(format!(
                "empty tree with {} records at depth {}",
                hdr.root.all_nrec, hdr.depth
            )));
        }
        return Ok(());
    }
    let mut checker = Checker {
        hdr,
        previous: None,
    };
    checker.node(file, hdr.depth, hdr.root, true)
}

struct Checker<'h, C: RecordClass> {
    hdr: &'h Header<C>,
    /// Last record seen by the in-order walk.
    previous: Option<C::Record>,
}

impl<C: RecordClass> Checker<'_, C> {
    fn node<S: Storage>(
        &mut self,
        file: &mut IndexFile<S>,
        depth: u16,
        ptr: NodePointer,
        is_root: bool,
    ) -> Result<(), BTreeError> {
        let (records, children) = if depth == 0 {
            let leaf = protect_leaf(file, self.hdr, &ptr, Access::Read)?;
            let records = leaf.records.clone();
            file.unprotect(ptr.addr, leaf, UnprotectFlags::NONE)?;
            (records, Vec::new())
        } else {
            let node = protect_internal(file, self.hdr, &ptr, depth, Access::Read)?;
            let contents = (node.records.clone(), node.children.clone());
            file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;
            contents
        };

        let nrec = records.len();
        let info = self.hdr.info(depth);
        let min = if is_root {
            usize::from(depth > 0)
        } else {
            info.merge_nrec
        };
        if nrec < min || nrec > info.max_nrec {
            return Err(BTreeError::Corrupt(format!(
                "node at {} (depth {depth}) holds {nrec} records, allowed {min}..={}",
                ptr.addr, info.max_nrec
            )));
        }

        let all_nrec = if depth == 0 {
            nrec as u64
        } else {
            if children.len() != nrec + 1 {
                return Err(BTreeError::Corrupt(format!(
                    "node at {} has {nrec} records and {} children",
                    ptr.addr,
                    children.len()
                )));
            }
            subtree_count(nrec, Some(&children))
        };
        if all_nrec != ptr.all_nrec {
            return Err(BTreeError::Corrupt(format!(
                "pointer to {} counts {} records, subtree holds {all_nrec}",
                ptr.addr, ptr.all_nrec
            )));
        }

        for (idx, record) in records.iter().enumerate() {
            if let Some(child) = children.get(idx) {
                self.node(file, depth - 1, *child, false)?;
            }
            self.record(record)?;
        }
        if let Some(child) = children.last() {
            self.node(file, depth - 1, *child, false)?;
        }
        Ok(())
    }

    fn record(&mut self, record: &C::Record) -> Result<(), BTreeError> {
        let class = &self.hdr.layout.class;
        if let Some(previous) = &self.previous {
            if class.compare(class.key_of(previous), record)? != Ordering::Less {
                return Err(BTreeError::Corrupt(format!(
                    "record {} does not follow {}",
                    class.debug(record),
                    class.debug(previous)
                )));
            }
        }
        self.previous = Some(record.clone());
        Ok(())
    }
}

/// Bytes used by the header and every node of the tree.
pub fn size<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
) -> Result<u64, BTreeError> {
    let mut total = hdr.image_len() as u64;
    if hdr.root.is_defined() {
        total += node_count(file, hdr, hdr.depth, hdr.root)? * hdr.layout.node_size as u64;
    }
    Ok(total)
}

fn node_count<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    depth: u16,
    ptr: NodePointer,
) -> Result<u64, BTreeError> {
    if depth == 0 {
        return Ok(1);
    }
    let node = protect_internal(file, hdr, &ptr, depth, Access::Read)?;
    let children = node.children.clone();
    file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;

    if depth == 1 {
        return Ok(1 + children.len() as u64);
    }
    let mut count = 1;
    for child in children {
        count += node_count(file, hdr, depth - 1, child)?;
    }
    Ok(count)
}

/// Render the header and every node, one line each, indented by depth.
pub fn debug_dump<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
) -> Result<String, BTreeError> {
    let mut out = format!(
        "tree {} at {}: class {}, depth {}, {} records, split {}%, merge {}%\n",
        C::NAME,
        hdr.addr,
        C::ID,
        hdr.depth,
        hdr.root.all_nrec,
        hdr.split_percent,
        hdr.merge_percent
    );
    if hdr.root.is_defined() {
        dump_node(file, hdr, hdr.depth, hdr.root, 1, &mut out)?;
    }
    Ok(out)
}

fn dump_node<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    depth: u16,
    ptr: NodePointer,
    indent: usize,
    out: &mut String,
) -> Result<(), BTreeError> {
    let class = &hdr.layout.class;
    let pad = "  ".repeat(indent);

    if depth == 0 {
        let leaf = protect_leaf(file, hdr, &ptr, Access::Read)?;
        let records: Vec<String> = leaf.records.iter().map(|r| class.debug(r)).collect();
        file.unprotect(ptr.addr, leaf, UnprotectFlags::NONE)?;
        let _ = writeln!(out, "{pad}leaf {}: [{}]", ptr.addr, records.join(", "));
        return Ok(());
    }

    let node = protect_internal(file, hdr, &ptr, depth, Access::Read)?;
    let records: Vec<String> = node.records.iter().map(|r| class.debug(r)).collect();
    let children = node.children.clone();
    file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;

    let _ = writeln!(
        out,
        "{pad}internal {} (depth {depth}, {} below): [{}]",
        ptr.addr,
        ptr.all_nrec,
        records.join(", ")
    );
    for child in children {
        dump_node(file, hdr, depth - 1, child, indent + 1, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::btree2::header::{CreateParams, Layout};
    use crate::btree2::insert::insert;
    use crate::btree2::node::{LeafNode, create_node};
    use crate::btree2::record::{KeyValue, KeyValueClass};
    use crate::simulation::SimulatedStorage;
    use crate::storage::FileOptions;

    fn setup() -> (IndexFile<SimulatedStorage>, Header<KeyValueClass>) {
        let file =
            IndexFile::create(SimulatedStorage::new(2), FileOptions::default()).expect("file");
        let layout = Arc::new(Layout::new(KeyValueClass, 128, 8, 8).expect("layout"));
        let hdr = Header::new(
            layout,
            8,
            CreateParams {
                node_size: 128,
                ..CreateParams::default()
            },
            false,
        )
        .expect("header");
        (file, hdr)
    }

    #[test]
    fn test_valid_tree_passes() {
        let (mut file, mut hdr) = setup();
        check_invariants(&mut file, &hdr).expect("empty tree");
        for key in (0..200).rev() {
            insert(&mut file, &mut hdr, &KeyValue { key, value: 0 }).expect("insert");
        }
        check_invariants(&mut file, &hdr).expect("invariants");
    }

    #[test]
    fn test_bad_counts_detected() {
        let (mut file, mut hdr) = setup();
        let leaf = LeafNode::new(&hdr, vec![KeyValue { key: 1, value: 1 }]);
        let addr = create_node(&mut file, leaf).expect("leaf");
        hdr.root = NodePointer {
            addr,
            node_nrec: 1,
            all_nrec: 5,
        };
        assert!(matches!(
            check_invariants(&mut file, &hdr),
            Err(BTreeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_unsorted_leaf_detected() {
        let (mut file, mut hdr) = setup();
        let records = vec![
            KeyValue { key: 5, value: 0 },
            KeyValue { key: 3, value: 0 },
        ];
        let leaf = LeafNode::new(&hdr, records);
        let addr = create_node(&mut file, leaf).expect("leaf");
        hdr.root = NodePointer {
            addr,
            node_nrec: 2,
            all_nrec: 2,
        };
        assert!(matches!(
            check_invariants(&mut file, &hdr),
            Err(BTreeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_size_and_dump() {
        let (mut file, mut hdr) = setup();
        assert_eq!(size(&mut file, &hdr).expect("size"), hdr.image_len() as u64);
        for key in 0..8 {
            insert(&mut file, &mut hdr, &KeyValue { key, value: key }).expect("insert");
        }
        // A root and two leaves
        assert_eq!(hdr.depth, 1);
        assert_eq!(
            size(&mut file, &hdr).expect("size"),
            hdr.image_len() as u64 + 3 * 128
        );

        let dump = debug_dump(&mut file, &hdr).expect("dump");
        assert!(dump.starts_with("tree key-value"));
        assert!(dump.contains("internal"));
        assert!(dump.contains("7 => 7"));
        assert_eq!(dump.lines().count(), 4);
    }
}
