//! Tree handles.
//!
//! A [`BTree2`] names a tree by its header address. The header itself lives
//! in the file's metadata cache, pinned while any handle is open; every
//! operation protects it for the duration of the call and hands it back
//! dirty only when the root pointer or depth changed.

use std::sync::Arc;

use tracing::{debug, info};

use crate::btree2::check;
use crate::btree2::error::BTreeError;
use crate::btree2::header::{CreateParams, Header, Layout};
use crate::btree2::insert::{self, UpdateOutcome};
use crate::btree2::node::{NodePointer, protect_internal, protect_leaf};
use crate::btree2::record::RecordClass;
use crate::btree2::remove;
use crate::btree2::search::{self, IterOrder, Neighbor, Walk};
use crate::storage::{
    Access, Address, CacheEntry, EntryKind, IndexFile, Storage, UNDEFINED_ADDRESS, UnprotectFlags,
};

/// An open tree.
#[derive(Debug)]
pub struct BTree2<C: RecordClass> {
    addr: Address,
    class: C,
}

impl<C: RecordClass> BTree2<C> {
    /// Create an empty tree and open a handle on it.
    pub fn create<S: Storage>(
        file: &mut IndexFile<S>,
        class: C,
        params: CreateParams,
    ) -> Result<Self, BTreeError> {
        let layout = Arc::new(Layout::new(
            class.clone(),
            params.node_size as usize,
            file.address_width(),
            file.length_width(),
        )?);
        let mut hdr = Header::new(layout, UNDEFINED_ADDRESS, params, file.swmr_write())?;
        let addr = file.allocate(hdr.image_len())?;
        hdr.addr = addr;
        hdr.file_rc = 1;
        file.insert_entry(addr, hdr)?;
        file.pin(addr)?;

        info!(
            addr,
            class = C::NAME,
            node_size = params.node_size,
            split_percent = params.split_percent,
            merge_percent = params.merge_percent,
            "tree created"
        );
        Ok(Self { addr, class })
    }

    /// Open a handle on the tree whose header is at `addr`.
    pub fn open<S: Storage>(
        file: &mut IndexFile<S>,
        class: C,
        addr: Address,
    ) -> Result<Self, BTreeError> {
        let mut hdr = protect_header(file, &class, addr, Access::Write)?;
        hdr.file_rc += 1;
        let open_handles = hdr.file_rc;
        let depth = hdr.depth;
        let nrec = hdr.root.all_nrec;
        file.unprotect(addr, hdr, UnprotectFlags::NONE)?;
        file.pin(addr)?;

        info!(addr, class = C::NAME, depth, nrec, open_handles, "tree opened");
        Ok(Self { addr, class })
    }

    /// Close the handle. The last handle on a tree marked for deletion
    /// deletes it.
    pub fn close<S: Storage>(self, file: &mut IndexFile<S>) -> Result<(), BTreeError> {
        let mut hdr = protect_header(file, &self.class, self.addr, Access::Write)?;
        hdr.file_rc = hdr.file_rc.saturating_sub(1);
        let open_handles = hdr.file_rc;
        let pending = hdr.pending_delete;
        file.unprotect(self.addr, hdr, UnprotectFlags::NONE)?;
        file.unpin(self.addr)?;
        info!(addr = self.addr, open_handles, "tree closed");

        if pending && open_handles == 0 {
            let hdr = protect_header(file, &self.class, self.addr, Access::Write)?;
            delete_tree(file, hdr, &mut |_: &C::Record| {})?;
        }
        Ok(())
    }

    /// Delete the tree at `addr`, calling `op` on every record first.
    ///
    /// A tree with open handles is only marked; the last `close` deletes it
    /// and `op` is not called.
    pub fn delete<S, F>(
        file: &mut IndexFile<S>,
        class: C,
        addr: Address,
        mut op: F,
    ) -> Result<(), BTreeError>
    where
        S: Storage,
        F: FnMut(&C::Record),
    {
        let mut hdr = protect_header(file, &class, addr, Access::Write)?;
        if hdr.file_rc > 0 {
            hdr.pending_delete = true;
            let open_handles = hdr.file_rc;
            file.unprotect(addr, hdr, UnprotectFlags::NONE)?;
            debug!(addr, open_handles, "tree deletion deferred");
            return Ok(());
        }
        delete_tree(file, hdr, &mut op)
    }

    /// Address of the tree's header.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.addr
    }

    #[must_use]
    pub const fn class(&self) -> &C {
        &self.class
    }

    /// Insert a new record; fails with `DuplicateRecord` if its key exists.
    pub fn insert<S: Storage>(
        &self,
        file: &mut IndexFile<S>,
        udata: &C::Insert,
    ) -> Result<(), BTreeError> {
        self.with_header(file, Access::Write, |file, hdr| {
            insert::insert(file, hdr, udata)
        })
    }

    /// Change the record matching `udata` with `op`, or insert it if absent.
    pub fn update<S, F>(
        &self,
        file: &mut IndexFile<S>,
        udata: &C::Insert,
        op: F,
    ) -> Result<UpdateOutcome, BTreeError>
    where
        S: Storage,
        F: FnOnce(&mut C::Record) -> bool,
    {
        self.with_header(file, Access::Write, |file, hdr| {
            insert::update(file, hdr, udata, op)
        })
    }

    pub fn find<S: Storage>(
        &self,
        file: &mut IndexFile<S>,
        query: &C::Query,
    ) -> Result<Option<C::Record>, BTreeError> {
        self.with_header(file, Access::Read, |file, hdr| search::find(file, hdr, query))
    }

    /// The record at rank `n` in the given order.
    pub fn index<S: Storage>(
        &self,
        file: &mut IndexFile<S>,
        order: IterOrder,
        n: u64,
    ) -> Result<C::Record, BTreeError> {
        self.with_header(file, Access::Read, |file, hdr| {
            search::index(file, hdr, order, n)
        })
    }

    /// The nearest record strictly on one side of `query`.
    pub fn neighbor<S: Storage>(
        &self,
        file: &mut IndexFile<S>,
        direction: Neighbor,
        query: &C::Query,
    ) -> Result<C::Record, BTreeError> {
        self.with_header(file, Access::Read, |file, hdr| {
            search::neighbor(file, hdr, direction, query)
        })
    }

    /// Walk every record in key order until `op` returns [`Walk::Stop`].
    pub fn iterate<S, F>(&self, file: &mut IndexFile<S>, op: F) -> Result<Walk, BTreeError>
    where
        S: Storage,
        F: FnMut(&C::Record) -> Walk,
    {
        self.with_header(file, Access::Read, |file, hdr| search::iterate(file, hdr, op))
    }

    /// Change the record matching `query` in place. Returns whether it changed.
    pub fn modify<S, F>(
        &self,
        file: &mut IndexFile<S>,
        query: &C::Query,
        op: F,
    ) -> Result<bool, BTreeError>
    where
        S: Storage,
        F: FnOnce(&mut C::Record) -> bool,
    {
        self.with_header(file, Access::Write, |file, hdr| {
            search::modify(file, hdr, query, op)
        })
    }

    /// Remove the record matching `query` and return it.
    pub fn remove<S: Storage>(
        &self,
        file: &mut IndexFile<S>,
        query: &C::Query,
    ) -> Result<C::Record, BTreeError> {
        self.with_header(file, Access::Write, |file, hdr| {
            remove::remove(file, hdr, query)
        })
    }

    /// Remove the record at rank `n` in the given order and return it.
    pub fn remove_by_idx<S: Storage>(
        &self,
        file: &mut IndexFile<S>,
        order: IterOrder,
        n: u64,
    ) -> Result<C::Record, BTreeError> {
        self.with_header(file, Access::Write, |file, hdr| {
            remove::remove_by_idx(file, hdr, order, n)
        })
    }

    /// Total number of records.
    pub fn get_nrec<S: Storage>(&self, file: &mut IndexFile<S>) -> Result<u64, BTreeError> {
        self.with_header(file, Access::Read, |_, hdr| Ok(hdr.root.all_nrec))
    }

    /// Depth of the root; a tree of one leaf has depth 0.
    pub fn depth<S: Storage>(&self, file: &mut IndexFile<S>) -> Result<u16, BTreeError> {
        self.with_header(file, Access::Read, |_, hdr| Ok(hdr.depth))
    }

    /// Pointer to the root node.
    pub fn root<S: Storage>(&self, file: &mut IndexFile<S>) -> Result<NodePointer, BTreeError> {
        self.with_header(file, Access::Read, |_, hdr| Ok(hdr.root))
    }

    /// Bytes used by the header and all nodes.
    pub fn size<S: Storage>(&self, file: &mut IndexFile<S>) -> Result<u64, BTreeError> {
        self.with_header(file, Access::Read, |file, hdr| check::size(file, hdr))
    }

    pub fn check_invariants<S: Storage>(&self, file: &mut IndexFile<S>) -> Result<(), BTreeError> {
        self.with_header(file, Access::Read, |file, hdr| {
            check::check_invariants(file, hdr)
        })
    }

    pub fn debug_dump<S: Storage>(&self, file: &mut IndexFile<S>) -> Result<String, BTreeError> {
        self.with_header(file, Access::Read, |file, hdr| check::debug_dump(file, hdr))
    }

    /// Start a new shadow epoch.
    ///
    /// Call once readers can no longer see node images written before the
    /// last flush. Every node is relocated again the next time it changes.
    pub fn advance_shadow_epoch<S: Storage>(
        &self,
        file: &mut IndexFile<S>,
    ) -> Result<u64, BTreeError> {
        self.with_header(file, Access::Write, |_, hdr| {
            hdr.shadow_epoch += 1;
            debug!(addr = hdr.addr, epoch = hdr.shadow_epoch, "shadow epoch advanced");
            Ok(hdr.shadow_epoch)
        })
    }

    /// Run `op` with the header protected, handing it back dirty only if
    /// the root pointer or depth changed.
    fn with_header<S, R, F>(
        &self,
        file: &mut IndexFile<S>,
        access: Access,
        op: F,
    ) -> Result<R, BTreeError>
    where
        S: Storage,
        F: FnOnce(&mut IndexFile<S>, &mut Header<C>) -> Result<R, BTreeError>,
    {
        let mut hdr = protect_header(file, &self.class, self.addr, access)?;
        let before = hdr.persistent_state();
        let result = op(file, &mut hdr);
        let flags = if hdr.persistent_state() == before {
            UnprotectFlags::NONE
        } else {
            UnprotectFlags::DIRTIED
        };
        file.unprotect(self.addr, hdr, flags)?;
        result
    }
}

fn protect_header<C: RecordClass, S: Storage>(
    file: &mut IndexFile<S>,
    class: &C,
    addr: Address,
    access: Access,
) -> Result<Header<C>, BTreeError> {
    let address_width = file.address_width();
    let length_width = file.length_width();
    let swmr_write = file.swmr_write();
    file.protect(
        addr,
        EntryKind::TreeHeader,
        Header::<C>::image_len_for(address_width, length_width),
        access,
        |image| {
            Header::decode(
                image,
                class.clone(),
                addr,
                address_width,
                length_width,
                swmr_write,
            )
        },
    )
}

/// Delete every node depth first, then the header. Space is always freed.
fn delete_tree<C, S, F>(
    file: &mut IndexFile<S>,
    hdr: Header<C>,
    op: &mut F,
) -> Result<(), BTreeError>
where
    C: RecordClass,
    S: Storage,
    F: FnMut(&C::Record),
{
    let addr = hdr.addr;
    if hdr.root.is_defined() {
        if let Err(e) = delete_node(file, &hdr, hdr.depth, hdr.root, op) {
            file.unprotect(addr, hdr, UnprotectFlags::NONE)?;
            return Err(e);
        }
    }
    let nrec = hdr.root.all_nrec;
    file.unprotect(
        addr,
        hdr,
        UnprotectFlags::DELETED | UnprotectFlags::FREE_SPACE,
    )?;
    info!(addr, nrec, "tree deleted");
    Ok(())
}

fn delete_node<C, S, F>(
    file: &mut IndexFile<S>,
    hdr: &Header<C>,
    depth: u16,
    ptr: NodePointer,
    op: &mut F,
) -> Result<(), BTreeError>
where
    C: RecordClass,
    S: Storage,
    F: FnMut(&C::Record),
{
    let flags = UnprotectFlags::DELETED | UnprotectFlags::FREE_SPACE;
    if depth == 0 {
        let leaf = protect_leaf(file, hdr, &ptr, Access::Write)?;
        for record in &leaf.records {
            op(record);
        }
        file.unprotect(ptr.addr, leaf, flags)?;
        return Ok(());
    }

    let node = protect_internal(file, hdr, &ptr, depth, Access::Write)?;
    for child in &node.children {
        if let Err(e) = delete_node(file, hdr, depth - 1, *child, op) {
            file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;
            return Err(e);
        }
    }
    for record in &node.records {
        op(record);
    }
    file.unprotect(ptr.addr, node, flags)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use super::*;
    use crate::btree2::record::{KeyValue, KeyValueClass, U64Class};
    use crate::simulation::SimulatedStorage;
    use crate::storage::{FileOptions, FileStorage};

    fn small_params() -> CreateParams {
        CreateParams {
            node_size: 128,
            ..CreateParams::default()
        }
    }

    fn kv(key: u64) -> KeyValue {
        KeyValue { key, value: key * 10 }
    }

    fn setup(swmr_write: bool) -> (IndexFile<SimulatedStorage>, BTree2<KeyValueClass>) {
        let options = FileOptions {
            swmr_write,
            ..FileOptions::default()
        };
        let mut file = IndexFile::create(SimulatedStorage::new(42), options).expect("file");
        let tree = BTree2::create(&mut file, KeyValueClass, small_params()).expect("create");
        (file, tree)
    }

    fn keys(file: &mut IndexFile<SimulatedStorage>, tree: &BTree2<KeyValueClass>) -> Vec<u64> {
        let mut keys = Vec::new();
        tree.iterate(file, |r| {
            keys.push(r.key);
            Walk::Continue
        })
        .expect("iterate");
        keys
    }

    #[test]
    fn test_ascending_inserts_grow_tree() {
        let (mut file, tree) = setup(false);
        for key in 1..=1000 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        assert_eq!(tree.get_nrec(&mut file).expect("nrec"), 1000);
        assert!(tree.depth(&mut file).expect("depth") >= 3);
        assert_eq!(keys(&mut file, &tree), (1..=1000).collect::<Vec<_>>());
        tree.check_invariants(&mut file).expect("invariants");
    }

    #[test]
    fn test_descending_removes_collapse_tree() {
        let (mut file, tree) = setup(false);
        for key in 1..=1000 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        let mut last_depth = tree.depth(&mut file).expect("depth");
        for key in (1..=1000).rev() {
            let removed = tree.remove(&mut file, &key).expect("remove");
            assert_eq!(removed, kv(key));
            let depth = tree.depth(&mut file).expect("depth");
            assert!(depth <= last_depth);
            last_depth = depth;
            if key % 97 == 0 {
                tree.check_invariants(&mut file).expect("invariants");
            }
        }
        assert_eq!(last_depth, 0);
        assert_eq!(tree.get_nrec(&mut file).expect("nrec"), 0);
        assert!(!tree.root(&mut file).expect("root").is_defined());
        assert_eq!(file.dependents(tree.address()), 0);
    }

    #[test]
    fn test_random_order_neighbors() {
        let (mut file, tree) = setup(false);
        let mut keys: Vec<u64> = (0..300).map(|k| k * 3).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(7));
        for key in &keys {
            tree.insert(&mut file, &kv(*key)).expect("insert");
        }
        tree.check_invariants(&mut file).expect("invariants");

        for query in [1, 299, 448, 896] {
            let below = tree.neighbor(&mut file, Neighbor::Less, &query).expect("less");
            let above = tree
                .neighbor(&mut file, Neighbor::Greater, &query)
                .expect("greater");
            assert_eq!(below.key, query / 3 * 3);
            assert_eq!(above.key, query / 3 * 3 + 3);
        }
        assert!(matches!(
            tree.neighbor(&mut file, Neighbor::Less, &0),
            Err(BTreeError::RecordNotFound)
        ));
        assert!(matches!(
            tree.neighbor(&mut file, Neighbor::Greater, &897),
            Err(BTreeError::RecordNotFound)
        ));
    }

    #[test]
    fn test_shadowed_node_leaves_old_image() {
        let (mut file, tree) = setup(true);
        for key in 0..5 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        file.flush().expect("flush");
        tree.advance_shadow_epoch(&mut file).expect("epoch");

        let old_root = tree.root(&mut file).expect("root");
        let node_size = 128;
        let before = file.read_raw(old_root.addr, node_size).expect("read");

        tree.insert(&mut file, &kv(5)).expect("insert");
        file.flush().expect("flush");

        let new_root = tree.root(&mut file).expect("root");
        assert_ne!(new_root.addr, old_root.addr);
        assert_eq!(file.read_raw(old_root.addr, node_size).expect("read"), before);

        // Same epoch: the node is already shadowed and is updated in place.
        tree.insert(&mut file, &kv(6)).expect("insert");
        assert_eq!(tree.root(&mut file).expect("root").addr, new_root.addr);
        assert_eq!(keys(&mut file, &tree), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_swmr_removals_shadow_every_touched_node() {
        let (mut file, tree) = setup(true);
        for key in 0..200 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        file.flush().expect("flush");
        tree.advance_shadow_epoch(&mut file).expect("epoch");
        let old_root = tree.root(&mut file).expect("root");
        let before = file.read_raw(old_root.addr, 128).expect("read");

        for key in (0..200).step_by(2) {
            tree.remove(&mut file, &key).expect("remove");
        }
        file.flush().expect("flush");
        assert_eq!(file.read_raw(old_root.addr, 128).expect("read"), before);
        tree.check_invariants(&mut file).expect("invariants");
        assert_eq!(keys(&mut file, &tree), (1..200).step_by(2).collect::<Vec<_>>());
    }

    #[test]
    fn test_duplicate_insert_leaves_image_identical() {
        let (mut file, tree) = setup(false);
        for key in 0..50 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        file.flush().expect("flush");
        let before = file.storage().bytes().to_vec();

        let result = tree.insert(&mut file, &KeyValue { key: 20, value: 1 });
        assert!(matches!(result, Err(BTreeError::DuplicateRecord)));
        file.flush().expect("flush");
        assert_eq!(file.storage().bytes(), before.as_slice());
    }

    #[test]
    fn test_rank_lookup_matches_find() {
        let (mut file, tree) = setup(false);
        for key in (0..120).rev() {
            tree.insert(&mut file, &kv(key * 2)).expect("insert");
        }
        let total = tree.get_nrec(&mut file).expect("nrec");
        for n in 0..total {
            let ascending = tree.index(&mut file, IterOrder::Ascending, n).expect("index");
            let found = tree.find(&mut file, &ascending.key).expect("find");
            assert_eq!(found, Some(ascending));
            let descending = tree
                .index(&mut file, IterOrder::Descending, total - 1 - n)
                .expect("index");
            assert_eq!(descending, ascending);
        }
        assert!(matches!(
            tree.index(&mut file, IterOrder::Ascending, total),
            Err(BTreeError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_checksum_corruption_detected() {
        let (mut file, tree) = setup(false);
        for key in 0..20 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        file.evict().expect("evict");
        let root = tree.root(&mut file).expect("root");
        let offset = root.addr as usize + 8;
        file.storage_mut().bytes_mut()[offset] ^= 0xff;

        let result = tree.find(&mut file, &3);
        assert!(matches!(result, Err(BTreeError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_wrong_class_rejected() {
        let (mut file, tree) = setup(false);
        let addr = tree.address();
        tree.close(&mut file).expect("close");
        file.evict().expect("evict");

        let result = BTree2::open(&mut file, U64Class, addr);
        assert!(matches!(
            result,
            Err(BTreeError::UnknownTreeClass { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tree.idx");

        let storage = FileStorage::create(&path).expect("create storage");
        let mut file = IndexFile::create(storage, FileOptions::default()).expect("file");
        let tree = BTree2::create(&mut file, KeyValueClass, small_params()).expect("create");
        for key in 0..300 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        file.set_root_object(tree.address());
        tree.close(&mut file).expect("close tree");
        file.close().expect("close file");

        let storage = FileStorage::open(&path).expect("open storage");
        let mut file = IndexFile::open(storage, false).expect("open file");
        let root_object = file.root_object();
        let tree = BTree2::open(&mut file, KeyValueClass, root_object).expect("open");
        assert_eq!(tree.get_nrec(&mut file).expect("nrec"), 300);
        assert_eq!(
            tree.find(&mut file, &123).expect("find"),
            Some(kv(123))
        );
        tree.check_invariants(&mut file).expect("invariants");

        tree.remove(&mut file, &123).expect("remove");
        tree.close(&mut file).expect("close tree");
        file.close().expect("close file");

        let storage = FileStorage::open(&path).expect("open storage");
        let mut file = IndexFile::open(storage, false).expect("open file");
        let root_object = file.root_object();
        let tree = BTree2::open(&mut file, KeyValueClass, root_object).expect("open");
        assert_eq!(tree.get_nrec(&mut file).expect("nrec"), 299);
        assert_eq!(tree.find(&mut file, &123).expect("find"), None);
    }

    #[test]
    fn test_delete_waits_for_last_handle() {
        let (mut file, tree) = setup(false);
        for key in 0..40 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        let addr = tree.address();
        let second = BTree2::open(&mut file, KeyValueClass, addr).expect("open");

        let mut seen = 0;
        BTree2::delete(&mut file, KeyValueClass, addr, |_| seen += 1).expect("delete");
        assert_eq!(seen, 0);
        assert!(file.status(addr).in_cache);

        tree.close(&mut file).expect("close");
        assert!(file.status(addr).in_cache);
        second.close(&mut file).expect("close");
        assert!(!file.status(addr).in_cache);
        assert_eq!(file.dependents(addr), 0);
    }

    #[test]
    fn test_delete_closed_tree_frees_space() {
        let (mut file, tree) = setup(false);
        let base = file.allocator().end_of_allocation();
        for key in 0..100 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        let addr = tree.address();
        tree.close(&mut file).expect("close");

        let mut seen = Vec::new();
        BTree2::delete(&mut file, KeyValueClass, addr, |r| seen.push(r.key)).expect("delete");
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert!(!file.status(addr).in_cache);
        assert!(file.allocator().end_of_allocation() < base);
        assert_eq!(file.cached_entries(), 0);
    }

    #[test]
    fn test_header_pinned_while_open() {
        let (mut file, tree) = setup(false);
        for key in 0..30 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        let addr = tree.address();
        assert!(file.status(addr).pinned);
        assert!(file.dependents(addr) > 0);

        file.evict().expect("evict");
        assert!(file.status(addr).in_cache);
        assert_eq!(file.dependents(addr), 0);

        tree.close(&mut file).expect("close");
        assert!(!file.status(addr).pinned);
        file.evict().expect("evict");
        assert!(!file.status(addr).in_cache);
    }

    #[test]
    fn test_update_and_modify_through_handle() {
        let (mut file, tree) = setup(false);
        for key in 0..60 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        let outcome = tree
            .update(&mut file, &KeyValue { key: 30, value: 1 }, |r| {
                r.value = 1;
                true
            })
            .expect("update");
        assert_eq!(outcome, UpdateOutcome::Modified);
        let outcome = tree
            .update(&mut file, &KeyValue { key: 500, value: 5 }, |_| true)
            .expect("update");
        assert_eq!(outcome, UpdateOutcome::Inserted);

        let changed = tree
            .modify(&mut file, &31, |r| {
                r.value += 1;
                true
            })
            .expect("modify");
        assert!(changed);
        assert_eq!(tree.find(&mut file, &31).expect("find").map(|r| r.value), Some(311));
        assert_eq!(tree.find(&mut file, &30).expect("find").map(|r| r.value), Some(1));
        assert_eq!(tree.get_nrec(&mut file).expect("nrec"), 61);
        tree.check_invariants(&mut file).expect("invariants");
    }

    #[test]
    fn test_size_counts_every_node() {
        let (mut file, tree) = setup(false);
        let empty = tree.size(&mut file).expect("size");
        assert_eq!(
            empty,
            Header::<KeyValueClass>::image_len_for(8, 8) as u64
        );
        tree.insert(&mut file, &kv(1)).expect("insert");
        assert_eq!(tree.size(&mut file).expect("size"), empty + 128);
        assert!(tree.debug_dump(&mut file).expect("dump").contains("1 => 10"));
    }

    #[test]
    fn test_create_rejects_geometry_that_cannot_split_deep() {
        let mut file =
            IndexFile::create(SimulatedStorage::new(6), FileOptions::default()).expect("file");
        let base = file.allocator().end_of_allocation();

        // Leaves and depth-1 nodes work, but depth-2 nodes would split at 2
        let params = CreateParams {
            node_size: 90,
            split_percent: 80,
            merge_percent: 30,
        };
        let result = BTree2::create(&mut file, U64Class, params);
        assert!(matches!(result, Err(BTreeError::InvalidParameters(_))));
        assert_eq!(file.allocator().end_of_allocation(), base);
        assert_eq!(file.cached_entries(), 0);
    }

    #[test]
    fn test_partial_split_percent_grows_and_shrinks() {
        let mut file =
            IndexFile::create(SimulatedStorage::new(12), FileOptions::default()).expect("file");
        let params = CreateParams {
            node_size: 256,
            split_percent: 80,
            merge_percent: 30,
        };
        let tree = BTree2::create(&mut file, KeyValueClass, params).expect("create");

        let mut order: Vec<u64> = (0..3000).collect();
        order.shuffle(&mut StdRng::seed_from_u64(21));
        for (step, key) in order.iter().enumerate() {
            tree.insert(&mut file, &kv(*key)).expect("insert");
            if step % 250 == 0 {
                tree.check_invariants(&mut file).expect("invariants");
            }
        }
        assert!(tree.depth(&mut file).expect("depth") >= 2);
        tree.check_invariants(&mut file).expect("invariants");

        order.shuffle(&mut StdRng::seed_from_u64(22));
        for (step, key) in order.iter().enumerate() {
            assert_eq!(tree.remove(&mut file, key).expect("remove"), kv(*key));
            if step % 250 == 0 {
                tree.check_invariants(&mut file).expect("invariants");
            }
        }
        assert_eq!(tree.get_nrec(&mut file).expect("nrec"), 0);
        assert_eq!(tree.depth(&mut file).expect("depth"), 0);
    }

    fn collect_edges(
        file: &mut IndexFile<SimulatedStorage>,
        hdr: &Header<KeyValueClass>,
        depth: u16,
        ptr: NodePointer,
        edges: &mut Vec<(Address, Address)>,
    ) -> Result<(), BTreeError> {
        if depth == 0 {
            return Ok(());
        }
        let node = protect_internal(file, hdr, &ptr, depth, Access::Read)?;
        let children = node.children.clone();
        file.unprotect(ptr.addr, node, UnprotectFlags::NONE)?;
        for child in children {
            edges.push((ptr.addr, child.addr));
            collect_edges(file, hdr, depth - 1, child, edges)?;
        }
        Ok(())
    }

    /// Every (pointer holder, pointee) pair, starting with the header.
    fn pointer_edges(
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
    ) -> Vec<(Address, Address)> {
        tree.with_header(file, Access::Read, |file, hdr| {
            let mut edges = Vec::new();
            if hdr.root.is_defined() {
                edges.push((hdr.addr, hdr.root.addr));
                collect_edges(file, hdr, hdr.depth, hdr.root, &mut edges)?;
            }
            Ok(edges)
        })
        .expect("edges")
    }

    #[test]
    fn test_swmr_flush_writes_nodes_before_their_pointers() {
        let (mut file, tree) = setup(true);
        for key in 0..1000 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        file.flush().expect("flush");
        tree.advance_shadow_epoch(&mut file).expect("epoch");
        file.flush().expect("flush");

        // Shadowed nodes land at fresh addresses above their parents
        file.storage_mut().enable_write_log();
        for key in (0..1000).step_by(7) {
            tree.remove(&mut file, &key).expect("remove");
        }
        for key in 1000..1100 {
            tree.insert(&mut file, &kv(key)).expect("insert");
        }
        file.flush().expect("flush");

        let log = file.storage().write_log().to_vec();
        let position = |addr: Address| log.iter().position(|&a| a == addr);
        assert!(position(tree.address()).is_some());

        let mut checked = 0;
        for (parent, child) in pointer_edges(&mut file, &tree) {
            if let (Some(p), Some(c)) = (position(parent), position(child)) {
                assert!(c < p, "node {child} written after {parent}, which points at it");
                checked += 1;
            }
        }
        assert!(checked > 0);
        tree.check_invariants(&mut file).expect("invariants");
    }
}
