// Life of a tree operation:
// 1. The caller holds a `BTree2` handle naming the tree's header address
// 2. The header is protected in the index file's metadata cache
// 3. The descent protects one node per level, rebalancing children on the
//    way down, and releases each node dirty or clean on the way back up
// 4. The header is released, dirty only if the root or depth changed
// 5. Dirty blocks reach storage when the index file is flushed
//
// System components:
//  - Storage: byte-addressed files, real or simulated
//  - Index file: superblock, block allocator, metadata cache
//  - B-tree engine: record classes, nodes, descents

pub mod btree2;
pub mod config;
pub mod simulation;
pub mod storage;

pub use btree2::{BTree2, BTreeError, CreateParams};
pub use config::{ConfigError, EngineConfig};
pub use storage::{FileStorage, IndexFile};
