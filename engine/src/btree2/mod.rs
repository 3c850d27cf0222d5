//! Version 2 B-trees.
//!
//! A tree is an ordered index of fixed-size records. Every node is one
//! checksummed block of `node_size` bytes in an [`IndexFile`]; leaves hold
//! records only, internal nodes hold records and one more child pointer
//! than records. Every child pointer carries the child's own record count
//! and the total count of its subtree, which makes rank lookups and rank
//! removals a single descent.
//!
//! Nodes are kept between their merge and split thresholds by rebalancing
//! on the way down: an insertion makes room in a child before entering it
//! and a removal tops a child up before entering it, so no operation ever
//! walks back up the tree.
//!
//! # Layout
//!
//! - `record`: record classes (ordering and encoding of one record format)
//! - `header`: per-tree control block and per-depth capacity table
//! - `node`: leaf and internal node images, protect and release helpers
//! - `rebalance`: split, redistribute and merge between siblings
//! - `insert`, `remove`, `search`: the descents
//! - `check`: whole-tree walks for validation and diagnostics
//! - `tree`: the [`BTree2`] handle tying it together
//!
//! # Usage
//!
//! ```ignore
//! use engine::btree2::{BTree2, CreateParams, KeyValue, KeyValueClass};
//!
//! let tree = BTree2::create(&mut file, KeyValueClass, CreateParams::default())?;
//! tree.insert(&mut file, &KeyValue { key: 1, value: 10 })?;
//! assert_eq!(tree.find(&mut file, &1)?, Some(KeyValue { key: 1, value: 10 }));
//! ```
//!
//! [`IndexFile`]: crate::storage::IndexFile

pub mod check;
pub mod error;
pub mod header;
pub mod insert;
pub mod node;
pub mod rebalance;
pub mod record;
pub mod remove;
pub mod search;
pub mod tree;

pub use error::BTreeError;
pub use header::{CreateParams, NodeInfo};
pub use insert::UpdateOutcome;
pub use node::NodePointer;
pub use record::{KeyValue, KeyValueClass, RecordClass, RecordError, U64Class};
pub use search::{IterOrder, Neighbor, Walk};
pub use tree::BTree2;
