//! # B-Tree Nodes
//!
//! The node layer of BurrowDB's B-tree. A node is a sorted run of
//! key/value items plus, for internal nodes, one more child page number
//! than there are items. Nodes are plain owned data: they carry no handle
//! to the page store, and the tree algorithms in [`crate::store`] thread a
//! transaction through explicitly whenever they need to touch a neighbor
//! or a child.
//!
//! Search within a node is a binary search over the sorted items; descent,
//! splitting and rebalancing live with the transaction-aware code in the
//! store layer, because every step there may read or write pages.

mod node;

pub use node::{Item, Node};
