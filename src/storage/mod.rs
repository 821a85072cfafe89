//! # Storage Module
//!
//! This module is the data access layer of BurrowDB. It owns the backing
//! file and is the only code that touches disk: node pages are read and
//! written here, page numbers are allocated and released here, and the
//! fill-ratio policy that drives B-tree splits and merges lives here.
//!
//! ## Reserved Pages
//!
//! ```text
//! Page    Contents
//! ------  --------------------------------------------------------
//! 0       Meta page: free-list page number + collections tree root
//! 1       Free-list page: high-water mark + released page numbers
//! 2+      Node pages
//! ```
//!
//! ## Page Size
//!
//! The page size is the operating-system page size at the time the file is
//! created (typically 4096 or 16384 bytes) and is immutable for the life of
//! the file. A page is the unit of I/O: every node read or write transfers
//! exactly one page at offset `page_num * page_size`.
//!
//! ## Fill Policy
//!
//! Two configurable thresholds derived from the page size drive tree
//! rebalancing:
//!
//! - a node whose estimated size exceeds `max_fill_percent * page_size` is
//!   over-populated and must be split;
//! - a non-root node whose estimated size falls below
//!   `min_fill_percent * page_size` is under-populated and must borrow from
//!   a sibling or merge.
//!
//! The estimate charges every item the same overhead (offset slot plus
//! child pointer) whether or not the node is a leaf; see
//! [`crate::btree::Node::node_size`].
//!
//! ## Module Organization
//!
//! - `meta`: the fixed-layout meta page
//! - `freelist`: page-number allocation and reuse
//! - `pager`: file I/O, node serialization boundary, fill policy

mod freelist;
mod meta;
mod pager;

pub use freelist::{Freelist, FREELIST_HEADER_SIZE};
pub use meta::{Meta, META_SIZE};
pub use pager::{Options, Pager};

/// A page number in the backing file.
pub type PageNum = u64;

pub const META_PAGE_NUM: PageNum = 0;
pub const FREELIST_PAGE_NUM: PageNum = 1;

/// Serialized size of a page number.
pub const PAGE_NUM_SIZE: usize = 8;

/// Node page header: leaf flag (1 byte) + item count (2 bytes).
pub const NODE_HEADER_SIZE: usize = 3;

/// Key and value lengths are stored in a single byte each.
pub const MAX_KEY_SIZE: usize = u8::MAX as usize;
pub const MAX_VALUE_SIZE: usize = u8::MAX as usize;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_MIN_FILL_PERCENT: f32 = 0.5;
pub const DEFAULT_MAX_FILL_PERCENT: f32 = 1.0;
