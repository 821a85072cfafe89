//! # BurrowDB - Embedded Single-File Key/Value Store
//!
//! BurrowDB stores ordered key/value pairs in named collections inside a
//! single file. Data lives in a disk-resident B-tree over fixed-size pages,
//! and all access goes through transactions: one writer at a time, any
//! number of concurrent readers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::{Options, Store};
//!
//! let store = Store::open("./app.db", Options::default())?;
//!
//! let mut tx = store.begin_write();
//! let mut users = tx.create_collection(b"users")?;
//! users.put(&mut tx, b"alice", b"admin")?;
//! tx.commit()?;
//!
//! let tx = store.begin_read();
//! let users = tx.get_collection(b"users")?.unwrap();
//! let item = users.find(&tx, b"alice")?;
//! tx.commit()?;
//!
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! Three layers compose bottom-up:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Store / Transactions / Collections │
//! ├─────────────────────────────────────┤
//! │      B-Tree Nodes (slotted pages)   │
//! ├─────────────────────────────────────┤
//! │   Page Store (pager + free-list)    │
//! └─────────────────────────────────────┘
//! ```
//!
//! The page store owns the backing file, the meta page and the free-list,
//! and decides when a node is over- or under-populated. B-tree nodes
//! serialize into exactly one page each. Transactions buffer dirty nodes in
//! memory and flush them on commit; collections are named B-trees whose
//! root pointers are themselves stored in a root collections tree.
//!
//! ## File Layout
//!
//! ```text
//! page 0   meta page (free-list page number, collections root)
//! page 1   free-list page
//! page 2+  node pages
//! ```
//!
//! The page size is captured from the operating system when the file is
//! created and is fixed for the life of the file. All on-disk integers are
//! little-endian.
//!
//! ## Module Overview
//!
//! - [`storage`]: pager, meta page, free-list, fill-ratio policy
//! - [`btree`]: node format and slotted-page serialization
//! - [`store`]: store handle, transactions, collections

pub mod btree;
pub mod storage;
pub mod store;

pub use btree::Item;
pub use storage::Options;
pub use store::{Collection, Store, Tx};
