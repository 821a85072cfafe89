//! # Store, Transactions and Collections
//!
//! The public surface of BurrowDB. A [`Store`] wraps the pager in a
//! reader/writer lock; every interaction happens through a transaction
//! obtained from [`Store::begin_read`] or [`Store::begin_write`], which
//! holds the corresponding lock guard until it commits, rolls back, or is
//! dropped.
//!
//! ```text
//! Store::open ──► begin_read / begin_write ──► Collection ops ──► commit
//!                         │                                         │
//!                         └── shared / exclusive pager lock ────────┘
//! ```
//!
//! Readers observe the last committed state; a writer waits until all
//! readers drain and then has the store to itself, so no reader can ever
//! see a partially committed transaction.

mod collection;
mod transaction;

pub use collection::Collection;
pub use transaction::Tx;

use std::path::Path;

use eyre::Result;
use parking_lot::RwLock;

use crate::storage::{Options, Pager};

/// An open BurrowDB store backed by a single file.
pub struct Store {
    pager: RwLock<Pager>,
}

impl Store {
    /// Opens the store at `path`, creating the file if it does not exist.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let pager = Pager::open(path.as_ref(), &options)?;
        Ok(Self {
            pager: RwLock::new(pager),
        })
    }

    /// Begins a read-only transaction. Any number of read transactions may
    /// be live at once.
    pub fn begin_read(&self) -> Tx<'_> {
        Tx::read(self.pager.read())
    }

    /// Begins the store's single write transaction, blocking until every
    /// open reader has finished.
    pub fn begin_write(&self) -> Tx<'_> {
        Tx::write(self.pager.write())
    }

    /// Flushes the free-list and meta page and closes the backing file.
    pub fn close(self) -> Result<()> {
        self.pager.into_inner().close()
    }
}
