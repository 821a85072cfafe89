//! # Transactions
//!
//! A transaction is a lock guard plus buffered mutations. Read
//! transactions hold the pager's shared lock and never touch disk state
//! beyond reading pages. Write transactions hold the exclusive lock and
//! buffer everything in memory:
//!
//! - `dirty`: page number to modified node, consulted before the pager on
//!   every read so a transaction observes its own writes;
//! - `pages_to_delete`: pages to release to the free-list at commit;
//! - `allocated`: pages handed out during this transaction, returned to
//!   the free-list on rollback.
//!
//! Commit drains the dirty map through the pager, releases the deleted
//! pages, and persists the free-list and meta page. Rollback discards the
//! buffers and reclaims the allocated pages. Dropping an unfinished
//! transaction rolls back, so the lock can never leak; `commit` and
//! `rollback` consume the transaction, so nothing can run after either.

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::btree::{Item, Node};
use crate::storage::{PageNum, Pager};

use super::collection::Collection;

enum Lock<'store> {
    Read(RwLockReadGuard<'store, Pager>),
    Write(RwLockWriteGuard<'store, Pager>),
}

/// A read or write transaction. Obtained from
/// [`crate::Store::begin_read`] / [`crate::Store::begin_write`].
pub struct Tx<'store> {
    lock: Lock<'store>,
    root: PageNum,
    dirty: HashMap<PageNum, Node>,
    pages_to_delete: Vec<PageNum>,
    allocated: Vec<PageNum>,
    finished: bool,
}

impl<'store> Tx<'store> {
    pub(crate) fn read(guard: RwLockReadGuard<'store, Pager>) -> Self {
        let root = guard.root();
        Self {
            lock: Lock::Read(guard),
            root,
            dirty: HashMap::new(),
            pages_to_delete: Vec::new(),
            allocated: Vec::new(),
            finished: false,
        }
    }

    pub(crate) fn write(guard: RwLockWriteGuard<'store, Pager>) -> Self {
        let root = guard.root();
        Self {
            lock: Lock::Write(guard),
            root,
            dirty: HashMap::new(),
            pages_to_delete: Vec::new(),
            allocated: Vec::new(),
            finished: false,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.lock, Lock::Write(_))
    }

    pub(crate) fn pager(&self) -> &Pager {
        match &self.lock {
            Lock::Read(guard) => guard,
            Lock::Write(guard) => guard,
        }
    }

    fn pager_mut(&mut self) -> Result<&mut Pager> {
        match &mut self.lock {
            Lock::Write(guard) => Ok(guard),
            Lock::Read(_) => bail!("cannot write inside a read transaction"),
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        ensure!(self.is_write(), "cannot write inside a read transaction");
        Ok(())
    }

    /// Resolves a node through the dirty map first, then the pager.
    pub(crate) fn get_node(&self, page_num: PageNum) -> Result<Node> {
        if let Some(node) = self.dirty.get(&page_num) {
            return Ok(node.clone());
        }
        self.pager().read_node(page_num)
    }

    /// Buffers a modified node; it reaches disk at commit.
    pub(crate) fn write_node(&mut self, node: Node) {
        self.dirty.insert(node.page_num, node);
    }

    /// Builds a node on a freshly allocated page number.
    pub(crate) fn new_node(&mut self, items: Vec<Item>, children: Vec<PageNum>) -> Result<Node> {
        let page_num = self.pager_mut()?.allocate_page_num();
        self.allocated.push(page_num);
        let mut node = Node::new(items, children);
        node.page_num = page_num;
        Ok(node)
    }

    /// Marks a page for release at commit.
    pub(crate) fn delete_node(&mut self, page_num: PageNum) {
        self.dirty.remove(&page_num);
        self.pages_to_delete.push(page_num);
    }

    pub(crate) fn collections_root(&self) -> PageNum {
        self.root
    }

    pub(crate) fn set_collections_root(&mut self, root: PageNum) {
        self.root = root;
    }

    fn root_collection(&self) -> Collection {
        Collection::root_handle(self.root)
    }

    /// Looks up a collection by name.
    pub fn get_collection(&self, name: &[u8]) -> Result<Option<Collection>> {
        let root_collection = self.root_collection();
        let Some(record) = root_collection.find(self, name)? else {
            return Ok(None);
        };
        Ok(Some(Collection::deserialize(name, &record.value)?))
    }

    /// Creates a collection with an empty B-tree as its root.
    pub fn create_collection(&mut self, name: &[u8]) -> Result<Collection> {
        self.ensure_writable()?;
        ensure!(!name.is_empty(), "collection name must not be empty");

        let root_node = self.new_node(Vec::new(), Vec::new())?;
        let root_page = root_node.page_num;
        self.write_node(root_node);

        let mut root_collection = self.root_collection();
        root_collection.put(self, name, &root_page.to_le_bytes())?;

        debug!(
            name = %String::from_utf8_lossy(name),
            root = root_page,
            "created collection"
        );
        Ok(Collection::new(name.to_vec(), root_page))
    }

    /// Removes a collection and releases every page of its tree.
    pub fn delete_collection(&mut self, name: &[u8]) -> Result<()> {
        self.ensure_writable()?;

        let Some(collection) = self.get_collection(name)? else {
            bail!(
                "key not found: no collection named {:?}",
                String::from_utf8_lossy(name)
            );
        };
        self.free_tree(collection.root())?;

        let mut root_collection = self.root_collection();
        root_collection.remove(self, name)?;

        debug!(name = %String::from_utf8_lossy(name), "deleted collection");
        Ok(())
    }

    fn free_tree(&mut self, root: PageNum) -> Result<()> {
        let mut stack = vec![root];
        while let Some(page_num) = stack.pop() {
            let node = self.get_node(page_num)?;
            stack.extend_from_slice(&node.children);
            self.delete_node(page_num);
        }
        Ok(())
    }

    /// Persists every buffered change and releases the lock. For a read
    /// transaction this only releases the lock.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        if !self.is_write() {
            trace!("read transaction finished");
            return Ok(());
        }

        let dirty = std::mem::take(&mut self.dirty);
        let pages_to_delete = std::mem::take(&mut self.pages_to_delete);
        self.allocated.clear();
        let root = self.root;
        let dirty_pages = dirty.len();

        let pager = self.pager_mut()?;
        for (_, mut node) in dirty {
            pager.write_node(&mut node)?;
        }
        for page_num in pages_to_delete {
            pager.release_page_num(page_num);
        }
        pager.set_root(root);
        pager.write_freelist()?;
        pager.write_meta()?;

        debug!(dirty_pages, "transaction committed");
        Ok(())
    }

    /// Discards every buffered change, reclaims pages allocated by this
    /// transaction, and releases the lock.
    pub fn rollback(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if !self.is_write() {
            return;
        }

        self.dirty.clear();
        self.pages_to_delete.clear();
        let allocated = std::mem::take(&mut self.allocated);
        if let Ok(pager) = self.pager_mut() {
            for page_num in allocated {
                pager.release_page_num(page_num);
            }
        }
        trace!("transaction rolled back");
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}
