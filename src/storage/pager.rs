//! # Pager
//!
//! The pager owns the backing file. It reads and writes whole pages at
//! `page_num * page_size`, keeps the in-memory meta page and free-list,
//! and implements the fill-ratio policy the B-tree consults when deciding
//! whether to split or rebalance a node.
//!
//! ## Bootstrap
//!
//! Opening a path that does not yet hold a store writes three pages: an
//! empty leaf that becomes the root of the collections tree, the free-list,
//! and the meta page pointing at both.
//!
//! ## I/O Contract
//!
//! Reads and writes are positioned and synchronous. A short read is treated
//! as corruption and surfaces as an error; partial writes are not tolerated
//! either. The file is locked exclusively for the lifetime of the pager so
//! a second process cannot open the same store.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use fs2::FileExt as _;
use tracing::debug;

use crate::btree::Node;

use super::freelist::Freelist;
use super::meta::Meta;
use super::{
    PageNum, DEFAULT_MAX_FILL_PERCENT, DEFAULT_MIN_FILL_PERCENT, DEFAULT_PAGE_SIZE, META_PAGE_NUM,
    NODE_HEADER_SIZE,
};

/// Smallest page size that can hold the meta page, the free-list header
/// and a usable node.
const MIN_PAGE_SIZE: usize = 128;

/// Cell offsets are 16-bit, so pages cannot exceed 64 KiB.
const MAX_PAGE_SIZE: usize = 1 << 16;

/// Store configuration, recognized at open.
#[derive(Debug, Clone)]
pub struct Options {
    /// Page size in bytes; defaults to the OS page size.
    pub page_size: usize,
    /// Fraction of the page below which a node is under-populated.
    pub min_fill_percent: f32,
    /// Fraction of the page above which a node is over-populated.
    pub max_fill_percent: f32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: os_page_size(),
            min_fill_percent: DEFAULT_MIN_FILL_PERCENT,
            max_fill_percent: DEFAULT_MAX_FILL_PERCENT,
        }
    }
}

impl Options {
    fn validate(&self) -> Result<()> {
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size),
            "page size {} out of range [{}, {}]",
            self.page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );
        ensure!(
            self.min_fill_percent > 0.0 && self.min_fill_percent <= 1.0,
            "min fill percent {} out of range (0, 1]",
            self.min_fill_percent
        );
        ensure!(
            self.max_fill_percent > 0.0 && self.max_fill_percent <= 1.0,
            "max fill percent {} out of range (0, 1]",
            self.max_fill_percent
        );
        ensure!(
            self.max_fill_percent >= self.min_fill_percent,
            "max fill percent {} is below min fill percent {}",
            self.max_fill_percent,
            self.min_fill_percent
        );
        Ok(())
    }
}

#[cfg(unix)]
pub(crate) fn os_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

#[cfg(not(unix))]
pub(crate) fn os_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug)]
pub struct Pager {
    file: File,
    page_size: usize,
    min_fill_percent: f32,
    max_fill_percent: f32,
    meta: Meta,
    freelist: Freelist,
}

impl Pager {
    /// Opens the store at `path`, bootstrapping a fresh file when the path
    /// holds no data yet.
    pub fn open(path: &Path, options: &Options) -> Result<Self> {
        options.validate()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file {}", path.display()))?;
        file.try_lock_exclusive()
            .wrap_err_with(|| format!("database file {} is locked", path.display()))?;
        let len = file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len();

        let mut pager = Self {
            file,
            page_size: options.page_size,
            min_fill_percent: options.min_fill_percent,
            max_fill_percent: options.max_fill_percent,
            meta: Meta::new(),
            freelist: Freelist::new(),
        };

        if len == 0 {
            pager.bootstrap()?;
            debug!(
                path = %path.display(),
                page_size = pager.page_size,
                "created store"
            );
        } else {
            pager.load()?;
            debug!(
                path = %path.display(),
                root = pager.meta.root(),
                max_page = pager.freelist.max_page(),
                "opened store"
            );
        }

        Ok(pager)
    }

    fn bootstrap(&mut self) -> Result<()> {
        let mut root = Node::empty_leaf();
        self.write_node(&mut root)
            .wrap_err("failed to write the initial collections root")?;
        self.meta.set_root(root.page_num);
        self.write_freelist()?;
        self.write_meta()?;
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let buf = self
            .read_page(META_PAGE_NUM)
            .wrap_err("failed to read the meta page")?;
        self.meta = Meta::from_bytes(&buf)?;

        let buf = self
            .read_page(self.meta.freelist_page())
            .wrap_err("failed to read the free-list page")?;
        self.freelist = Freelist::deserialize(&buf)?;
        Ok(())
    }

    /// Persists the free-list and meta page, then releases the file lock.
    pub fn close(&mut self) -> Result<()> {
        self.write_freelist()?;
        self.write_meta()?;
        fs2::FileExt::unlock(&self.file).wrap_err("failed to unlock database file")?;
        debug!("closed store");
        Ok(())
    }

    fn read_page(&self, page_num: PageNum) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        self.file
            .read_exact_at(&mut buf, page_num * self.page_size as u64)
            .wrap_err_with(|| format!("failed to read page {}", page_num))?;
        Ok(buf)
    }

    fn write_page(&mut self, page_num: PageNum, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, page_num * self.page_size as u64)
            .wrap_err_with(|| format!("failed to write page {}", page_num))
    }

    pub fn read_node(&self, page_num: PageNum) -> Result<Node> {
        let buf = self.read_page(page_num)?;
        let mut node = Node::deserialize(&buf)
            .wrap_err_with(|| format!("corrupt node on page {}", page_num))?;
        node.page_num = page_num;
        Ok(node)
    }

    /// Serializes `node` into a zero-padded page. A node without a page
    /// number is assigned one first.
    pub fn write_node(&mut self, node: &mut Node) -> Result<()> {
        if node.page_num == 0 {
            node.page_num = self.freelist.next_page();
        }
        let mut buf = vec![0u8; self.page_size];
        node.serialize(&mut buf)
            .wrap_err_with(|| format!("failed to serialize node for page {}", node.page_num))?;
        self.write_page(node.page_num, &buf)
    }

    pub fn delete_node(&mut self, page_num: PageNum) {
        self.freelist.release_page(page_num);
    }

    pub fn allocate_page_num(&mut self) -> PageNum {
        self.freelist.next_page()
    }

    pub fn release_page_num(&mut self, page_num: PageNum) {
        self.freelist.release_page(page_num);
    }

    pub fn write_freelist(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.page_size];
        self.freelist.serialize(&mut buf)?;
        self.write_page(self.meta.freelist_page(), &buf)
    }

    pub fn write_meta(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.page_size];
        self.meta.write_to(&mut buf)?;
        self.write_page(META_PAGE_NUM, &buf)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Root page of the collections tree.
    pub fn root(&self) -> PageNum {
        self.meta.root()
    }

    pub fn set_root(&mut self, root: PageNum) {
        self.meta.set_root(root);
    }

    pub(crate) fn freelist(&self) -> &Freelist {
        &self.freelist
    }

    fn min_threshold(&self) -> f32 {
        self.min_fill_percent * self.page_size as f32
    }

    fn max_threshold(&self) -> f32 {
        self.max_fill_percent * self.page_size as f32
    }

    pub fn is_over_populated(&self, node: &Node) -> bool {
        node.node_size() as f32 > self.max_threshold()
    }

    pub fn is_under_populated(&self, node: &Node) -> bool {
        (node.node_size() as f32) < self.min_threshold()
    }

    /// The earliest index at which `node` can be cut so the left half still
    /// meets the min-fill threshold, or `None` when no such cut exists and
    /// the node cannot spare an element.
    pub fn split_index(&self, node: &Node) -> Option<usize> {
        let mut size = NODE_HEADER_SIZE;
        for i in 0..node.items.len() {
            size += node.element_size(i);
            if size as f32 > self.min_threshold() && i < node.items.len() - 1 {
                return Some(i + 1);
            }
        }
        None
    }

    pub fn can_spare_an_element(&self, node: &Node) -> bool {
        self.split_index(node).is_some()
    }
}
