//! # Meta Page
//!
//! Page 0 of every store holds the meta page: the page number of the
//! free-list and the root page of the collections tree. Both fields are
//! little-endian u64 values at the start of the page; the remainder of the
//! page is zero-padding.
//!
//! The struct uses zerocopy traits so it can be read straight out of a page
//! buffer and written back with `as_bytes`, with the layout verified at
//! compile time.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PageNum, FREELIST_PAGE_NUM};

pub const META_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    freelist_page: U64,
    root: U64,
}

const _: () = assert!(std::mem::size_of::<Meta>() == META_SIZE);

impl Meta {
    pub fn new() -> Self {
        Self {
            freelist_page: U64::new(FREELIST_PAGE_NUM),
            root: U64::new(0),
        }
    }

    /// Parses and validates a meta page read from disk.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= META_SIZE,
            "corrupt meta page: {} bytes, expected at least {}",
            bytes.len(),
            META_SIZE
        );

        let meta = Self::read_from_bytes(&bytes[..META_SIZE])
            .map_err(|e| eyre::eyre!("corrupt meta page: {:?}", e))?;

        ensure!(
            meta.freelist_page() == FREELIST_PAGE_NUM,
            "corrupt meta page: free-list page {} is not page {}",
            meta.freelist_page(),
            FREELIST_PAGE_NUM
        );
        ensure!(
            meta.root() > FREELIST_PAGE_NUM,
            "corrupt meta page: collections root {} falls on a reserved page",
            meta.root()
        );

        Ok(meta)
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() >= META_SIZE,
            "buffer too small for meta page: {} < {}",
            buf.len(),
            META_SIZE
        );

        buf[..META_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn freelist_page(&self) -> PageNum {
        self.freelist_page.get()
    }

    pub fn root(&self) -> PageNum {
        self.root.get()
    }

    pub fn set_root(&mut self, root: PageNum) {
        self.root = U64::new(root);
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new()
    }
}
