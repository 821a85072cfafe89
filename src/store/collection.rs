//! # Collections
//!
//! A collection is a named B-tree inside the store: a record
//! `{name -> root page}` held in the root collections tree, whose own root
//! page lives in the meta page. All tree algorithms operate here, with the
//! transaction passed in explicitly; nodes never hold a handle back to the
//! page store.
//!
//! ## Insert
//!
//! Descend to the insertion point recording the child index taken at every
//! ancestor. Replace in place when the key exists, otherwise splice the new
//! item into the leaf. Then walk the ancestor path bottom-up and split
//! every over-populated child; when the root itself overflows, a new root
//! is allocated with the old root as its single child and the collection's
//! root pointer moves.
//!
//! ## Delete
//!
//! Locate the key exactly. On a leaf the item is spliced out; on an
//! internal node it is overwritten with its in-order predecessor (the
//! rightmost key of the left subtree), and the descent to that predecessor
//! is appended to the ancestor path. The path is then rebalanced bottom-up:
//! an under-populated node first tries to rotate an element from the left
//! sibling, then from the right sibling, and merges with a sibling when
//! neither can spare one. A root left with no items and a single child is
//! collapsed into that child and its page freed.
//!
//! ## Root pointer maintenance
//!
//! Whenever a collection's root page changes, the change must outlive the
//! transaction: a named collection rewrites its record in the root
//! collections tree, and the root collections tree itself updates the
//! transaction's root snapshot, which reaches the meta page at commit.

use eyre::{bail, ensure, Result};
use smallvec::{smallvec, SmallVec};

use crate::btree::{Item, Node};
use crate::storage::{PageNum, MAX_KEY_SIZE, MAX_VALUE_SIZE, PAGE_NUM_SIZE};

use super::transaction::Tx;

/// Child indexes taken from the root down to a node; the leading 0 stands
/// for the root itself.
type AncestorPath = SmallVec<[usize; 8]>;

/// A named B-tree in the store. Obtained from
/// [`Tx::get_collection`] / [`Tx::create_collection`].
#[derive(Debug, Clone)]
pub struct Collection {
    name: Vec<u8>,
    root: PageNum,
}

struct KeyLookup {
    found: bool,
    index: usize,
    node: Node,
    ancestors: AncestorPath,
}

impl Collection {
    pub(crate) fn new(name: Vec<u8>, root: PageNum) -> Self {
        Self { name, root }
    }

    /// Handle for the root collections tree; it has no name and no record
    /// of its own.
    pub(crate) fn root_handle(root: PageNum) -> Self {
        Self::new(Vec::new(), root)
    }

    pub(crate) fn deserialize(name: &[u8], value: &[u8]) -> Result<Self> {
        ensure!(
            value.len() >= PAGE_NUM_SIZE,
            "corrupt collection record for {:?}: {} bytes",
            String::from_utf8_lossy(name),
            value.len()
        );
        let root = u64::from_le_bytes(value[..PAGE_NUM_SIZE].try_into().unwrap());
        Ok(Self::new(name.to_vec(), root))
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Current root page of this collection's tree.
    pub fn root(&self) -> PageNum {
        self.root
    }

    fn is_root_collection(&self) -> bool {
        self.name.is_empty()
    }

    /// Looks up `key`, returning the stored item when present.
    pub fn find(&self, tx: &Tx<'_>, key: &[u8]) -> Result<Option<Item>> {
        let mut lookup = self.find_key(tx, key)?;
        if !lookup.found {
            return Ok(None);
        }
        Ok(Some(lookup.node.items.swap_remove(lookup.index)))
    }

    /// Inserts `key -> value`, replacing the value when the key exists.
    pub fn put(&mut self, tx: &mut Tx<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        tx.ensure_writable()?;
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key too large: {} bytes exceeds the {}-byte limit",
            key.len(),
            MAX_KEY_SIZE
        );
        ensure!(
            value.len() <= MAX_VALUE_SIZE,
            "value too large: {} bytes exceeds the {}-byte limit",
            value.len(),
            MAX_VALUE_SIZE
        );

        let KeyLookup {
            found,
            index,
            mut node,
            ancestors,
        } = self.find_key(tx, key)?;

        if found {
            node.items[index].value = value.to_vec();
        } else {
            node.add_item(Item::new(key.to_vec(), value.to_vec()), index);
        }
        tx.write_node(node);

        // Split over-populated nodes from the leaf upward.
        let mut path = self.node_path(tx, &ancestors)?;
        for i in (1..path.len()).rev() {
            let (parents, rest) = path.split_at_mut(i);
            let parent = &mut parents[i - 1];
            let child = &mut rest[0];
            if tx.pager().is_over_populated(child) {
                split_child(tx, parent, child, ancestors[i])?;
            }
        }

        if tx.pager().is_over_populated(&path[0]) {
            let old_root_page = path[0].page_num;
            let mut new_root = tx.new_node(Vec::new(), vec![old_root_page])?;
            split_child(tx, &mut new_root, &mut path[0], 0)?;
            self.set_root(tx, new_root.page_num)?;
        }
        Ok(())
    }

    /// Removes `key`, failing when it is absent.
    pub fn remove(&mut self, tx: &mut Tx<'_>, key: &[u8]) -> Result<()> {
        tx.ensure_writable()?;

        let KeyLookup {
            found,
            index,
            mut node,
            mut ancestors,
        } = self.find_key(tx, key)?;
        if !found {
            bail!("key not found: {:?}", String::from_utf8_lossy(key));
        }

        if node.is_leaf() {
            node.items.remove(index);
            tx.write_node(node);
        } else {
            let affected = remove_from_internal(tx, &mut node, index)?;
            tx.write_node(node);
            ancestors.extend(affected);
        }

        // Rebalance under-populated nodes from the bottom of the affected
        // path upward.
        let mut path = self.node_path(tx, &ancestors)?;
        for i in (1..path.len()).rev() {
            let (parents, rest) = path.split_at_mut(i);
            let parent = &mut parents[i - 1];
            let child = &mut rest[0];
            if tx.pager().is_under_populated(child) {
                rebalance(tx, parent, child, ancestors[i])?;
            }
        }

        let root = &path[0];
        if root.items.is_empty() && root.children.len() == 1 {
            let (old_root_page, new_root_page) = (root.page_num, root.children[0]);
            tx.delete_node(old_root_page);
            self.set_root(tx, new_root_page)?;
        }
        Ok(())
    }

    /// Records a root page change so it survives the transaction.
    fn set_root(&mut self, tx: &mut Tx<'_>, new_root: PageNum) -> Result<()> {
        self.root = new_root;
        if self.is_root_collection() {
            tx.set_collections_root(new_root);
            return Ok(());
        }
        let mut root_collection = Collection::root_handle(tx.collections_root());
        root_collection.put(tx, &self.name, &new_root.to_le_bytes())
    }

    fn find_key(&self, tx: &Tx<'_>, key: &[u8]) -> Result<KeyLookup> {
        let mut ancestors: AncestorPath = smallvec![0];
        let mut node = tx.get_node(self.root)?;

        loop {
            let (found, index) = node.find_key_in_node(key);
            if found || node.is_leaf() {
                return Ok(KeyLookup {
                    found,
                    index,
                    node,
                    ancestors,
                });
            }
            ancestors.push(index);
            node = tx.get_node(node.children[index])?;
        }
    }

    /// Fetches the nodes along an ancestor path, root first. Dirty nodes
    /// come back from the transaction buffer, so the path reflects every
    /// mutation made so far.
    fn node_path(&self, tx: &Tx<'_>, ancestors: &[usize]) -> Result<Vec<Node>> {
        let mut path = Vec::with_capacity(ancestors.len());
        let mut node = tx.get_node(self.root)?;
        for &index in &ancestors[1..] {
            let child = tx.get_node(node.children[index])?;
            path.push(node);
            node = child;
        }
        path.push(node);
        Ok(path)
    }
}

/// Splits an over-populated child of `parent`. The middle item moves up to
/// the parent; everything right of it moves to a freshly allocated node.
fn split_child(
    tx: &mut Tx<'_>,
    parent: &mut Node,
    child: &mut Node,
    child_index: usize,
) -> Result<()> {
    let split_index = match tx.pager().split_index(child) {
        Some(index) => index,
        None => bail!("node on page {} cannot be split", child.page_num),
    };

    let mut right_items = child.items.split_off(split_index);
    let middle = right_items.remove(0);

    let new_node = if child.is_leaf() {
        tx.new_node(right_items, Vec::new())?
    } else {
        let right_children = child.children.split_off(split_index + 1);
        tx.new_node(right_items, right_children)?
    };
    let new_page = new_node.page_num;
    tx.write_node(new_node);

    parent.add_item(middle, child_index);
    parent.children.insert(child_index + 1, new_page);

    tx.write_node(parent.clone());
    tx.write_node(child.clone());
    Ok(())
}

/// Replaces the item at `index` of an internal node with its in-order
/// predecessor and returns the child indexes of the descent, so the caller
/// can extend the rebalance path down to the donating leaf.
fn remove_from_internal(
    tx: &mut Tx<'_>,
    node: &mut Node,
    index: usize,
) -> Result<AncestorPath> {
    let mut affected: AncestorPath = smallvec![index];

    let mut predecessor = tx.get_node(node.children[index])?;
    while !predecessor.is_leaf() {
        let last = predecessor.children.len() - 1;
        affected.push(last);
        predecessor = tx.get_node(predecessor.children[last])?;
    }

    let Some(stolen) = predecessor.items.pop() else {
        bail!("corrupt node: empty leaf on page {}", predecessor.page_num);
    };
    node.items[index] = stolen;
    tx.write_node(predecessor);
    Ok(affected)
}

/// Restores the min-fill invariant for `node`, child `node_index` of
/// `parent`: rotate from a sibling that can spare an element, else merge.
fn rebalance(
    tx: &mut Tx<'_>,
    parent: &mut Node,
    node: &mut Node,
    node_index: usize,
) -> Result<()> {
    if node_index > 0 {
        let mut left = tx.get_node(parent.children[node_index - 1])?;
        if tx.pager().can_spare_an_element(&left) {
            rotate_right(&mut left, parent, node, node_index);
            tx.write_node(left);
            tx.write_node(parent.clone());
            tx.write_node(node.clone());
            return Ok(());
        }
    }

    if node_index < parent.children.len() - 1 {
        let mut right = tx.get_node(parent.children[node_index + 1])?;
        if tx.pager().can_spare_an_element(&right) {
            rotate_left(node, parent, &mut right, node_index);
            tx.write_node(node.clone());
            tx.write_node(parent.clone());
            tx.write_node(right);
            return Ok(());
        }
    }

    if node_index == 0 {
        let mut right = tx.get_node(parent.children[node_index + 1])?;
        merge_into_left(tx, parent, node, &mut right, node_index + 1)
    } else {
        let mut left = tx.get_node(parent.children[node_index - 1])?;
        merge_into_left(tx, parent, &mut left, node, node_index)
    }
}

/// Moves the last element of `left` up through the parent separator and
/// down into the front of `right`.
fn rotate_right(left: &mut Node, parent: &mut Node, right: &mut Node, right_index: usize) {
    let spare = left.items.pop().unwrap();
    let separator_index = right_index.saturating_sub(1);
    let separator = std::mem::replace(&mut parent.items[separator_index], spare);
    right.items.insert(0, separator);

    if !left.is_leaf() {
        let child = left.children.pop().unwrap();
        right.children.insert(0, child);
    }
}

/// Mirror image of [`rotate_right`].
fn rotate_left(left: &mut Node, parent: &mut Node, right: &mut Node, right_index: usize) {
    let spare = right.items.remove(0);
    let separator_index = right_index.min(parent.items.len() - 1);
    let separator = std::mem::replace(&mut parent.items[separator_index], spare);
    left.items.push(separator);

    if !right.is_leaf() {
        let child = right.children.remove(0);
        left.children.push(child);
    }
}

/// Merges `right` (child `right_index` of `parent`) into its left sibling
/// together with the separating item, and frees `right`'s page. The parent
/// may become under-populated; the caller keeps rebalancing upward.
fn merge_into_left(
    tx: &mut Tx<'_>,
    parent: &mut Node,
    left: &mut Node,
    right: &mut Node,
    right_index: usize,
) -> Result<()> {
    let separator = parent.items.remove(right_index - 1);
    left.items.push(separator);
    left.items.append(&mut right.items);
    if !left.is_leaf() {
        left.children.append(&mut right.children);
    }
    parent.children.remove(right_index);

    tx.delete_node(right.page_num);
    tx.write_node(left.clone());
    tx.write_node(parent.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Options;
    use crate::Store;
    use hashbrown::HashSet;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 256;

    fn small_store(dir: &tempfile::TempDir) -> Store {
        let options = Options {
            page_size: PAGE_SIZE,
            min_fill_percent: 0.5,
            max_fill_percent: 1.0,
        };
        Store::open(dir.path().join("c.db"), options).unwrap()
    }

    /// Walks a collection's tree checking the structural invariants and
    /// returning (depth, all keys in order).
    fn check_tree(tx: &Tx<'_>, collection: &Collection) -> (usize, Vec<Vec<u8>>) {
        let mut pages = HashSet::new();
        let mut leaf_depths = HashSet::new();
        let mut keys = Vec::new();
        walk(tx, collection.root(), collection.root(), 1, &mut pages, &mut leaf_depths, &mut keys);

        assert_eq!(leaf_depths.len(), 1, "leaves at differing depths");
        for window in keys.windows(2) {
            assert!(window[0] < window[1], "keys out of order");
        }
        for released in tx.pager().freelist().released() {
            assert!(!pages.contains(released), "released page still referenced");
        }
        (leaf_depths.into_iter().next().unwrap(), keys)
    }

    fn walk(
        tx: &Tx<'_>,
        page_num: u64,
        root: u64,
        depth: usize,
        pages: &mut HashSet<u64>,
        leaf_depths: &mut HashSet<usize>,
        keys: &mut Vec<Vec<u8>>,
    ) {
        assert!(pages.insert(page_num), "page {} referenced twice", page_num);
        let node = tx.get_node(page_num).unwrap();

        assert!(node.node_size() <= PAGE_SIZE, "node exceeds the page");
        if page_num != root {
            assert!(
                !tx.pager().is_under_populated(&node),
                "non-root node below min fill"
            );
        }

        if node.is_leaf() {
            leaf_depths.insert(depth);
            keys.extend(node.items.iter().map(|item| item.key.clone()));
            return;
        }

        assert_eq!(node.children.len(), node.items.len() + 1);
        for (i, &child) in node.children.iter().enumerate() {
            walk(tx, child, root, depth + 1, pages, leaf_depths, keys);
            if i < node.items.len() {
                keys.push(node.items[i].key.clone());
            }
        }
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key{:04}", i).into_bytes()
    }

    #[test]
    fn put_then_find_roundtrip() {
        let dir = tempdir().unwrap();
        let store = small_store(&dir);

        let mut tx = store.begin_write();
        let mut c = tx.create_collection(b"c").unwrap();
        c.put(&mut tx, b"hello", b"world").unwrap();

        let item = c.find(&tx, b"hello").unwrap().unwrap();
        assert_eq!(item.key, b"hello");
        assert_eq!(item.value, b"world");
        assert!(c.find(&tx, b"absent").unwrap().is_none());
        tx.commit().unwrap();
    }

    #[test]
    fn put_overwrites_existing_value() {
        let dir = tempdir().unwrap();
        let store = small_store(&dir);

        let mut tx = store.begin_write();
        let mut c = tx.create_collection(b"c").unwrap();
        c.put(&mut tx, b"k", b"first").unwrap();
        c.put(&mut tx, b"k", b"second").unwrap();

        let item = c.find(&tx, b"k").unwrap().unwrap();
        assert_eq!(item.value, b"second");
        tx.commit().unwrap();
    }

    #[test]
    fn put_rejects_oversized_keys_and_values() {
        let dir = tempdir().unwrap();
        let store = small_store(&dir);

        let mut tx = store.begin_write();
        let mut c = tx.create_collection(b"c").unwrap();

        let result = c.put(&mut tx, &[1u8; 256], b"v");
        assert!(result.unwrap_err().to_string().contains("key too large"));

        let result = c.put(&mut tx, b"k", &[1u8; 256]);
        assert!(result.unwrap_err().to_string().contains("value too large"));
        tx.rollback();
    }

    #[test]
    fn remove_missing_key_fails() {
        let dir = tempdir().unwrap();
        let store = small_store(&dir);

        let mut tx = store.begin_write();
        let mut c = tx.create_collection(b"c").unwrap();
        c.put(&mut tx, b"a", b"1").unwrap();

        let result = c.remove(&mut tx, b"zz");

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("key not found"));
        tx.rollback();
    }

    #[test]
    fn remove_leaves_other_keys_intact() {
        let dir = tempdir().unwrap();
        let store = small_store(&dir);

        let mut tx = store.begin_write();
        let mut c = tx.create_collection(b"c").unwrap();
        for letter in b'a'..=b'z' {
            c.put(&mut tx, &[letter], &[letter, letter]).unwrap();
        }

        c.remove(&mut tx, b"m").unwrap();

        assert!(c.find(&tx, b"m").unwrap().is_none());
        for letter in (b'a'..=b'z').filter(|&l| l != b'm') {
            let item = c.find(&tx, &[letter]).unwrap().unwrap();
            assert_eq!(item.value, vec![letter, letter]);
        }
        tx.commit().unwrap();
    }

    #[test]
    fn sequential_inserts_split_into_a_multi_level_tree() {
        let dir = tempdir().unwrap();
        let store = small_store(&dir);

        let mut tx = store.begin_write();
        let mut c = tx.create_collection(b"c").unwrap();
        for i in 0..120 {
            c.put(&mut tx, &key(i), b"0123456789abcdef").unwrap();
        }

        let root = tx.get_node(c.root()).unwrap();
        assert!(!root.is_leaf(), "tree should have split");

        let (depth, keys) = check_tree(&tx, &c);
        assert!(depth >= 2);
        assert_eq!(keys.len(), 120);
        for i in 0..120 {
            let item = c.find(&tx, &key(i)).unwrap().unwrap();
            assert_eq!(item.value, b"0123456789abcdef");
        }
        assert!(c.find(&tx, &key(120)).unwrap().is_none());
        tx.commit().unwrap();
    }

    #[test]
    fn reverse_inserts_keep_the_tree_ordered() {
        let dir = tempdir().unwrap();
        let store = small_store(&dir);

        let mut tx = store.begin_write();
        let mut c = tx.create_collection(b"c").unwrap();
        for i in (0..80).rev() {
            c.put(&mut tx, &key(i), b"v").unwrap();
        }

        let (_, keys) = check_tree(&tx, &c);
        assert_eq!(keys, (0..80).map(key).collect::<Vec<_>>());
        tx.commit().unwrap();
    }

    #[test]
    fn deletes_rebalance_and_preserve_remaining_keys() {
        let dir = tempdir().unwrap();
        let store = small_store(&dir);

        let mut tx = store.begin_write();
        let mut c = tx.create_collection(b"c").unwrap();
        for i in 0..120 {
            c.put(&mut tx, &key(i), b"0123456789abcdef").unwrap();
        }

        for i in (0..120).step_by(2) {
            c.remove(&mut tx, &key(i)).unwrap();
        }

        let (_, keys) = check_tree(&tx, &c);
        assert_eq!(keys.len(), 60);
        for i in 0..120 {
            let found = c.find(&tx, &key(i)).unwrap();
            if i % 2 == 0 {
                assert!(found.is_none(), "key {} should be gone", i);
            } else {
                assert!(found.is_some(), "key {} should remain", i);
            }
        }
        tx.commit().unwrap();
    }

    #[test]
    fn draining_a_collection_collapses_the_root() {
        let dir = tempdir().unwrap();
        let store = small_store(&dir);

        let mut tx = store.begin_write();
        let mut c = tx.create_collection(b"c").unwrap();
        for i in 0..120 {
            c.put(&mut tx, &key(i), b"0123456789abcdef").unwrap();
        }
        let (deep, _) = check_tree(&tx, &c);
        assert!(deep >= 2);

        for i in 0..115 {
            c.remove(&mut tx, &key(i)).unwrap();
        }

        let (depth, keys) = check_tree(&tx, &c);
        assert!(depth < deep, "root should have collapsed");
        assert_eq!(keys, (115..120).map(key).collect::<Vec<_>>());
        tx.commit().unwrap();
    }

    #[test]
    fn removing_internal_keys_pulls_up_the_predecessor() {
        let dir = tempdir().unwrap();
        let store = small_store(&dir);

        let mut tx = store.begin_write();
        let mut c = tx.create_collection(b"c").unwrap();
        for i in 0..120 {
            c.put(&mut tx, &key(i), b"0123456789abcdef").unwrap();
        }

        // Remove every separator held by the root so deletion goes through
        // the internal-node path.
        let root = tx.get_node(c.root()).unwrap();
        assert!(!root.is_leaf());
        let separators: Vec<Vec<u8>> =
            root.items.iter().map(|item| item.key.clone()).collect();
        for separator in &separators {
            c.remove(&mut tx, separator).unwrap();
        }

        let (_, keys) = check_tree(&tx, &c);
        assert_eq!(keys.len(), 120 - separators.len());
        for separator in &separators {
            assert!(c.find(&tx, separator).unwrap().is_none());
        }
        tx.commit().unwrap();
    }

    #[test]
    fn split_root_survives_commit_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.db");
        let options = Options {
            page_size: PAGE_SIZE,
            min_fill_percent: 0.5,
            max_fill_percent: 1.0,
        };

        {
            let store = Store::open(&path, options.clone()).unwrap();
            let mut tx = store.begin_write();
            let mut c = tx.create_collection(b"c").unwrap();
            for i in 0..120 {
                c.put(&mut tx, &key(i), b"0123456789abcdef").unwrap();
            }
            tx.commit().unwrap();
            store.close().unwrap();
        }

        let store = Store::open(&path, options).unwrap();
        let tx = store.begin_read();
        let c = tx.get_collection(b"c").unwrap().unwrap();
        for i in 0..120 {
            assert!(c.find(&tx, &key(i)).unwrap().is_some(), "key {} lost", i);
        }
        tx.commit().unwrap();
        store.close().unwrap();
    }
}
