use log::debug;

use crate::{
    btree::node::BTreeNode,
    error::{ErrorKind, SmallError},
    storage::page::{PageCategory, PAGE_HEADER_SIZE},
    transaction::Transaction,
    types::{PageId, SmallResult},
};

/// Occupancy (in percent of the body) below which a node tries to
/// borrow from or merge with a sibling.
const UNDERFLOW_PERCENT: usize = 40;

enum InsertOutcome {
    Done,
    /// The node at the original page kept the lower half of its
    /// entries, now bounded above by `sep`; `right` is the fresh page
    /// holding the upper half.
    Split { sep: Vec<u8>, right: PageId },
}

/// A balanced ordered tree of fixed-size pages, used for both the
/// per-collection ID map and the secondary indexes.
///
/// All node reads and writes go through the owning transaction, so a
/// structural change touching O(height) pages lands in one commit
/// atomically. The root page id changes on root splits and merges;
/// callers watch `root()` and persist it to the catalog.
pub struct BTree {
    root: PageId,
    leaf_category: PageCategory,
    internal_category: PageCategory,
}

impl BTree {
    /// The ID map of a collection: document id bytes -> slot location.
    pub fn id_map(root: PageId) -> Self {
        Self {
            root,
            leaf_category: PageCategory::IdMap,
            internal_category: PageCategory::IdMap,
        }
    }

    /// A secondary index: encoded key -> document id bytes.
    pub fn index(root: PageId) -> Self {
        Self {
            root,
            leaf_category: PageCategory::IndexLeaf,
            internal_category: PageCategory::IndexInternal,
        }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    fn body_len(&self, tx: &Transaction) -> usize {
        tx.page_size() - PAGE_HEADER_SIZE
    }

    fn load(&self, tx: &Transaction, page_id: PageId) -> Result<BTreeNode, SmallError> {
        let image = tx.read_page(page_id)?;
        BTreeNode::parse_page(&image)
    }

    fn store(&self, tx: &mut Transaction, page_id: PageId, node: &BTreeNode) -> SmallResult {
        let image = tx.get_mut_page(page_id)?;
        node.serialize_page(image)
    }

    /// Point lookup.
    pub fn seek(&self, tx: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>, SmallError> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut page_id = self.root;
        loop {
            let node = self.load(tx, page_id)?;
            if node.is_leaf {
                return Ok(node.find_key(key).map(|pos| node.values[pos].clone()));
            }
            page_id = node.child_for(key);
        }
    }

    /// Insert a new entry. An existing equal key fails with
    /// `DuplicateKey`; replacing goes through `delete` + `insert`.
    pub fn insert(&mut self, tx: &mut Transaction, key: &[u8], value: &[u8]) -> SmallResult {
        let body_len = self.body_len(tx);
        if 4 + key.len() + value.len() > body_len / 4 {
            return Err(SmallError::new(
                ErrorKind::Capacity,
                &format!("index entry of {} bytes is too large", key.len() + value.len()),
            ));
        }

        if self.root == 0 {
            let page_id = tx.allocate_page(self.leaf_category)?;
            let mut node = BTreeNode::new_leaf();
            node.leaf_insert_at(0, key.to_vec(), value.to_vec());
            self.store(tx, page_id, &node)?;
            self.root = page_id;
            return Ok(());
        }

        match self.insert_rec(tx, self.root, key, value)? {
            InsertOutcome::Done => Ok(()),
            InsertOutcome::Split { sep, right } => {
                // grow the tree by one level
                let new_root = tx.allocate_page(self.internal_category)?;
                let mut node = BTreeNode::new_internal();
                node.internal_insert_at(0, sep, self.root);
                node.internal_insert_at(1, Vec::new(), right);
                self.store(tx, new_root, &node)?;
                debug!("btree root split: {} -> {}", self.root, new_root);
                self.root = new_root;
                Ok(())
            }
        }
    }

    fn insert_rec(
        &self,
        tx: &mut Transaction,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<InsertOutcome, SmallError> {
        let body_len = self.body_len(tx);
        let mut node = self.load(tx, page_id)?;

        if node.is_leaf {
            if node.find_key(key).is_some() {
                return Err(SmallError::new(
                    ErrorKind::DuplicateKey,
                    &format!("key {} already exists", hex::encode(key)),
                ));
            }
            let pos = node.search(key);
            node.leaf_insert_at(pos, key.to_vec(), value.to_vec());

            if node.fits(body_len) {
                self.store(tx, page_id, &node)?;
                return Ok(InsertOutcome::Done);
            }

            // split at the median; the new right leaf joins the
            // sibling chain
            let right = node.split_upper_half();
            let right_page = tx.allocate_page(self.leaf_category)?;
            node.next_leaf = right_page;
            let sep = node.upper_key();
            self.store(tx, page_id, &node)?;
            self.store(tx, right_page, &right)?;
            return Ok(InsertOutcome::Split {
                sep,
                right: right_page,
            });
        }

        let pos = node.search(key).min(node.children.len() - 1);
        let child = node.children[pos];
        match self.insert_rec(tx, child, key, value)? {
            InsertOutcome::Done => Ok(InsertOutcome::Done),
            InsertOutcome::Split { sep, right } => {
                // the entry at pos keeps its separator but now bounds
                // the new right node; the demoted separator points at
                // the old child
                node.children[pos] = right;
                node.internal_insert_at(pos, sep, child);

                if node.fits(body_len) {
                    self.store(tx, page_id, &node)?;
                    return Ok(InsertOutcome::Done);
                }

                let right_node = node.split_upper_half();
                let right_page = tx.allocate_page(self.internal_category)?;
                let sep = node.upper_key();
                self.store(tx, page_id, &node)?;
                self.store(tx, right_page, &right_node)?;
                Ok(InsertOutcome::Split {
                    sep,
                    right: right_page,
                })
            }
        }
    }

    /// Remove an entry. Returns false when the key is absent.
    pub fn delete(&mut self, tx: &mut Transaction, key: &[u8]) -> Result<bool, SmallError> {
        if self.root == 0 {
            return Ok(false);
        }
        let removed = self.delete_rec(tx, self.root, key)?;
        if !removed {
            return Ok(false);
        }

        let node = self.load(tx, self.root)?;
        if !node.is_leaf && node.entry_count() == 1 {
            // a root with a single child shrinks the tree
            let child = node.children[0];
            tx.free_page(self.root)?;
            debug!("btree root merge: {} -> {}", self.root, child);
            self.root = child;
        } else if node.is_leaf && node.entry_count() == 0 {
            tx.free_page(self.root)?;
            self.root = 0;
        }
        Ok(true)
    }

    fn delete_rec(
        &self,
        tx: &mut Transaction,
        page_id: PageId,
        key: &[u8],
    ) -> Result<bool, SmallError> {
        let mut node = self.load(tx, page_id)?;

        if node.is_leaf {
            match node.find_key(key) {
                None => return Ok(false),
                Some(pos) => {
                    node.leaf_remove_at(pos);
                    self.store(tx, page_id, &node)?;
                    return Ok(true);
                }
            }
        }

        let pos = node.search(key).min(node.children.len() - 1);
        let child = node.children[pos];
        if !self.delete_rec(tx, child, key)? {
            return Ok(false);
        }

        let child_node = self.load(tx, child)?;
        let body_len = self.body_len(tx);
        if child_node.serialized_size() * 100 < body_len * UNDERFLOW_PERCENT
            && node.children.len() > 1
        {
            self.rebalance(tx, &mut node, pos)?;
            self.store(tx, page_id, &node)?;
        }
        Ok(true)
    }

    /// Borrow from or merge with a sibling of the underfull child at
    /// `pos`. Separator bounds in the parent are updated to stay valid
    /// (they do not have to be tight).
    fn rebalance(&self, tx: &mut Transaction, parent: &mut BTreeNode, pos: usize) -> SmallResult {
        let body_len = self.body_len(tx);
        let child_page = parent.children[pos];
        let mut child = self.load(tx, child_page)?;

        if pos + 1 < parent.children.len() {
            let right_page = parent.children[pos + 1];
            let mut right = self.load(tx, right_page)?;

            if child.serialized_size() + right.serialized_size() <= body_len {
                // merge right into child; the right sibling's entry in
                // the parent keeps its bound but points at the child
                child.keys.append(&mut right.keys);
                if child.is_leaf {
                    child.values.append(&mut right.values);
                    child.next_leaf = right.next_leaf;
                } else {
                    child.children.append(&mut right.children);
                }
                parent.children[pos + 1] = child_page;
                parent.internal_remove_at(pos);
                self.store(tx, child_page, &child)?;
                tx.free_page(right_page)?;
                debug!("btree merged page {} into {}", right_page, child_page);
            } else if right.entry_count() >= 2 {
                // borrow the right sibling's first entry
                if child.is_leaf {
                    let (k, v) = right.leaf_remove_at(0);
                    let end = child.entry_count();
                    child.leaf_insert_at(end, k, v);
                } else {
                    let (k, c) = right.internal_remove_at(0);
                    let end = child.entry_count();
                    child.internal_insert_at(end, k, c);
                }
                parent.keys[pos] = child.upper_key();
                self.store(tx, child_page, &child)?;
                self.store(tx, right_page, &right)?;
            }
        } else if pos > 0 {
            let left_page = parent.children[pos - 1];
            let mut left = self.load(tx, left_page)?;

            if left.serialized_size() + child.serialized_size() <= body_len {
                // merge child into left
                left.keys.append(&mut child.keys);
                if left.is_leaf {
                    left.values.append(&mut child.values);
                    left.next_leaf = child.next_leaf;
                } else {
                    left.children.append(&mut child.children);
                }
                parent.children[pos] = left_page;
                parent.internal_remove_at(pos - 1);
                self.store(tx, left_page, &left)?;
                tx.free_page(child_page)?;
                debug!("btree merged page {} into {}", child_page, left_page);
            } else if left.entry_count() >= 2 {
                // borrow the left sibling's last entry
                let last = left.entry_count() - 1;
                if child.is_leaf {
                    let (k, v) = left.leaf_remove_at(last);
                    child.leaf_insert_at(0, k, v);
                } else {
                    let (k, c) = left.internal_remove_at(last);
                    child.internal_insert_at(0, k, c);
                }
                parent.keys[pos - 1] = left.upper_key();
                self.store(tx, left_page, &left)?;
                self.store(tx, child_page, &child)?;
            }
        }
        Ok(())
    }

    /// Ordered scan over `[lo, hi)`. Entries are materialized in key
    /// order; descending scans reverse the collected run.
    pub fn range(
        &self,
        tx: &Transaction,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        ascending: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmallError> {
        let mut entries = Vec::new();
        if self.root == 0 {
            return Ok(entries);
        }

        // descend to the leaf that may contain `lo`
        let mut page_id = self.root;
        loop {
            let node = self.load(tx, page_id)?;
            if node.is_leaf {
                break;
            }
            page_id = match lo {
                Some(lo) => node.child_for(lo),
                None => node.children[0],
            };
        }

        'leaves: loop {
            let node = self.load(tx, page_id)?;
            for (pos, key) in node.keys.iter().enumerate() {
                if let Some(lo) = lo {
                    if key.as_slice() < lo {
                        continue;
                    }
                }
                if let Some(hi) = hi {
                    if key.as_slice() >= hi {
                        break 'leaves;
                    }
                }
                entries.push((key.clone(), node.values[pos].clone()));
            }
            if node.next_leaf == 0 {
                break;
            }
            page_id = node.next_leaf;
        }

        if !ascending {
            entries.reverse();
        }
        Ok(entries)
    }

    /// Ordered scan over every entry whose key starts with `prefix`.
    pub fn prefix(
        &self,
        tx: &Transaction,
        prefix: &[u8],
        ascending: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmallError> {
        let hi = prefix_successor(prefix);
        self.range(tx, Some(prefix), hi.as_deref(), ascending)
    }

    /// The greatest entry in the tree, if any.
    pub fn last_entry(&self, tx: &Transaction) -> Result<Option<(Vec<u8>, Vec<u8>)>, SmallError> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut page_id = self.root;
        loop {
            let node = self.load(tx, page_id)?;
            if node.is_leaf {
                let last = node.entry_count();
                if last == 0 {
                    return Ok(None);
                }
                return Ok(Some((
                    node.keys[last - 1].clone(),
                    node.values[last - 1].clone(),
                )));
            }
            page_id = *node.children.last().unwrap();
        }
    }

    /// Walk every leaf in order, releasing the pages to the free list.
    /// Used when an index or a collection is dropped.
    pub fn free_all(&mut self, tx: &mut Transaction) -> SmallResult {
        if self.root == 0 {
            return Ok(());
        }
        self.free_rec(tx, self.root)?;
        self.root = 0;
        Ok(())
    }

    fn free_rec(&self, tx: &mut Transaction, page_id: PageId) -> SmallResult {
        let node = self.load(tx, page_id)?;
        if !node.is_leaf {
            for child in &node.children {
                self.free_rec(tx, *child)?;
            }
        }
        tx.free_page(page_id)
    }
}

/// The smallest byte string greater than every key starting with
/// `prefix`, or None when no upper bound exists (all-0xff prefixes).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(upper);
        }
        upper.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::prefix_successor;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_successor(&[0x05, 0xff]), Some(vec![0x06]));
        assert_eq!(prefix_successor(&[0xff, 0xff]), None);
    }
}
