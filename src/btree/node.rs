use crate::{
    error::{ErrorKind, SmallError},
    io::{read_exact, Decodeable, SmallWriter},
    storage::page::PAGE_HEADER_SIZE,
    types::PageId,
};

/// In-memory form of one B-Tree node, parsed from and serialized back
/// to a page body.
///
/// Leaves hold sorted `(key, value)` pairs plus a `next_leaf` pointer
/// for ordered iteration. Internal nodes hold sorted
/// `(separator, child)` pairs where the separator is the upper bound
/// of the child's subtree; an empty separator means "no upper bound"
/// and can only appear in the last position (the right spine of the
/// tree).
///
/// # Body format
///
/// - 1 byte: leaf flag
/// - 2 bytes: entry count
/// - 8 bytes: next leaf page id (0 for internal nodes and last leaves)
/// - entries: `klen u16 | key | vlen u16 | value` for leaves,
///   `klen u16 | key | child u64` for internal nodes
#[derive(Debug, Clone, PartialEq)]
pub struct BTreeNode {
    pub is_leaf: bool,
    pub next_leaf: PageId,
    pub keys: Vec<Vec<u8>>,

    /// Leaf payloads; empty for internal nodes.
    pub values: Vec<Vec<u8>>,

    /// Child page ids; empty for leaves.
    pub children: Vec<PageId>,
}

const NODE_HEADER_SIZE: usize = 11;

impl BTreeNode {
    pub fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            next_leaf: 0,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn new_internal() -> Self {
        Self {
            is_leaf: false,
            next_leaf: 0,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn parse(body: &[u8]) -> Result<Self, SmallError> {
        let mut reader = std::io::Cursor::new(body);
        let is_leaf = u8::decode_from(&mut reader) != 0;
        let count = u16::decode_from(&mut reader) as usize;
        let next_leaf = u64::decode_from(&mut reader);

        let mut keys = Vec::with_capacity(count);
        let mut values = Vec::new();
        let mut children = Vec::new();

        for _ in 0..count {
            let klen = u16::decode_from(&mut reader) as usize;
            keys.push(read_exact(&mut reader, klen));
            if is_leaf {
                let vlen = u16::decode_from(&mut reader) as usize;
                values.push(read_exact(&mut reader, vlen));
            } else {
                children.push(u64::decode_from(&mut reader));
            }
        }

        Ok(Self {
            is_leaf,
            next_leaf,
            keys,
            values,
            children,
        })
    }

    /// Parse the node out of a full page image.
    pub fn parse_page(image: &[u8]) -> Result<Self, SmallError> {
        Self::parse(&image[PAGE_HEADER_SIZE..])
    }

    pub fn entry_count(&self) -> usize {
        self.keys.len()
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = NODE_HEADER_SIZE;
        for (i, key) in self.keys.iter().enumerate() {
            size += 2 + key.len();
            if self.is_leaf {
                size += 2 + self.values[i].len();
            } else {
                size += 8;
            }
        }
        size
    }

    pub fn fits(&self, body_len: usize) -> bool {
        self.serialized_size() <= body_len
    }

    /// Serialize into a page body, which must be large enough.
    pub fn serialize(&self, body: &mut [u8]) -> Result<(), SmallError> {
        if !self.fits(body.len()) {
            return Err(SmallError::new(
                ErrorKind::Internal,
                &format!(
                    "node of {} bytes does not fit a {} byte body",
                    self.serialized_size(),
                    body.len()
                ),
            ));
        }

        let mut writer = SmallWriter::new();
        writer.write(&(self.is_leaf as u8));
        writer.write(&(self.keys.len() as u16));
        writer.write(&self.next_leaf);
        for (i, key) in self.keys.iter().enumerate() {
            writer.write(&(key.len() as u16));
            writer.write_bytes(key);
            if self.is_leaf {
                writer.write(&(self.values[i].len() as u16));
                writer.write_bytes(&self.values[i]);
            } else {
                writer.write(&self.children[i]);
            }
        }

        let bytes = writer.to_bytes();
        body[..bytes.len()].copy_from_slice(&bytes);
        // zero the remainder so stale cells never resurface on parse
        for byte in body[bytes.len()..].iter_mut() {
            *byte = 0;
        }
        Ok(())
    }

    /// Write the node into a full page image, leaving the page header
    /// alone.
    pub fn serialize_page(&self, image: &mut [u8]) -> Result<(), SmallError> {
        self.serialize(&mut image[PAGE_HEADER_SIZE..])
    }

    /// Position of the first entry whose key is greater than or equal
    /// to `key`; `entry_count()` when every key is smaller. An empty
    /// separator in an internal node compares as positive infinity.
    pub fn search(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.keys.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_is_less(mid, key) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Whether `keys[index] < key`, treating an empty internal
    /// separator as infinite.
    fn key_is_less(&self, index: usize, key: &[u8]) -> bool {
        let stored = &self.keys[index];
        if !self.is_leaf && stored.is_empty() {
            return false;
        }
        stored.as_slice() < key
    }

    /// Exact match position, leaves only.
    pub fn find_key(&self, key: &[u8]) -> Option<usize> {
        let pos = self.search(key);
        if pos < self.keys.len() && self.keys[pos] == key {
            Some(pos)
        } else {
            None
        }
    }

    /// Child to descend into for `key`, internal nodes only.
    pub fn child_for(&self, key: &[u8]) -> PageId {
        let pos = self.search(key).min(self.children.len() - 1);
        self.children[pos]
    }

    pub fn leaf_insert_at(&mut self, index: usize, key: Vec<u8>, value: Vec<u8>) {
        debug_assert!(self.is_leaf);
        self.keys.insert(index, key);
        self.values.insert(index, value);
    }

    pub fn leaf_remove_at(&mut self, index: usize) -> (Vec<u8>, Vec<u8>) {
        debug_assert!(self.is_leaf);
        (self.keys.remove(index), self.values.remove(index))
    }

    pub fn internal_insert_at(&mut self, index: usize, key: Vec<u8>, child: PageId) {
        debug_assert!(!self.is_leaf);
        self.keys.insert(index, key);
        self.children.insert(index, child);
    }

    pub fn internal_remove_at(&mut self, index: usize) -> (Vec<u8>, PageId) {
        debug_assert!(!self.is_leaf);
        (self.keys.remove(index), self.children.remove(index))
    }

    /// Split off the upper half. `self` keeps the lower entries and
    /// the returned node receives the rest; leaf sibling pointers are
    /// rewired by the caller, which knows the new page's id.
    pub fn split_upper_half(&mut self) -> BTreeNode {
        let mid = self.keys.len() / 2;
        let mut right = if self.is_leaf {
            Self::new_leaf()
        } else {
            Self::new_internal()
        };

        right.keys = self.keys.split_off(mid);
        if self.is_leaf {
            right.values = self.values.split_off(mid);
            right.next_leaf = self.next_leaf;
        } else {
            right.children = self.children.split_off(mid);
        }
        right
    }

    /// The key that bounds this node from above: the last key for a
    /// leaf, the last separator for an internal node (which may be
    /// empty, meaning unbounded).
    pub fn upper_key(&self) -> Vec<u8> {
        self.keys.last().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(entries: &[(&[u8], &[u8])]) -> BTreeNode {
        let mut node = BTreeNode::new_leaf();
        for (k, v) in entries {
            node.keys.push(k.to_vec());
            node.values.push(v.to_vec());
        }
        node
    }

    #[test]
    fn test_leaf_round_trip() {
        let mut node = leaf_with(&[(b"apple", b"1"), (b"pear", b"2")]);
        node.next_leaf = 77;

        let mut body = vec![0u8; 512];
        node.serialize(&mut body).unwrap();
        let parsed = BTreeNode::parse(&body).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_internal_round_trip() {
        let mut node = BTreeNode::new_internal();
        node.keys = vec![b"m".to_vec(), Vec::new()];
        node.children = vec![3, 4];

        let mut body = vec![0u8; 256];
        node.serialize(&mut body).unwrap();
        let parsed = BTreeNode::parse(&body).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_search_and_child_for() {
        let mut node = BTreeNode::new_internal();
        node.keys = vec![b"g".to_vec(), b"p".to_vec(), Vec::new()];
        node.children = vec![10, 20, 30];

        assert_eq!(node.child_for(b"a"), 10);
        assert_eq!(node.child_for(b"g"), 10);
        assert_eq!(node.child_for(b"h"), 20);
        assert_eq!(node.child_for(b"q"), 30);
        assert_eq!(node.child_for(b"zzz"), 30);
    }

    #[test]
    fn test_find_key() {
        let node = leaf_with(&[(b"a", b"1"), (b"c", b"2"), (b"e", b"3")]);
        assert_eq!(node.find_key(b"c"), Some(1));
        assert_eq!(node.find_key(b"b"), None);
        assert_eq!(node.find_key(b"z"), None);
    }

    #[test]
    fn test_split_upper_half_keeps_order() {
        let mut node = leaf_with(&[
            (b"a", b"1"),
            (b"b", b"2"),
            (b"c", b"3"),
            (b"d", b"4"),
        ]);
        node.next_leaf = 9;

        let right = node.split_upper_half();
        assert_eq!(node.keys, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(right.keys, vec![b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(right.next_leaf, 9);
        assert_eq!(node.upper_key(), b"b".to_vec());
    }

    #[test]
    fn test_fits_accounts_for_entries() {
        let mut node = BTreeNode::new_leaf();
        assert!(node.fits(64));
        for i in 0..10u8 {
            node.keys.push(vec![i; 16]);
            node.values.push(vec![i; 16]);
        }
        assert!(!node.fits(64));
    }
}
