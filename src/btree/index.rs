use crate::{
    btree::tree::BTree,
    error::SmallError,
    transaction::Transaction,
    types::{PageId, SmallResult},
};

/// The seam every index kind plugs into: ordered byte keys mapping to
/// document id bytes, with all page mutations staged in the caller's
/// transaction. The B-Tree is the built-in implementation; spatial and
/// vector kinds replace the node layout but keep this contract.
pub trait Index {
    fn root(&self) -> PageId;

    fn insert(&mut self, tx: &mut Transaction, key: &[u8], value: &[u8]) -> SmallResult;

    fn delete(&mut self, tx: &mut Transaction, key: &[u8]) -> Result<bool, SmallError>;

    fn seek(&self, tx: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>, SmallError>;

    fn range(
        &self,
        tx: &Transaction,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        ascending: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmallError>;

    fn prefix(
        &self,
        tx: &Transaction,
        prefix: &[u8],
        ascending: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmallError>;

    /// Release every page of the index back to the free list.
    fn free_all(&mut self, tx: &mut Transaction) -> SmallResult;
}

impl Index for BTree {
    fn root(&self) -> PageId {
        BTree::root(self)
    }

    fn insert(&mut self, tx: &mut Transaction, key: &[u8], value: &[u8]) -> SmallResult {
        BTree::insert(self, tx, key, value)
    }

    fn delete(&mut self, tx: &mut Transaction, key: &[u8]) -> Result<bool, SmallError> {
        BTree::delete(self, tx, key)
    }

    fn seek(&self, tx: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>, SmallError> {
        BTree::seek(self, tx, key)
    }

    fn range(
        &self,
        tx: &Transaction,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        ascending: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmallError> {
        BTree::range(self, tx, lo, hi, ascending)
    }

    fn prefix(
        &self,
        tx: &Transaction,
        prefix: &[u8],
        ascending: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmallError> {
        BTree::prefix(self, tx, prefix, ascending)
    }

    fn free_all(&mut self, tx: &mut Transaction) -> SmallResult {
        BTree::free_all(self, tx)
    }
}
