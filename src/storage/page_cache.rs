use std::collections::HashMap;

use bytes::Bytes;

use crate::types::{Lsn, PageId};

/// Committed page images that the checkpoint has not yet applied to
/// the page file.
///
/// The commit sequence publishes every staged image here (under the
/// commit-writer latch, so publication order equals LSN order); readers
/// consult the cache between their own write set and the mapped file.
/// Once the checkpoint has durably applied the WAL through some LSN,
/// the images at or below it are dropped.
pub struct PageCache {
    pages: HashMap<PageId, (Lsn, Bytes)>,
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
        }
    }

    /// Latest committed image of a page, if newer than the page file.
    pub fn get(&self, page_id: PageId) -> Option<Bytes> {
        self.pages.get(&page_id).map(|(_, image)| image.clone())
    }

    /// Publish the staged images of a committed transaction.
    pub fn publish(&mut self, lsn: Lsn, pages: impl Iterator<Item = (PageId, Bytes)>) {
        for (page_id, image) in pages {
            self.pages.insert(page_id, (lsn, image));
        }
    }

    /// Drop every image whose commit LSN is at or below `lsn`; they are
    /// now readable from the page file itself.
    pub fn evict_up_to(&mut self, lsn: Lsn) {
        self.pages.retain(|_, (commit_lsn, _)| *commit_lsn > lsn);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_evict() {
        let mut cache = PageCache::new();
        cache.publish(1, vec![(5, Bytes::from(vec![1u8]))].into_iter());
        cache.publish(2, vec![(6, Bytes::from(vec![2u8]))].into_iter());

        assert_eq!(cache.get(5).unwrap()[0], 1);
        assert_eq!(cache.get(6).unwrap()[0], 2);

        cache.evict_up_to(1);
        assert!(cache.get(5).is_none());
        assert_eq!(cache.get(6).unwrap()[0], 2);

        cache.evict_up_to(2);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_later_commit_wins() {
        let mut cache = PageCache::new();
        cache.publish(1, vec![(5, Bytes::from(vec![1u8]))].into_iter());
        cache.publish(9, vec![(5, Bytes::from(vec![9u8]))].into_iter());

        assert_eq!(cache.get(5).unwrap()[0], 9);

        // evicting the old lsn must not drop the newer image
        cache.evict_up_to(1);
        assert_eq!(cache.get(5).unwrap()[0], 9);
    }
}
