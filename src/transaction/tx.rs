use std::{collections::HashMap, fmt, sync::atomic::Ordering, sync::Arc};

use bytes::Bytes;
use log::debug;

use crate::{
    config::AccessMode,
    database::DbContext,
    document::catalog::Catalog,
    error::{ErrorKind, SmallError},
    storage::page::{self, MetaPage, PageCategory, PageHeader, PAGE_HEADER_SIZE},
    stream::ChangeEvent,
    types::{Lsn, PageId, SmallResult, TxnId},
    utils::HandyRwLock,
};

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

/// A unit of atomic work against the engine.
///
/// Page mutations are staged as private copies in the write set and
/// only reach the WAL when `commit` runs; reads see the transaction's
/// own staged images first (read-your-writes), then the committed
/// overlay, then the page file. A transaction that is dropped while
/// still active aborts.
pub struct Transaction {
    id: TxnId,
    snapshot_lsn: Lsn,
    status: TransactionStatus,
    page_size: usize,

    write_set: HashMap<PageId, Vec<u8>>,

    /// First-touch order of staged pages; WAL data records are written
    /// in this order so replay reproduces the same final images.
    write_order: Vec<PageId>,

    /// Clone-on-write copy of the shared catalog; installed at commit.
    catalog_patch: Option<Catalog>,

    /// Change events accumulated by document operations, published
    /// (with the commit LSN stamped in) after the commit is durable.
    events: Vec<ChangeEvent>,

    holds_writer_latch: bool,
    ctx: Arc<DbContext>,
}

impl Transaction {
    pub(crate) fn new(ctx: Arc<DbContext>) -> Self {
        let (id, snapshot_lsn) = ctx.tx_manager.begin();
        let page_size = ctx.page_file.rl().page_size();
        Self {
            id,
            snapshot_lsn,
            status: TransactionStatus::Active,
            page_size,
            write_set: HashMap::new(),
            write_order: Vec::new(),
            catalog_patch: None,
            events: Vec::new(),
            holds_writer_latch: false,
            ctx,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn snapshot_lsn(&self) -> Lsn {
        self.snapshot_lsn
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Take the writer latch on the first mutation. From here until
    /// commit or abort this transaction is the engine's only writer.
    fn ensure_writable(&mut self) -> SmallResult {
        if self.status != TransactionStatus::Active {
            return Err(SmallError::new(
                ErrorKind::Internal,
                &format!("{} is not active", self),
            ));
        }
        if self.ctx.config.access == AccessMode::Read {
            return Err(SmallError::new(
                ErrorKind::ReadOnly,
                "mutating operation on a read-only engine",
            ));
        }
        if self.ctx.demoted.load(Ordering::SeqCst) {
            return Err(SmallError::new(
                ErrorKind::ReadOnly,
                "engine was demoted to read-only after a fatal error",
            ));
        }
        if !self.holds_writer_latch {
            self.ctx.tx_manager.writer_latch.acquire();
            self.holds_writer_latch = true;
        }
        Ok(())
    }

    fn release_latch(&mut self) {
        if self.holds_writer_latch {
            self.ctx.tx_manager.writer_latch.release();
            self.holds_writer_latch = false;
        }
    }

    /// Current image of a page as this transaction sees it: own write
    /// set, then committed-but-unapplied overlay, then the mapped file.
    pub fn read_page(&self, page_id: PageId) -> Result<Vec<u8>, SmallError> {
        if let Some(image) = self.write_set.get(&page_id) {
            return Ok(image.clone());
        }
        if let Some(image) = self.ctx.page_cache.rl().get(page_id) {
            return Ok(image.to_vec());
        }
        let mut buf = vec![0u8; self.page_size];
        self.ctx
            .page_file
            .rl()
            .read_page(page_id, &mut buf)
            .map_err(|e| self.ctx.note_error(e))?;
        Ok(buf)
    }

    /// Stage a page (copying its current image on first touch) and
    /// return the mutable staged copy.
    pub fn get_mut_page(&mut self, page_id: PageId) -> Result<&mut Vec<u8>, SmallError> {
        self.ensure_writable()?;
        if !self.write_set.contains_key(&page_id) {
            let image = self.read_page(page_id)?;
            self.write_set.insert(page_id, image);
            self.write_order.push(page_id);
        }
        Ok(self.write_set.get_mut(&page_id).unwrap())
    }

    fn stage_page_image(&mut self, page_id: PageId, image: Vec<u8>) {
        if !self.write_set.contains_key(&page_id) {
            self.write_order.push(page_id);
        }
        self.write_set.insert(page_id, image);
    }

    pub(crate) fn read_meta(&self) -> Result<MetaPage, SmallError> {
        let image = self.read_page(0)?;
        MetaPage::read_from_page(&image)
    }

    pub(crate) fn stage_meta(&mut self, meta: &MetaPage) -> SmallResult {
        self.ensure_writable()?;
        let mut image = match self.write_set.get(&0) {
            Some(image) => image.clone(),
            None => self.read_page(0)?,
        };
        meta.write_to_page(&mut image);
        self.stage_page_image(0, image);
        Ok(())
    }

    /// Pop the free-list head, or extend the file past the watermark.
    /// Both paths mutate the staged meta page, so the allocation
    /// becomes durable (or disappears) together with this transaction.
    pub fn allocate_page(&mut self, category: PageCategory) -> Result<PageId, SmallError> {
        self.ensure_writable()?;
        let mut meta = self.read_meta()?;

        let page_id;
        if meta.free_list_head != 0 {
            page_id = meta.free_list_head;
            let head_image = self.read_page(page_id)?;
            let header = PageHeader::read_from_page(&head_image)?;
            meta.free_list_head = header.next_page_id;
        } else {
            page_id = meta.page_watermark;
            meta.page_watermark += 1;
            self.ctx.page_file.wl().ensure_capacity(page_id + 1)?;
        }
        self.stage_meta(&meta)?;

        let mut image = vec![0u8; self.page_size];
        PageHeader::new(page_id, category).write_to_page(&mut image);
        self.stage_page_image(page_id, image);

        debug!("{} allocated page {} ({})", self, page_id, category);
        Ok(page_id)
    }

    /// Push a page onto the free-list chain. The body is zeroed so
    /// stale payload bytes do not survive into the next allocation.
    pub fn free_page(&mut self, page_id: PageId) -> SmallResult {
        self.ensure_writable()?;
        let mut meta = self.read_meta()?;

        {
            let image = self.get_mut_page(page_id)?;
            let mut header = PageHeader::read_from_page(image)?;
            header.category = PageCategory::FreeList;
            header.next_page_id = meta.free_list_head;
            header.free_bytes = 0;
            for byte in image[PAGE_HEADER_SIZE..].iter_mut() {
                *byte = 0;
            }
            header.write_to_page(image);
        }

        meta.free_list_head = page_id;
        self.stage_meta(&meta)?;
        debug!("{} freed page {}", self, page_id);
        Ok(())
    }

    pub(crate) fn collection_meta(
        &self,
        name: &str,
    ) -> Option<crate::document::catalog::CollectionMeta> {
        if let Some(patch) = &self.catalog_patch {
            return patch.get(name).cloned();
        }
        self.ctx.catalog.rl().get(name).cloned()
    }

    /// Clone-on-write access to the catalog. The patch replaces the
    /// shared catalog when this transaction commits.
    pub(crate) fn catalog_mut(&mut self) -> &mut Catalog {
        if self.catalog_patch.is_none() {
            self.catalog_patch = Some(self.ctx.catalog.rl().clone());
        }
        self.catalog_patch.as_mut().unwrap()
    }

    pub(crate) fn push_event(&mut self, event: ChangeEvent) {
        self.events.push(event);
    }

    pub(crate) fn payload_wanted(&self, collection: &str) -> bool {
        self.ctx.dispatcher.payload_wanted(collection)
    }

    /// Make every staged page durable and visible.
    ///
    /// The only synchronous I/O is the WAL append plus one fsync;
    /// application to the page file is the checkpoint's job.
    pub fn commit(&mut self) -> SmallResult {
        if self.status != TransactionStatus::Active {
            return Err(SmallError::new(
                ErrorKind::Internal,
                &format!("commit on finished {}", self),
            ));
        }

        // a pure reader has nothing to log
        if self.write_set.is_empty() {
            self.ctx.tx_manager.finish_read_only(self.id);
            self.release_latch();
            self.status = TransactionStatus::Committed;
            return Ok(());
        }

        // step 1: data records for every staged image, in first-touch
        // order, then the commit record, then the one fsync
        let ctx = Arc::clone(&self.ctx);
        let lsn;
        {
            let mut log = ctx.log_manager.wl();
            lsn = match self.append_to_wal(&mut log) {
                Ok(lsn) => lsn,
                Err(e) => return Err(self.ctx.note_error(e)),
            };
        }

        // step 2: publish the committed images so readers see them
        // before the checkpoint reaches the page file
        {
            let mut cache = self.ctx.page_cache.wl();
            cache.publish(
                lsn,
                self.write_set
                    .iter()
                    .map(|(page_id, image)| (*page_id, Bytes::from(image.clone()))),
            );
        }

        // step 3: install catalog changes for future transactions
        if let Some(patch) = self.catalog_patch.take() {
            *self.ctx.catalog.wl() = patch;
        }

        self.ctx.tx_manager.finish_commit(self.id, lsn);

        // step 4: hand events to the dispatcher while still holding
        // the writer latch, so batches enter the fan-out queue in
        // commit order; the actual subscriber work happens elsewhere
        if !self.events.is_empty() {
            let mut events = std::mem::take(&mut self.events);
            for event in &mut events {
                event.lsn = lsn;
            }
            self.ctx.dispatcher.publish(events);
        }

        self.release_latch();
        self.status = TransactionStatus::Committed;
        self.write_set.clear();
        self.write_order.clear();

        debug!("{} committed at lsn {}", self, lsn);
        Ok(())
    }

    /// Seal every staged image, write its data record, then the
    /// commit record, then the one fsync.
    fn append_to_wal(
        &mut self,
        log: &mut crate::tx_log::LogManager,
    ) -> Result<Lsn, SmallError> {
        for page_id in &self.write_order {
            let image = self.write_set.get_mut(page_id).unwrap();
            if *page_id != 0 {
                page::seal_page(image, self.id)?;
            }
            log.append_data(self.id, *page_id, image)?;
        }
        let lsn = log.append_commit(self.id)?;
        log.flush_to_durable()?;
        Ok(lsn)
    }

    /// Throw away the write set. The abort record is advisory (a
    /// missing commit already means "discard" to recovery), so there
    /// is no fsync here.
    pub fn abort(&mut self) -> SmallResult {
        if self.status != TransactionStatus::Active {
            return Err(SmallError::new(
                ErrorKind::Internal,
                &format!("abort on finished {}", self),
            ));
        }

        if !self.write_set.is_empty() {
            let mut log = self.ctx.log_manager.wl();
            log.append_abort(self.id)?;
        }

        self.write_set.clear();
        self.write_order.clear();
        self.catalog_patch = None;
        self.events.clear();

        self.ctx.tx_manager.finish_abort(self.id);
        self.release_latch();
        self.status = TransactionStatus::Aborted;

        debug!("{} aborted", self);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status == TransactionStatus::Active {
            debug!("{} dropped while active, aborting", self);
            let _ = self.abort();
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
