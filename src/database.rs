use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

use log::{error, info, warn};

use crate::{
    config::{AccessMode, DbConfig},
    document::{
        catalog::{load_catalog, persist_catalog, Catalog},
        collection::Collection,
        doc_id::IdKind,
    },
    error::{ErrorKind, SmallError},
    storage::{page::MetaPage, PageCache, PageFile},
    stream::Dispatcher,
    transaction::{Transaction, TransactionManager},
    tx_log::{
        checkpoint::{run_checkpoint, CheckpointContext, Checkpointer},
        recovery, CheckpointMode, LogManager,
    },
    types::{Lsn, PageId, Pod, SmallResult},
    utils::HandyRwLock,
};

/// Shared state of one engine instance. Everything a transaction, a
/// collection handle or the checkpointer needs hangs off this.
pub(crate) struct DbContext {
    pub config: DbConfig,
    pub page_file: Pod<PageFile>,
    pub log_manager: Pod<LogManager>,
    pub page_cache: Pod<PageCache>,
    pub catalog: Pod<Catalog>,
    pub tx_manager: TransactionManager,
    pub dispatcher: Dispatcher,

    /// Set after a corruption/io/capacity error; every later mutation
    /// is refused while reads keep working.
    pub demoted: Arc<AtomicBool>,
}

impl DbContext {
    /// Demote the engine when an error is fatal. Returns the error for
    /// `map_err`-style chaining.
    pub fn note_error(&self, e: SmallError) -> SmallError {
        if e.is_fatal() && !self.demoted.swap(true, Ordering::SeqCst) {
            error!("engine demoted to read-only: {}", e);
        }
        e
    }

    pub fn read_committed_page(&self, page_id: PageId) -> Result<Vec<u8>, SmallError> {
        if let Some(image) = self.page_cache.rl().get(page_id) {
            return Ok(image.to_vec());
        }
        let file = self.page_file.rl();
        let mut buf = vec![0u8; file.page_size()];
        file.read_page(page_id, &mut buf)?;
        Ok(buf)
    }

    fn read_committed_meta(&self) -> Result<MetaPage, SmallError> {
        let image = self.read_committed_page(0)?;
        MetaPage::read_from_page(&image)
    }
}

/// An embedded document database over two files: `<name>.db` (pages)
/// and `<name>.wal` (log).
///
/// Each instance owns its files for the lifetime of the process (an
/// exclusive lock in read-write mode, shared for read-only), recovers
/// the WAL on open, and runs its own checkpointer and change-stream
/// dispatcher. Instances are independent; there is no process-wide
/// state. Dropping the engine aborts stray transactions, stops the
/// dispatcher, then runs a final truncating checkpoint and flushes
/// the page file.
pub struct Database {
    ctx: Arc<DbContext>,
    checkpointer: Mutex<Option<Checkpointer>>,
    db_path: PathBuf,
    disposed: AtomicBool,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Database, SmallError> {
        Self::open_with(path, DbConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, config: DbConfig) -> Result<Database, SmallError> {
        let db_path = path.as_ref().with_extension("db");
        let wal_path = path.as_ref().with_extension("wal");

        let mut page_file = PageFile::open(&db_path, &config)?;
        let mut log_manager = LogManager::open(&wal_path)?;
        let mut page_cache = PageCache::new();

        // redo the WAL before anything reads the file
        let report = if config.access == AccessMode::ReadWrite {
            recovery::recover(&mut page_file, &mut log_manager)?
        } else {
            recovery::recover_read_only(&page_file, &mut log_manager, &mut page_cache)?
        };

        let tx_manager = TransactionManager::new();
        tx_manager.bootstrap(report.max_lsn);
        log_manager.set_next_lsn(report.max_lsn + 1);

        let ctx = Arc::new(DbContext {
            config,
            page_file: Arc::new(RwLock::new(page_file)),
            log_manager: Arc::new(RwLock::new(log_manager)),
            page_cache: Arc::new(RwLock::new(page_cache)),
            catalog: Arc::new(RwLock::new(Catalog::new())),
            tx_manager,
            dispatcher: Dispatcher::new(),
            demoted: Arc::new(AtomicBool::new(false)),
        });

        // the catalog chain is readable only now, overlay included
        let meta = ctx.read_committed_meta()?;
        let catalog = load_catalog(|pid| ctx.read_committed_page(pid), meta.catalog_root)?;
        *ctx.catalog.wl() = catalog;

        let checkpointer = if config.access == AccessMode::ReadWrite {
            Some(Checkpointer::spawn(
                CheckpointContext {
                    page_file: Arc::clone(&ctx.page_file),
                    log_manager: Arc::clone(&ctx.log_manager),
                    page_cache: Arc::clone(&ctx.page_cache),
                    demoted: Arc::clone(&ctx.demoted),
                },
                config.auto_checkpoint_interval,
                config.auto_checkpoint_threshold,
            ))
        } else {
            None
        };

        info!(
            "database open: {:?} ({:?}, {} collection(s), lsn {})",
            db_path,
            config.access,
            ctx.catalog.rl().len(),
            report.max_lsn
        );

        Ok(Database {
            ctx,
            checkpointer: Mutex::new(checkpointer),
            db_path,
            disposed: AtomicBool::new(false),
        })
    }

    /// Open a transaction. Reads are served immediately; the first
    /// mutation takes the single writer latch.
    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.ctx))
    }

    /// Handle onto a collection. The collection itself materializes in
    /// the catalog at its first insert.
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(name, Arc::clone(&self.ctx))
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.ctx.catalog.rl().names()
    }

    /// Collection name to id kind, for tooling that needs to decode
    /// stored ids.
    pub fn id_kinds(&self) -> Vec<(String, IdKind)> {
        let catalog = self.ctx.catalog.rl();
        catalog
            .names()
            .into_iter()
            .filter_map(|name| catalog.get(&name).map(|meta| (name.clone(), meta.id_kind)))
            .collect()
    }

    /// Create a collection with an explicit id kind instead of the
    /// object-id default.
    pub fn create_collection(
        &self,
        tx: &mut Transaction,
        name: &str,
        id_kind: IdKind,
    ) -> Result<Collection, SmallError> {
        if tx.collection_meta(name).is_some() {
            return Err(SmallError::new(
                ErrorKind::DuplicateKey,
                &format!("collection {} already exists", name),
            ));
        }
        let collection = Collection::new(name, Arc::clone(&self.ctx));
        collection.create_with_kind(tx, id_kind)?;
        Ok(collection)
    }

    pub fn drop_collection(&self, tx: &mut Transaction, name: &str) -> Result<bool, SmallError> {
        Collection::new(name, Arc::clone(&self.ctx)).drop_all(tx)
    }

    pub fn rename_collection(
        &self,
        tx: &mut Transaction,
        old: &str,
        new: &str,
    ) -> Result<bool, SmallError> {
        if tx.collection_meta(old).is_none() {
            return Ok(false);
        }
        if !tx.catalog_mut().rename(old, new) {
            return Err(SmallError::new(
                ErrorKind::DuplicateKey,
                &format!("collection {} already exists", new),
            ));
        }
        persist_catalog(tx)?;
        Ok(true)
    }

    /// Run a checkpoint on the background thread and wait for it.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<Lsn, SmallError> {
        if self.ctx.config.access == AccessMode::Read {
            return Err(SmallError::new(
                ErrorKind::ReadOnly,
                "checkpoint on a read-only engine",
            ));
        }
        let guard = self.checkpointer.lock().unwrap();
        match guard.as_ref() {
            Some(checkpointer) => checkpointer.request(mode),
            None => Err(SmallError::new(ErrorKind::Internal, "engine is disposed")),
        }
    }

    pub fn checkpoint_and_truncate(&self) -> Result<Lsn, SmallError> {
        self.checkpoint(CheckpointMode::Truncate)
    }

    pub fn committed_lsn(&self) -> Lsn {
        self.ctx.tx_manager.committed_lsn()
    }

    pub fn wal_size(&self) -> u64 {
        self.ctx.log_manager.rl().current_size()
    }

    pub fn page_size(&self) -> usize {
        self.ctx.page_file.rl().page_size()
    }

    /// Length of the free-list chain, from the committed meta page.
    pub fn free_page_count(&self) -> Result<u64, SmallError> {
        use crate::storage::page::PageHeader;
        let meta = self.ctx.read_committed_meta()?;
        let mut count = 0;
        let mut page_id = meta.free_list_head;
        while page_id != 0 {
            let image = self.ctx.read_committed_page(page_id)?;
            count += 1;
            page_id = PageHeader::read_from_page(&image)?.next_page_id;
        }
        Ok(count)
    }

    pub fn is_demoted(&self) -> bool {
        self.ctx.demoted.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Stop the dispatcher and checkpointer, run a final truncating
    /// checkpoint, flush and release the files. Also runs on drop;
    /// calling it twice is harmless.
    pub fn dispose(&self) -> SmallResult {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.ctx.dispatcher.shutdown();
        if let Some(mut checkpointer) = self.checkpointer.lock().unwrap().take() {
            checkpointer.stop();
        }

        if self.ctx.config.access == AccessMode::ReadWrite && !self.is_demoted() {
            let context = CheckpointContext {
                page_file: Arc::clone(&self.ctx.page_file),
                log_manager: Arc::clone(&self.ctx.log_manager),
                page_cache: Arc::clone(&self.ctx.page_cache),
                demoted: Arc::clone(&self.ctx.demoted),
            };
            if let Err(e) = run_checkpoint(&context, CheckpointMode::Truncate) {
                warn!("final checkpoint failed: {}", e);
            }
        }

        self.ctx.page_file.rl().flush()?;
        info!("database closed: {:?}", self.db_path);
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("error while closing {:?}: {}", self.db_path, e);
        }
    }
}
