use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};

use crate::{
    error::SmallError,
    storage::{PageCache, PageFile},
    tx_log::log_manager::{LogManager, LogRecord},
    types::{Lsn, PageId, Pod, TxnId},
    utils::HandyRwLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Best effort: give up immediately when a committer holds the log.
    Passive,
    /// Apply everything through the current end of the WAL and flush
    /// the page file.
    Full,
    /// Full, then truncate the WAL.
    Truncate,
    /// Truncate, then reset the WAL to a fresh, synced file.
    Restart,
}

/// Shared handles the checkpoint works on. The checkpointer thread and
/// the explicit `Database::checkpoint` call both go through
/// `run_checkpoint` with one of these.
pub(crate) struct CheckpointContext {
    pub page_file: Pod<PageFile>,
    pub log_manager: Pod<LogManager>,
    pub page_cache: Pod<PageCache>,
    pub demoted: Arc<AtomicBool>,
}

/// Apply the durable WAL to the page file so the WAL can be truncated.
///
/// Scans from the log's applied offset, gathers data records per
/// transaction, and writes a transaction's images through only once
/// its commit record has been seen; records of transactions with no
/// commit in the scanned range are never applied. `checkpoint_lsn` in
/// the meta page is advanced durably before any truncation, so a crash
/// at any point replays a prefix of already-applied records, which is
/// idempotent.
///
/// Returns the LSN through which the page file is now caught up.
pub(crate) fn run_checkpoint(
    ctx: &CheckpointContext,
    mode: CheckpointMode,
) -> Result<Lsn, SmallError> {
    // Holding the log write lock for the whole pass keeps committers
    // out between apply and truncate; Passive backs off instead of
    // stalling them.
    let mut log = match mode {
        CheckpointMode::Passive => match ctx.log_manager.try_write() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("passive checkpoint skipped: log is busy");
                let meta = ctx.page_file.rl().read_meta()?;
                return Ok(meta.checkpoint_lsn);
            }
        },
        _ => ctx.log_manager.wl(),
    };

    let start = Instant::now();
    let from = log.applied_offset();
    let mut pending: HashMap<TxnId, Vec<(PageId, Bytes)>> = HashMap::new();
    let mut batches: Vec<(Lsn, Vec<(PageId, Bytes)>)> = Vec::new();
    let end_offset;

    {
        let mut scanner = log.scan(from);
        while let Some(record) = scanner.next_record() {
            match record {
                LogRecord::Data {
                    txn_id,
                    page_id,
                    image,
                } => {
                    pending.entry(txn_id).or_insert_with(Vec::new).push((page_id, image));
                }
                LogRecord::Abort { txn_id } => {
                    pending.remove(&txn_id);
                }
                LogRecord::Commit { txn_id, lsn, .. } => {
                    if let Some(images) = pending.remove(&txn_id) {
                        batches.push((lsn, images));
                    }
                }
            }
        }
        end_offset = scanner.good_offset();
    }

    let mut applied_lsn = ctx.page_file.rl().read_meta()?.checkpoint_lsn;

    if !batches.is_empty() {
        let mut page_file = ctx.page_file.wl();
        for (lsn, images) in &batches {
            for (page_id, image) in images {
                page_file.write_page(*page_id, image)?;
            }
            if *lsn > applied_lsn {
                applied_lsn = *lsn;
            }
        }
        page_file.flush()?;

        // stamp the advance after the images are durable; a staged
        // copy of page 0 in the batch would carry a stale lsn
        let mut meta = page_file.read_meta()?;
        meta.checkpoint_lsn = applied_lsn;
        page_file.write_meta(&meta)?;
        page_file.flush()?;

        ctx.page_cache.wl().evict_up_to(applied_lsn);
    } else if mode == CheckpointMode::Full
        || mode == CheckpointMode::Truncate
        || mode == CheckpointMode::Restart
    {
        ctx.page_file.rl().flush()?;
    }

    log.set_applied_offset(end_offset);

    let last_lsn = log.last_lsn();
    match mode {
        CheckpointMode::Truncate => log.truncate_up_to(last_lsn)?,
        CheckpointMode::Restart => log.restart(last_lsn)?,
        _ => {}
    }

    info!(
        "checkpoint {:?}: {} txns applied through lsn {} in {:?}",
        mode,
        batches.len(),
        applied_lsn,
        start.elapsed()
    );
    Ok(applied_lsn)
}

enum CheckpointRequest {
    Run(CheckpointMode, Sender<Result<Lsn, SmallError>>),
    Stop,
}

/// Background checkpointer: wakes up on a timer (the configured
/// interval) or when the WAL passes the size threshold, and runs a
/// truncating checkpoint. Explicit requests are forwarded through the
/// control channel.
pub(crate) struct Checkpointer {
    ctrl: Sender<CheckpointRequest>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    pub fn spawn(ctx: CheckpointContext, interval: Duration, threshold: u64) -> Self {
        let (ctrl, requests) = unbounded();
        let handle = std::thread::Builder::new()
            .name("small-doc-checkpoint".to_string())
            .spawn(move || Self::run_loop(ctx, requests, interval, threshold))
            .expect("failed to spawn checkpoint thread");

        Self {
            ctrl,
            handle: Some(handle),
        }
    }

    fn run_loop(
        ctx: CheckpointContext,
        requests: Receiver<CheckpointRequest>,
        interval: Duration,
        threshold: u64,
    ) {
        let tick = Duration::from_millis(500).min(interval);
        let mut last_auto = Instant::now();

        loop {
            match requests.recv_timeout(tick) {
                Ok(CheckpointRequest::Run(mode, reply)) => {
                    let result = run_checkpoint(&ctx, mode);
                    if let Err(e) = &result {
                        if e.is_fatal() {
                            ctx.demoted.store(true, Ordering::SeqCst);
                        }
                        error!("checkpoint failed: {}", e);
                    }
                    let _ = reply.send(result);
                    last_auto = Instant::now();
                }
                Ok(CheckpointRequest::Stop) => break,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.demoted.load(Ordering::SeqCst) {
                        continue;
                    }
                    let wal_size = ctx.log_manager.rl().current_size();
                    let due = last_auto.elapsed() >= interval || wal_size >= threshold;
                    if !due {
                        continue;
                    }
                    let mode = if wal_size >= threshold {
                        CheckpointMode::Truncate
                    } else {
                        CheckpointMode::Passive
                    };
                    match run_checkpoint(&ctx, mode) {
                        Ok(lsn) => debug!("auto checkpoint caught up to lsn {}", lsn),
                        Err(e) => {
                            if e.is_fatal() {
                                ctx.demoted.store(true, Ordering::SeqCst);
                            }
                            error!("auto checkpoint failed: {}", e);
                        }
                    }
                    last_auto = Instant::now();
                }
            }
        }
        debug!("checkpoint thread stopped");
    }

    /// Run a checkpoint on the background thread and wait for it.
    pub fn request(&self, mode: CheckpointMode) -> Result<Lsn, SmallError> {
        let (reply, response) = bounded(1);
        self.ctrl
            .send(CheckpointRequest::Run(mode, reply))
            .map_err(|_| SmallError::io("checkpoint thread is gone"))?;
        response
            .recv()
            .map_err(|_| SmallError::io("checkpoint thread dropped the request"))?
    }

    pub fn stop(&mut self) {
        let _ = self.ctrl.send(CheckpointRequest::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop();
    }
}
