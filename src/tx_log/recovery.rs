use std::collections::HashMap;

use bytes::Bytes;
use log::{info, warn};

use crate::{
    error::SmallError,
    storage::{PageCache, PageFile},
    tx_log::log_manager::{LogManager, LogRecord},
    types::{Lsn, PageId, TxnId},
};

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub replayed_txns: usize,
    pub replayed_pages: usize,
    pub skipped_txns: usize,
    pub truncated_tail: bool,
    pub max_lsn: Lsn,
}

/// Redo pass over the WAL at open time.
///
/// Data records are buffered per transaction; only a durable commit
/// record releases them for application, in WAL order. An abort record
/// or a missing commit at end of file discards the transaction. A
/// frame that fails its CRC ends the trustworthy prefix: everything
/// after it is a torn tail from the crash and is cut off.
///
/// Transactions whose commit LSN is at or below the meta page's
/// `checkpoint_lsn` were already applied before the crash, so replaying
/// an already-recovered database is a no-op.
pub fn recover(page_file: &mut PageFile, log: &mut LogManager) -> Result<RecoveryReport, SmallError> {
    let meta = page_file.read_meta()?;
    let checkpoint_lsn = meta.checkpoint_lsn;

    let mut report = RecoveryReport::default();
    report.max_lsn = checkpoint_lsn;

    let mut pending: HashMap<TxnId, Vec<(PageId, Bytes)>> = HashMap::new();
    let wal_size = log.current_size();
    let good_offset;

    {
        let mut scanner = log.scan(0);
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
                    let images = pending.remove(&txn_id).unwrap_or_default();
                    if lsn <= checkpoint_lsn {
                        report.skipped_txns += 1;
                        continue;
                    }
                    for (page_id, image) in images {
                        page_file.write_page(page_id, &image)?;
                        report.replayed_pages += 1;
                    }
                    report.replayed_txns += 1;
                    if lsn > report.max_lsn {
                        report.max_lsn = lsn;
                    }
                }
            }
        }
        good_offset = scanner.good_offset();
    }

    if !pending.is_empty() {
        info!(
            "recovery discarded {} uncommitted transaction(s)",
            pending.len()
        );
    }
    if good_offset < wal_size {
        warn!(
            "wal has a torn tail: {} of {} bytes are trustworthy",
            good_offset, wal_size
        );
        report.truncated_tail = true;
    }

    if report.replayed_txns > 0 {
        page_file.flush()?;
        // the replay may have written a stale staged copy of page 0;
        // re-read and stamp the advanced checkpoint lsn last
        let mut meta = page_file.read_meta()?;
        meta.checkpoint_lsn = report.max_lsn;
        page_file.write_meta(&meta)?;
        page_file.flush()?;
    }

    // everything trustworthy is applied; start over with an empty log
    log.set_next_lsn(report.max_lsn + 1);
    log.truncate_up_to(report.max_lsn)?;

    info!(
        "recovery done: {} txns replayed, {} skipped, {} pages, next lsn {}",
        report.replayed_txns,
        report.skipped_txns,
        report.replayed_pages,
        report.max_lsn + 1
    );
    Ok(report)
}

/// Read-only variant: committed images that are newer than the page
/// file are loaded into the committed-page overlay instead of being
/// written back, so several read-only engines can share one database.
pub fn recover_read_only(
    page_file: &PageFile,
    log: &mut LogManager,
    page_cache: &mut PageCache,
) -> Result<RecoveryReport, SmallError> {
    let meta = page_file.read_meta()?;
    let checkpoint_lsn = meta.checkpoint_lsn;

    let mut report = RecoveryReport::default();
    report.max_lsn = checkpoint_lsn;

    let mut pending: HashMap<TxnId, Vec<(PageId, Bytes)>> = HashMap::new();
    let mut scanner = log.scan(0);
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
                let images = pending.remove(&txn_id).unwrap_or_default();
                if lsn <= checkpoint_lsn {
                    report.skipped_txns += 1;
                    continue;
                }
                report.replayed_pages += images.len();
                page_cache.publish(lsn, images.into_iter());
                report.replayed_txns += 1;
                if lsn > report.max_lsn {
                    report.max_lsn = lsn;
                }
            }
        }
    }

    info!(
        "read-only recovery: {} committed txns overlaid ({} pages)",
        report.replayed_txns, report.replayed_pages
    );
    Ok(report)
}
