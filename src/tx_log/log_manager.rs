use std::{
    convert::TryInto,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use log::debug;

use crate::{
    error::SmallError,
    io::{Decodeable, SmallFile, SmallWriter},
    types::{Lsn, PageId, SmallResult, TxnId},
};

/// Record framing: `kind (1) | length (u32 LE) | body | crc32 (u32 LE)`.
/// The crc covers kind, length and body, so a torn tail is detectable
/// no matter where the tear lands.
const FRAME_OVERHEAD: usize = 1 + 4 + 4;

const KIND_DATA: u8 = 1;
const KIND_COMMIT: u8 = 2;
const KIND_ABORT: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// Full after-image of one page.
    Data {
        txn_id: TxnId,
        page_id: PageId,
        image: Bytes,
    },
    /// The durable presence of a commit record is what makes the
    /// preceding data records of the same transaction visible.
    Commit {
        txn_id: TxnId,
        lsn: Lsn,
        unix_millis: i64,
    },
    Abort { txn_id: TxnId },
}

pub struct LogManager {
    file: SmallFile,
    path: PathBuf,

    /// LSN the next commit record will carry.
    next_lsn: Lsn,

    /// Byte offset of the first record the runtime checkpoint has not
    /// applied yet. Reset to 0 whenever the file is truncated.
    applied_offset: u64,
}

impl LogManager {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SmallError> {
        let path = path.as_ref().to_path_buf();
        let file = SmallFile::open(&path)?;
        Ok(Self {
            file,
            path,
            next_lsn: 1,
            applied_offset: 0,
        })
    }

    /// Called once by recovery after it learned the highest LSN ever
    /// issued (from the meta page and the WAL itself).
    pub fn set_next_lsn(&mut self, next_lsn: Lsn) {
        self.next_lsn = next_lsn;
    }

    pub fn last_lsn(&self) -> Lsn {
        self.next_lsn - 1
    }

    pub fn current_size(&self) -> u64 {
        self.file.size()
    }

    pub fn applied_offset(&self) -> u64 {
        self.applied_offset
    }

    pub fn set_applied_offset(&mut self, offset: u64) {
        self.applied_offset = offset;
    }

    fn append_record(&mut self, kind: u8, body: &[u8]) -> SmallResult {
        let mut frame = Vec::with_capacity(FRAME_OVERHEAD + body.len());
        frame.push(kind);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&frame);
        frame.extend_from_slice(&hasher.finalize().to_le_bytes());

        self.file.append(&frame)
    }

    pub fn append_data(&mut self, txn_id: TxnId, page_id: PageId, image: &[u8]) -> SmallResult {
        let mut writer = SmallWriter::new();
        writer.write(&txn_id);
        writer.write(&page_id);
        writer.write_bytes(image);
        self.append_record(KIND_DATA, &writer.to_bytes())
    }

    /// Append the commit record and hand out its LSN. The record is not
    /// durable until `flush_to_durable` returns.
    pub fn append_commit(&mut self, txn_id: TxnId) -> Result<Lsn, SmallError> {
        let lsn = self.next_lsn;
        self.next_lsn += 1;

        let unix_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let mut writer = SmallWriter::new();
        writer.write(&txn_id);
        writer.write(&lsn);
        writer.write(&unix_millis);
        self.append_record(KIND_COMMIT, &writer.to_bytes())?;

        debug!("wal commit record: txn {}, lsn {}", txn_id, lsn);
        Ok(lsn)
    }

    pub fn append_abort(&mut self, txn_id: TxnId) -> SmallResult {
        let mut writer = SmallWriter::new();
        writer.write(&txn_id);
        self.append_record(KIND_ABORT, &writer.to_bytes())
    }

    /// The single disk barrier of a commit: push the user-space buffer
    /// to the OS and fsync.
    pub fn flush_to_durable(&mut self) -> SmallResult {
        self.file.flush_to_durable()
    }

    pub fn scan(&mut self, from_offset: u64) -> LogScanner<'_> {
        LogScanner {
            log: self,
            offset: from_offset,
        }
    }

    /// Drop every record. Only legal once everything at or below `lsn`
    /// has been durably applied to the page file and no higher LSN has
    /// been issued, which the single-writer checkpoint guarantees by
    /// holding the log lock across apply + truncate.
    pub fn truncate_up_to(&mut self, lsn: Lsn) -> SmallResult {
        debug_assert!(lsn == self.last_lsn());
        self.file.set_len(0)?;
        self.applied_offset = 0;
        debug!("wal truncated at lsn {}", lsn);
        Ok(())
    }

    /// Truncate and sync, leaving a fresh log file behind.
    pub fn restart(&mut self, lsn: Lsn) -> SmallResult {
        self.truncate_up_to(lsn)?;
        self.file.sync_all()?;
        debug!("wal restarted as {:?}", self.path);
        Ok(())
    }
}

/// Sequential reader over WAL records.
///
/// Stops at the first frame whose CRC fails or that runs past the end
/// of the file (a torn tail from a crash mid-append); `good_offset`
/// then marks the end of the trustworthy prefix.
pub struct LogScanner<'a> {
    log: &'a mut LogManager,
    offset: u64,
}

impl<'a> LogScanner<'a> {
    pub fn good_offset(&self) -> u64 {
        self.offset
    }

    pub fn next_record(&mut self) -> Option<LogRecord> {
        let size = self.log.file.size();
        if self.offset + (FRAME_OVERHEAD as u64) > size {
            return None;
        }

        let mut head = [0u8; 5];
        if self.log.file.read_at(self.offset, &mut head).ok()? != 5 {
            return None;
        }
        let kind = head[0];
        let body_len = u32::from_le_bytes(head[1..5].try_into().unwrap()) as usize;

        let frame_len = FRAME_OVERHEAD as u64 + body_len as u64;
        if self.offset + frame_len > size {
            // torn tail
            return None;
        }

        let mut rest = vec![0u8; body_len + 4];
        if self.log.file.read_at(self.offset + 5, &mut rest).ok()? != rest.len() {
            return None;
        }
        let (body, crc_bytes) = rest.split_at(body_len);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head);
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            debug!("wal crc mismatch at offset {}, stopping scan", self.offset);
            return None;
        }

        let record = match kind {
            KIND_DATA => {
                let mut reader = std::io::Cursor::new(body);
                let txn_id = u64::decode_from(&mut reader);
                let page_id = u64::decode_from(&mut reader);
                let image = Bytes::copy_from_slice(&body[16..]);
                LogRecord::Data {
                    txn_id,
                    page_id,
                    image,
                }
            }
            KIND_COMMIT => {
                let mut reader = std::io::Cursor::new(body);
                LogRecord::Commit {
                    txn_id: u64::decode_from(&mut reader),
                    lsn: u64::decode_from(&mut reader),
                    unix_millis: i64::decode_from(&mut reader),
                }
            }
            KIND_ABORT => {
                let mut reader = std::io::Cursor::new(body);
                LogRecord::Abort {
                    txn_id: u64::decode_from(&mut reader),
                }
            }
            _ => {
                debug!("unknown wal record kind {} at {}", kind, self.offset);
                return None;
            }
        };

        self.offset += frame_len;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log(dir: &tempfile::TempDir) -> LogManager {
        LogManager::open(dir.path().join("test.wal")).unwrap()
    }

    #[test]
    fn test_append_scan_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir);

        log.append_data(7, 3, &[0xaa; 64]).unwrap();
        log.append_data(7, 4, &[0xbb; 64]).unwrap();
        let lsn = log.append_commit(7).unwrap();
        log.append_abort(8).unwrap();
        log.flush_to_durable().unwrap();

        let mut scanner = log.scan(0);
        match scanner.next_record().unwrap() {
            LogRecord::Data {
                txn_id,
                page_id,
                image,
            } => {
                assert_eq!(txn_id, 7);
                assert_eq!(page_id, 3);
                assert_eq!(&image[..], &[0xaa; 64]);
            }
            other => panic!("unexpected record: {:?}", other),
        }
        scanner.next_record().unwrap();
        match scanner.next_record().unwrap() {
            LogRecord::Commit {
                txn_id, lsn: got, ..
            } => {
                assert_eq!(txn_id, 7);
                assert_eq!(got, lsn);
            }
            other => panic!("unexpected record: {:?}", other),
        }
        match scanner.next_record().unwrap() {
            LogRecord::Abort { txn_id } => assert_eq!(txn_id, 8),
            other => panic!("unexpected record: {:?}", other),
        }
        assert!(scanner.next_record().is_none());
    }

    #[test]
    fn test_torn_tail_stops_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut log = LogManager::open(&path).unwrap();
            log.append_data(1, 10, &[1u8; 32]).unwrap();
            log.append_commit(1).unwrap();
            log.append_data(2, 11, &[2u8; 32]).unwrap();
            log.flush_to_durable().unwrap();
        }

        // chop the last record in half
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 20).unwrap();
        drop(file);

        let mut log = LogManager::open(&path).unwrap();
        let mut scanner = log.scan(0);
        assert!(matches!(
            scanner.next_record().unwrap(),
            LogRecord::Data { txn_id: 1, .. }
        ));
        assert!(matches!(
            scanner.next_record().unwrap(),
            LogRecord::Commit { txn_id: 1, .. }
        ));
        assert!(scanner.next_record().is_none());

        let good = scanner.good_offset();
        assert!(good < len - 20);
    }

    #[test]
    fn test_corrupted_record_stops_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let first_end;
        {
            let mut log = LogManager::open(&path).unwrap();
            log.append_data(1, 10, &[1u8; 32]).unwrap();
            log.flush_to_durable().unwrap();
            first_end = log.current_size();
            log.append_data(1, 11, &[2u8; 32]).unwrap();
            log.append_commit(1).unwrap();
            log.flush_to_durable().unwrap();
        }

        // flip one byte inside the second record's body
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(first_end + 10)).unwrap();
        file.write_all(&[0xff]).unwrap();
        drop(file);

        let mut log = LogManager::open(&path).unwrap();
        let mut scanner = log.scan(0);
        assert!(scanner.next_record().is_some());
        assert!(scanner.next_record().is_none());
        assert_eq!(scanner.good_offset(), first_end);
    }

    #[test]
    fn test_lsn_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir);
        let a = log.append_commit(1).unwrap();
        let b = log.append_commit(2).unwrap();
        let c = log.append_commit(3).unwrap();
        assert!(a < b && b < c);
        assert_eq!(log.last_lsn(), c);
    }
}
