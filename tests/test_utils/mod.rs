#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::Once,
};

use small_doc::{
    Cell, Database, DbConfig, DocId, GrowthBlock, IdKind, PageSize, Record, Transaction,
};

static INIT: Once = Once::new();

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    INIT.call_once(|| {
        small_doc::utils::init_log();
    });
}

/// A scratch directory plus the base path of a database inside it.
/// The directory lives as long as the returned guard.
pub fn scratch_db() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("testdb");
    (dir, base)
}

pub fn small_pages_config() -> DbConfig {
    let mut config = DbConfig::default();
    config.page_size = PageSize::Small;
    config.growth_block = GrowthBlock::Small;
    config
}

/// Copy the database files as they are right now. The copy is what a
/// process kill would have left on disk: the WAL exactly as fsynced,
/// the page file in whatever state the checkpoint reached.
pub fn crash_snapshot(base: &Path, to_dir: &Path) -> PathBuf {
    let snapshot = to_dir.join("crashed");
    // the log first: if a checkpoint runs between the two copies, the
    // page file can only be ahead of the copied log, which recovery
    // tolerates (replaying an applied prefix is idempotent)
    let wal = base.with_extension("wal");
    if wal.exists() {
        std::fs::copy(&wal, snapshot.with_extension("wal")).unwrap();
    }
    std::fs::copy(base.with_extension("db"), snapshot.with_extension("db")).unwrap();
    snapshot
}

pub fn person(name: &str, age: i64) -> Record {
    Record::new()
        .set("name", Cell::String(name.to_string()))
        .set("age", Cell::Int64(age))
}

/// Insert `count` int-keyed documents, one committed transaction each.
pub fn insert_people(db: &Database, collection: &str, count: i64) {
    for i in 1..=count {
        let mut tx = db.begin_transaction();
        db.collection(collection)
            .insert(
                &mut tx,
                Some(DocId::Int64(i)),
                &person(&format!("user_{}", i), i % 50),
            )
            .unwrap();
        tx.commit().unwrap();
    }
}

pub fn count_of(db: &Database, collection: &str) -> u64 {
    let tx = db.begin_transaction();
    db.collection(collection).count(&tx)
}

pub fn find_person(db: &Database, collection: &str, id: i64) -> Option<Record> {
    let tx = db.begin_transaction();
    db.collection(collection)
        .find_by_id(&tx, &DocId::Int64(id))
        .unwrap()
}

/// A collection keyed by Int64, created up front.
pub fn int_collection(db: &Database, name: &str) {
    let mut tx = db.begin_transaction();
    db.create_collection(&mut tx, name, IdKind::Int64).unwrap();
    tx.commit().unwrap();
}

pub fn commit(mut tx: Transaction) {
    tx.commit().unwrap();
}
