mod test_utils;

use small_doc::{CheckpointMode, Database};
use test_utils::{count_of, find_person, insert_people, int_collection, scratch_db, setup};

/// After a truncating checkpoint the WAL is empty and the page file
/// alone carries every committed document.
#[test]
fn test_checkpoint_and_truncate_shrinks_wal() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");
    insert_people(&db, "people", 100);

    db.checkpoint_and_truncate().unwrap();
    assert_eq!(db.wal_size(), 0);

    // the data is still all there, straight from the page file
    assert_eq!(count_of(&db, "people"), 100);
    assert!(find_person(&db, "people", 42).is_some());
    db.dispose().unwrap();

    // and survives a reopen with an empty log
    let db = Database::open(&base).unwrap();
    assert_eq!(count_of(&db, "people"), 100);
}

/// The page file is self-sufficient after truncation: deleting the
/// WAL entirely loses nothing.
#[test]
fn test_page_file_alone_recovers_after_truncate() {
    setup();
    let (_dir, base) = scratch_db();

    {
        let db = Database::open(&base).unwrap();
        int_collection(&db, "people");
        insert_people(&db, "people", 60);
        db.checkpoint_and_truncate().unwrap();
        db.dispose().unwrap();
    }

    std::fs::remove_file(base.with_extension("wal")).unwrap();

    let db = Database::open(&base).unwrap();
    assert_eq!(count_of(&db, "people"), 60);
}

/// A full (non-truncating) checkpoint leaves the WAL in place but
/// catches the page file up.
#[test]
fn test_full_checkpoint_keeps_wal() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");
    insert_people(&db, "people", 20);

    let wal_before = db.wal_size();
    assert!(wal_before > 0);

    let lsn = db.checkpoint(CheckpointMode::Full).unwrap();
    assert!(lsn > 0);
    assert_eq!(db.wal_size(), wal_before);
    assert_eq!(count_of(&db, "people"), 20);
}

/// Checkpoints are idempotent: running several in a row converges and
/// changes nothing about the data.
#[test]
fn test_repeated_checkpoints_converge() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");
    insert_people(&db, "people", 30);

    let a = db.checkpoint(CheckpointMode::Full).unwrap();
    let b = db.checkpoint(CheckpointMode::Full).unwrap();
    let c = db.checkpoint(CheckpointMode::Truncate).unwrap();
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(count_of(&db, "people"), 30);
}

/// Writes after a truncating checkpoint land in a fresh WAL and are
/// recovered normally.
#[test]
fn test_writes_after_truncate_recover() {
    setup();
    let (dir, base) = scratch_db();

    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");
    insert_people(&db, "people", 10);
    db.checkpoint_and_truncate().unwrap();
    insert_people_range(&db, 11, 20);

    let crashed = test_utils::crash_snapshot(&base, dir.path());
    drop(db);

    let recovered = Database::open(&crashed).unwrap();
    assert_eq!(count_of(&recovered, "people"), 20);
}

/// The restart mode leaves an empty, usable log behind.
#[test]
fn test_restart_mode() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");
    insert_people(&db, "people", 5);

    db.checkpoint(CheckpointMode::Restart).unwrap();
    assert_eq!(db.wal_size(), 0);

    insert_people_range(&db, 6, 8);
    assert_eq!(count_of(&db, "people"), 8);
}

fn insert_people_range(db: &Database, from: i64, to: i64) {
    use small_doc::DocId;
    for i in from..=to {
        let mut tx = db.begin_transaction();
        db.collection("people")
            .insert(
                &mut tx,
                Some(DocId::Int64(i)),
                &test_utils::person(&format!("user_{}", i), i % 50),
            )
            .unwrap();
        tx.commit().unwrap();
    }
}
