mod test_utils;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use small_doc::{AccessMode, Database, DbConfig, DocId, ErrorKind};
use test_utils::{count_of, find_person, insert_people, int_collection, person, scratch_db, setup};

/// A transaction reads its own staged writes; nobody else sees them
/// until commit.
#[test]
fn test_read_your_writes_and_isolation_from_readers() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    let mut writer = db.begin_transaction();
    db.collection("people")
        .insert(&mut writer, Some(DocId::Int64(1)), &person("w", 1))
        .unwrap();

    assert!(db
        .collection("people")
        .find_by_id(&writer, &DocId::Int64(1))
        .unwrap()
        .is_some());

    // a concurrent reader sees nothing of the staged insert
    let reader = db.begin_transaction();
    assert!(db
        .collection("people")
        .find_by_id(&reader, &DocId::Int64(1))
        .unwrap()
        .is_none());
    drop(reader);

    writer.commit().unwrap();

    // a transaction begun after the commit sees it
    let reader = db.begin_transaction();
    assert!(db
        .collection("people")
        .find_by_id(&reader, &DocId::Int64(1))
        .unwrap()
        .is_some());
}

/// Dropping an active transaction aborts it.
#[test]
fn test_drop_aborts() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    {
        let mut tx = db.begin_transaction();
        db.collection("people")
            .insert(&mut tx, Some(DocId::Int64(1)), &person("leak", 1))
            .unwrap();
        // no commit
    }

    assert_eq!(count_of(&db, "people"), 0);

    // the writer latch was released by the drop: new writes proceed
    let mut tx = db.begin_transaction();
    db.collection("people")
        .insert(&mut tx, Some(DocId::Int64(1)), &person("ok", 1))
        .unwrap();
    tx.commit().unwrap();
    assert_eq!(count_of(&db, "people"), 1);
}

/// Writers queue on the single writer latch; both commits land.
#[test]
fn test_two_writers_serialize() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Arc::new(Database::open(&base).unwrap());
    int_collection(&db, "people");

    let db2 = Arc::clone(&db);
    let started = Arc::new(AtomicBool::new(false));
    let started2 = Arc::clone(&started);

    let handle = std::thread::spawn(move || {
        started2.store(true, Ordering::SeqCst);
        let mut tx = db2.begin_transaction();
        db2.collection("people")
            .insert(&mut tx, Some(DocId::Int64(2)), &person("two", 2))
            .unwrap();
        tx.commit().unwrap();
    });

    let mut tx = db.begin_transaction();
    db.collection("people")
        .insert(&mut tx, Some(DocId::Int64(1)), &person("one", 1))
        .unwrap();
    while !started.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    tx.commit().unwrap();

    handle.join().unwrap();
    assert_eq!(count_of(&db, "people"), 2);
    assert!(find_person(&db, "people", 1).is_some());
    assert!(find_person(&db, "people", 2).is_some());
}

/// Readers run while a writer holds the latch.
#[test]
fn test_readers_do_not_block_on_writer() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");
    insert_people(&db, "people", 5);

    let mut writer = db.begin_transaction();
    db.collection("people")
        .insert(&mut writer, Some(DocId::Int64(99)), &person("staged", 99))
        .unwrap();

    // with the writer latch held, reads still complete
    let reader = db.begin_transaction();
    assert_eq!(db.collection("people").count(&reader), 5);
    assert!(db
        .collection("people")
        .find_by_id(&reader, &DocId::Int64(3))
        .unwrap()
        .is_some());
    drop(reader);

    writer.commit().unwrap();
}

/// Committing or aborting twice is an error; the first outcome wins.
#[test]
fn test_terminal_states_are_final() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    let mut tx = db.begin_transaction();
    db.collection("people")
        .insert(&mut tx, Some(DocId::Int64(1)), &person("x", 1))
        .unwrap();
    tx.commit().unwrap();
    assert!(tx.commit().is_err());
    assert!(tx.abort().is_err());

    assert_eq!(count_of(&db, "people"), 1);
}

/// A read-only engine serves reads and refuses mutations.
#[test]
fn test_read_only_mode() {
    setup();
    let (_dir, base) = scratch_db();

    {
        let db = Database::open(&base).unwrap();
        int_collection(&db, "people");
        insert_people(&db, "people", 8);
        db.dispose().unwrap();
    }

    let mut config = DbConfig::default();
    config.access = AccessMode::Read;
    let db = Database::open_with(&base, config).unwrap();

    assert_eq!(count_of(&db, "people"), 8);
    assert!(find_person(&db, "people", 4).is_some());

    let mut tx = db.begin_transaction();
    let err = db
        .collection("people")
        .insert(&mut tx, Some(DocId::Int64(9)), &person("no", 9))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadOnly);

    assert!(db.checkpoint_and_truncate().is_err());
}

/// Several engines over different files are fully independent.
#[test]
fn test_independent_engines() {
    setup();
    let (_dir_a, base_a) = scratch_db();
    let (_dir_b, base_b) = scratch_db();

    let a = Database::open(&base_a).unwrap();
    let b = Database::open(&base_b).unwrap();
    int_collection(&a, "people");
    int_collection(&b, "people");

    insert_people(&a, "people", 3);
    insert_people(&b, "people", 5);

    assert_eq!(count_of(&a, "people"), 3);
    assert_eq!(count_of(&b, "people"), 5);
}
