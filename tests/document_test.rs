mod test_utils;

use small_doc::{Cell, Database, DocId, ErrorKind, IdKind, Record};
use test_utils::{count_of, int_collection, person, scratch_db, setup};

/// Insert, read back, update (in place and with growth), delete.
#[test]
fn test_crud_cycle() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");
    let people = db.collection("people");

    let mut tx = db.begin_transaction();
    let id = people.insert(&mut tx, None, &person("ada", 36)).unwrap();
    assert_eq!(id, DocId::Int64(1), "int collections count from 1");

    // read-your-writes before commit
    let found = people.find_by_id(&tx, &id).unwrap().unwrap();
    assert_eq!(found.get("name"), Some(&Cell::String("ada".to_string())));
    tx.commit().unwrap();

    // shrink: stays in place
    let mut tx = db.begin_transaction();
    assert!(people.update(&mut tx, &id, &person("a", 37)).unwrap());
    // grow well past the old slot: moves, id stays
    let grown = person("ada lovelace, enchantress of number", 37)
        .set("bio", Cell::Bytes(vec![7u8; 2048]));
    assert!(people.update(&mut tx, &id, &grown).unwrap());
    tx.commit().unwrap();

    let tx = db.begin_transaction();
    let found = people.find_by_id(&tx, &id).unwrap().unwrap();
    assert_eq!(found, grown);
    drop(tx);

    let mut tx = db.begin_transaction();
    assert!(people.delete(&mut tx, &id).unwrap());
    assert!(!people.delete(&mut tx, &id).unwrap());
    tx.commit().unwrap();

    assert_eq!(count_of(&db, "people"), 0);
}

/// Inserting an existing id fails and leaves the original intact.
#[test]
fn test_duplicate_id_rejected() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    let mut tx = db.begin_transaction();
    db.collection("people")
        .insert(&mut tx, Some(DocId::Int64(7)), &person("first", 1))
        .unwrap();
    let err = db
        .collection("people")
        .insert(&mut tx, Some(DocId::Int64(7)), &person("second", 2))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateKey);
    tx.commit().unwrap();

    let tx = db.begin_transaction();
    let found = db
        .collection("people")
        .find_by_id(&tx, &DocId::Int64(7))
        .unwrap()
        .unwrap();
    assert_eq!(found.get("name"), Some(&Cell::String("first".to_string())));
}

/// Bulk insert is one transaction; a duplicate id inside the stream
/// surfaces as a conflict.
#[test]
fn test_bulk_insert() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    let mut tx = db.begin_transaction();
    let docs: Vec<_> = (1..=250i64)
        .map(|i| (Some(DocId::Int64(i)), person(&format!("u{}", i), i % 50)))
        .collect();
    let ids = db.collection("people").bulk_insert(&mut tx, docs).unwrap();
    assert_eq!(ids.len(), 250);
    tx.commit().unwrap();
    assert_eq!(count_of(&db, "people"), 250);

    let mut tx = db.begin_transaction();
    let err = db
        .collection("people")
        .bulk_insert(
            &mut tx,
            vec![
                (Some(DocId::Int64(1000)), person("ok", 1)),
                (Some(DocId::Int64(7)), person("dup", 2)),
            ],
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    tx.abort().unwrap();
    assert_eq!(count_of(&db, "people"), 250);
}

/// Generated ids per key kind: object ids are fresh, int ids count
/// up and resume after reopen.
#[test]
fn test_id_generation() {
    setup();
    let (_dir, base) = scratch_db();

    {
        let db = Database::open(&base).unwrap();
        int_collection(&db, "ints");

        let mut tx = db.begin_transaction();
        let a = db.collection("ints").insert(&mut tx, None, &person("a", 1)).unwrap();
        let b = db.collection("ints").insert(&mut tx, None, &person("b", 2)).unwrap();
        assert_eq!((a, b), (DocId::Int64(1), DocId::Int64(2)));

        let oid = db.collection("docs").insert(&mut tx, None, &person("c", 3)).unwrap();
        assert!(matches!(oid, DocId::ObjectId(_)));
        tx.commit().unwrap();
        db.dispose().unwrap();
    }

    let db = Database::open(&base).unwrap();
    let mut tx = db.begin_transaction();
    let next = db.collection("ints").insert(&mut tx, None, &person("d", 4)).unwrap();
    assert_eq!(next, DocId::Int64(3), "int ids must resume after reopen");
    tx.commit().unwrap();
}

/// The scan surfaces every live document exactly once.
#[test]
fn test_scan_matches_inserts() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    let mut tx = db.begin_transaction();
    for i in 1..=40i64 {
        db.collection("people")
            .insert(&mut tx, Some(DocId::Int64(i)), &person(&format!("u{}", i), i))
            .unwrap();
    }
    db.collection("people")
        .delete(&mut tx, &DocId::Int64(13))
        .unwrap();
    tx.commit().unwrap();

    let tx = db.begin_transaction();
    let mut seen: Vec<i64> = db
        .collection("people")
        .scan(&tx)
        .unwrap()
        .map(|item| match item.unwrap().0 {
            DocId::Int64(v) => v,
            other => panic!("bad id {:?}", other),
        })
        .collect();
    seen.sort();

    let expected: Vec<i64> = (1..=40).filter(|i| *i != 13).collect();
    assert_eq!(seen, expected);
}

/// Mismatched id kinds are refused.
#[test]
fn test_id_kind_mismatch() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "ints");

    let mut tx = db.begin_transaction();
    let err = db
        .collection("ints")
        .insert(
            &mut tx,
            Some(DocId::String("nope".to_string())),
            &person("x", 1),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
}

/// Collections can be listed, renamed and dropped.
#[test]
fn test_collection_lifecycle() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "old");
    test_utils::insert_people(&db, "old", 15);

    assert_eq!(db.list_collections(), vec!["old".to_string()]);
    assert_eq!(db.id_kinds(), vec![("old".to_string(), IdKind::Int64)]);

    let mut tx = db.begin_transaction();
    assert!(db.rename_collection(&mut tx, "old", "new").unwrap());
    tx.commit().unwrap();
    assert_eq!(db.list_collections(), vec!["new".to_string()]);
    assert_eq!(count_of(&db, "new"), 15);

    let free_before = db.free_page_count().unwrap();
    let mut tx = db.begin_transaction();
    assert!(db.drop_collection(&mut tx, "new").unwrap());
    tx.commit().unwrap();
    assert!(db.list_collections().is_empty());
    assert!(db.free_page_count().unwrap() > free_before);

    // survives reopen
    db.dispose().unwrap();
    let db = Database::open(&base).unwrap();
    assert!(db.list_collections().is_empty());
}

/// Schema stamps persist and refuse regressions.
#[test]
fn test_schema_version() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    let mut tx = db.begin_transaction();
    db.collection("people").declare_schema(&mut tx, 2, 0xabcd).unwrap();
    tx.commit().unwrap();

    let tx = db.begin_transaction();
    assert_eq!(
        db.collection("people").schema_version(&tx),
        Some((2, 0xabcd))
    );
    drop(tx);

    let mut tx = db.begin_transaction();
    let err = db
        .collection("people")
        .declare_schema(&mut tx, 1, 0xabcd)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    let err = db
        .collection("people")
        .declare_schema(&mut tx, 2, 0xffff)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    db.collection("people").declare_schema(&mut tx, 3, 0x1).unwrap();
}

/// Many small documents spill across several data pages and all stay
/// reachable.
#[test]
fn test_multi_page_collection() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open_with(&base, test_utils::small_pages_config()).unwrap();
    int_collection(&db, "people");

    let mut tx = db.begin_transaction();
    for i in 1..=500i64 {
        let record = Record::new()
            .set("name", Cell::String(format!("user_number_{:05}", i)))
            .set("age", Cell::Int64(i % 50))
            .set("pad", Cell::Bytes(vec![0xab; 100]));
        db.collection("people")
            .insert(&mut tx, Some(DocId::Int64(i)), &record)
            .unwrap();
    }
    tx.commit().unwrap();

    let tx = db.begin_transaction();
    for i in [1i64, 123, 456, 500] {
        assert!(db
            .collection("people")
            .find_by_id(&tx, &DocId::Int64(i))
            .unwrap()
            .is_some());
    }
    assert_eq!(db.collection("people").count(&tx), 500);
}
