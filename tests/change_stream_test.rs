mod test_utils;

use std::time::{Duration, Instant};

use small_doc::{Database, DocId, OpType};
use test_utils::{int_collection, person, scratch_db, setup};

/// Two subscribers, one capturing payloads: both see all ten inserts
/// in commit order, and only the capturing one gets payload bytes.
#[test]
fn test_two_subscribers_see_commit_order() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    let plain = db.collection("people").watch(false);
    let capturing = db.collection("people").watch(true);

    for i in 1..=10i64 {
        let mut tx = db.begin_transaction();
        db.collection("people")
            .insert(&mut tx, Some(DocId::Int64(i)), &person("p", i))
            .unwrap();
        tx.commit().unwrap();
    }

    let mut plain_events = Vec::new();
    let mut capturing_events = Vec::new();
    for _ in 0..10 {
        plain_events.push(
            plain
                .events()
                .recv_timeout(Duration::from_secs(2))
                .expect("plain subscriber starved"),
        );
        capturing_events.push(
            capturing
                .events()
                .recv_timeout(Duration::from_secs(2))
                .expect("capturing subscriber starved"),
        );
    }

    for events in [&plain_events, &capturing_events] {
        assert_eq!(events.len(), 10);
        for pair in events.windows(2) {
            assert!(pair[0].lsn < pair[1].lsn, "events out of commit order");
        }
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.op, OpType::Insert);
            assert_eq!(event.collection, "people");
            assert_eq!(event.doc_id, DocId::Int64(i as i64 + 1));
        }
    }

    assert!(plain_events.iter().all(|e| e.payload.is_none()));
    assert!(capturing_events.iter().all(|e| e.payload.is_some()));
}

/// All operations of one transaction arrive together, before any
/// event of a later transaction.
#[test]
fn test_transaction_events_are_contiguous() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    let sub = db.collection("people").watch(false);

    let mut tx = db.begin_transaction();
    db.collection("people")
        .insert(&mut tx, Some(DocId::Int64(1)), &person("a", 1))
        .unwrap();
    db.collection("people")
        .insert(&mut tx, Some(DocId::Int64(2)), &person("b", 2))
        .unwrap();
    tx.commit().unwrap();

    let mut tx = db.begin_transaction();
    db.collection("people")
        .update(&mut tx, &DocId::Int64(1), &person("a2", 1))
        .unwrap();
    db.collection("people")
        .delete(&mut tx, &DocId::Int64(2))
        .unwrap();
    tx.commit().unwrap();

    let ops: Vec<(OpType, u64)> = (0..4)
        .map(|_| {
            let e = sub.events().recv_timeout(Duration::from_secs(2)).unwrap();
            (e.op, e.lsn)
        })
        .collect();

    assert_eq!(ops[0].0, OpType::Insert);
    assert_eq!(ops[1].0, OpType::Insert);
    assert_eq!(ops[2].0, OpType::Update);
    assert_eq!(ops[3].0, OpType::Delete);
    assert_eq!(ops[0].1, ops[1].1, "same commit, same lsn");
    assert_eq!(ops[2].1, ops[3].1);
    assert!(ops[1].1 < ops[2].1);
}

/// Events of an aborted transaction never reach a subscriber.
#[test]
fn test_aborted_transaction_emits_nothing() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    let sub = db.collection("people").watch(false);

    let mut tx = db.begin_transaction();
    db.collection("people")
        .insert(&mut tx, Some(DocId::Int64(1)), &person("ghost", 0))
        .unwrap();
    tx.abort().unwrap();

    let mut tx = db.begin_transaction();
    db.collection("people")
        .insert(&mut tx, Some(DocId::Int64(2)), &person("real", 0))
        .unwrap();
    tx.commit().unwrap();

    let event = sub.events().recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.doc_id, DocId::Int64(2));
    assert!(sub
        .events()
        .recv_timeout(Duration::from_millis(200))
        .is_err());
}

/// A subscriber that never reads must not slow committers down.
#[test]
fn test_stuck_subscriber_does_not_block_commit() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");

    // never read from it
    let _stuck = db.collection("people").watch(true);

    let start = Instant::now();
    for i in 1..=100i64 {
        let mut tx = db.begin_transaction();
        db.collection("people")
            .insert(&mut tx, Some(DocId::Int64(i)), &person("p", i))
            .unwrap();
        tx.commit().unwrap();
    }
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(30),
        "commits stalled behind a stuck subscriber: {:?}",
        elapsed
    );
}

/// Subscribers on other collections stay silent.
#[test]
fn test_collection_filtering() {
    setup();
    let (_dir, base) = scratch_db();
    let db = Database::open(&base).unwrap();
    int_collection(&db, "people");
    int_collection(&db, "orders");

    let people_sub = db.collection("people").watch(false);

    let mut tx = db.begin_transaction();
    db.collection("orders")
        .insert(&mut tx, Some(DocId::Int64(1)), &person("order", 1))
        .unwrap();
    db.collection("people")
        .insert(&mut tx, Some(DocId::Int64(1)), &person("human", 1))
        .unwrap();
    tx.commit().unwrap();

    let event = people_sub
        .events()
        .recv_timeout(Duration::from_secs(2))
        .unwrap();
    assert_eq!(event.collection, "people");
    assert!(people_sub
        .events()
        .recv_timeout(Duration::from_millis(200))
        .is_err());
}
