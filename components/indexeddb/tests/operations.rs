/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use indexeddb::TransactionState;
use indexeddb_traits::{
    DatabaseError, IdbException, IndexedDBIndexKeys, IndexedDBIndexMetadata, IndexedDBKeyType,
    IndexedDBTxnMode, KeyPath, MAX_KEY_GENERATOR_VALUE, PutMode, TaskType,
};

use crate::{
    AUTO_INCREMENT_STORE, Event, Harness, STORE, TransactionKey, UNIQUE_INDEX, init_with_stores,
    slot, value,
};

fn begin_started(harness: &mut Harness, mode: IndexedDBTxnMode) -> (TransactionKey, crate::Events) {
    let (connection, events) = harness.connect();
    let key = harness.begin(&connection, &[STORE, AUTO_INCREMENT_STORE], mode);
    harness.bucket.run_tasks();
    assert_eq!(harness.txn(key).state(), TransactionState::Started);
    (key, events)
}

fn put_auto(
    harness: &mut Harness,
    key: TransactionKey,
    explicit_key: Option<f64>,
) -> crate::Slot<IndexedDBKeyType> {
    let (result, callback) = slot();
    harness.txn(key).put(
        AUTO_INCREMENT_STORE,
        value(b"v"),
        explicit_key.map(IndexedDBKeyType::Number),
        PutMode::AddOrUpdate,
        vec![],
        callback,
    );
    result
}

fn put_with_index_key(
    harness: &mut Harness,
    key: TransactionKey,
    primary_key: f64,
    index_key: &str,
) -> crate::Slot<IndexedDBKeyType> {
    let (result, callback) = slot();
    harness.txn(key).put(
        STORE,
        value(b"v"),
        Some(IndexedDBKeyType::Number(primary_key)),
        PutMode::AddOrUpdate,
        vec![IndexedDBIndexKeys {
            index_id: UNIQUE_INDEX,
            keys: vec![IndexedDBKeyType::String(index_key.to_owned())],
        }],
        callback,
    );
    result
}

#[test]
fn generated_keys_count_up_from_one() {
    let mut harness = init_with_stores();
    let (key, events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    let first = put_auto(&mut harness, key, None);
    let second = put_auto(&mut harness, key, None);
    harness.txn(key).commit(0);
    harness.bucket.run_tasks();

    assert_eq!(*first.borrow(), Some(Ok(IndexedDBKeyType::Number(1.0))));
    assert_eq!(*second.borrow(), Some(Ok(IndexedDBKeyType::Number(2.0))));
    assert_eq!(events.take(), vec![Event::Complete(key.1)]);
    assert_eq!(
        harness
            .store
            .committed_key_generator_current_number(AUTO_INCREMENT_STORE),
        Some(3)
    );
}

#[test]
fn explicit_keys_advance_the_generator() {
    let mut harness = init_with_stores();
    let (key, _events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    let explicit = put_auto(&mut harness, key, Some(10.5));
    let smaller = put_auto(&mut harness, key, Some(3.0));
    let generated = put_auto(&mut harness, key, None);
    harness.bucket.run_tasks();

    assert_eq!(*explicit.borrow(), Some(Ok(IndexedDBKeyType::Number(10.5))));
    assert_eq!(*smaller.borrow(), Some(Ok(IndexedDBKeyType::Number(3.0))));
    assert_eq!(*generated.borrow(), Some(Ok(IndexedDBKeyType::Number(11.0))));
}

#[test]
fn key_generator_stops_at_two_to_the_fifty_third() {
    let mut harness = init_with_stores();
    let (key, events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    let explicit = put_auto(&mut harness, key, Some(MAX_KEY_GENERATOR_VALUE));
    let generated = put_auto(&mut harness, key, None);
    harness.bucket.run_tasks();

    assert_eq!(
        *explicit.borrow(),
        Some(Ok(IndexedDBKeyType::Number(MAX_KEY_GENERATOR_VALUE)))
    );
    assert_eq!(
        *generated.borrow(),
        Some(Err(DatabaseError::new(
            IdbException::ConstraintError,
            "Maximum key generator value reached."
        )))
    );
    // Request errors leave the transaction running.
    assert_eq!(harness.txn(key).state(), TransactionState::Started);
    harness.txn(key).commit(1);
    harness.bucket.run_tasks();
    assert_eq!(events.take(), vec![Event::Complete(key.1)]);
}

#[test]
fn add_only_rejects_an_existing_key() {
    let mut harness = init_with_stores();
    let (key, _events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    let (first, callback) = slot();
    harness.txn(key).put(
        STORE,
        value(b"a"),
        Some(IndexedDBKeyType::String("k".to_owned())),
        PutMode::AddOnly,
        vec![],
        callback,
    );
    let (second, callback) = slot();
    harness.txn(key).put(
        STORE,
        value(b"b"),
        Some(IndexedDBKeyType::String("k".to_owned())),
        PutMode::AddOnly,
        vec![],
        callback,
    );
    let (read, callback) = slot();
    harness
        .txn(key)
        .get(STORE, IndexedDBKeyType::String("k".to_owned()), callback);
    harness.bucket.run_tasks();

    assert!(matches!(*first.borrow(), Some(Ok(_))));
    assert_eq!(
        *second.borrow(),
        Some(Err(DatabaseError::new(
            IdbException::ConstraintError,
            "Key already exists in the object store."
        )))
    );
    assert_eq!(*read.borrow(), Some(Ok(Some(value(b"a")))));
}

#[test]
fn negative_zero_collides_with_zero() {
    let mut harness = init_with_stores();
    let (key, events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    let (first, callback) = slot();
    harness.txn(key).put(
        STORE,
        value(b"a"),
        Some(IndexedDBKeyType::Number(0.0)),
        PutMode::AddOnly,
        vec![],
        callback,
    );
    let (second, callback) = slot();
    harness.txn(key).put(
        STORE,
        value(b"b"),
        Some(IndexedDBKeyType::Number(-0.0)),
        PutMode::AddOnly,
        vec![],
        callback,
    );
    let (count, callback) = slot();
    harness.txn(key).count(STORE, callback);
    harness.bucket.run_tasks();

    assert_eq!(*first.borrow(), Some(Ok(IndexedDBKeyType::Number(0.0))));
    assert_eq!(
        second.borrow().as_ref().unwrap().as_ref().unwrap_err().code,
        IdbException::ConstraintError
    );
    assert_eq!(*count.borrow(), Some(Ok(1)));
    harness.txn(key).commit(1);
    harness.bucket.run_tasks();
    assert_eq!(events.take(), vec![Event::Complete(key.1)]);
}

#[test]
fn unique_index_rejects_a_duplicate_index_key() {
    let mut harness = init_with_stores();
    let (key, _events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    let first = put_with_index_key(&mut harness, key, 1.0, "alice");
    // Overwriting a record may keep its own index key.
    let overwrite = put_with_index_key(&mut harness, key, 1.0, "alice");
    let duplicate = put_with_index_key(&mut harness, key, 2.0, "alice");
    harness.bucket.run_tasks();

    assert!(matches!(*first.borrow(), Some(Ok(_))));
    assert!(matches!(*overwrite.borrow(), Some(Ok(_))));
    assert_eq!(
        *duplicate.borrow(),
        Some(Err(DatabaseError::new(
            IdbException::ConstraintError,
            "Unable to add key to index 'by_name': at least one key does not satisfy the \
             uniqueness requirements."
        )))
    );
    assert_eq!(harness.txn(key).num_errors_sent(), 1);
}

#[test]
fn invalid_key_aborts_the_transaction() {
    let mut harness = init_with_stores();
    let (key, events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    let (result, callback) = slot();
    harness.txn(key).put(
        STORE,
        value(b"a"),
        Some(IndexedDBKeyType::Number(f64::NAN)),
        PutMode::AddOrUpdate,
        vec![],
        callback,
    );
    harness.bucket.run_tasks();

    assert_eq!(
        result.borrow().as_ref().unwrap().as_ref().unwrap_err().code,
        IdbException::AbortError
    );
    assert_eq!(
        events.take(),
        vec![Event::Abort(
            key.1,
            DatabaseError::new(IdbException::UnknownError, "Internal error.")
        )]
    );
}

#[test]
fn put_into_an_unknown_store_reports_bad_request() {
    let mut harness = init_with_stores();
    let (key, events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    let (result, callback) = slot();
    harness.txn(key).put(
        42,
        value(b"a"),
        Some(IndexedDBKeyType::Number(1.0)),
        PutMode::AddOrUpdate,
        vec![],
        callback,
    );
    harness.bucket.run_tasks();

    assert_eq!(
        *result.borrow(),
        Some(Err(DatabaseError::new(IdbException::UnknownError, "Bad request")))
    );
    assert_eq!(events.take().len(), 1);
}

#[test]
fn readonly_transactions_refuse_writes() {
    let mut harness = init_with_stores();
    let (key, events) = begin_started(&mut harness, IndexedDBTxnMode::Readonly);
    let (result, callback) = slot();
    harness.txn(key).put(
        STORE,
        value(b"a"),
        Some(IndexedDBKeyType::Number(1.0)),
        PutMode::AddOrUpdate,
        vec![],
        callback,
    );
    let (_, callback) = slot();
    harness.txn(key).clear(STORE, callback);
    harness.txn(key).create_object_store(9, "nine".to_owned(), None, false);

    assert_eq!(
        events.take(),
        vec![
            Event::BadMessage("Put must not be called from a readonly transaction.".to_owned()),
            Event::BadMessage("Clear must not be called from a readonly transaction.".to_owned()),
            Event::BadMessage(
                "CreateObjectStore must be called from a version change transaction.".to_owned()
            ),
        ]
    );
    assert_eq!(
        result.borrow().as_ref().unwrap().as_ref().unwrap_err().code,
        IdbException::AbortError
    );
    assert_eq!(harness.txn(key).tasks_scheduled(), 0);
}

#[test]
fn put_on_a_closed_connection_fails_immediately() {
    let mut harness = init_with_stores();
    let (connection, events) = harness.connect();
    let key = harness.begin(&connection, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();
    connection.close();

    let (result, callback) = slot();
    harness.txn(key).put(
        STORE,
        value(b"a"),
        Some(IndexedDBKeyType::Number(1.0)),
        PutMode::AddOrUpdate,
        vec![],
        callback,
    );
    assert_eq!(
        *result.borrow(),
        Some(Err(DatabaseError::new(IdbException::UnknownError, "Not connected.")))
    );

    // Nothing reaches a client that went away.
    harness
        .txn(key)
        .abort(DatabaseError::new(IdbException::AbortError, ""));
    assert!(events.take().is_empty());
}

#[test]
fn delete_clear_and_count() {
    let mut harness = init_with_stores();
    let (key, events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    for id in 1..=3 {
        put_auto(&mut harness, key, Some(id as f64));
    }
    let (deleted, callback) = slot();
    harness
        .txn(key)
        .delete(AUTO_INCREMENT_STORE, IndexedDBKeyType::Number(2.0), callback);
    let (after_delete, callback) = slot();
    harness.txn(key).count(AUTO_INCREMENT_STORE, callback);
    let (cleared, callback) = slot();
    harness.txn(key).clear(AUTO_INCREMENT_STORE, callback);
    let (after_clear, callback) = slot();
    harness.txn(key).count(AUTO_INCREMENT_STORE, callback);
    harness.txn(key).commit(0);
    harness.bucket.run_tasks();

    assert_eq!(*deleted.borrow(), Some(Ok(())));
    assert_eq!(*after_delete.borrow(), Some(Ok(2)));
    assert_eq!(*cleared.borrow(), Some(Ok(())));
    assert_eq!(*after_clear.borrow(), Some(Ok(0)));
    assert_eq!(events.take(), vec![Event::Complete(key.1)]);
    // Three puts, the delete and the clear.
    assert_eq!(harness.delegate.content_changes.borrow().len(), 5);
}

#[test]
fn cursors_are_closed_when_the_transaction_finishes() {
    let mut harness = init_with_stores();
    let (key, _events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    put_auto(&mut harness, key, Some(2.0));
    put_auto(&mut harness, key, Some(1.0));
    let (cursor, callback) = slot();
    harness
        .txn(key)
        .open_cursor(AUTO_INCREMENT_STORE, TaskType::Normal, callback);
    harness.bucket.run_tasks();

    let cursor = cursor.borrow_mut().take().unwrap().unwrap();
    let (first_key, _) = cursor.continue_().unwrap();
    assert_eq!(first_key, IndexedDBKeyType::Number(1.0));
    assert!(!cursor.is_closed());

    harness.txn(key).commit(0);
    harness.bucket.run_tasks();
    assert!(cursor.is_closed());
    assert!(cursor.continue_().is_none());
}

#[test]
fn set_index_keys_for_a_missing_record_aborts() {
    let mut harness = init_with_stores();
    let (connection, events) = harness.connect();
    let key = harness.begin(&connection, &[], IndexedDBTxnMode::Versionchange);
    harness.bucket.run_tasks();
    harness.txn(key).set_index_keys(
        STORE,
        IndexedDBKeyType::Number(99.0),
        IndexedDBIndexKeys {
            index_id: UNIQUE_INDEX,
            keys: vec![IndexedDBKeyType::String("x".to_owned())],
        },
    );
    harness.bucket.run_tasks();

    assert_eq!(
        events.take(),
        vec![Event::Abort(
            key.1,
            DatabaseError::new(
                IdbException::UnknownError,
                "Internal error setting index keys for object store."
            )
        )]
    );
}

#[test]
fn set_index_keys_populates_a_new_index() {
    let mut harness = init_with_stores();
    let (writer, _) = harness.connect();
    let key = harness.begin(&writer, &[STORE], IndexedDBTxnMode::Readwrite);
    put_with_index_key(&mut harness, key, 1.0, "alice");
    put_with_index_key(&mut harness, key, 2.0, "bob");
    harness.txn(key).commit(0);
    harness.bucket.run_tasks();

    let (connection, events) = harness.connect();
    let key = harness.begin(&connection, &[], IndexedDBTxnMode::Versionchange);
    harness.bucket.run_tasks();
    harness.txn(key).create_index(
        STORE,
        IndexedDBIndexMetadata {
            id: 2,
            name: "by_age".to_owned(),
            key_path: KeyPath::String("age".to_owned()),
            unique: true,
            multi_entry: false,
        },
    );
    harness.bucket.run_tasks();
    for (primary_key, age) in [(1.0, 30.0), (2.0, 30.0)] {
        harness.txn(key).set_index_keys(
            STORE,
            IndexedDBKeyType::Number(primary_key),
            IndexedDBIndexKeys {
                index_id: 2,
                keys: vec![IndexedDBKeyType::Number(age)],
            },
        );
    }
    harness.bucket.run_tasks();

    // The second record collides on the unique index.
    assert_eq!(
        events.take(),
        vec![Event::Abort(
            key.1,
            DatabaseError::new(
                IdbException::ConstraintError,
                "Unable to add key to index 'by_age': at least one key does not satisfy the \
                 uniqueness requirements."
            )
        )]
    );
    let metadata = harness.database.metadata();
    assert!(!metadata.object_stores[&STORE].indexes.contains_key(&2));
}

#[test]
fn set_index_keys_is_only_valid_in_version_change() {
    let mut harness = init_with_stores();
    let (key, events) = begin_started(&mut harness, IndexedDBTxnMode::Readwrite);
    harness.txn(key).set_index_keys(
        STORE,
        IndexedDBKeyType::Number(f64::NAN),
        IndexedDBIndexKeys {
            index_id: UNIQUE_INDEX,
            keys: vec![],
        },
    );
    harness.txn(key).set_index_keys(
        STORE,
        IndexedDBKeyType::Number(1.0),
        IndexedDBIndexKeys {
            index_id: UNIQUE_INDEX,
            keys: vec![],
        },
    );
    harness.txn(key).set_index_keys_done();

    assert_eq!(
        events.take(),
        vec![
            Event::BadMessage("SetIndexKeys used with invalid key.".to_owned()),
            Event::BadMessage(
                "SetIndexKeys must be called from a version change transaction.".to_owned()
            ),
            Event::BadMessage(
                "SetIndexKeysDone must be called from a version change transaction.".to_owned()
            ),
        ]
    );
}

#[test]
fn deleting_an_index_updates_metadata_on_commit() {
    let mut harness = init_with_stores();
    let (connection, events) = harness.connect();
    let key = harness.begin(&connection, &[], IndexedDBTxnMode::Versionchange);
    harness.txn(key).delete_index(STORE, UNIQUE_INDEX);
    harness.txn(key).commit(0);
    harness.bucket.run_tasks();

    assert_eq!(events.take(), vec![Event::Complete(key.1)]);
    assert!(
        harness.database.metadata().object_stores[&STORE]
            .indexes
            .is_empty()
    );
}
