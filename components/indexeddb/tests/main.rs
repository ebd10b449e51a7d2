/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use indexeddb::backing_store::memory::MemoryBackingStore;
use indexeddb::{
    Bucket, BucketContext, BucketContextDelegate, Connection, Database, DatabaseCallbacks,
    FixedQuotaManager, IndexedDBPrefs, QuotaManager, RequestCallback, Transaction,
    TransactionKey,
};
use indexeddb_traits::{
    DatabaseError, IndexedDBIndexMetadata, IndexedDBTxnDurability, IndexedDBTxnMode,
    IndexedDBValue, KeyPath,
};
use tokio::sync::oneshot;
use uuid::Uuid;

mod operations;
mod timeout;

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Complete(i64),
    Abort(i64, DatabaseError),
    DisallowInactiveClient,
    BadMessage(String),
}

#[derive(Clone, Default)]
struct Events(Rc<RefCell<Vec<Event>>>);

impl Events {
    fn take(&self) -> Vec<Event> {
        self.0.borrow_mut().drain(..).collect()
    }
}

struct RecordingCallbacks(Events);

impl DatabaseCallbacks for RecordingCallbacks {
    fn on_complete(&self, transaction_id: i64) {
        self.0.0.borrow_mut().push(Event::Complete(transaction_id));
    }

    fn on_abort(&self, transaction_id: i64, error: &DatabaseError) {
        self.0
            .0
            .borrow_mut()
            .push(Event::Abort(transaction_id, error.clone()));
    }

    fn on_disallow_inactive_client(&self) {
        self.0.0.borrow_mut().push(Event::DisallowInactiveClient);
    }

    fn on_bad_message(&self, message: &str) {
        self.0
            .0
            .borrow_mut()
            .push(Event::BadMessage(message.to_owned()));
    }
}

#[derive(Clone, Default)]
struct DelegateLog {
    content_changes: Rc<RefCell<Vec<(String, String)>>>,
    files_written: Rc<RefCell<Vec<bool>>>,
}

impl BucketContextDelegate for DelegateLog {
    fn on_content_changed(&self, database_name: &str, object_store_name: &str) {
        self.content_changes
            .borrow_mut()
            .push((database_name.to_owned(), object_store_name.to_owned()));
    }

    fn on_files_written(&self, flushed: bool) {
        self.files_written.borrow_mut().push(flushed);
    }
}

/// Counts quota checks and grants all of them.
struct CountingQuotaManager(Rc<Cell<u32>>);

impl QuotaManager for CountingQuotaManager {
    fn check_can_use_disk_space(&self, _: u64) -> oneshot::Receiver<bool> {
        self.0.set(self.0.get() + 1);
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(true);
        receiver
    }
}

/// Holds quota answers back until the test gives them.
#[derive(Clone, Default)]
struct DeferredQuotaManager(Rc<RefCell<Vec<oneshot::Sender<bool>>>>);

impl DeferredQuotaManager {
    fn answer(&self, allowed: bool) {
        for sender in self.0.borrow_mut().drain(..) {
            let _ = sender.send(allowed);
        }
    }

    fn drop_requests(&self) {
        self.0.borrow_mut().clear();
    }
}

impl QuotaManager for DeferredQuotaManager {
    fn check_can_use_disk_space(&self, _: u64) -> oneshot::Receiver<bool> {
        let (sender, receiver) = oneshot::channel();
        self.0.borrow_mut().push(sender);
        receiver
    }
}

const DB_NAME: &str = "db";
const STORE: i64 = 1;
const AUTO_INCREMENT_STORE: i64 = 2;
const UNIQUE_INDEX: i64 = 1;

struct Harness {
    bucket: Bucket,
    store: MemoryBackingStore,
    database: Rc<Database>,
    delegate: DelegateLog,
    next_transaction_id: i64,
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn init() -> Harness {
    init_with(IndexedDBPrefs::default(), Box::new(FixedQuotaManager::unlimited()))
}

fn init_with(prefs: IndexedDBPrefs, quota_manager: Box<dyn QuotaManager>) -> Harness {
    init_logger();
    let delegate = DelegateLog::default();
    let context = Rc::new(BucketContext::new(
        prefs,
        quota_manager,
        Box::new(delegate.clone()),
    ));
    let mut bucket = Bucket::new(context);
    let store = MemoryBackingStore::new(DB_NAME);
    let database = bucket.open_database(Rc::new(store.clone())).unwrap();
    Harness {
        bucket,
        store,
        database,
        delegate,
        next_transaction_id: 1,
    }
}

/// A harness whose database has `STORE` with a unique index and `AUTO_INCREMENT_STORE`.
fn init_with_stores() -> Harness {
    let mut harness = init();
    harness.create_stores();
    harness
}

impl Harness {
    fn connect(&mut self) -> (Rc<Connection>, Events) {
        self.connect_as(Uuid::new_v4())
    }

    fn connect_as(&mut self, client_token: Uuid) -> (Rc<Connection>, Events) {
        let events = Events::default();
        let connection = self
            .bucket
            .open_connection(
                DB_NAME,
                client_token,
                Box::new(RecordingCallbacks(events.clone())),
            )
            .unwrap();
        (connection, events)
    }

    fn begin(
        &mut self,
        connection: &Rc<Connection>,
        scope: &[i64],
        mode: IndexedDBTxnMode,
    ) -> TransactionKey {
        self.begin_with_durability(connection, scope, mode, IndexedDBTxnDurability::Relaxed)
    }

    fn begin_with_durability(
        &mut self,
        connection: &Rc<Connection>,
        scope: &[i64],
        mode: IndexedDBTxnMode,
        durability: IndexedDBTxnDurability,
    ) -> TransactionKey {
        let id = self.next_transaction_id;
        self.next_transaction_id += 1;
        self.bucket
            .create_transaction(
                connection,
                id,
                scope.iter().copied().collect::<BTreeSet<_>>(),
                mode,
                durability,
            )
            .unwrap()
    }

    fn txn(&mut self, key: TransactionKey) -> &mut Transaction {
        self.bucket.transaction_mut(key).unwrap()
    }

    fn create_stores(&mut self) {
        let (connection, events) = self.connect();
        let key = self.begin(&connection, &[], IndexedDBTxnMode::Versionchange);
        let txn = self.txn(key);
        txn.create_object_store(
            STORE,
            "store".to_owned(),
            Some(KeyPath::String("id".to_owned())),
            false,
        );
        txn.create_object_store(
            AUTO_INCREMENT_STORE,
            "auto".to_owned(),
            Some(KeyPath::String("id".to_owned())),
            true,
        );
        txn.create_index(
            STORE,
            IndexedDBIndexMetadata {
                id: UNIQUE_INDEX,
                name: "by_name".to_owned(),
                key_path: KeyPath::String("name".to_owned()),
                unique: true,
                multi_entry: false,
            },
        );
        txn.commit(0);
        self.bucket.run_tasks();
        assert_eq!(events.take(), vec![Event::Complete(key.1)]);
        connection.close();
        self.delegate.content_changes.borrow_mut().clear();
        self.delegate.files_written.borrow_mut().clear();
    }
}

type Slot<T> = Rc<RefCell<Option<Result<T, DatabaseError>>>>;

/// A request callback and the place its result lands in.
fn slot<T: 'static>() -> (Slot<T>, RequestCallback<T>) {
    let slot: Slot<T> = Rc::new(RefCell::new(None));
    let target = slot.clone();
    let callback = RequestCallback::new(move |result| *target.borrow_mut() = Some(result));
    (slot, callback)
}

fn value(bits: &[u8]) -> IndexedDBValue {
    IndexedDBValue::new(bits.to_vec())
}
