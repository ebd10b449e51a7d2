/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The executor of one storage bucket. Every transaction of the bucket lives
//! here and only runs from `run_tasks`, so no two of them ever run at the
//! same time.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Instant;

use indexeddb_traits::{
    BackendError, BackendResult, DatabaseError, IdbException, IndexedDBTxnDurability,
    IndexedDBTxnMode,
};
use log::{debug, error};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::backing_store::BackingStore;
use crate::bucket_context::BucketContext;
use crate::connection::{Connection, ConnectionId, DatabaseCallbacks};
use crate::database::Database;
use crate::transaction::{RunTasksResult, Transaction, TransactionState};

/// Transaction ids are only unique per connection.
pub type TransactionKey = (ConnectionId, i64);

struct OpenDatabase {
    database: Rc<Database>,
    backing_store: Rc<dyn BackingStore>,
    connections: Vec<Rc<Connection>>,
}

pub struct Bucket {
    context: Rc<BucketContext>,
    databases: FxHashMap<String, OpenDatabase>,
    transactions: BTreeMap<TransactionKey, Transaction>,
    next_database_id_for_locks: u64,
    next_connection_id: u64,
}

impl Bucket {
    pub fn new(context: Rc<BucketContext>) -> Bucket {
        Bucket {
            context,
            databases: FxHashMap::default(),
            transactions: BTreeMap::new(),
            next_database_id_for_locks: 0,
            next_connection_id: 0,
        }
    }

    pub fn context(&self) -> &Rc<BucketContext> {
        &self.context
    }

    /// Loads the database kept in `backing_store`, or returns it if it is open already.
    pub fn open_database(
        &mut self,
        backing_store: Rc<dyn BackingStore>,
    ) -> BackendResult<Rc<Database>> {
        let metadata = backing_store.metadata()?;
        if let Some(open) = self.databases.get(&metadata.name) {
            return Ok(open.database.clone());
        }
        debug!("Opening database {:?} at version {}", metadata.name, metadata.version);
        let database = Rc::new(Database::new(self.next_database_id_for_locks, metadata));
        self.next_database_id_for_locks += 1;
        self.databases.insert(
            database.name().to_owned(),
            OpenDatabase {
                database: database.clone(),
                backing_store,
                connections: vec![],
            },
        );
        Ok(database)
    }

    pub fn open_connection(
        &mut self,
        database_name: &str,
        client_token: Uuid,
        callbacks: Box<dyn DatabaseCallbacks>,
    ) -> BackendResult<Rc<Connection>> {
        let Some(open) = self.databases.get_mut(database_name) else {
            return Err(BackendError::DbNotFound);
        };
        let connection = Connection::new(
            ConnectionId(self.next_connection_id),
            open.database.clone(),
            client_token,
            callbacks,
        );
        self.next_connection_id += 1;
        open.connections.push(connection.clone());
        Ok(connection)
    }

    /// Creates a transaction and queues its lock requests. It starts from a
    /// later `run_tasks` once every lock is granted.
    pub fn create_transaction(
        &mut self,
        connection: &Rc<Connection>,
        transaction_id: i64,
        object_store_ids: BTreeSet<i64>,
        mode: IndexedDBTxnMode,
        durability: IndexedDBTxnDurability,
    ) -> BackendResult<TransactionKey> {
        let key = (connection.id(), transaction_id);
        if self.transactions.contains_key(&key) {
            return Err(BackendError::InvalidArgument(format!(
                "Transaction {transaction_id} already exists."
            )));
        }
        let Some(open) = self.databases.get(connection.database().name()) else {
            return Err(BackendError::DbNotFound);
        };
        let backing_store_transaction = open.backing_store.create_transaction(mode, durability);
        let exclusive_database_lock_for_writes = open.backing_store.serializes_write_transactions();

        let mut transaction = Transaction::new(
            transaction_id,
            connection.clone(),
            object_store_ids,
            mode,
            durability,
            self.context.clone(),
            backing_store_transaction,
        );
        let requests = transaction.build_lock_requests(exclusive_database_lock_for_writes);
        transaction.request_locks(requests);
        self.transactions.insert(key, transaction);
        self.context.queue_run_tasks();
        Ok(key)
    }

    pub fn transaction(&self, key: TransactionKey) -> Option<&Transaction> {
        self.transactions.get(&key)
    }

    pub fn transaction_mut(&mut self, key: TransactionKey) -> Option<&mut Transaction> {
        self.transactions.get_mut(&key)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Runs passes over all transactions until none is queued.
    pub fn run_tasks(&mut self) {
        // Answers from the quota manager or the blob writer may have arrived.
        if self.transactions.values().any(|transaction| {
            transaction.has_pending_quota_check() || transaction.has_pending_blob_write()
        }) {
            self.context.queue_run_tasks();
        }
        while self.context.take_run_tasks_request() {
            self.start_granted_transactions();

            let mut errors = vec![];
            let mut any_finished = false;
            for transaction in self.transactions.values_mut() {
                let result = transaction
                    .process_pending_completions()
                    .and_then(|()| transaction.run_tasks());
                match result {
                    Ok(RunTasksResult::NotFinished) => {},
                    Ok(RunTasksResult::Committed | RunTasksResult::Aborted) => {
                        any_finished = true;
                    },
                    Err(err) => errors.push((transaction.connection().database().clone(), err)),
                }
            }
            for (database, err) in errors {
                self.on_database_error(&database, err);
            }

            self.transactions.retain(|_, transaction| !transaction.is_drained());
            // Finished transactions released their locks.
            if any_finished || self.has_granted_transactions() {
                self.context.queue_run_tasks();
            }
        }
    }

    /// Like `run_tasks`, but also waits for quota answers and external object writes.
    pub fn run_until_idle(&mut self) {
        loop {
            self.run_tasks();
            let Some(key) = self
                .transactions
                .iter()
                .find(|(_, transaction)| {
                    transaction.has_pending_quota_check() || transaction.has_pending_blob_write()
                })
                .map(|(key, _)| *key)
            else {
                return;
            };
            let Some(transaction) = self.transactions.get_mut(&key) else {
                return;
            };
            if transaction.has_pending_quota_check() {
                transaction.wait_for_quota_check();
            } else if let Err(err) = transaction.wait_for_blob_write() {
                let database = transaction.connection().database().clone();
                self.on_database_error(&database, err);
            }
            self.context.queue_run_tasks();
        }
    }

    /// Fires the inactivity timers that are due by `now`.
    pub fn fire_timers(&mut self, now: Instant) {
        for transaction in self.transactions.values_mut() {
            transaction.poll_timeout(now);
        }
        self.run_tasks();
    }

    pub fn set_scheduling_priority(&mut self, connection: &Connection, scheduling_priority: i32) {
        connection.set_scheduling_priority(scheduling_priority);
        for ((connection_id, _), transaction) in &self.transactions {
            if *connection_id == connection.id() {
                transaction.on_scheduling_priority_updated(scheduling_priority);
            }
        }
    }

    fn has_granted_transactions(&self) -> bool {
        self.transactions.values().any(|transaction| {
            transaction.state() == TransactionState::Created &&
                transaction
                    .lock_holder()
                    .is_some_and(|holder| self.context.lock_manager().is_granted(holder))
        })
    }

    fn start_granted_transactions(&mut self) {
        let granted = self.context.lock_manager().take_newly_granted();
        for holder in granted {
            if let Some(transaction) = self
                .transactions
                .values_mut()
                .find(|transaction| transaction.lock_holder() == Some(holder))
            {
                if transaction.state() == TransactionState::Created {
                    transaction.start();
                }
            }
        }
    }

    /// The backing store of `database` can not be trusted anymore: every
    /// transaction on it is aborted and its clients are disconnected.
    fn on_database_error(&mut self, database: &Rc<Database>, err: BackendError) {
        error!("Database error in {:?}: {err}", database.name());
        let error = if err.indicates_disk_full() {
            DatabaseError::new(IdbException::QuotaError, "Encountered disk full.")
        } else {
            DatabaseError::new(IdbException::UnknownError, "Internal error.")
        };
        for transaction in self.transactions.values_mut() {
            if Rc::ptr_eq(transaction.connection().database(), database) {
                transaction.abort(error.clone());
            }
        }
        if let Some(open) = self.databases.get_mut(database.name()) {
            for connection in open.connections.drain(..) {
                connection.close();
            }
        }
    }
}
