/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The backend half of an IndexedDB transaction.
//!
//! A transaction is created waiting for its locks, starts once they are
//! granted, runs the operations its client schedules and finally commits in
//! two phases: external objects are written first, then the backing store
//! transaction is committed. It can be aborted at any point before it
//! finishes. All locks are held until the outcome is known.

use std::collections::BTreeSet;
use std::iter;
use std::rc::Rc;
use std::time::Instant;

use indexeddb_traits::{
    BackendError, BackendResult, DatabaseError, IdbException, IndexedDBDatabaseMetadata,
    IndexedDBIndexKeys, IndexedDBIndexMetadata, IndexedDBKeyType, IndexedDBObjectStoreMetadata,
    IndexedDBTxnDurability, IndexedDBTxnMode, IndexedDBValue, KeyPath, MAX_KEY_GENERATOR_VALUE,
    PutMode, TaskType,
};
use log::{debug, error, trace, warn};
use rustc_hash::FxHashSet;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use self::operation::PutOperation;
pub use self::operation::{Operation, OperationKind, RequestCallback};
use self::task_queue::TaskQueue;
use self::timeout::InactivityTimer;
use crate::backing_store::{
    BackingStoreTransaction, BlobWriteError, BlobWriteReceiver, BlobWriteResult,
};
use crate::bucket_context::BucketContext;
use crate::connection::Connection;
use crate::cursor::{Cursor, WeakCursor};
use crate::index_writer::make_index_writers;
use crate::lock_manager::{
    LockHolderId, LockRequestData, LockType, PartitionedLockId, PartitionedLockRequest,
};
use crate::metrics;

mod operation;
mod task_queue;
mod timeout;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum TransactionState {
    /// Waiting for locks.
    Created,
    /// Holds its locks and runs tasks.
    Started,
    /// Commit has begun and no new requests are accepted.
    Committing,
    /// Committed or aborted.
    Finished,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunTasksResult {
    NotFinished,
    Committed,
    Aborted,
}

/// Transaction state as shown on internals pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum InternalsState {
    Blocked,
    Started,
    Running,
    Committing,
    Finished,
}

#[derive(Clone, Debug, Serialize)]
pub struct TransactionInternals {
    pub tid: i64,
    pub connection_id: u64,
    pub client_token: String,
    pub mode: IndexedDBTxnMode,
    pub state: InternalsState,
    pub age_ms: f64,
    pub runtime_ms: Option<f64>,
    pub tasks_scheduled: u64,
    pub tasks_completed: u64,
    pub scope: Vec<String>,
}

struct Diagnostics {
    tasks_scheduled: u64,
    tasks_completed: u64,
    creation_time: Instant,
    start_time: Option<Instant>,
}

pub struct Transaction {
    id: i64,
    connection: Rc<Connection>,
    bucket_context: Rc<BucketContext>,
    object_store_ids: BTreeSet<i64>,
    mode: IndexedDBTxnMode,
    durability: IndexedDBTxnDurability,
    state: TransactionState,

    used: bool,
    aborted: bool,
    is_commit_pending: bool,
    processing_event_queue: bool,

    backing_store_transaction: Option<Box<dyn BackingStoreTransaction>>,
    backing_store_transaction_begun: bool,

    lock_ids: FxHashSet<PartitionedLockId>,
    lock_holder: Option<LockHolderId>,

    preemptive_task_queue: TaskQueue,
    task_queue: TaskQueue,
    /// While non-zero, normal tasks wait even if no preemptive task is queued.
    pending_preemptive_events: u32,

    num_errors_sent: u64,
    num_errors_handled: u64,
    preliminary_size_estimate: u64,
    in_flight_memory: u64,

    open_cursors: Vec<WeakCursor>,
    timeout_timer: InactivityTimer,
    timeout_strikes: u32,
    diagnostics: Diagnostics,
    scheduling_priority_at_last_state_change: Option<i32>,

    pending_quota_check: Option<oneshot::Receiver<bool>>,
    pending_blob_write: Option<BlobWriteReceiver>,
    /// Metadata to restore if a version change does not commit, taken on start.
    metadata_snapshot: Option<IndexedDBDatabaseMetadata>,
}

impl Transaction {
    pub fn new(
        id: i64,
        connection: Rc<Connection>,
        object_store_ids: BTreeSet<i64>,
        mode: IndexedDBTxnMode,
        durability: IndexedDBTxnDurability,
        bucket_context: Rc<BucketContext>,
        backing_store_transaction: Box<dyn BackingStoreTransaction>,
    ) -> Transaction {
        debug_assert_eq!(backing_store_transaction.mode(), mode);
        let timeout_timer =
            InactivityTimer::new(bucket_context.prefs().inactivity_timeout_poll_period());
        let scheduling_priority = connection.scheduling_priority();
        debug!("Creating {} transaction {id}", mode.as_str());
        Transaction {
            id,
            connection,
            bucket_context,
            object_store_ids,
            mode,
            durability,
            state: TransactionState::Created,
            used: false,
            aborted: false,
            is_commit_pending: false,
            processing_event_queue: false,
            backing_store_transaction: Some(backing_store_transaction),
            backing_store_transaction_begun: false,
            lock_ids: FxHashSet::default(),
            lock_holder: None,
            preemptive_task_queue: TaskQueue::default(),
            task_queue: TaskQueue::default(),
            pending_preemptive_events: 0,
            num_errors_sent: 0,
            num_errors_handled: 0,
            preliminary_size_estimate: 0,
            in_flight_memory: 0,
            open_cursors: vec![],
            timeout_timer,
            timeout_strikes: 0,
            diagnostics: Diagnostics {
                tasks_scheduled: 0,
                tasks_completed: 0,
                creation_time: Instant::now(),
                start_time: None,
            },
            scheduling_priority_at_last_state_change: Some(scheduling_priority),
            pending_quota_check: None,
            pending_blob_write: None,
            metadata_snapshot: None,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn connection(&self) -> &Rc<Connection> {
        &self.connection
    }

    pub fn mode(&self) -> IndexedDBTxnMode {
        self.mode
    }

    pub fn durability(&self) -> IndexedDBTxnDurability {
        self.durability
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn scope(&self) -> &BTreeSet<i64> {
        &self.object_store_ids
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_commit_pending(&self) -> bool {
        self.is_commit_pending
    }

    pub fn tasks_scheduled(&self) -> u64 {
        self.diagnostics.tasks_scheduled
    }

    pub fn tasks_completed(&self) -> u64 {
        self.diagnostics.tasks_completed
    }

    pub fn num_errors_sent(&self) -> u64 {
        self.num_errors_sent
    }

    pub fn preliminary_size_estimate(&self) -> u64 {
        self.preliminary_size_estimate
    }

    pub fn in_flight_memory(&self) -> u64 {
        self.in_flight_memory
    }

    pub fn pending_preemptive_events(&self) -> u32 {
        self.pending_preemptive_events
    }

    pub fn lock_holder(&self) -> Option<LockHolderId> {
        self.lock_holder
    }

    pub fn lock_ids(&self) -> &FxHashSet<PartitionedLockId> {
        &self.lock_ids
    }

    pub fn is_timeout_timer_running(&self) -> bool {
        self.timeout_timer.is_running()
    }

    /// New requests are refused once a commit was requested or the transaction ended.
    pub fn is_accepting_requests(&self) -> bool {
        !self.is_commit_pending &&
            self.state != TransactionState::Committing &&
            self.state != TransactionState::Finished
    }

    fn is_task_queue_empty(&self) -> bool {
        self.preemptive_task_queue.is_empty() && self.task_queue.is_empty()
    }

    pub fn has_pending_tasks(&self) -> bool {
        self.pending_preemptive_events != 0 || !self.is_task_queue_empty()
    }

    /// Whether the transaction is done and nothing it started is still outstanding.
    pub fn is_drained(&self) -> bool {
        self.state == TransactionState::Finished &&
            self.is_task_queue_empty() &&
            self.pending_blob_write.is_none() &&
            self.pending_quota_check.is_none()
    }

    pub fn has_pending_blob_write(&self) -> bool {
        self.pending_blob_write.is_some()
    }

    pub fn has_pending_quota_check(&self) -> bool {
        self.pending_quota_check.is_some()
    }

    fn set_state(&mut self, state: TransactionState) {
        debug_assert!(state >= self.state, "{:?} -> {:?}", self.state, state);
        self.state = state;
        self.scheduling_priority_at_last_state_change = Some(self.connection.scheduling_priority());
    }

    fn backing_store_transaction(&mut self) -> BackendResult<&mut dyn BackingStoreTransaction> {
        match self.backing_store_transaction.as_deref_mut() {
            Some(transaction) => Ok(transaction),
            None => Err(BackendError::InternalInconsistency(format!(
                "transaction {} has no backing store transaction",
                self.id
            ))),
        }
    }

    fn bad_message(&self, message: &str) {
        self.connection.report_bad_message(message);
    }

    /// The locks this transaction needs. Version changes lock the whole
    /// database; other transactions share the database lock and lock each
    /// object store in scope.
    pub fn build_lock_requests(
        &self,
        exclusive_database_lock_for_writes: bool,
    ) -> Vec<PartitionedLockRequest> {
        let database = self.connection.database();
        if self.mode == IndexedDBTxnMode::Versionchange {
            return vec![PartitionedLockRequest {
                lock_id: database.lock_id(),
                lock_type: LockType::Exclusive,
            }];
        }

        let database_lock_type =
            if exclusive_database_lock_for_writes && self.mode == IndexedDBTxnMode::Readwrite {
                LockType::Exclusive
            } else {
                LockType::Shared
            };
        let object_store_lock_type = match self.mode {
            IndexedDBTxnMode::Readonly => LockType::Shared,
            _ => LockType::Exclusive,
        };
        iter::once(PartitionedLockRequest {
            lock_id: database.lock_id(),
            lock_type: database_lock_type,
        })
        .chain(
            self.object_store_ids
                .iter()
                .map(|object_store_id| PartitionedLockRequest {
                    lock_id: database.object_store_lock_id(*object_store_id),
                    lock_type: object_store_lock_type,
                }),
        )
        .collect()
    }

    pub(crate) fn request_locks(&mut self, requests: Vec<PartitionedLockRequest>) {
        debug_assert!(self.lock_holder.is_none());
        self.lock_ids = requests
            .iter()
            .map(|request| request.lock_id.clone())
            .collect();
        let data = LockRequestData {
            client_token: self.connection.client_token(),
            scheduling_priority: self.connection.scheduling_priority(),
        };
        let holder = self
            .bucket_context
            .lock_manager()
            .acquire_locks(requests, data);
        self.lock_holder = Some(holder);
    }

    /// Releases held locks, or withdraws the request if they were not granted yet.
    fn release_locks(&mut self) {
        if let Some(holder) = self.lock_holder.take() {
            self.bucket_context.lock_manager().release_locks(holder);
        }
    }

    pub(crate) fn on_scheduling_priority_updated(&self, scheduling_priority: i32) {
        if let Some(holder) = self.lock_holder {
            self.bucket_context
                .lock_manager()
                .update_scheduling_priority(holder, scheduling_priority);
        }
    }

    /// Called once every requested lock is granted.
    pub fn start(&mut self) {
        // Locks can be granted after an abort was requested.
        if self.state == TransactionState::Finished {
            debug_assert!(self.lock_holder.is_none());
            return;
        }
        debug_assert_eq!(self.state, TransactionState::Created);
        let scheduling_priority_at_last_state_change =
            self.scheduling_priority_at_last_state_change;
        self.set_state(TransactionState::Started);
        debug_assert!(!self.lock_ids.is_empty());
        // Earlier version change transactions have committed by now.
        if self.mode == IndexedDBTxnMode::Versionchange {
            self.metadata_snapshot = Some(self.connection.database().metadata().clone());
        }
        let start_time = Instant::now();
        self.diagnostics.start_time = Some(start_time);

        // An inactive client would never let go of the locks, so evict it.
        if self.is_transaction_blocking_other_clients(false) {
            self.connection.disallow_inactive_client();
        }

        let time_queued = start_time - self.diagnostics.creation_time;
        let histogram = metrics::time_queued_histogram(self.mode.as_str());
        let histograms = self.bucket_context.histograms();
        histograms.record_time(&histogram, time_queued);
        if scheduling_priority_at_last_state_change == Some(0) {
            histograms.record_time(&format!("{histogram}.Foreground"), time_queued);
        }

        self.bucket_context.queue_run_tasks();
    }

    pub fn schedule_task(&mut self, task_type: TaskType, operation: Operation) {
        if self.state == TransactionState::Finished {
            return;
        }

        self.reset_timeout_timer();
        self.used = true;
        trace!("Transaction {} scheduling {operation:?}", self.id);
        match task_type {
            TaskType::Normal => {
                self.task_queue.push(operation);
                self.diagnostics.tasks_scheduled += 1;
            },
            TaskType::Preemptive => self.preemptive_task_queue.push(operation),
        }
        if self.state == TransactionState::Started {
            self.bucket_context.queue_run_tasks();
        }
    }

    /// Holds back normal tasks until `did_complete_preemptive_event`.
    pub fn add_pending_preemptive_event(&mut self) {
        self.pending_preemptive_events += 1;
    }

    pub fn did_complete_preemptive_event(&mut self) {
        debug_assert!(self.pending_preemptive_events > 0);
        self.pending_preemptive_events = self.pending_preemptive_events.saturating_sub(1);
    }

    pub fn create_object_store(
        &mut self,
        object_store_id: i64,
        name: String,
        key_path: Option<KeyPath>,
        auto_increment: bool,
    ) {
        if self.mode != IndexedDBTxnMode::Versionchange {
            self.bad_message("CreateObjectStore must be called from a version change transaction.");
            return;
        }
        if !self.is_accepting_requests() || !self.connection.is_connected() {
            return;
        }
        self.schedule_task(
            TaskType::Preemptive,
            Operation::CreateObjectStore {
                object_store_id,
                name,
                key_path,
                auto_increment,
            },
        );
    }

    pub fn delete_object_store(&mut self, object_store_id: i64) {
        if self.mode != IndexedDBTxnMode::Versionchange {
            self.bad_message("DeleteObjectStore must be called from a version change transaction.");
            return;
        }
        if !self.is_accepting_requests() || !self.connection.is_connected() {
            return;
        }
        self.schedule_task(
            TaskType::Normal,
            Operation::DeleteObjectStore { object_store_id },
        );
    }

    pub fn create_index(&mut self, object_store_id: i64, index: IndexedDBIndexMetadata) {
        if self.mode != IndexedDBTxnMode::Versionchange {
            self.bad_message("CreateIndex must be called from a version change transaction.");
            return;
        }
        if !self.is_accepting_requests() || !self.connection.is_connected() {
            return;
        }
        self.schedule_task(
            TaskType::Normal,
            Operation::CreateIndex {
                object_store_id,
                index,
            },
        );
    }

    pub fn delete_index(&mut self, object_store_id: i64, index_id: i64) {
        if self.mode != IndexedDBTxnMode::Versionchange {
            self.bad_message("DeleteIndex must be called from a version change transaction.");
            return;
        }
        if !self.is_accepting_requests() || !self.connection.is_connected() {
            return;
        }
        self.schedule_task(
            TaskType::Normal,
            Operation::DeleteIndex {
                object_store_id,
                index_id,
            },
        );
    }

    pub fn put(
        &mut self,
        object_store_id: i64,
        value: IndexedDBValue,
        key: Option<IndexedDBKeyType>,
        put_mode: PutMode,
        index_keys: Vec<IndexedDBIndexKeys>,
        callback: RequestCallback<IndexedDBKeyType>,
    ) {
        if !self.is_accepting_requests() {
            return;
        }
        if !self.connection.is_connected() {
            callback.run(Err(DatabaseError::new(
                IdbException::UnknownError,
                "Not connected.",
            )));
            return;
        }
        if self.mode == IndexedDBTxnMode::Readonly {
            self.bad_message("Put must not be called from a readonly transaction.");
            return;
        }

        let key_size = key.as_ref().map_or(0, IndexedDBKeyType::size_estimate);
        self.preliminary_size_estimate +=
            value.bits.len() as u64 + key_size + value.external_objects_size();

        // Given back in `do_put`.
        self.in_flight_memory += value.size_estimate();
        self.schedule_task(
            TaskType::Normal,
            Operation::Put(Box::new(PutOperation {
                object_store_id,
                value,
                key,
                put_mode,
                index_keys,
                callback,
            })),
        );
    }

    pub fn set_index_keys(
        &mut self,
        object_store_id: i64,
        primary_key: IndexedDBKeyType,
        index_keys: IndexedDBIndexKeys,
    ) {
        if !self.is_accepting_requests() || !self.connection.is_connected() {
            return;
        }
        if !primary_key.is_valid() {
            self.bad_message("SetIndexKeys used with invalid key.");
            return;
        }
        if self.mode != IndexedDBTxnMode::Versionchange {
            self.bad_message("SetIndexKeys must be called from a version change transaction.");
            return;
        }
        self.schedule_task(
            TaskType::Preemptive,
            Operation::SetIndexKeys {
                object_store_id,
                primary_key,
                index_keys,
            },
        );
    }

    pub fn set_index_keys_done(&mut self) {
        if !self.is_accepting_requests() || !self.connection.is_connected() {
            return;
        }
        if self.mode != IndexedDBTxnMode::Versionchange {
            self.bad_message("SetIndexKeysDone must be called from a version change transaction.");
            return;
        }
        self.schedule_task(TaskType::Preemptive, Operation::SetIndexKeysDone);
    }

    /// Returns whether the request may proceed. Refused requests get their
    /// callback dropped or answered here.
    fn check_request<T>(&self, callback: RequestCallback<T>) -> Option<RequestCallback<T>> {
        if !self.is_accepting_requests() {
            return None;
        }
        if !self.connection.is_connected() {
            callback.run(Err(DatabaseError::new(
                IdbException::UnknownError,
                "Not connected.",
            )));
            return None;
        }
        Some(callback)
    }

    pub fn get(
        &mut self,
        object_store_id: i64,
        key: IndexedDBKeyType,
        callback: RequestCallback<Option<IndexedDBValue>>,
    ) {
        let Some(callback) = self.check_request(callback) else {
            return;
        };
        self.schedule_task(
            TaskType::Normal,
            Operation::Get {
                object_store_id,
                key,
                callback,
            },
        );
    }

    pub fn count(&mut self, object_store_id: i64, callback: RequestCallback<u64>) {
        let Some(callback) = self.check_request(callback) else {
            return;
        };
        self.schedule_task(
            TaskType::Normal,
            Operation::Count {
                object_store_id,
                callback,
            },
        );
    }

    /// A preemptive cursor is how a client populates a new index: normal
    /// tasks wait until it reports `set_index_keys_done`.
    pub fn open_cursor(
        &mut self,
        object_store_id: i64,
        task_type: TaskType,
        callback: RequestCallback<Cursor>,
    ) {
        let Some(callback) = self.check_request(callback) else {
            return;
        };
        self.schedule_task(
            task_type,
            Operation::OpenCursor {
                object_store_id,
                task_type,
                callback,
            },
        );
    }

    pub fn delete(
        &mut self,
        object_store_id: i64,
        key: IndexedDBKeyType,
        callback: RequestCallback<()>,
    ) {
        let Some(callback) = self.check_request(callback) else {
            return;
        };
        if self.mode == IndexedDBTxnMode::Readonly {
            self.bad_message("Delete must not be called from a readonly transaction.");
            return;
        }
        self.schedule_task(
            TaskType::Normal,
            Operation::Delete {
                object_store_id,
                key,
                callback,
            },
        );
    }

    pub fn clear(&mut self, object_store_id: i64, callback: RequestCallback<()>) {
        let Some(callback) = self.check_request(callback) else {
            return;
        };
        if self.mode == IndexedDBTxnMode::Readonly {
            self.bad_message("Clear must not be called from a readonly transaction.");
            return;
        }
        self.schedule_task(
            TaskType::Normal,
            Operation::Clear {
                object_store_id,
                callback,
            },
        );
    }

    /// The client is done issuing requests. `num_errors_handled` is how many
    /// request errors it has seen and handled.
    pub fn commit(&mut self, num_errors_handled: u64) {
        if !self.is_accepting_requests() || !self.connection.is_connected() {
            return;
        }

        self.num_errors_handled = num_errors_handled;

        // Always allow empty or delete-only transactions.
        if self.preliminary_size_estimate == 0 {
            self.set_commit_flag();
            return;
        }

        self.pending_quota_check = Some(
            self.bucket_context
                .check_can_use_disk_space(self.preliminary_size_estimate),
        );
        self.bucket_context.queue_run_tasks();
    }

    pub fn set_commit_flag(&mut self) {
        // An abort may have been initiated meanwhile.
        if !self.is_accepting_requests() {
            return;
        }
        self.is_commit_pending = true;
        self.bucket_context.queue_run_tasks();
    }

    fn on_quota_check_done(&mut self, allowed: bool) {
        if !self.connection.is_connected() {
            return;
        }
        if allowed {
            self.set_commit_flag();
        } else {
            self.abort(DatabaseError::new(IdbException::QuotaError, ""));
        }
    }

    /// Delivers quota and blob write answers that arrived since the last pass.
    pub fn process_pending_completions(&mut self) -> BackendResult<()> {
        if let Some(receiver) = self.pending_quota_check.as_mut() {
            let allowed = match receiver.try_recv() {
                Ok(allowed) => Some(allowed),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Closed) => Some(false),
            };
            if let Some(allowed) = allowed {
                self.pending_quota_check = None;
                self.on_quota_check_done(allowed);
            }
        }

        if let Some(receiver) = self.pending_blob_write.as_mut() {
            let result = match receiver.try_recv() {
                Ok(result) => Some(result),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Closed) => Some(Err(BlobWriteError::Error)),
            };
            if let Some(result) = result {
                self.pending_blob_write = None;
                return self.blob_write_complete(result);
            }
        }
        Ok(())
    }

    /// Blocks until the quota manager answers. A dropped answer denies the commit.
    pub fn wait_for_quota_check(&mut self) {
        let Some(receiver) = self.pending_quota_check.take() else {
            return;
        };
        self.on_quota_check_done(receiver.blocking_recv().unwrap_or(false));
    }

    /// Blocks until the first commit phase finishes writing external objects.
    pub fn wait_for_blob_write(&mut self) -> BackendResult<()> {
        let Some(receiver) = self.pending_blob_write.take() else {
            return Ok(());
        };
        let result = receiver
            .blocking_recv()
            .unwrap_or(Err(BlobWriteError::Error));
        self.blob_write_complete(result)
    }

    pub fn run_tasks(&mut self) -> BackendResult<RunTasksResult> {
        debug_assert!(!self.processing_event_queue);

        // May have been aborted.
        if self.aborted {
            return Ok(RunTasksResult::Aborted);
        }
        if self.state == TransactionState::Created ||
            (self.is_task_queue_empty() && !self.is_commit_pending)
        {
            return Ok(RunTasksResult::NotFinished);
        }

        self.processing_event_queue = true;

        if !self.backing_store_transaction_begun {
            if let Err(err) = self.backing_store_transaction().and_then(|t| t.begin()) {
                self.processing_event_queue = false;
                return Err(err);
            }
            self.backing_store_transaction_begun = true;
        }

        let mut run_preemptive_queue = self.should_run_preemptive_queue();
        while self.state != TransactionState::Finished {
            let operation = if run_preemptive_queue {
                self.preemptive_task_queue.pop()
            } else {
                self.task_queue.pop()
            };
            let Some(operation) = operation else {
                break;
            };
            debug_assert!(matches!(
                self.state,
                TransactionState::Started | TransactionState::Committing
            ));
            let result = self.run_operation(operation);
            if !run_preemptive_queue {
                debug_assert!(self.diagnostics.tasks_completed < self.diagnostics.tasks_scheduled);
                self.diagnostics.tasks_completed += 1;
            }
            if let Err(err) = result {
                self.processing_event_queue = false;
                return Err(err);
            }

            // The operation itself may change which queue comes next.
            run_preemptive_queue = self.should_run_preemptive_queue();
        }

        // Nothing left to run and the client asked for a commit.
        if !self.has_pending_tasks() &&
            self.state == TransactionState::Started &&
            self.is_commit_pending
        {
            self.processing_event_queue = false;
            self.do_pending_commit()?;
        }

        if self.state == TransactionState::Finished {
            self.processing_event_queue = false;
            return Ok(if self.aborted {
                RunTasksResult::Aborted
            } else {
                RunTasksResult::Committed
            });
        }

        // The client may never come back, so watch for it holding up others.
        if !self.has_pending_tasks() &&
            self.state == TransactionState::Started &&
            self.bucket_context.prefs().inactivity_timeout_enabled
        {
            self.timeout_timer.start(Instant::now());
        }
        self.processing_event_queue = false;
        Ok(RunTasksResult::NotFinished)
    }

    fn should_run_preemptive_queue(&self) -> bool {
        !self.preemptive_task_queue.is_empty() || self.pending_preemptive_events != 0
    }

    fn run_operation(&mut self, operation: Operation) -> BackendResult<()> {
        match operation {
            Operation::CreateObjectStore {
                object_store_id,
                name,
                key_path,
                auto_increment,
            } => {
                self.backing_store_transaction()?.create_object_store(
                    object_store_id,
                    &name,
                    key_path.as_ref(),
                    auto_increment,
                )?;
                self.connection
                    .database()
                    .add_object_store(IndexedDBObjectStoreMetadata::new(
                        object_store_id,
                        name,
                        key_path,
                        auto_increment,
                    ));
                Ok(())
            },
            Operation::DeleteObjectStore { object_store_id } => {
                self.backing_store_transaction()?
                    .delete_object_store(object_store_id)?;
                self.connection
                    .database()
                    .remove_object_store(object_store_id);
                Ok(())
            },
            Operation::CreateIndex {
                object_store_id,
                index,
            } => {
                self.backing_store_transaction()?
                    .create_index(object_store_id, &index)?;
                if !self.connection.database().add_index(object_store_id, index) {
                    return Err(BackendError::InvalidArgument(
                        "Invalid object_store_id.".to_owned(),
                    ));
                }
                Ok(())
            },
            Operation::DeleteIndex {
                object_store_id,
                index_id,
            } => {
                self.backing_store_transaction()?
                    .delete_index(object_store_id, index_id)?;
                self.connection
                    .database()
                    .remove_index(object_store_id, index_id);
                Ok(())
            },
            Operation::Put(put) => self.do_put(*put),
            Operation::SetIndexKeys {
                object_store_id,
                primary_key,
                index_keys,
            } => self.do_set_index_keys(object_store_id, primary_key, index_keys),
            Operation::SetIndexKeysDone => {
                self.did_complete_preemptive_event();
                Ok(())
            },
            Operation::Get {
                object_store_id,
                key,
                callback,
            } => {
                let Some(callback) = self.check_object_store_in_metadata(object_store_id, callback)
                else {
                    return Err(invalid_object_store_id());
                };
                let value = self
                    .backing_store_transaction()?
                    .get_record(object_store_id, &key)?;
                callback.run(Ok(value));
                Ok(())
            },
            Operation::Count {
                object_store_id,
                callback,
            } => {
                let Some(callback) = self.check_object_store_in_metadata(object_store_id, callback)
                else {
                    return Err(invalid_object_store_id());
                };
                let count = self
                    .backing_store_transaction()?
                    .count_records(object_store_id)?;
                callback.run(Ok(count));
                Ok(())
            },
            Operation::OpenCursor {
                object_store_id,
                task_type,
                callback,
            } => {
                let Some(callback) = self.check_object_store_in_metadata(object_store_id, callback)
                else {
                    return Err(invalid_object_store_id());
                };
                let records = self
                    .backing_store_transaction()?
                    .get_all_records(object_store_id)?;
                if task_type == TaskType::Preemptive {
                    self.add_pending_preemptive_event();
                }
                let cursor = Cursor::new(records);
                self.open_cursors.retain(WeakCursor::is_alive);
                self.open_cursors.push(cursor.downgrade());
                callback.run(Ok(cursor));
                Ok(())
            },
            Operation::Delete {
                object_store_id,
                key,
                callback,
            } => {
                let Some(callback) = self.check_object_store_in_metadata(object_store_id, callback)
                else {
                    return Err(invalid_object_store_id());
                };
                self.backing_store_transaction()?
                    .delete_record(object_store_id, &key)?;
                callback.run(Ok(()));
                self.notify_content_changed(object_store_id);
                Ok(())
            },
            Operation::Clear {
                object_store_id,
                callback,
            } => {
                let Some(callback) = self.check_object_store_in_metadata(object_store_id, callback)
                else {
                    return Err(invalid_object_store_id());
                };
                self.backing_store_transaction()?
                    .clear_object_store(object_store_id)?;
                callback.run(Ok(()));
                self.notify_content_changed(object_store_id);
                Ok(())
            },
        }
    }

    fn send_error<T>(&mut self, callback: RequestCallback<T>, code: IdbException, message: &str) {
        self.num_errors_sent += 1;
        callback.run(Err(DatabaseError::new(code, message)));
    }

    fn check_object_store_in_metadata<T>(
        &mut self,
        object_store_id: i64,
        callback: RequestCallback<T>,
    ) -> Option<RequestCallback<T>> {
        if self
            .connection
            .database()
            .metadata()
            .object_stores
            .contains_key(&object_store_id)
        {
            return Some(callback);
        }
        self.send_error(callback, IdbException::UnknownError, "Bad request");
        None
    }

    fn notify_content_changed(&self, object_store_id: i64) {
        let database = self.connection.database();
        let object_store_name = database
            .metadata()
            .object_stores
            .get(&object_store_id)
            .map(|object_store| object_store.name.clone());
        if let Some(object_store_name) = object_store_name {
            self.bucket_context
                .delegate()
                .on_content_changed(database.name(), &object_store_name);
        }
    }

    /// The next key of the store's generator, or `None` once it is exhausted.
    fn generate_auto_increment_key(&mut self, object_store_id: i64) -> Option<IndexedDBKeyType> {
        let current_number = match self
            .backing_store_transaction()
            .and_then(|transaction| transaction.get_key_generator_current_number(object_store_id))
        {
            Ok(current_number) => current_number,
            Err(err) => {
                error!("Failed to read the key generator of store {object_store_id}: {err}");
                return None;
            },
        };
        if current_number < 0 || current_number > MAX_KEY_GENERATOR_VALUE as i64 {
            return None;
        }
        Some(IndexedDBKeyType::Number(current_number as f64))
    }

    fn do_put(&mut self, put: PutOperation) -> BackendResult<()> {
        let PutOperation {
            object_store_id,
            value,
            key,
            put_mode,
            index_keys,
            callback,
        } = put;
        debug_assert_ne!(self.mode, IndexedDBTxnMode::Readonly);
        self.in_flight_memory = self.in_flight_memory.saturating_sub(value.size_estimate());

        let Some(object_store) = self
            .connection
            .database()
            .object_store_metadata(object_store_id)
        else {
            self.send_error(callback, IdbException::UnknownError, "Bad request");
            return Err(invalid_object_store_id());
        };

        let mut key_was_generated = false;
        let key = match key {
            None if put_mode != PutMode::CursorUpdate && object_store.auto_increment => {
                key_was_generated = true;
                match self.generate_auto_increment_key(object_store_id) {
                    Some(key) => key,
                    None => {
                        self.send_error(
                            callback,
                            IdbException::ConstraintError,
                            "Maximum key generator value reached.",
                        );
                        return Ok(());
                    },
                }
            },
            Some(key) if key.is_valid() => key,
            _ => return Err(BackendError::InvalidArgument("Invalid key".to_owned())),
        };

        if put_mode == PutMode::AddOnly {
            let preexisting_record = self
                .backing_store_transaction()?
                .key_exists_in_object_store(object_store_id, &key)?;
            if preexisting_record.is_some() {
                self.send_error(
                    callback,
                    IdbException::ConstraintError,
                    "Key already exists in the object store.",
                );
                return Ok(());
            }
        }

        let index_writers = match make_index_writers(
            self.backing_store_transaction()?,
            &object_store,
            &key,
            key_was_generated,
            index_keys,
        ) {
            Ok(Ok(index_writers)) => index_writers,
            Ok(Err(message)) => {
                self.send_error(callback, IdbException::ConstraintError, &message);
                return Ok(());
            },
            Err(err) => {
                warn!("Backing store error verifying index keys: {err}");
                self.send_error(
                    callback,
                    IdbException::UnknownError,
                    "Internal error: backing store error updating index keys.",
                );
                return Ok(());
            },
        };

        // Nothing was mutated before this point. Past it, errors abort the transaction.
        let transaction = self.backing_store_transaction()?;
        let new_record = transaction.put_record(object_store_id, &key, value)?;
        for writer in &index_writers {
            writer.write_index_keys(&new_record, transaction, object_store_id)?;
        }

        if object_store.auto_increment && put_mode != PutMode::CursorUpdate {
            if let Some(number) = key.as_number() {
                // `as` saturates, which keeps the generator at its ceiling.
                let new_max =
                    1_i64.saturating_add(number.min(MAX_KEY_GENERATOR_VALUE).floor() as i64);
                transaction.maybe_update_key_generator_current_number(
                    object_store_id,
                    new_max,
                    key_was_generated,
                )?;
            }
        }

        callback.run(Ok(key));
        self.bucket_context
            .delegate()
            .on_content_changed(self.connection.database().name(), &object_store.name);
        Ok(())
    }

    fn do_set_index_keys(
        &mut self,
        object_store_id: i64,
        primary_key: IndexedDBKeyType,
        index_keys: IndexedDBIndexKeys,
    ) -> BackendResult<()> {
        debug_assert_eq!(self.mode, IndexedDBTxnMode::Versionchange);

        let found_record = self
            .backing_store_transaction()?
            .key_exists_in_object_store(object_store_id, &primary_key)?;
        let object_store = self
            .connection
            .database()
            .object_store_metadata(object_store_id);
        let (Some(found_record), Some(object_store)) = (found_record, object_store) else {
            self.abort(DatabaseError::new(
                IdbException::UnknownError,
                "Internal error setting index keys for object store.",
            ));
            return Ok(());
        };

        let index_writers = match make_index_writers(
            self.backing_store_transaction()?,
            &object_store,
            &primary_key,
            false,
            vec![index_keys],
        ) {
            Ok(Ok(index_writers)) => index_writers,
            Ok(Err(message)) => {
                self.abort(DatabaseError::new(IdbException::ConstraintError, message));
                return Ok(());
            },
            Err(err) => {
                warn!("Backing store error verifying index keys: {err}");
                self.abort(DatabaseError::new(
                    IdbException::UnknownError,
                    "Internal error: backing store error updating index keys.",
                ));
                return Ok(());
            },
        };

        let transaction = self.backing_store_transaction()?;
        for writer in &index_writers {
            writer.write_index_keys(&found_record, transaction, object_store_id)?;
        }
        Ok(())
    }

    fn do_pending_commit(&mut self) -> BackendResult<()> {
        self.reset_timeout_timer();

        // An abort may already be under way.
        if self.state == TransactionState::Finished {
            return Ok(());
        }
        debug_assert_ne!(self.state, TransactionState::Committing);

        self.is_commit_pending = true;

        // Still waiting for locks; the commit happens after `start`.
        if self.state != TransactionState::Started {
            return Ok(());
        }

        if self.has_pending_tasks() {
            return Ok(());
        }

        // Errors the client did not handle could have changed what it
        // would have done, so committing is not safe.
        if self.num_errors_sent != self.num_errors_handled {
            self.is_commit_pending = false;
            self.abort(DatabaseError::new(IdbException::UnknownError, ""));
            return Ok(());
        }

        self.set_state(TransactionState::Committing);

        if !self.used {
            return self.commit_phase_two();
        }

        let receiver = self.backing_store_transaction()?.commit_phase_one()?;
        self.pending_blob_write = Some(receiver);
        // Engines with nothing to write have answered already.
        self.process_pending_completions()
    }

    fn blob_write_complete(&mut self, result: BlobWriteResult) -> BackendResult<()> {
        // Aborted while the blobs were being written.
        if self.state == TransactionState::Finished {
            return Ok(());
        }
        debug_assert_eq!(self.state, TransactionState::Committing);

        match result {
            Ok(()) => self.commit_phase_two(),
            Err(err) => {
                self.abort(DatabaseError::new(
                    IdbException::DataError,
                    format!("Failed to write blobs ({err})"),
                ));
                Ok(())
            },
        }
    }

    fn commit_phase_two(&mut self) -> BackendResult<()> {
        // Abort may have been called just as the blob write completed.
        if self.state == TransactionState::Finished {
            return Ok(());
        }
        debug_assert_eq!(self.state, TransactionState::Committing);

        let scheduling_priority_at_last_state_change =
            self.scheduling_priority_at_last_state_change;
        self.set_state(TransactionState::Finished);

        let result = if !self.used {
            Ok(())
        } else {
            let result = self
                .backing_store_transaction()
                .and_then(|transaction| transaction.commit_phase_two());

            // Includes the time spent committing to the backing store.
            if let Some(start_time) = self.diagnostics.start_time {
                let active_time = start_time.elapsed();
                let histogram = metrics::time_active_histogram(self.mode.as_str());
                let histograms = self.bucket_context.histograms();
                histograms.record_time(&histogram, active_time);
                if scheduling_priority_at_last_state_change == Some(0) {
                    histograms.record_time(&format!("{histogram}.Foreground"), active_time);
                }
            }
            result
        };

        if result.is_err() {
            if let Some(transaction) = self.backing_store_transaction.as_deref_mut() {
                transaction.rollback();
            }
            self.restore_metadata_snapshot();
        } else {
            self.metadata_snapshot = None;
        }

        // Cursors and the backing store transaction go before any callback
        // runs, as do the locks.
        self.close_open_cursors();
        self.backing_store_transaction = None;
        self.release_locks();

        match result {
            Ok(()) => {
                debug!("Transaction {} committed", self.id);
                if self.connection.is_connected() {
                    self.connection.callbacks().on_complete(self.id);
                }
                if self.mode != IndexedDBTxnMode::Readonly {
                    let did_sync = self.mode == IndexedDBTxnMode::Versionchange ||
                        self.durability == IndexedDBTxnDurability::Strict;
                    self.bucket_context.delegate().on_files_written(did_sync);
                }
                Ok(())
            },
            Err(err) => {
                let error = if err.indicates_disk_full() {
                    DatabaseError::new(
                        IdbException::QuotaError,
                        "Encountered disk full while committing transaction.",
                    )
                } else {
                    DatabaseError::new(
                        IdbException::UnknownError,
                        "Internal error committing transaction.",
                    )
                };
                warn!("Transaction {} failed to commit: {err}", self.id);
                if self.connection.is_connected() {
                    self.connection.callbacks().on_abort(self.id, &error);
                }
                Err(err)
            },
        }
    }

    /// Rolls back and reports `error` to the client. Does nothing once finished.
    pub fn abort(&mut self, error: DatabaseError) {
        if self.state == TransactionState::Finished {
            return;
        }
        debug!("Aborting transaction {}: {error}", self.id);

        self.bucket_context
            .histograms()
            .record_enumeration(metrics::ABORT_REASON, error.code.uma_value());

        self.aborted = true;
        self.reset_timeout_timer();

        self.set_state(TransactionState::Finished);

        if self.backing_store_transaction_begun {
            if let Some(transaction) = self.backing_store_transaction.as_deref_mut() {
                transaction.rollback();
            }
        }

        self.preemptive_task_queue.clear();
        self.pending_preemptive_events = 0;
        self.task_queue.clear();
        self.pending_quota_check = None;
        self.pending_blob_write = None;

        // Cursors hold backing store resources, release them before any callback.
        self.close_open_cursors();
        self.backing_store_transaction = None;

        // Completion unblocks other transactions, so it precedes the notification.
        self.release_locks();
        self.restore_metadata_snapshot();

        if self.connection.is_connected() {
            self.connection.callbacks().on_abort(self.id, &error);
        }

        self.bucket_context.queue_run_tasks();
    }

    fn restore_metadata_snapshot(&mut self) {
        if let Some(metadata) = self.metadata_snapshot.take() {
            self.connection.database().replace_metadata(metadata);
        }
    }

    fn close_open_cursors(&mut self) {
        for cursor in self.open_cursors.drain(..) {
            cursor.close();
        }
    }

    fn reset_timeout_timer(&mut self) {
        self.timeout_timer.stop();
        self.timeout_strikes = 0;
    }

    /// Fires the inactivity timer if its deadline has passed by `now`.
    pub fn poll_timeout(&mut self, now: Instant) {
        if self.state != TransactionState::Started || !self.timeout_timer.poll(now) {
            return;
        }
        self.timeout_fired();
    }

    fn timeout_fired(&mut self) {
        if !self.is_transaction_blocking_other_clients(true) {
            return;
        }

        self.timeout_strikes += 1;
        debug!("Transaction {} inactivity strike {}", self.id, self.timeout_strikes);
        if self.timeout_strikes >= self.bucket_context.prefs().max_timeout_strikes {
            self.abort(DatabaseError::new(
                IdbException::TimeoutError,
                "Transaction timed out due to inactivity.",
            ));
            self.reset_timeout_timer();
        }
    }

    /// Whether a request of another client waits on one of this transaction's
    /// locks. With `consider_priority`, a background client (priority above
    /// zero) does not count requests from clients throttled at least as much.
    pub fn is_transaction_blocking_other_clients(&self, consider_priority: bool) -> bool {
        debug_assert_eq!(self.state, TransactionState::Started);

        if self.connection.database().only_has_one_client() {
            return false;
        }

        let start = Instant::now();
        let this_priority = consider_priority.then(|| self.connection.scheduling_priority());
        let this_token = self.connection.client_token();
        let lock_manager = self.bucket_context.lock_manager();
        let is_blocking_others = lock_manager.is_blocking_any_request(&self.lock_ids, |blocked| {
            if let Some(this_priority) = this_priority {
                if this_priority > 0 && this_priority <= blocked.scheduling_priority {
                    return false;
                }
            }
            blocked.client_token != this_token
        });

        let duration = start.elapsed();
        if duration > self.bucket_context.prefs().blocking_status_long_time_threshold() {
            let histograms = self.bucket_context.histograms();
            histograms.record_time(metrics::BLOCKING_STATUS_LONG_TIMES, duration);
            histograms.record_count(
                metrics::BLOCKING_STATUS_QUEUE_SIZE,
                lock_manager.requests_waiting_for_metrics() as u64,
            );
        }
        is_blocking_others
    }

    pub fn internals_metadata(&self) -> TransactionInternals {
        let state = match self.state {
            TransactionState::Created => InternalsState::Blocked,
            TransactionState::Started if self.diagnostics.tasks_scheduled > 0 => {
                InternalsState::Running
            },
            TransactionState::Started => InternalsState::Started,
            TransactionState::Committing => InternalsState::Committing,
            TransactionState::Finished => InternalsState::Finished,
        };
        let database = self.connection.database();
        let metadata = database.metadata();
        TransactionInternals {
            tid: self.id,
            connection_id: self.connection.id().0,
            client_token: self.connection.client_token().to_string(),
            mode: self.mode,
            state,
            age_ms: self.diagnostics.creation_time.elapsed().as_secs_f64() * 1000.0,
            runtime_ms: self
                .diagnostics
                .start_time
                .map(|start_time| start_time.elapsed().as_secs_f64() * 1000.0),
            tasks_scheduled: self.diagnostics.tasks_scheduled,
            tasks_completed: self.diagnostics.tasks_completed,
            scope: self
                .object_store_ids
                .iter()
                .filter_map(|id| metadata.object_stores.get(id))
                .map(|object_store| object_store.name.clone())
                .collect(),
        }
    }
}

fn invalid_object_store_id() -> BackendError {
    BackendError::InvalidArgument("Invalid object_store_id.".to_owned())
}
