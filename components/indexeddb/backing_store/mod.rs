/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Storage engines a transaction commits into.

use std::fmt;

use indexeddb_traits::{
    BackendResult, IndexedDBDatabaseMetadata, IndexedDBIndexMetadata, IndexedDBKeyType,
    IndexedDBTxnDurability, IndexedDBTxnMode, IndexedDBValue, KeyPath,
};
use tokio::sync::oneshot;

mod blob_writer;
pub mod memory;
pub mod sqlite;

pub use self::blob_writer::{BlobWriterPool, PendingBlobFile};

/// Identifies a stored record so index entries can point back to it.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordIdentifier {
    pub primary_key: IndexedDBKeyType,
    pub number: i64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlobWriteError {
    Error,
    BadPath,
    InvalidBlob,
    IoError,
    TimestampError,
}

impl fmt::Display for BlobWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            BlobWriteError::Error => "Error",
            BlobWriteError::BadPath => "BadPath",
            BlobWriteError::InvalidBlob => "InvalidBlob",
            BlobWriteError::IoError => "IOError",
            BlobWriteError::TimestampError => "TimestampError",
        };
        f.write_str(reason)
    }
}

pub type BlobWriteResult = Result<(), BlobWriteError>;

/// Resolves once every external object of a transaction is durably written.
pub type BlobWriteReceiver = oneshot::Receiver<BlobWriteResult>;

pub(crate) fn ready_blob_write(result: BlobWriteResult) -> BlobWriteReceiver {
    let (sender, receiver) = oneshot::channel();
    let _ = sender.send(result);
    receiver
}

/// A single database's storage.
pub trait BackingStore {
    fn metadata(&self) -> BackendResult<IndexedDBDatabaseMetadata>;

    fn create_transaction(
        &self,
        mode: IndexedDBTxnMode,
        durability: IndexedDBTxnDurability,
    ) -> Box<dyn BackingStoreTransaction>;

    /// Engines that allow one writer at a time get an exclusive database lock
    /// for every readwrite transaction.
    fn serializes_write_transactions(&self) -> bool {
        false
    }
}

/// The storage side of one IndexedDB transaction.
///
/// Nothing is visible to other transactions before `commit_phase_two`
/// succeeds, and `rollback` discards everything since `begin`.
pub trait BackingStoreTransaction {
    fn mode(&self) -> IndexedDBTxnMode;

    fn begin(&mut self) -> BackendResult<()>;

    /// Flushes external objects. The receiver resolves when that is done.
    fn commit_phase_one(&mut self) -> BackendResult<BlobWriteReceiver>;

    fn commit_phase_two(&mut self) -> BackendResult<()>;

    fn rollback(&mut self);

    fn create_object_store(
        &mut self,
        object_store_id: i64,
        name: &str,
        key_path: Option<&KeyPath>,
        auto_increment: bool,
    ) -> BackendResult<()>;

    fn delete_object_store(&mut self, object_store_id: i64) -> BackendResult<()>;

    fn create_index(
        &mut self,
        object_store_id: i64,
        index: &IndexedDBIndexMetadata,
    ) -> BackendResult<()>;

    fn delete_index(&mut self, object_store_id: i64, index_id: i64) -> BackendResult<()>;

    /// Replaces any record stored under `key`, dropping its index entries.
    fn put_record(
        &mut self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
        value: IndexedDBValue,
    ) -> BackendResult<RecordIdentifier>;

    fn get_record(
        &mut self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
    ) -> BackendResult<Option<IndexedDBValue>>;

    fn delete_record(&mut self, object_store_id: i64, key: &IndexedDBKeyType)
    -> BackendResult<()>;

    fn clear_object_store(&mut self, object_store_id: i64) -> BackendResult<()>;

    fn count_records(&mut self, object_store_id: i64) -> BackendResult<u64>;

    /// Every record of the store, in key order.
    fn get_all_records(
        &mut self,
        object_store_id: i64,
    ) -> BackendResult<Vec<(IndexedDBKeyType, IndexedDBValue)>>;

    fn key_exists_in_object_store(
        &mut self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
    ) -> BackendResult<Option<RecordIdentifier>>;

    /// The primary key of the record `index_key` points at, if any.
    fn key_exists_in_index(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        index_key: &IndexedDBKeyType,
    ) -> BackendResult<Option<IndexedDBKeyType>>;

    fn put_index_data_for_record(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        index_key: &IndexedDBKeyType,
        record: &RecordIdentifier,
    ) -> BackendResult<()>;

    fn get_key_generator_current_number(&mut self, object_store_id: i64) -> BackendResult<i64>;

    /// Stores `new_number`, unless it was not generated and is not larger than
    /// the current number.
    fn maybe_update_key_generator_current_number(
        &mut self,
        object_store_id: i64,
        new_number: i64,
        was_generated: bool,
    ) -> BackendResult<()>;
}
