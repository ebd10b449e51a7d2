/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! A backing store that keeps everything in memory. Each transaction works on
//! private copies of the object stores it touches and publishes them when it
//! commits. Failures can be injected to exercise the commit paths.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use indexeddb_traits::{
    BackendError, BackendResult, IndexedDBDatabaseMetadata, IndexedDBIndexMetadata,
    IndexedDBKeyType, IndexedDBObjectStoreMetadata, IndexedDBTxnDurability, IndexedDBTxnMode,
    IndexedDBValue, KeyPath,
};
use log::debug;
use tokio::sync::oneshot;

use super::{
    BackingStore, BackingStoreTransaction, BlobWriteError, BlobWriteReceiver, BlobWriteResult,
    RecordIdentifier, ready_blob_write,
};

#[derive(Clone)]
struct StoredRecord {
    value: IndexedDBValue,
    number: i64,
}

#[derive(Clone)]
struct ObjectStoreData {
    records: BTreeMap<IndexedDBKeyType, StoredRecord>,
    /// Index id to index key to the primary keys it points at.
    indexes: BTreeMap<i64, BTreeMap<IndexedDBKeyType, BTreeSet<IndexedDBKeyType>>>,
    key_generator_current_number: i64,
    next_record_number: i64,
}

impl ObjectStoreData {
    fn new() -> ObjectStoreData {
        ObjectStoreData {
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
            key_generator_current_number: 1,
            next_record_number: 1,
        }
    }

    fn remove_index_entries_for(&mut self, primary_key: &IndexedDBKeyType) {
        for index in self.indexes.values_mut() {
            index.retain(|_, primary_keys| {
                primary_keys.remove(primary_key);
                !primary_keys.is_empty()
            });
        }
    }
}

#[derive(Default)]
struct MemoryState {
    metadata: IndexedDBDatabaseMetadata,
    object_stores: BTreeMap<i64, ObjectStoreData>,
    commit_failure: Option<BackendError>,
    blob_write_failure: Option<BlobWriteError>,
    defer_blob_writes: bool,
    deferred_blob_writes: Vec<oneshot::Sender<BlobWriteResult>>,
    committed_transactions: usize,
}

#[derive(Clone)]
pub struct MemoryBackingStore {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryBackingStore {
    pub fn new(database_name: &str) -> MemoryBackingStore {
        let state = MemoryState {
            metadata: IndexedDBDatabaseMetadata {
                name: database_name.to_owned(),
                ..Default::default()
            },
            ..Default::default()
        };
        MemoryBackingStore {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Makes the next second commit phase fail with `error` and discard its changes.
    pub fn fail_next_commit(&self, error: BackendError) {
        self.state.borrow_mut().commit_failure = Some(error);
    }

    /// Makes the next transaction writing external objects fail to write them.
    pub fn fail_next_blob_write(&self, error: BlobWriteError) {
        self.state.borrow_mut().blob_write_failure = Some(error);
    }

    /// Holds blob writes until `complete_deferred_blob_writes` is called.
    pub fn set_defer_blob_writes(&self, defer: bool) {
        self.state.borrow_mut().defer_blob_writes = defer;
    }

    pub fn complete_deferred_blob_writes(&self, result: BlobWriteResult) {
        let senders: Vec<_> = self.state.borrow_mut().deferred_blob_writes.drain(..).collect();
        for sender in senders {
            let _ = sender.send(result.clone());
        }
    }

    pub fn committed_transactions(&self) -> usize {
        self.state.borrow().committed_transactions
    }

    pub fn committed_value(
        &self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
    ) -> Option<IndexedDBValue> {
        self.state
            .borrow()
            .object_stores
            .get(&object_store_id)?
            .records
            .get(key)
            .map(|record| record.value.clone())
    }

    pub fn committed_key_generator_current_number(&self, object_store_id: i64) -> Option<i64> {
        self.state
            .borrow()
            .object_stores
            .get(&object_store_id)
            .map(|store| store.key_generator_current_number)
    }
}

impl BackingStore for MemoryBackingStore {
    fn metadata(&self) -> BackendResult<IndexedDBDatabaseMetadata> {
        Ok(self.state.borrow().metadata.clone())
    }

    fn create_transaction(
        &self,
        mode: IndexedDBTxnMode,
        _durability: IndexedDBTxnDurability,
    ) -> Box<dyn BackingStoreTransaction> {
        Box::new(MemoryTransaction {
            state: self.state.clone(),
            mode,
            begun: false,
            object_stores: BTreeMap::new(),
            metadata: None,
            wrote_external_objects: false,
        })
    }
}

pub struct MemoryTransaction {
    state: Rc<RefCell<MemoryState>>,
    mode: IndexedDBTxnMode,
    begun: bool,
    /// Private copies; `None` marks a deleted store.
    object_stores: BTreeMap<i64, Option<ObjectStoreData>>,
    metadata: Option<IndexedDBDatabaseMetadata>,
    wrote_external_objects: bool,
}

impl MemoryTransaction {
    fn object_store(&mut self, object_store_id: i64) -> BackendResult<&mut ObjectStoreData> {
        if !self.object_stores.contains_key(&object_store_id) {
            let copy = self.state.borrow().object_stores.get(&object_store_id).cloned();
            self.object_stores.insert(object_store_id, copy);
        }
        self.object_stores
            .get_mut(&object_store_id)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                BackendError::InvalidArgument(format!("no object store with id {object_store_id}"))
            })
    }

    fn metadata_mut(&mut self) -> &mut IndexedDBDatabaseMetadata {
        let state = &self.state;
        self.metadata
            .get_or_insert_with(|| state.borrow().metadata.clone())
    }

    fn check_writable(&self) -> BackendResult<()> {
        if self.mode == IndexedDBTxnMode::Readonly {
            return Err(BackendError::InternalInconsistency(
                "write in a readonly transaction".to_owned(),
            ));
        }
        Ok(())
    }
}

impl BackingStoreTransaction for MemoryTransaction {
    fn mode(&self) -> IndexedDBTxnMode {
        self.mode
    }

    fn begin(&mut self) -> BackendResult<()> {
        debug_assert!(!self.begun);
        self.begun = true;
        Ok(())
    }

    fn commit_phase_one(&mut self) -> BackendResult<BlobWriteReceiver> {
        if !self.wrote_external_objects {
            return Ok(ready_blob_write(Ok(())));
        }
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.blob_write_failure.take() {
            return Ok(ready_blob_write(Err(error)));
        }
        if state.defer_blob_writes {
            let (sender, receiver) = oneshot::channel();
            state.deferred_blob_writes.push(sender);
            return Ok(receiver);
        }
        Ok(ready_blob_write(Ok(())))
    }

    fn commit_phase_two(&mut self) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.commit_failure.take() {
            self.object_stores.clear();
            self.metadata = None;
            return Err(error);
        }
        if self.mode != IndexedDBTxnMode::Readonly {
            for (id, object_store) in std::mem::take(&mut self.object_stores) {
                match object_store {
                    Some(object_store) => state.object_stores.insert(id, object_store),
                    None => state.object_stores.remove(&id),
                };
            }
            if let Some(metadata) = self.metadata.take() {
                state.metadata = metadata;
            }
        }
        state.committed_transactions += 1;
        Ok(())
    }

    fn rollback(&mut self) {
        debug!("Rolling back in-memory transaction");
        self.object_stores.clear();
        self.metadata = None;
    }

    fn create_object_store(
        &mut self,
        object_store_id: i64,
        name: &str,
        key_path: Option<&KeyPath>,
        auto_increment: bool,
    ) -> BackendResult<()> {
        self.check_writable()?;
        let metadata = self.metadata_mut();
        if metadata.object_stores.contains_key(&object_store_id) {
            return Err(BackendError::InvalidArgument(format!(
                "object store {object_store_id} already exists"
            )));
        }
        metadata.max_object_store_id = metadata.max_object_store_id.max(object_store_id);
        metadata.object_stores.insert(
            object_store_id,
            IndexedDBObjectStoreMetadata::new(
                object_store_id,
                name.to_owned(),
                key_path.cloned(),
                auto_increment,
            ),
        );
        self.object_stores
            .insert(object_store_id, Some(ObjectStoreData::new()));
        Ok(())
    }

    fn delete_object_store(&mut self, object_store_id: i64) -> BackendResult<()> {
        self.check_writable()?;
        self.object_store(object_store_id)?;
        self.metadata_mut().object_stores.remove(&object_store_id);
        self.object_stores.insert(object_store_id, None);
        Ok(())
    }

    fn create_index(
        &mut self,
        object_store_id: i64,
        index: &IndexedDBIndexMetadata,
    ) -> BackendResult<()> {
        self.check_writable()?;
        self.object_store(object_store_id)?
            .indexes
            .insert(index.id, BTreeMap::new());
        if let Some(object_store) = self.metadata_mut().object_stores.get_mut(&object_store_id) {
            object_store.max_index_id = object_store.max_index_id.max(index.id);
            object_store.indexes.insert(index.id, index.clone());
        }
        Ok(())
    }

    fn delete_index(&mut self, object_store_id: i64, index_id: i64) -> BackendResult<()> {
        self.check_writable()?;
        self.object_store(object_store_id)?.indexes.remove(&index_id);
        if let Some(object_store) = self.metadata_mut().object_stores.get_mut(&object_store_id) {
            object_store.indexes.remove(&index_id);
        }
        Ok(())
    }

    fn put_record(
        &mut self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
        value: IndexedDBValue,
    ) -> BackendResult<RecordIdentifier> {
        self.check_writable()?;
        if !value.external_objects.is_empty() {
            self.wrote_external_objects = true;
        }
        let object_store = self.object_store(object_store_id)?;
        object_store.remove_index_entries_for(key);
        let number = object_store.next_record_number;
        object_store.next_record_number += 1;
        object_store
            .records
            .insert(key.clone(), StoredRecord { value, number });
        Ok(RecordIdentifier {
            primary_key: key.clone(),
            number,
        })
    }

    fn get_record(
        &mut self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
    ) -> BackendResult<Option<IndexedDBValue>> {
        Ok(self
            .object_store(object_store_id)?
            .records
            .get(key)
            .map(|record| record.value.clone()))
    }

    fn delete_record(
        &mut self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
    ) -> BackendResult<()> {
        self.check_writable()?;
        let object_store = self.object_store(object_store_id)?;
        object_store.records.remove(key);
        object_store.remove_index_entries_for(key);
        Ok(())
    }

    fn clear_object_store(&mut self, object_store_id: i64) -> BackendResult<()> {
        self.check_writable()?;
        let object_store = self.object_store(object_store_id)?;
        object_store.records.clear();
        object_store.indexes.values_mut().for_each(BTreeMap::clear);
        Ok(())
    }

    fn count_records(&mut self, object_store_id: i64) -> BackendResult<u64> {
        Ok(self.object_store(object_store_id)?.records.len() as u64)
    }

    fn get_all_records(
        &mut self,
        object_store_id: i64,
    ) -> BackendResult<Vec<(IndexedDBKeyType, IndexedDBValue)>> {
        Ok(self
            .object_store(object_store_id)?
            .records
            .iter()
            .map(|(key, record)| (key.clone(), record.value.clone()))
            .collect())
    }

    fn key_exists_in_object_store(
        &mut self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
    ) -> BackendResult<Option<RecordIdentifier>> {
        Ok(self
            .object_store(object_store_id)?
            .records
            .get(key)
            .map(|record| RecordIdentifier {
                primary_key: key.clone(),
                number: record.number,
            }))
    }

    fn key_exists_in_index(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        index_key: &IndexedDBKeyType,
    ) -> BackendResult<Option<IndexedDBKeyType>> {
        let object_store = self.object_store(object_store_id)?;
        let index = object_store.indexes.get(&index_id).ok_or_else(|| {
            BackendError::InvalidArgument(format!("no index with id {index_id}"))
        })?;
        Ok(index
            .get(index_key)
            .and_then(|primary_keys| primary_keys.first().cloned()))
    }

    fn put_index_data_for_record(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        index_key: &IndexedDBKeyType,
        record: &RecordIdentifier,
    ) -> BackendResult<()> {
        self.check_writable()?;
        let object_store = self.object_store(object_store_id)?;
        if !object_store.records.contains_key(&record.primary_key) {
            return Err(BackendError::InternalInconsistency(
                "index entry for a missing record".to_owned(),
            ));
        }
        object_store
            .indexes
            .entry(index_id)
            .or_default()
            .entry(index_key.clone())
            .or_default()
            .insert(record.primary_key.clone());
        Ok(())
    }

    fn get_key_generator_current_number(&mut self, object_store_id: i64) -> BackendResult<i64> {
        Ok(self
            .object_store(object_store_id)?
            .key_generator_current_number)
    }

    fn maybe_update_key_generator_current_number(
        &mut self,
        object_store_id: i64,
        new_number: i64,
        was_generated: bool,
    ) -> BackendResult<()> {
        self.check_writable()?;
        let object_store = self.object_store(object_store_id)?;
        if was_generated || new_number > object_store.key_generator_current_number {
            object_store.key_generator_current_number = new_number;
        }
        Ok(())
    }
}
