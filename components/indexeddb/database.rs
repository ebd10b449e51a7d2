/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Ref, RefCell};

use indexeddb_traits::{
    IndexedDBDatabaseMetadata, IndexedDBIndexMetadata, IndexedDBObjectStoreMetadata,
};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::lock_manager::PartitionedLockId;

/// One named database in a bucket: its metadata and the clients connected to it.
pub struct Database {
    name: String,
    id_for_locks: u64,
    metadata: RefCell<IndexedDBDatabaseMetadata>,
    /// Open connection count per client token.
    clients: RefCell<FxHashMap<Uuid, usize>>,
}

impl Database {
    pub fn new(id_for_locks: u64, metadata: IndexedDBDatabaseMetadata) -> Database {
        Database {
            name: metadata.name.clone(),
            id_for_locks,
            metadata: RefCell::new(metadata),
            clients: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_for_locks(&self) -> u64 {
        self.id_for_locks
    }

    pub fn lock_id(&self) -> PartitionedLockId {
        PartitionedLockId::database(&self.name)
    }

    pub fn object_store_lock_id(&self, object_store_id: i64) -> PartitionedLockId {
        PartitionedLockId::object_store(self.id_for_locks, object_store_id)
    }

    pub fn metadata(&self) -> Ref<'_, IndexedDBDatabaseMetadata> {
        self.metadata.borrow()
    }

    pub fn replace_metadata(&self, metadata: IndexedDBDatabaseMetadata) {
        *self.metadata.borrow_mut() = metadata;
    }

    pub fn object_store_metadata(
        &self,
        object_store_id: i64,
    ) -> Option<IndexedDBObjectStoreMetadata> {
        self.metadata
            .borrow()
            .object_stores
            .get(&object_store_id)
            .cloned()
    }

    pub fn add_object_store(&self, object_store: IndexedDBObjectStoreMetadata) {
        let mut metadata = self.metadata.borrow_mut();
        metadata.max_object_store_id = metadata.max_object_store_id.max(object_store.id);
        metadata.object_stores.insert(object_store.id, object_store);
    }

    pub fn remove_object_store(
        &self,
        object_store_id: i64,
    ) -> Option<IndexedDBObjectStoreMetadata> {
        self.metadata
            .borrow_mut()
            .object_stores
            .remove(&object_store_id)
    }

    pub fn add_index(&self, object_store_id: i64, index: IndexedDBIndexMetadata) -> bool {
        let mut metadata = self.metadata.borrow_mut();
        let Some(object_store) = metadata.object_stores.get_mut(&object_store_id) else {
            return false;
        };
        object_store.max_index_id = object_store.max_index_id.max(index.id);
        object_store.indexes.insert(index.id, index);
        true
    }

    pub fn remove_index(&self, object_store_id: i64, index_id: i64) -> bool {
        self.metadata
            .borrow_mut()
            .object_stores
            .get_mut(&object_store_id)
            .and_then(|object_store| object_store.indexes.remove(&index_id))
            .is_some()
    }

    pub(crate) fn add_client(&self, client_token: Uuid) {
        *self.clients.borrow_mut().entry(client_token).or_default() += 1;
    }

    pub(crate) fn remove_client(&self, client_token: Uuid) {
        let mut clients = self.clients.borrow_mut();
        if let Some(count) = clients.get_mut(&client_token) {
            *count -= 1;
            if *count == 0 {
                clients.remove(&client_token);
            }
        }
    }

    pub fn only_has_one_client(&self) -> bool {
        self.clients.borrow().len() <= 1
    }
}
