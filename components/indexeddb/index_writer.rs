/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use indexeddb_traits::{
    BackendResult, IndexedDBIndexKeys, IndexedDBIndexMetadata, IndexedDBKeyType,
    IndexedDBObjectStoreMetadata,
};

use crate::backing_store::{BackingStoreTransaction, RecordIdentifier};

/// Writes the entries of one index for one record. Uniqueness is checked
/// before the record is stored, the entries are written after.
pub(crate) struct IndexWriter {
    index: IndexedDBIndexMetadata,
    keys: Vec<IndexedDBKeyType>,
}

impl IndexWriter {
    fn new(index: IndexedDBIndexMetadata, keys: Vec<IndexedDBKeyType>) -> IndexWriter {
        IndexWriter { index, keys }
    }

    /// `Ok(Err(message))` when a key is already taken by another record in a unique index.
    fn verify_index_keys(
        &self,
        transaction: &mut dyn BackingStoreTransaction,
        object_store_id: i64,
        primary_key: &IndexedDBKeyType,
    ) -> BackendResult<Result<(), String>> {
        for key in &self.keys {
            if !self.adding_key_allowed(transaction, object_store_id, key, primary_key)? {
                return Ok(Err(format!(
                    "Unable to add key to index '{}': at least one key does not satisfy the \
                     uniqueness requirements.",
                    self.index.name
                )));
            }
        }
        Ok(Ok(()))
    }

    fn adding_key_allowed(
        &self,
        transaction: &mut dyn BackingStoreTransaction,
        object_store_id: i64,
        index_key: &IndexedDBKeyType,
        primary_key: &IndexedDBKeyType,
    ) -> BackendResult<bool> {
        if !self.index.unique {
            return Ok(true);
        }
        let found =
            transaction.key_exists_in_index(object_store_id, self.index.id, index_key)?;
        // A record may keep its own key when it is overwritten.
        Ok(found.is_none_or(|found_primary_key| found_primary_key == *primary_key))
    }

    pub(crate) fn write_index_keys(
        &self,
        record: &RecordIdentifier,
        transaction: &mut dyn BackingStoreTransaction,
        object_store_id: i64,
    ) -> BackendResult<()> {
        for key in &self.keys {
            transaction.put_index_data_for_record(object_store_id, self.index.id, key, record)?;
        }
        Ok(())
    }
}

/// Builds a verified writer per index. `Ok(Err(message))` reports a
/// constraint violation; nothing has been written in that case.
pub(crate) fn make_index_writers(
    transaction: &mut dyn BackingStoreTransaction,
    object_store: &IndexedDBObjectStoreMetadata,
    primary_key: &IndexedDBKeyType,
    key_was_generated: bool,
    index_keys: Vec<IndexedDBIndexKeys>,
) -> BackendResult<Result<Vec<IndexWriter>, String>> {
    let mut writers = Vec::with_capacity(index_keys.len());
    for IndexedDBIndexKeys { index_id, mut keys } in index_keys {
        let Some(index) = object_store.indexes.get(&index_id) else {
            continue;
        };
        // The client could not know a generated key, so indexes on the
        // store's own key path get it here.
        if key_was_generated && Some(&index.key_path) == object_store.key_path.as_ref() {
            keys.push(primary_key.clone());
        }
        keys.retain(IndexedDBKeyType::is_valid);

        let writer = IndexWriter::new(index.clone(), keys);
        if let Err(message) = writer.verify_index_keys(transaction, object_store.id, primary_key)? {
            return Ok(Err(message));
        }
        writers.push(writer);
    }
    Ok(Ok(writers))
}
