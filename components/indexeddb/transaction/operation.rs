/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fmt;

use indexeddb_traits::{
    DatabaseError, IdbException, IndexedDBIndexKeys, IndexedDBIndexMetadata, IndexedDBKeyType,
    IndexedDBValue, KeyPath, PutMode, TaskType,
};

use crate::cursor::Cursor;

type Callback<T> = Box<dyn FnOnce(Result<T, DatabaseError>)>;

/// Completes one client request. If it is dropped without having run, for
/// example because the transaction aborted and cleared its queues, the client
/// is told the request was aborted.
pub struct RequestCallback<T> {
    callback: Option<Callback<T>>,
}

impl<T> RequestCallback<T> {
    pub fn new<F>(callback: F) -> RequestCallback<T>
    where
        F: FnOnce(Result<T, DatabaseError>) + 'static,
    {
        RequestCallback {
            callback: Some(Box::new(callback)),
        }
    }

    pub(crate) fn run(mut self, result: Result<T, DatabaseError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl<T> Drop for RequestCallback<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(DatabaseError::new(
                IdbException::AbortError,
                "The transaction was aborted.",
            )));
        }
    }
}

pub struct PutOperation {
    pub object_store_id: i64,
    pub value: IndexedDBValue,
    /// `None` asks the store's key generator for a key.
    pub key: Option<IndexedDBKeyType>,
    pub put_mode: PutMode,
    pub index_keys: Vec<IndexedDBIndexKeys>,
    pub callback: RequestCallback<IndexedDBKeyType>,
}

/// A unit of deferred work of a transaction.
pub enum Operation {
    CreateObjectStore {
        object_store_id: i64,
        name: String,
        key_path: Option<KeyPath>,
        auto_increment: bool,
    },
    DeleteObjectStore {
        object_store_id: i64,
    },
    CreateIndex {
        object_store_id: i64,
        index: IndexedDBIndexMetadata,
    },
    DeleteIndex {
        object_store_id: i64,
        index_id: i64,
    },
    Put(Box<PutOperation>),
    SetIndexKeys {
        object_store_id: i64,
        primary_key: IndexedDBKeyType,
        index_keys: IndexedDBIndexKeys,
    },
    /// The client finished populating an index.
    SetIndexKeysDone,
    Get {
        object_store_id: i64,
        key: IndexedDBKeyType,
        callback: RequestCallback<Option<IndexedDBValue>>,
    },
    Delete {
        object_store_id: i64,
        key: IndexedDBKeyType,
        callback: RequestCallback<()>,
    },
    Clear {
        object_store_id: i64,
        callback: RequestCallback<()>,
    },
    Count {
        object_store_id: i64,
        callback: RequestCallback<u64>,
    },
    OpenCursor {
        object_store_id: i64,
        task_type: TaskType,
        callback: RequestCallback<Cursor>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationKind {
    CreateObjectStore,
    DeleteObjectStore,
    CreateIndex,
    DeleteIndex,
    Put,
    SetIndexKeys,
    SetIndexKeysDone,
    Get,
    Delete,
    Clear,
    Count,
    OpenCursor,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateObjectStore { .. } => OperationKind::CreateObjectStore,
            Operation::DeleteObjectStore { .. } => OperationKind::DeleteObjectStore,
            Operation::CreateIndex { .. } => OperationKind::CreateIndex,
            Operation::DeleteIndex { .. } => OperationKind::DeleteIndex,
            Operation::Put(_) => OperationKind::Put,
            Operation::SetIndexKeys { .. } => OperationKind::SetIndexKeys,
            Operation::SetIndexKeysDone => OperationKind::SetIndexKeysDone,
            Operation::Get { .. } => OperationKind::Get,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::Clear { .. } => OperationKind::Clear,
            Operation::Count { .. } => OperationKind::Count,
            Operation::OpenCursor { .. } => OperationKind::OpenCursor,
        }
    }

    pub fn object_store_id(&self) -> Option<i64> {
        match self {
            Operation::CreateObjectStore {
                object_store_id, ..
            } |
            Operation::DeleteObjectStore { object_store_id } |
            Operation::CreateIndex {
                object_store_id, ..
            } |
            Operation::DeleteIndex {
                object_store_id, ..
            } |
            Operation::SetIndexKeys {
                object_store_id, ..
            } |
            Operation::Get {
                object_store_id, ..
            } |
            Operation::Delete {
                object_store_id, ..
            } |
            Operation::Clear {
                object_store_id, ..
            } |
            Operation::Count {
                object_store_id, ..
            } |
            Operation::OpenCursor {
                object_store_id, ..
            } => Some(*object_store_id),
            Operation::Put(put) => Some(put.object_store_id),
            Operation::SetIndexKeysDone => None,
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Operation");
        debug.field("kind", &self.kind());
        if let Some(object_store_id) = self.object_store_id() {
            debug.field("object_store_id", &object_store_id);
        }
        debug.finish()
    }
}
