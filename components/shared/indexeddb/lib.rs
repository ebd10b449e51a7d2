/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Types shared between the IndexedDB backend and its clients.

mod error;
mod key;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use crate::error::{BackendError, BackendResult, DatabaseError, IdbException};
pub use crate::key::{IndexedDBKeyType, KeyPath, MAX_KEY_GENERATOR_VALUE};

/// <https://w3c.github.io/IndexedDB/#transaction-mode>
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IndexedDBTxnMode {
    Readonly,
    Readwrite,
    Versionchange,
}

impl IndexedDBTxnMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexedDBTxnMode::Readonly => "ReadOnly",
            IndexedDBTxnMode::Readwrite => "ReadWrite",
            IndexedDBTxnMode::Versionchange => "VersionChange",
        }
    }
}

/// <https://w3c.github.io/IndexedDB/#transaction-durability-hint>
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum IndexedDBTxnDurability {
    #[default]
    Relaxed,
    Strict,
}

/// How a put treats an existing record under the same key.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PutMode {
    AddOrUpdate,
    AddOnly,
    CursorUpdate,
}

/// Which queue of a transaction a task lands in.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TaskType {
    Normal,
    /// Runs before any normal task that is still queued.
    Preemptive,
}

/// Data that is stored next to a value rather than inside it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum ExternalObject {
    Blob {
        uuid: uuid::Uuid,
        mime_type: String,
        bytes: Vec<u8>,
    },
    File {
        uuid: uuid::Uuid,
        name: String,
        mime_type: String,
        last_modified: i64,
        bytes: Vec<u8>,
    },
    FileSystemAccessHandle {
        token: Vec<u8>,
    },
}

impl ExternalObject {
    pub fn size(&self) -> u64 {
        match self {
            ExternalObject::Blob { bytes, .. } | ExternalObject::File { bytes, .. } => {
                bytes.len() as u64
            },
            ExternalObject::FileSystemAccessHandle { token } => token.len() as u64,
        }
    }
}

/// A serialized script value together with its external objects.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct IndexedDBValue {
    pub bits: Vec<u8>,
    pub external_objects: Vec<ExternalObject>,
}

impl IndexedDBValue {
    pub fn new(bits: Vec<u8>) -> IndexedDBValue {
        IndexedDBValue {
            bits,
            external_objects: vec![],
        }
    }

    pub fn size_estimate(&self) -> u64 {
        self.bits.len() as u64 + self.external_objects_size()
    }

    pub fn external_objects_size(&self) -> u64 {
        self.external_objects.iter().map(ExternalObject::size).sum()
    }
}

/// Keys a client extracted from a value for one index.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IndexedDBIndexKeys {
    pub index_id: i64,
    pub keys: Vec<IndexedDBKeyType>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IndexedDBIndexMetadata {
    pub id: i64,
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IndexedDBObjectStoreMetadata {
    pub id: i64,
    pub name: String,
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
    pub max_index_id: i64,
    pub indexes: BTreeMap<i64, IndexedDBIndexMetadata>,
}

impl IndexedDBObjectStoreMetadata {
    pub fn new(
        id: i64,
        name: String,
        key_path: Option<KeyPath>,
        auto_increment: bool,
    ) -> IndexedDBObjectStoreMetadata {
        IndexedDBObjectStoreMetadata {
            id,
            name,
            key_path,
            auto_increment,
            max_index_id: 0,
            indexes: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct IndexedDBDatabaseMetadata {
    pub name: String,
    pub version: u64,
    pub max_object_store_id: i64,
    pub object_stores: BTreeMap<i64, IndexedDBObjectStoreMetadata>,
}
