/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use indexeddb_traits::{
    BackendError, BackendResult, ExternalObject, IndexedDBDatabaseMetadata,
    IndexedDBIndexMetadata, IndexedDBKeyType, IndexedDBObjectStoreMetadata,
    IndexedDBTxnDurability, IndexedDBTxnMode, IndexedDBValue, KeyPath,
};
use log::{debug, error, info, warn};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Origin;
use uuid::Uuid;

use super::blob_writer::PendingBlobFile;
use super::{
    BackingStore, BackingStoreTransaction, BlobWriteReceiver, BlobWriterPool, RecordIdentifier,
};

mod create;

// These pragmas need to be set once
const DB_INIT_PRAGMAS: [&str; 2] = ["PRAGMA journal_mode = WAL;", "PRAGMA encoding = 'UTF-16';"];

// These pragmas need to be run once per connection.
const DB_PRAGMAS: [&str; 3] = [
    "PRAGMA journal_size_limit = 67108864 -- 64 megabytes;",
    "PRAGMA mmap_size = 67108864 -- 64 megabytes;",
    "PRAGMA cache_size = 2000;",
];

pub(crate) fn is_sqlite_disk_full_error(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::DiskFull)
}

pub(crate) fn backend_error_from_sqlite_error(err: rusqlite::Error) -> BackendError {
    if is_sqlite_disk_full_error(&err) {
        BackendError::QuotaExceeded
    } else {
        BackendError::DbErr(format!("{err:?}"))
    }
}

fn serialize<T: Serialize + ?Sized>(value: &T) -> BackendResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|err| BackendError::DbErr(err.to_string()))
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> BackendResult<T> {
    postcard::from_bytes(bytes).map_err(|err| BackendError::DbErr(err.to_string()))
}

/// Which database of which origin a store holds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexedDBDescription {
    pub origin: Origin,
    pub name: String,
}

impl IndexedDBDescription {
    // Randomly generated namespace for our purposes
    const NAMESPACE_SERVO_IDB: &uuid::Uuid = &Uuid::from_bytes([
        0x37, 0x9e, 0x56, 0xb0, 0x1a, 0x76, 0x44, 0xc2, 0xa0, 0xdb, 0xe2, 0x18, 0xc5, 0xc8, 0xa3,
        0x5d,
    ]);

    // Converts the database description to a folder name where all
    // data for this database is stored
    pub(crate) fn as_path(&self) -> PathBuf {
        let mut path = PathBuf::new();

        // uuid v5 is deterministic
        let origin_uuid = Uuid::new_v5(
            Self::NAMESPACE_SERVO_IDB,
            self.origin.ascii_serialization().as_bytes(),
        );
        let db_name_uuid = Uuid::new_v5(Self::NAMESPACE_SERVO_IDB, self.name.as_bytes());
        path.push(origin_uuid.to_string());
        path.push(db_name_uuid.to_string());

        path
    }
}

pub struct SqliteBackingStore {
    db_path: PathBuf,
    blob_path: PathBuf,
    connection: Rc<Connection>,
    blob_writer: Arc<BlobWriterPool>,
}

impl SqliteBackingStore {
    pub fn open(
        base_dir: &Path,
        db_info: &IndexedDBDescription,
        blob_writer: Arc<BlobWriterPool>,
    ) -> BackendResult<Self> {
        let db_parent = base_dir.join(db_info.as_path());
        let db_path = db_parent.join("db.sqlite");
        let blob_path = db_parent.join("blobs");

        if !db_path.exists() {
            fs::create_dir_all(&db_parent)
                .map_err(|err| BackendError::DbErr(format!("{err:?}")))?;
        }
        let connection =
            Self::init_db(&db_path, db_info).map_err(backend_error_from_sqlite_error)?;

        for stmt in DB_PRAGMAS {
            if let Err(err) = connection.execute_batch(stmt) {
                warn!("Failed to apply {stmt}: {err:?}");
            }
        }

        Ok(Self {
            db_path,
            blob_path,
            connection: Rc::new(connection),
            blob_writer,
        })
    }

    fn init_db(path: &Path, db_info: &IndexedDBDescription) -> Result<Connection, rusqlite::Error> {
        let connection = Connection::open(path)?;
        if connection.table_exists(None, "database")? {
            // Database already exists, no need to initialize
            return Ok(connection);
        }
        info!("Initializing indexeddb database at {:?}", path);
        for stmt in DB_INIT_PRAGMAS {
            if let Err(err) = connection.execute_batch(stmt) {
                warn!("Failed to apply {stmt}: {err:?}");
            }
        }
        create::create_tables(&connection)?;
        connection.execute(
            "INSERT INTO database (name, origin, version) VALUES (?, ?, ?)",
            params![
                db_info.name.to_owned(),
                db_info.origin.ascii_serialization(),
                0_i64
            ],
        )?;
        Ok(connection)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn version(&self) -> BackendResult<u64> {
        self.connection
            .query_row("SELECT version FROM database LIMIT 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|version| u64::from_ne_bytes(version.to_ne_bytes()))
            .map_err(backend_error_from_sqlite_error)
    }

    fn load_indexes(
        &self,
        object_store_id: i64,
    ) -> BackendResult<BTreeMap<i64, IndexedDBIndexMetadata>> {
        let mut stmt = self
            .connection
            .prepare(
                "SELECT id, name, key_path, unique_index, multi_entry_index \
                 FROM object_store_index WHERE object_store_id = ?",
            )
            .map_err(backend_error_from_sqlite_error)?;
        let rows = stmt
            .query_map(params![object_store_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })
            .map_err(backend_error_from_sqlite_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend_error_from_sqlite_error)?;

        rows.into_iter()
            .map(|(id, name, key_path, unique, multi_entry)| {
                Ok((
                    id,
                    IndexedDBIndexMetadata {
                        id,
                        name,
                        key_path: deserialize::<KeyPath>(&key_path)?,
                        unique,
                        multi_entry,
                    },
                ))
            })
            .collect()
    }
}

impl BackingStore for SqliteBackingStore {
    fn metadata(&self) -> BackendResult<IndexedDBDatabaseMetadata> {
        let name = self
            .connection
            .query_row("SELECT name FROM database LIMIT 1", [], |row| {
                row.get::<_, String>(0)
            })
            .map_err(backend_error_from_sqlite_error)?;
        let mut stmt = self
            .connection
            .prepare("SELECT id, name, key_path, auto_increment FROM object_store")
            .map_err(backend_error_from_sqlite_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })
            .map_err(backend_error_from_sqlite_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend_error_from_sqlite_error)?;

        let mut metadata = IndexedDBDatabaseMetadata {
            name,
            version: self.version()?,
            ..Default::default()
        };
        for (id, name, key_path, auto_increment) in rows {
            let key_path = key_path
                .map(|bytes| deserialize::<KeyPath>(&bytes))
                .transpose()?;
            let mut object_store =
                IndexedDBObjectStoreMetadata::new(id, name, key_path, auto_increment);
            object_store.indexes = self.load_indexes(id)?;
            object_store.max_index_id = object_store.indexes.keys().copied().max().unwrap_or(0);
            metadata.max_object_store_id = metadata.max_object_store_id.max(id);
            metadata.object_stores.insert(id, object_store);
        }
        Ok(metadata)
    }

    fn create_transaction(
        &self,
        mode: IndexedDBTxnMode,
        durability: IndexedDBTxnDurability,
    ) -> Box<dyn BackingStoreTransaction> {
        Box::new(SqliteTransaction {
            connection: self.connection.clone(),
            blob_path: self.blob_path.clone(),
            blob_writer: self.blob_writer.clone(),
            mode,
            durability,
            in_sql_transaction: false,
            pending_blobs: vec![],
            written_blobs: vec![],
            orphaned_blobs: vec![],
        })
    }

    fn serializes_write_transactions(&self) -> bool {
        true
    }
}

pub struct SqliteTransaction {
    connection: Rc<Connection>,
    blob_path: PathBuf,
    blob_writer: Arc<BlobWriterPool>,
    mode: IndexedDBTxnMode,
    durability: IndexedDBTxnDurability,
    in_sql_transaction: bool,
    /// Blob data of this transaction's puts, written out in the first commit phase.
    pending_blobs: Vec<PendingBlobFile>,
    written_blobs: Vec<PathBuf>,
    /// Blob files of replaced or deleted records, removed once committed.
    orphaned_blobs: Vec<PathBuf>,
}

impl SqliteTransaction {
    fn ensure_object_store(&self, object_store_id: i64) -> BackendResult<()> {
        let exists = self
            .connection
            .query_row(
                "SELECT 1 FROM object_store WHERE id = ?",
                params![object_store_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(backend_error_from_sqlite_error)?;
        exists.ok_or_else(|| {
            BackendError::InvalidArgument(format!("no object store with id {object_store_id}"))
        })
    }

    fn check_writable(&self) -> BackendResult<()> {
        if !self.in_sql_transaction {
            return Err(BackendError::InternalInconsistency(format!(
                "write outside of a {} transaction",
                self.mode.as_str()
            )));
        }
        Ok(())
    }

    fn execute(&self, sql: &str, params: impl rusqlite::Params) -> BackendResult<usize> {
        self.connection
            .execute(sql, params)
            .map_err(backend_error_from_sqlite_error)
    }

    /// Moves blob bytes out of the value into pending files; the stored copy
    /// keeps only the metadata.
    fn stage_external_objects(
        &mut self,
        external_objects: Vec<ExternalObject>,
    ) -> Vec<ExternalObject> {
        external_objects
            .into_iter()
            .map(|object| match object {
                ExternalObject::Blob {
                    uuid,
                    mime_type,
                    bytes,
                } => {
                    self.pending_blobs.push(PendingBlobFile {
                        path: self.blob_path.join(uuid.to_string()),
                        bytes,
                    });
                    ExternalObject::Blob {
                        uuid,
                        mime_type,
                        bytes: vec![],
                    }
                },
                ExternalObject::File {
                    uuid,
                    name,
                    mime_type,
                    last_modified,
                    bytes,
                } => {
                    self.pending_blobs.push(PendingBlobFile {
                        path: self.blob_path.join(uuid.to_string()),
                        bytes,
                    });
                    ExternalObject::File {
                        uuid,
                        name,
                        mime_type,
                        last_modified,
                        bytes: vec![],
                    }
                },
                handle @ ExternalObject::FileSystemAccessHandle { .. } => handle,
            })
            .collect()
    }

    /// Remembers the blob files of the rows `sql` selects, which are about to go away.
    fn orphan_blob_files(&mut self, sql: &str, params: impl rusqlite::Params) -> BackendResult<()> {
        let mut stmt = self
            .connection
            .prepare(sql)
            .map_err(backend_error_from_sqlite_error)?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, Vec<u8>>(0))
            .map_err(backend_error_from_sqlite_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend_error_from_sqlite_error)?;
        for external_objects in rows {
            for object in deserialize::<Vec<ExternalObject>>(&external_objects)? {
                let uuid = match object {
                    ExternalObject::Blob { uuid, .. } | ExternalObject::File { uuid, .. } => uuid,
                    ExternalObject::FileSystemAccessHandle { .. } => continue,
                };
                let path = self.blob_path.join(uuid.to_string());
                // Staged by this transaction and never written.
                self.pending_blobs.retain(|file| file.path != path);
                self.orphaned_blobs.push(path);
            }
        }
        Ok(())
    }

    fn load_blob_bytes(&self, uuid: &Uuid) -> BackendResult<Vec<u8>> {
        let path = self.blob_path.join(uuid.to_string());
        if let Some(pending) = self.pending_blobs.iter().find(|file| file.path == path) {
            return Ok(pending.bytes.clone());
        }
        fs::read(&path).map_err(|err| BackendError::DbErr(format!("{err:?}")))
    }

    fn decode_value(
        &self,
        data: Vec<u8>,
        external_objects: &[u8],
    ) -> BackendResult<IndexedDBValue> {
        let external_objects = deserialize::<Vec<ExternalObject>>(external_objects)?
            .into_iter()
            .map(|object| {
                Ok(match object {
                    ExternalObject::Blob {
                        uuid, mime_type, ..
                    } => ExternalObject::Blob {
                        bytes: self.load_blob_bytes(&uuid)?,
                        uuid,
                        mime_type,
                    },
                    ExternalObject::File {
                        uuid,
                        name,
                        mime_type,
                        last_modified,
                        ..
                    } => ExternalObject::File {
                        bytes: self.load_blob_bytes(&uuid)?,
                        uuid,
                        name,
                        mime_type,
                        last_modified,
                    },
                    handle @ ExternalObject::FileSystemAccessHandle { .. } => handle,
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(IndexedDBValue {
            bits: data,
            external_objects,
        })
    }
}

impl BackingStoreTransaction for SqliteTransaction {
    fn mode(&self) -> IndexedDBTxnMode {
        self.mode
    }

    fn begin(&mut self) -> BackendResult<()> {
        if self.mode == IndexedDBTxnMode::Readonly {
            return Ok(());
        }
        let synchronous = match self.durability {
            IndexedDBTxnDurability::Strict => "PRAGMA synchronous = FULL;",
            IndexedDBTxnDurability::Relaxed => "PRAGMA synchronous = NORMAL;",
        };
        self.connection
            .execute_batch(synchronous)
            .map_err(backend_error_from_sqlite_error)?;
        self.connection
            .execute_batch("BEGIN IMMEDIATE;")
            .map_err(backend_error_from_sqlite_error)?;
        self.in_sql_transaction = true;
        Ok(())
    }

    fn commit_phase_one(&mut self) -> BackendResult<BlobWriteReceiver> {
        let files = std::mem::take(&mut self.pending_blobs);
        debug!("Writing {} blob files", files.len());
        self.written_blobs
            .extend(files.iter().map(|file| file.path.clone()));
        Ok(self.blob_writer.write_files(files))
    }

    fn commit_phase_two(&mut self) -> BackendResult<()> {
        if !self.in_sql_transaction {
            return Ok(());
        }
        // A failed COMMIT can leave the transaction open for `rollback`.
        self.connection
            .execute_batch("COMMIT;")
            .map_err(backend_error_from_sqlite_error)?;
        self.in_sql_transaction = false;

        let written_blobs = std::mem::take(&mut self.written_blobs);
        for path in self.orphaned_blobs.drain(..) {
            // Rewritten by a later put with the same blob.
            if written_blobs.contains(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {},
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => warn!("Failed to delete blob file {path:?}: {err:?}"),
            }
        }
        Ok(())
    }

    fn rollback(&mut self) {
        if self.in_sql_transaction {
            self.in_sql_transaction = false;
            // SQLite rolls back by itself after some failures.
            if !self.connection.is_autocommit() {
                if let Err(err) = self.connection.execute_batch("ROLLBACK;") {
                    error!("Rollback failed: {err:?}");
                }
            }
        }
        self.pending_blobs.clear();
        self.orphaned_blobs.clear();
        for path in self.written_blobs.drain(..) {
            let _ = fs::remove_file(path);
        }
    }

    fn create_object_store(
        &mut self,
        object_store_id: i64,
        name: &str,
        key_path: Option<&KeyPath>,
        auto_increment: bool,
    ) -> BackendResult<()> {
        self.check_writable()?;
        let key_path = key_path.map(serialize).transpose()?;
        self.execute(
            "INSERT INTO object_store (id, name, key_path, auto_increment) VALUES (?, ?, ?, ?)",
            params![object_store_id, name, key_path, auto_increment],
        )?;
        Ok(())
    }

    fn delete_object_store(&mut self, object_store_id: i64) -> BackendResult<()> {
        self.check_writable()?;
        self.ensure_object_store(object_store_id)?;
        self.orphan_blob_files(
            "SELECT external_objects FROM object_data WHERE object_store_id = ?",
            params![object_store_id],
        )?;
        for sql in [
            "DELETE FROM index_data WHERE object_store_id = ?",
            "DELETE FROM object_store_index WHERE object_store_id = ?",
            "DELETE FROM object_data WHERE object_store_id = ?",
            "DELETE FROM object_store WHERE id = ?",
        ] {
            self.execute(sql, params![object_store_id])?;
        }
        Ok(())
    }

    fn create_index(
        &mut self,
        object_store_id: i64,
        index: &IndexedDBIndexMetadata,
    ) -> BackendResult<()> {
        self.check_writable()?;
        self.ensure_object_store(object_store_id)?;
        self.execute(
            "INSERT INTO object_store_index \
             (id, object_store_id, name, key_path, unique_index, multi_entry_index) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                index.id,
                object_store_id,
                index.name,
                serialize(&index.key_path)?,
                index.unique,
                index.multi_entry
            ],
        )?;
        Ok(())
    }

    fn delete_index(&mut self, object_store_id: i64, index_id: i64) -> BackendResult<()> {
        self.check_writable()?;
        self.execute(
            "DELETE FROM index_data WHERE object_store_id = ? AND index_id = ?",
            params![object_store_id, index_id],
        )?;
        self.execute(
            "DELETE FROM object_store_index WHERE object_store_id = ? AND id = ?",
            params![object_store_id, index_id],
        )?;
        Ok(())
    }

    fn put_record(
        &mut self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
        value: IndexedDBValue,
    ) -> BackendResult<RecordIdentifier> {
        self.check_writable()?;
        self.ensure_object_store(object_store_id)?;
        let encoded_key = serialize(key)?;
        self.orphan_blob_files(
            "SELECT external_objects FROM object_data WHERE object_store_id = ? AND key = ?",
            params![object_store_id, encoded_key],
        )?;
        let external_objects = self.stage_external_objects(value.external_objects);
        let number: i64 = self
            .connection
            .query_row(
                "SELECT COALESCE(MAX(record_number), 0) + 1 FROM object_data \
                 WHERE object_store_id = ?",
                params![object_store_id],
                |row| row.get(0),
            )
            .map_err(backend_error_from_sqlite_error)?;
        self.execute(
            "DELETE FROM index_data WHERE object_store_id = ? AND object_data_key = ?",
            params![object_store_id, encoded_key],
        )?;
        self.execute(
            "INSERT OR REPLACE INTO object_data \
             (object_store_id, key, data, external_objects, record_number) \
             VALUES (?, ?, ?, ?, ?)",
            params![
                object_store_id,
                encoded_key,
                value.bits,
                serialize(&external_objects)?,
                number
            ],
        )?;
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
        self.ensure_object_store(object_store_id)?;
        let row = self
            .connection
            .query_row(
                "SELECT data, external_objects FROM object_data \
                 WHERE object_store_id = ? AND key = ?",
                params![object_store_id, serialize(key)?],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()
            .map_err(backend_error_from_sqlite_error)?;
        row.map(|(data, external_objects)| self.decode_value(data, &external_objects))
            .transpose()
    }

    fn delete_record(
        &mut self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
    ) -> BackendResult<()> {
        self.check_writable()?;
        let encoded_key = serialize(key)?;
        self.orphan_blob_files(
            "SELECT external_objects FROM object_data WHERE object_store_id = ? AND key = ?",
            params![object_store_id, encoded_key],
        )?;
        self.execute(
            "DELETE FROM index_data WHERE object_store_id = ? AND object_data_key = ?",
            params![object_store_id, encoded_key],
        )?;
        self.execute(
            "DELETE FROM object_data WHERE object_store_id = ? AND key = ?",
            params![object_store_id, encoded_key],
        )?;
        Ok(())
    }

    fn clear_object_store(&mut self, object_store_id: i64) -> BackendResult<()> {
        self.check_writable()?;
        self.ensure_object_store(object_store_id)?;
        self.orphan_blob_files(
            "SELECT external_objects FROM object_data WHERE object_store_id = ?",
            params![object_store_id],
        )?;
        self.execute(
            "DELETE FROM index_data WHERE object_store_id = ?",
            params![object_store_id],
        )?;
        self.execute(
            "DELETE FROM object_data WHERE object_store_id = ?",
            params![object_store_id],
        )?;
        Ok(())
    }

    fn count_records(&mut self, object_store_id: i64) -> BackendResult<u64> {
        self.ensure_object_store(object_store_id)?;
        self.connection
            .query_row(
                "SELECT COUNT(*) FROM object_data WHERE object_store_id = ?",
                params![object_store_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count as u64)
            .map_err(backend_error_from_sqlite_error)
    }

    fn get_all_records(
        &mut self,
        object_store_id: i64,
    ) -> BackendResult<Vec<(IndexedDBKeyType, IndexedDBValue)>> {
        self.ensure_object_store(object_store_id)?;
        let mut stmt = self
            .connection
            .prepare(
                "SELECT key, data, external_objects FROM object_data WHERE object_store_id = ?",
            )
            .map_err(backend_error_from_sqlite_error)?;
        let rows = stmt
            .query_map(params![object_store_id], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(backend_error_from_sqlite_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend_error_from_sqlite_error)?;

        // Encoded keys do not sort like keys, so order after decoding.
        let mut records = rows
            .into_iter()
            .map(|(key, data, external_objects)| {
                Ok((
                    deserialize::<IndexedDBKeyType>(&key)?,
                    self.decode_value(data, &external_objects)?,
                ))
            })
            .collect::<BackendResult<Vec<_>>>()?;
        records.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(records)
    }

    fn key_exists_in_object_store(
        &mut self,
        object_store_id: i64,
        key: &IndexedDBKeyType,
    ) -> BackendResult<Option<RecordIdentifier>> {
        self.ensure_object_store(object_store_id)?;
        let number = self
            .connection
            .query_row(
                "SELECT record_number FROM object_data WHERE object_store_id = ? AND key = ?",
                params![object_store_id, serialize(key)?],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(backend_error_from_sqlite_error)?;
        Ok(number.map(|number| RecordIdentifier {
            primary_key: key.clone(),
            number,
        }))
    }

    fn key_exists_in_index(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        index_key: &IndexedDBKeyType,
    ) -> BackendResult<Option<IndexedDBKeyType>> {
        let primary_key = self
            .connection
            .query_row(
                "SELECT object_data_key FROM index_data \
                 WHERE object_store_id = ? AND index_id = ? AND value = ? LIMIT 1",
                params![object_store_id, index_id, serialize(index_key)?],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(backend_error_from_sqlite_error)?;
        primary_key
            .map(|bytes| deserialize::<IndexedDBKeyType>(&bytes))
            .transpose()
    }

    fn put_index_data_for_record(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        index_key: &IndexedDBKeyType,
        record: &RecordIdentifier,
    ) -> BackendResult<()> {
        self.check_writable()?;
        self.execute(
            "INSERT OR REPLACE INTO index_data \
             (object_store_id, index_id, value, object_data_key) VALUES (?, ?, ?, ?)",
            params![
                object_store_id,
                index_id,
                serialize(index_key)?,
                serialize(&record.primary_key)?
            ],
        )?;
        Ok(())
    }

    fn get_key_generator_current_number(&mut self, object_store_id: i64) -> BackendResult<i64> {
        self.connection
            .query_row(
                "SELECT key_generator_current_number FROM object_store WHERE id = ?",
                params![object_store_id],
                |row| row.get::<_, i64>(0),
            )
            .map_err(backend_error_from_sqlite_error)
    }

    fn maybe_update_key_generator_current_number(
        &mut self,
        object_store_id: i64,
        new_number: i64,
        was_generated: bool,
    ) -> BackendResult<()> {
        self.check_writable()?;
        if was_generated {
            self.execute(
                "UPDATE object_store SET key_generator_current_number = ? WHERE id = ?",
                params![new_number, object_store_id],
            )?;
        } else {
            self.execute(
                "UPDATE object_store SET key_generator_current_number = ? \
                 WHERE id = ? AND key_generator_current_number < ?",
                params![new_number, object_store_id, new_number],
            )?;
        }
        Ok(())
    }
}
