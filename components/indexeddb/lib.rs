/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

#![deny(unsafe_code)]

//! The storage side of IndexedDB transactions: lock acquisition, task
//! scheduling, quota gating and the two phase commit into a backing store.

pub mod backing_store;
mod bucket;
mod bucket_context;
mod connection;
mod cursor;
mod database;
mod index_writer;
pub mod lock_manager;
pub mod metrics;
mod prefs;
pub mod transaction;

pub use crate::bucket::{Bucket, TransactionKey};
pub use crate::bucket_context::{
    BucketContext, BucketContextDelegate, FixedQuotaManager, NullDelegate, QuotaManager,
};
pub use crate::connection::{Connection, ConnectionId, DatabaseCallbacks};
pub use crate::cursor::Cursor;
pub use crate::database::Database;
pub use crate::prefs::IndexedDBPrefs;
pub use crate::transaction::{
    InternalsState, RequestCallback, RunTasksResult, Transaction, TransactionInternals,
    TransactionState,
};
