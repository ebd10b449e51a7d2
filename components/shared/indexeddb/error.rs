/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fmt;

use serde::{Deserialize, Serialize};

/// The DOMException names a transaction can surface to script.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IdbException {
    UnknownError,
    ConstraintError,
    DataError,
    VersionError,
    AbortError,
    QuotaError,
    TimeoutError,
}

impl IdbException {
    /// Sample recorded in the abort-reason histogram.
    pub fn uma_value(self) -> i32 {
        match self {
            IdbException::UnknownError => 0,
            IdbException::ConstraintError => 1,
            IdbException::DataError => 2,
            IdbException::VersionError => 3,
            IdbException::AbortError => 4,
            IdbException::QuotaError => 5,
            IdbException::TimeoutError => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IdbException::UnknownError => "UnknownError",
            IdbException::ConstraintError => "ConstraintError",
            IdbException::DataError => "DataError",
            IdbException::VersionError => "VersionError",
            IdbException::AbortError => "AbortError",
            IdbException::QuotaError => "QuotaExceededError",
            IdbException::TimeoutError => "TimeoutError",
        }
    }
}

/// An error reported to a client, either through a request callback or
/// through a transaction's abort notification.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DatabaseError {
    pub code: IdbException,
    pub message: String,
}

impl DatabaseError {
    pub fn new(code: IdbException, message: impl Into<String>) -> DatabaseError {
        DatabaseError {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.name(), self.message)
    }
}

impl std::error::Error for DatabaseError {}

/// Status of a backing store call.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BackendError {
    /// The disk is full.
    QuotaExceeded,
    DbNotFound,
    /// A caller handed the backing store something it can not act on.
    InvalidArgument(String),
    /// Internal state did not match what the caller expected.
    InternalInconsistency(String),
    DbErr(String),
}

impl BackendError {
    pub fn indicates_disk_full(&self) -> bool {
        matches!(self, BackendError::QuotaExceeded)
    }
}

impl From<String> for BackendError {
    fn from(value: String) -> Self {
        BackendError::DbErr(value)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::QuotaExceeded => write!(f, "disk full"),
            BackendError::DbNotFound => write!(f, "database not found"),
            BackendError::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            BackendError::InternalInconsistency(message) => {
                write!(f, "internal inconsistency: {message}")
            },
            BackendError::DbErr(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;
