/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::oneshot;

use super::{BlobWriteError, BlobWriteReceiver, ready_blob_write};

/// Blob data waiting to be written next to a database.
pub struct PendingBlobFile {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// Threads that write blob files during the first commit phase.
pub struct BlobWriterPool {
    pool: rayon::ThreadPool,
    active: Arc<AtomicBool>,
    active_writes: Arc<AtomicU32>,
}

impl BlobWriterPool {
    pub fn new(num_threads: usize, pool_name: String) -> Result<Self, rayon::ThreadPoolBuildError> {
        debug!("Creating new BlobWriterPool with {num_threads} threads!");
        let pool = rayon::ThreadPoolBuilder::new()
            .thread_name(move |i| format!("{pool_name}#{i}"))
            .num_threads(num_threads)
            .build()?;
        Ok(BlobWriterPool {
            pool,
            active: Arc::new(AtomicBool::new(true)),
            active_writes: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Writes every file, then resolves the receiver with the first failure, if any.
    pub fn write_files(&self, files: Vec<PendingBlobFile>) -> BlobWriteReceiver {
        if files.is_empty() {
            return ready_blob_write(Ok(()));
        }
        if !self.active.load(Ordering::Acquire) {
            warn!("Blob writer pool is shut down, refusing {} writes", files.len());
            return ready_blob_write(Err(BlobWriteError::Error));
        }

        let (sender, receiver) = oneshot::channel();
        let active_writes = self.active_writes.clone();
        active_writes.fetch_add(1, Ordering::AcqRel);
        self.pool.spawn(move || {
            let result = files.iter().try_for_each(write_file);
            active_writes.fetch_sub(1, Ordering::AcqRel);
            let _ = sender.send(result);
        });
        receiver
    }

    pub fn active_writes(&self) -> u32 {
        self.active_writes.load(Ordering::Acquire)
    }

    /// Stops accepting new writes. Writes already spawned still complete.
    pub fn exit(&self) {
        self.active.store(false, Ordering::Release);
    }
}

fn write_file(file: &PendingBlobFile) -> Result<(), BlobWriteError> {
    let parent = file.path.parent().ok_or(BlobWriteError::BadPath)?;
    fs::create_dir_all(parent).map_err(|err| {
        warn!("Failed to create blob directory {parent:?}: {err}");
        BlobWriteError::BadPath
    })?;
    fs::write(&file.path, &file.bytes).map_err(|err| {
        warn!("Failed to write blob {:?}: {err}", file.path);
        BlobWriteError::IoError
    })?;
    fs::File::open(&file.path)
        .and_then(|f| f.sync_all())
        .map_err(|_| BlobWriteError::IoError)
}
