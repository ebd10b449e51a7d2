/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell, RefMut};

use log::debug;
use tokio::sync::oneshot;

use crate::lock_manager::PartitionedLockManager;
use crate::metrics::Histograms;
use crate::prefs::IndexedDBPrefs;

/// Answers whether a bucket may grow by a number of bytes. The answer may
/// arrive later; a dropped sender counts as a denial.
pub trait QuotaManager {
    fn check_can_use_disk_space(&self, required_bytes: u64) -> oneshot::Receiver<bool>;
}

/// Grants any request that fits in a fixed number of bytes, or every request
/// when there is no limit.
pub struct FixedQuotaManager {
    available_bytes: Option<u64>,
}

impl FixedQuotaManager {
    pub fn unlimited() -> FixedQuotaManager {
        FixedQuotaManager {
            available_bytes: None,
        }
    }

    pub fn with_limit(available_bytes: u64) -> FixedQuotaManager {
        FixedQuotaManager {
            available_bytes: Some(available_bytes),
        }
    }
}

impl QuotaManager for FixedQuotaManager {
    fn check_can_use_disk_space(&self, required_bytes: u64) -> oneshot::Receiver<bool> {
        let (sender, receiver) = oneshot::channel();
        let allowed = self
            .available_bytes
            .is_none_or(|available| required_bytes <= available);
        let _ = sender.send(allowed);
        receiver
    }
}

/// Notifications the bucket sends to whoever owns it.
pub trait BucketContextDelegate {
    fn on_content_changed(&self, database_name: &str, object_store_name: &str);
    fn on_files_written(&self, flushed: bool);
}

pub struct NullDelegate;

impl BucketContextDelegate for NullDelegate {
    fn on_content_changed(&self, _: &str, _: &str) {}
    fn on_files_written(&self, _: bool) {}
}

/// Services shared by every transaction of one storage bucket.
pub struct BucketContext {
    prefs: IndexedDBPrefs,
    lock_manager: RefCell<PartitionedLockManager>,
    quota_manager: Box<dyn QuotaManager>,
    delegate: Box<dyn BucketContextDelegate>,
    histograms: Histograms,
    run_tasks_queued: Cell<bool>,
}

impl BucketContext {
    pub fn new(
        prefs: IndexedDBPrefs,
        quota_manager: Box<dyn QuotaManager>,
        delegate: Box<dyn BucketContextDelegate>,
    ) -> BucketContext {
        BucketContext {
            prefs,
            lock_manager: RefCell::new(PartitionedLockManager::new()),
            quota_manager,
            delegate,
            histograms: Histograms::default(),
            run_tasks_queued: Cell::new(false),
        }
    }

    pub fn prefs(&self) -> &IndexedDBPrefs {
        &self.prefs
    }

    pub fn lock_manager(&self) -> RefMut<'_, PartitionedLockManager> {
        self.lock_manager.borrow_mut()
    }

    pub fn delegate(&self) -> &dyn BucketContextDelegate {
        self.delegate.as_ref()
    }

    pub fn histograms(&self) -> &Histograms {
        &self.histograms
    }

    pub fn check_can_use_disk_space(&self, required_bytes: u64) -> oneshot::Receiver<bool> {
        debug!("Checking quota for {required_bytes} bytes");
        self.quota_manager.check_can_use_disk_space(required_bytes)
    }

    /// Asks the bucket to give its transactions another pass.
    pub fn queue_run_tasks(&self) {
        self.run_tasks_queued.set(true);
    }

    pub fn take_run_tasks_request(&self) -> bool {
        self.run_tasks_queued.replace(false)
    }
}
