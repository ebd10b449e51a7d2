/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::time::Duration;

use log::trace;
use rustc_hash::FxHashMap;

pub const ABORT_REASON: &str = "WebCore.IndexedDB.TransactionAbortReason";
pub const BLOCKING_STATUS_LONG_TIMES: &str = "IndexedDB.CalculateBlockingStatusLongTimes";
pub const BLOCKING_STATUS_QUEUE_SIZE: &str = "IndexedDB.CalculateBlockingStatusRequestQueueSize";

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sample {
    Enumeration(i32),
    Count(u64),
    Time(Duration),
}

/// In-process histogram sink for one bucket.
#[derive(Default)]
pub struct Histograms {
    samples: RefCell<FxHashMap<String, Vec<Sample>>>,
}

impl Histograms {
    pub fn record_enumeration(&self, name: &str, sample: i32) {
        self.record(name, Sample::Enumeration(sample));
    }

    pub fn record_count(&self, name: &str, count: u64) {
        self.record(name, Sample::Count(count));
    }

    pub fn record_time(&self, name: &str, time: Duration) {
        self.record(name, Sample::Time(time));
    }

    fn record(&self, name: &str, sample: Sample) {
        trace!("histogram {name}: {sample:?}");
        self.samples
            .borrow_mut()
            .entry(name.to_owned())
            .or_default()
            .push(sample);
    }

    pub fn samples(&self, name: &str) -> Vec<Sample> {
        self.samples
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

pub fn time_queued_histogram(mode: &str) -> String {
    format!("WebCore.IndexedDB.Transaction.{mode}.TimeQueued")
}

pub fn time_active_histogram(mode: &str) -> String {
    format!("WebCore.IndexedDB.Transaction.{mode}.TimeActive2")
}
