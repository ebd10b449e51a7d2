/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of the transaction engine. Missing fields fall back to their defaults.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct IndexedDBPrefs {
    /// Whether idle transactions that block other clients are eventually aborted.
    pub inactivity_timeout_enabled: bool,
    pub inactivity_timeout_poll_period_ms: u64,
    /// Consecutive blocking polls after which the transaction is aborted.
    pub max_timeout_strikes: u32,
    pub blocking_status_long_time_threshold_ms: u64,
}

impl Default for IndexedDBPrefs {
    fn default() -> Self {
        IndexedDBPrefs {
            inactivity_timeout_enabled: true,
            inactivity_timeout_poll_period_ms: 20_000,
            max_timeout_strikes: 3,
            blocking_status_long_time_threshold_ms: 2,
        }
    }
}

impl IndexedDBPrefs {
    pub fn from_json(json: &str) -> Result<IndexedDBPrefs, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn inactivity_timeout_poll_period(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_poll_period_ms)
    }

    pub fn blocking_status_long_time_threshold(&self) -> Duration {
        Duration::from_millis(self.blocking_status_long_time_threshold_ms)
    }
}
