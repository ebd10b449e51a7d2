/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::time::{Duration, Instant};

/// A repeating deadline driven by whoever owns the clock.
pub(crate) struct InactivityTimer {
    period: Duration,
    deadline: Option<Instant>,
}

impl InactivityTimer {
    pub(crate) fn new(period: Duration) -> InactivityTimer {
        InactivityTimer {
            period,
            deadline: None,
        }
    }

    pub(crate) fn start(&mut self, now: Instant) {
        self.deadline = Some(now + self.period);
    }

    pub(crate) fn stop(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether the deadline passed. A fired timer rearms itself one period after `now`.
    pub(crate) fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = Some(now + self.period);
                true
            },
            _ => false,
        }
    }
}
