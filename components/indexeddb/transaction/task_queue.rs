/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::VecDeque;

use super::operation::Operation;

#[derive(Default)]
pub(crate) struct TaskQueue {
    queue: VecDeque<Operation>,
}

impl TaskQueue {
    pub(crate) fn push(&mut self, operation: Operation) {
        self.queue.push_back(operation);
    }

    pub(crate) fn pop(&mut self) -> Option<Operation> {
        self.queue.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops every queued operation, oldest first.
    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }
}
