/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use indexeddb_traits::{IndexedDBKeyType, IndexedDBValue};

struct CursorState {
    records: VecDeque<(IndexedDBKeyType, IndexedDBValue)>,
    closed: bool,
}

/// Iterates an object store in key order. The owning transaction closes every
/// cursor it handed out before it lets go of its backing store transaction.
#[derive(Clone)]
pub struct Cursor {
    state: Rc<RefCell<CursorState>>,
}

impl Cursor {
    pub(crate) fn new(records: Vec<(IndexedDBKeyType, IndexedDBValue)>) -> Cursor {
        Cursor {
            state: Rc::new(RefCell::new(CursorState {
                records: records.into(),
                closed: false,
            })),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakCursor {
        WeakCursor(Rc::downgrade(&self.state))
    }

    /// Moves to the next record. A closed cursor yields nothing.
    pub fn continue_(&self) -> Option<(IndexedDBKeyType, IndexedDBValue)> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return None;
        }
        state.records.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn close(&self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.records.clear();
    }
}

pub(crate) struct WeakCursor(Weak<RefCell<CursorState>>);

impl WeakCursor {
    pub(crate) fn close(&self) {
        if let Some(state) = self.0.upgrade() {
            Cursor { state }.close();
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}
