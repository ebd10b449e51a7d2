/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::Cell;
use std::rc::Rc;

use indexeddb_traits::DatabaseError;
use log::{debug, error};
use uuid::Uuid;

use crate::database::Database;

/// How a connection's client learns about its transactions.
pub trait DatabaseCallbacks {
    fn on_complete(&self, transaction_id: i64);
    fn on_abort(&self, transaction_id: i64, error: &DatabaseError);
    /// The client is inactive (e.g. in the back/forward cache) and holds up
    /// another client, so it should be evicted.
    fn on_disallow_inactive_client(&self) {}
    /// The client sent a request that can not be valid.
    fn on_bad_message(&self, _message: &str) {}
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionId(pub u64);

/// A client's handle on a database. Transactions keep it alive but must check
/// `is_connected` before talking to the client.
pub struct Connection {
    id: ConnectionId,
    client_token: Uuid,
    scheduling_priority: Cell<i32>,
    connected: Cell<bool>,
    database: Rc<Database>,
    callbacks: Box<dyn DatabaseCallbacks>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        database: Rc<Database>,
        client_token: Uuid,
        callbacks: Box<dyn DatabaseCallbacks>,
    ) -> Rc<Connection> {
        database.add_client(client_token);
        Rc::new(Connection {
            id,
            client_token,
            scheduling_priority: Cell::new(0),
            connected: Cell::new(true),
            database,
            callbacks,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_token(&self) -> Uuid {
        self.client_token
    }

    pub fn database(&self) -> &Rc<Database> {
        &self.database
    }

    pub fn callbacks(&self) -> &dyn DatabaseCallbacks {
        self.callbacks.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// Severs the client. Later requests on this connection are ignored.
    pub fn close(&self) {
        if self.connected.replace(false) {
            debug!("Closing connection {:?}", self.id);
            self.database.remove_client(self.client_token);
        }
    }

    /// Zero is the highest priority.
    pub fn scheduling_priority(&self) -> i32 {
        self.scheduling_priority.get()
    }

    pub(crate) fn set_scheduling_priority(&self, priority: i32) {
        self.scheduling_priority.set(priority);
    }

    pub fn disallow_inactive_client(&self) {
        if self.is_connected() {
            self.callbacks.on_disallow_inactive_client();
        }
    }

    pub fn report_bad_message(&self, message: &str) {
        error!("Bad message from client on {:?}: {message}", self.id);
        self.callbacks.on_bad_message(message);
    }
}
