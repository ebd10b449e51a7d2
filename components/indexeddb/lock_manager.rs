/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Reader/writer locks keyed by `(partition, key)`, granted in FIFO order.
//!
//! A holder asks for all of its locks at once. They are acquired one by one in
//! sorted order, so two holders can never wait on each other. The holder is
//! reported as granted once it owns every lock it asked for.

use std::collections::VecDeque;

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

pub const DATABASE_LOCK_PARTITION: i32 = 0;
pub const OBJECT_STORE_LOCK_PARTITION: i32 = 1;

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PartitionedLockId {
    pub partition: i32,
    pub key: String,
}

impl PartitionedLockId {
    pub fn database(database_name: &str) -> PartitionedLockId {
        PartitionedLockId {
            partition: DATABASE_LOCK_PARTITION,
            key: database_name.to_owned(),
        }
    }

    pub fn object_store(database_id_for_locks: u64, object_store_id: i64) -> PartitionedLockId {
        PartitionedLockId {
            partition: OBJECT_STORE_LOCK_PARTITION,
            key: format!("{object_store_id}|{database_id_for_locks}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockType {
    Shared,
    Exclusive,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionedLockRequest {
    pub lock_id: PartitionedLockId,
    pub lock_type: LockType,
}

/// What the lock manager knows about whoever is asking for locks.
#[derive(Clone, Debug, PartialEq)]
pub struct LockRequestData {
    pub client_token: Uuid,
    pub scheduling_priority: i32,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LockHolderId(u64);

struct Lock {
    lock_type: LockType,
    holders: FxHashSet<LockHolderId>,
    queue: VecDeque<(LockHolderId, LockType)>,
}

impl Lock {
    fn new() -> Lock {
        Lock {
            lock_type: LockType::Shared,
            holders: FxHashSet::default(),
            queue: VecDeque::new(),
        }
    }

    fn is_compatible(&self, lock_type: LockType) -> bool {
        self.holders.is_empty() ||
            (self.lock_type == LockType::Shared && lock_type == LockType::Shared)
    }

    fn is_unused(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

struct Holder {
    requests: Vec<PartitionedLockRequest>,
    acquired: usize,
    data: LockRequestData,
}

impl Holder {
    fn is_granted(&self) -> bool {
        self.acquired == self.requests.len()
    }
}

#[derive(Default)]
pub struct PartitionedLockManager {
    locks: FxHashMap<PartitionedLockId, Lock>,
    holders: FxHashMap<LockHolderId, Holder>,
    next_holder_id: u64,
    newly_granted: VecDeque<LockHolderId>,
}

impl PartitionedLockManager {
    pub fn new() -> PartitionedLockManager {
        PartitionedLockManager::default()
    }

    /// Queues a request for every lock in `requests`. Exclusive wins when the
    /// same lock is asked for twice.
    pub fn acquire_locks(
        &mut self,
        mut requests: Vec<PartitionedLockRequest>,
        data: LockRequestData,
    ) -> LockHolderId {
        let is_exclusive =
            |request: &PartitionedLockRequest| request.lock_type == LockType::Exclusive;
        requests.sort_by(|a, b| {
            a.lock_id
                .cmp(&b.lock_id)
                .then_with(|| is_exclusive(b).cmp(&is_exclusive(a)))
        });
        requests.dedup_by(|later, earlier| later.lock_id == earlier.lock_id);

        let id = LockHolderId(self.next_holder_id);
        self.next_holder_id += 1;
        debug!("Lock holder {id:?} requesting {} locks", requests.len());
        self.holders.insert(
            id,
            Holder {
                requests,
                acquired: 0,
                data,
            },
        );
        self.continue_acquiring(id);
        id
    }

    fn continue_acquiring(&mut self, id: LockHolderId) {
        let Some(holder) = self.holders.get_mut(&id) else {
            return;
        };
        while let Some(request) = holder.requests.get(holder.acquired) {
            let lock = self
                .locks
                .entry(request.lock_id.clone())
                .or_insert_with(Lock::new);
            if lock.queue.is_empty() && lock.is_compatible(request.lock_type) {
                lock.lock_type = request.lock_type;
                lock.holders.insert(id);
                holder.acquired += 1;
            } else {
                lock.queue.push_back((id, request.lock_type));
                return;
            }
        }
        self.newly_granted.push_back(id);
    }

    /// Releases everything `id` holds and withdraws whatever it is still waiting for.
    pub fn release_locks(&mut self, id: LockHolderId) {
        let Some(holder) = self.holders.remove(&id) else {
            return;
        };
        self.newly_granted.retain(|granted| *granted != id);

        let mut touched = Vec::with_capacity(holder.requests.len());
        for (index, request) in holder.requests.iter().enumerate() {
            let Some(lock) = self.locks.get_mut(&request.lock_id) else {
                continue;
            };
            if index < holder.acquired {
                lock.holders.remove(&id);
            } else if index == holder.acquired {
                lock.queue.retain(|(waiting, _)| *waiting != id);
            } else {
                break;
            }
            touched.push(request.lock_id.clone());
        }

        for lock_id in touched {
            self.process_queue(&lock_id);
        }
    }

    fn process_queue(&mut self, lock_id: &PartitionedLockId) {
        let mut promoted = vec![];
        if let Some(lock) = self.locks.get_mut(lock_id) {
            while let Some(&(waiting, lock_type)) = lock.queue.front() {
                if !lock.is_compatible(lock_type) {
                    break;
                }
                lock.queue.pop_front();
                lock.lock_type = lock_type;
                lock.holders.insert(waiting);
                promoted.push(waiting);
            }
            if lock.is_unused() {
                self.locks.remove(lock_id);
            }
        }

        for id in promoted {
            if let Some(holder) = self.holders.get_mut(&id) {
                holder.acquired += 1;
            }
            self.continue_acquiring(id);
        }
    }

    /// Holders that obtained all their locks since the last call, in grant order.
    pub fn take_newly_granted(&mut self) -> Vec<LockHolderId> {
        self.newly_granted.drain(..).collect()
    }

    pub fn is_granted(&self, id: LockHolderId) -> bool {
        self.holders.get(&id).is_some_and(Holder::is_granted)
    }

    pub fn update_scheduling_priority(&mut self, id: LockHolderId, scheduling_priority: i32) {
        if let Some(holder) = self.holders.get_mut(&id) {
            holder.data.scheduling_priority = scheduling_priority;
        }
    }

    /// Whether any request queued on one of `lock_ids` satisfies `predicate`.
    pub fn is_blocking_any_request<F>(
        &self,
        lock_ids: &FxHashSet<PartitionedLockId>,
        predicate: F,
    ) -> bool
    where
        F: Fn(&LockRequestData) -> bool,
    {
        lock_ids
            .iter()
            .filter_map(|lock_id| self.locks.get(lock_id))
            .flat_map(|lock| lock.queue.iter())
            .filter_map(|(waiting, _)| self.holders.get(waiting))
            .any(|holder| predicate(&holder.data))
    }

    pub fn requests_waiting_for_metrics(&self) -> usize {
        self.locks.values().map(|lock| lock.queue.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(priority: i32) -> LockRequestData {
        LockRequestData {
            client_token: Uuid::new_v4(),
            scheduling_priority: priority,
        }
    }

    fn request(key: &str, lock_type: LockType) -> PartitionedLockRequest {
        PartitionedLockRequest {
            lock_id: PartitionedLockId {
                partition: OBJECT_STORE_LOCK_PARTITION,
                key: key.to_owned(),
            },
            lock_type,
        }
    }

    #[test]
    fn shared_locks_are_granted_together() {
        let mut manager = PartitionedLockManager::new();
        let a = manager.acquire_locks(vec![request("s", LockType::Shared)], data(0));
        let b = manager.acquire_locks(vec![request("s", LockType::Shared)], data(0));
        assert_eq!(manager.take_newly_granted(), vec![a, b]);
        assert_eq!(manager.requests_waiting_for_metrics(), 0);
    }

    #[test]
    fn exclusive_lock_waits_for_release() {
        let mut manager = PartitionedLockManager::new();
        let a = manager.acquire_locks(vec![request("s", LockType::Exclusive)], data(0));
        let b = manager.acquire_locks(vec![request("s", LockType::Shared)], data(0));
        assert_eq!(manager.take_newly_granted(), vec![a]);
        assert!(!manager.is_granted(b));
        assert_eq!(manager.requests_waiting_for_metrics(), 1);

        manager.release_locks(a);
        assert_eq!(manager.take_newly_granted(), vec![b]);
        assert!(manager.is_granted(b));
    }

    #[test]
    fn queued_shared_request_does_not_jump_a_waiting_exclusive() {
        let mut manager = PartitionedLockManager::new();
        let reader = manager.acquire_locks(vec![request("s", LockType::Shared)], data(0));
        let writer = manager.acquire_locks(vec![request("s", LockType::Exclusive)], data(0));
        let late_reader = manager.acquire_locks(vec![request("s", LockType::Shared)], data(0));
        assert_eq!(manager.take_newly_granted(), vec![reader]);

        manager.release_locks(reader);
        assert_eq!(manager.take_newly_granted(), vec![writer]);
        manager.release_locks(writer);
        assert_eq!(manager.take_newly_granted(), vec![late_reader]);
    }

    #[test]
    fn cancelling_a_waiting_holder_unblocks_the_queue() {
        let mut manager = PartitionedLockManager::new();
        let a = manager.acquire_locks(vec![request("s", LockType::Exclusive)], data(0));
        let b = manager.acquire_locks(vec![request("s", LockType::Exclusive)], data(0));
        manager.take_newly_granted();
        manager.release_locks(b);
        assert_eq!(manager.requests_waiting_for_metrics(), 0);
        manager.release_locks(a);
        assert!(manager.take_newly_granted().is_empty());
    }

    #[test]
    fn blocking_predicate_sees_waiting_requests() {
        let mut manager = PartitionedLockManager::new();
        let holder_data = data(0);
        let waiting_data = data(3);
        let waiting_token = waiting_data.client_token;
        manager.acquire_locks(vec![request("s", LockType::Exclusive)], holder_data);
        manager.acquire_locks(vec![request("s", LockType::Exclusive)], waiting_data);

        let mut held = FxHashSet::default();
        held.insert(request("s", LockType::Exclusive).lock_id);
        assert!(manager.is_blocking_any_request(&held, |d| d.client_token == waiting_token));
        assert!(!manager.is_blocking_any_request(&held, |d| d.scheduling_priority > 3));

        let mut unrelated = FxHashSet::default();
        unrelated.insert(request("t", LockType::Exclusive).lock_id);
        assert!(!manager.is_blocking_any_request(&unrelated, |_| true));
    }
}
