/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::time::{Duration, Instant};

use indexeddb::{IndexedDBPrefs, TransactionKey, TransactionState};
use indexeddb_traits::{DatabaseError, IdbException, IndexedDBKeyType, IndexedDBTxnMode};

use crate::{Event, Harness, STORE, init_with_stores, slot};

const POLL_PERIOD: Duration = Duration::from_secs(20);

/// Runs one request so the inactivity timer gets armed.
fn run_one_request(harness: &mut Harness, key: TransactionKey) {
    let (_, callback) = slot();
    harness
        .txn(key)
        .get(STORE, IndexedDBKeyType::Number(1.0), callback);
    harness.bucket.run_tasks();
    assert!(harness.txn(key).is_timeout_timer_running());
}

/// Advances `clock` by a bit more than a poll period `polls` times, firing the timers each time.
fn fire_timers(harness: &mut Harness, clock: &mut Instant, polls: u32) {
    for _ in 0..polls {
        *clock += POLL_PERIOD + Duration::from_secs(1);
        harness.bucket.fire_timers(*clock);
    }
}

#[test]
fn idle_transaction_blocking_another_client_times_out() {
    let mut harness = init_with_stores();
    let mut clock = Instant::now();
    let (holder, holder_events) = harness.connect();
    let (waiter, waiter_events) = harness.connect();
    let idle = harness.begin(&holder, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();
    run_one_request(&mut harness, idle);
    let waiting = harness.begin(&waiter, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();
    assert_eq!(harness.txn(waiting).state(), TransactionState::Created);

    fire_timers(&mut harness, &mut clock, 2);
    assert_eq!(harness.txn(idle).state(), TransactionState::Started);

    fire_timers(&mut harness, &mut clock, 1);
    assert_eq!(
        holder_events.take(),
        vec![Event::Abort(
            idle.1,
            DatabaseError::new(
                IdbException::TimeoutError,
                "Transaction timed out due to inactivity."
            )
        )]
    );
    assert_eq!(harness.txn(waiting).state(), TransactionState::Started);
    assert!(waiter_events.take().is_empty());
}

#[test]
fn idle_transaction_without_waiters_never_times_out() {
    let mut harness = init_with_stores();
    let mut clock = Instant::now();
    let (connection, events) = harness.connect();
    let (_other_client, _) = harness.connect();
    let key = harness.begin(&connection, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();
    run_one_request(&mut harness, key);

    fire_timers(&mut harness, &mut clock, 5);
    assert_eq!(harness.txn(key).state(), TransactionState::Started);
    assert!(events.take().is_empty());
}

#[test]
fn single_client_is_never_evicted() {
    let mut harness = init_with_stores();
    let mut clock = Instant::now();
    let (connection, events) = harness.connect();
    let idle = harness.begin(&connection, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();
    run_one_request(&mut harness, idle);
    let waiting = harness.begin(&connection, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();

    fire_timers(&mut harness, &mut clock, 5);
    assert_eq!(harness.txn(idle).state(), TransactionState::Started);
    assert_eq!(harness.txn(waiting).state(), TransactionState::Created);
    assert!(events.take().is_empty());
}

#[test]
fn background_client_is_not_evicted_by_an_equally_throttled_one() {
    let mut harness = init_with_stores();
    let mut clock = Instant::now();
    let (holder, holder_events) = harness.connect();
    let (waiter, _) = harness.connect();
    harness.bucket.set_scheduling_priority(&holder, 1);
    harness.bucket.set_scheduling_priority(&waiter, 2);
    let idle = harness.begin(&holder, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();
    run_one_request(&mut harness, idle);
    harness.begin(&waiter, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();

    fire_timers(&mut harness, &mut clock, 5);
    assert_eq!(harness.txn(idle).state(), TransactionState::Started);
    assert!(holder_events.take().is_empty());

    // Once the waiter is in the foreground it counts again.
    harness.bucket.set_scheduling_priority(&waiter, 0);
    fire_timers(&mut harness, &mut clock, 3);
    assert_eq!(holder_events.take().len(), 1);
}

#[test]
fn new_requests_reset_the_strikes() {
    let mut harness = init_with_stores();
    let mut clock = Instant::now();
    let (holder, holder_events) = harness.connect();
    let (waiter, _) = harness.connect();
    let idle = harness.begin(&holder, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();
    run_one_request(&mut harness, idle);
    harness.begin(&waiter, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();

    fire_timers(&mut harness, &mut clock, 2);
    run_one_request(&mut harness, idle);
    fire_timers(&mut harness, &mut clock, 2);
    assert_eq!(harness.txn(idle).state(), TransactionState::Started);
    assert!(holder_events.take().is_empty());
}

#[test]
fn disabled_timeout_never_arms() {
    let prefs = IndexedDBPrefs::from_json(r#"{ "inactivity_timeout_enabled": false }"#).unwrap();
    assert_eq!(prefs.max_timeout_strikes, 3);
    let mut harness = crate::init_with(prefs, Box::new(indexeddb::FixedQuotaManager::unlimited()));
    harness.create_stores();
    let (connection, _) = harness.connect();
    let key = harness.begin(&connection, &[STORE], IndexedDBTxnMode::Readwrite);
    harness.bucket.run_tasks();

    let (_, callback) = slot();
    harness
        .txn(key)
        .get(STORE, IndexedDBKeyType::Number(1.0), callback);
    harness.bucket.run_tasks();
    assert!(!harness.txn(key).is_timeout_timer_running());
}
