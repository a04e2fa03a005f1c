// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Concurrency tests: per-account and per-reading serialization under
//! contention, with a parking_lot deadlock watchdog running alongside.

use rayon::prelude::*;
use reading_ledger_rs::{
    AccountId, Actor, Engine, EntryKind, ExternalEvent, ExternalEventKind, ExternalRef,
    GateOutcome, ReadingEvent, ReadingState, ReconciliationGate,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

const CLIENT: AccountId = AccountId(1);
const READER: AccountId = AccountId(2);

/// Runs `f` with a watchdog thread that panics the test if parking_lot
/// detects a lock cycle while `f` is in flight.
fn with_deadlock_watchdog<F: FnOnce()>(f: F) {
    let done = Arc::new(AtomicBool::new(false));
    let watchdog_done = Arc::clone(&done);
    let watchdog = thread::spawn(move || {
        while !watchdog_done.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(50));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            assert!(
                deadlocks.is_empty(),
                "deadlock detected: {} cycles",
                deadlocks.len()
            );
        }
    });

    f();

    done.store(true, Ordering::Relaxed);
    watchdog.join().unwrap();
}

fn funded_engine(credits: i64) -> Arc<Engine> {
    let engine = Arc::new(Engine::new());
    engine.ledger().open_account(CLIENT, dec!(1));
    engine.ledger().open_account(READER, dec!(1));
    engine
        .ledger()
        .credit(
            CLIENT,
            credits,
            EntryKind::Purchase,
            ExternalRef::Payment("pay_seed".into()),
            "seed".into(),
        )
        .unwrap();
    engine
}

#[test]
fn concurrent_debits_cannot_double_spend() {
    // Balance 100; 50 threads each debit 10 with distinct keys. Exactly 10
    // can succeed and the balance must land on 0, never below.
    with_deadlock_watchdog(|| {
        let engine = funded_engine(100);
        let successes = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let engine = Arc::clone(&engine);
                let successes = Arc::clone(&successes);
                thread::spawn(move || {
                    let result = engine.ledger().debit(
                        CLIENT,
                        10,
                        EntryKind::ReadingDebit,
                        ExternalRef::Payment(format!("pay_{i}")),
                        format!("k{i}").as_str().into(),
                    );
                    if result.is_ok() {
                        successes.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(successes.load(Ordering::Relaxed), 10);
        assert_eq!(engine.ledger().balance(CLIENT).unwrap(), 0);

        let entries = engine.ledger().entries(CLIENT).unwrap();
        let sum: i64 = entries.iter().map(|e| e.amount).sum();
        assert_eq!(sum, 0);
    });
}

#[test]
fn concurrent_replays_of_one_key_apply_once() {
    with_deadlock_watchdog(|| {
        let engine = funded_engine(100);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    let _ = engine.ledger().debit(
                        CLIENT,
                        30,
                        EntryKind::ReadingDebit,
                        ExternalRef::Payment("pay_1".into()),
                        "same_key".into(),
                    );
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.ledger().balance(CLIENT).unwrap(), 70);
        assert_eq!(engine.ledger().entries(CLIENT).unwrap().len(), 2);
    });
}

#[test]
fn concurrent_webhook_deliveries_produce_one_debit() {
    with_deadlock_watchdog(|| {
        let engine = funded_engine(100);
        let reading = engine.request_reading(CLIENT, READER, "tarot", 30).unwrap();
        let gate = Arc::new(ReconciliationGate::new(Arc::clone(&engine)));
        let applied = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let applied = Arc::clone(&applied);
                thread::spawn(move || {
                    let result = gate.apply_external_event(ExternalEvent {
                        idempotency_key: "evt_1".into(),
                        kind: ExternalEventKind::PaymentSucceeded {
                            payment_id: "pay_1".into(),
                            reading_id: reading,
                        },
                    });
                    // Applied once; the rest see AlreadyApplied or lose the
                    // in-flight race and would be redelivered.
                    if matches!(result, Ok(GateOutcome::Applied(_))) {
                        applied.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(applied.load(Ordering::Relaxed), 1);
        assert_eq!(engine.ledger().balance(CLIENT).unwrap(), 70);
        assert_eq!(
            engine.reading(reading).unwrap().state(),
            ReadingState::Scheduled
        );
    });
}

#[test]
fn racing_cancel_and_start_settle_consistently() {
    // Whoever wins the per-reading lock wins; the loser gets
    // InvalidTransition and money stays reconciled either way.
    with_deadlock_watchdog(|| {
        for round in 0..20 {
            let engine = funded_engine(1_000);
            let reading = engine.request_reading(CLIENT, READER, "tea", 30).unwrap();
            engine
                .transition(
                    reading,
                    ReadingEvent::PaymentConfirmed {
                        payment_id: format!("pay_{round}"),
                    },
                    Actor::System,
                )
                .unwrap();

            let starter = {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    engine.transition(reading, ReadingEvent::Start, Actor::System)
                })
            };
            let canceller = {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    engine.transition(reading, ReadingEvent::Cancel, Actor::System)
                })
            };
            let start_result = starter.join().unwrap();
            let cancel_result = canceller.join().unwrap();

            // Exactly one of the two may win.
            assert!(start_result.is_ok() ^ cancel_result.is_ok());

            let state = engine.reading(reading).unwrap().state();
            let balance = engine.ledger().balance(CLIENT).unwrap();
            match state {
                ReadingState::InProgress => assert_eq!(balance, 1_000 - 30),
                ReadingState::Cancelled => assert_eq!(balance, 1_000),
                other => panic!("unexpected state {other}"),
            }
        }
    });
}

#[test]
fn parallel_accounts_do_not_interfere() {
    with_deadlock_watchdog(|| {
        let engine = Arc::new(Engine::new());

        (0u64..64).into_par_iter().for_each(|i| {
            let account = AccountId(i);
            engine
                .ledger()
                .credit(
                    account,
                    100,
                    EntryKind::Purchase,
                    ExternalRef::Payment(format!("pay_{i}")),
                    format!("seed_{i}").as_str().into(),
                )
                .unwrap();
            engine
                .ledger()
                .debit(
                    account,
                    40,
                    EntryKind::ReadingDebit,
                    ExternalRef::Payment(format!("pay_d{i}")),
                    format!("debit_{i}").as_str().into(),
                )
                .unwrap();
        });

        for i in 0u64..64 {
            assert_eq!(engine.ledger().balance(AccountId(i)).unwrap(), 60);
        }
    });
}

#[test]
fn parallel_readings_for_one_client() {
    with_deadlock_watchdog(|| {
        let engine = funded_engine(10_000);
        let readings: Vec<_> = (0..32)
            .map(|_| engine.request_reading(CLIENT, READER, "bulk", 30).unwrap())
            .collect();

        readings.par_iter().for_each(|&id| {
            engine
                .transition(
                    id,
                    ReadingEvent::PaymentConfirmed {
                        payment_id: format!("pay_{id}"),
                    },
                    Actor::System,
                )
                .unwrap();
            engine.transition(id, ReadingEvent::Start, Actor::System).unwrap();
            engine
                .transition(id, ReadingEvent::Complete, Actor::System)
                .unwrap();
        });

        assert_eq!(
            engine.ledger().balance(CLIENT).unwrap(),
            10_000 - 32 * 30
        );
        for id in readings {
            assert_eq!(engine.reading(id).unwrap().state(), ReadingState::Completed);
        }
    });
}
