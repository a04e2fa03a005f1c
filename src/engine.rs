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

//! Reading lifecycle engine.
//!
//! The [`Engine`] owns the readings and drives every state transition,
//! including the ledger side effects (debit on payment, refund on cancel or
//! dispute) and party notifications.
//!
//! # Transitions
//!
//! | From | Event | To | Side effect |
//! |------|-------|----|-------------|
//! | Requested | checkout_started | PendingPayment | — |
//! | Requested / PendingPayment | payment_confirmed | Scheduled | debit credit cost |
//! | PendingPayment | payment_failed | Requested | — |
//! | Scheduled | start | InProgress | notify both parties |
//! | InProgress | complete | Completed | notify both parties |
//! | Requested / PendingPayment / Scheduled | cancel | Cancelled | full refund if debited |
//! | Completed | file_dispute | Completed (disputed) | attach dispute |
//! | Completed (disputed) | resolve_dispute | Completed (resolved) | refund if ruling says so |
//!
//! Any other state/event pair fails with [`EngineError::InvalidTransition`].
//! A transition that needs the ledger is only successful if the ledger call
//! succeeds; on ledger failure the reading is left unmodified, so the caller
//! can retry the whole transition and the idempotency keys dedupe the money
//! movement.
//!
//! # Thread safety
//!
//! Readings live in a [`DashMap`] behind per-reading mutexes; all events for
//! one reading are serialized, while different readings proceed in parallel.
//! The lock order is always reading first, then account (inside the ledger),
//! never the reverse.

use crate::base::{AccountId, ExternalRef, IdempotencyKey, ReadingId};
use crate::error::EngineError;
use crate::ledger::{EntryKind, Ledger};
use crate::notify::{NoopNotifier, NotificationKind, Notifier};
use crate::reading::{
    Actor, Dispute, DisputeRuling, Reading, ReadingEvent, ReadingState, credit_cost,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Reading lifecycle engine over an account [`Ledger`].
pub struct Engine {
    ledger: Ledger,
    /// Readings behind per-reading mutexes; never removed, only transitioned.
    readings: DashMap<ReadingId, Mutex<Reading>>,
    next_reading_id: AtomicU64,
    notifier: Arc<dyn Notifier>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_notifier(Arc::new(NoopNotifier))
    }

    pub fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            ledger: Ledger::new(),
            readings: DashMap::new(),
            next_reading_id: AtomicU64::new(1),
            notifier,
        }
    }

    /// The account ledger backing this engine.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Books a reading in `Requested` state.
    ///
    /// The credit cost is fixed at request time from the client's per-minute
    /// conversion rate: `ceil(duration_minutes × rate)`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::AccountNotFound`] - unknown client or reader account.
    /// - [`EngineError::InvalidAmount`] - duration/rate do not yield a
    ///   positive cost.
    pub fn request_reading(
        &self,
        client_id: AccountId,
        reader_id: AccountId,
        topic: impl Into<String>,
        duration_minutes: u32,
    ) -> Result<ReadingId, EngineError> {
        let rate = self.ledger.rate_per_minute(client_id)?;
        if self.ledger.get_account(&reader_id).is_none() {
            return Err(EngineError::AccountNotFound(reader_id));
        }
        let cost = credit_cost(duration_minutes, rate)?;

        let id = ReadingId(self.next_reading_id.fetch_add(1, Ordering::Relaxed));
        self.readings.insert(
            id,
            Mutex::new(Reading::new(
                id,
                client_id,
                reader_id,
                topic.into(),
                duration_minutes,
                cost,
            )),
        );
        Ok(id)
    }

    /// Applies a lifecycle event to a reading and returns the resulting state.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ReadingNotFound`] - unknown reading id.
    /// - [`EngineError::InvalidTransition`] - event not legal for the state.
    /// - Any ledger error from the debit/refund side effect; the reading is
    ///   then left unchanged.
    /// - [`EngineError::NotParticipant`] / [`EngineError::ModeratorRequired`] -
    ///   actor not entitled to the event.
    pub fn transition(
        &self,
        id: ReadingId,
        event: ReadingEvent,
        actor: Actor,
    ) -> Result<ReadingState, EngineError> {
        let entry = self
            .readings
            .get(&id)
            .ok_or(EngineError::ReadingNotFound(id))?;
        let mut reading = entry.value().lock();
        let from = reading.state();

        match (from, &event) {
            (ReadingState::Requested, ReadingEvent::CheckoutStarted) => {
                reading.set_state(ReadingState::PendingPayment);
            }

            (
                ReadingState::Requested | ReadingState::PendingPayment,
                ReadingEvent::PaymentConfirmed { payment_id },
            ) => {
                let key = IdempotencyKey::new(format!("pay:{payment_id}"));
                self.ledger.debit(
                    reading.client_id(),
                    reading.credit_cost(),
                    EntryKind::ReadingDebit,
                    ExternalRef::Payment(payment_id.clone()),
                    key.clone(),
                )?;
                reading.debit_key = Some(key);
                reading.scheduled_at = Some(Utc::now());
                reading.set_state(ReadingState::Scheduled);
                self.notify_parties(&reading, NotificationKind::ReadingScheduled);
            }

            (ReadingState::PendingPayment, ReadingEvent::PaymentFailed) => {
                reading.set_state(ReadingState::Requested);
            }

            (ReadingState::Scheduled, ReadingEvent::Start) => {
                reading.set_state(ReadingState::InProgress);
                self.notify_parties(&reading, NotificationKind::ReadingStarted);
            }

            (ReadingState::InProgress, ReadingEvent::Complete) => {
                reading.set_state(ReadingState::Completed);
                self.notify_parties(&reading, NotificationKind::ReadingCompleted);
            }

            (
                ReadingState::Requested | ReadingState::PendingPayment | ReadingState::Scheduled,
                ReadingEvent::Cancel,
            ) => {
                // Refund the full debit, if one was ever taken. The key is
                // derived from the reading, so a retried cancel dedupes in
                // the ledger.
                if reading.debit_key.is_some() {
                    let key = IdempotencyKey::new(format!("cancel:{}", reading.id()));
                    self.ledger.credit(
                        reading.client_id(),
                        reading.credit_cost(),
                        EntryKind::Refund,
                        ExternalRef::Reading(reading.id()),
                        key.clone(),
                    )?;
                    reading.refund_key = Some(key);
                }
                reading.set_state(ReadingState::Cancelled);
                self.notify_parties(&reading, NotificationKind::ReadingCancelled);
            }

            (ReadingState::Completed, ReadingEvent::FileDispute { reason }) => {
                let raised_by = match actor {
                    Actor::Participant(account) if reading.is_participant(account) => account,
                    _ => return Err(EngineError::NotParticipant),
                };
                if reading.is_disputed() {
                    return Err(EngineError::AlreadyDisputed);
                }
                // Disputed is a sub-status: the reading stays Completed.
                reading.dispute = Some(Dispute::new(raised_by, reason.clone()));
                self.notify_parties(&reading, NotificationKind::DisputeFiled);
            }

            (ReadingState::Completed, ReadingEvent::ResolveDispute { ruling }) => {
                let moderator = match actor {
                    Actor::Moderator(account) => account,
                    _ => return Err(EngineError::ModeratorRequired),
                };
                match reading.dispute() {
                    None => return Err(EngineError::DisputeNotFound(id)),
                    Some(dispute) if dispute.is_resolved() => {
                        return Err(EngineError::DisputeAlreadyResolved);
                    }
                    Some(_) => {}
                }
                // Refund before touching the dispute record; a failed ledger
                // call must leave the dispute unresolved and balances intact.
                if *ruling == DisputeRuling::Refunded {
                    if reading.refund_key.is_some() {
                        return Err(EngineError::RefundAlreadyIssued);
                    }
                    let key = IdempotencyKey::new(format!("dispute:{}", reading.id()));
                    self.ledger.credit(
                        reading.client_id(),
                        reading.credit_cost(),
                        EntryKind::Refund,
                        ExternalRef::Reading(reading.id()),
                        key.clone(),
                    )?;
                    reading.refund_key = Some(key);
                }
                if let Some(dispute) = reading.dispute.as_mut() {
                    dispute.outcome = (*ruling).into();
                    dispute.resolved_by = Some(moderator);
                    dispute.resolved_at = Some(Utc::now());
                }
                self.notify_parties(&reading, NotificationKind::DisputeResolved);
            }

            (from, event) => {
                return Err(EngineError::InvalidTransition {
                    from,
                    event: event.name(),
                });
            }
        }

        Ok(reading.state())
    }

    /// Snapshot of a single reading.
    pub fn reading(&self, id: ReadingId) -> Result<Reading, EngineError> {
        self.readings
            .get(&id)
            .map(|entry| entry.value().lock().clone())
            .ok_or(EngineError::ReadingNotFound(id))
    }

    /// Snapshots of all readings, ordered by id, for output reports.
    pub fn readings(&self) -> Vec<Reading> {
        let mut all: Vec<Reading> = self
            .readings
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect();
        all.sort_by_key(|reading| reading.id().0);
        all
    }

    /// Fire-and-forget: delivery failures are logged, never propagated.
    fn notify_parties(&self, reading: &Reading, kind: NotificationKind) {
        let message = match kind {
            NotificationKind::ReadingScheduled => "your reading has been scheduled",
            NotificationKind::ReadingStarted => "your reading has started",
            NotificationKind::ReadingCompleted => "your reading is complete; reviews are open",
            NotificationKind::ReadingCancelled => "your reading was cancelled",
            NotificationKind::DisputeFiled => "a dispute was filed on your reading",
            NotificationKind::DisputeResolved => "the dispute on your reading was resolved",
        };
        for user in [reading.client_id(), reading.reader_id()] {
            if let Err(error) = self.notifier.notify(user, kind, reading.id(), message) {
                warn!(
                    user = %user,
                    reading = %reading.id(),
                    kind = ?kind,
                    error = %error,
                    "notification dropped"
                );
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
