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

//! Reading sessions and their lifecycle vocabulary.
//!
//! A reading moves through:
//! - [`Requested`] → [`PendingPayment`] (via checkout) → [`Scheduled`] (via payment, debit)
//! - [`Scheduled`] → [`InProgress`] → [`Completed`]
//! - [`Cancelled`] from any pre-start state
//!
//! `Completed` is terminal but may additionally carry a [`Dispute`] attachment
//! without leaving `Completed`.
//!
//! [`Requested`]: ReadingState::Requested
//! [`PendingPayment`]: ReadingState::PendingPayment
//! [`Scheduled`]: ReadingState::Scheduled
//! [`InProgress`]: ReadingState::InProgress
//! [`Completed`]: ReadingState::Completed
//! [`Cancelled`]: ReadingState::Cancelled

use crate::base::{AccountId, IdempotencyKey, ReadingId};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingState {
    Requested,
    PendingPayment,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl fmt::Display for ReadingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested => "requested",
            Self::PendingPayment => "pending_payment",
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Lifecycle event applied through [`Engine::transition`].
///
/// [`Engine::transition`]: crate::engine::Engine::transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadingEvent {
    /// Payment intent created at the processor; parks the reading until the
    /// webhook arrives.
    CheckoutStarted,
    /// Processor confirmed the payment; debits the client and schedules.
    PaymentConfirmed { payment_id: String },
    /// Processor declined; the reading returns to `Requested`.
    PaymentFailed,
    Start,
    Complete,
    Cancel,
    FileDispute { reason: String },
    ResolveDispute { ruling: DisputeRuling },
}

impl ReadingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckoutStarted => "checkout_started",
            Self::PaymentConfirmed { .. } => "payment_confirmed",
            Self::PaymentFailed => "payment_failed",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Cancel => "cancel",
            Self::FileDispute { .. } => "file_dispute",
            Self::ResolveDispute { .. } => "resolve_dispute",
        }
    }
}

/// Who is applying a transition.
///
/// The identity provider authenticates the account id; webhooks act as
/// [`Actor::System`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Participant(AccountId),
    Moderator(AccountId),
    System,
}

/// Moderator ruling on a dispute. Separate from [`DisputeOutcome`] so a
/// resolution back to "unresolved" is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeRuling {
    Refunded,
    Denied,
}

/// Resolution status of a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeOutcome {
    Unresolved,
    Refunded,
    Denied,
}

impl From<DisputeRuling> for DisputeOutcome {
    fn from(ruling: DisputeRuling) -> Self {
        match ruling {
            DisputeRuling::Refunded => Self::Refunded,
            DisputeRuling::Denied => Self::Denied,
        }
    }
}

/// Post-completion claim contesting a reading's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispute {
    pub raised_by: AccountId,
    pub reason: String,
    pub outcome: DisputeOutcome,
    pub resolved_by: Option<AccountId>,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Dispute {
    pub(crate) fn new(raised_by: AccountId, reason: String) -> Self {
        Self {
            raised_by,
            reason,
            outcome: DisputeOutcome::Unresolved,
            resolved_by: None,
            raised_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome != DisputeOutcome::Unresolved
    }
}

/// Timestamped record of one state transition, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub state: ReadingState,
    pub at: DateTime<Utc>,
}

/// One booked session between a client account and a reader account.
///
/// Mutated only through the engine's transition operation; never hard-deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub(crate) id: ReadingId,
    pub(crate) client_id: AccountId,
    pub(crate) reader_id: AccountId,
    pub(crate) topic: String,
    pub(crate) duration_minutes: u32,
    pub(crate) credit_cost: i64,
    pub(crate) state: ReadingState,
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
    pub(crate) history: Vec<StateChange>,
    /// Ledger key of the debit, once paid. At most one per reading.
    pub(crate) debit_key: Option<IdempotencyKey>,
    /// Ledger key of the refund, if any. Requires a prior debit.
    pub(crate) refund_key: Option<IdempotencyKey>,
    pub(crate) dispute: Option<Dispute>,
}

impl Reading {
    pub(crate) fn new(
        id: ReadingId,
        client_id: AccountId,
        reader_id: AccountId,
        topic: String,
        duration_minutes: u32,
        credit_cost: i64,
    ) -> Self {
        Self {
            id,
            client_id,
            reader_id,
            topic,
            duration_minutes,
            credit_cost,
            state: ReadingState::Requested,
            scheduled_at: None,
            history: vec![StateChange {
                state: ReadingState::Requested,
                at: Utc::now(),
            }],
            debit_key: None,
            refund_key: None,
            dispute: None,
        }
    }

    /// Moves to `state` and appends the transition to the audit history.
    pub(crate) fn set_state(&mut self, state: ReadingState) {
        self.state = state;
        self.history.push(StateChange {
            state,
            at: Utc::now(),
        });
    }

    pub fn id(&self) -> ReadingId {
        self.id
    }

    pub fn client_id(&self) -> AccountId {
        self.client_id
    }

    pub fn reader_id(&self) -> AccountId {
        self.reader_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    pub fn credit_cost(&self) -> i64 {
        self.credit_cost
    }

    pub fn state(&self) -> ReadingState {
        self.state
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    pub fn debit_key(&self) -> Option<&IdempotencyKey> {
        self.debit_key.as_ref()
    }

    pub fn refund_key(&self) -> Option<&IdempotencyKey> {
        self.refund_key.as_ref()
    }

    pub fn dispute(&self) -> Option<&Dispute> {
        self.dispute.as_ref()
    }

    pub fn is_disputed(&self) -> bool {
        self.dispute.is_some()
    }

    pub fn is_participant(&self, account_id: AccountId) -> bool {
        account_id == self.client_id || account_id == self.reader_id
    }
}

/// Credit cost of a reading: `ceil(duration_minutes × rate_per_minute)`.
///
/// Rounds only upward so fractional minutes never under-charge. Fails with
/// [`EngineError::InvalidAmount`] when the result is not a positive credit
/// amount (zero or negative rate).
pub fn credit_cost(duration_minutes: u32, rate_per_minute: Decimal) -> Result<i64, EngineError> {
    let cost = (Decimal::from(duration_minutes) * rate_per_minute).ceil();
    match cost.to_i64() {
        Some(cost) if cost > 0 => Ok(cost),
        _ => Err(EngineError::InvalidAmount),
    }
}
