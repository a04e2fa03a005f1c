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

//! # Reading Ledger
//!
//! Credits ledger and reading-lifecycle engine for a marketplace connecting
//! readers (service providers) with clients: booking, credit debits, refunds,
//! disputes, and idempotent reconciliation of payment-processor webhooks.
//!
//! ## Core Components
//!
//! - [`Ledger`]: the single authority for credit balances; every change is an
//!   immutable [`LedgerEntry`] and the balance is always their sum
//! - [`Engine`]: drives a reading through
//!   `Requested → PendingPayment → Scheduled → InProgress → Completed`
//!   (with `Cancelled` and a post-completion dispute flow), debiting and
//!   refunding through the ledger
//! - [`ReconciliationGate`]: applies external payment events at most once
//!   despite at-least-once webhook delivery
//! - [`EngineError`]: typed errors; duplicate deliveries are soft outcomes,
//!   not errors
//!
//! ## Example
//!
//! ```
//! use reading_ledger_rs::{
//!     AccountId, Actor, Engine, EntryKind, ExternalRef, ReadingEvent, ReadingState,
//! };
//! use rust_decimal_macros::dec;
//!
//! let engine = Engine::new();
//! let ledger = engine.ledger();
//!
//! // Client buys 100 credits, reader account is provisioned.
//! let client = AccountId(1);
//! let reader = AccountId(2);
//! ledger.open_account(client, dec!(1.5));
//! ledger.open_account(reader, dec!(1.5));
//! ledger
//!     .credit(
//!         client,
//!         100,
//!         EntryKind::Purchase,
//!         ExternalRef::Payment("pay_1".into()),
//!         "evt_1".into(),
//!     )
//!     .unwrap();
//!
//! // Book a 30-minute reading: costs ceil(30 × 1.5) = 45 credits.
//! let reading = engine.request_reading(client, reader, "tarot", 30).unwrap();
//!
//! // Payment confirmation debits and schedules.
//! let state = engine
//!     .transition(
//!         reading,
//!         ReadingEvent::PaymentConfirmed {
//!             payment_id: "pay_2".into(),
//!         },
//!         Actor::System,
//!     )
//!     .unwrap();
//! assert_eq!(state, ReadingState::Scheduled);
//! assert_eq!(ledger.balance(client).unwrap(), 55);
//! ```
//!
//! ## Thread Safety
//!
//! Mutations are serialized per account and per reading: two concurrent
//! debits against one account cannot both pass the sufficiency check, and
//! events for one reading queue behind each other while distinct readings
//! proceed in parallel.

mod base;
mod engine;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod notify;
pub mod reading;

pub use base::{AccountId, ExternalRef, IdempotencyKey, ReadingId};
pub use engine::Engine;
pub use error::EngineError;
pub use gate::{ExternalEvent, ExternalEventKind, GateOutcome, ReconciliationGate};
pub use ledger::{Account, EntryKind, Ledger, LedgerEntry, LedgerOutcome};
pub use notify::{NoopNotifier, NotificationKind, Notifier, NotifyError, RecordingNotifier};
pub use reading::{
    Actor, Dispute, DisputeOutcome, DisputeRuling, Reading, ReadingEvent, ReadingState,
    credit_cost,
};
