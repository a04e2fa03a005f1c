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

//! Error types for the ledger and reading lifecycle engine.
//!
//! Duplicate deliveries are deliberately NOT errors: the ledger reports a
//! replayed idempotency key as [`LedgerOutcome::Duplicate`] and the gate as
//! [`GateOutcome::AlreadyApplied`], so retries from an at-least-once delivery
//! channel stay success-equivalent.
//!
//! [`LedgerOutcome::Duplicate`]: crate::ledger::LedgerOutcome::Duplicate
//! [`GateOutcome::AlreadyApplied`]: crate::gate::GateOutcome::AlreadyApplied

use crate::base::{AccountId, ReadingId};
use crate::reading::ReadingState;
use thiserror::Error;

/// Engine processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Debit would bring the balance below zero
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    /// Requested event is not legal for the reading's current state
    #[error("invalid transition: {event} from {from}")]
    InvalidTransition {
        from: ReadingState,
        event: &'static str,
    },

    /// Unknown account id
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    /// Unknown reading id
    #[error("reading {0} not found")]
    ReadingNotFound(ReadingId),

    /// Reading has no dispute to resolve
    #[error("reading {0} has no dispute")]
    DisputeNotFound(ReadingId),

    /// Account is deactivated and accepts no new ledger entries
    #[error("account is deactivated")]
    AccountDeactivated,

    /// Actor is neither the client nor the reader of the reading
    #[error("actor is not a participant of this reading")]
    NotParticipant,

    /// Dispute resolution requires a moderator actor
    #[error("only a moderator can resolve a dispute")]
    ModeratorRequired,

    /// Reading already has a dispute attached
    #[error("reading is already disputed")]
    AlreadyDisputed,

    /// Dispute was already resolved
    #[error("dispute is already resolved")]
    DisputeAlreadyResolved,

    /// Reading already has a refund entry
    #[error("a refund was already issued for this reading")]
    RefundAlreadyIssued,

    /// Lost a serialization race (same idempotency key in flight elsewhere)
    #[error("concurrent application of the same event in flight; retry")]
    ConcurrencyConflict,
}

#[cfg(test)]
mod tests {
    use super::EngineError;
    use crate::base::{AccountId, ReadingId};
    use crate::reading::ReadingState;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            EngineError::InvalidAmount.to_string(),
            "invalid amount (must be positive)"
        );
        assert_eq!(
            EngineError::InsufficientBalance {
                required: 45,
                available: 10
            }
            .to_string(),
            "insufficient balance: required 45, available 10"
        );
        assert_eq!(
            EngineError::InvalidTransition {
                from: ReadingState::Requested,
                event: "complete"
            }
            .to_string(),
            "invalid transition: complete from requested"
        );
        assert_eq!(
            EngineError::AccountNotFound(AccountId(9)).to_string(),
            "account 9 not found"
        );
        assert_eq!(
            EngineError::ReadingNotFound(ReadingId(3)).to_string(),
            "reading 3 not found"
        );
        assert_eq!(
            EngineError::ConcurrencyConflict.to_string(),
            "concurrent application of the same event in flight; retry"
        );
    }

    #[test]
    fn errors_are_cloneable() {
        let error = EngineError::InsufficientBalance {
            required: 1,
            available: 0,
        };
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
