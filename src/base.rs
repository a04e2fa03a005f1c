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

//! Core identifier types for accounts, readings and external events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a marketplace account (client or reader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a booked reading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ReadingId(pub u64);

impl fmt::Display for ReadingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller- or event-supplied token ensuring an operation's effect is applied
/// at most once despite repeated invocation.
///
/// The ledger and the reconciliation gate both key their dedup indexes on this
/// type. Keys derived from different causes must not collide, so derived keys
/// carry a cause prefix (`pay:`, `cancel:`, `dispute:`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

/// Causal link from a ledger entry back to the event that produced it:
/// either a payment-processor payment id or a reading.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalRef {
    Payment(String),
    Reading(ReadingId),
}

impl fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payment(id) => write!(f, "payment:{id}"),
            Self::Reading(id) => write!(f, "reading:{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(AccountId(7).to_string(), "7");
        assert_eq!(ReadingId(42).to_string(), "42");
        assert_eq!(IdempotencyKey::new("idem_1").to_string(), "idem_1");
        assert_eq!(
            ExternalRef::Payment("pay_9".into()).to_string(),
            "payment:pay_9"
        );
        assert_eq!(ExternalRef::Reading(ReadingId(3)).to_string(), "reading:3");
    }

    #[test]
    fn idempotency_key_equality() {
        assert_eq!(IdempotencyKey::from("a"), IdempotencyKey::new("a"));
        assert_ne!(IdempotencyKey::from("a"), IdempotencyKey::from("b"));
    }
}
