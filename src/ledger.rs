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

//! Account ledger: the single authority for mutating credit balances.
//!
//! Every balance change is recorded as an immutable [`LedgerEntry`]; the
//! balance is always the sum of the applied entries. Entry creation and
//! balance update happen under one per-account mutex, so they apply together
//! or not at all, and two concurrent debits cannot both pass the sufficiency
//! check.
//!
//! Replaying an idempotency key returns the previously recorded entry as
//! [`LedgerOutcome::Duplicate`] instead of erroring, so callers on unreliable
//! delivery channels can retry blindly.
//!
//! # Example
//!
//! ```
//! use reading_ledger_rs::{AccountId, EntryKind, ExternalRef, Ledger};
//! use rust_decimal_macros::dec;
//!
//! let ledger = Ledger::new();
//! ledger.open_account(AccountId(1), dec!(1.5));
//! ledger
//!     .credit(
//!         AccountId(1),
//!         100,
//!         EntryKind::Purchase,
//!         ExternalRef::Payment("pay_1".into()),
//!         "idem_1".into(),
//!     )
//!     .unwrap();
//! assert_eq!(ledger.balance(AccountId(1)).unwrap(), 100);
//! ```

use crate::base::{AccountId, ExternalRef, IdempotencyKey};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::Deserialize;
use std::collections::HashMap;

/// Classification of a balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Credits bought through the payment processor.
    Purchase,
    /// Debit for a scheduled reading.
    ReadingDebit,
    /// Compensation for a cancelled or disputed reading.
    Refund,
    /// Manual moderator correction.
    Adjustment,
}

/// Immutable record of one balance change.
///
/// Corrections are never edits; they are new compensating entries.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LedgerEntry {
    /// Per-account sequence number, in application order.
    pub seq: u64,
    pub account_id: AccountId,
    /// Signed credit amount: positive for credits, negative for debits.
    pub amount: i64,
    pub kind: EntryKind,
    pub external_ref: ExternalRef,
    pub idempotency_key: IdempotencyKey,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful ledger operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// A new entry was recorded and the balance updated.
    Applied(LedgerEntry),
    /// The idempotency key was seen before; the prior entry is returned and
    /// nothing was changed.
    Duplicate(LedgerEntry),
}

impl LedgerOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Self::Applied(entry) | Self::Duplicate(entry) => entry,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

#[derive(Debug)]
struct AccountData {
    id: AccountId,
    balance: i64,
    rate_per_minute: Decimal,
    deactivated: bool,
    /// Append-only; `balance` is always the sum of `entries[..].amount`.
    entries: Vec<LedgerEntry>,
    /// Entry index by idempotency key for replay detection.
    by_key: HashMap<IdempotencyKey, usize>,
}

impl AccountData {
    fn new(id: AccountId, rate_per_minute: Decimal) -> Self {
        Self {
            id,
            balance: 0,
            rate_per_minute,
            deactivated: false,
            entries: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.balance >= 0,
            "Invariant violated: balance went negative: {}",
            self.balance
        );
        debug_assert_eq!(
            self.balance,
            self.entries.iter().map(|e| e.amount).sum::<i64>(),
            "Invariant violated: balance diverged from entry sum"
        );
    }

    fn replay(&self, key: &IdempotencyKey) -> Option<LedgerEntry> {
        self.by_key.get(key).map(|&idx| self.entries[idx].clone())
    }

    /// Appends an entry and applies its signed amount to the balance.
    fn record(
        &mut self,
        amount: i64,
        kind: EntryKind,
        external_ref: ExternalRef,
        key: IdempotencyKey,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            seq: self.entries.len() as u64,
            account_id: self.id,
            amount,
            kind,
            external_ref,
            idempotency_key: key.clone(),
            created_at: Utc::now(),
        };
        self.by_key.insert(key, self.entries.len());
        self.entries.push(entry.clone());
        self.balance += amount;
        self.assert_invariants();
        entry
    }

    /// Increases the balance by `amount`.
    fn credit(
        &mut self,
        amount: i64,
        kind: EntryKind,
        external_ref: ExternalRef,
        key: IdempotencyKey,
    ) -> Result<LedgerOutcome, EngineError> {
        if let Some(prior) = self.replay(&key) {
            return Ok(LedgerOutcome::Duplicate(prior));
        }
        if self.deactivated {
            return Err(EngineError::AccountDeactivated);
        }
        if amount <= 0 {
            return Err(EngineError::InvalidAmount);
        }
        // Amounts are caller-supplied; a credit that would overflow the
        // balance is rejected, not wrapped.
        if self.balance.checked_add(amount).is_none() {
            return Err(EngineError::InvalidAmount);
        }
        Ok(LedgerOutcome::Applied(self.record(
            amount,
            kind,
            external_ref,
            key,
        )))
    }

    /// Decreases the balance by `amount`; rejects rather than clamps when the
    /// balance would go negative.
    fn debit(
        &mut self,
        amount: i64,
        kind: EntryKind,
        external_ref: ExternalRef,
        key: IdempotencyKey,
    ) -> Result<LedgerOutcome, EngineError> {
        if let Some(prior) = self.replay(&key) {
            return Ok(LedgerOutcome::Duplicate(prior));
        }
        if self.deactivated {
            return Err(EngineError::AccountDeactivated);
        }
        if amount <= 0 {
            return Err(EngineError::InvalidAmount);
        }
        if self.balance < amount {
            return Err(EngineError::InsufficientBalance {
                required: amount,
                available: self.balance,
            });
        }
        Ok(LedgerOutcome::Applied(self.record(
            -amount,
            kind,
            external_ref,
            key,
        )))
    }
}

/// One user's credit account.
#[derive(Debug)]
pub struct Account {
    inner: Mutex<AccountData>,
}

impl Account {
    const RATE_PRECISION: u32 = 4;

    pub fn new(id: AccountId, rate_per_minute: Decimal) -> Self {
        Self {
            inner: Mutex::new(AccountData::new(id, rate_per_minute)),
        }
    }

    pub fn id(&self) -> AccountId {
        self.inner.lock().id
    }

    pub fn balance(&self) -> i64 {
        self.inner.lock().balance
    }

    pub fn rate_per_minute(&self) -> Decimal {
        self.inner.lock().rate_per_minute
    }

    pub fn deactivated(&self) -> bool {
        self.inner.lock().deactivated
    }

    /// Snapshot of the append-only entry log.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn entry_for_key(&self, key: &IdempotencyKey) -> Option<LedgerEntry> {
        self.inner.lock().replay(key)
    }

    fn credit(
        &self,
        amount: i64,
        kind: EntryKind,
        external_ref: ExternalRef,
        key: IdempotencyKey,
    ) -> Result<LedgerOutcome, EngineError> {
        self.inner.lock().credit(amount, kind, external_ref, key)
    }

    fn debit(
        &self,
        amount: i64,
        kind: EntryKind,
        external_ref: ExternalRef,
        key: IdempotencyKey,
    ) -> Result<LedgerOutcome, EngineError> {
        self.inner.lock().debit(amount, kind, external_ref, key)
    }
}

impl Serialize for Account {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.inner.lock();
        let mut state = serializer.serialize_struct("Account", 5)?;
        state.serialize_field("account", &data.id)?;
        state.serialize_field("balance", &data.balance)?;
        state.serialize_field(
            "rate_per_minute",
            &data.rate_per_minute.round_dp(Account::RATE_PRECISION),
        )?;
        state.serialize_field("entries", &data.entries.len())?;
        state.serialize_field("deactivated", &data.deactivated)?;
        state.end()
    }
}

/// Registry of accounts; the only writer of balances.
///
/// Accounts are never deleted, only deactivated.
pub struct Ledger {
    accounts: DashMap<AccountId, Account>,
}

impl Ledger {
    /// Conversion rate used when an account is implicitly created by its
    /// first credit purchase.
    pub const DEFAULT_RATE: Decimal = Decimal::ONE;

    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    /// Provisions an account with an explicit per-minute conversion rate.
    /// A no-op if the account already exists.
    pub fn open_account(&self, id: AccountId, rate_per_minute: Decimal) {
        self.accounts
            .entry(id)
            .or_insert_with(|| Account::new(id, rate_per_minute));
    }

    /// Marks the account as deactivated; existing entries are retained and
    /// further credits/debits are rejected.
    pub fn deactivate(&self, id: AccountId) -> Result<(), EngineError> {
        let account = self
            .accounts
            .get(&id)
            .ok_or(EngineError::AccountNotFound(id))?;
        account.inner.lock().deactivated = true;
        Ok(())
    }

    /// Records a positive balance change, creating the account on a first
    /// purchase.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidAmount`] - `amount` is zero, negative, or would
    ///   overflow the balance.
    /// - [`EngineError::AccountDeactivated`] - account no longer accepts entries.
    pub fn credit(
        &self,
        id: AccountId,
        amount: i64,
        kind: EntryKind,
        external_ref: ExternalRef,
        key: IdempotencyKey,
    ) -> Result<LedgerOutcome, EngineError> {
        let account = self
            .accounts
            .entry(id)
            .or_insert_with(|| Account::new(id, Self::DEFAULT_RATE));
        account.credit(amount, kind, external_ref, key)
    }

    /// Records a negative balance change against an existing account.
    ///
    /// # Errors
    ///
    /// - [`EngineError::AccountNotFound`] - unknown account.
    /// - [`EngineError::InvalidAmount`] - `amount` is zero or negative.
    /// - [`EngineError::InsufficientBalance`] - balance < amount; the ledger
    ///   is left untouched.
    /// - [`EngineError::AccountDeactivated`] - account no longer accepts entries.
    pub fn debit(
        &self,
        id: AccountId,
        amount: i64,
        kind: EntryKind,
        external_ref: ExternalRef,
        key: IdempotencyKey,
    ) -> Result<LedgerOutcome, EngineError> {
        let account = self
            .accounts
            .get(&id)
            .ok_or(EngineError::AccountNotFound(id))?;
        account.debit(amount, kind, external_ref, key)
    }

    pub fn balance(&self, id: AccountId) -> Result<i64, EngineError> {
        self.accounts
            .get(&id)
            .map(|account| account.balance())
            .ok_or(EngineError::AccountNotFound(id))
    }

    pub fn rate_per_minute(&self, id: AccountId) -> Result<Decimal, EngineError> {
        self.accounts
            .get(&id)
            .map(|account| account.rate_per_minute())
            .ok_or(EngineError::AccountNotFound(id))
    }

    /// Snapshot of an account's entry log, for audit and consistency checks.
    pub fn entries(&self, id: AccountId) -> Result<Vec<LedgerEntry>, EngineError> {
        self.accounts
            .get(&id)
            .map(|account| account.entries())
            .ok_or(EngineError::AccountNotFound(id))
    }

    /// Returns an iterator over all accounts, for output reports.
    pub fn accounts(
        &self,
    ) -> impl Iterator<Item = dashmap::mapref::multiple::RefMulti<'_, AccountId, Account>> {
        self.accounts.iter()
    }

    pub fn get_account(
        &self,
        id: &AccountId,
    ) -> Option<dashmap::mapref::one::Ref<'_, AccountId, Account>> {
        self.accounts.get(id)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn purchase(data: &mut AccountData, amount: i64, key: &str) -> LedgerOutcome {
        data.credit(
            amount,
            EntryKind::Purchase,
            ExternalRef::Payment(format!("pay_{key}")),
            key.into(),
        )
        .unwrap()
    }

    // === AccountData internal tests ===

    #[test]
    fn credit_then_debit() {
        let mut data = AccountData::new(AccountId(1), dec!(1));
        purchase(&mut data, 100, "k1");
        data.debit(
            30,
            EntryKind::ReadingDebit,
            ExternalRef::Reading(crate::base::ReadingId(5)),
            "k2".into(),
        )
        .unwrap();
        assert_eq!(data.balance, 70);
        assert_eq!(data.entries.len(), 2);
        assert_eq!(data.entries[1].amount, -30);
    }

    #[test]
    fn debit_insufficient_leaves_ledger_untouched() {
        let mut data = AccountData::new(AccountId(1), dec!(1));
        purchase(&mut data, 10, "k1");
        let result = data.debit(
            45,
            EntryKind::ReadingDebit,
            ExternalRef::Reading(crate::base::ReadingId(1)),
            "k2".into(),
        );
        assert_eq!(
            result,
            Err(EngineError::InsufficientBalance {
                required: 45,
                available: 10
            })
        );
        assert_eq!(data.balance, 10);
        assert_eq!(data.entries.len(), 1);
    }

    #[test]
    fn replayed_key_returns_prior_entry() {
        let mut data = AccountData::new(AccountId(1), dec!(1));
        let first = purchase(&mut data, 100, "k1");
        let replay = purchase(&mut data, 100, "k1");
        assert!(replay.is_duplicate());
        assert_eq!(replay.entry(), first.entry());
        assert_eq!(data.balance, 100);
        assert_eq!(data.entries.len(), 1);
    }

    #[test]
    fn replayed_debit_skips_sufficiency_check() {
        let mut data = AccountData::new(AccountId(1), dec!(1));
        purchase(&mut data, 50, "k1");
        data.debit(
            50,
            EntryKind::ReadingDebit,
            ExternalRef::Reading(crate::base::ReadingId(1)),
            "k2".into(),
        )
        .unwrap();
        // Balance is now 0; replaying the same debit must still be a soft
        // duplicate, not InsufficientBalance.
        let replay = data
            .debit(
                50,
                EntryKind::ReadingDebit,
                ExternalRef::Reading(crate::base::ReadingId(1)),
                "k2".into(),
            )
            .unwrap();
        assert!(replay.is_duplicate());
        assert_eq!(data.balance, 0);
    }

    #[test]
    fn credit_overflowing_the_balance_rejected() {
        let mut data = AccountData::new(AccountId(1), dec!(1));
        purchase(&mut data, i64::MAX, "k1");
        assert_eq!(data.balance, i64::MAX);

        // A second large purchase under a fresh key must be a typed
        // rejection, never a wrapped (negative) balance.
        let r = data.credit(
            i64::MAX,
            EntryKind::Purchase,
            ExternalRef::Payment("pay_k2".into()),
            "k2".into(),
        );
        assert_eq!(r, Err(EngineError::InvalidAmount));
        assert_eq!(data.balance, i64::MAX);
        assert_eq!(data.entries.len(), 1);

        // Replaying the applied key still answers softly.
        assert!(purchase(&mut data, i64::MAX, "k1").is_duplicate());
    }

    #[test]
    fn non_positive_amounts_rejected() {
        let mut data = AccountData::new(AccountId(1), dec!(1));
        let r = data.credit(
            0,
            EntryKind::Purchase,
            ExternalRef::Payment("p".into()),
            "k1".into(),
        );
        assert_eq!(r, Err(EngineError::InvalidAmount));
        let r = data.debit(
            -5,
            EntryKind::ReadingDebit,
            ExternalRef::Payment("p".into()),
            "k2".into(),
        );
        assert_eq!(r, Err(EngineError::InvalidAmount));
        assert!(data.entries.is_empty());
    }

    #[test]
    fn deactivated_account_rejects_new_entries() {
        let mut data = AccountData::new(AccountId(1), dec!(1));
        purchase(&mut data, 100, "k1");
        data.deactivated = true;

        let r = data.credit(
            10,
            EntryKind::Purchase,
            ExternalRef::Payment("p2".into()),
            "k2".into(),
        );
        assert_eq!(r, Err(EngineError::AccountDeactivated));
        let r = data.debit(
            10,
            EntryKind::ReadingDebit,
            ExternalRef::Payment("p3".into()),
            "k3".into(),
        );
        assert_eq!(r, Err(EngineError::AccountDeactivated));

        // Replays of entries recorded before deactivation still answer softly.
        assert!(purchase(&mut data, 100, "k1").is_duplicate());
    }

    #[test]
    fn balance_equals_entry_sum() {
        let mut data = AccountData::new(AccountId(1), dec!(1));
        purchase(&mut data, 100, "k1");
        purchase(&mut data, 25, "k2");
        data.debit(
            40,
            EntryKind::ReadingDebit,
            ExternalRef::Reading(crate::base::ReadingId(1)),
            "k3".into(),
        )
        .unwrap();
        let sum: i64 = data.entries.iter().map(|e| e.amount).sum();
        assert_eq!(data.balance, sum);
        assert_eq!(data.balance, 85);
    }

    // === Ledger registry tests ===

    #[test]
    fn purchase_creates_account_with_default_rate() {
        let ledger = Ledger::new();
        ledger
            .credit(
                AccountId(1),
                100,
                EntryKind::Purchase,
                ExternalRef::Payment("pay_1".into()),
                "idem_1".into(),
            )
            .unwrap();
        assert_eq!(ledger.balance(AccountId(1)).unwrap(), 100);
        assert_eq!(
            ledger.rate_per_minute(AccountId(1)).unwrap(),
            Ledger::DEFAULT_RATE
        );
    }

    #[test]
    fn debit_unknown_account_fails() {
        let ledger = Ledger::new();
        let r = ledger.debit(
            AccountId(9),
            10,
            EntryKind::ReadingDebit,
            ExternalRef::Payment("p".into()),
            "k".into(),
        );
        assert_eq!(r, Err(EngineError::AccountNotFound(AccountId(9))));
    }

    #[test]
    fn open_account_is_idempotent() {
        let ledger = Ledger::new();
        ledger.open_account(AccountId(1), dec!(2.5));
        ledger.open_account(AccountId(1), dec!(9.9)); // no clobber
        assert_eq!(ledger.rate_per_minute(AccountId(1)).unwrap(), dec!(2.5));
    }

    // === Serialization tests ===

    #[test]
    fn serializer_rounds_rate_to_four_decimal_places() {
        let account = Account::new(AccountId(1), dec!(1.23456789));
        let json = serde_json::to_string(&account).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["account"], 1);
        assert_eq!(parsed["balance"], 0);
        assert_eq!(parsed["rate_per_minute"].as_str().unwrap(), "1.2346");
        assert_eq!(parsed["entries"], 0);
        assert_eq!(parsed["deactivated"], false);
    }
}
