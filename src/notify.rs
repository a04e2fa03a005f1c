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

//! Fire-and-forget notification transport seam.
//!
//! The engine notifies both parties after a successful transition. Transport
//! failures are logged and dropped; they never roll back a transition.

use crate::base::{AccountId, ReadingId};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ReadingScheduled,
    ReadingStarted,
    ReadingCompleted,
    ReadingCancelled,
    DisputeFiled,
    DisputeResolved,
}

/// Transport-level delivery failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("notification transport failed: {0}")]
pub struct NotifyError(pub String);

/// Outbound notification transport (pub/sub, push, email; the engine does
/// not care which).
pub trait Notifier: Send + Sync {
    fn notify(
        &self,
        user: AccountId,
        kind: NotificationKind,
        reading_id: ReadingId,
        message: &str,
    ) -> Result<(), NotifyError>;
}

/// Discards all notifications. Default transport for an engine without one.
#[derive(Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(
        &self,
        _user: AccountId,
        _kind: NotificationKind,
        _reading_id: ReadingId,
        _message: &str,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Captures notifications in memory, for tests and demos.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(AccountId, NotificationKind, ReadingId)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(AccountId, NotificationKind, ReadingId)> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(
        &self,
        user: AccountId,
        kind: NotificationKind,
        reading_id: ReadingId,
        _message: &str,
    ) -> Result<(), NotifyError> {
        self.sent.lock().push((user, kind, reading_id));
        Ok(())
    }
}
