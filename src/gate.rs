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

//! Reconciliation gate for payment-processor webhooks.
//!
//! Webhook delivery is at-least-once and unordered. The gate makes it safe:
//! each event carries an idempotency key; the key is recorded only after the
//! dispatched operation succeeds, and a replay returns the recorded result as
//! [`GateOutcome::AlreadyApplied`] without re-executing side effects. Retries
//! must be answered with a 2xx-equivalent, so a replay is not an error.
//!
//! Payload kinds form a closed set with an [`Unrecognized`] fallback that is
//! logged and ignored rather than crashing the receiver.
//!
//! [`Unrecognized`]: ExternalEventKind::Unrecognized

use crate::base::{IdempotencyKey, ReadingId};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::reading::{Actor, ReadingEvent, ReadingState};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::{debug, warn};

/// Event emitted by the payment processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    /// Processor event id; the dedup key for delivery retries.
    pub idempotency_key: IdempotencyKey,
    pub kind: ExternalEventKind,
}

/// Known payment event kinds, with a fallback for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalEventKind {
    PaymentSucceeded {
        payment_id: String,
        reading_id: ReadingId,
    },
    PaymentFailed {
        payment_id: String,
        reading_id: ReadingId,
    },
    Unrecognized {
        raw_kind: String,
    },
}

impl ExternalEventKind {
    /// Maps a wire-level event type to a known kind. Anything unknown or
    /// missing its correlation fields becomes [`Self::Unrecognized`].
    pub fn from_wire(
        raw_kind: &str,
        payment_id: Option<String>,
        reading_id: Option<ReadingId>,
    ) -> Self {
        match (raw_kind, payment_id, reading_id) {
            ("payment.succeeded", Some(payment_id), Some(reading_id)) => Self::PaymentSucceeded {
                payment_id,
                reading_id,
            },
            ("payment.failed", Some(payment_id), Some(reading_id)) => Self::PaymentFailed {
                payment_id,
                reading_id,
            },
            _ => Self::Unrecognized {
                raw_kind: raw_kind.to_owned(),
            },
        }
    }
}

/// Result of pushing one external event through the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Event dispatched; the reading ended in this state.
    Applied(ReadingState),
    /// Key seen before; recorded result returned, no side effects re-run.
    AlreadyApplied(ReadingState),
    /// Unrecognized kind; logged and dropped.
    Ignored,
}

#[derive(Debug, Clone)]
enum AppliedRecord {
    /// Dispatch in progress on another task.
    InFlight,
    Done(GateOutcome),
}

/// Idempotency and consistency layer between webhook delivery and the engine.
pub struct ReconciliationGate {
    engine: Arc<Engine>,
    /// Applied keys; two-phase so a key is never marked done before its
    /// side effects landed.
    applied: DashMap<IdempotencyKey, AppliedRecord>,
    /// Arrival order of successfully applied keys, for audit.
    order: SegQueue<IdempotencyKey>,
}

impl ReconciliationGate {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            applied: DashMap::new(),
            order: SegQueue::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Applies an external event at most once.
    ///
    /// | Situation | Result |
    /// |-----------|--------|
    /// | First delivery, dispatch succeeds | `Applied` |
    /// | Redelivery of an applied key | `AlreadyApplied` (soft, no side effects) |
    /// | Unknown event kind | `Ignored` (logged) |
    /// | Same key mid-flight elsewhere | `Err(ConcurrencyConflict)` - retry |
    /// | Dispatch fails | the error; no key recorded, redelivery re-attempts |
    pub fn apply_external_event(&self, event: ExternalEvent) -> Result<GateOutcome, EngineError> {
        // Atomic check-and-insert; the entry lock is dropped before dispatch
        // so unrelated keys on the same shard are never blocked on I/O.
        match self.applied.entry(event.idempotency_key.clone()) {
            Entry::Occupied(occupied) => {
                return match occupied.get() {
                    AppliedRecord::InFlight => Err(EngineError::ConcurrencyConflict),
                    AppliedRecord::Done(outcome) => Ok(match outcome {
                        GateOutcome::Applied(state) | GateOutcome::AlreadyApplied(state) => {
                            GateOutcome::AlreadyApplied(*state)
                        }
                        GateOutcome::Ignored => GateOutcome::Ignored,
                    }),
                };
            }
            Entry::Vacant(vacant) => {
                vacant.insert(AppliedRecord::InFlight);
            }
        }

        match self.dispatch(&event.kind) {
            Ok(outcome) => {
                debug!(key = %event.idempotency_key, outcome = ?outcome, "external event applied");
                self.applied.insert(
                    event.idempotency_key.clone(),
                    AppliedRecord::Done(outcome.clone()),
                );
                self.order.push(event.idempotency_key);
                Ok(outcome)
            }
            Err(error) => {
                // No record for failed events: the next delivery re-attempts.
                self.applied.remove(&event.idempotency_key);
                Err(error)
            }
        }
    }

    fn dispatch(&self, kind: &ExternalEventKind) -> Result<GateOutcome, EngineError> {
        match kind {
            ExternalEventKind::PaymentSucceeded {
                payment_id,
                reading_id,
            } => {
                let state = self.engine.transition(
                    *reading_id,
                    ReadingEvent::PaymentConfirmed {
                        payment_id: payment_id.clone(),
                    },
                    Actor::System,
                )?;
                Ok(GateOutcome::Applied(state))
            }
            ExternalEventKind::PaymentFailed { reading_id, .. } => {
                let state =
                    self.engine
                        .transition(*reading_id, ReadingEvent::PaymentFailed, Actor::System)?;
                Ok(GateOutcome::Applied(state))
            }
            ExternalEventKind::Unrecognized { raw_kind } => {
                warn!(kind = %raw_kind, "unrecognized payment event ignored");
                Ok(GateOutcome::Ignored)
            }
        }
    }

    /// Number of events recorded as applied.
    pub fn applied_len(&self) -> usize {
        self.order.len()
    }
}
