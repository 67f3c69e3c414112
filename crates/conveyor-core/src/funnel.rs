// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Funnel decisions.
//!
//! A funnel lets at most one message per funnel value run at a time and,
//! with guaranteed order, runs them in `msg_timestamp` order. The store
//! gathers the facts (how many holders are running, which message is first
//! in line) inside the same transaction that changes the state, and the
//! functions here turn those facts into a decision.
//!
//! ```text
//!  candidate ──► funnel value? ──no──► Proceed
//!                    │ yes
//!                    ▼
//!         running holders > 0 ? ──yes──► Postpone(FunnelBusy)
//!                    │ no
//!                    ▼
//!     guaranteed order and not first ? ──yes──► Postpone(NotFirstInOrder)
//!                    │ no
//!                    ▼
//!                 Proceed
//! ```

use chrono::{DateTime, Utc};

use crate::persistence::Message;
use crate::state::MessageState;

/// Scope type used with the synchronized-value executor for funnel values.
pub const FUNNEL_SCOPE: &str = "funnel";

/// Why a candidate has to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostponeReason {
    /// Another message with the same funnel value is running.
    FunnelBusy {
        /// Running holders found.
        running: i64,
    },
    /// An older message with the same funnel value is still live.
    NotFirstInOrder {
        /// The message first in line.
        head_id: i64,
    },
}

/// Claim-time funnel decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelDecision {
    /// The message may be claimed.
    Proceed,
    /// The message must be postponed.
    Postpone(PostponeReason),
}

/// Dispatch-time decision after re-checking guaranteed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    /// Start processing.
    Start,
    /// Postpone again.
    Postpone {
        /// The message first in line.
        head_id: i64,
    },
    /// Waited too long behind an older message, fail with E121.
    FailPostponedTooLong {
        /// The message first in line.
        head_id: i64,
    },
}

/// States that hold a funnel value.
pub fn running_states() -> &'static [MessageState] {
    &MessageState::FUNNEL_RUNNING
}

/// States taking part in guaranteed order for `message`.
pub fn order_states(message: &Message) -> Vec<MessageState> {
    let mut states = MessageState::ORDERED.to_vec();
    if !message.exclude_failed_state {
        states.push(MessageState::Failed);
    }
    states
}

/// Whether the guaranteed-order head must be looked up.
pub fn needs_order_check(message: &Message) -> bool {
    message.funnel_value.is_some() && message.guaranteed_order
}

/// Decide whether a candidate may be claimed.
///
/// `running` excludes the candidate itself. `head_id` is the first live
/// message with the same funnel value, looked up only when
/// [`needs_order_check`] holds.
pub fn decide(message: &Message, running: i64, head_id: Option<i64>) -> FunnelDecision {
    if message.funnel_value.is_none() {
        return FunnelDecision::Proceed;
    }
    if running > 0 {
        return FunnelDecision::Postpone(PostponeReason::FunnelBusy { running });
    }
    match head_id {
        Some(head_id) if message.guaranteed_order && head_id != message.id => {
            FunnelDecision::Postpone(PostponeReason::NotFirstInOrder { head_id })
        }
        _ => FunnelDecision::Proceed,
    }
}

/// Re-check guaranteed order just before processing.
pub fn dispatch_decision(
    message: &Message,
    head_id: Option<i64>,
    fail_received_before: DateTime<Utc>,
) -> DispatchDecision {
    if !needs_order_check(message) {
        return DispatchDecision::Start;
    }
    match head_id {
        Some(head_id) if head_id != message.id => {
            if message.receive_timestamp < fail_received_before {
                DispatchDecision::FailPostponedTooLong { head_id }
            } else {
                DispatchDecision::Postpone { head_id }
            }
        }
        _ => DispatchDecision::Start,
    }
}

/// Key for local exclusivity of a funnel value, scoped by component.
pub fn sync_key(message: &Message) -> Option<String> {
    message.funnel_value.as_ref().map(|value| {
        format!(
            "{}:{}",
            message.funnel_component_id.as_deref().unwrap_or_default(),
            value
        )
    })
}
