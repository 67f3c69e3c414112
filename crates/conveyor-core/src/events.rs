// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle notifications.
//!
//! [`EventNotifier`] wraps a [`tokio::sync::broadcast`] channel. Publishing
//! never blocks and never fails; with no subscribers the event is dropped,
//! and slow subscribers see `RecvError::Lagged` instead of slowing the bus.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::MessageState;

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Something that happened to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// Claimed by a node, now IN_QUEUE.
    Claimed {
        /// Message id.
        message_id: i64,
        /// Claiming node.
        node_id: String,
    },
    /// Postponed by a funnel.
    Postponed {
        /// Message id.
        message_id: i64,
        /// Funnel value it waits for.
        funnel_value: Option<String>,
    },
    /// Finished successfully.
    Completed {
        /// Message id.
        message_id: i64,
    },
    /// Waiting for children or an asynchronous response.
    Waiting {
        /// Message id.
        message_id: i64,
        /// WAITING or WAITING_FOR_RES.
        state: MessageState,
    },
    /// Recoverable failure.
    PartlyFailed {
        /// Message id.
        message_id: i64,
        /// Failures so far.
        failed_count: i32,
    },
    /// Permanent failure.
    Failed {
        /// Message id.
        message_id: i64,
        /// Recorded error code.
        code: Option<String>,
    },
    /// Cancelled.
    Cancelled {
        /// Message id.
        message_id: i64,
    },
    /// Moved out of a stuck state by the repair sweep.
    Repaired {
        /// Message id.
        message_id: i64,
        /// State after the repair.
        state: MessageState,
    },
}

impl BusEvent {
    /// The message the event is about.
    pub fn message_id(&self) -> i64 {
        match self {
            Self::Claimed { message_id, .. }
            | Self::Postponed { message_id, .. }
            | Self::Completed { message_id }
            | Self::Waiting { message_id, .. }
            | Self::PartlyFailed { message_id, .. }
            | Self::Failed { message_id, .. }
            | Self::Cancelled { message_id }
            | Self::Repaired { message_id, .. } => *message_id,
        }
    }

    /// Event for a message that has just been written in `state`.
    pub(crate) fn for_state(message: &crate::persistence::Message) -> Option<Self> {
        let message_id = message.id;
        Some(match message.state {
            MessageState::Ok => Self::Completed { message_id },
            MessageState::Waiting | MessageState::WaitingForRes => Self::Waiting {
                message_id,
                state: message.state,
            },
            MessageState::PartlyFailed => Self::PartlyFailed {
                message_id,
                failed_count: message.failed_count,
            },
            MessageState::Failed => Self::Failed {
                message_id,
                code: message.failed_error_code.clone(),
            },
            MessageState::Cancel => Self::Cancelled { message_id },
            MessageState::Postponed => Self::Postponed {
                message_id,
                funnel_value: message.funnel_value.clone(),
            },
            MessageState::InQueue => Self::Claimed {
                message_id,
                node_id: message.node_id.clone().unwrap_or_default(),
            },
            MessageState::New | MessageState::Processing => return None,
        })
    }
}

/// Broadcast channel for [`BusEvent`]s.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    tx: broadcast::Sender<BusEvent>,
}

impl EventNotifier {
    /// Create a notifier; capacity is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send to all current subscribers.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    /// New receiver seeing events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::tests::message;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let notifier = EventNotifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.publish(BusEvent::Completed { message_id: 7 });
        assert_eq!(rx.recv().await.unwrap(), BusEvent::Completed { message_id: 7 });
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = EventNotifier::new(0);
        notifier.publish(BusEvent::Cancelled { message_id: 1 });
    }

    #[test]
    fn test_event_for_state() {
        let mut m = message(3);
        assert!(BusEvent::for_state(&m).is_none());

        m.state = MessageState::Failed;
        m.failed_error_code = Some("E116".to_string());
        let event = BusEvent::for_state(&m).unwrap();
        assert_eq!(event.message_id(), 3);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"type": "failed", "message_id": 3, "code": "E116"})
        );
    }
}
