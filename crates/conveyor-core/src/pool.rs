// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message pool: hands the next eligible message to a worker.
//!
//! Eligibility is decided by the store inside the claiming transaction:
//! POSTPONED messages after `postponed_interval`, PARTLY_FAILED messages
//! after `partly_failed_interval`, then NEW messages, oldest `msg_timestamp`
//! first, each subject to the funnel check. The claim is committed before
//! [`MessagePool::claim_next`] returns, so other nodes see it immediately.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::fail_hard_ancestors;
use crate::clock::Clock;
use crate::config::{EngineSettings, cutoff};
use crate::error::Result;
use crate::events::{BusEvent, EventNotifier};
use crate::node::NodeIdentity;
use crate::persistence::{ClaimRequest, Message, MessageStore, StartOutcome, StartRequest};

/// Claims messages on behalf of this node.
#[derive(Clone)]
pub struct MessagePool {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    node: Arc<dyn NodeIdentity>,
    settings: EngineSettings,
    events: EventNotifier,
}

impl MessagePool {
    /// Create a pool over `store`.
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        node: Arc<dyn NodeIdentity>,
        settings: EngineSettings,
        events: EventNotifier,
    ) -> Self {
        Self {
            store,
            clock,
            node,
            settings,
            events,
        }
    }

    fn claim_request(&self) -> ClaimRequest {
        let now = self.clock.now();
        ClaimRequest {
            now,
            node_id: self.node.current_node_id(),
            postponed_before: cutoff(now, self.settings.postponed_interval),
            partly_failed_before: cutoff(now, self.settings.partly_failed_interval),
            funnel_idle_before: cutoff(now, self.settings.funnel_idle_interval),
            max_postpones: self.settings.max_postpones_per_claim,
        }
    }

    /// Claim the next eligible message, now IN_QUEUE, or `None` if there is
    /// nothing to do. Callers poll again later.
    pub async fn claim_next(&self) -> Result<Option<Message>> {
        let request = self.claim_request();
        let result = self.store.claim_next(&request).await?;

        for postponed in &result.postponed {
            self.events.publish(BusEvent::Postponed {
                message_id: postponed.id,
                funnel_value: postponed.funnel_value.clone(),
            });
        }

        if let Some(message) = &result.message {
            debug!(
                message_id = message.id,
                node_id = %request.node_id,
                failed_count = message.failed_count,
                "Message claimed"
            );
            self.events.publish(BusEvent::Claimed {
                message_id: message.id,
                node_id: request.node_id,
            });
        }

        Ok(result.message)
    }

    /// Move a claimed message to PROCESSING, re-checking guaranteed order.
    pub async fn start_processing(&self, message: &Message) -> Result<StartOutcome> {
        let now = self.clock.now();
        let request = StartRequest {
            message_id: message.id,
            now,
            node_id: self.node.current_node_id(),
            fail_received_before: cutoff(now, self.settings.postponed_interval_when_failed),
        };
        let outcome = self.store.start_processing(&request).await?;

        match &outcome {
            StartOutcome::Started(started) => {
                debug!(message_id = started.id, "Message processing started");
            }
            StartOutcome::Postponed(postponed) => {
                debug!(
                    message_id = postponed.id,
                    "Message did not pass the guaranteed order check"
                );
                if let Some(event) = BusEvent::for_state(postponed) {
                    self.events.publish(event);
                }
            }
            StartOutcome::Failed(failed) => {
                warn!(
                    message_id = failed.id,
                    code = ?failed.failed_error_code,
                    "Message postponed for too long, failing it"
                );
                if let Some(event) = BusEvent::for_state(failed) {
                    self.events.publish(event);
                }
                fail_hard_ancestors(self.store.as_ref(), &self.events, failed, now).await?;
            }
            StartOutcome::Skipped(skipped) => {
                debug!(
                    message_id = skipped.id,
                    state = %skipped.state,
                    "Claimed message changed state before processing"
                );
            }
        }

        Ok(outcome)
    }
}
