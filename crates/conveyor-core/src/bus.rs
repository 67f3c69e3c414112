// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The message bus facade.
//!
//! [`MessageBus`] is what the surrounding platform talks to: it enqueues
//! messages, hands them to workers, records pipeline outcomes, and exposes
//! lookups and administrative operations. Every state change is a guarded
//! transition in the [`MessageStore`]; the bus adds throttling, stopping
//! mode, parent/child propagation and event publishing around it.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineSettings;
use crate::error::{BusError, ErrorCode, ErrorInfo, Result};
use crate::events::{BusEvent, EventNotifier};
use crate::node::{NodeIdentity, StaticNodeIdentity, StopService};
use crate::persistence::{
    CancelOutcome, ExternalCall, ExternalCallPrepare, Message, MessageStore, NewMessage,
    RestartMode, StartOutcome, TransitionRequest, repair_target,
};
use crate::poll_executor::PipelineOutcome;
use crate::pool::MessagePool;
use crate::repair::RepairService;
use crate::state::{ExternalCallState, MessageState};
use crate::sync_executor::SyncValueExecutor;
use crate::throttling::{ThrottleScope, Throttler, ThrottlingConfig};

/// Results returned by [`MessageBus::find_by_content`].
pub const FIND_BY_CONTENT_LIMIT: u32 = 50;

/// Asynchronous message bus bound to one store and one node identity.
pub struct MessageBus {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    throttler: Throttler,
    sync: Arc<SyncValueExecutor>,
    events: EventNotifier,
    stop: StopService,
    pool: MessagePool,
    repair: RepairService,
}

/// Builder for [`MessageBus`].
pub struct MessageBusBuilder {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    node: Arc<dyn NodeIdentity>,
    settings: EngineSettings,
    throttling: ThrottlingConfig,
    sync: Option<Arc<SyncValueExecutor>>,
    events: Option<EventNotifier>,
    stop: Option<StopService>,
}

impl std::fmt::Debug for MessageBusBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBusBuilder")
            .field("node_id", &self.node.current_node_id())
            .field("settings", &self.settings)
            .field("throttling", &self.throttling)
            .finish()
    }
}

impl MessageBusBuilder {
    /// Time source, defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Node identity, defaults to `local`.
    pub fn node(mut self, node: Arc<dyn NodeIdentity>) -> Self {
        self.node = node;
        self
    }

    /// Engine intervals and limits.
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Throttling rules, unthrottled by default.
    pub fn throttling(mut self, throttling: ThrottlingConfig) -> Self {
        self.throttling = throttling;
        self
    }

    /// Share a synchronized-value executor with other components.
    pub fn sync_executor(mut self, sync: Arc<SyncValueExecutor>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Share an event channel with other components.
    pub fn events(mut self, events: EventNotifier) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a stopping flag with other components.
    pub fn stop_service(mut self, stop: StopService) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Assemble the bus.
    pub fn build(self) -> MessageBus {
        let events = self.events.unwrap_or_default();
        let pool = MessagePool::new(
            self.store.clone(),
            self.clock.clone(),
            self.node,
            self.settings.clone(),
            events.clone(),
        );
        let repair = RepairService::new(
            self.store.clone(),
            self.clock.clone(),
            self.settings.clone(),
            events.clone(),
        );

        MessageBus {
            store: self.store,
            clock: self.clock,
            settings: self.settings,
            throttler: Throttler::new(self.throttling),
            sync: self.sync.unwrap_or_default(),
            events,
            stop: self.stop.unwrap_or_default(),
            pool,
            repair,
        }
    }
}

impl MessageBus {
    /// Start building a bus over `store`.
    pub fn builder(store: Arc<dyn MessageStore>) -> MessageBusBuilder {
        MessageBusBuilder {
            store,
            clock: Arc::new(SystemClock),
            node: Arc::new(StaticNodeIdentity::new("local")),
            settings: EngineSettings::default(),
            throttling: ThrottlingConfig::new(),
            sync: None,
            events: None,
            stop: None,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Engine settings in use.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Event channel.
    pub fn events(&self) -> &EventNotifier {
        &self.events
    }

    /// Stopping flag.
    pub fn stop_service(&self) -> &StopService {
        &self.stop
    }

    /// Synchronized-value executor.
    pub fn sync_executor(&self) -> &Arc<SyncValueExecutor> {
        &self.sync
    }

    /// Message pool used by workers.
    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    /// Repair sweeps.
    pub fn repair_service(&self) -> &RepairService {
        &self.repair
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Durably enqueue a message in state NEW.
    pub async fn insert(&self, message: &NewMessage) -> Result<Message> {
        let inserted = self.store.insert_message(message, self.clock.now()).await?;
        debug!(
            message_id = inserted.id,
            correlation_id = %inserted.correlation_id,
            source_system = %inserted.source_system,
            "Message inserted"
        );
        Ok(inserted)
    }

    /// Enqueue messages in one transaction; either all are inserted or none.
    pub async fn insert_batch(&self, messages: &[NewMessage]) -> Result<Vec<Message>> {
        let inserted = self.store.insert_messages(messages, self.clock.now()).await?;
        debug!(count = inserted.len(), "Message batch inserted");
        Ok(inserted)
    }

    /// Accept a message from a source system.
    ///
    /// Rejected with [`BusError::Stopping`] while the node is stopping and
    /// with [`BusError::ThrottlingExceeded`] when the scope is over its
    /// limit; in both cases nothing is stored.
    pub async fn submit(&self, message: &NewMessage) -> Result<Message> {
        if self.stop.is_stopping() {
            return Err(BusError::Stopping);
        }
        self.admit(&ThrottleScope::new(
            message.source_system.as_str(),
            message.service.as_str(),
        ))?;
        self.insert(message).await
    }

    /// Throttling admission check for `scope`.
    pub fn admit(&self, scope: &ThrottleScope) -> Result<()> {
        self.throttler.admit(scope, self.clock.now())
    }

    /// Run `body` exclusively for `(scope_type, key)` within this process.
    pub async fn run_exclusive<F, Fut, T>(&self, scope_type: &str, key: &str, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.sync.run(scope_type, key, body).await
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Claim the next eligible message for this node.
    pub async fn claim_next(&self) -> Result<Option<Message>> {
        self.pool.claim_next().await
    }

    /// Move a claimed message to PROCESSING after the guaranteed order re-check.
    pub async fn start_processing(&self, message: &Message) -> Result<StartOutcome> {
        self.pool.start_processing(message).await
    }

    /// Record a pipeline outcome for a PROCESSING message.
    pub async fn apply_outcome(&self, message_id: i64, outcome: PipelineOutcome) -> Result<Message> {
        match outcome {
            PipelineOutcome::Ok => self.mark_ok(message_id).await,
            PipelineOutcome::Waiting => self.mark_waiting(message_id).await,
            PipelineOutcome::WaitingForResponse => self.mark_waiting_for_response(message_id).await,
            PipelineOutcome::RetryableError(error) => {
                self.mark_partly_failed(message_id, error).await
            }
            PipelineOutcome::FatalError(error) => self.mark_failed(message_id, error).await,
        }
    }

    // ------------------------------------------------------------------
    // State mutators
    // ------------------------------------------------------------------

    async fn transition(&self, request: TransitionRequest) -> Result<Message> {
        let requested = request.to;
        let message = self.store.transition(&request).await?;
        debug!(
            message_id = message.id,
            requested = %requested,
            state = %message.state,
            "Message state changed"
        );
        if let Some(event) = BusEvent::for_state(&message) {
            self.events.publish(event);
        }
        Ok(message)
    }

    /// Resume a WAITING_FOR_RES message once its asynchronous response arrived.
    pub async fn mark_processing(&self, message_id: i64) -> Result<Message> {
        self.transition(
            TransitionRequest::new(message_id, MessageState::Processing, self.clock.now())
                .only_from(&[MessageState::WaitingForRes]),
        )
        .await
    }

    /// Finish a message successfully and complete waiting HARD parents.
    pub async fn mark_ok(&self, message_id: i64) -> Result<Message> {
        let message = self
            .transition(TransitionRequest::new(
                message_id,
                MessageState::Ok,
                self.clock.now(),
            ))
            .await?;
        if message.state == MessageState::Ok {
            self.complete_parents(&message).await?;
        }
        Ok(message)
    }

    /// Park a message until its HARD children finish. Completes it right
    /// away when they already have.
    pub async fn mark_waiting(&self, message_id: i64) -> Result<Message> {
        let message = self
            .transition(TransitionRequest::new(
                message_id,
                MessageState::Waiting,
                self.clock.now(),
            ))
            .await?;
        if message.state != MessageState::Waiting {
            return Ok(message);
        }
        self.settle_waiting(message).await
    }

    /// Park a message until an external system answers asynchronously.
    pub async fn mark_waiting_for_response(&self, message_id: i64) -> Result<Message> {
        self.transition(TransitionRequest::new(
            message_id,
            MessageState::WaitingForRes,
            self.clock.now(),
        ))
        .await
    }

    /// Record a recoverable failure. Escalates to FAILED once the message
    /// reaches `count_partly_fails_before_failed` failures.
    pub async fn mark_partly_failed(&self, message_id: i64, error: ErrorInfo) -> Result<Message> {
        let current = self.find_by_id(message_id).await?;
        let target = repair_target(
            &current,
            current.failed_count.saturating_add(1),
            self.settings.count_partly_fails_before_failed,
        );

        let message = self
            .transition(
                TransitionRequest::new(message_id, target, self.clock.now())
                    .with_error(error)
                    .incrementing_failures(),
            )
            .await?;

        if message.state == MessageState::Failed {
            warn!(
                message_id,
                failed_count = message.failed_count,
                "Message failed after repeated recoverable errors"
            );
            self.fail_parents(&message).await?;
        }
        Ok(message)
    }

    /// Fail a message permanently; HARD ancestors fail with it.
    pub async fn mark_failed(&self, message_id: i64, error: ErrorInfo) -> Result<Message> {
        let message = self
            .transition(
                TransitionRequest::new(message_id, MessageState::Failed, self.clock.now())
                    .with_error(error),
            )
            .await?;
        if message.state == MessageState::Failed {
            self.fail_parents(&message).await?;
        }
        Ok(message)
    }

    /// Yield to another message of the same funnel value.
    pub async fn mark_postponed(&self, message_id: i64) -> Result<Message> {
        self.transition(TransitionRequest::new(
            message_id,
            MessageState::Postponed,
            self.clock.now(),
        ))
        .await
    }

    /// Administrative cancel. A PROCESSING message finishes its current
    /// attempt first and is cancelled when it reports a non-terminal outcome.
    pub async fn mark_cancel(&self, message_id: i64) -> Result<CancelOutcome> {
        let outcome = self.store.request_cancel(message_id, self.clock.now()).await?;
        match &outcome {
            CancelOutcome::Cancelled(message) => {
                info!(message_id = message.id, "Message cancelled");
                self.events.publish(BusEvent::Cancelled {
                    message_id: message.id,
                });
            }
            CancelOutcome::Deferred(message) => {
                info!(
                    message_id = message.id,
                    "Message is processing, cancel deferred to the end of the attempt"
                );
            }
        }
        Ok(outcome)
    }

    /// Administrative restart.
    pub async fn restart(
        &self,
        message_id: i64,
        mode: RestartMode,
        drop_external_calls: bool,
    ) -> Result<Message> {
        let message = self
            .store
            .restart(message_id, mode, drop_external_calls, self.clock.now())
            .await?;
        info!(
            message_id,
            mode = ?mode,
            state = %message.state,
            drop_external_calls,
            "Message restarted"
        );
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Parent/child propagation
    // ------------------------------------------------------------------

    async fn hard_children_done(&self, parent_id: i64) -> Result<bool> {
        let children = self.store.find_children(parent_id).await?;
        let mut hard = children.iter().filter(|c| c.is_hard_child()).peekable();
        Ok(hard.peek().is_some() && hard.all(|c| c.state == MessageState::Ok))
    }

    async fn settle_waiting(&self, waiting: Message) -> Result<Message> {
        if !self.hard_children_done(waiting.id).await? {
            return Ok(waiting);
        }
        let completed = self
            .transition(
                TransitionRequest::new(waiting.id, MessageState::Ok, self.clock.now())
                    .only_from(&[MessageState::Waiting]),
            )
            .await?;
        self.complete_parents(&completed).await?;
        Ok(completed)
    }

    async fn complete_parents(&self, child: &Message) -> Result<()> {
        let mut current = child.clone();
        while current.is_hard_child() && current.state == MessageState::Ok {
            let Some(parent_id) = current.parent_message_id else {
                break;
            };
            let Some(parent) = self.store.get_message(parent_id).await? else {
                break;
            };
            if parent.state != MessageState::Waiting || !self.hard_children_done(parent_id).await?
            {
                break;
            }

            match self
                .transition(
                    TransitionRequest::new(parent_id, MessageState::Ok, self.clock.now())
                        .only_from(&[MessageState::Waiting]),
                )
                .await
            {
                Ok(completed) => current = completed,
                // another child completed the parent first
                Err(BusError::InvalidTransition { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn fail_parents(&self, child: &Message) -> Result<()> {
        fail_hard_ancestors(
            self.store.as_ref(),
            &self.events,
            child,
            self.clock.now(),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Load a message by id.
    pub async fn find_by_id(&self, message_id: i64) -> Result<Message> {
        self.store
            .get_message(message_id)
            .await?
            .ok_or(BusError::MessageNotFound { message_id })
    }

    /// Find a message for idempotent re-delivery.
    pub async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
        source_system: Option<&str>,
    ) -> Result<Option<Message>> {
        self.store
            .find_by_correlation_id(correlation_id, source_system)
            .await
    }

    /// Messages whose payload contains `substring`, newest first.
    pub async fn find_by_content(&self, substring: &str) -> Result<Vec<Message>> {
        self.store
            .find_by_content(substring, FIND_BY_CONTENT_LIMIT)
            .await
    }

    /// Children of a message.
    pub async fn find_children(&self, parent_id: i64) -> Result<Vec<Message>> {
        self.store.find_children(parent_id).await
    }

    /// Number of messages in `state`.
    pub async fn count_by_state(&self, state: MessageState) -> Result<i64> {
        self.store.count_by_state(state).await
    }

    // ------------------------------------------------------------------
    // Repair
    // ------------------------------------------------------------------

    /// Reclaim messages abandoned by crashed workers.
    pub async fn repair_stuck_messages(&self) -> Result<Vec<Message>> {
        self.repair.repair_stuck_messages().await
    }

    /// Release external calls abandoned by crashed workers.
    pub async fn repair_stuck_external_calls(&self) -> Result<Vec<ExternalCall>> {
        self.repair.repair_stuck_external_calls().await
    }

    // ------------------------------------------------------------------
    // External calls
    // ------------------------------------------------------------------

    /// Acquire the right to call `operation` for `entity_id` on behalf of `message`.
    pub async fn prepare_external_call(
        &self,
        operation: &str,
        entity_id: &str,
        message: &Message,
    ) -> Result<ExternalCallPrepare> {
        let prepared = self
            .store
            .prepare_external_call(operation, entity_id, message, self.clock.now())
            .await?;
        if let ExternalCallPrepare::Skipped { existing, reason } = &prepared {
            debug!(
                message_id = message.id,
                operation,
                entity_id,
                existing_msg_id = existing.msg_id,
                reason = %reason,
                "External call skipped"
            );
        }
        Ok(prepared)
    }

    /// Close an external call as succeeded.
    pub async fn complete_external_call(&self, call_id: i64) -> Result<ExternalCall> {
        self.store
            .finish_external_call(call_id, ExternalCallState::Ok, self.clock.now())
            .await
    }

    /// Close an external call as failed so a retry may call again.
    pub async fn fail_external_call(&self, call_id: i64) -> Result<ExternalCall> {
        self.store
            .finish_external_call(call_id, ExternalCallState::Failed, self.clock.now())
            .await
    }

    /// Current record for `(operation, entity_id)`.
    pub async fn find_external_call(
        &self,
        operation: &str,
        entity_id: &str,
    ) -> Result<Option<ExternalCall>> {
        self.store.get_external_call(operation, entity_id).await
    }
}

/// Fail the HARD ancestors of a failed message, carrying its error.
pub(crate) async fn fail_hard_ancestors(
    store: &dyn MessageStore,
    events: &EventNotifier,
    child: &Message,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    let error = child
        .error()
        .unwrap_or_else(|| ErrorInfo::from_code(ErrorCode::Unspecified));

    let mut current = child.clone();
    while current.is_hard_child() {
        let Some(parent_id) = current.parent_message_id else {
            break;
        };
        let request =
            TransitionRequest::new(parent_id, MessageState::Failed, now).with_error(error.clone());
        match store.transition(&request).await {
            Ok(parent) => {
                warn!(
                    message_id = parent.id,
                    child_id = current.id,
                    code = %error.code,
                    "Parent failed because a HARD child failed"
                );
                events.publish(BusEvent::Failed {
                    message_id: parent.id,
                    code: parent.failed_error_code.clone(),
                });
                current = parent;
            }
            // already terminal
            Err(BusError::InvalidTransition { .. }) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
