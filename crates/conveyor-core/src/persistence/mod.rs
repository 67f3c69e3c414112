// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for conveyor-core.
//!
//! The message table is the single source of truth. Every state change goes
//! through a [`MessageStore`] method that checks the current state and
//! writes the new one in one transaction.

/// PostgreSQL backend.
pub mod postgres;
/// SQLite backend.
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{BusError, ErrorInfo, Result};
use crate::external_call::SkipReason;
use crate::state::{BindingType, ExternalCallState, MessageState};

/// Columns selected for every [`Message`] query.
pub(crate) const MESSAGE_COLUMNS: &str = "id, source_system, service, operation_name, object_id, \
    entity_type, correlation_id, parent_message_id, parent_binding_type, has_children, \
    funnel_value, funnel_component_id, guaranteed_order, exclude_failed_state, state, \
    failed_count, failed_error_code, failed_description, node_id, cancel_requested, \
    msg_timestamp, receive_timestamp, start_in_queue_timestamp, start_process_timestamp, \
    last_update_timestamp, payload";

/// Columns selected for every [`ExternalCall`] query.
pub(crate) const EXTERNAL_CALL_COLUMNS: &str = "id, operation_name, entity_id, msg_id, \
    msg_timestamp, state, failed_count, creation_timestamp, last_update_timestamp";

/// Message record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Message {
    /// Database-assigned identifier.
    pub id: i64,
    /// System that sent the message.
    pub source_system: String,
    /// Service the message belongs to.
    pub service: String,
    /// Operation requested by the source system.
    pub operation_name: String,
    /// Business entity being mutated.
    pub object_id: Option<String>,
    /// Type of the business entity.
    pub entity_type: Option<String>,
    /// Correlation identifier, unique per source system.
    pub correlation_id: String,
    /// Parent message for children spawned during processing.
    pub parent_message_id: Option<i64>,
    /// `HARD` or `SOFT`, set for child messages.
    pub parent_binding_type: Option<String>,
    /// Set on a parent once a HARD child exists.
    pub has_children: bool,
    /// Business key serializing messages in a funnel.
    pub funnel_value: Option<String>,
    /// Funnel configuration owning the value.
    pub funnel_component_id: Option<String>,
    /// Strict FIFO by `msg_timestamp` among messages with the same funnel value.
    pub guaranteed_order: bool,
    /// Ignore FAILED messages when checking guaranteed order.
    pub exclude_failed_state: bool,
    /// Current state.
    #[sqlx(try_from = "String")]
    pub state: MessageState,
    /// Recoverable failures so far.
    pub failed_count: i32,
    /// Code of the last failure.
    pub failed_error_code: Option<String>,
    /// Description of the last failure.
    pub failed_description: Option<String>,
    /// Node that last claimed the message.
    pub node_id: Option<String>,
    /// Cancellation requested while the message was processing.
    pub cancel_requested: bool,
    /// Business event time, the ordering key.
    pub msg_timestamp: DateTime<Utc>,
    /// When the message was received.
    pub receive_timestamp: DateTime<Utc>,
    /// When the message was last claimed.
    pub start_in_queue_timestamp: Option<DateTime<Utc>>,
    /// When processing last started.
    pub start_process_timestamp: Option<DateTime<Utc>>,
    /// Updated on every transition.
    pub last_update_timestamp: DateTime<Utc>,
    /// Opaque business body.
    pub payload: String,
}

impl Message {
    /// Parsed binding to the parent.
    pub fn binding(&self) -> Option<BindingType> {
        self.parent_binding_type
            .as_deref()
            .and_then(|b| b.parse().ok())
    }

    /// Whether this message is a HARD child.
    pub fn is_hard_child(&self) -> bool {
        self.parent_message_id.is_some() && self.binding() == Some(BindingType::Hard)
    }

    /// Recorded failure, if any.
    pub fn error(&self) -> Option<ErrorInfo> {
        self.failed_error_code.as_ref().map(|code| {
            ErrorInfo::new(code.clone(), self.failed_description.clone().unwrap_or_default())
        })
    }
}

/// A message to insert.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// System that sent the message.
    pub source_system: String,
    /// Service the message belongs to.
    pub service: String,
    /// Operation requested by the source system.
    pub operation_name: String,
    /// Business entity being mutated.
    pub object_id: Option<String>,
    /// Type of the business entity.
    pub entity_type: Option<String>,
    /// Correlation identifier, unique per source system.
    pub correlation_id: String,
    /// Parent message and binding for children.
    pub parent: Option<(i64, BindingType)>,
    /// Business key serializing messages in a funnel.
    pub funnel_value: Option<String>,
    /// Funnel configuration owning the value.
    pub funnel_component_id: Option<String>,
    /// Strict FIFO among messages with the same funnel value.
    pub guaranteed_order: bool,
    /// Ignore FAILED messages when checking guaranteed order.
    pub exclude_failed_state: bool,
    /// Business event time.
    pub msg_timestamp: DateTime<Utc>,
    /// Opaque business body.
    pub payload: String,
}

impl NewMessage {
    /// Message without funnel, parent or entity information.
    pub fn new(
        source_system: impl Into<String>,
        service: impl Into<String>,
        operation_name: impl Into<String>,
        correlation_id: impl Into<String>,
        msg_timestamp: DateTime<Utc>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            source_system: source_system.into(),
            service: service.into(),
            operation_name: operation_name.into(),
            object_id: None,
            entity_type: None,
            correlation_id: correlation_id.into(),
            parent: None,
            funnel_value: None,
            funnel_component_id: None,
            guaranteed_order: false,
            exclude_failed_state: false,
            msg_timestamp,
            payload: payload.into(),
        }
    }

    /// Set the business entity.
    pub fn with_object(mut self, object_id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Route through a funnel.
    pub fn with_funnel(mut self, value: impl Into<String>, component_id: impl Into<String>) -> Self {
        self.funnel_value = Some(value.into());
        self.funnel_component_id = Some(component_id.into());
        self
    }

    /// Require FIFO processing within the funnel value.
    pub fn with_guaranteed_order(mut self, exclude_failed_state: bool) -> Self {
        self.guaranteed_order = true;
        self.exclude_failed_state = exclude_failed_state;
        self
    }

    /// Make this a child of `parent_id`.
    pub fn child_of(mut self, parent_id: i64, binding: BindingType) -> Self {
        self.parent = Some((parent_id, binding));
        self
    }
}

/// External call record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExternalCall {
    /// Database-assigned identifier.
    pub id: i64,
    /// Operation URI of the call.
    pub operation_name: String,
    /// Entity the call mutates.
    pub entity_id: String,
    /// Message that made the last call.
    pub msg_id: i64,
    /// Business time of that message.
    pub msg_timestamp: DateTime<Utc>,
    /// Current state.
    #[sqlx(try_from = "String")]
    pub state: ExternalCallState,
    /// Failed attempts.
    pub failed_count: i32,
    /// When the record was created.
    pub creation_timestamp: DateTime<Utc>,
    /// Updated on every state change.
    pub last_update_timestamp: DateTime<Utc>,
}

/// Parameters of one `claim_next` call.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Claim time.
    pub now: DateTime<Utc>,
    /// Identity recorded on the claimed message.
    pub node_id: String,
    /// POSTPONED messages updated before this are eligible.
    pub postponed_before: DateTime<Utc>,
    /// PARTLY_FAILED messages updated before this are eligible.
    pub partly_failed_before: DateTime<Utc>,
    /// Funnel holders that started before this no longer block.
    pub funnel_idle_before: DateTime<Utc>,
    /// Postponements allowed before the claim gives up.
    pub max_postpones: u32,
}

/// Result of `claim_next`.
#[derive(Debug, Clone, Default)]
pub struct ClaimResult {
    /// The claimed message, now IN_QUEUE.
    pub message: Option<Message>,
    /// Candidates postponed by the funnel while looking.
    pub postponed: Vec<Message>,
}

/// Parameters for moving a claimed message to PROCESSING.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Claimed message.
    pub message_id: i64,
    /// Start time.
    pub now: DateTime<Utc>,
    /// Identity of the processing node.
    pub node_id: String,
    /// Messages received before this fail instead of being postponed again.
    pub fail_received_before: DateTime<Utc>,
}

/// Result of `start_processing`.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// Now PROCESSING.
    Started(Message),
    /// Not first in its guaranteed order, now POSTPONED.
    Postponed(Message),
    /// Not first and waited too long, now FAILED with E121.
    Failed(Message),
    /// No longer IN_QUEUE, e.g. cancelled meanwhile.
    Skipped(Message),
}

/// A guarded state change.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    /// Message to change.
    pub message_id: i64,
    /// Target state.
    pub to: MessageState,
    /// Transition time.
    pub now: DateTime<Utc>,
    /// Error recorded with the transition.
    pub error: Option<ErrorInfo>,
    /// Increment `failed_count`.
    pub increment_failed: bool,
    /// Require the message to be in one of these states instead of the
    /// state machine's sources of `to`.
    pub expected_from: Option<Vec<MessageState>>,
}

impl TransitionRequest {
    /// Plain transition to `to`.
    pub fn new(message_id: i64, to: MessageState, now: DateTime<Utc>) -> Self {
        Self {
            message_id,
            to,
            now,
            error: None,
            increment_failed: false,
            expected_from: None,
        }
    }

    /// Record an error with the transition.
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    /// Count the transition as a recoverable failure.
    pub fn incrementing_failures(mut self) -> Self {
        self.increment_failed = true;
        self
    }

    /// Restrict the allowed source states.
    pub fn only_from(mut self, states: &[MessageState]) -> Self {
        self.expected_from = Some(states.to_vec());
        self
    }

    /// States the message must be in for the transition to apply.
    pub fn allowed_sources(&self) -> Vec<MessageState> {
        let sources = MessageState::sources_of(self.to);
        match &self.expected_from {
            Some(expected) => sources
                .into_iter()
                .filter(|s| expected.contains(s))
                .collect(),
            None => sources,
        }
    }
}

/// Result of an administrative cancel.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// Message is now CANCEL.
    Cancelled(Message),
    /// Message is processing; it is cancelled once the attempt ends.
    Deferred(Message),
}

/// How an administrative restart resets a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// Back to NEW with failures and error cleared.
    Reset,
    /// To PARTLY_FAILED keeping the failure count.
    Requeue,
}

impl RestartMode {
    /// State the message is restarted into.
    pub fn target_state(&self) -> MessageState {
        match self {
            Self::Reset => MessageState::New,
            Self::Requeue => MessageState::PartlyFailed,
        }
    }
}

/// Parameters of one message repair batch.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    /// Messages not updated since this are stuck.
    pub stale_before: DateTime<Utc>,
    /// Repair time.
    pub now: DateTime<Utc>,
    /// Rows handled in this batch.
    pub batch_size: u32,
    /// Failure count at which a message is failed instead of retried.
    pub fail_threshold: u32,
}

/// Result of preparing an external call.
#[derive(Debug, Clone)]
pub enum ExternalCallPrepare {
    /// The caller holds the call and must complete or fail it.
    Acquired(ExternalCall),
    /// The call must not be made.
    Skipped {
        /// The existing record.
        existing: ExternalCall,
        /// Why the call is skipped.
        reason: SkipReason,
    },
}

/// Persistence abstraction for messages and external calls.
///
/// Implementations must perform each method atomically. Methods that
/// claim or transition messages must lock or compare-and-set the row so
/// concurrent callers on any node never both succeed.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message in state NEW.
    async fn insert_message(&self, message: &NewMessage, now: DateTime<Utc>) -> Result<Message>;

    /// Insert messages in one transaction.
    async fn insert_messages(
        &self,
        messages: &[NewMessage],
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>>;

    /// Load a message by id.
    async fn get_message(&self, message_id: i64) -> Result<Option<Message>>;

    /// Find by correlation id, optionally within one source system. Newest first.
    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
        source_system: Option<&str>,
    ) -> Result<Option<Message>>;

    /// Messages whose payload contains `substring`, newest first.
    async fn find_by_content(&self, substring: &str, limit: u32) -> Result<Vec<Message>>;

    /// Children of a message.
    async fn find_children(&self, parent_id: i64) -> Result<Vec<Message>>;

    /// Number of messages in a state.
    async fn count_by_state(&self, state: MessageState) -> Result<i64>;

    /// Claim the oldest eligible message.
    async fn claim_next(&self, request: &ClaimRequest) -> Result<ClaimResult>;

    /// Move a claimed message to PROCESSING after re-checking guaranteed order.
    async fn start_processing(&self, request: &StartRequest) -> Result<StartOutcome>;

    /// Apply a guarded state change and return the updated message.
    ///
    /// A PROCESSING message with a pending cancel ends in CANCEL unless the
    /// requested state is terminal.
    async fn transition(&self, request: &TransitionRequest) -> Result<Message>;

    /// Cancel a message, deferring when it is processing.
    async fn request_cancel(&self, message_id: i64, now: DateTime<Utc>) -> Result<CancelOutcome>;

    /// Administrative restart.
    async fn restart(
        &self,
        message_id: i64,
        mode: RestartMode,
        drop_external_calls: bool,
        now: DateTime<Utc>,
    ) -> Result<Message>;

    /// Repair one batch of stuck messages and return them after the update.
    async fn repair_stuck_messages(&self, request: &RepairRequest) -> Result<Vec<Message>>;

    /// Fail one batch of abandoned external calls.
    async fn repair_stuck_external_calls(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<Vec<ExternalCall>>;

    /// Acquire the external call for `(operation, entity_id)` on behalf of `message`.
    async fn prepare_external_call(
        &self,
        operation: &str,
        entity_id: &str,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<ExternalCallPrepare>;

    /// Close a PROCESSING external call.
    async fn finish_external_call(
        &self,
        call_id: i64,
        to: ExternalCallState,
        now: DateTime<Utc>,
    ) -> Result<ExternalCall>;

    /// Load an external call by key.
    async fn get_external_call(
        &self,
        operation: &str,
        entity_id: &str,
    ) -> Result<Option<ExternalCall>>;
}

/// Candidate sources of `claim_next` in the order they are tried, with the
/// `last_update_timestamp` bound each must be older than.
pub(crate) fn claim_sources(request: &ClaimRequest) -> [(MessageState, Option<DateTime<Utc>>); 3] {
    [
        (MessageState::Postponed, Some(request.postponed_before)),
        (MessageState::PartlyFailed, Some(request.partly_failed_before)),
        (MessageState::New, None),
    ]
}

/// State a transition actually writes, or why it is refused.
pub(crate) fn plan_transition(current: &Message, request: &TransitionRequest) -> Result<MessageState> {
    if !request.allowed_sources().contains(&current.state) {
        return Err(BusError::InvalidTransition {
            message_id: current.id,
            from: current.state,
            to: request.to,
        });
    }
    if current.state == MessageState::Processing && current.cancel_requested && !request.to.is_terminal() {
        return Ok(MessageState::Cancel);
    }
    Ok(request.to)
}

/// What an administrative cancel does to `current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelPlan {
    Now,
    Defer,
}

pub(crate) fn plan_cancel(current: &Message) -> Result<CancelPlan> {
    match current.state {
        state if state.is_terminal() => Err(BusError::InvalidTransition {
            message_id: current.id,
            from: state,
            to: MessageState::Cancel,
        }),
        MessageState::Processing => Ok(CancelPlan::Defer),
        _ => Ok(CancelPlan::Now),
    }
}

pub(crate) fn check_restart(current: &Message, mode: RestartMode) -> Result<()> {
    if MessageState::RESTARTABLE.contains(&current.state) {
        Ok(())
    } else {
        Err(BusError::InvalidTransition {
            message_id: current.id,
            from: current.state,
            to: mode.target_state(),
        })
    }
}

/// State a stuck message is repaired into, given its incremented failure count.
///
/// A pending cancel of the abandoned attempt is applied instead of a retry.
pub(crate) fn repair_target(message: &Message, failed_count: i32, fail_threshold: u32) -> MessageState {
    if i64::from(failed_count) >= i64::from(fail_threshold) {
        MessageState::Failed
    } else if message.cancel_requested {
        MessageState::Cancel
    } else {
        MessageState::PartlyFailed
    }
}

pub(crate) fn check_finish_external_call(call: &ExternalCall, to: ExternalCallState) -> Result<()> {
    if to == ExternalCallState::Processing {
        return Err(BusError::ValidationError {
            field: "state".to_string(),
            message: "an external call can only be finished as OK or FAILED".to_string(),
        });
    }
    if call.state != ExternalCallState::Processing {
        return Err(BusError::ValidationError {
            field: "state".to_string(),
            message: format!(
                "external call {} is {}, expected PROCESSING",
                call.id, call.state
            ),
        });
    }
    Ok(())
}

/// Duplicate correlation ids surface as validation errors.
pub(crate) fn map_insert_error(err: sqlx::Error, message: &NewMessage) -> BusError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => BusError::ValidationError {
            field: "correlation_id".to_string(),
            message: format!(
                "{} already exists for source system {}",
                message.correlation_id, message.source_system
            ),
        },
        _ => err.into(),
    }
}

pub(crate) fn check_new_message(message: &NewMessage) -> Result<()> {
    for (field, value) in [
        ("source_system", &message.source_system),
        ("service", &message.service),
        ("operation_name", &message.operation_name),
        ("correlation_id", &message.correlation_id),
    ] {
        if value.trim().is_empty() {
            return Err(BusError::ValidationError {
                field: field.to_string(),
                message: "must not be empty".to_string(),
            });
        }
    }
    if message.guaranteed_order && message.funnel_value.is_none() {
        return Err(BusError::ValidationError {
            field: "guaranteed_order".to_string(),
            message: "requires a funnel value".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::tests::message;

    #[test]
    fn test_plan_transition_follows_state_machine() {
        let mut m = message(1);
        m.state = MessageState::Processing;

        let to_ok = TransitionRequest::new(1, MessageState::Ok, m.last_update_timestamp);
        assert_eq!(plan_transition(&m, &to_ok).unwrap(), MessageState::Ok);

        m.state = MessageState::PartlyFailed;
        let err = plan_transition(&m, &to_ok).unwrap_err();
        assert!(matches!(
            err,
            BusError::InvalidTransition {
                from: MessageState::PartlyFailed,
                to: MessageState::Ok,
                ..
            }
        ));
    }

    #[test]
    fn test_plan_transition_applies_pending_cancel() {
        let mut m = message(1);
        m.state = MessageState::Processing;
        m.cancel_requested = true;
        let now = m.last_update_timestamp;

        let retry = TransitionRequest::new(1, MessageState::PartlyFailed, now);
        assert_eq!(plan_transition(&m, &retry).unwrap(), MessageState::Cancel);

        let done = TransitionRequest::new(1, MessageState::Ok, now);
        assert_eq!(plan_transition(&m, &done).unwrap(), MessageState::Ok);
    }

    #[test]
    fn test_only_from_narrows_sources() {
        let mut m = message(1);
        m.state = MessageState::Processing;
        let request = TransitionRequest::new(1, MessageState::Ok, m.last_update_timestamp)
            .only_from(&[MessageState::Waiting]);
        assert!(plan_transition(&m, &request).is_err());

        m.state = MessageState::Waiting;
        assert_eq!(plan_transition(&m, &request).unwrap(), MessageState::Ok);
    }

    #[test]
    fn test_plan_cancel() {
        let mut m = message(1);
        assert_eq!(plan_cancel(&m).unwrap(), CancelPlan::Now);
        m.state = MessageState::Processing;
        assert_eq!(plan_cancel(&m).unwrap(), CancelPlan::Defer);
        m.state = MessageState::Ok;
        assert!(plan_cancel(&m).is_err());
    }

    #[test]
    fn test_check_restart() {
        let mut m = message(1);
        m.state = MessageState::Failed;
        assert!(check_restart(&m, RestartMode::Reset).is_ok());
        m.state = MessageState::Processing;
        assert!(check_restart(&m, RestartMode::Requeue).is_err());
        m.state = MessageState::Ok;
        assert!(check_restart(&m, RestartMode::Reset).is_err());
    }

    #[test]
    fn test_repair_target() {
        let mut m = message(1);
        assert_eq!(repair_target(&m, 1, 3), MessageState::PartlyFailed);
        assert_eq!(repair_target(&m, 2, 3), MessageState::PartlyFailed);
        assert_eq!(repair_target(&m, 3, 3), MessageState::Failed);
        assert_eq!(repair_target(&m, 4, 3), MessageState::Failed);

        m.cancel_requested = true;
        assert_eq!(repair_target(&m, 1, 3), MessageState::Cancel);
        assert_eq!(repair_target(&m, 3, 3), MessageState::Failed);
    }

    #[test]
    fn test_check_new_message() {
        let ts = chrono::Utc::now();
        let ok = NewMessage::new("crm", "customer", "setCustomer", "c-1", ts, "{}");
        assert!(check_new_message(&ok).is_ok());

        let blank = NewMessage::new("crm", "customer", "setCustomer", " ", ts, "{}");
        assert!(check_new_message(&blank).is_err());

        let unfunneled = ok.clone().with_guaranteed_order(false);
        assert!(check_new_message(&unfunneled).is_err());
        assert!(
            check_new_message(&unfunneled.with_funnel("774724557", "customer-funnel")).is_ok()
        );
    }
}
