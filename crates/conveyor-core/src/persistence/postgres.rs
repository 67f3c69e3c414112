// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed message store for multi-node deployments.
//!
//! Candidates are locked with `FOR UPDATE SKIP LOCKED` so concurrent claims
//! on any node never see the same row. Funnel checks additionally take a
//! transaction-scoped advisory lock on the funnel value, which serializes
//! the "count running holders, then claim" sequence per value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::error::{BusError, ErrorCode, ErrorInfo, Result};
use crate::external_call::{self, Verdict};
use crate::funnel::{self, DispatchDecision, FunnelDecision};
use crate::state::{BindingType, ExternalCallState, MessageState};

use super::{
    CancelOutcome, CancelPlan, ClaimRequest, ClaimResult, EXTERNAL_CALL_COLUMNS, ExternalCall,
    ExternalCallPrepare, MESSAGE_COLUMNS, Message, MessageStore, NewMessage, RepairRequest,
    RestartMode, StartOutcome, StartRequest, TransitionRequest, check_finish_external_call,
    check_new_message, check_restart, claim_sources, map_insert_error, plan_cancel,
    plan_transition, repair_target,
};

/// PostgreSQL-backed message store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| BusError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        crate::migrations::run_postgres(&pool).await?;

        Ok(Self::new(pool))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn lock_message(conn: &mut PgConnection, message_id: i64) -> Result<Message> {
    sqlx::query_as::<_, Message>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 FOR UPDATE"
    ))
    .bind(message_id)
    .fetch_optional(conn)
    .await?
    .ok_or(BusError::MessageNotFound { message_id })
}

/// Serialize funnel checks for one value until the transaction ends.
async fn lock_funnel(conn: &mut PgConnection, funnel_value: &str) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(funnel_value)
        .execute(conn)
        .await?;
    Ok(())
}

async fn insert_one(
    conn: &mut PgConnection,
    message: &NewMessage,
    now: DateTime<Utc>,
) -> Result<Message> {
    check_new_message(message)?;

    if let Some((parent_id, binding)) = message.parent {
        let parent = sqlx::query("UPDATE messages SET has_children = has_children OR $2 WHERE id = $1")
            .bind(parent_id)
            .bind(binding == BindingType::Hard)
            .execute(&mut *conn)
            .await?;
        if parent.rows_affected() == 0 {
            return Err(BusError::MessageNotFound {
                message_id: parent_id,
            });
        }
    }

    let inserted = sqlx::query_as::<_, Message>(&format!(
        r#"
        INSERT INTO messages (
            source_system, service, operation_name, object_id, entity_type, correlation_id,
            parent_message_id, parent_binding_type, funnel_value, funnel_component_id,
            guaranteed_order, exclude_failed_state, state, msg_timestamp, receive_timestamp,
            last_update_timestamp, payload
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'NEW', $13, $14, $14, $15)
        RETURNING {MESSAGE_COLUMNS}
        "#
    ))
    .bind(&message.source_system)
    .bind(&message.service)
    .bind(&message.operation_name)
    .bind(&message.object_id)
    .bind(&message.entity_type)
    .bind(&message.correlation_id)
    .bind(message.parent.map(|(id, _)| id))
    .bind(message.parent.map(|(_, binding)| binding.as_str()))
    .bind(&message.funnel_value)
    .bind(&message.funnel_component_id)
    .bind(message.guaranteed_order)
    .bind(message.exclude_failed_state)
    .bind(message.msg_timestamp)
    .bind(now)
    .bind(&message.payload)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_insert_error(e, message))?;

    Ok(inserted)
}

async fn count_running(
    conn: &mut PgConnection,
    message: &Message,
    idle_before: DateTime<Utc>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(&format!(
        r#"
        SELECT COUNT(*) FROM messages
        WHERE funnel_value = $1
          AND funnel_component_id IS NOT DISTINCT FROM $2
          AND id <> $3
          AND state IN ({})
          AND (CASE WHEN state = 'IN_QUEUE' THEN start_in_queue_timestamp
                    ELSE start_process_timestamp END) >= $4
        "#,
        MessageState::sql_list(funnel::running_states())
    ))
    .bind(&message.funnel_value)
    .bind(&message.funnel_component_id)
    .bind(message.id)
    .bind(idle_before)
    .fetch_one(conn)
    .await?;
    Ok(count)
}

async fn order_head(conn: &mut PgConnection, message: &Message) -> Result<Option<i64>> {
    let head: Option<i64> = sqlx::query_scalar(&format!(
        r#"
        SELECT id FROM messages
        WHERE funnel_value = $1 AND state IN ({})
        ORDER BY msg_timestamp, id
        LIMIT 1
        "#,
        MessageState::sql_list(&funnel::order_states(message))
    ))
    .bind(&message.funnel_value)
    .fetch_optional(conn)
    .await?;
    Ok(head)
}

async fn set_state(
    conn: &mut PgConnection,
    message: &Message,
    to: MessageState,
    now: DateTime<Utc>,
    error: Option<&ErrorInfo>,
) -> Result<Option<Message>> {
    let updated = sqlx::query_as::<_, Message>(&format!(
        r#"
        UPDATE messages
        SET state = $1,
            last_update_timestamp = $2,
            failed_error_code = COALESCE($3, failed_error_code),
            failed_description = COALESCE($4, failed_description)
        WHERE id = $5 AND state = $6
        RETURNING {MESSAGE_COLUMNS}
        "#
    ))
    .bind(to.as_str())
    .bind(now)
    .bind(error.map(|e| e.code.as_str()))
    .bind(error.map(|e| e.description.as_str()))
    .bind(message.id)
    .bind(message.state.as_str())
    .fetch_optional(conn)
    .await?;
    Ok(updated)
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn insert_message(&self, message: &NewMessage, now: DateTime<Utc>) -> Result<Message> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_one(&mut tx, message, now).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn insert_messages(
        &self,
        messages: &[NewMessage],
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(messages.len());
        for message in messages {
            inserted.push(insert_one(&mut tx, message, now).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_message(&self, message_id: i64) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
        source_system: Option<&str>,
    ) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE correlation_id = $1 AND ($2::text IS NULL OR source_system = $2)
            ORDER BY id DESC
            LIMIT 1
            "#
        ))
        .bind(correlation_id)
        .bind(source_system)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }

    async fn find_by_content(&self, substring: &str, limit: u32) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE strpos(payload, $1) > 0
            ORDER BY id DESC
            LIMIT $2
            "#
        ))
        .bind(substring)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn find_children(&self, parent_id: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE parent_message_id = $1 ORDER BY id"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn count_by_state(&self, state: MessageState) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE state = $1")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<ClaimResult> {
        let mut result = ClaimResult::default();
        let mut postpones = 0;

        for (source, updated_before) in claim_sources(request) {
            loop {
                let mut tx = self.pool.begin().await?;

                let candidate = sqlx::query_as::<_, Message>(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS} FROM messages
                    WHERE state = $1
                      AND ($2::timestamptz IS NULL OR last_update_timestamp < $2)
                    ORDER BY msg_timestamp, id
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                    "#
                ))
                .bind(source.as_str())
                .bind(updated_before)
                .fetch_optional(&mut *tx)
                .await?;

                let Some(candidate) = candidate else {
                    tx.commit().await?;
                    break;
                };

                let decision = match &candidate.funnel_value {
                    Some(value) => {
                        lock_funnel(&mut tx, value).await?;
                        let running =
                            count_running(&mut tx, &candidate, request.funnel_idle_before).await?;
                        let head = if funnel::needs_order_check(&candidate) {
                            order_head(&mut tx, &candidate).await?
                        } else {
                            None
                        };
                        funnel::decide(&candidate, running, head)
                    }
                    None => FunnelDecision::Proceed,
                };

                match decision {
                    FunnelDecision::Proceed => {
                        let claimed = sqlx::query_as::<_, Message>(&format!(
                            r#"
                            UPDATE messages
                            SET state = 'IN_QUEUE',
                                start_in_queue_timestamp = $1,
                                last_update_timestamp = $1,
                                node_id = $2
                            WHERE id = $3 AND state = $4
                            RETURNING {MESSAGE_COLUMNS}
                            "#
                        ))
                        .bind(request.now)
                        .bind(&request.node_id)
                        .bind(candidate.id)
                        .bind(candidate.state.as_str())
                        .fetch_optional(&mut *tx)
                        .await?;
                        tx.commit().await?;

                        if let Some(claimed) = claimed {
                            result.message = Some(claimed);
                            return Ok(result);
                        }
                    }
                    FunnelDecision::Postpone(reason) => {
                        let postponed = set_state(
                            &mut tx,
                            &candidate,
                            MessageState::Postponed,
                            request.now,
                            None,
                        )
                        .await?;
                        tx.commit().await?;

                        debug!(
                            message_id = candidate.id,
                            funnel_value = ?candidate.funnel_value,
                            reason = ?reason,
                            "Message postponed by funnel"
                        );
                        result.postponed.extend(postponed);
                        postpones += 1;
                        if postpones >= request.max_postpones {
                            return Ok(result);
                        }
                    }
                }
            }
        }

        Ok(result)
    }

    async fn start_processing(&self, request: &StartRequest) -> Result<StartOutcome> {
        let mut tx = self.pool.begin().await?;

        let message = lock_message(&mut tx, request.message_id).await?;
        if message.state != MessageState::InQueue {
            tx.commit().await?;
            return Ok(StartOutcome::Skipped(message));
        }

        let head = match &message.funnel_value {
            Some(value) if funnel::needs_order_check(&message) => {
                lock_funnel(&mut tx, value).await?;
                order_head(&mut tx, &message).await?
            }
            _ => None,
        };

        let outcome = match funnel::dispatch_decision(&message, head, request.fail_received_before)
        {
            DispatchDecision::Start => sqlx::query_as::<_, Message>(&format!(
                r#"
                UPDATE messages
                SET state = 'PROCESSING',
                    start_process_timestamp = $1,
                    last_update_timestamp = $1,
                    node_id = $2
                WHERE id = $3 AND state = 'IN_QUEUE'
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(request.now)
            .bind(&request.node_id)
            .bind(message.id)
            .fetch_optional(&mut *tx)
            .await?
            .map(StartOutcome::Started),
            DispatchDecision::Postpone { .. } => {
                set_state(&mut tx, &message, MessageState::Postponed, request.now, None)
                    .await?
                    .map(StartOutcome::Postponed)
            }
            DispatchDecision::FailPostponedTooLong { .. } => set_state(
                &mut tx,
                &message,
                MessageState::Failed,
                request.now,
                Some(&ErrorInfo::from_code(ErrorCode::PostponedTooLong)),
            )
            .await?
            .map(StartOutcome::Failed),
        };
        tx.commit().await?;

        outcome.ok_or(BusError::LockFailure {
            resource: format!("message {}", message.id),
        })
    }

    async fn transition(&self, request: &TransitionRequest) -> Result<Message> {
        let mut tx = self.pool.begin().await?;

        let current = lock_message(&mut tx, request.message_id).await?;
        let target = plan_transition(&current, request)?;

        let updated = sqlx::query_as::<_, Message>(&format!(
            r#"
            UPDATE messages
            SET state = $1,
                last_update_timestamp = $2,
                failed_count = failed_count + $3,
                failed_error_code = COALESCE($4, failed_error_code),
                failed_description = COALESCE($5, failed_description),
                start_process_timestamp = COALESCE($6, start_process_timestamp)
            WHERE id = $7 AND state = $8
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(target.as_str())
        .bind(request.now)
        .bind(i32::from(request.increment_failed))
        .bind(request.error.as_ref().map(|e| e.code.as_str()))
        .bind(request.error.as_ref().map(|e| e.description.as_str()))
        .bind((target == MessageState::Processing).then_some(request.now))
        .bind(current.id)
        .bind(current.state.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BusError::LockFailure {
            resource: format!("message {}", current.id),
        })?;
        tx.commit().await?;

        Ok(updated)
    }

    async fn request_cancel(&self, message_id: i64, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let mut tx = self.pool.begin().await?;

        let current = lock_message(&mut tx, message_id).await?;

        let outcome = match plan_cancel(&current)? {
            CancelPlan::Now => set_state(&mut tx, &current, MessageState::Cancel, now, None)
                .await?
                .map(CancelOutcome::Cancelled),
            CancelPlan::Defer => sqlx::query_as::<_, Message>(&format!(
                r#"
                UPDATE messages SET cancel_requested = TRUE, last_update_timestamp = $1
                WHERE id = $2 AND state = 'PROCESSING'
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(now)
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(CancelOutcome::Deferred),
        };
        tx.commit().await?;

        outcome.ok_or(BusError::LockFailure {
            resource: format!("message {}", message_id),
        })
    }

    async fn restart(
        &self,
        message_id: i64,
        mode: RestartMode,
        drop_external_calls: bool,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let mut tx = self.pool.begin().await?;

        let current = lock_message(&mut tx, message_id).await?;
        check_restart(&current, mode)?;

        let restarted = sqlx::query_as::<_, Message>(&format!(
            r#"
            UPDATE messages
            SET state = $1,
                last_update_timestamp = $2,
                cancel_requested = FALSE,
                failed_count = CASE WHEN $3 THEN 0 ELSE failed_count END,
                failed_error_code = CASE WHEN $3 THEN NULL ELSE failed_error_code END,
                failed_description = CASE WHEN $3 THEN NULL ELSE failed_description END
            WHERE id = $4 AND state = $5
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(mode.target_state().as_str())
        .bind(now)
        .bind(mode == RestartMode::Reset)
        .bind(message_id)
        .bind(current.state.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BusError::LockFailure {
            resource: format!("message {}", message_id),
        })?;

        if drop_external_calls {
            sqlx::query("DELETE FROM external_calls WHERE msg_id = $1")
                .bind(message_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(restarted)
    }

    async fn repair_stuck_messages(&self, request: &RepairRequest) -> Result<Vec<Message>> {
        let mut tx = self.pool.begin().await?;

        let stuck = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE state IN ({}) AND last_update_timestamp < $1
            ORDER BY last_update_timestamp, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
            MessageState::sql_list(&MessageState::REPAIRABLE)
        ))
        .bind(request.stale_before)
        .bind(i64::from(request.batch_size))
        .fetch_all(&mut *tx)
        .await?;

        let error = ErrorInfo::from_code(ErrorCode::StuckInProcessing);
        let mut repaired = Vec::with_capacity(stuck.len());
        for message in stuck {
            let failed_count = message.failed_count + 1;
            let target = repair_target(&message, failed_count, request.fail_threshold);

            let updated = sqlx::query_as::<_, Message>(&format!(
                r#"
                UPDATE messages
                SET state = $1, failed_count = $2, last_update_timestamp = $3,
                    failed_error_code = $4, failed_description = $5
                WHERE id = $6 AND state = $7 AND last_update_timestamp = $8
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(target.as_str())
            .bind(failed_count)
            .bind(request.now)
            .bind(&error.code)
            .bind(&error.description)
            .bind(message.id)
            .bind(message.state.as_str())
            .bind(message.last_update_timestamp)
            .fetch_optional(&mut *tx)
            .await?;
            repaired.extend(updated);
        }
        tx.commit().await?;

        Ok(repaired)
    }

    async fn repair_stuck_external_calls(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<Vec<ExternalCall>> {
        let repaired = sqlx::query_as::<_, ExternalCall>(&format!(
            r#"
            UPDATE external_calls
            SET state = 'FAILED', failed_count = failed_count + 1, last_update_timestamp = $1
            WHERE id IN (
                SELECT id FROM external_calls
                WHERE state = 'PROCESSING' AND last_update_timestamp < $2
                ORDER BY last_update_timestamp, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {EXTERNAL_CALL_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(stale_before)
        .bind(i64::from(batch_size))
        .fetch_all(&self.pool)
        .await?;

        Ok(repaired)
    }

    async fn prepare_external_call(
        &self,
        operation: &str,
        entity_id: &str,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<ExternalCallPrepare> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, ExternalCall>(&format!(
            r#"
            SELECT {EXTERNAL_CALL_COLUMNS} FROM external_calls
            WHERE operation_name = $1 AND entity_id = $2
            FOR UPDATE
            "#
        ))
        .bind(operation)
        .bind(entity_id)
        .fetch_optional(&mut *tx)
        .await?;

        let in_progress = || BusError::ExternalCallInProgress {
            operation: operation.to_string(),
            entity_id: entity_id.to_string(),
        };

        let prepared = match external_call::evaluate(existing.as_ref(), message.msg_timestamp) {
            Verdict::Busy => return Err(in_progress()),
            Verdict::Skip(reason) => match existing {
                Some(existing) => ExternalCallPrepare::Skipped { existing, reason },
                None => return Err(in_progress()),
            },
            Verdict::Create => {
                // a concurrent insert for the same key wins the unique index
                let call = sqlx::query_as::<_, ExternalCall>(&format!(
                    r#"
                    INSERT INTO external_calls (
                        operation_name, entity_id, msg_id, msg_timestamp, state,
                        creation_timestamp, last_update_timestamp
                    )
                    VALUES ($1, $2, $3, $4, 'PROCESSING', $5, $5)
                    ON CONFLICT (operation_name, entity_id) DO NOTHING
                    RETURNING {EXTERNAL_CALL_COLUMNS}
                    "#
                ))
                .bind(operation)
                .bind(entity_id)
                .bind(message.id)
                .bind(message.msg_timestamp)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(in_progress)?;
                ExternalCallPrepare::Acquired(call)
            }
            Verdict::Relock => {
                let Some(existing) = existing else {
                    return Err(in_progress());
                };
                let call = sqlx::query_as::<_, ExternalCall>(&format!(
                    r#"
                    UPDATE external_calls
                    SET state = 'PROCESSING', msg_id = $1, msg_timestamp = $2,
                        last_update_timestamp = $3
                    WHERE id = $4 AND state = $5
                    RETURNING {EXTERNAL_CALL_COLUMNS}
                    "#
                ))
                .bind(message.id)
                .bind(message.msg_timestamp)
                .bind(now)
                .bind(existing.id)
                .bind(existing.state.as_str())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(in_progress)?;
                ExternalCallPrepare::Acquired(call)
            }
        };
        tx.commit().await?;

        Ok(prepared)
    }

    async fn finish_external_call(
        &self,
        call_id: i64,
        to: ExternalCallState,
        now: DateTime<Utc>,
    ) -> Result<ExternalCall> {
        let mut tx = self.pool.begin().await?;

        let call = sqlx::query_as::<_, ExternalCall>(&format!(
            "SELECT {EXTERNAL_CALL_COLUMNS} FROM external_calls WHERE id = $1 FOR UPDATE"
        ))
        .bind(call_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BusError::ExternalCallNotFound { call_id })?;
        check_finish_external_call(&call, to)?;

        let finished = sqlx::query_as::<_, ExternalCall>(&format!(
            r#"
            UPDATE external_calls
            SET state = $1,
                failed_count = failed_count + $2,
                last_update_timestamp = $3
            WHERE id = $4 AND state = 'PROCESSING'
            RETURNING {EXTERNAL_CALL_COLUMNS}
            "#
        ))
        .bind(to.as_str())
        .bind(i32::from(to == ExternalCallState::Failed))
        .bind(now)
        .bind(call_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BusError::LockFailure {
            resource: format!("external call {}", call_id),
        })?;
        tx.commit().await?;

        Ok(finished)
    }

    async fn get_external_call(
        &self,
        operation: &str,
        entity_id: &str,
    ) -> Result<Option<ExternalCall>> {
        let call = sqlx::query_as::<_, ExternalCall>(&format!(
            "SELECT {EXTERNAL_CALL_COLUMNS} FROM external_calls WHERE operation_name = $1 AND entity_id = $2"
        ))
        .bind(operation)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(call)
    }
}
