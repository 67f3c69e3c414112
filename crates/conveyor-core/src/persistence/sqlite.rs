// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed message store.
//!
//! SQLite has a single writer, so every mutating method takes an in-process
//! write lock before it opens its transaction, and each update re-checks the
//! state it read (`WHERE id = ? AND state = ?`). That makes the store safe
//! for any number of workers in one process. Use [`PostgresStore`] when
//! several nodes share the database.
//!
//! [`PostgresStore`]: super::PostgresStore

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
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

/// SQLite-backed message store.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| BusError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| BusError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self::new(pool))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn fetch_message(conn: &mut SqliteConnection, message_id: i64) -> Result<Option<Message>> {
    let message = sqlx::query_as::<_, Message>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
    ))
    .bind(message_id)
    .fetch_optional(conn)
    .await?;
    Ok(message)
}

async fn insert_one(
    conn: &mut SqliteConnection,
    message: &NewMessage,
    now: DateTime<Utc>,
) -> Result<Message> {
    check_new_message(message)?;

    if let Some((parent_id, binding)) = message.parent {
        if fetch_message(&mut *conn, parent_id).await?.is_none() {
            return Err(BusError::MessageNotFound {
                message_id: parent_id,
            });
        }
        if binding == BindingType::Hard {
            sqlx::query("UPDATE messages SET has_children = 1 WHERE id = ?")
                .bind(parent_id)
                .execute(&mut *conn)
                .await?;
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
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'NEW', ?, ?, ?, ?)
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
    .bind(now)
    .bind(&message.payload)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_insert_error(e, message))?;

    Ok(inserted)
}

/// Running holders of the candidate's funnel value, excluding the candidate.
async fn count_running(
    conn: &mut SqliteConnection,
    message: &Message,
    idle_before: DateTime<Utc>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(&format!(
        r#"
        SELECT COUNT(*) FROM messages
        WHERE funnel_value = ?
          AND funnel_component_id IS ?
          AND id <> ?
          AND state IN ({})
          AND (CASE WHEN state = 'IN_QUEUE' THEN start_in_queue_timestamp
                    ELSE start_process_timestamp END) >= ?
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

/// First live message in guaranteed order for the candidate's funnel value.
async fn order_head(conn: &mut SqliteConnection, message: &Message) -> Result<Option<i64>> {
    let head: Option<i64> = sqlx::query_scalar(&format!(
        r#"
        SELECT id FROM messages
        WHERE funnel_value = ? AND state IN ({})
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
    conn: &mut SqliteConnection,
    message: &Message,
    to: MessageState,
    now: DateTime<Utc>,
    error: Option<&ErrorInfo>,
) -> Result<Option<Message>> {
    let updated = sqlx::query_as::<_, Message>(&format!(
        r#"
        UPDATE messages
        SET state = ?,
            last_update_timestamp = ?,
            failed_error_code = COALESCE(?, failed_error_code),
            failed_description = COALESCE(?, failed_description)
        WHERE id = ? AND state = ?
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
impl MessageStore for SqliteStore {
    async fn insert_message(&self, message: &NewMessage, now: DateTime<Utc>) -> Result<Message> {
        let _write = self.write_lock.lock().await;
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
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(messages.len());
        for message in messages {
            inserted.push(insert_one(&mut tx, message, now).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_message(&self, message_id: i64) -> Result<Option<Message>> {
        let mut conn = self.pool.acquire().await?;
        fetch_message(&mut conn, message_id).await
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
        source_system: Option<&str>,
    ) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE correlation_id = ? AND (? IS NULL OR source_system = ?)
            ORDER BY id DESC
            LIMIT 1
            "#
        ))
        .bind(correlation_id)
        .bind(source_system)
        .bind(source_system)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }

    async fn find_by_content(&self, substring: &str, limit: u32) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE instr(payload, ?) > 0
            ORDER BY id DESC
            LIMIT ?
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
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE parent_message_id = ? ORDER BY id"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn count_by_state(&self, state: MessageState) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<ClaimResult> {
        let _write = self.write_lock.lock().await;
        let mut result = ClaimResult::default();
        let mut postpones = 0;

        for (source, updated_before) in claim_sources(request) {
            loop {
                let mut tx = self.pool.begin().await?;

                let candidate = sqlx::query_as::<_, Message>(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS} FROM messages
                    WHERE state = ? AND (? IS NULL OR last_update_timestamp < ?)
                    ORDER BY msg_timestamp, id
                    LIMIT 1
                    "#
                ))
                .bind(source.as_str())
                .bind(updated_before)
                .bind(updated_before)
                .fetch_optional(&mut *tx)
                .await?;

                let Some(candidate) = candidate else {
                    tx.commit().await?;
                    break;
                };

                let decision = if candidate.funnel_value.is_some() {
                    let running =
                        count_running(&mut tx, &candidate, request.funnel_idle_before).await?;
                    let head = if funnel::needs_order_check(&candidate) {
                        order_head(&mut tx, &candidate).await?
                    } else {
                        None
                    };
                    funnel::decide(&candidate, running, head)
                } else {
                    FunnelDecision::Proceed
                };

                match decision {
                    FunnelDecision::Proceed => {
                        let claimed = sqlx::query_as::<_, Message>(&format!(
                            r#"
                            UPDATE messages
                            SET state = 'IN_QUEUE',
                                start_in_queue_timestamp = ?,
                                last_update_timestamp = ?,
                                node_id = ?
                            WHERE id = ? AND state = ?
                            RETURNING {MESSAGE_COLUMNS}
                            "#
                        ))
                        .bind(request.now)
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
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let message = fetch_message(&mut tx, request.message_id)
            .await?
            .ok_or(BusError::MessageNotFound {
                message_id: request.message_id,
            })?;
        if message.state != MessageState::InQueue {
            tx.commit().await?;
            return Ok(StartOutcome::Skipped(message));
        }

        let head = if funnel::needs_order_check(&message) {
            order_head(&mut tx, &message).await?
        } else {
            None
        };

        let outcome = match funnel::dispatch_decision(&message, head, request.fail_received_before)
        {
            DispatchDecision::Start => sqlx::query_as::<_, Message>(&format!(
                r#"
                UPDATE messages
                SET state = 'PROCESSING',
                    start_process_timestamp = ?,
                    last_update_timestamp = ?,
                    node_id = ?
                WHERE id = ? AND state = 'IN_QUEUE'
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(request.now)
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
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = fetch_message(&mut tx, request.message_id)
            .await?
            .ok_or(BusError::MessageNotFound {
                message_id: request.message_id,
            })?;
        let target = plan_transition(&current, request)?;

        let updated = sqlx::query_as::<_, Message>(&format!(
            r#"
            UPDATE messages
            SET state = ?,
                last_update_timestamp = ?,
                failed_count = failed_count + ?,
                failed_error_code = COALESCE(?, failed_error_code),
                failed_description = COALESCE(?, failed_description),
                start_process_timestamp = CASE WHEN ? = 'PROCESSING' THEN ?
                                               ELSE start_process_timestamp END
            WHERE id = ? AND state = ?
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(target.as_str())
        .bind(request.now)
        .bind(i32::from(request.increment_failed))
        .bind(request.error.as_ref().map(|e| e.code.as_str()))
        .bind(request.error.as_ref().map(|e| e.description.as_str()))
        .bind(target.as_str())
        .bind(request.now)
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
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = fetch_message(&mut tx, message_id)
            .await?
            .ok_or(BusError::MessageNotFound { message_id })?;

        let outcome = match plan_cancel(&current)? {
            CancelPlan::Now => set_state(&mut tx, &current, MessageState::Cancel, now, None)
                .await?
                .map(CancelOutcome::Cancelled),
            CancelPlan::Defer => sqlx::query_as::<_, Message>(&format!(
                r#"
                UPDATE messages SET cancel_requested = 1, last_update_timestamp = ?
                WHERE id = ? AND state = 'PROCESSING'
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
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = fetch_message(&mut tx, message_id)
            .await?
            .ok_or(BusError::MessageNotFound { message_id })?;
        check_restart(&current, mode)?;

        let reset = mode == RestartMode::Reset;
        let restarted = sqlx::query_as::<_, Message>(&format!(
            r#"
            UPDATE messages
            SET state = ?,
                last_update_timestamp = ?,
                cancel_requested = 0,
                failed_count = CASE WHEN ? THEN 0 ELSE failed_count END,
                failed_error_code = CASE WHEN ? THEN NULL ELSE failed_error_code END,
                failed_description = CASE WHEN ? THEN NULL ELSE failed_description END
            WHERE id = ? AND state = ?
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(mode.target_state().as_str())
        .bind(now)
        .bind(reset)
        .bind(reset)
        .bind(reset)
        .bind(message_id)
        .bind(current.state.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BusError::LockFailure {
            resource: format!("message {}", message_id),
        })?;

        if drop_external_calls {
            sqlx::query("DELETE FROM external_calls WHERE msg_id = ?")
                .bind(message_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(restarted)
    }

    async fn repair_stuck_messages(&self, request: &RepairRequest) -> Result<Vec<Message>> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let stuck = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE state IN ({}) AND last_update_timestamp < ?
            ORDER BY last_update_timestamp, id
            LIMIT ?
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
                SET state = ?, failed_count = ?, last_update_timestamp = ?,
                    failed_error_code = ?, failed_description = ?
                WHERE id = ? AND state = ? AND last_update_timestamp = ?
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
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let stuck: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM external_calls
            WHERE state = 'PROCESSING' AND last_update_timestamp < ?
            ORDER BY last_update_timestamp, id
            LIMIT ?
            "#,
        )
        .bind(stale_before)
        .bind(i64::from(batch_size))
        .fetch_all(&mut *tx)
        .await?;

        let mut repaired = Vec::with_capacity(stuck.len());
        for call_id in stuck {
            let updated = sqlx::query_as::<_, ExternalCall>(&format!(
                r#"
                UPDATE external_calls
                SET state = 'FAILED', failed_count = failed_count + 1, last_update_timestamp = ?
                WHERE id = ? AND state = 'PROCESSING'
                RETURNING {EXTERNAL_CALL_COLUMNS}
                "#
            ))
            .bind(now)
            .bind(call_id)
            .fetch_optional(&mut *tx)
            .await?;
            repaired.extend(updated);
        }
        tx.commit().await?;

        Ok(repaired)
    }

    async fn prepare_external_call(
        &self,
        operation: &str,
        entity_id: &str,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<ExternalCallPrepare> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, ExternalCall>(&format!(
            "SELECT {EXTERNAL_CALL_COLUMNS} FROM external_calls WHERE operation_name = ? AND entity_id = ?"
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
                let call = sqlx::query_as::<_, ExternalCall>(&format!(
                    r#"
                    INSERT INTO external_calls (
                        operation_name, entity_id, msg_id, msg_timestamp, state,
                        creation_timestamp, last_update_timestamp
                    )
                    VALUES (?, ?, ?, ?, 'PROCESSING', ?, ?)
                    RETURNING {EXTERNAL_CALL_COLUMNS}
                    "#
                ))
                .bind(operation)
                .bind(entity_id)
                .bind(message.id)
                .bind(message.msg_timestamp)
                .bind(now)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                ExternalCallPrepare::Acquired(call)
            }
            Verdict::Relock => {
                let Some(existing) = existing else {
                    return Err(in_progress());
                };
                let call = sqlx::query_as::<_, ExternalCall>(&format!(
                    r#"
                    UPDATE external_calls
                    SET state = 'PROCESSING', msg_id = ?, msg_timestamp = ?, last_update_timestamp = ?
                    WHERE id = ? AND state = ?
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
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let call = sqlx::query_as::<_, ExternalCall>(&format!(
            "SELECT {EXTERNAL_CALL_COLUMNS} FROM external_calls WHERE id = ?"
        ))
        .bind(call_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BusError::ExternalCallNotFound { call_id })?;
        check_finish_external_call(&call, to)?;

        let finished = sqlx::query_as::<_, ExternalCall>(&format!(
            r#"
            UPDATE external_calls
            SET state = ?,
                failed_count = failed_count + ?,
                last_update_timestamp = ?
            WHERE id = ? AND state = 'PROCESSING'
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
            "SELECT {EXTERNAL_CALL_COLUMNS} FROM external_calls WHERE operation_name = ? AND entity_id = ?"
        ))
        .bind(operation)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        SqliteStore::new(pool)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn new_message(corr: &str, offset_secs: i64) -> NewMessage {
        NewMessage::new(
            "crm",
            "customer",
            "setCustomer",
            corr,
            t0() + Duration::seconds(offset_secs),
            format!("{{\"customer\":\"{corr}\"}}"),
        )
    }

    fn claim_request(now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            now,
            node_id: "node-a".to_string(),
            postponed_before: now - Duration::seconds(5),
            partly_failed_before: now - Duration::seconds(60),
            funnel_idle_before: now - Duration::seconds(600),
            max_postpones: 10,
        }
    }

    fn start_request(message_id: i64, now: DateTime<Utc>) -> StartRequest {
        StartRequest {
            message_id,
            now,
            node_id: "node-a".to_string(),
            fail_received_before: now - Duration::seconds(300),
        }
    }

    #[tokio::test]
    async fn test_insert_and_lookups() {
        let store = store().await;
        let inserted = store
            .insert_message(&new_message("c-1", 0), t0())
            .await
            .unwrap();

        assert_eq!(inserted.state, MessageState::New);
        assert_eq!(inserted.last_update_timestamp, t0());
        assert_eq!(inserted.failed_count, 0);

        let by_id = store.get_message(inserted.id).await.unwrap().unwrap();
        assert_eq!(by_id.correlation_id, "c-1");

        let by_corr = store
            .find_by_correlation_id("c-1", Some("crm"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_corr.id, inserted.id);
        assert!(
            store
                .find_by_correlation_id("c-1", Some("erp"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .find_by_correlation_id("c-1", None)
                .await
                .unwrap()
                .is_some()
        );

        let by_content = store.find_by_content("\"c-1\"", 50).await.unwrap();
        assert_eq!(by_content.len(), 1);
        assert_eq!(store.count_by_state(MessageState::New).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_correlation_is_rejected() {
        let store = store().await;
        store
            .insert_message(&new_message("dup", 0), t0())
            .await
            .unwrap();
        let err = store
            .insert_message(&new_message("dup", 1), t0())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_insert_batch_is_atomic() {
        let store = store().await;
        let batch = vec![new_message("b-1", 0), new_message("b-1", 1)];
        assert!(store.insert_messages(&batch, t0()).await.is_err());
        assert_eq!(store.count_by_state(MessageState::New).await.unwrap(), 0);

        let batch = vec![new_message("b-1", 0), new_message("b-2", 1)];
        let inserted = store.insert_messages(&batch, t0()).await.unwrap();
        assert_eq!(inserted.len(), 2);
    }

    #[tokio::test]
    async fn test_hard_child_marks_parent() {
        let store = store().await;
        let parent = store
            .insert_message(&new_message("parent", 0), t0())
            .await
            .unwrap();
        let child = store
            .insert_message(
                &new_message("child", 1).child_of(parent.id, BindingType::Hard),
                t0(),
            )
            .await
            .unwrap();

        assert!(child.is_hard_child());
        assert!(store.get_message(parent.id).await.unwrap().unwrap().has_children);
        assert_eq!(store.find_children(parent.id).await.unwrap().len(), 1);

        let orphan = new_message("orphan", 2).child_of(9999, BindingType::Soft);
        assert!(matches!(
            store.insert_message(&orphan, t0()).await.unwrap_err(),
            BusError::MessageNotFound { message_id: 9999 }
        ));
    }

    #[tokio::test]
    async fn test_claim_oldest_new_message() {
        let store = store().await;
        store
            .insert_message(&new_message("late", 10), t0())
            .await
            .unwrap();
        let early = store
            .insert_message(&new_message("early", 0), t0())
            .await
            .unwrap();

        let now = t0() + Duration::seconds(1);
        let claimed = store
            .claim_next(&claim_request(now))
            .await
            .unwrap()
            .message
            .unwrap();
        assert_eq!(claimed.id, early.id);
        assert_eq!(claimed.state, MessageState::InQueue);
        assert_eq!(claimed.node_id.as_deref(), Some("node-a"));
        assert_eq!(claimed.start_in_queue_timestamp, Some(now));
        assert_eq!(claimed.last_update_timestamp, now);
    }

    #[tokio::test]
    async fn test_claim_respects_retry_intervals() {
        let store = store().await;
        let m = store
            .insert_message(&new_message("retry", 0), t0())
            .await
            .unwrap();
        let claimed = store.claim_next(&claim_request(t0())).await.unwrap();
        assert_eq!(claimed.message.unwrap().id, m.id);
        store.start_processing(&start_request(m.id, t0())).await.unwrap();
        store
            .transition(
                &TransitionRequest::new(m.id, MessageState::PartlyFailed, t0())
                    .incrementing_failures(),
            )
            .await
            .unwrap();

        // too early
        let early = t0() + Duration::seconds(30);
        assert!(store.claim_next(&claim_request(early)).await.unwrap().message.is_none());

        let later = t0() + Duration::seconds(61);
        let reclaimed = store.claim_next(&claim_request(later)).await.unwrap();
        let reclaimed = reclaimed.message.unwrap();
        assert_eq!(reclaimed.id, m.id);
        assert_eq!(reclaimed.failed_count, 1);
    }

    #[tokio::test]
    async fn test_start_processing_requires_in_queue() {
        let store = store().await;
        let m = store
            .insert_message(&new_message("start", 0), t0())
            .await
            .unwrap();

        let outcome = store.start_processing(&start_request(m.id, t0())).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Skipped(ref s) if s.state == MessageState::New));

        store.claim_next(&claim_request(t0())).await.unwrap();
        let outcome = store.start_processing(&start_request(m.id, t0())).await.unwrap();
        match outcome {
            StartOutcome::Started(started) => {
                assert_eq!(started.state, MessageState::Processing);
                assert_eq!(started.start_process_timestamp, Some(t0()));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_moves() {
        let store = store().await;
        let m = store
            .insert_message(&new_message("illegal", 0), t0())
            .await
            .unwrap();

        let err = store
            .transition(&TransitionRequest::new(m.id, MessageState::Ok, t0()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::InvalidTransition {
                from: MessageState::New,
                to: MessageState::Ok,
                ..
            }
        ));

        let err = store
            .transition(&TransitionRequest::new(4242, MessageState::Ok, t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::MessageNotFound { message_id: 4242 }));
    }

    #[tokio::test]
    async fn test_transition_records_error() {
        let store = store().await;
        let m = store
            .insert_message(&new_message("err", 0), t0())
            .await
            .unwrap();
        store.claim_next(&claim_request(t0())).await.unwrap();
        store.start_processing(&start_request(m.id, t0())).await.unwrap();

        let failed = store
            .transition(
                &TransitionRequest::new(m.id, MessageState::Failed, t0())
                    .with_error(ErrorInfo::new("E102", "missing customer id")),
            )
            .await
            .unwrap();
        assert_eq!(failed.state, MessageState::Failed);
        assert_eq!(failed.failed_error_code.as_deref(), Some("E102"));
        assert_eq!(
            failed.error().unwrap().description,
            "missing customer id".to_string()
        );
    }

    #[tokio::test]
    async fn test_cancel_is_deferred_while_processing() {
        let store = store().await;
        let m = store
            .insert_message(&new_message("cancel", 0), t0())
            .await
            .unwrap();
        store.claim_next(&claim_request(t0())).await.unwrap();
        store.start_processing(&start_request(m.id, t0())).await.unwrap();

        let outcome = store.request_cancel(m.id, t0()).await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Deferred(ref d) if d.cancel_requested));

        let after = store
            .transition(&TransitionRequest::new(m.id, MessageState::PartlyFailed, t0()))
            .await
            .unwrap();
        assert_eq!(after.state, MessageState::Cancel);

        assert!(store.request_cancel(m.id, t0()).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_modes() {
        let store = store().await;
        let m = store
            .insert_message(&new_message("restart", 0), t0())
            .await
            .unwrap();
        store.claim_next(&claim_request(t0())).await.unwrap();
        store.start_processing(&start_request(m.id, t0())).await.unwrap();
        store
            .transition(
                &TransitionRequest::new(m.id, MessageState::Failed, t0())
                    .incrementing_failures()
                    .with_error(ErrorInfo::new("E103", "timeout")),
            )
            .await
            .unwrap();

        let requeued = store
            .restart(m.id, RestartMode::Requeue, false, t0())
            .await
            .unwrap();
        assert_eq!(requeued.state, MessageState::PartlyFailed);
        assert_eq!(requeued.failed_count, 1);

        let reset = store
            .restart(m.id, RestartMode::Reset, true, t0())
            .await
            .unwrap();
        assert_eq!(reset.state, MessageState::New);
        assert_eq!(reset.failed_count, 0);
        assert!(reset.failed_error_code.is_none());
    }

    #[tokio::test]
    async fn test_external_call_lifecycle() {
        let store = store().await;
        let m = store
            .insert_message(&new_message("ext", 0), t0())
            .await
            .unwrap();

        let call = match store
            .prepare_external_call("crm:setActivity", "42", &m, t0())
            .await
            .unwrap()
        {
            ExternalCallPrepare::Acquired(call) => call,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(call.state, ExternalCallState::Processing);

        let err = store
            .prepare_external_call("crm:setActivity", "42", &m, t0())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "EXTERNAL_CALL_IN_PROGRESS");

        let done = store
            .finish_external_call(call.id, ExternalCallState::Ok, t0())
            .await
            .unwrap();
        assert_eq!(done.state, ExternalCallState::Ok);
        assert!(
            store
                .finish_external_call(call.id, ExternalCallState::Ok, t0())
                .await
                .is_err()
        );

        let again = store
            .prepare_external_call("crm:setActivity", "42", &m, t0())
            .await
            .unwrap();
        assert!(matches!(
            again,
            ExternalCallPrepare::Skipped {
                reason: crate::external_call::SkipReason::DuplicateCall,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_restart_can_drop_external_calls() {
        let store = store().await;
        let m = store
            .insert_message(&new_message("drop", 0), t0())
            .await
            .unwrap();
        store
            .prepare_external_call("crm:setActivity", "7", &m, t0())
            .await
            .unwrap();
        store.request_cancel(m.id, t0()).await.unwrap();

        store.restart(m.id, RestartMode::Reset, true, t0()).await.unwrap();
        assert!(
            store
                .get_external_call("crm:setActivity", "7")
                .await
                .unwrap()
                .is_none()
        );
    }
}
