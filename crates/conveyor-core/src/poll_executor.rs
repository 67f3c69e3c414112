// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool that drives claimed messages through the business pipeline.
//!
//! Each worker loops: claim the next message, move it to PROCESSING (with
//! the guaranteed-order re-check), call the [`Pipeline`], and record its
//! [`PipelineOutcome`]. Funnel messages run inside the synchronized-value
//! executor keyed by their funnel value, a local fast path on top of the
//! row locks taken by the store.
//!
//! Workers stop claiming while the node is stopping. On shutdown they
//! finish the attempt in flight and exit; anything left IN_QUEUE or
//! PROCESSING is picked up by repair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::error::{ErrorInfo, Result};
use crate::funnel::{FUNNEL_SCOPE, sync_key};
use crate::persistence::{Message, StartOutcome};

/// What the business pipeline reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Processed successfully.
    Ok,
    /// Spawned HARD children and waits for them.
    Waiting,
    /// Waits for an asynchronous response from an external system.
    WaitingForResponse,
    /// Transient failure, retry later.
    RetryableError(ErrorInfo),
    /// Permanent failure, do not retry.
    FatalError(ErrorInfo),
}

/// The business pipeline invoked for every message.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Process one attempt of `message`, which is PROCESSING.
    async fn process(&self, message: &Message) -> PipelineOutcome;
}

/// Configuration for the poll executor.
#[derive(Debug, Clone)]
pub struct PollExecutorConfig {
    /// Concurrent workers.
    pub workers: usize,
    /// Sleep after an empty poll.
    pub poll_interval: Duration,
}

impl Default for PollExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Claims and processes messages.
#[derive(Clone)]
pub struct PollExecutor {
    bus: Arc<MessageBus>,
    pipeline: Arc<dyn Pipeline>,
    config: PollExecutorConfig,
}

impl PollExecutor {
    /// Create an executor.
    pub fn new(
        bus: Arc<MessageBus>,
        pipeline: Arc<dyn Pipeline>,
        config: PollExecutorConfig,
    ) -> Self {
        Self {
            bus,
            pipeline,
            config,
        }
    }

    /// Claim and process at most one message.
    ///
    /// Returns `false` when there was nothing to claim or the node is
    /// stopping.
    pub async fn poll_once(&self) -> Result<bool> {
        if self.bus.stop_service().is_stopping() {
            return Ok(false);
        }
        let Some(message) = self.bus.claim_next().await? else {
            return Ok(false);
        };

        match sync_key(&message) {
            Some(key) => {
                self.bus
                    .run_exclusive(FUNNEL_SCOPE, &key, move || self.execute(message))
                    .await?
            }
            None => self.execute(message).await?,
        }
        Ok(true)
    }

    async fn execute(&self, message: Message) -> Result<()> {
        let started = match self.bus.start_processing(&message).await? {
            StartOutcome::Started(started) => started,
            _ => return Ok(()),
        };

        let outcome = self.pipeline.process(&started).await;
        debug!(message_id = started.id, outcome = ?outcome, "Pipeline finished");

        if let Err(e) = self.bus.apply_outcome(started.id, outcome).await {
            warn!(
                message_id = started.id,
                error = %e,
                "Failed to record pipeline outcome"
            );
            return Err(e);
        }
        Ok(())
    }

    /// Spawn the workers.
    pub fn spawn(self) -> PollExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = self.config.workers.max(1);

        let handles = (0..workers)
            .map(|worker| {
                let executor = self.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { executor.run_worker(worker, shutdown_rx).await })
            })
            .collect();

        info!(
            workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Poll executor started"
        );

        PollExecutorHandle {
            shutdown_tx,
            handles,
        }
    }

    async fn run_worker(&self, worker: usize, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let busy = match self.poll_once().await {
                Ok(busy) => busy,
                Err(e) => {
                    error!(worker, error = %e, "Poll executor iteration failed");
                    false
                }
            };
            if busy {
                continue;
            }

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(worker, "Poll worker stopped");
    }
}

/// Running workers of a [`PollExecutor`].
pub struct PollExecutorHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl PollExecutorHandle {
    /// Signal the workers and wait for in-flight attempts to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Poll worker task panicked: {}", e);
            }
        }
        info!("Poll executor stopped");
    }

    /// Whether every worker is still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|h| !h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;
    use crate::persistence::{NewMessage, SqliteStore};
    use crate::state::MessageState;
    use chrono::{TimeZone, Utc};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;

    /// Pipeline answering from the message payload.
    #[derive(Default)]
    struct ScriptedPipeline {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Pipeline for ScriptedPipeline {
        async fn process(&self, message: &Message) -> PipelineOutcome {
            self.seen.lock().unwrap().push(message.id);
            match message.payload.as_str() {
                "retry" => PipelineOutcome::RetryableError(ErrorInfo::from_code(
                    ErrorCode::TargetSystemIo,
                )),
                "fatal" => PipelineOutcome::FatalError(ErrorInfo::new("E102", "bad input")),
                "wait" => PipelineOutcome::WaitingForResponse,
                _ => PipelineOutcome::Ok,
            }
        }
    }

    async fn setup() -> (Arc<MessageBus>, Arc<ScriptedPipeline>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        ));
        let bus = MessageBus::builder(Arc::new(SqliteStore::new(pool)))
            .clock(clock)
            .build();
        (Arc::new(bus), Arc::new(ScriptedPipeline::default()))
    }

    fn message(corr: &str, payload: &str) -> NewMessage {
        NewMessage::new(
            "crm",
            "customer",
            "setCustomer",
            corr,
            Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap(),
            payload,
        )
    }

    #[tokio::test]
    async fn test_outcomes_are_applied() {
        let (bus, pipeline) = setup().await;
        let executor = PollExecutor::new(bus.clone(), pipeline.clone(), PollExecutorConfig::default());

        let ok = bus.insert(&message("ok", "ok")).await.unwrap();
        let retry = bus.insert(&message("retry", "retry")).await.unwrap();
        let fatal = bus.insert(&message("fatal", "fatal")).await.unwrap();
        let wait = bus.insert(&message("wait", "wait")).await.unwrap();

        while executor.poll_once().await.unwrap() {}

        let state = |id| {
            let bus = bus.clone();
            async move { bus.find_by_id(id).await.unwrap() }
        };
        assert_eq!(state(ok.id).await.state, MessageState::Ok);

        let retried = state(retry.id).await;
        assert_eq!(retried.state, MessageState::PartlyFailed);
        assert_eq!(retried.failed_count, 1);
        assert_eq!(retried.failed_error_code.as_deref(), Some("E103"));

        let failed = state(fatal.id).await;
        assert_eq!(failed.state, MessageState::Failed);
        assert_eq!(failed.failed_count, 0);

        assert_eq!(state(wait.id).await.state, MessageState::WaitingForRes);
        assert_eq!(pipeline.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_no_claims_while_stopping() {
        let (bus, pipeline) = setup().await;
        let executor = PollExecutor::new(bus.clone(), pipeline.clone(), PollExecutorConfig::default());
        bus.insert(&message("stopping", "ok")).await.unwrap();

        bus.stop_service().stop();
        assert!(!executor.poll_once().await.unwrap());
        assert_eq!(bus.count_by_state(MessageState::New).await.unwrap(), 1);

        bus.stop_service().resume();
        assert!(executor.poll_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_spawned_workers_drain_queue() {
        let (bus, pipeline) = setup().await;
        for i in 0..10 {
            bus.insert(&message(&format!("m-{i}"), "ok")).await.unwrap();
        }

        let handle = PollExecutor::new(
            bus.clone(),
            pipeline.clone(),
            PollExecutorConfig {
                workers: 3,
                poll_interval: Duration::from_millis(10),
            },
        )
        .spawn();
        assert!(handle.is_running());

        tokio::time::timeout(Duration::from_secs(10), async {
            while bus.count_by_state(MessageState::Ok).await.unwrap() < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue drained");

        handle.shutdown().await;

        let mut seen = pipeline.seen.lock().unwrap().clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 10);
    }
}
