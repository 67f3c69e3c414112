// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background reclamation of work abandoned by crashed workers.
//!
//! Messages in PROCESSING, NEW or IN_QUEUE that have not been updated for
//! `repair_repeat_time` get one more failure on their count and move to
//! PARTLY_FAILED, or to FAILED (E116) once the count reaches
//! `count_partly_fails_before_failed`. External calls stuck in PROCESSING
//! for the same time are closed as FAILED so a retry can call again.
//!
//! Each batch is a separate transaction of at most `repair_batch_size` rows
//! and a run stops after `repair_max_batches`. Repaired rows get a fresh
//! `last_update_timestamp`, so running the sweep again right away, or from
//! another node at the same time, does not penalize a message twice.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::bus::fail_hard_ancestors;
use crate::clock::Clock;
use crate::config::{EngineSettings, cutoff};
use crate::error::Result;
use crate::events::{BusEvent, EventNotifier};
use crate::persistence::{ExternalCall, Message, MessageStore, RepairRequest};
use crate::state::MessageState;

/// Repair sweeps over messages and external calls.
#[derive(Clone)]
pub struct RepairService {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    events: EventNotifier,
}

impl RepairService {
    /// Create a repair service.
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
        events: EventNotifier,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            events,
        }
    }

    fn batches(&self) -> u32 {
        self.settings.repair_max_batches.max(1)
    }

    /// Repair stuck messages and return them in their new state.
    pub async fn repair_stuck_messages(&self) -> Result<Vec<Message>> {
        let batch_size = self.settings.repair_batch_size.max(1);
        let mut repaired = Vec::new();

        for _ in 0..self.batches() {
            let now = self.clock.now();
            let request = RepairRequest {
                stale_before: cutoff(now, self.settings.repair_repeat_time),
                now,
                batch_size,
                fail_threshold: self.settings.count_partly_fails_before_failed,
            };
            let batch = self.store.repair_stuck_messages(&request).await?;
            let exhausted = batch.len() < batch_size as usize;

            for message in &batch {
                warn!(
                    message_id = message.id,
                    state = %message.state,
                    failed_count = message.failed_count,
                    "Repaired message stuck in processing"
                );
                self.events.publish(BusEvent::Repaired {
                    message_id: message.id,
                    state: message.state,
                });
                match message.state {
                    MessageState::Failed => {
                        self.events.publish(BusEvent::Failed {
                            message_id: message.id,
                            code: message.failed_error_code.clone(),
                        });
                        fail_hard_ancestors(self.store.as_ref(), &self.events, message, now)
                            .await?;
                    }
                    MessageState::Cancel => {
                        self.events.publish(BusEvent::Cancelled {
                            message_id: message.id,
                        });
                    }
                    _ => {}
                }
            }

            repaired.extend(batch);
            if exhausted {
                break;
            }
        }

        if !repaired.is_empty() {
            info!(count = repaired.len(), "Stuck messages repaired");
        }
        Ok(repaired)
    }

    /// Close abandoned external calls as FAILED.
    pub async fn repair_stuck_external_calls(&self) -> Result<Vec<ExternalCall>> {
        let batch_size = self.settings.repair_batch_size.max(1);
        let mut repaired = Vec::new();

        for _ in 0..self.batches() {
            let now = self.clock.now();
            let batch = self
                .store
                .repair_stuck_external_calls(
                    cutoff(now, self.settings.repair_repeat_time),
                    now,
                    batch_size,
                )
                .await?;
            let exhausted = batch.len() < batch_size as usize;

            for call in &batch {
                warn!(
                    call_id = call.id,
                    operation = %call.operation_name,
                    entity_id = %call.entity_id,
                    msg_id = call.msg_id,
                    "Repaired external call stuck in processing"
                );
            }

            repaired.extend(batch);
            if exhausted {
                break;
            }
        }

        if !repaired.is_empty() {
            info!(count = repaired.len(), "Stuck external calls repaired");
        }
        Ok(repaired)
    }
}

/// Configuration for the repair scheduler.
#[derive(Debug, Clone)]
pub struct RepairSchedulerConfig {
    /// How often both sweeps run.
    pub poll_interval: Duration,
}

impl Default for RepairSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Timer running both repair sweeps.
pub struct RepairScheduler {
    service: RepairService,
    config: RepairSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl RepairScheduler {
    /// Create a scheduler for `service`.
    pub fn new(service: RepairService, config: RepairSchedulerConfig) -> Self {
        Self {
            service,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Repair scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Repair scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.run_once().await;
                }
            }
        }

        info!("Repair scheduler stopped");
    }

    /// Run both sweeps once, logging failures.
    pub async fn run_once(&self) {
        debug!("Running repair sweeps");
        if let Err(e) = self.service.repair_stuck_messages().await {
            error!(error = %e, "Failed to repair stuck messages");
        }
        if let Err(e) = self.service.repair_stuck_external_calls().await {
            error!(error = %e, "Failed to repair stuck external calls");
        }
    }
}
