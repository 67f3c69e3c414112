// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for conveyor-core.
//!
//! [`BusRuntime`] wires a [`MessageBus`] to its background tasks: the poll
//! executor workers (when a [`Pipeline`] is given) and the repair scheduler.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use conveyor_core::persistence::PostgresStore;
//! use conveyor_core::runtime::BusRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(PostgresStore::connect("postgres://...", 10).await?);
//!
//!     let runtime = BusRuntime::builder()
//!         .store(store)
//!         .pipeline(Arc::new(MyPipeline))
//!         .node_id("node-a")
//!         .workers(8)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.bus().submit(&message).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::bus::MessageBus;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, EngineSettings};
use crate::events::EventNotifier;
use crate::node::{StaticNodeIdentity, StopService};
use crate::persistence::MessageStore;
use crate::poll_executor::{Pipeline, PollExecutor, PollExecutorConfig, PollExecutorHandle};
use crate::repair::{RepairScheduler, RepairSchedulerConfig};
use crate::throttling::ThrottlingConfig;

/// Builder for creating a [`BusRuntime`].
pub struct BusRuntimeBuilder {
    store: Option<Arc<dyn MessageStore>>,
    pipeline: Option<Arc<dyn Pipeline>>,
    clock: Arc<dyn Clock>,
    node_id: String,
    settings: EngineSettings,
    throttling: ThrottlingConfig,
    events: EventNotifier,
    stop: StopService,
    workers: usize,
    poll_interval: Duration,
    repair_poll_interval: Duration,
}

impl Default for BusRuntimeBuilder {
    fn default() -> Self {
        let executor = PollExecutorConfig::default();
        Self {
            store: None,
            pipeline: None,
            clock: Arc::new(SystemClock),
            node_id: "local".to_string(),
            settings: EngineSettings::default(),
            throttling: ThrottlingConfig::new(),
            events: EventNotifier::default(),
            stop: StopService::default(),
            workers: executor.workers,
            poll_interval: executor.poll_interval,
            repair_poll_interval: RepairSchedulerConfig::default().poll_interval,
        }
    }
}

impl BusRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply node identity, worker, interval and throttling settings from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.node_id = config.node_id.clone();
        self.workers = config.workers;
        self.poll_interval = config.poll_interval;
        self.repair_poll_interval = config.repair_poll_interval;
        self.settings = config.engine.clone();
        self.throttling = config.throttling.clone();
        self
    }

    /// Set the message store (required).
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the business pipeline.
    ///
    /// Without a pipeline no poll workers are started and the runtime only
    /// runs repair.
    pub fn pipeline(mut self, pipeline: Arc<dyn Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Set the time source.
    ///
    /// Default: system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the node identity recorded on claimed messages.
    ///
    /// Default: `local`
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the engine intervals and limits.
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the throttling rules.
    ///
    /// Default: unthrottled
    pub fn throttling(mut self, throttling: ThrottlingConfig) -> Self {
        self.throttling = throttling;
        self
    }

    /// Share an event channel.
    pub fn events(mut self, events: EventNotifier) -> Self {
        self.events = events;
        self
    }

    /// Share a stopping flag.
    pub fn stop_service(mut self, stop: StopService) -> Self {
        self.stop = stop;
        self
    }

    /// Set the number of poll workers.
    ///
    /// Default: `4`
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the sleep after an empty poll.
    ///
    /// Default: 1 second
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set how often the repair sweeps run.
    ///
    /// Default: 60 seconds
    pub fn repair_poll_interval(mut self, interval: Duration) -> Self {
        self.repair_poll_interval = interval;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<BusRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        if self.workers == 0 {
            return Err(anyhow::anyhow!("workers must be positive"));
        }

        Ok(BusRuntimeConfig {
            store,
            pipeline: self.pipeline,
            clock: self.clock,
            node_id: self.node_id,
            settings: self.settings,
            throttling: self.throttling,
            events: self.events,
            stop: self.stop,
            workers: self.workers,
            poll_interval: self.poll_interval,
            repair_poll_interval: self.repair_poll_interval,
        })
    }
}

/// Configuration for a [`BusRuntime`].
pub struct BusRuntimeConfig {
    store: Arc<dyn MessageStore>,
    pipeline: Option<Arc<dyn Pipeline>>,
    clock: Arc<dyn Clock>,
    node_id: String,
    settings: EngineSettings,
    throttling: ThrottlingConfig,
    events: EventNotifier,
    stop: StopService,
    workers: usize,
    poll_interval: Duration,
    repair_poll_interval: Duration,
}

impl BusRuntimeConfig {
    /// Start the runtime, spawning the poll workers and the repair scheduler.
    pub async fn start(self) -> Result<BusRuntime> {
        let bus = Arc::new(
            MessageBus::builder(self.store)
                .clock(self.clock)
                .node(Arc::new(StaticNodeIdentity::new(self.node_id.clone())))
                .settings(self.settings)
                .throttling(self.throttling)
                .events(self.events)
                .stop_service(self.stop)
                .build(),
        );

        let executor = match self.pipeline {
            Some(pipeline) => Some(
                PollExecutor::new(
                    bus.clone(),
                    pipeline,
                    PollExecutorConfig {
                        workers: self.workers,
                        poll_interval: self.poll_interval,
                    },
                )
                .spawn(),
            ),
            None => {
                debug!("No pipeline configured; poll workers not started");
                None
            }
        };

        let repair_scheduler = RepairScheduler::new(
            bus.repair_service().clone(),
            RepairSchedulerConfig {
                poll_interval: self.repair_poll_interval,
            },
        );
        let repair_shutdown = repair_scheduler.shutdown_handle();
        let repair_handle = tokio::spawn(async move {
            repair_scheduler.run().await;
        });

        info!(
            node_id = %self.node_id,
            workers = executor.as_ref().map_or(0, |_| self.workers),
            "BusRuntime started"
        );

        Ok(BusRuntime {
            bus,
            executor,
            repair_handle,
            repair_shutdown,
        })
    }
}

/// A running message bus that can be embedded in an application.
///
/// The runtime manages:
/// - poll executor workers driving messages through the pipeline
/// - the repair scheduler reclaiming abandoned work
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct BusRuntime {
    bus: Arc<MessageBus>,
    executor: Option<PollExecutorHandle>,
    repair_handle: JoinHandle<()>,
    repair_shutdown: Arc<Notify>,
}

impl BusRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> BusRuntimeBuilder {
        BusRuntimeBuilder::new()
    }

    /// The message bus driven by this runtime.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Check if the background tasks are still running.
    pub fn is_running(&self) -> bool {
        let workers = self.executor.as_ref().is_none_or(|e| e.is_running());
        workers && !self.repair_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Switches the node to stopping mode, lets the workers finish the
    /// attempts in flight, then stops the repair scheduler.
    pub async fn shutdown(self) -> Result<()> {
        info!("BusRuntime shutting down...");

        self.bus.stop_service().stop();

        if let Some(executor) = self.executor {
            executor.shutdown().await;
        }

        self.repair_shutdown.notify_one();
        if let Err(e) = self.repair_handle.await {
            error!("Repair scheduler task panicked: {}", e);
        }

        info!("BusRuntime shutdown complete");
        Ok(())
    }
}
