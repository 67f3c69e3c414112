// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conveyor Node - standalone maintenance node
//!
//! Runs database migrations and the repair scheduler against a shared
//! message database. Message processing itself is embedded by the
//! platform through [`BusRuntime`] with its own pipeline.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use conveyor_core::MessageState;
use conveyor_core::config::Config;
use conveyor_core::persistence::{MessageStore, PostgresStore, SqliteStore};
use conveyor_core::runtime::BusRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("conveyor_core=info".parse()?),
        )
        .init();

    info!("Starting Conveyor node");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        node_id = %config.node_id,
        repair_poll_interval_secs = config.repair_poll_interval.as_secs(),
        throttling_disabled = config.throttling.disabled,
        "Configuration loaded"
    );

    // Connect to database and run migrations
    info!("Connecting to database...");
    let store: Arc<dyn MessageStore> = if config.database_url.starts_with("postgres") {
        Arc::new(PostgresStore::connect(&config.database_url, 10).await?)
    } else {
        Arc::new(SqliteStore::connect(&config.database_url).await?)
    };
    info!("Database ready, migrations applied");

    let runtime = BusRuntime::builder()
        .config(&config)
        .store(store)
        .build()?
        .start()
        .await?;

    let backlog = runtime.bus().count_by_state(MessageState::New).await?;
    info!(backlog, "Conveyor node initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
