// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for conveyor-core integration tests.
//!
//! Provides a file-backed SQLite [`TestContext`] with a manual clock, and a
//! PostgreSQL context for tests that run against `TEST_DATABASE_URL`.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use conveyor_core::bus::{MessageBus, MessageBusBuilder};
use conveyor_core::clock::{Clock, ManualClock};
use conveyor_core::config::EngineSettings;
use conveyor_core::node::StaticNodeIdentity;
use conveyor_core::persistence::{
    Message, MessageStore, NewMessage, PostgresStore, SqliteStore, StartOutcome,
};

/// Start of every test timeline.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

/// Test context with a SQLite database in a temporary directory.
pub struct TestContext {
    pub store: Arc<SqliteStore>,
    pub clock: Arc<ManualClock>,
    _dir: TempDir,
}

impl TestContext {
    /// Create a fresh, migrated database.
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = SqliteStore::from_path(dir.path().join("conveyor.db"))
            .await
            .expect("Failed to create SQLite store");

        Self {
            store: Arc::new(store),
            clock: Arc::new(ManualClock::new(t0())),
            _dir: dir,
        }
    }

    /// Bus builder bound to this database and clock, acting as `node_id`.
    pub fn builder(&self, node_id: &str) -> MessageBusBuilder {
        MessageBus::builder(self.store.clone())
            .clock(self.clock.clone())
            .node(Arc::new(StaticNodeIdentity::new(node_id)))
    }

    /// Bus with default settings acting as `node-a`.
    pub fn bus(&self) -> MessageBus {
        self.builder("node-a").build()
    }

    /// Bus with custom settings acting as `node-a`.
    pub fn bus_with(&self, settings: EngineSettings) -> MessageBus {
        self.builder("node-a").settings(settings).build()
    }

    /// Current test time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Move the clock forward.
    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

/// Test context against PostgreSQL, `None` without `TEST_DATABASE_URL`.
pub struct PgContext {
    pub store: Arc<PostgresStore>,
    pub clock: Arc<ManualClock>,
}

impl PgContext {
    /// Connect, migrate and empty the tables.
    pub async fn new() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let store = PostgresStore::connect(&database_url, 5).await.ok()?;

        sqlx::query("TRUNCATE external_calls, messages RESTART IDENTITY")
            .execute(store.pool())
            .await
            .ok()?;

        Some(Self {
            store: Arc::new(store),
            clock: Arc::new(ManualClock::new(t0())),
        })
    }

    /// Bus acting as `node_id`.
    pub fn bus(&self, node_id: &str) -> MessageBus {
        let store: Arc<dyn MessageStore> = self.store.clone();
        MessageBus::builder(store)
            .clock(self.clock.clone())
            .node(Arc::new(StaticNodeIdentity::new(node_id)))
            .build()
    }
}

/// Plain message from `crm`/`customer`.
pub fn message(correlation_id: &str) -> NewMessage {
    NewMessage::new(
        "crm",
        "customer",
        "setCustomer",
        correlation_id,
        t0(),
        "{}",
    )
}

/// Message holding `funnel_value` in the `customer-funnel` component.
pub fn funneled(correlation_id: &str, funnel_value: &str) -> NewMessage {
    message(correlation_id).with_funnel(funnel_value, "customer-funnel")
}

/// Claim the next message and move it to PROCESSING.
pub async fn start_next(bus: &MessageBus) -> Message {
    let claimed = bus
        .claim_next()
        .await
        .expect("claim failed")
        .expect("no message to claim");
    match bus.start_processing(&claimed).await.expect("start failed") {
        StartOutcome::Started(message) => message,
        other => panic!("message did not start: {:?}", other),
    }
}

/// Helper macro to skip tests if database URL is not set
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
