// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema migrations for the message and external call tables.
//!
//! Both stores run these on connect. Applications that manage their own
//! pool call them directly:
//!
//! ```ignore
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! conveyor_core::migrations::run_postgres(&pool).await?;
//! let store = conveyor_core::persistence::PostgresStore::new(pool);
//! ```

use sqlx::migrate::{MigrateError, Migrator};

/// PostgreSQL schema.
pub static POSTGRES: Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite schema.
pub static SQLITE: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Apply pending PostgreSQL migrations. Applied ones are skipped, and
/// sqlx takes an advisory lock so concurrent nodes do not race.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Apply pending SQLite migrations.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
