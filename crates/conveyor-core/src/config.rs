// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::throttling::{DEFAULT_INTERVAL_SECS, DEFAULT_LIMIT, ThrottleProps, ThrottlingConfig};

/// Conveyor node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Identity of this node in the cluster
    pub node_id: String,
    /// Number of poll-executor workers
    pub workers: usize,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    /// How often the repair sweeps run
    pub repair_poll_interval: Duration,
    /// Intervals and limits of the message engine
    pub engine: EngineSettings,
    /// Throttling rules
    pub throttling: ThrottlingConfig,
}

/// Intervals and limits that drive the message state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// How long a PARTLY_FAILED message rests before it is claimed again.
    pub partly_failed_interval: Duration,
    /// How long a POSTPONED message rests before it is claimed again.
    pub postponed_interval: Duration,
    /// A message received longer ago than this fails instead of being postponed again.
    pub postponed_interval_when_failed: Duration,
    /// A message not updated for this long is considered stuck by repair.
    pub repair_repeat_time: Duration,
    /// Rows repaired per transaction.
    pub repair_batch_size: u32,
    /// Transactions per repair run.
    pub repair_max_batches: u32,
    /// Failures after which repair fails a message instead of retrying it.
    pub count_partly_fails_before_failed: u32,
    /// Funnel holders that started longer ago than this no longer block others.
    pub funnel_idle_interval: Duration,
    /// Funnel postponements a single claim may perform before giving up.
    pub max_postpones_per_claim: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            partly_failed_interval: Duration::from_secs(60),
            postponed_interval: Duration::from_secs(5),
            postponed_interval_when_failed: Duration::from_secs(300),
            repair_repeat_time: Duration::from_secs(300),
            repair_batch_size: 10,
            repair_max_batches: 5,
            count_partly_fails_before_failed: 3,
            funnel_idle_interval: Duration::from_secs(600),
            max_postpones_per_claim: 10,
        }
    }
}

impl EngineSettings {
    /// Load engine settings, falling back to [`Default`] per variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            partly_failed_interval: env_secs(
                "CONVEYOR_PARTLY_FAILED_INTERVAL_SECS",
                defaults.partly_failed_interval,
            )?,
            postponed_interval: env_secs(
                "CONVEYOR_POSTPONED_INTERVAL_SECS",
                defaults.postponed_interval,
            )?,
            postponed_interval_when_failed: env_secs(
                "CONVEYOR_POSTPONED_INTERVAL_WHEN_FAILED_SECS",
                defaults.postponed_interval_when_failed,
            )?,
            repair_repeat_time: env_secs(
                "CONVEYOR_REPAIR_REPEAT_TIME_SECS",
                defaults.repair_repeat_time,
            )?,
            repair_batch_size: env_positive("CONVEYOR_REPAIR_BATCH_SIZE", defaults.repair_batch_size)?,
            repair_max_batches: env_positive("CONVEYOR_REPAIR_MAX_BATCHES", defaults.repair_max_batches)?,
            count_partly_fails_before_failed: env_positive(
                "CONVEYOR_COUNT_PARTLY_FAILS_BEFORE_FAILED",
                defaults.count_partly_fails_before_failed,
            )?,
            funnel_idle_interval: env_secs(
                "CONVEYOR_FUNNEL_IDLE_INTERVAL_SECS",
                defaults.funnel_idle_interval,
            )?,
            max_postpones_per_claim: defaults.max_postpones_per_claim,
        })
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CONVEYOR_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CONVEYOR_NODE_ID`: node identity (default: `node-<random>`)
    /// - `CONVEYOR_WORKERS`: poll workers (default: 4)
    /// - `CONVEYOR_POLL_INTERVAL_MS`: idle poll sleep (default: 1000)
    /// - `CONVEYOR_REPAIR_POLL_INTERVAL_SECS`: repair timer (default: 60)
    /// - `CONVEYOR_THROTTLING_DISABLED`: turn throttling off (default: false)
    /// - `CONVEYOR_THROTTLING_DEFAULT_INTERVAL_SECS` / `_LIMIT`: default rule (default: 60/60)
    /// - `CONVEYOR_THROTTLING_RULES`: `system.service=limit[/interval];...`
    /// - engine intervals, see [`EngineSettings::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CONVEYOR_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CONVEYOR_DATABASE_URL"))?;

        let node_id = std::env::var("CONVEYOR_NODE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));

        let workers: usize = env_parse("CONVEYOR_WORKERS", 4, "must be a positive integer")?;
        if workers == 0 {
            return Err(ConfigError::Invalid(
                "CONVEYOR_WORKERS",
                "must be a positive integer",
            ));
        }

        let poll_interval = Duration::from_millis(env_parse(
            "CONVEYOR_POLL_INTERVAL_MS",
            1000,
            "must be a number of milliseconds",
        )?);

        let repair_poll_interval =
            env_secs("CONVEYOR_REPAIR_POLL_INTERVAL_SECS", Duration::from_secs(60))?;

        Ok(Self {
            database_url,
            node_id,
            workers,
            poll_interval,
            repair_poll_interval,
            engine: EngineSettings::from_env()?,
            throttling: throttling_from_env()?,
        })
    }
}

fn throttling_from_env() -> Result<ThrottlingConfig, ConfigError> {
    let disabled = std::env::var("CONVEYOR_THROTTLING_DISABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let default_interval: u64 = env_parse(
        "CONVEYOR_THROTTLING_DEFAULT_INTERVAL_SECS",
        DEFAULT_INTERVAL_SECS,
        "must be a number of seconds",
    )?;
    if default_interval == 0 {
        return Err(ConfigError::Invalid(
            "CONVEYOR_THROTTLING_DEFAULT_INTERVAL_SECS",
            "must be positive",
        ));
    }
    let default_limit: u32 = env_parse(
        "CONVEYOR_THROTTLING_DEFAULT_LIMIT",
        DEFAULT_LIMIT,
        "must be a non-negative integer",
    )?;

    let mut throttling =
        ThrottlingConfig::with_default_rule(ThrottleProps::new(default_interval, default_limit));
    throttling.disabled = disabled;
    if let Ok(rules) = std::env::var("CONVEYOR_THROTTLING_RULES") {
        throttling.parse_rules(&rules, default_interval)?;
    }
    Ok(throttling)
}

fn env_parse<T: FromStr>(
    key: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, expected)),
        Err(_) => Ok(default),
    }
}

fn env_positive(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env_parse(key, default, "must be a positive integer")? {
        0 => Err(ConfigError::Invalid(key, "must be a positive integer")),
        value => Ok(value),
    }
}

fn env_secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs(), "must be a number of seconds").map(Duration::from_secs)
}

/// `now - interval`, saturating at the earliest representable time.
pub(crate) fn cutoff(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
