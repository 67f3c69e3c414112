// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conveyor Core - Asynchronous Message Processing Engine
//!
//! This crate provides the message bus of an integration platform. Messages
//! from source systems are persisted, claimed by worker nodes, driven
//! through a business pipeline and tracked through a durable state machine.
//! All state lives in the database (PostgreSQL or SQLite), so any node can
//! crash at any time without losing work.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Source systems                                  │
//! │                 (submit, find_by_correlation_id)                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           MessageBus                                     │
//! │      throttling · stopping mode · parent/child propagation · events      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                        │                         │
//!           ▼                        ▼                         ▼
//! ┌───────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │   PollExecutor    │   │    MessagePool      │   │   RepairScheduler   │
//! │ workers, funnels  │──►│ claim_next, funnel  │   │ stuck messages and  │
//! │ via SyncValue-    │   │ and guaranteed      │   │ external calls      │
//! │ Executor          │   │ order checks        │   │                     │
//! └───────────────────┘   └─────────────────────┘   └─────────────────────┘
//!                                    │                         │
//!                                    ▼                         ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 MessageStore (PostgreSQL / SQLite)                       │
//! │              messages · external_calls · guarded transitions             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Message State Machine
//!
//! ```text
//!          ┌─────┐  claim   ┌──────────┐  start   ┌────────────┐
//!          │ NEW │─────────►│ IN_QUEUE │─────────►│ PROCESSING │
//!          └─────┘          └──────────┘          └─────┬──────┘
//!             ▲                 ▲   ▲                   │
//!     restart │        interval │   │ interval          ├──► OK
//!             │                 │   │                   ├──► WAITING ──(HARD children OK)──► OK
//!             │      ┌──────────┴┐ ┌┴──────────────┐    ├──► WAITING_FOR_RES ──(response)──► PROCESSING
//!             │      │ POSTPONED │ │ PARTLY_FAILED │◄───┤
//!             │      └───────────┘ └───────┬───────┘    └──► FAILED
//!             │                            │
//!             └──────── FAILED / CANCEL ◄──┘ (count_partly_fails_before_failed)
//! ```
//!
//! | State | Description |
//! |-------|-------------|
//! | `NEW` | Persisted, never claimed |
//! | `IN_QUEUE` | Claimed by a node, about to start |
//! | `PROCESSING` | Pipeline running |
//! | `WAITING` | Waiting for HARD child messages |
//! | `WAITING_FOR_RES` | Waiting for an asynchronous response |
//! | `PARTLY_FAILED` | Recoverable failure, retried after an interval |
//! | `POSTPONED` | Yielded to another message of the same funnel |
//! | `OK` | Terminal, success |
//! | `FAILED` | Terminal, failure |
//! | `CANCEL` | Terminal, cancelled by an operator |
//!
//! # Configuration
//!
//! The standalone node reads environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CONVEYOR_DATABASE_URL` | Yes | - | `postgres://` or `sqlite:` connection string |
//! | `CONVEYOR_NODE_ID` | No | `node-<random>` | Identity recorded on claimed messages |
//! | `CONVEYOR_WORKERS` | No | `4` | Poll workers |
//! | `CONVEYOR_POLL_INTERVAL_MS` | No | `1000` | Sleep after an empty poll |
//! | `CONVEYOR_REPAIR_POLL_INTERVAL_SECS` | No | `60` | Repair timer |
//! | `CONVEYOR_PARTLY_FAILED_INTERVAL_SECS` | No | `60` | Retry delay after a recoverable failure |
//! | `CONVEYOR_POSTPONED_INTERVAL_SECS` | No | `5` | Retry delay after a postponement |
//! | `CONVEYOR_POSTPONED_INTERVAL_WHEN_FAILED_SECS` | No | `300` | Give up on guaranteed order after this |
//! | `CONVEYOR_REPAIR_REPEAT_TIME_SECS` | No | `300` | Age after which work counts as stuck |
//! | `CONVEYOR_REPAIR_BATCH_SIZE` | No | `10` | Rows per repair transaction |
//! | `CONVEYOR_REPAIR_MAX_BATCHES` | No | `5` | Transactions per repair run |
//! | `CONVEYOR_COUNT_PARTLY_FAILS_BEFORE_FAILED` | No | `3` | Failures before FAILED |
//! | `CONVEYOR_FUNNEL_IDLE_INTERVAL_SECS` | No | `600` | Funnel holders older than this stop blocking |
//! | `CONVEYOR_THROTTLING_DISABLED` | No | `false` | Turn throttling off |
//! | `CONVEYOR_THROTTLING_DEFAULT_LIMIT` | No | `60` | Default requests per interval |
//! | `CONVEYOR_THROTTLING_DEFAULT_INTERVAL_SECS` | No | `60` | Default interval |
//! | `CONVEYOR_THROTTLING_RULES` | No | - | `system.service=limit[/interval];...` |
//!
//! # Modules
//!
//! - [`bus`]: The [`MessageBus`] facade
//! - [`pool`]: Claiming the next eligible message
//! - [`poll_executor`]: Worker pool and the [`Pipeline`] trait
//! - [`funnel`]: Funnel and guaranteed-order decisions
//! - [`sync_executor`]: In-process mutual exclusion per key
//! - [`throttling`]: Per-source/service admission limits
//! - [`repair`]: Reclaiming abandoned work
//! - [`persistence`]: [`MessageStore`] with PostgreSQL and SQLite backends
//! - [`runtime`]: Embeddable [`BusRuntime`]

#![deny(missing_docs)]

/// The message bus facade.
pub mod bus;

/// Time source abstraction.
pub mod clock;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Broadcast of message lifecycle events.
pub mod events;

/// Idempotency guard for calls to external systems.
pub mod external_call;

/// Funnel and guaranteed-order decisions.
pub mod funnel;

/// Embedded database migrations.
pub mod migrations;

/// Node identity and stopping mode.
pub mod node;

/// Message store trait and backends.
pub mod persistence;

/// Worker pool driving messages through the pipeline.
pub mod poll_executor;

/// Claiming the next eligible message.
pub mod pool;

/// Repair of stuck messages and external calls.
pub mod repair;

/// Embeddable runtime.
pub mod runtime;

/// Message and external call states.
pub mod state;

/// In-process mutual exclusion per key.
pub mod sync_executor;

/// Throttling of incoming messages.
pub mod throttling;

pub use bus::MessageBus;
pub use error::{BusError, ErrorCode, ErrorInfo, Result};
pub use persistence::{Message, MessageStore, NewMessage};
pub use poll_executor::{Pipeline, PipelineOutcome};
pub use runtime::BusRuntime;
pub use state::MessageState;
