// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for conveyor-core.
//!
//! [`BusError`] is what the engine returns to its callers. [`ErrorCode`] is the
//! catalog of internal codes persisted on failed messages, so an operator can
//! tell a throttled message from one that got stuck in processing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::MessageState;

/// Result type using BusError
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors returned by message bus operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum BusError {
    /// Message was not found in the store.
    MessageNotFound {
        /// The message ID that was not found.
        message_id: i64,
    },

    /// The requested state transition is not allowed from the current state.
    InvalidTransition {
        /// The message ID.
        message_id: i64,
        /// The state the message is currently in.
        from: MessageState,
        /// The state that was requested.
        to: MessageState,
    },

    /// Admission was rejected because the scope exceeded its limit.
    ThrottlingExceeded {
        /// Source system of the rejected request.
        source_system: String,
        /// Service of the rejected request.
        service: String,
        /// Limit of the resolved scope.
        limit: u32,
        /// Window of the resolved scope in seconds.
        interval_secs: u64,
    },

    /// The node is stopping and accepts no new work.
    Stopping,

    /// A row lock could not be acquired.
    LockFailure {
        /// What was being locked.
        resource: String,
    },

    /// Another attempt currently holds the external call for this key.
    ExternalCallInProgress {
        /// Operation URI of the call.
        operation: String,
        /// Entity the call mutates.
        entity_id: String,
    },

    /// External call record was not found.
    ExternalCallNotFound {
        /// The external call ID.
        call_id: i64,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl BusError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MessageNotFound { .. } => "MESSAGE_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ThrottlingExceeded { .. } => "THROTTLING_EXCEEDED",
            Self::Stopping => "STOPPING",
            Self::LockFailure { .. } => "LOCK_FAILURE",
            Self::ExternalCallInProgress { .. } => "EXTERNAL_CALL_IN_PROGRESS",
            Self::ExternalCallNotFound { .. } => "EXTERNAL_CALL_NOT_FOUND",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Internal code persisted on a message when this error fails it.
    pub fn internal_code(&self) -> ErrorCode {
        match self {
            Self::ThrottlingExceeded { .. } => ErrorCode::ThrottlingExceeded,
            Self::Stopping => ErrorCode::Stopping,
            Self::LockFailure { .. } | Self::ExternalCallInProgress { .. } => {
                ErrorCode::LockFailure
            }
            Self::MessageNotFound { .. } | Self::ExternalCallNotFound { .. } => {
                ErrorCode::NoDataFound
            }
            Self::ValidationError { .. } | Self::InvalidTransition { .. } => {
                ErrorCode::Validation
            }
            Self::DatabaseError { .. } => ErrorCode::Unspecified,
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageNotFound { message_id } => {
                write!(f, "Message {} not found", message_id)
            }
            Self::InvalidTransition {
                message_id,
                from,
                to,
            } => {
                write!(
                    f,
                    "Message {} cannot move from {} to {}",
                    message_id, from, to
                )
            }
            Self::ThrottlingExceeded {
                source_system,
                service,
                limit,
                interval_secs,
            } => {
                write!(
                    f,
                    "Throttling limit exceeded for {}.{}: {} requests per {}s",
                    source_system, service, limit, interval_secs
                )
            }
            Self::Stopping => write!(f, "Node is stopping, no new messages are accepted"),
            Self::LockFailure { resource } => {
                write!(f, "Failed to acquire lock on {}", resource)
            }
            Self::ExternalCallInProgress {
                operation,
                entity_id,
            } => {
                write!(
                    f,
                    "External call {} for entity '{}' is already in progress",
                    operation, entity_id
                )
            }
            Self::ExternalCallNotFound { call_id } => {
                write!(f, "External call {} not found", call_id)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for BusError {}

impl From<sqlx::Error> for BusError {
    fn from(err: sqlx::Error) -> Self {
        BusError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for BusError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        BusError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

/// Internal error codes persisted in `failed_error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// E100: unspecified error.
    #[serde(rename = "E100")]
    Unspecified,
    /// E102: validation error, the input is structurally wrong.
    #[serde(rename = "E102")]
    Validation,
    /// E103: I/O error while talking to the target system.
    #[serde(rename = "E103")]
    TargetSystemIo,
    /// E107: no data found.
    #[serde(rename = "E107")]
    NoDataFound,
    /// E112: a lock could not be acquired.
    #[serde(rename = "E112")]
    LockFailure,
    /// E114: the throttling limit was exceeded.
    #[serde(rename = "E114")]
    ThrottlingExceeded,
    /// E116: the message stays repeatedly in PROCESSING state.
    #[serde(rename = "E116")]
    StuckInProcessing,
    /// E119: the node is stopping.
    #[serde(rename = "E119")]
    Stopping,
    /// E121: the message was postponed for too long.
    #[serde(rename = "E121")]
    PostponedTooLong,
}

impl ErrorCode {
    /// The persisted code, e.g. `E116`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "E100",
            Self::Validation => "E102",
            Self::TargetSystemIo => "E103",
            Self::NoDataFound => "E107",
            Self::LockFailure => "E112",
            Self::ThrottlingExceeded => "E114",
            Self::StuckInProcessing => "E116",
            Self::Stopping => "E119",
            Self::PostponedTooLong => "E121",
        }
    }

    /// Default operator-facing description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified error",
            Self::Validation => "validation error",
            Self::TargetSystemIo => "I/O error during communication with target system",
            Self::NoDataFound => "no data found",
            Self::LockFailure => "lock failure",
            Self::ThrottlingExceeded => "throttling error, the limit was exceeded",
            Self::StuckInProcessing => "message stays repeatedly in PROCESSING state",
            Self::Stopping => "node is stopping",
            Self::PostponedTooLong => "message was postponed too long",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error code plus description recorded on a failed or partly failed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code, usually one of [`ErrorCode`] but pipelines may use their own.
    pub code: String,
    /// Free-text description for operators.
    pub description: String,
}

impl ErrorInfo {
    /// Build an error from a code and description.
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }

    /// Build an error from an internal code with its default description.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code.as_str(), code.description())
    }
}

impl From<&BusError> for ErrorInfo {
    fn from(err: &BusError) -> Self {
        Self::new(err.internal_code().as_str(), err.to_string())
    }
}
