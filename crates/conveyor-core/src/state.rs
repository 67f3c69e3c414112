// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message and external call states.
//!
//! The transition table lives in [`MessageState::can_transition_to`]. Every
//! state mutation in the store is guarded by it, so an illegal transition is
//! rejected with [`BusError::InvalidTransition`](crate::error::BusError)
//! instead of silently overwriting the row.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a persisted state string is not recognised.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid {kind} state: {value}")]
pub struct ParseStateError {
    kind: &'static str,
    value: String,
}

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    /// Inserted, waiting for the first claim.
    New,
    /// Claimed by a node, not yet processing.
    InQueue,
    /// The pipeline is running.
    Processing,
    /// Waiting for child messages.
    Waiting,
    /// Waiting for an asynchronous response from an external system.
    WaitingForRes,
    /// Processed successfully.
    Ok,
    /// Recoverable failure, retried later.
    PartlyFailed,
    /// Yielded to another message with the same funnel value.
    Postponed,
    /// Failed permanently.
    Failed,
    /// Cancelled by an operator.
    Cancel,
}

impl MessageState {
    /// All states, in lifecycle order.
    pub const ALL: [MessageState; 10] = [
        Self::New,
        Self::InQueue,
        Self::Processing,
        Self::Waiting,
        Self::WaitingForRes,
        Self::Ok,
        Self::PartlyFailed,
        Self::Postponed,
        Self::Failed,
        Self::Cancel,
    ];

    /// States a running funnel holder can be in.
    pub const FUNNEL_RUNNING: [MessageState; 4] = [
        Self::InQueue,
        Self::Processing,
        Self::Waiting,
        Self::WaitingForRes,
    ];

    /// States picked up by the repair sweep when stale.
    pub const REPAIRABLE: [MessageState; 3] = [Self::Processing, Self::New, Self::InQueue];

    /// States an administrator may restart a message from. Claimed
    /// messages are excluded, they belong to a worker until repaired.
    pub const RESTARTABLE: [MessageState; 7] = [
        Self::Failed,
        Self::Cancel,
        Self::PartlyFailed,
        Self::Postponed,
        Self::New,
        Self::Waiting,
        Self::WaitingForRes,
    ];

    /// Live states that count for guaranteed order.
    pub const ORDERED: [MessageState; 7] = [
        Self::New,
        Self::InQueue,
        Self::Processing,
        Self::Waiting,
        Self::WaitingForRes,
        Self::PartlyFailed,
        Self::Postponed,
    ];

    /// Terminal states allow no further automatic transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Failed | Self::Cancel)
    }

    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::InQueue => "IN_QUEUE",
            Self::Processing => "PROCESSING",
            Self::Waiting => "WAITING",
            Self::WaitingForRes => "WAITING_FOR_RES",
            Self::Ok => "OK",
            Self::PartlyFailed => "PARTLY_FAILED",
            Self::Postponed => "POSTPONED",
            Self::Failed => "FAILED",
            Self::Cancel => "CANCEL",
        }
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(&self, to: MessageState) -> bool {
        use MessageState::*;

        if self.is_terminal() {
            return false;
        }

        match to {
            // administrative cancel and failure cascades apply to any live message
            Cancel | Failed => true,
            InQueue => matches!(self, New | PartlyFailed | Postponed),
            Processing => matches!(self, InQueue | WaitingForRes),
            Ok => matches!(self, Processing | Waiting),
            Waiting | WaitingForRes => matches!(self, Processing),
            PartlyFailed => matches!(self, Processing | New | InQueue | WaitingForRes),
            Postponed => matches!(self, New | InQueue | Processing | PartlyFailed | Postponed),
            New => false,
        }
    }

    /// States from which `to` is reachable.
    pub fn sources_of(to: MessageState) -> Vec<MessageState> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }

    /// Renders `states` as a quoted SQL list, e.g. `'NEW','IN_QUEUE'`.
    pub(crate) fn sql_list(states: &[MessageState]) -> String {
        states
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError {
                kind: "message",
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for MessageState {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// State of an external call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalCallState {
    /// A call is in flight.
    Processing,
    /// The last call succeeded.
    Ok,
    /// The last call failed or was abandoned.
    Failed,
}

impl ExternalCallState {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Ok => "OK",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ExternalCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExternalCallState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(Self::Processing),
            "OK" => Ok(Self::Ok),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseStateError {
                kind: "external call",
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for ExternalCallState {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// How a child message is bound to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingType {
    /// Parent completion depends on the child; child failure fails the parent.
    Hard,
    /// Child is processed independently of the parent.
    Soft,
}

impl BindingType {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hard => "HARD",
            Self::Soft => "SOFT",
        }
    }
}

impl FromStr for BindingType {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HARD" => Ok(Self::Hard),
            "SOFT" => Ok(Self::Soft),
            _ => Err(ParseStateError {
                kind: "binding",
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for BindingType {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(MessageState::Ok.is_terminal());
        assert!(MessageState::Failed.is_terminal());
        assert!(MessageState::Cancel.is_terminal());
        assert!(!MessageState::PartlyFailed.is_terminal());
        assert!(!MessageState::Waiting.is_terminal());
    }

    #[test]
    fn test_documented_transitions_are_allowed() {
        use MessageState::*;
        let allowed = [
            (New, InQueue),
            (InQueue, Processing),
            (Processing, Ok),
            (Processing, Waiting),
            (Processing, WaitingForRes),
            (Processing, PartlyFailed),
            (Processing, Failed),
            (PartlyFailed, InQueue),
            (Postponed, InQueue),
            (WaitingForRes, Processing),
            (Waiting, Ok),
        ];
        for (from, to) in allowed {
            assert!(from.can_transition_to(to), "{from} -> {to} should be allowed");
        }
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        use MessageState::*;
        let rejected = [
            (Ok, Processing),
            (Failed, PartlyFailed),
            (Cancel, InQueue),
            (New, Processing),
            (Waiting, Processing),
            (PartlyFailed, Ok),
            (Processing, New),
        ];
        for (from, to) in rejected {
            assert!(!from.can_transition_to(to), "{from} -> {to} should be rejected");
        }
    }

    #[test]
    fn test_any_live_state_can_be_cancelled() {
        for state in MessageState::ALL {
            assert_eq!(
                state.can_transition_to(MessageState::Cancel),
                !state.is_terminal()
            );
        }
    }

    #[test]
    fn test_sources_of() {
        let sources = MessageState::sources_of(MessageState::InQueue);
        assert_eq!(
            sources,
            vec![
                MessageState::New,
                MessageState::PartlyFailed,
                MessageState::Postponed
            ]
        );
        assert!(MessageState::sources_of(MessageState::New).is_empty());
    }

    #[test]
    fn test_string_round_trip() {
        for state in MessageState::ALL {
            assert_eq!(state.as_str().parse::<MessageState>().unwrap(), state);
        }
        assert!("RUNNING".parse::<MessageState>().is_err());
        assert_eq!(
            serde_json::to_string(&MessageState::WaitingForRes).unwrap(),
            "\"WAITING_FOR_RES\""
        );
    }

    #[test]
    fn test_sql_list() {
        assert_eq!(
            MessageState::sql_list(&[MessageState::New, MessageState::InQueue]),
            "'NEW','IN_QUEUE'"
        );
    }
}
