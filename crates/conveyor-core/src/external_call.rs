// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deduplication of calls to external systems.
//!
//! One record exists per `(operation, entity_id)`. While it is PROCESSING
//! nobody else may call the external system for that key. A message that is
//! older than the last successful or failed call for the key must not
//! overwrite it, and a message whose call already succeeded must not repeat
//! it.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::persistence::ExternalCall;
use crate::state::ExternalCallState;

/// Why a call is not made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A newer message already completed this call.
    NewerCallSucceeded,
    /// A message with the same timestamp already completed this call.
    DuplicateCall,
    /// A newer message already attempted this call and failed.
    NewerCallFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewerCallSucceeded => f.write_str("a newer call already succeeded"),
            Self::DuplicateCall => f.write_str("the call already succeeded"),
            Self::NewerCallFailed => f.write_str("a newer call already failed"),
        }
    }
}

/// What `prepare` has to do with the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// No record yet, insert one in PROCESSING.
    Create,
    /// Take over the record for this message.
    Relock,
    /// Another call is in flight.
    Busy,
    /// Do not call.
    Skip(SkipReason),
}

pub(crate) fn evaluate(existing: Option<&ExternalCall>, msg_timestamp: DateTime<Utc>) -> Verdict {
    let Some(call) = existing else {
        return Verdict::Create;
    };

    match call.state {
        ExternalCallState::Processing => Verdict::Busy,
        ExternalCallState::Ok if call.msg_timestamp > msg_timestamp => {
            Verdict::Skip(SkipReason::NewerCallSucceeded)
        }
        ExternalCallState::Ok if call.msg_timestamp == msg_timestamp => {
            Verdict::Skip(SkipReason::DuplicateCall)
        }
        ExternalCallState::Failed if call.msg_timestamp > msg_timestamp => {
            Verdict::Skip(SkipReason::NewerCallFailed)
        }
        ExternalCallState::Ok | ExternalCallState::Failed => Verdict::Relock,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn call(state: ExternalCallState, msg_timestamp: DateTime<Utc>) -> ExternalCall {
        ExternalCall {
            id: 1,
            operation_name: "crm:setActivity".to_string(),
            entity_id: "42".to_string(),
            msg_id: 10,
            msg_timestamp,
            state,
            failed_count: 0,
            creation_timestamp: msg_timestamp,
            last_update_timestamp: msg_timestamp,
        }
    }

    #[test]
    fn test_evaluate() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let older = ts - Duration::seconds(5);
        let newer = ts + Duration::seconds(5);

        assert_eq!(evaluate(None, ts), Verdict::Create);
        assert_eq!(
            evaluate(Some(&call(ExternalCallState::Processing, older)), ts),
            Verdict::Busy
        );

        assert_eq!(
            evaluate(Some(&call(ExternalCallState::Ok, newer)), ts),
            Verdict::Skip(SkipReason::NewerCallSucceeded)
        );
        assert_eq!(
            evaluate(Some(&call(ExternalCallState::Ok, ts)), ts),
            Verdict::Skip(SkipReason::DuplicateCall)
        );
        assert_eq!(
            evaluate(Some(&call(ExternalCallState::Ok, older)), ts),
            Verdict::Relock
        );

        assert_eq!(
            evaluate(Some(&call(ExternalCallState::Failed, newer)), ts),
            Verdict::Skip(SkipReason::NewerCallFailed)
        );
        // a retry of the same message may call again after a failure
        assert_eq!(
            evaluate(Some(&call(ExternalCallState::Failed, ts)), ts),
            Verdict::Relock
        );
    }
}
