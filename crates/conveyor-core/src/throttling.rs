// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sliding-window admission control per `(source_system, service)` scope.
//!
//! A request scope is resolved to the most specific configured rule. An exact
//! match on a field scores one point, a wildcard scores nothing, and a
//! mismatch on a non-wildcard field rules the scope out. Requests are counted
//! against the resolved rule, so `(*, customer)` limits all source systems
//! together.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ConfigError, cutoff};
use crate::error::{BusError, Result};

/// Wildcard matching any source system or service.
pub const ANY: &str = "*";

/// Default window of the `(*, *)` rule.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Default limit of the `(*, *)` rule.
pub const DEFAULT_LIMIT: u32 = 60;

/// A `(source_system, service)` pair, either part may be [`ANY`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThrottleScope {
    /// Source system name or `*`.
    pub source_system: String,
    /// Service name or `*`.
    pub service: String,
}

impl ThrottleScope {
    /// Build a scope.
    pub fn new(source_system: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            source_system: source_system.into(),
            service: service.into(),
        }
    }

    /// Scope matching every request.
    pub fn any() -> Self {
        Self::new(ANY, ANY)
    }

    /// Whether both parts are wildcards.
    pub fn is_any(&self) -> bool {
        self.source_system == ANY && self.service == ANY
    }

    /// Specificity of this rule scope for a concrete request, `None` when it does not apply.
    pub fn match_score(&self, request: &ThrottleScope) -> Option<u8> {
        let source = field_score(&self.source_system, &request.source_system)?;
        let service = field_score(&self.service, &request.service)?;
        Some(source + service)
    }
}

fn field_score(rule: &str, request: &str) -> Option<u8> {
    if rule.eq_ignore_ascii_case(request) {
        Some(1)
    } else if rule == ANY || request == ANY {
        Some(0)
    } else {
        None
    }
}

impl fmt::Display for ThrottleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source_system, self.service)
    }
}

/// Limit and window of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleProps {
    /// Window length in seconds.
    pub interval_secs: u64,
    /// Maximum accepted requests per window.
    pub limit: u32,
}

impl ThrottleProps {
    /// Build properties.
    pub fn new(interval_secs: u64, limit: u32) -> Self {
        Self {
            interval_secs,
            limit,
        }
    }
}

/// Configured rules, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottlingConfig {
    /// Admit everything when set.
    pub disabled: bool,
    rules: Vec<(ThrottleScope, ThrottleProps)>,
}

impl ThrottlingConfig {
    /// Empty configuration, every request is unthrottled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with only the `(*, *)` rule.
    pub fn with_default_rule(props: ThrottleProps) -> Self {
        Self {
            disabled: false,
            rules: vec![(ThrottleScope::any(), props)],
        }
    }

    /// Add or replace a rule.
    ///
    /// Only the default rule may use wildcards on both fields.
    pub fn add_rule(&mut self, scope: ThrottleScope, props: ThrottleProps) -> Result<()> {
        if scope.is_any() && self.rules.iter().any(|(s, _)| s.is_any()) {
            return Err(BusError::ValidationError {
                field: "throttling".to_string(),
                message: "only the default rule may use '*' for both source system and service"
                    .to_string(),
            });
        }
        if props.interval_secs == 0 {
            return Err(BusError::ValidationError {
                field: "throttling".to_string(),
                message: format!("interval of {} must be positive", scope),
            });
        }

        match self.rules.iter_mut().find(|(s, _)| *s == scope) {
            Some(existing) => existing.1 = props,
            None => self.rules.push((scope, props)),
        }
        Ok(())
    }

    /// Parse `system.service=limit[/interval]` entries separated by `;`.
    ///
    /// A missing interval falls back to `default_interval_secs`.
    pub fn parse_rules(&mut self, rules: &str, default_interval_secs: u64) -> std::result::Result<(), ConfigError> {
        const INVALID: &str = "expected 'system.service=limit[/interval]' entries separated by ';'";

        for entry in rules.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (scope, props) = entry
                .split_once('=')
                .ok_or(ConfigError::Invalid("CONVEYOR_THROTTLING_RULES", INVALID))?;
            let (system, service) = scope
                .trim()
                .split_once('.')
                .ok_or(ConfigError::Invalid("CONVEYOR_THROTTLING_RULES", INVALID))?;

            let props = props.trim();
            let (limit, interval) = match props.split_once('/') {
                Some((limit, interval)) => (limit, Some(interval)),
                None => (props, None),
            };
            let limit: u32 = limit
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("CONVEYOR_THROTTLING_RULES", INVALID))?;
            let interval_secs: u64 = match interval {
                Some(i) => i
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid("CONVEYOR_THROTTLING_RULES", INVALID))?,
                None => default_interval_secs,
            };

            let scope = ThrottleScope::new(system.trim(), service.trim());
            if scope.is_any() {
                return Err(ConfigError::Invalid(
                    "CONVEYOR_THROTTLING_RULES",
                    "'*.*' is reserved for the default rule",
                ));
            }
            self.add_rule(scope, ThrottleProps::new(interval_secs, limit))
                .map_err(|_| {
                    ConfigError::Invalid("CONVEYOR_THROTTLING_RULES", "intervals must be positive")
                })?;
        }
        Ok(())
    }

    /// Most specific rule for a request; ties go to the rule declared first.
    pub fn resolve(&self, request: &ThrottleScope) -> Option<(&ThrottleScope, ThrottleProps)> {
        let mut best: Option<(u8, &ThrottleScope, ThrottleProps)> = None;
        for (scope, props) in &self.rules {
            if let Some(score) = scope.match_score(request)
                && best.is_none_or(|(best_score, _, _)| score > best_score)
            {
                best = Some((score, scope, *props));
            }
        }
        best.map(|(_, scope, props)| (scope, props))
    }

    /// Configured rules.
    pub fn rules(&self) -> &[(ThrottleScope, ThrottleProps)] {
        &self.rules
    }
}

/// In-memory sliding-window limiter.
///
/// Windows are kept per resolved rule and only record admitted requests.
/// The check and the record happen under one lock, so concurrent callers can
/// never push a window past its limit.
#[derive(Debug)]
pub struct Throttler {
    config: ThrottlingConfig,
    windows: Mutex<HashMap<ThrottleScope, VecDeque<DateTime<Utc>>>>,
}

impl Throttler {
    /// Create a limiter for the given rules.
    pub fn new(config: ThrottlingConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Rules in use.
    pub fn config(&self) -> &ThrottlingConfig {
        &self.config
    }

    /// Admit or reject one request at `now`.
    pub fn admit(&self, request: &ThrottleScope, now: DateTime<Utc>) -> Result<()> {
        if self.config.disabled {
            return Ok(());
        }
        let Some((rule, props)) = self.config.resolve(request) else {
            return Ok(());
        };

        let window_start = cutoff(now, std::time::Duration::from_secs(props.interval_secs));
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(rule.clone()).or_default();
        while window.front().is_some_and(|t| *t <= window_start) {
            window.pop_front();
        }

        if window.len() >= props.limit as usize {
            debug!(
                scope = %request,
                rule = %rule,
                limit = props.limit,
                "Throttling limit exceeded"
            );
            return Err(BusError::ThrottlingExceeded {
                source_system: request.source_system.clone(),
                service: request.service.clone(),
                limit: props.limit,
                interval_secs: props.interval_secs,
            });
        }

        window.push_back(now);
        Ok(())
    }
}
