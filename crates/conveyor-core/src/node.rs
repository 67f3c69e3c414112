// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster node identity and stopping mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Provides the identity of the node running this engine.
pub trait NodeIdentity: Send + Sync {
    /// Identifier recorded in `node_id` of every message this node claims.
    fn current_node_id(&self) -> String;
}

/// Node identity fixed at startup.
#[derive(Debug, Clone)]
pub struct StaticNodeIdentity {
    node_id: String,
}

impl StaticNodeIdentity {
    /// Create an identity with the given node id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl NodeIdentity for StaticNodeIdentity {
    fn current_node_id(&self) -> String {
        self.node_id.clone()
    }
}

/// Shared flag telling the node to stop taking new work.
///
/// Once stopping, `submit` rejects new messages and poll workers stop
/// claiming. Messages already claimed finish their current attempt.
#[derive(Debug, Clone, Default)]
pub struct StopService {
    stopping: Arc<AtomicBool>,
}

impl StopService {
    /// Create a service in running mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter stopping mode.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Leave stopping mode.
    pub fn resume(&self) {
        self.stopping.store(false, Ordering::SeqCst);
    }

    /// Whether the node is stopping.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}
