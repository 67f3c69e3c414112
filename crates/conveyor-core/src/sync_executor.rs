// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-key mutual exclusion within one process.
//!
//! [`SyncValueExecutor::run`] guarantees that at most one body runs at a time
//! for a given `(scope_type, key)`. Callers for a busy key wait cooperatively
//! and re-check once the holder finishes; there is no fairness between
//! waiters.
//!
//! Each key owns its own [`Notify`], so releasing a key only wakes callers of
//! that key. Slots are reference counted by their waiters and removed once
//! the key is free and nobody waits for it, so the registry only holds keys
//! that are in use.
//!
//! This is a local fast path. Cross-node exclusivity comes from row locks in
//! the message store, never from this executor.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::trace;

type SlotKey = (String, String);

#[derive(Default)]
struct Slot {
    busy: bool,
    waiters: usize,
    notify: Arc<Notify>,
}

/// Registry of keys currently executing.
#[derive(Default)]
pub struct SyncValueExecutor {
    slots: Mutex<HashMap<SlotKey, Slot>>,
}

impl std::fmt::Debug for SyncValueExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncValueExecutor")
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}

impl SyncValueExecutor {
    /// Create an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `body` once no other body holds `(scope_type, key)`.
    ///
    /// The key is released when the body completes, fails, panics, or the
    /// returned future is dropped.
    pub async fn run<F, Fut, T>(&self, scope_type: &str, key: &str, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire(scope_type, key).await;
        body().await
    }

    /// Whether a body is currently running for the key.
    pub fn is_busy(&self, scope_type: &str, key: &str) -> bool {
        self.is_slot_busy(&(scope_type.to_string(), key.to_string()))
    }

    /// Number of keys that are running or have waiters.
    pub fn tracked_keys(&self) -> usize {
        self.slots().len()
    }

    async fn acquire(&self, scope_type: &str, key: &str) -> Permit<'_> {
        let slot_key = (scope_type.to_string(), key.to_string());

        loop {
            let notify = {
                let mut slots = self.slots();
                let slot = slots.entry(slot_key.clone()).or_default();
                if !slot.busy {
                    slot.busy = true;
                    return Permit {
                        executor: self,
                        key: slot_key,
                    };
                }
                slot.waiters += 1;
                Arc::clone(&slot.notify)
            };
            let _waiter = Waiter {
                executor: self,
                key: &slot_key,
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Released between unlocking and registering: retry right away.
            if !self.is_slot_busy(&slot_key) {
                continue;
            }

            trace!(scope_type, key, "Waiting for synchronized value");
            notified.await;
        }
    }

    fn is_slot_busy(&self, slot_key: &SlotKey) -> bool {
        self.slots().get(slot_key).is_some_and(|slot| slot.busy)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SlotKey, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held while a body runs.
struct Permit<'a> {
    executor: &'a SyncValueExecutor,
    key: SlotKey,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut slots = self.executor.slots();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.busy = false;
            if slot.waiters == 0 {
                slots.remove(&self.key);
            } else {
                slot.notify.notify_waiters();
            }
        }
    }
}

/// Held while a caller waits; keeps the slot alive.
struct Waiter<'a> {
    executor: &'a SyncValueExecutor,
    key: &'a SlotKey,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut slots = self.executor.slots();
        if let Some(slot) = slots.get_mut(self.key) {
            slot.waiters = slot.waiters.saturating_sub(1);
            if !slot.busy && slot.waiters == 0 {
                slots.remove(self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_body_and_returns_value() {
        let executor = SyncValueExecutor::new();
        let value = executor.run("funnel", "42", || async { 7 }).await;
        assert_eq!(value, 7);
        assert_eq!(executor.tracked_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_never_runs_concurrently() {
        let executor = Arc::new(SyncValueExecutor::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let executor = executor.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .run("funnel", "774724557", || async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(executor.tracked_keys(), 0, "slots must be evicted");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_different_keys_run_in_parallel() {
        let executor = Arc::new(SyncValueExecutor::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .run("funnel", "a", || async move {
                        // Only finishes when the other key has run.
                        rx.await.ok();
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(executor.is_busy("funnel", "a"));

        executor
            .run("funnel", "b", || async move {
                tx.send(()).ok();
            })
            .await;

        tokio::time::timeout(Duration::from_secs(5), holder)
            .await
            .expect("key a should be released")
            .unwrap();
        assert!(!executor.is_busy("funnel", "a"));
    }

    #[tokio::test]
    async fn test_scope_types_are_independent() {
        let executor = SyncValueExecutor::new();
        let nested = executor
            .run("funnel", "k", || async {
                executor.run("throttle", "k", || async { "inner" }).await
            })
            .await;
        assert_eq!(nested, "inner");
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_slot() {
        let executor = Arc::new(SyncValueExecutor::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor.run("funnel", "k", || async move { rx.await.ok() }).await;
            })
        };
        tokio::task::yield_now().await;
        while !executor.is_busy("funnel", "k") {
            tokio::task::yield_now().await;
        }

        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            executor.run("funnel", "k", || async {}),
        )
        .await;
        assert!(waited.is_err(), "waiter should still be blocked");

        tx.send(()).ok();
        holder.await.unwrap();
        assert_eq!(executor.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_key_released_after_panic() {
        let executor = Arc::new(SyncValueExecutor::new());
        let panicking = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .run("funnel", "k", || async {
                        if true {
                            panic!("boom");
                        }
                    })
                    .await
            })
        };
        assert!(panicking.await.is_err());
        assert!(!executor.is_busy("funnel", "k"));
        assert_eq!(executor.run("funnel", "k", || async { 1 }).await, 1);
    }
}
