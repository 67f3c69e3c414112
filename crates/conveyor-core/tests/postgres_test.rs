// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store tests.
//!
//! Run with `TEST_DATABASE_URL=postgres://... cargo test --test postgres_test`.
//! Tests share one database and run one at a time.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::*;
use conveyor_core::persistence::{ExternalCallPrepare, StartOutcome};
use conveyor_core::state::BindingType;
use conveyor_core::{ErrorInfo, MessageState};
use tokio::sync::Mutex;

static DB_LOCK: Mutex<()> = Mutex::const_new(());

#[tokio::test]
async fn test_pg_lifecycle() {
    skip_if_no_db!();
    let _lock = DB_LOCK.lock().await;
    let Some(ctx) = PgContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };
    let bus = ctx.bus("node-a");

    let parent = bus.insert(&message("pg-parent")).await.unwrap();
    assert_eq!(start_next(&bus).await.id, parent.id);
    let child = bus
        .insert(&message("pg-child").child_of(parent.id, BindingType::Hard))
        .await
        .unwrap();
    assert!(bus.find_by_id(parent.id).await.unwrap().has_children);
    bus.mark_waiting(parent.id).await.unwrap();

    assert_eq!(start_next(&bus).await.id, child.id);
    bus.mark_ok(child.id).await.unwrap();
    assert_eq!(
        bus.find_by_id(parent.id).await.unwrap().state,
        MessageState::Ok
    );

    let found = bus.find_by_content("{}").await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].id, child.id);
}

#[tokio::test]
async fn test_pg_concurrent_claims() {
    skip_if_no_db!();
    let _lock = DB_LOCK.lock().await;
    let Some(ctx) = PgContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };
    let node_a = Arc::new(ctx.bus("node-a"));
    let node_b = Arc::new(ctx.bus("node-b"));

    let batch: Vec<_> = (0..20).map(|i| message(&format!("pg-c-{i}"))).collect();
    node_a.insert_batch(&batch).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|worker| {
            let bus = if worker % 2 == 0 {
                node_a.clone()
            } else {
                node_b.clone()
            };
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(message) = bus.claim_next().await.unwrap() {
                    claimed.push(message.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for task in futures::future::join_all(tasks).await {
        all.extend(task.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[tokio::test]
async fn test_pg_funnel_and_repair() {
    skip_if_no_db!();
    let _lock = DB_LOCK.lock().await;
    let Some(ctx) = PgContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };
    let bus = ctx.bus("node-a");

    let first = bus.insert(&funneled("pg-f-1", "774724557")).await.unwrap();
    start_next(&bus).await;
    let second = bus.insert(&funneled("pg-f-2", "774724557")).await.unwrap();
    assert!(bus.claim_next().await.unwrap().is_none());
    assert_eq!(
        bus.find_by_id(second.id).await.unwrap().state,
        MessageState::Postponed
    );

    ctx.clock.advance(chrono::Duration::seconds(301));
    let repaired = bus.repair_stuck_messages().await.unwrap();
    assert_eq!(repaired.len(), 1);
    assert_eq!(repaired[0].id, first.id);
    assert!(bus.repair_stuck_messages().await.unwrap().is_empty());

    // the holder is no longer running, the postponed message goes next
    let claimed = bus.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, second.id);
    assert!(matches!(
        bus.start_processing(&claimed).await.unwrap(),
        StartOutcome::Started(_)
    ));
    bus.mark_failed(second.id, ErrorInfo::new("E102", "bad input"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_pg_external_call_guard() {
    skip_if_no_db!();
    let _lock = DB_LOCK.lock().await;
    let Some(ctx) = PgContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };
    let bus = ctx.bus("node-a");
    let m = bus.insert(&message("pg-ext")).await.unwrap();

    let ExternalCallPrepare::Acquired(call) = bus
        .prepare_external_call("erp:createInvoice", "INV-1", &m)
        .await
        .unwrap()
    else {
        panic!("call not acquired");
    };
    assert!(
        bus.prepare_external_call("erp:createInvoice", "INV-1", &m)
            .await
            .is_err()
    );

    bus.fail_external_call(call.id).await.unwrap();
    assert!(matches!(
        bus.prepare_external_call("erp:createInvoice", "INV-1", &m)
            .await
            .unwrap(),
        ExternalCallPrepare::Acquired(_)
    ));
}
