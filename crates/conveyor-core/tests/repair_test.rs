// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repair tests: work abandoned by crashed workers is reclaimed exactly once.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use conveyor_core::config::EngineSettings;
use conveyor_core::events::BusEvent;
use conveyor_core::persistence::{CancelOutcome, ExternalCallPrepare};
use conveyor_core::repair::{RepairScheduler, RepairSchedulerConfig};
use conveyor_core::state::ExternalCallState;
use conveyor_core::{ErrorCode, MessageState};

#[tokio::test]
async fn test_crashed_worker_message_is_retried() {
    let ctx = TestContext::new().await;
    let bus = ctx.bus();

    let m = bus.insert(&message("crash")).await.unwrap();
    start_next(&bus).await;
    // the worker dies here without reporting an outcome

    ctx.advance_secs(301);
    let repaired = bus.repair_stuck_messages().await.unwrap();
    assert_eq!(repaired.len(), 1);
    assert_eq!(repaired[0].id, m.id);
    assert_eq!(repaired[0].state, MessageState::PartlyFailed);
    assert_eq!(
        repaired[0].failed_error_code.as_deref(),
        Some(ErrorCode::StuckInProcessing.as_str())
    );

    ctx.advance_secs(61);
    let retried = start_next(&bus).await;
    assert_eq!(retried.id, m.id);
    assert_eq!(bus.mark_ok(m.id).await.unwrap().state, MessageState::Ok);
}

#[tokio::test]
async fn test_concurrent_repair_counts_each_message_once() {
    let ctx = TestContext::new().await;
    let node_a = ctx.builder("node-a").build();
    let node_b = ctx.builder("node-b").build();

    for i in 0..3 {
        node_a.insert(&message(&format!("stuck-{i}"))).await.unwrap();
        start_next(&node_a).await;
    }

    ctx.advance_secs(301);
    let (a, b) = tokio::join!(
        node_a.repair_stuck_messages(),
        node_b.repair_stuck_messages()
    );
    assert_eq!(a.unwrap().len() + b.unwrap().len(), 3);

    for i in 1..=3 {
        let m = node_a.find_by_id(i).await.unwrap();
        assert_eq!(m.failed_count, 1);
        assert_eq!(m.state, MessageState::PartlyFailed);
    }
}

#[tokio::test]
async fn test_repeated_crashes_escalate_to_failed() {
    let ctx = TestContext::new().await;
    let bus = ctx.bus_with(EngineSettings {
        count_partly_fails_before_failed: 3,
        ..EngineSettings::default()
    });
    let mut rx = bus.events().subscribe();

    let m = bus.insert(&message("poison")).await.unwrap();
    for attempt in 1..=3 {
        start_next(&bus).await;
        ctx.advance_secs(301);
        let repaired = bus.repair_stuck_messages().await.unwrap();
        assert_eq!(repaired[0].failed_count, attempt);
        ctx.advance_secs(61);
    }

    let failed = bus.find_by_id(m.id).await.unwrap();
    assert_eq!(failed.state, MessageState::Failed);
    assert!(bus.claim_next().await.unwrap().is_none());

    let mut failed_events = 0;
    while let Ok(event) = rx.try_recv() {
        if event == (BusEvent::Failed {
            message_id: m.id,
            code: Some("E116".to_string()),
        }) {
            failed_events += 1;
        }
    }
    assert_eq!(failed_events, 1);
}

#[tokio::test]
async fn test_repair_honors_pending_cancel() {
    let ctx = TestContext::new().await;
    let bus = ctx.bus();
    let mut rx = bus.events().subscribe();

    let m = bus.insert(&message("cancel-then-crash")).await.unwrap();
    start_next(&bus).await;
    assert!(matches!(
        bus.mark_cancel(m.id).await.unwrap(),
        CancelOutcome::Deferred(_)
    ));
    // the worker dies before reporting an outcome

    ctx.advance_secs(301);
    let repaired = bus.repair_stuck_messages().await.unwrap();
    assert_eq!(repaired.len(), 1);
    assert_eq!(repaired[0].state, MessageState::Cancel);

    ctx.advance_secs(3600);
    assert!(bus.claim_next().await.unwrap().is_none());
    assert_eq!(
        bus.find_by_id(m.id).await.unwrap().state,
        MessageState::Cancel
    );

    let mut cancelled = false;
    while let Ok(event) = rx.try_recv() {
        cancelled |= event == BusEvent::Cancelled { message_id: m.id };
    }
    assert!(cancelled);
}

#[tokio::test]
async fn test_waiting_messages_are_not_repaired() {
    let ctx = TestContext::new().await;
    let bus = ctx.bus();

    let m = bus.insert(&message("async")).await.unwrap();
    start_next(&bus).await;
    bus.mark_waiting_for_response(m.id).await.unwrap();

    ctx.advance_secs(3600);
    assert!(bus.repair_stuck_messages().await.unwrap().is_empty());
    assert_eq!(
        bus.find_by_id(m.id).await.unwrap().state,
        MessageState::WaitingForRes
    );
}

#[tokio::test]
async fn test_stuck_external_call_can_be_retried() {
    let ctx = TestContext::new().await;
    let bus = ctx.bus();
    let m = bus.insert(&message("ext")).await.unwrap();

    assert!(matches!(
        bus.prepare_external_call("erp:createInvoice", "INV-1", &m)
            .await
            .unwrap(),
        ExternalCallPrepare::Acquired(_)
    ));
    assert!(
        bus.prepare_external_call("erp:createInvoice", "INV-1", &m)
            .await
            .is_err()
    );

    ctx.advance_secs(301);
    let repaired = bus.repair_stuck_external_calls().await.unwrap();
    assert_eq!(repaired.len(), 1);
    assert_eq!(repaired[0].state, ExternalCallState::Failed);

    let ExternalCallPrepare::Acquired(call) = bus
        .prepare_external_call("erp:createInvoice", "INV-1", &m)
        .await
        .unwrap()
    else {
        panic!("call not re-acquired");
    };
    assert_eq!(call.state, ExternalCallState::Processing);
    assert_eq!(call.failed_count, 1);
}

#[tokio::test]
async fn test_scheduler_repairs_in_background() {
    let ctx = TestContext::new().await;
    let bus = Arc::new(ctx.bus());

    let m = bus.insert(&message("background")).await.unwrap();
    start_next(&bus).await;
    ctx.advance_secs(301);

    let scheduler = RepairScheduler::new(
        bus.repair_service().clone(),
        RepairSchedulerConfig {
            poll_interval: Duration::from_millis(10),
        },
    );
    let shutdown = scheduler.shutdown_handle();
    let handle = tokio::spawn(async move { scheduler.run().await });

    tokio::time::timeout(Duration::from_secs(10), async {
        while bus.find_by_id(m.id).await.unwrap().state != MessageState::PartlyFailed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message repaired");

    shutdown.notify_one();
    handle.await.unwrap();
    assert_eq!(bus.find_by_id(m.id).await.unwrap().failed_count, 1);
}
