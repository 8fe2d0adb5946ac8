//! Integration tests for the reconciliation loop.

mod common;

use common::fixtures::{AccountBuilder, MonitorCall};
use common::{test_config, TestService, PROCESS};
use mailsync_scheduler::HeartbeatStore;
use mailsync_scheduler::SyncKind;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn tick_starts_only_new_and_stops_only_removed() {
    let harness = TestService::new();
    for id in 1..=4 {
        harness.accounts.insert(AccountBuilder::new(id).build());
    }
    for id in 1..=3 {
        harness.assignment.assign(id, PROCESS);
    }

    harness.service.poll().await;
    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([1, 2, 3])
    );

    // Account 1 moves to another process, account 4 arrives.
    harness.monitors.clear();
    harness.assignment.assign(1, "hostB:0");
    harness.assignment.assign(4, PROCESS);

    let report = harness.service.poll().await;

    assert_eq!(report.started, vec![4]);
    assert_eq!(report.stopped, vec![1]);
    assert_eq!(
        harness.monitors.events(),
        vec![
            (4, "email", MonitorCall::Start),
            (1, "email", MonitorCall::Kill)
        ]
    );
    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([2, 3, 4])
    );
    // Releasing an account owned elsewhere leaves the new owner in place.
    assert_eq!(harness.assignment.owner(1).as_deref(), Some("hostB:0"));
}

#[tokio::test]
async fn converged_tick_touches_nothing() {
    let harness = TestService::new();
    harness.accounts.insert(AccountBuilder::new(1).build());
    harness.assignment.assign(1, PROCESS);

    harness.service.poll().await;
    harness.monitors.clear();
    let report = harness.service.poll().await;

    assert!(report.started.is_empty());
    assert!(report.stopped.is_empty());
    assert!(harness.monitors.events().is_empty());
}

#[tokio::test]
async fn failing_account_does_not_block_others() {
    let harness = TestService::refusing(5);
    for id in 4..=6 {
        harness.accounts.insert(AccountBuilder::new(id).build());
        harness.assignment.assign(id, PROCESS);
    }

    let report = harness.service.poll().await;
    assert_eq!(report.started, vec![4, 6]);
    assert_eq!(report.failed, vec![5]);
    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([4, 6])
    );

    // Still desired, so it is retried every tick.
    let report = harness.service.poll().await;
    assert!(report.started.is_empty());
    assert_eq!(report.failed, vec![5]);
}

#[tokio::test]
async fn storage_outage_is_isolated_per_account() {
    let harness = TestService::new();
    for id in 1..=2 {
        harness.accounts.insert(AccountBuilder::new(id).build());
        harness.assignment.assign(id, PROCESS);
    }

    harness.accounts.fail_writes(true);
    let report = harness.service.poll().await;
    assert_eq!(report.failed, vec![1, 2]);
    assert!(harness.service.supervisor().running().await.is_empty());

    harness.accounts.fail_writes(false);
    let report = harness.service.poll().await;
    assert_eq!(report.started, vec![1, 2]);
    assert_eq!(harness.monitors.count("email", MonitorCall::Start), 2);
}

#[tokio::test]
async fn account_lifecycle_through_assignment() {
    let harness = TestService::new();
    harness
        .accounts
        .insert(AccountBuilder::new(10).should_run(false).build());
    harness.assignment.assign(10, PROCESS);

    harness.service.poll().await;

    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([10])
    );
    assert_eq!(harness.monitors.for_account(10), vec![("email", MonitorCall::Start)]);
    let account = harness.accounts.snapshot(10).unwrap();
    assert_eq!(account.sync_host.as_deref(), Some(PROCESS));
    assert!(account.sync_started_at.is_some());

    // The account disappears from the assignment view.
    harness.heartbeats.report(10, SyncKind::Email).await.unwrap();
    harness.assignment.remove(10);
    harness.service.poll().await;

    assert!(harness.service.supervisor().running().await.is_empty());
    assert_eq!(
        harness.monitors.for_account(10),
        vec![("email", MonitorCall::Start), ("email", MonitorCall::Kill)]
    );
    assert!(!harness.heartbeats.has_status(10));
    assert_eq!(harness.assignment.released(), vec![(10, PROCESS.to_string())]);
}

#[tokio::test]
async fn claims_only_while_a_core_has_headroom() {
    let harness = TestService::new();
    harness.accounts.insert(AccountBuilder::new(1).build());
    harness.assignment.enqueue(1);

    harness.cpu.set(&[95.0, 95.0, 95.0]);
    let report = harness.service.poll().await;
    assert_eq!(report.claimed, None);
    assert!(harness.assignment.owner(1).is_none());

    harness.cpu.set(&[95.0, 95.0, 10.0]);
    let report = harness.service.poll().await;
    assert_eq!(report.claimed, Some(1));
    assert_eq!(harness.assignment.owner(1).as_deref(), Some(PROCESS));
    assert_eq!(report.started, vec![1]);
}

#[tokio::test]
async fn stealing_disabled_never_claims() {
    let mut config = test_config();
    config.scheduling.stealing_enabled = false;
    let harness = TestService::with_config(config);
    harness.accounts.insert(AccountBuilder::new(1).build());
    harness.assignment.enqueue(1);

    let report = harness.service.poll().await;

    assert_eq!(report.claimed, None);
    assert!(harness.assignment.owner(1).is_none());
    assert!(harness.monitors.events().is_empty());
}

#[tokio::test]
async fn assignment_outage_skips_convergence() {
    let harness = TestService::new();
    harness.accounts.insert(AccountBuilder::new(1).build());
    harness.assignment.assign(1, PROCESS);
    harness.service.poll().await;

    harness.assignment.set_unavailable(true);
    let report = harness.service.poll().await;

    assert_eq!(report.desired, None);
    assert!(report.stopped.is_empty());
    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([1])
    );
}

#[tokio::test(start_paused = true)]
async fn run_converges_until_cancelled() {
    let harness = TestService::new();
    harness.accounts.insert(AccountBuilder::new(1).build());
    harness.assignment.assign(1, PROCESS);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(harness.service.clone().run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([1])
    );

    harness.assignment.assign(2, PROCESS);
    harness.accounts.insert(AccountBuilder::new(2).build());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([1, 2])
    );

    cancel.cancel();
    handle.await.unwrap();

    harness.service.shutdown().await;
    assert!(harness.service.supervisor().tracked().await.is_empty());
    assert_eq!(harness.monitors.count("email", MonitorCall::Kill), 2);
}

#[tokio::test]
async fn panicking_monitor_backend_does_not_block_siblings() {
    let harness = TestService::panicking(5);
    for id in 4..=6 {
        harness.accounts.insert(AccountBuilder::new(id).build());
        harness.assignment.assign(id, PROCESS);
    }

    let report = harness.service.poll().await;

    assert_eq!(report.started, vec![4, 6]);
    assert_eq!(report.failed, vec![5]);
    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([4, 6])
    );
}

#[tokio::test]
async fn panicking_store_read_is_isolated_per_account() {
    let harness = TestService::new();
    for id in 4..=6 {
        harness.accounts.insert(AccountBuilder::new(id).build());
        harness.assignment.assign(id, PROCESS);
    }

    harness.accounts.panic_on_get(Some(5));
    let report = harness.service.poll().await;
    assert_eq!(report.started, vec![4, 6]);
    assert_eq!(report.failed, vec![5]);

    // The supervisor lock survives the panic and the account recovers.
    harness.accounts.panic_on_get(None);
    let report = harness.service.poll().await;
    assert_eq!(report.started, vec![5]);
    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([4, 5, 6])
    );
}

#[tokio::test(start_paused = true)]
async fn run_restarts_after_panicking_tick() {
    let harness = TestService::panicking(5);
    for id in 4..=6 {
        harness.accounts.insert(AccountBuilder::new(id).build());
        harness.assignment.assign(id, PROCESS);
    }
    harness.assignment.panic_next_view();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(harness.service.clone().run(cancel.clone()));

    // First tick panics, the restart waits one poll interval (100ms).
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.assignment.view_reads(), 1);
    assert!(harness.service.supervisor().running().await.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([4, 6])
    );

    // Later ticks keep converging at the normal pace.
    harness.accounts.insert(AccountBuilder::new(7).build());
    harness.assignment.assign(7, PROCESS);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        harness.service.supervisor().running().await,
        BTreeSet::from([4, 6, 7])
    );
    assert!(harness.assignment.view_reads() <= 5);

    cancel.cancel();
    handle.await.unwrap();
}
