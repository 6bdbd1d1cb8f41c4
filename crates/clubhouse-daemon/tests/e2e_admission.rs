//! End-to-end admission tests over the in-memory ledger.
//!
//! Each test runs the full pipeline (head monitor, coordinator, ingestor,
//! reconciler) against a [`MemoryLedger`] and checks the engine state the
//! operator would see.
//!
//! # Test Coverage
//!
//! | Area        | Behavior                                                  |
//! |-------------|-----------------------------------------------------------|
//! | History     | Grants mined before startup approve tickets               |
//! | Live        | Grants mined after startup approve tickets                |
//! | Ordering    | A grant seen before its ticket approves on allocation     |
//! | Filtering   | Other contracts, pre-deploy blocks, malformed logs        |
//! | Recovery    | Failed history queries and an unreachable ledger          |
//! | Restart     | Allocation count and approvals survive a restart (SQLite) |
//! | Reset       | A new session invalidates earlier challenges              |

mod common;

use std::sync::Arc;
use std::time::Duration;

use clubhouse_core::challenge::challenge_for;
use clubhouse_core::config::GRANT_ADMISSION_TOPIC;
use clubhouse_core::engine::{AccessEngine, ResetConfirmation};
use clubhouse_core::store::{CounterStore, MemoryCounterStore, SqliteCounterStore};
use clubhouse_daemon::ledger::memory::MemoryLedger;
use clubhouse_daemon::metrics::ObservationOrigin;
use common::{CONTRACT, Fixture, wait_until};
use tempfile::TempDir;

// =============================================================================
// History and live delivery
// =============================================================================

#[tokio::test]
async fn historical_grant_approves_existing_ticket() {
    let mut fx = Fixture::new(MemoryLedger::at_height(10));
    fx.engine.allocate().unwrap();
    let second = fx.engine.allocate().unwrap();
    fx.grant(&second.challenge);

    fx.start(0);
    fx.wait_for_approval(2).await;

    assert!(!fx.engine.is_approved(1));
    let metrics = fx.metrics.clubhouse_metrics();
    assert_eq!(metrics.observed_count(ObservationOrigin::Historical), 1);
    assert_eq!(metrics.observed_count(ObservationOrigin::Live), 0);
    fx.stop().await;
}

#[tokio::test]
async fn live_grant_approves_ticket() {
    let mut fx = Fixture::new(MemoryLedger::at_height(3));
    fx.start(0);
    fx.wait_for_subscription().await;

    let ticket = fx.engine.allocate().unwrap();
    fx.grant(&ticket.challenge);
    fx.wait_for_approval(ticket.number).await;

    let metrics = fx.metrics.clubhouse_metrics();
    assert_eq!(metrics.observed_count(ObservationOrigin::Live), 1);
    assert_eq!(metrics.approved_count(), 1);
    fx.stop().await;
}

#[tokio::test]
async fn grant_before_allocation_approves_on_allocation() {
    let mut fx = Fixture::new(MemoryLedger::new());
    let session = fx.engine.session_id();
    fx.grant(&challenge_for(3, &session));

    fx.start(0);
    let engine = Arc::clone(&fx.engine);
    wait_until("observation", move || {
        let engine = Arc::clone(&engine);
        async move { engine.snapshot().observed_passphrases == 1 }
    })
    .await;
    assert!(fx.engine.snapshot().approved.is_empty());

    for _ in 0..3 {
        fx.engine.allocate().unwrap();
    }
    assert_eq!(fx.engine.snapshot().approved, vec![3]);
    fx.stop().await;
}

#[tokio::test]
async fn duplicate_grants_approve_once() {
    let mut fx = Fixture::new(MemoryLedger::new());
    let ticket = fx.engine.allocate().unwrap();
    fx.grant(&ticket.challenge);
    fx.grant(&ticket.challenge);

    fx.start(0);
    fx.wait_for_subscription().await;
    fx.grant(&ticket.challenge);

    let metrics = Arc::clone(&fx.metrics);
    wait_until("all deliveries", move || {
        let metrics = Arc::clone(&metrics);
        async move { metrics.clubhouse_metrics().observed_count(ObservationOrigin::Live) == 1 }
    })
    .await;
    // Let the reconciler drain the queue.
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(fx.engine.snapshot().approved, vec![1]);
    assert_eq!(fx.metrics.clubhouse_metrics().approved_count(), 1);
    fx.stop().await;
}

// =============================================================================
// Filtering
// =============================================================================

#[tokio::test]
async fn foreign_contract_and_topic_are_ignored() {
    let mut fx = Fixture::new(MemoryLedger::new());
    let ticket = fx.engine.allocate().unwrap();
    fx.ledger.grant(
        "0x0000000000000000000000000000000000000bad",
        GRANT_ADMISSION_TOPIC,
        &ticket.challenge,
    );
    fx.ledger.grant(
        CONTRACT,
        "0x1111111111111111111111111111111111111111111111111111111111111111",
        &ticket.challenge,
    );

    fx.start(0);
    fx.wait_for_subscription().await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!fx.engine.is_approved(1));

    fx.grant(&ticket.challenge);
    fx.wait_for_approval(1).await;
    fx.stop().await;
}

#[tokio::test]
async fn blocks_before_deployment_are_not_replayed() {
    let mut fx = Fixture::new(MemoryLedger::new());
    let ticket = fx.engine.allocate().unwrap();
    // Mined in block 1.
    fx.grant(&ticket.challenge);
    for _ in 0..4 {
        fx.ledger.mine_block();
    }

    fx.start(3);
    fx.wait_for_subscription().await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!fx.engine.is_approved(ticket.number));
    assert_eq!(fx.engine.snapshot().observed_passphrases, 0);
    fx.stop().await;
}

#[tokio::test]
async fn malformed_log_is_skipped() {
    let mut fx = Fixture::new(MemoryLedger::new());
    let ticket = fx.engine.allocate().unwrap();
    fx.ledger
        .emit(CONTRACT, GRANT_ADMISSION_TOPIC, "0xnot-hex".to_string());
    fx.grant(&ticket.challenge);

    fx.start(0);
    fx.wait_for_approval(ticket.number).await;
    assert_eq!(fx.metrics.clubhouse_metrics().malformed_count(), 1);
    fx.stop().await;
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn failed_history_query_is_retried() {
    let mut fx = Fixture::new(MemoryLedger::new());
    let ticket = fx.engine.allocate().unwrap();
    fx.grant(&ticket.challenge);
    fx.ledger.fail_history_queries(2);

    fx.start(0);
    fx.wait_for_approval(ticket.number).await;
    assert_eq!(
        fx.metrics.clubhouse_metrics().ledger_error_count("grant_logs"),
        2
    );
    fx.stop().await;
}

#[tokio::test]
async fn ingestion_waits_for_reachable_ledger() {
    let ledger = MemoryLedger::new();
    ledger.set_unreachable(true);
    let mut fx = Fixture::new(ledger);
    let ticket = fx.engine.allocate().unwrap();

    fx.start(0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let pipeline = fx.pipeline.as_ref().unwrap();
    assert!(!pipeline.ingestor().is_active());
    assert!(!fx.state.read().await.connected);

    fx.grant(&ticket.challenge);
    fx.ledger.set_unreachable(false);
    fx.wait_for_approval(ticket.number).await;
    assert!(fx.pipeline.as_ref().unwrap().ingestor().is_active());
    assert!(fx.state.read().await.connected);
    fx.stop().await;
}

#[tokio::test]
async fn sync_status_is_recorded() {
    let ledger = MemoryLedger::at_height(1);
    ledger.set_syncing(true);
    let mut fx = Fixture::new(ledger);

    fx.start(0);
    let state = Arc::clone(&fx.state);
    wait_until("sync status", move || {
        let state = Arc::clone(&state);
        async move { state.read().await.is_syncing == Some(true) }
    })
    .await;
    fx.stop().await;
}

// =============================================================================
// Restart and reset
// =============================================================================

#[tokio::test]
async fn restart_rehydrates_count_and_replays_history() {
    let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
    let ledger = MemoryLedger::new();

    let (session, challenge) = {
        let engine = AccessEngine::open(Arc::clone(&store)).unwrap();
        engine.allocate().unwrap();
        let second = engine.allocate().unwrap();
        (engine.session_id(), second.challenge)
    };
    ledger.grant(CONTRACT, GRANT_ADMISSION_TOPIC, &challenge);

    let mut fx = Fixture::with_store(ledger, store);
    let snapshot = fx.engine.snapshot();
    assert_eq!(snapshot.session_id, session);
    assert_eq!(snapshot.allocation_count, 2);
    assert!(snapshot.approved.is_empty());

    fx.start(0);
    fx.wait_for_approval(2).await;
    assert_eq!(fx.engine.allocate().unwrap().number, 3);
    fx.stop().await;
}

#[tokio::test]
async fn sqlite_restart_resumes_session() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clubhouse.db");

    let mut first = Fixture::with_store(
        MemoryLedger::new(),
        Arc::new(SqliteCounterStore::open(&path).unwrap()),
    );
    first.start(0);
    let approved = first.engine.allocate().unwrap();
    let pending = first.engine.allocate().unwrap();
    first.grant(&approved.challenge);
    first.wait_for_approval(approved.number).await;
    let session = first.engine.session_id();
    first.stop().await;
    drop(first);

    // The new process sees the same chain, plus a grant mined while it was down.
    let ledger = MemoryLedger::new();
    ledger.grant(CONTRACT, GRANT_ADMISSION_TOPIC, &approved.challenge);
    ledger.grant(CONTRACT, GRANT_ADMISSION_TOPIC, &pending.challenge);
    let mut second = Fixture::with_store(
        ledger,
        Arc::new(SqliteCounterStore::open(&path).unwrap()),
    );
    assert_eq!(second.engine.session_id(), session);
    assert_eq!(second.engine.snapshot().allocation_count, 2);

    second.start(0);
    second.wait_for_approval(pending.number).await;
    assert_eq!(second.engine.snapshot().approved, vec![1, 2]);
    assert_eq!(second.engine.allocate().unwrap().number, 3);
    second.stop().await;
}

#[tokio::test]
async fn reset_invalidates_previous_challenges() {
    let mut fx = Fixture::new(MemoryLedger::new());
    let old = fx.engine.allocate().unwrap();
    fx.grant(&old.challenge);
    fx.start(0);
    fx.wait_for_approval(1).await;

    let previous = fx.engine.session_id();
    let session = fx
        .engine
        .reset_session(&ResetConfirmation::for_session(&previous))
        .unwrap();
    assert_ne!(session, previous);
    assert!(fx.engine.snapshot().approved.is_empty());

    let fresh = fx.engine.allocate().unwrap();
    assert_eq!(fresh.number, 1);
    assert_ne!(fresh.challenge, old.challenge);
    assert!(!fx.engine.is_approved(1));

    fx.wait_for_subscription().await;
    fx.grant(&fresh.challenge);
    fx.wait_for_approval(1).await;
    fx.stop().await;
}

#[tokio::test]
async fn shutdown_stops_pipeline() {
    let mut fx = Fixture::new(MemoryLedger::at_height(2));
    fx.start(0);
    fx.wait_for_subscription().await;
    fx.stop().await;

    assert!(fx.state.is_shutdown_requested());
    wait_until("subscription closed", || {
        let ledger = Arc::clone(&fx.ledger);
        async move { ledger.subscriber_count() == 0 }
    })
    .await;
}
