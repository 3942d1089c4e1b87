mod support;

use std::time::Duration;

use deal_signing::workflows::signing::{
    EnvelopeStatus, FailureReason, PollOutcome, PrepareOptions, SigningRound, SigningStage,
    StatusPoller, MIN_POLL_INTERVAL,
};
use support::{contract_form, deal, default_budget, Harness};

const TICK: Duration = Duration::from_millis(10);

async fn prepared_harness() -> Harness {
    let harness = Harness::new();
    harness
        .orchestrator
        .prepare_contract(&deal(), contract_form(), PrepareOptions::default(), &mut default_budget())
        .await
        .expect("contract prepared");
    harness
}

#[tokio::test]
async fn polling_finishes_once_provider_reports_completion() {
    let harness = prepared_harness().await;
    harness.envelopes.complete_after("E1", 3);
    let poller = StatusPoller::with_interval(harness.orchestrator.clone(), TICK);

    let handle = poller.watch(deal());
    assert_eq!(handle.deal(), &deal());
    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.outcome())
        .await
        .expect("poller finished in time");

    match outcome {
        PollOutcome::Finished(report) => {
            assert_eq!(report.round, SigningRound::Buyer);
            assert_eq!(report.stage, SigningStage::BuyerSigned);
            assert!(report.completed);
        }
        other => panic!("expected finished, got {other:?}"),
    }
    assert_eq!(harness.envelopes.counters().status, 3);

    tokio::time::sleep(TICK * 5).await;
    assert_eq!(harness.envelopes.counters().status, 3);
}

#[tokio::test]
async fn declined_envelope_ends_polling() {
    let harness = prepared_harness().await;
    harness.envelopes.set_status("E1", EnvelopeStatus::Declined);
    let poller = StatusPoller::with_interval(harness.orchestrator.clone(), TICK);

    let outcome = tokio::time::timeout(Duration::from_secs(2), poller.watch(deal()).outcome())
        .await
        .expect("poller finished in time");

    match outcome {
        PollOutcome::Finished(report) => {
            assert_eq!(report.stage, SigningStage::Failed(FailureReason::Declined));
            assert!(!report.completed);
        }
        other => panic!("expected finished, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_watcher_stops_checking() {
    let harness = prepared_harness().await;
    let poller = StatusPoller::with_interval(harness.orchestrator.clone(), TICK);

    let mut handle = poller.watch(deal());
    tokio::time::sleep(TICK * 4).await;
    handle.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.outcome())
        .await
        .expect("poller stopped in time");
    assert_eq!(outcome, PollOutcome::Cancelled);

    let checks = harness.envelopes.counters().status;
    tokio::time::sleep(TICK * 5).await;
    assert_eq!(harness.envelopes.counters().status, checks);
}

#[tokio::test]
async fn dropping_the_handle_cancels_the_watcher() {
    let harness = prepared_harness().await;
    let poller = StatusPoller::with_interval(harness.orchestrator.clone(), TICK);

    let handle = poller.watch(deal());
    tokio::time::sleep(TICK * 3).await;
    drop(handle);
    tokio::time::sleep(TICK * 2).await;

    let checks = harness.envelopes.counters().status;
    tokio::time::sleep(TICK * 5).await;
    assert_eq!(harness.envelopes.counters().status, checks);
}

#[tokio::test]
async fn first_check_waits_one_interval() {
    let harness = prepared_harness().await;
    let poller = StatusPoller::with_interval(harness.orchestrator.clone(), Duration::from_millis(200));

    let handle = poller.watch(deal());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.envelopes.counters().status, 0);
    assert!(!handle.is_finished());
}

#[tokio::test]
async fn missing_envelope_stops_polling_and_invalidates_session() {
    let harness = prepared_harness().await;
    harness.envelopes.remove_envelope("E1");
    let poller = StatusPoller::with_interval(harness.orchestrator.clone(), TICK);

    let outcome = tokio::time::timeout(Duration::from_secs(2), poller.watch(deal()).outcome())
        .await
        .expect("poller stopped in time");

    assert!(matches!(outcome, PollOutcome::Stopped { .. }));
    assert!(harness.sessions.is_empty());
}

#[tokio::test]
async fn polling_unknown_deal_stops_without_provider_calls() {
    let harness = Harness::new();
    let poller = StatusPoller::with_interval(harness.orchestrator.clone(), TICK);

    let outcome = tokio::time::timeout(Duration::from_secs(2), poller.watch(deal()).outcome())
        .await
        .expect("poller stopped in time");

    match outcome {
        PollOutcome::Stopped { error } => assert!(error.contains("40-mesa-ridge-rd-marfa-tx")),
        other => panic!("expected stopped, got {other:?}"),
    }
    assert_eq!(harness.network_calls(), 0);
}

#[tokio::test]
async fn zero_interval_is_raised_to_the_minimum() {
    let harness = prepared_harness().await;
    harness.envelopes.complete_after("E1", 2);
    let poller = StatusPoller::with_interval(harness.orchestrator.clone(), Duration::ZERO);
    assert_eq!(poller.interval(), MIN_POLL_INTERVAL);

    let outcome = tokio::time::timeout(Duration::from_secs(2), poller.watch(deal()).outcome())
        .await
        .expect("poller finished in time");
    assert!(matches!(outcome, PollOutcome::Finished(ref report) if report.completed));
    assert_eq!(harness.envelopes.counters().status, 2);
}

#[tokio::test]
async fn crashed_watcher_reports_stopped_not_cancelled() {
    let harness = prepared_harness().await;
    harness.envelopes.crash_on_status_check();
    let poller = StatusPoller::with_interval(harness.orchestrator.clone(), TICK);

    let outcome = tokio::time::timeout(Duration::from_secs(2), poller.watch(deal()).outcome())
        .await
        .expect("poller ended in time");
    match outcome {
        PollOutcome::Stopped { error } => {
            assert!(error.contains("panicked"), "unexpected error: {error}");
            assert!(error.contains("40-mesa-ridge-rd-marfa-tx"));
        }
        other => panic!("expected stopped, got {other:?}"),
    }
}
