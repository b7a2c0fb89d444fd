//! End-to-end behavior of the adapter stack against the in-memory helper.
//!
//! Covers the session lifecycle, the command channel timing rules, the bus state machine
//! and restart-on-broken-pipe, all through the public API.

use osci_control::config::HP_83480A_IDENTIFICATION;
use osci_control::helper::MockHelper;
use osci_control::{AdapterError, BusState, GpibBus, HelperSession, Oscilloscope, SessionOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};
use tracing_test::traced_test;

fn options() -> SessionOptions {
    SessionOptions {
        settle_delay: Duration::from_millis(10),
        poll_interval: Duration::from_millis(2),
        quiet_period: Duration::from_millis(25),
        response_timeout: Duration::from_millis(300),
        shutdown_timeout: Duration::from_millis(500),
        ..SessionOptions::default()
    }
}

fn session(helper: &MockHelper) -> HelperSession {
    HelperSession::new(Arc::new(helper.clone()), options())
}

#[tokio::test]
async fn start_twice_spawns_one_helper() {
    let helper = MockHelper::new();
    let mut session = session(&helper);

    assert_ok!(session.start().await);
    assert_ok!(session.start().await);
    assert_eq!(helper.launch_count(), 1);

    session.stop().await;
    assert!(!session.is_running());
}

#[tokio::test]
async fn stop_without_helper_does_nothing() {
    let helper = MockHelper::new();
    let mut session = session(&helper);

    session.stop().await;
    session.stop().await;
    assert_eq!(helper.launch_count(), 0);
}

#[tokio::test]
async fn identification_round_trip_has_no_extra_whitespace() {
    let helper = MockHelper::new();
    let mut session = session(&helper);
    assert_ok!(session.start().await);

    let answer = assert_ok!(
        session
            .send_and_get_output(&["q *IDN?"], Duration::from_millis(300))
            .await
    );
    assert_eq!(answer, HP_83480A_IDENTIFICATION);
    session.stop().await;
}

#[tokio::test]
async fn get_output_returns_everything_written_within_deadline() {
    let helper = MockHelper::new();
    let mut session = session(&helper);
    assert_ok!(session.start().await);

    helper.push_unsolicited("  first extra  ");
    helper.push_unsolicited("second extra");
    let answer = assert_ok!(
        session
            .send_and_get_output(&["q :acquire:points?"], Duration::from_millis(300))
            .await
    );
    assert_eq!(answer, "100\n  first extra  \nsecond extra");
    session.stop().await;
}

#[tokio::test]
async fn nothing_written_is_a_timeout_at_the_deadline() {
    let helper = MockHelper::new();
    let mut session = session(&helper);
    assert_ok!(session.start().await);

    let timeout = Duration::from_millis(100);
    let started = Instant::now();
    let result = session.get_output(timeout).await;

    assert!(matches!(result, Err(AdapterError::Timeout(t)) if t == timeout));
    assert!(started.elapsed() >= timeout);
    session.stop().await;
}

#[tokio::test]
async fn connect_then_is_responsive() {
    let helper = MockHelper::new();
    let mut bus = GpibBus::new(session(&helper));
    assert_ok!(bus.start().await);

    assert_ok!(bus.connect(7).await);
    assert!(bus.is_connected());
    assert!(assert_ok!(bus.is_responsive().await));
    bus.shutdown().await;
}

#[tokio::test]
async fn out_of_range_addresses_never_reach_the_helper() {
    let helper = MockHelper::new();
    let mut bus = GpibBus::new(session(&helper));
    assert_ok!(bus.start().await);

    for address in [0u8, 32, 100, u8::MAX] {
        let err = assert_err!(bus.connect(address).await);
        assert!(matches!(err, AdapterError::InvalidAddress(a) if a == address));
        assert!(!err.triggers_restart());
    }
    assert!(helper.received_lines().is_empty());
    assert_eq!(helper.launch_count(), 1);
    bus.stop().await;
}

#[tokio::test]
async fn mode_transitions_are_idempotent() {
    let helper = MockHelper::new();
    let mut bus = GpibBus::new(session(&helper));
    assert_ok!(bus.start().await);
    assert_ok!(bus.connect(7).await);

    assert_ok!(bus.enter_command_mode().await);
    assert_ok!(bus.enter_command_mode().await);
    assert_eq!(bus.state(), BusState::CommandMode { address: 7 });
    assert_eq!(helper.count_received("CMD"), 1);

    assert_ok!(bus.disconnect().await);
    assert_ok!(bus.disconnect().await);
    assert_eq!(bus.state(), BusState::Disconnected);
    assert_eq!(helper.count_received("DISCONNECT"), 1);
    bus.stop().await;
}

#[tokio::test]
#[traced_test]
async fn broken_pipe_restarts_helper_and_reports_failure() {
    let helper = MockHelper::new();
    let mut bus = GpibBus::new(session(&helper));
    assert_ok!(bus.start().await);
    assert_ok!(bus.connect(7).await);

    assert!(helper.crash().await);
    let err = assert_err!(bus.send(&["s run"]).await);

    assert!(matches!(err, AdapterError::Io { .. }));
    assert!(err.to_string().contains("s run"));
    assert_eq!(helper.launch_count(), 2);
    assert_eq!(bus.state(), BusState::Disconnected);
    assert!(logs_contain("Write to helper failed"));

    // Recovery is for the next call
    assert_ok!(bus.connect(7).await);
    bus.shutdown().await;
}

#[tokio::test]
async fn slow_instrument_still_answers_within_deadline() {
    let helper = MockHelper::new().with_latency(Duration::from_millis(40));
    let mut bus = GpibBus::new(session(&helper));
    assert_ok!(bus.start().await);

    assert_ok!(bus.connect(12).await);
    assert_eq!(bus.address(), Some(12));
    bus.shutdown().await;
}

#[tokio::test]
async fn oscilloscope_session_from_start_to_shutdown() {
    let helper = MockHelper::new();
    let mut scope = Oscilloscope::new(GpibBus::new(session(&helper)), Duration::from_millis(300));

    assert_ok!(scope.start().await);
    assert_ok!(scope.initialize(7).await);
    assert_eq!(assert_ok!(scope.identify().await), HP_83480A_IDENTIFICATION);

    let captures = assert_ok!(scope.single(&[2]).await);
    assert_eq!(captures[0].channel, 2);
    assert!(!captures[0].data.is_empty());

    scope.shutdown().await;
    assert!(!scope.bus().is_running());
    assert_eq!(helper.count_received("exit"), 1);
}

#[tokio::test]
async fn launch_failure_is_reported_once() {
    let helper = MockHelper::new();
    helper.inject_launch_failure();
    let mut session = session(&helper);

    let err = assert_err!(session.start().await);
    assert!(matches!(err, AdapterError::Launch { .. }));
    assert!(!session.is_running());
    assert_eq!(helper.launch_count(), 0);
}
