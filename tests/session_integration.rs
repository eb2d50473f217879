//! Integration tests for run sessions
//!
//! Drives the session lifecycle the way an embedding UI does.

use gradebox::{
    GradeError, Lifecycle, LifecycleState, OutcomeKind, RunSession, SessionConfig, Verdict,
};
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn test_run_reports_through_callback() {
    let (tx, rx) = mpsc::channel();
    let session = RunSession::with_completion(
        SessionConfig::new("emit('a'); emit('b')").with_expected_output("a\nb"),
        move |output| {
            let _ = tx.send(output.to_string());
        },
    )
    .unwrap();

    session.run().unwrap();
    let output = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(output, "a\nb");

    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, LifecycleState::Settled);
    assert_eq!(snapshot.verdict, Verdict::Correct);
    assert_eq!(snapshot.output.as_deref(), Some("a\nb"));
}

#[test]
fn test_learner_fixes_answer_then_resets() {
    let session =
        RunSession::new(SessionConfig::new("emit('6')").with_expected_output("7")).unwrap();

    assert_eq!(session.run_and_wait().unwrap().verdict, Verdict::Incorrect);

    session.set_submission("emit('7')");
    let report = session.run_and_wait().unwrap();
    assert_eq!(report.output, "7");
    assert_eq!(report.verdict, Verdict::Correct);

    session.reset();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.submission, "emit('6')");
    assert_eq!(snapshot.verdict, Verdict::NotApplicable);
    assert_eq!(snapshot.state, LifecycleState::Idle);
}

#[test]
fn test_infinite_loop_settles_as_timeout() {
    let session = RunSession::new(
        SessionConfig::new("while (true) {}")
            .with_expected_output("anything")
            .with_timeout(Duration::from_millis(200)),
    )
    .unwrap();

    let report = session.run_and_wait().unwrap();
    assert_eq!(report.outcome, OutcomeKind::TimedOut);
    assert_eq!(report.output, "Error: execution exceeded its time budget");
    assert_eq!(report.verdict, Verdict::Incorrect);
    assert_ne!(session.state(), LifecycleState::Running);
}

#[test]
fn test_concurrent_run_rejected_first_still_settles() {
    let session = RunSession::new(
        SessionConfig::new("emit('slow'); while (true) {}")
            .with_timeout(Duration::from_millis(300)),
    )
    .unwrap();

    let ticket = session.run().unwrap();
    assert!(matches!(
        session.run(),
        Err(GradeError::ConcurrentRunRejected { .. })
    ));

    match session.wait_for_settle(Duration::from_secs(5)) {
        Lifecycle::Settled(report) => {
            assert_eq!(report.run_id, ticket.run_id);
            assert!(report.output.starts_with("slow\n"));
        }
        other => panic!("first run did not settle: {:?}", other),
    }

    // Once settled, a new run is accepted.
    session.set_submission("emit('fast')");
    assert_eq!(session.run_and_wait().unwrap().output, "fast");
}

#[test]
fn test_reset_mid_run_suppresses_callback() {
    let (tx, rx) = mpsc::channel::<String>();
    let session = RunSession::with_completion(
        SessionConfig::new("emit('x'); while (true) {}").with_timeout(Duration::from_millis(200)),
        move |output| {
            let _ = tx.send(output.to_string());
        },
    )
    .unwrap();

    session.run().unwrap();
    session.reset();
    assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());
    assert_eq!(session.snapshot().output, None);
}

#[test]
fn test_session_from_json_config() {
    let config = SessionConfig::from_json_str(
        r#"{
            "session_id": "widget-9",
            "initial_submission": "console.log('hi')",
            "expected_output": "hi",
            "timeout_ms": 1000
        }"#,
    )
    .unwrap();

    let session = RunSession::new(config).unwrap();
    assert_eq!(session.session_id(), "widget-9");
    assert_eq!(session.run_and_wait().unwrap().verdict, Verdict::Correct);
}

#[test]
fn test_dropping_session_mid_run_is_clean() {
    let session = RunSession::new(
        SessionConfig::new("while (true) {}").with_timeout(Duration::from_secs(5)),
    )
    .unwrap();
    session.run().unwrap();
    drop(session);
}
