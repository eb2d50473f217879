//! Integration tests for the execution pipeline
//!
//! Executor, normalizer and comparator driven through the public API.

use gradebox::verdict::normalize::TIMEOUT_MARKER;
use gradebox::{
    ExecutionLimits, ExecutionOutcome, OutputIntegrity, OutputNormalizer, SandboxExecutor,
    Verdict, VerdictComparator,
};
use std::time::{Duration, Instant};

fn grade(source: &str, expected: Option<&str>) -> (String, Verdict) {
    let executor = SandboxExecutor::new(ExecutionLimits::default());
    let capture = executor.new_capture();
    let outcome = executor
        .execute(source, &capture, Duration::from_secs(5))
        .expect("host failure");
    let output = OutputNormalizer::normalize(&outcome, &capture.take_log());
    let verdict = VerdictComparator::compare(&output, expected);
    (output, verdict)
}

#[test]
fn test_emissions_joined_in_order() {
    let (output, verdict) = grade("emit('a'); emit('b')", None);
    assert_eq!(output, "a\nb");
    assert_eq!(verdict, Verdict::NotApplicable);
}

#[test]
fn test_throw_is_last_line() {
    let (output, _) = grade(
        "emit('one'); console.log('two'); throw new Error('boom')",
        None,
    );
    assert_eq!(output, "one\ntwo\nError: boom");
}

#[test]
fn test_correct_and_incorrect_answers() {
    assert_eq!(grade("emit('7')", Some("7")), ("7".to_string(), Verdict::Correct));
    assert_eq!(grade("emit('6')", Some("7")).1, Verdict::Incorrect);
    assert_eq!(grade("emit(3 + 4)", Some(" 7\n")).1, Verdict::Correct);
}

#[test]
fn test_terminal_value_is_graded() {
    let (output, verdict) = grade("const xs = [1, 2, 3]; xs.reduce((a, b) => a + b, 0)", Some("6"));
    assert_eq!(output, "6");
    assert_eq!(verdict, Verdict::Correct);
}

#[test]
fn test_syntax_error_becomes_output() {
    let (output, verdict) = grade("emit('x'", Some("x"));
    assert!(output.starts_with("Error: "));
    assert_eq!(verdict, Verdict::Incorrect);
}

#[test]
fn test_unbounded_loop_times_out_within_budget() {
    let executor = SandboxExecutor::new(ExecutionLimits::default());
    let capture = executor.new_capture();
    let started = Instant::now();
    let outcome = executor
        .execute("emit('start'); while (true) {}", &capture, Duration::from_millis(200))
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(3));

    let output = OutputNormalizer::normalize(&outcome, &capture.take_log());
    assert_eq!(output, format!("start\n{}", TIMEOUT_MARKER));
}

#[test]
fn test_timed_out_worker_cannot_emit_into_closed_capture() {
    let executor = SandboxExecutor::new(ExecutionLimits::default());
    let capture = executor.new_capture();
    let outcome = executor
        .execute(
            "let i = 0; while (true) { i++; if (i % 1000 === 0) emit(i) }",
            &capture,
            Duration::from_millis(200),
        )
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::TimedOut);

    let frozen = capture.take_log();
    std::thread::sleep(Duration::from_millis(100));
    // Nothing lands after the deadline.
    assert!(capture.take_log().lines.is_empty());
    assert!(!frozen.lines.is_empty());
}

#[test]
fn test_capture_limit_marks_truncation() {
    let executor = SandboxExecutor::new(ExecutionLimits {
        max_capture_lines: 3,
        ..ExecutionLimits::default()
    });
    let capture = executor.new_capture();
    let outcome = executor
        .execute("for (let i = 0; i < 10; i++) emit(i)", &capture, Duration::from_secs(5))
        .unwrap();

    let log = capture.take_log();
    assert_eq!(log.integrity, OutputIntegrity::TruncatedByCaptureLimit);
    assert_eq!(
        OutputNormalizer::normalize(&outcome, &log),
        "0\n1\n2\n[output truncated: capture limit reached]"
    );
}

#[test]
fn test_runs_are_isolated_from_each_other() {
    let (first, _) = grade("globalThis.counter = (globalThis.counter || 0) + 1; counter", None);
    let (second, _) = grade("globalThis.counter = (globalThis.counter || 0) + 1; counter", None);
    assert_eq!(first, "1");
    assert_eq!(second, "1");
}

#[test]
fn test_parallel_executions_keep_their_own_output() {
    let handles: Vec<_> = (0..4)
        .map(|n| {
            std::thread::spawn(move || {
                grade(&format!("for (let i = 0; i < 50; i++) emit({n})"), None).0
            })
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        let output = handle.join().unwrap();
        assert!(output.lines().all(|line| line == n.to_string()));
        assert_eq!(output.lines().count(), 50);
    }
}
