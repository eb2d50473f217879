// Host-level checks that a stopped run leaves nothing behind.
//
// Kept as a single test in its own binary so thread and child-process counts
// are not disturbed by other tests running in parallel.

use gradebox::{OutcomeKind, RunSession, SessionConfig};
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

const ALLOCATE_FOREVER: &str = "const a = []; while (true) a.push('x'.repeat(4096) + a.length)";

/// Live or zombie processes whose parent is this test process
fn child_processes() -> Vec<u32> {
    let me = std::process::id();
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok()?.parse::<u32>().ok())
        .filter(|pid| {
            fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| {
                    // Fields after the parenthesised command name: state, ppid, ...
                    let rest = &stat[stat.rfind(')')? + 1..];
                    rest.split_whitespace().nth(1)?.parse::<u32>().ok()
                })
                == Some(me)
        })
        .collect()
}

fn thread_count() -> usize {
    fs::read_dir("/proc/self/task")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

fn resident_kb() -> u64 {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("VmRSS:"))
                .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
        })
        .unwrap_or(0)
}

/// Wait until every worker is reaped and helper threads are gone
fn assert_back_to_baseline(step: &str, baseline_threads: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let children = child_processes();
        let threads = thread_count();
        if children.is_empty() && threads <= baseline_threads {
            return;
        }
        if Instant::now() >= deadline {
            panic!(
                "{step}: {} worker process(es) {:?} and {} threads (baseline {})",
                children.len(),
                children,
                threads,
                baseline_threads
            );
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn looping_session(timeout: Duration) -> RunSession {
    RunSession::new(SessionConfig::new("while (true) {}").with_timeout(timeout)).unwrap()
}

#[test]
fn test_stopped_runs_leave_no_workers_threads_or_memory_behind() {
    let baseline_threads = thread_count();
    assert!(child_processes().is_empty());

    // Repeated timeouts on one session do not accumulate workers.
    let session = looping_session(Duration::from_millis(200));
    for _ in 0..4 {
        let report = session.run_and_wait().unwrap();
        assert_eq!(report.outcome, OutcomeKind::TimedOut);
    }
    assert_back_to_baseline("after timeouts", baseline_threads);

    // Cancel kills the worker.
    let session = looping_session(Duration::from_secs(30));
    session.run().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(session.cancel());
    assert_back_to_baseline("after cancel", baseline_threads);

    // So does reset.
    session.run().unwrap();
    thread::sleep(Duration::from_millis(100));
    session.reset();
    assert_back_to_baseline("after reset", baseline_threads);

    // And dropping the session mid-run.
    session.run().unwrap();
    thread::sleep(Duration::from_millis(100));
    drop(session);
    assert_back_to_baseline("after drop", baseline_threads);

    // A submission that allocates without bound is confined to its worker.
    let resident_before = resident_kb();
    let hog = RunSession::new(SessionConfig::new(ALLOCATE_FOREVER)).unwrap();
    let report = hog.run_and_wait().unwrap();
    assert!(
        matches!(report.outcome, OutcomeKind::Threw | OutcomeKind::TimedOut),
        "got {:?}",
        report.outcome
    );
    assert!(report.output.starts_with("Error: "));
    assert_back_to_baseline("after allocation loop", baseline_threads);

    thread::sleep(Duration::from_secs(1));
    let growth_kb = resident_kb().saturating_sub(resident_before);
    assert!(growth_kb < 64 * 1024, "host grew by {growth_kb} kB");

    // The host is still healthy enough to grade.
    let session = RunSession::new(SessionConfig::new("emit('still here')")).unwrap();
    assert_eq!(session.run_and_wait().unwrap().output, "still here");
    drop(hog);
    assert_back_to_baseline("at end", baseline_threads);
}
