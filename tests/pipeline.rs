//! End-to-end tests of the trace pipeline with in-memory sources.
//!
//! Coordinator, handlers, merge, both engines and the CSV exporter run for
//! real; only the kernel and the launched command are replaced.

mod common;

use std::fs;

use common::*;
use tmt::backend::scripted::{CounterMode, ScriptedSource};
use tmt::backend::EventSource;
use tmt::events::{EventKind, RawEvent, SchedReason};
use tmt::output::{LIVENESS_FILE, RANKING_FILE, SLICES_FILE};
use tmt::tracer_core::{export, trace};
use tmt::TraceError;

const CHILD: u32 = ROOT + 1;
const GRANDCHILD: u32 = ROOT + 2;
const ROOT_THREAD: u32 = ROOT + 3;
const STRANGER: u32 = ROOT + 100;

fn boxed(source: ScriptedSource) -> Box<dyn EventSource> {
    Box::new(source)
}

/// Task lifecycle in one source so the fork that makes a pid a member is
/// always handled before that pid's own events.
fn lifecycle() -> Vec<RawEvent> {
    vec![
        fork(5, ROOT, CHILD, "sh"),
        fork(7, STRANGER, STRANGER + 1, "cron"),
        fork(10, CHILD, GRANDCHILD, "sh"),
        exit(20, CHILD),
        exit(25, STRANGER),
        exit_group(400, ROOT),
    ]
}

fn scheduling() -> Vec<RawEvent> {
    vec![
        // delivered out of timestamp order
        desched(50, ROOT, 0, "sh", SchedReason::Preempted),
        run(10, ROOT, 0, "sh"),
        run(80, ROOT, 0, "sh"),
        desched(120, ROOT, 0, "sh", SchedReason::Slept),
        run(200, ROOT, 0, "sh"),
        run(250, STRANGER, 0, "cron"),
        run(300, ROOT_THREAD, 1, "sh").with_thread(ROOT_THREAD, ROOT),
    ]
}

#[test]
fn test_full_pipeline_writes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("sh -c 'sleep 1 & wait'", dir.path());
    let sources = vec![
        boxed(ScriptedSource::new("execve", vec![execve(0, ROOT, "sh")]).with_root_gate()),
        boxed(ScriptedSource::new("lifecycle", lifecycle()).with_batch(1).with_root_gate()),
        boxed(ScriptedSource::new("sched", scheduling()).with_batch(2).with_root_gate()),
    ];
    let mut launcher = StubLauncher::new(3);

    let report = trace(&config, sources, &mut launcher).unwrap();
    export(&report, &config).unwrap();

    assert_eq!(launcher.command.as_deref(), Some("sh -c 'sleep 1 & wait'"));
    assert_eq!(report.exit_code, 3);
    assert_eq!(report.shortfall(), 0);
    assert_eq!(report.tree.root().command, "sh");

    // Everything from the stranger was read but not admitted.
    assert!(report.log.events().iter().all(|e| e.pid != STRANGER));
    let lifecycle_report = &report.drain[1];
    assert_eq!(lifecycle_report.read, 6);
    assert_eq!(lifecycle_report.admitted, 4);

    let times: Vec<u64> = report.log.events().iter().map(|e| e.timestamp).collect();
    assert_eq!(times.first(), Some(&0));
    assert!(times.windows(2).all(|w| w[0] <= w[1]));

    let liveness = fs::read_to_string(dir.path().join(LIVENESS_FILE)).unwrap();
    assert_eq!(liveness, "time,alive\n0,1\n5,2\n10,3\n20,1\n400,0\n");

    let slices = fs::read_to_string(dir.path().join(SLICES_FILE)).unwrap();
    assert_eq!(
        slices,
        "pid,cpu,command,start_ns,end_ns,delta_ns,reason\n\
         4000000,0,sh,10,50,40,preempted\n\
         4000000,0,sh,80,120,40,slept\n\
         4000000,0,sh,200,300,100,end of trace\n\
         4000003,1,sh,300,300,0,end of trace\n"
    );

    let ranking = fs::read_to_string(dir.path().join(RANKING_FILE)).unwrap();
    assert_eq!(
        ranking,
        "cpu,rank,label,total_ms\n0,1,sh:4000000,0.00018\n1,1,sh:4000003,0\n"
    );
}

#[test]
fn test_drain_picks_up_backlog_after_exit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config("true", dir.path());
    // Long enough that the background thread barely gets a look in.
    config.poll_timeout = std::time::Duration::from_millis(50);

    let backlog: Vec<RawEvent> = (0..500)
        .map(|i| RawEvent::new(EventKind::ExecveEntry, BASE_NS + i, ROOT))
        .collect();
    let live: Vec<RawEvent> = (0..50)
        .map(|i| RawEvent::new(EventKind::ExecveExit, BASE_NS + 1000 + i, ROOT))
        .collect();
    let source = ScriptedSource::new("execve", backlog)
        .with_live_events(live)
        .with_batch(3)
        .with_root_gate();
    let stats = source.stats();

    let report = trace(&config, vec![boxed(source)], &mut StubLauncher::new(0)).unwrap();
    let drain = &report.drain[0];
    assert!(drain.expected >= 500);
    assert_eq!(drain.read, drain.expected);
    assert_eq!(drain.shortfall, 0);
    assert_eq!(report.log.len() as u64, drain.expected);
    assert!(stats.detached.load(std::sync::atomic::Ordering::Acquire));
}

#[test]
fn test_shortfall_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("true", dir.path());
    let events = vec![execve(0, ROOT, "true"), exit_group(10, ROOT)];
    let source = ScriptedSource::new("execve", events)
        .with_counter(CounterMode::Fixed(7))
        .with_missed(5)
        .with_root_gate();

    let report = trace(&config, vec![boxed(source)], &mut StubLauncher::new(0)).unwrap();
    assert_eq!(report.shortfall(), 5);
    assert_eq!(report.drain[0].read, 2);
    assert_eq!(report.drain[0].missed, Some(5));

    // Artifacts are still produced from the partial log.
    export(&report, &config).unwrap();
    let liveness = fs::read_to_string(dir.path().join(LIVENESS_FILE)).unwrap();
    assert_eq!(liveness, "time,alive\n0,1\n10,0\n");

    let mut summary = Vec::new();
    report.print_summary(&mut summary).unwrap();
    let summary = String::from_utf8(summary).unwrap();
    assert!(summary.contains("SHORT 5"));
    assert!(summary.contains("2 events over 10 ns"));
}

#[test]
fn test_always_on_source_is_still_drained() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("true", dir.path());
    let events = vec![
        run(0, ROOT, 0, "true"),
        desched(10, ROOT, 0, "true", SchedReason::Slept),
    ];
    let source = ScriptedSource::new("sched", events)
        .without_producer_control()
        .with_root_gate();

    let report = trace(&config, vec![boxed(source)], &mut StubLauncher::new(0)).unwrap();
    assert_eq!(report.shortfall(), 0);
    assert_eq!(report.slices.len(), 1);
    assert_eq!(report.slices[0].delta_ns, 10);
}

#[test]
fn test_missing_command_aborts_before_tracing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config("", dir.path());
    config.command = None;
    let source = ScriptedSource::new("execve", vec![execve(0, ROOT, "sh")]);
    let stats = source.stats();
    let mut launcher = StubLauncher::new(0);

    let err = trace(&config, vec![boxed(source)], &mut launcher).unwrap_err();
    assert_eq!(
        err.downcast_ref::<TraceError>(),
        Some(&TraceError::CommandNotSet)
    );
    assert!(launcher.command.is_none());
    assert!(!stats.installed.load(std::sync::atomic::Ordering::Acquire));
    assert!(!dir.path().join(LIVENESS_FILE).exists());
}

#[test]
fn test_events_json_dump() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config("true", dir.path());
    let json_path = dir.path().join("events.jsonl");
    config.events_json = Some(json_path.clone());
    let source = ScriptedSource::new(
        "lifecycle",
        vec![fork(0, ROOT, CHILD, "true"), exit(4, CHILD)],
    )
    .with_root_gate();

    let report = trace(&config, vec![boxed(source)], &mut StubLauncher::new(0)).unwrap();
    export(&report, &config).unwrap();

    let text = fs::read_to_string(&json_path).unwrap();
    let kinds: Vec<String> = text
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["kind"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds, vec!["fork", "exit"]);
}
