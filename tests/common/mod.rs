//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use anyhow::Result;
use tmt::coordinator::Launcher;
use tmt::events::{EventKind, RawEvent, SchedReason};
use tmt::Config;

/// Pid handed out by [`StubLauncher`]. Far above anything the tracer itself
/// could have, so it never collides with the seeded membership.
pub const ROOT: u32 = 4_000_000;

/// Boot-relative base so rebasing is visible in the outputs.
pub const BASE_NS: u64 = 1_000_000_000;

/// Pretends to run a command: returns [`ROOT`] and a fixed exit code.
pub struct StubLauncher {
    pub exit_code: i32,
    pub command: Option<String>,
}

impl StubLauncher {
    pub fn new(exit_code: i32) -> Self {
        StubLauncher {
            exit_code,
            command: None,
        }
    }
}

impl Launcher for StubLauncher {
    fn spawn(&mut self, command: &str) -> Result<u32> {
        self.command = Some(command.to_string());
        Ok(ROOT)
    }

    fn run_to_exit(&mut self) -> Result<i32> {
        // Give the polling threads a moment with a live command.
        std::thread::sleep(Duration::from_millis(5));
        Ok(self.exit_code)
    }
}

/// Config with fast polling and a small drain budget.
pub fn test_config(command: &str, output_dir: &std::path::Path) -> Config {
    Config {
        command: Some(command.to_string()),
        poll_timeout: Duration::from_millis(1),
        drain_idle_polls: 50,
        drain_poll_interval: Duration::from_millis(1),
        output_dir: output_dir.to_path_buf(),
        ..Default::default()
    }
}

pub fn execve(ts: u64, pid: u32, command: &str) -> RawEvent {
    RawEvent::new(EventKind::ExecveExit, BASE_NS + ts, pid).with_command(command)
}

pub fn fork(ts: u64, parent: u32, child: u32, command: &str) -> RawEvent {
    RawEvent::new(EventKind::Fork, BASE_NS + ts, parent)
        .with_parent(parent)
        .with_child(child)
        .with_command(command)
}

pub fn exit(ts: u64, pid: u32) -> RawEvent {
    RawEvent::new(EventKind::Exit, BASE_NS + ts, pid)
}

pub fn exit_group(ts: u64, pid: u32) -> RawEvent {
    RawEvent::new(EventKind::ExitGroup, BASE_NS + ts, pid).with_parent(pid)
}

pub fn run(ts: u64, pid: u32, cpu: u32, command: &str) -> RawEvent {
    RawEvent::new(EventKind::Run, BASE_NS + ts, pid)
        .on_cpu(cpu)
        .with_command(command)
}

pub fn desched(ts: u64, pid: u32, cpu: u32, command: &str, reason: SchedReason) -> RawEvent {
    RawEvent::new(EventKind::Desched, BASE_NS + ts, pid)
        .on_cpu(cpu)
        .with_command(command)
        .with_reason(reason)
}
