//! Kernel event records as seen by user space.
//!
//! Every backend decodes its raw ring buffer records into [`RawEvent`]. A
//! `RawEvent` is produced once per kernel occurrence and never mutated after
//! that, except for the timestamp rebase done by [`crate::merge`].

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Fork,
    Clone,
    Clone3,
    ExecveEntry,
    ExecveExit,
    Exit,
    ExitGroup,
    Run,
    Desched,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Fork => "fork",
            EventKind::Clone => "clone",
            EventKind::Clone3 => "clone3",
            EventKind::ExecveEntry => "execve-entry",
            EventKind::ExecveExit => "execve-exit",
            EventKind::Exit => "exit",
            EventKind::ExitGroup => "exit-group",
            EventKind::Run => "run",
            EventKind::Desched => "desched",
        }
    }

    /// fork, clone and clone3 all create a new task.
    pub fn is_fork_family(&self) -> bool {
        matches!(self, EventKind::Fork | EventKind::Clone | EventKind::Clone3)
    }

    pub fn is_sched(&self) -> bool {
        matches!(self, EventKind::Run | EventKind::Desched)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task left the CPU. Only meaningful for [`EventKind::Desched`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedReason {
    /// Still runnable when switched out.
    Preempted,
    /// Blocked (`prev_state != TASK_RUNNING`).
    Slept,
    #[default]
    None,
}

impl SchedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedReason::Preempted => "preempted",
            SchedReason::Slept => "slept",
            SchedReason::None => "none",
        }
    }
}

impl fmt::Display for SchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single kernel-observed occurrence.
///
/// `timestamp` is `CLOCK_MONOTONIC` nanoseconds when it leaves the backend and
/// trace-relative nanoseconds once the log has been merged. `child_pid` is 0
/// unless the event created a task. `cpu` and `reason` are only set for
/// scheduler events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawEvent {
    pub kind: EventKind,
    pub timestamp: u64,
    pub pid: u32,
    pub tid: u32,
    pub tgid: u32,
    pub parent_pid: u32,
    pub child_pid: u32,
    pub pgid: u32,
    pub command: String,
    pub cpu: u32,
    pub reason: SchedReason,
}

impl RawEvent {
    /// An event for a single-threaded task: tid and tgid both equal `pid`.
    pub fn new(kind: EventKind, timestamp: u64, pid: u32) -> Self {
        RawEvent {
            kind,
            timestamp,
            pid,
            tid: pid,
            tgid: pid,
            parent_pid: 0,
            child_pid: 0,
            pgid: pid,
            command: String::new(),
            cpu: 0,
            reason: SchedReason::None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_child(mut self, child_pid: u32) -> Self {
        self.child_pid = child_pid;
        self
    }

    pub fn with_parent(mut self, parent_pid: u32) -> Self {
        self.parent_pid = parent_pid;
        self
    }

    pub fn with_thread(mut self, tid: u32, tgid: u32) -> Self {
        self.tid = tid;
        self.tgid = tgid;
        self
    }

    pub fn on_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_reason(mut self, reason: SchedReason) -> Self {
        self.reason = reason;
        self
    }
}

impl fmt::Display for RawEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} pid={} tid={} tgid={} child={} comm={}",
            self.timestamp, self.kind, self.pid, self.tid, self.tgid, self.child_pid, self.command
        )?;
        if self.kind.is_sched() {
            write!(f, " cpu={} reason={}", self.cpu, self.reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_family() {
        assert!(EventKind::Fork.is_fork_family());
        assert!(EventKind::Clone.is_fork_family());
        assert!(EventKind::Clone3.is_fork_family());
        assert!(!EventKind::ExecveEntry.is_fork_family());
        assert!(!EventKind::Run.is_fork_family());
    }

    #[test]
    fn test_display_sched_event() {
        let event = RawEvent::new(EventKind::Desched, 42, 7)
            .with_command("worker")
            .on_cpu(3)
            .with_reason(SchedReason::Slept);
        assert_eq!(
            event.to_string(),
            "42 desched pid=7 tid=7 tgid=7 child=0 comm=worker cpu=3 reason=slept"
        );
    }

    #[test]
    fn test_serialize_kind_names() {
        let event = RawEvent::new(EventKind::ExitGroup, 1, 1);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "exit-group");
        assert_eq!(json["reason"], "none");
    }
}
